//! Upcall trampoline allocator
//!
//! Native code calls managed closures through trampolines: small fixed-size
//! code slots that load the isolate and the closure into the reserved
//! registers and jump to an upcall stub. Slots are carved out of
//! page-sized pools (`TrampolineSet`). Each pool tracks how many slots it has
//! handed out and how many came back; the page is unmapped when the two
//! counts meet.
//!
//! Allocation and release go through one lock. Patching a slot to a
//! specialized stub only needs the address → pool index, which is a
//! concurrent map, so it never takes the allocator lock.

pub mod set;

use std::panic::Location;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use rustc_hash::FxHashSet;

use crate::abi::Abi;
use crate::descriptor::ManagedEntryPoint;
use crate::error::{programming_error, ForeignError, ForeignResult};
use crate::memory::{CodeMemory, OsCodeMemory};
use crate::registry::{BindingId, StubRegistry};

pub use set::{ClosureCell, TrampolineAddress, TrampolineSet, UpcallClosure};

/// Callback fired after a trampoline is redirected to a specialized stub
pub type SpecializationListener = Arc<dyn Fn(BindingId) + Send + Sync>;

#[derive(Default)]
struct AllocatorState {
    current: Option<Arc<TrampolineSet>>,
    pools_created: usize,
}

/// Allocates, patches and frees upcall trampolines
pub struct TrampolineAllocator<M: CodeMemory = OsCodeMemory> {
    abi: Abi,
    isolate: usize,
    memory: M,
    registry: Arc<StubRegistry>,
    state: Mutex<AllocatorState>,
    pools: DashMap<usize, Arc<TrampolineSet>>,
    listener: Option<SpecializationListener>,
    warn_missing: bool,
    /// Descriptors already reported as missing an upcall stub
    warned: Mutex<FxHashSet<ManagedEntryPoint>>,
}

impl TrampolineAllocator<OsCodeMemory> {
    /// Allocator backed by OS pages
    pub fn new(abi: Abi, isolate: usize, registry: Arc<StubRegistry>) -> Self {
        Self::with_memory(abi, isolate, registry, OsCodeMemory::new())
    }
}

impl<M: CodeMemory> TrampolineAllocator<M> {
    pub fn with_memory(abi: Abi, isolate: usize, registry: Arc<StubRegistry>, memory: M) -> Self {
        Self {
            abi,
            isolate,
            memory,
            registry,
            state: Mutex::new(AllocatorState::default()),
            pools: DashMap::new(),
            listener: None,
            warn_missing: true,
            warned: Mutex::new(FxHashSet::default()),
        }
    }

    /// Whether a missing upcall stub is logged (once per descriptor)
    pub fn with_missing_registration_warnings(mut self, enabled: bool) -> Self {
        self.warn_missing = enabled;
        self
    }

    /// Install the callback fired after each successful specialization
    pub fn with_specialization_listener(mut self, listener: SpecializationListener) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn abi(&self) -> Abi {
        self.abi
    }

    pub fn memory(&self) -> &M {
        &self.memory
    }

    pub fn registry(&self) -> &StubRegistry {
        &self.registry
    }

    /// Slots per pool
    pub fn slots_per_pool(&self) -> usize {
        self.memory.page_size() / self.abi.trampoline_size()
    }

    /// Number of live pools
    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    /// Total pools mapped since creation
    pub fn pools_created(&self) -> usize {
        self.state.lock().pools_created
    }

    /// Descriptors reported as missing an upcall stub so far
    pub fn missing_registrations_reported(&self) -> usize {
        self.warned.lock().len()
    }

    /// Pool whose page contains `address`
    pub fn owner_of(&self, address: TrampolineAddress) -> Option<Arc<TrampolineSet>> {
        let page_size = self.memory.page_size();
        let base = address.as_usize() - address.as_usize() % page_size;
        self.pools.get(&base).map(|entry| entry.value().clone())
    }

    /// Bind a trampoline slot to `closure` through the generic upcall stub
    #[track_caller]
    pub fn register_for_upcall(
        &self,
        closure: UpcallClosure,
        descriptor: &ManagedEntryPoint,
    ) -> ForeignResult<TrampolineAddress> {
        let Some(stub) = self.registry.upcall(descriptor) else {
            let call_site = Location::caller().to_string();
            if self.warn_missing && self.warned.lock().insert(descriptor.clone()) {
                tracing::warn!(
                    target: "raya_foreign::trampoline",
                    signature = %descriptor.signature(),
                    %call_site,
                    "no upcall stub registered for this signature; register it at build time"
                );
            }
            return Err(ForeignError::MissingRegistration {
                kind: "upcall",
                signature: descriptor.signature().to_string(),
                call_site,
            });
        };

        let mut state = self.state.lock();
        let pool = match &state.current {
            Some(pool) if pool.has_free_capacity() => pool.clone(),
            _ => {
                let pool = Arc::new(TrampolineSet::new(&self.memory, self.abi, self.isolate)?);
                self.pools.insert(pool.base(), pool.clone());
                state.current = Some(pool.clone());
                state.pools_created += 1;
                pool
            }
        };
        let address = pool.assign(closure, stub);
        drop(state);

        tracing::trace!(
            target: "raya_foreign::trampoline",
            %address,
            %stub,
            signature = %descriptor.signature(),
            "upcall trampoline assigned"
        );
        Ok(address)
    }

    /// Redirect a trampoline to the stub specialized for `binding`.
    ///
    /// Returns false if no such stub was registered. Patching the same
    /// trampoline twice is fatal.
    pub fn patch_for_direct_upcall(
        &self,
        address: TrampolineAddress,
        binding: BindingId,
        descriptor: &ManagedEntryPoint,
    ) -> bool {
        let Some(stub) = self.registry.direct_upcall(binding, descriptor) else {
            tracing::trace!(target: "raya_foreign::trampoline", %address, %binding, "no direct upcall stub");
            return false;
        };
        let Some(pool) = self.owner_of(address) else {
            programming_error(format!("patch of unknown trampoline {}", address));
        };
        pool.patch(address, stub);
        tracing::debug!(target: "raya_foreign::trampoline", %address, %binding, %stub, "trampoline specialized");

        if let Some(listener) = &self.listener {
            listener(binding);
        }
        true
    }

    /// Return a trampoline. Unmaps its page once every slot handed out from
    /// it has come back.
    pub fn release(&self, address: TrampolineAddress) {
        let page_size = self.memory.page_size();
        let base = address.as_usize() - address.as_usize() % page_size;

        let emptied = {
            let mut state = self.state.lock();
            let Some(pool) = self.pools.get(&base).map(|entry| entry.value().clone()) else {
                drop(state);
                programming_error(format!("release of unknown trampoline {}", address));
            };
            if pool.release_slot(address) {
                pool.mark_released();
                self.pools.remove(&base);
                if state.current.as_ref().is_some_and(|current| Arc::ptr_eq(current, &pool)) {
                    state.current = None;
                }
                Some(pool)
            } else {
                None
            }
        };

        if let Some(pool) = emptied {
            self.unmap(&pool);
        }
    }

    fn unmap(&self, pool: &TrampolineSet) {
        match self.memory.free(pool.page()) {
            Ok(()) => tracing::debug!(
                target: "raya_foreign::trampoline",
                base = format_args!("0x{:x}", pool.base()),
                "trampoline page freed"
            ),
            Err(err) => tracing::error!(
                target: "raya_foreign::trampoline",
                base = format_args!("0x{:x}", pool.base()),
                error = %err,
                "failed to free trampoline page"
            ),
        }
    }
}

impl<M: CodeMemory> Drop for TrampolineAllocator<M> {
    fn drop(&mut self) {
        let live: Vec<Arc<TrampolineSet>> = self.pools.iter().map(|entry| entry.value().clone()).collect();
        self.pools.clear();
        for pool in live {
            pool.mark_released();
            self.unmap(&pool);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{FunctionType, ValueLayout};
    use crate::memory::testing::CountingMemory;
    use crate::registry::{StubAddress, StubRegistryBuilder};
    use std::ffi::c_void;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const GENERIC: StubAddress = StubAddress::new(0x1000);
    const DIRECT: StubAddress = StubAddress::new(0x2000);

    fn descriptor() -> ManagedEntryPoint {
        ManagedEntryPoint::make(
            Abi::SysV,
            &FunctionType::new(vec![ValueLayout::I64, ValueLayout::I64], Some(ValueLayout::I64)),
        )
    }

    fn allocator() -> TrampolineAllocator<CountingMemory> {
        let mut builder = StubRegistryBuilder::new();
        builder.register_upcall(descriptor(), GENERIC);
        builder.register_direct_upcall(BindingId(7), descriptor(), DIRECT);
        TrampolineAllocator::with_memory(Abi::SysV, 0x1234, Arc::new(builder.build()), CountingMemory::default())
    }

    fn closure(n: usize) -> UpcallClosure {
        UpcallClosure::new(n as *const c_void, std::ptr::null_mut())
    }

    #[test]
    fn test_missing_upcall_stub_allocates_nothing() {
        let allocator = TrampolineAllocator::with_memory(
            Abi::SysV,
            0,
            Arc::new(StubRegistry::empty()),
            CountingMemory::default(),
        );
        let err = allocator.register_for_upcall(closure(1), &descriptor()).unwrap_err();
        match err {
            ForeignError::MissingRegistration { kind, call_site, .. } => {
                assert_eq!(kind, "upcall");
                assert!(call_site.contains("mod.rs"));
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(allocator.memory().allocated.load(Ordering::SeqCst), 0);
        assert_eq!(allocator.pool_count(), 0);
    }

    #[test]
    fn test_missing_upcall_reported_every_time_warned_once() {
        let allocator = TrampolineAllocator::with_memory(
            Abi::SysV,
            0,
            Arc::new(StubRegistry::empty()),
            CountingMemory::default(),
        );
        for _ in 0..3 {
            let err = allocator.register_for_upcall(closure(1), &descriptor()).unwrap_err();
            assert!(matches!(err, ForeignError::MissingRegistration { kind: "upcall", .. }));
        }
        assert_eq!(allocator.missing_registrations_reported(), 1);

        let other = ManagedEntryPoint::make(Abi::SysV, &FunctionType::new(vec![ValueLayout::F64], None));
        assert!(allocator.register_for_upcall(closure(1), &other).is_err());
        assert_eq!(allocator.missing_registrations_reported(), 2);
    }

    #[test]
    fn test_missing_upcall_warnings_can_be_disabled() {
        let allocator = TrampolineAllocator::with_memory(
            Abi::SysV,
            0,
            Arc::new(StubRegistry::empty()),
            CountingMemory::default(),
        )
        .with_missing_registration_warnings(false);
        assert!(allocator.register_for_upcall(closure(1), &descriptor()).is_err());
        assert_eq!(allocator.missing_registrations_reported(), 0);
    }

    #[test]
    fn test_pool_exhaustion_maps_new_page() {
        let allocator = allocator();
        let per_pool = allocator.slots_per_pool();
        assert_eq!(per_pool, 128);

        let addresses: Vec<_> = (0..per_pool)
            .map(|i| allocator.register_for_upcall(closure(i), &descriptor()).unwrap())
            .collect();
        assert_eq!(allocator.pool_count(), 1);
        let first = allocator.owner_of(addresses[0]).unwrap();
        assert!(!first.has_free_capacity());

        let next = allocator.register_for_upcall(closure(999), &descriptor()).unwrap();
        assert_eq!(allocator.pool_count(), 2);
        let second = allocator.owner_of(next).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(second.assigned(), 1);
    }

    #[test]
    fn test_owner_of_every_slot() {
        let allocator = allocator();
        let addresses: Vec<_> = (0..allocator.slots_per_pool())
            .map(|i| allocator.register_for_upcall(closure(i), &descriptor()).unwrap())
            .collect();
        let pool = allocator.owner_of(addresses[0]).unwrap();
        for address in &addresses {
            let owner = allocator.owner_of(*address).unwrap();
            assert!(Arc::ptr_eq(&owner, &pool));
            assert_eq!(owner.stub_of(*address), GENERIC);
        }
        assert_eq!(pool.closure_of(addresses[5]), closure(5));
    }

    #[test]
    fn test_patch_redirects_one_slot() {
        let fired = Arc::new(AtomicUsize::new(0));
        let seen = fired.clone();
        let allocator = allocator().with_specialization_listener(Arc::new(move |binding| {
            assert_eq!(binding, BindingId(7));
            seen.fetch_add(1, Ordering::SeqCst);
        }));

        let a = allocator.register_for_upcall(closure(1), &descriptor()).unwrap();
        let b = allocator.register_for_upcall(closure(2), &descriptor()).unwrap();
        assert!(allocator.patch_for_direct_upcall(a, BindingId(7), &descriptor()));

        let pool = allocator.owner_of(a).unwrap();
        assert_eq!(pool.stub_of(a), DIRECT);
        assert_eq!(pool.stub_of(b), GENERIC);
        assert!(pool.is_patched(a));
        assert!(!pool.is_patched(b));
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // the neighbouring slot in the same pool patches on its own
        assert!(allocator.patch_for_direct_upcall(b, BindingId(7), &descriptor()));
        assert!(Arc::ptr_eq(&allocator.owner_of(b).unwrap(), &pool));
        assert_eq!(pool.stub_of(a), DIRECT);
        assert_eq!(pool.stub_of(b), DIRECT);
        assert!(pool.is_patched(b));
        assert_eq!(pool.closure_of(a), closure(1));
        assert_eq!(pool.closure_of(b), closure(2));
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_patch_without_direct_stub_is_noop() {
        let allocator = allocator();
        let a = allocator.register_for_upcall(closure(1), &descriptor()).unwrap();
        assert!(!allocator.patch_for_direct_upcall(a, BindingId(8), &descriptor()));
        assert_eq!(allocator.owner_of(a).unwrap().stub_of(a), GENERIC);
    }

    #[test]
    #[should_panic(expected = "patched twice")]
    fn test_double_patch_is_fatal() {
        let allocator = allocator();
        let a = allocator.register_for_upcall(closure(1), &descriptor()).unwrap();
        allocator.patch_for_direct_upcall(a, BindingId(7), &descriptor());
        allocator.patch_for_direct_upcall(a, BindingId(7), &descriptor());
    }

    #[test]
    fn test_page_freed_once_all_slots_return() {
        let allocator = allocator();
        let a = allocator.register_for_upcall(closure(1), &descriptor()).unwrap();
        let b = allocator.register_for_upcall(closure(2), &descriptor()).unwrap();
        let c = allocator.register_for_upcall(closure(3), &descriptor()).unwrap();

        allocator.release(b);
        allocator.release(a);
        assert_eq!(allocator.memory().freed.load(Ordering::SeqCst), 0);
        allocator.release(c);
        assert_eq!(allocator.memory().freed.load(Ordering::SeqCst), 1);
        assert_eq!(allocator.pool_count(), 0);
        assert!(allocator.owner_of(a).is_none());

        // the next registration maps a fresh page
        allocator.register_for_upcall(closure(4), &descriptor()).unwrap();
        assert_eq!(allocator.memory().allocated.load(Ordering::SeqCst), 2);
        assert_eq!(allocator.pools_created(), 2);
    }

    #[test]
    fn test_full_pool_released_while_newer_pool_is_current() {
        let allocator = allocator();
        let first: Vec<_> = (0..allocator.slots_per_pool())
            .map(|i| allocator.register_for_upcall(closure(i), &descriptor()).unwrap())
            .collect();
        let later = allocator.register_for_upcall(closure(0), &descriptor()).unwrap();
        for address in first {
            allocator.release(address);
        }
        assert_eq!(allocator.memory().freed.load(Ordering::SeqCst), 1);
        assert_eq!(allocator.pool_count(), 1);
        assert!(allocator.owner_of(later).is_some());
    }

    #[test]
    #[should_panic(expected = "release of unknown trampoline")]
    fn test_release_unknown_address_is_fatal() {
        let allocator = allocator();
        allocator.release(TrampolineAddress::new(0x10));
    }

    #[test]
    #[should_panic(expected = "released twice")]
    fn test_double_release_is_fatal() {
        let allocator = allocator();
        let a = allocator.register_for_upcall(closure(1), &descriptor()).unwrap();
        let _b = allocator.register_for_upcall(closure(2), &descriptor()).unwrap();
        allocator.release(a);
        allocator.release(a);
    }

    #[test]
    fn test_drop_frees_live_pages() {
        let memory = Arc::new(CountingMemory::default());
        let mut builder = StubRegistryBuilder::new();
        builder.register_upcall(descriptor(), GENERIC);
        let allocator = TrampolineAllocator::with_memory(Abi::SysV, 0, Arc::new(builder.build()), memory.clone());
        allocator.register_for_upcall(closure(1), &descriptor()).unwrap();
        assert_eq!(memory.live.lock().len(), 1);
        drop(allocator);
        assert!(memory.live.lock().is_empty());
        assert_eq!(memory.freed.load(Ordering::SeqCst), 1);
    }
}
