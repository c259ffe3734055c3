//! One page of upcall trampolines
//!
//! # Memory Layout
//!
//! ```text
//! page (page_size bytes, page aligned, read+execute)
//! ┌──────────────────────────────────────────────────────────┐
//! │ slot 0: mov r10, isolate; mov r11, &closures[0];         │
//! │         mov rax, &stubs[0]; jmp [rax]                    │
//! │ slot 1: ... &closures[1] ... &stubs[1] ...               │
//! │ ...                                                      │
//! └──────────────────────────────────────────────────────────┘
//! closures: [ClosureCell; N]   (boxed, fixed address)
//! stubs:    [AtomicUsize; N]   (boxed, fixed address, patchable)
//! ```
//!
//! All slots are written once when the set is created. Afterwards only the
//! cells change: a closure cell when its slot is assigned, a stub cell when
//! it is assigned and at most once more when patched.

use std::ffi::c_void;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::abi::Abi;
use crate::error::{invariant_violation, programming_error, ForeignResult};
use crate::memory::CodeMemory;
use crate::registry::StubAddress;

/// Sentinel stored in `assigned` once the page has been released
const RELEASED: usize = usize::MAX;

/// A managed closure as seen by an upcall stub: a function and its data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpcallClosure {
    pub function: *const c_void,
    pub data: *mut c_void,
}

impl UpcallClosure {
    pub fn new(function: *const c_void, data: *mut c_void) -> Self {
        Self { function, data }
    }
}

/// Closure cell read by upcall stubs through the trampoline's closure register
#[repr(C)]
#[derive(Debug, Default)]
pub struct ClosureCell {
    pub function: AtomicUsize,
    pub data: AtomicUsize,
}

/// Address of one trampoline slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrampolineAddress(usize);

impl TrampolineAddress {
    pub const fn new(address: usize) -> Self {
        Self(address)
    }

    pub fn as_usize(self) -> usize {
        self.0
    }

    pub fn as_ptr(self) -> *const u8 {
        self.0 as *const u8
    }
}

impl fmt::Display for TrampolineAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

/// A pool of trampolines backed by one executable page
pub struct TrampolineSet {
    base: usize,
    page_size: usize,
    slot_size: usize,
    capacity: usize,
    closures: Box<[ClosureCell]>,
    stubs: Box<[AtomicUsize]>,
    patched: Box<[AtomicBool]>,
    slot_released: Box<[AtomicBool]>,
    /// Slots handed out, or `RELEASED`. Written under the allocator lock.
    assigned: AtomicUsize,
    /// Slots returned. Written under the allocator lock.
    freed: AtomicUsize,
}

impl fmt::Debug for TrampolineSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrampolineSet")
            .field("base", &format_args!("0x{:x}", self.base))
            .field("capacity", &self.capacity)
            .field("assigned", &self.assigned.load(Ordering::Relaxed))
            .field("freed", &self.freed.load(Ordering::Relaxed))
            .finish()
    }
}

impl TrampolineSet {
    /// Map a page and write every slot's template into it
    pub fn new(memory: &dyn CodeMemory, abi: Abi, isolate: usize) -> ForeignResult<Self> {
        let page_size = memory.page_size();
        let slot_size = abi.trampoline_size();
        let capacity = page_size / slot_size;
        if capacity == 0 {
            invariant_violation(format!("page of {} bytes cannot hold a {}-byte trampoline", page_size, slot_size));
        }

        let page = memory.allocate()?;
        let base = page as usize;
        if base % page_size != 0 {
            free_or_log(memory, page);
            invariant_violation(format!("code page 0x{:x} is not {}-byte aligned", base, page_size));
        }

        let set = Self {
            base,
            page_size,
            slot_size,
            capacity,
            closures: (0..capacity).map(|_| ClosureCell::default()).collect(),
            stubs: (0..capacity).map(|_| AtomicUsize::new(0)).collect(),
            patched: (0..capacity).map(|_| AtomicBool::new(false)).collect(),
            slot_released: (0..capacity).map(|_| AtomicBool::new(false)).collect(),
            assigned: AtomicUsize::new(0),
            freed: AtomicUsize::new(0),
        };

        // Safety: `page` is a fresh writable mapping of `page_size` bytes
        let code = unsafe { std::slice::from_raw_parts_mut(page, page_size) };
        for (i, slot) in code.chunks_exact_mut(slot_size).enumerate() {
            let closure_cell = &set.closures[i] as *const ClosureCell as u64;
            let stub_cell = &set.stubs[i] as *const AtomicUsize as u64;
            abi.emit_trampoline(slot, isolate as u64, closure_cell, stub_cell);
        }

        if let Err(err) = memory.make_executable(page) {
            free_or_log(memory, page);
            return Err(err);
        }
        memory.flush_icache(page, page_size);

        tracing::debug!(
            target: "raya_foreign::trampoline",
            base = format_args!("0x{:x}", base),
            capacity,
            "mapped trampoline page"
        );
        Ok(set)
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn page(&self) -> *mut u8 {
        self.base as *mut u8
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn assigned(&self) -> usize {
        self.assigned.load(Ordering::Acquire)
    }

    pub fn freed(&self) -> usize {
        self.freed.load(Ordering::Acquire)
    }

    pub fn is_released(&self) -> bool {
        self.assigned() == RELEASED
    }

    pub fn has_free_capacity(&self) -> bool {
        let assigned = self.assigned();
        assigned != RELEASED && assigned < self.capacity
    }

    /// Whether `address` lies inside this page
    pub fn contains(&self, address: TrampolineAddress) -> bool {
        let addr = address.as_usize();
        addr >= self.base && addr < self.base + self.page_size
    }

    /// Slot index of an address anywhere inside an assigned slot
    pub fn slot_of(&self, address: TrampolineAddress) -> usize {
        if !self.contains(address) {
            programming_error(format!("{} is not inside trampoline page 0x{:x}", address, self.base));
        }
        let index = (address.as_usize() - self.base) / self.slot_size;
        let assigned = self.assigned();
        if assigned == RELEASED || index >= assigned {
            programming_error(format!("{} is not an assigned trampoline", address));
        }
        index
    }

    pub fn slot_address(&self, index: usize) -> TrampolineAddress {
        TrampolineAddress::new(self.base + index * self.slot_size)
    }

    /// Bind the next free slot. Caller holds the allocator lock and has
    /// checked `has_free_capacity`.
    pub(crate) fn assign(&self, closure: UpcallClosure, stub: StubAddress) -> TrampolineAddress {
        let index = self.assigned();
        if index == RELEASED || index >= self.capacity {
            invariant_violation(format!("assign on a full or released trampoline page 0x{:x}", self.base));
        }
        let cell = &self.closures[index];
        cell.function.store(closure.function as usize, Ordering::Relaxed);
        cell.data.store(closure.data as usize, Ordering::Relaxed);
        self.stubs[index].store(stub.as_usize(), Ordering::Release);
        self.assigned.store(index + 1, Ordering::Release);
        self.slot_address(index)
    }

    /// Redirect one slot to a specialized stub. Fatal if already patched.
    pub(crate) fn patch(&self, address: TrampolineAddress, stub: StubAddress) {
        let index = self.slot_of(address);
        if self.patched[index].swap(true, Ordering::AcqRel) {
            invariant_violation(format!("trampoline {} patched twice", address));
        }
        self.stubs[index].store(stub.as_usize(), Ordering::Release);
    }

    /// Count one slot as returned. Caller holds the allocator lock.
    ///
    /// Returns true once every assigned slot has been returned.
    pub(crate) fn release_slot(&self, address: TrampolineAddress) -> bool {
        let index = self.slot_of(address);
        if self.slot_released[index].swap(true, Ordering::AcqRel) {
            programming_error(format!("trampoline {} released twice", address));
        }
        let freed = self.freed.fetch_add(1, Ordering::AcqRel) + 1;
        freed == self.assigned()
    }

    /// Enter the released state. Caller holds the allocator lock.
    pub(crate) fn mark_released(&self) {
        self.assigned.store(RELEASED, Ordering::Release);
    }

    /// Current stub target of a slot
    pub fn stub_of(&self, address: TrampolineAddress) -> StubAddress {
        StubAddress::new(self.stubs[self.slot_of(address)].load(Ordering::Acquire))
    }

    /// Closure bound to a slot
    pub fn closure_of(&self, address: TrampolineAddress) -> UpcallClosure {
        let cell = &self.closures[self.slot_of(address)];
        UpcallClosure::new(
            cell.function.load(Ordering::Relaxed) as *const c_void,
            cell.data.load(Ordering::Relaxed) as *mut c_void,
        )
    }

    pub fn is_patched(&self, address: TrampolineAddress) -> bool {
        self.patched[self.slot_of(address)].load(Ordering::Acquire)
    }
}

fn free_or_log(memory: &dyn CodeMemory, page: *mut u8) {
    if let Err(err) = memory.free(page) {
        tracing::error!(
            target: "raya_foreign::trampoline",
            base = format_args!("0x{:x}", page as usize),
            error = %err,
            "failed to free trampoline page"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::testing::CountingMemory;

    fn closure(n: usize) -> UpcallClosure {
        UpcallClosure::new(n as *const c_void, (n * 2) as *mut c_void)
    }

    /// Hands out blocks shifted off their page boundary, or refuses to
    /// make them executable
    struct FaultyMemory {
        inner: CountingMemory,
        shift: usize,
        protect_fails: bool,
    }

    impl CodeMemory for FaultyMemory {
        fn page_size(&self) -> usize {
            CountingMemory::PAGE
        }

        fn allocate(&self) -> ForeignResult<*mut u8> {
            Ok(unsafe { self.inner.allocate()?.add(self.shift) })
        }

        fn make_executable(&self, _page: *mut u8) -> ForeignResult<()> {
            if self.protect_fails {
                return Err(crate::error::ForeignError::ResourceExhausted("mprotect refused".to_string()));
            }
            Ok(())
        }

        fn free(&self, page: *mut u8) -> ForeignResult<()> {
            self.inner.free(unsafe { page.sub(self.shift) })
        }
    }

    #[test]
    fn test_capacity_from_page_and_slot_size() {
        let memory = CountingMemory::default();
        let set = TrampolineSet::new(&memory, Abi::SysV, 1).unwrap();
        assert_eq!(set.capacity(), CountingMemory::PAGE / 32);
        assert!(set.has_free_capacity());
        assert_eq!(set.base() % CountingMemory::PAGE, 0);
        memory.free(set.page()).unwrap();
    }

    #[test]
    fn test_templates_reference_their_cells() {
        let memory = CountingMemory::default();
        let set = TrampolineSet::new(&memory, Abi::SysV, 0x77).unwrap();
        let code = unsafe { std::slice::from_raw_parts(set.page(), CountingMemory::PAGE) };
        for i in [0usize, 1, set.capacity() - 1] {
            let slot = &code[i * 32..(i + 1) * 32];
            assert_eq!(u64::from_le_bytes(slot[2..10].try_into().unwrap()), 0x77);
            let closure_cell = u64::from_le_bytes(slot[12..20].try_into().unwrap());
            assert_eq!(closure_cell as usize, &set.closures[i] as *const ClosureCell as usize);
            let stub_cell = u64::from_le_bytes(slot[22..30].try_into().unwrap());
            assert_eq!(stub_cell as usize, &set.stubs[i] as *const AtomicUsize as usize);
        }
        memory.free(set.page()).unwrap();
    }

    #[test]
    fn test_assign_binds_cells() {
        let memory = CountingMemory::default();
        let set = TrampolineSet::new(&memory, Abi::SysV, 0).unwrap();
        let a = set.assign(closure(1), StubAddress::new(0x100));
        let b = set.assign(closure(2), StubAddress::new(0x200));
        assert_eq!(b.as_usize() - a.as_usize(), 32);
        assert_eq!(set.closure_of(a), closure(1));
        assert_eq!(set.stub_of(b), StubAddress::new(0x200));
        assert_eq!(set.assigned(), 2);
        memory.free(set.page()).unwrap();
    }

    #[test]
    fn test_interior_address_maps_to_slot() {
        let memory = CountingMemory::default();
        let set = TrampolineSet::new(&memory, Abi::SysV, 0).unwrap();
        let a = set.assign(closure(1), StubAddress::new(0x100));
        let inside = TrampolineAddress::new(a.as_usize() + 17);
        assert_eq!(set.slot_of(inside), 0);
        memory.free(set.page()).unwrap();
    }

    #[test]
    #[should_panic(expected = "is not an assigned trampoline")]
    fn test_unassigned_slot_is_rejected() {
        let memory = CountingMemory::default();
        let set = TrampolineSet::new(&memory, Abi::SysV, 0).unwrap();
        set.slot_of(set.slot_address(3));
    }

    #[test]
    fn test_release_counts_to_assigned() {
        let memory = CountingMemory::default();
        let set = TrampolineSet::new(&memory, Abi::SysV, 0).unwrap();
        let a = set.assign(closure(1), StubAddress::new(0x100));
        let b = set.assign(closure(2), StubAddress::new(0x100));
        assert!(!set.release_slot(b));
        assert!(set.release_slot(a));
        set.mark_released();
        assert!(set.is_released());
        assert!(!set.has_free_capacity());
        memory.free(set.page()).unwrap();
    }

    #[test]
    fn test_misaligned_page_is_freed_before_failing() {
        let memory = FaultyMemory {
            inner: CountingMemory::default(),
            shift: 64,
            protect_fails: false,
        };
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            TrampolineSet::new(&memory, Abi::SysV, 0)
        }));
        let payload = result.unwrap_err();
        let message = payload.downcast_ref::<String>().cloned().unwrap_or_default();
        assert!(message.contains("is not 4096-byte aligned"), "{}", message);
        assert_eq!(memory.inner.freed.load(Ordering::SeqCst), 1);
        assert!(memory.inner.live.lock().is_empty());
    }

    #[test]
    fn test_protect_failure_frees_page() {
        let memory = FaultyMemory {
            inner: CountingMemory::default(),
            shift: 0,
            protect_fails: true,
        };
        let err = TrampolineSet::new(&memory, Abi::SysV, 0).unwrap_err();
        assert!(err.to_string().contains("mprotect refused"));
        assert_eq!(memory.inner.freed.load(Ordering::SeqCst), 1);
        assert!(memory.inner.live.lock().is_empty());
    }
}
