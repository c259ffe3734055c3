//! Stub registry
//!
//! Connects descriptors to generated stub addresses. The registry has two
//! phases: a `StubRegistryBuilder` collects registrations while the image is
//! being built, then `build()` freezes it into a `StubRegistry` that run time
//! only reads.

use std::fmt;

use rustc_hash::FxHashMap;

use crate::descriptor::{ManagedEntryPoint, NativeEntryPoint};
use crate::error::ForeignResult;
use crate::naming;

/// Address of a generated stub
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StubAddress(usize);

impl StubAddress {
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

impl fmt::Display for StubAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

/// Identity of the managed call site a direct upcall stub was specialized for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BindingId(pub u64);

impl fmt::Display for BindingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "binding#{}", self.0)
    }
}

/// Code generator for stub bodies.
///
/// Emitting the machine code is outside this crate; implementations return
/// the address of a callable stub for a descriptor.
pub trait StubGenerator {
    /// Generate the downcall stub for `descriptor`, named `symbol`
    fn downcall_stub(&self, descriptor: &NativeEntryPoint, symbol: &str) -> ForeignResult<StubAddress>;

    /// Generate the generic upcall stub for `descriptor`
    fn upcall_stub(&self, descriptor: &ManagedEntryPoint, symbol: &str) -> ForeignResult<StubAddress>;

    /// Generate a stub specialized for one binding, if the generator can
    fn direct_upcall_stub(
        &self,
        _binding: BindingId,
        _descriptor: &ManagedEntryPoint,
        _symbol: &str,
    ) -> ForeignResult<Option<StubAddress>> {
        Ok(None)
    }
}

#[derive(Default)]
struct Tables {
    downcalls: FxHashMap<NativeEntryPoint, StubAddress>,
    upcalls: FxHashMap<ManagedEntryPoint, StubAddress>,
    direct_upcalls: FxHashMap<(BindingId, ManagedEntryPoint), StubAddress>,
    names: FxHashMap<StubAddress, String>,
}

/// Build-phase registry
#[derive(Default)]
pub struct StubRegistryBuilder {
    tables: Tables,
}

impl StubRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a downcall stub. Returns false if `descriptor` already has one.
    pub fn register_downcall(&mut self, descriptor: NativeEntryPoint, address: StubAddress) -> bool {
        if self.tables.downcalls.contains_key(&descriptor) {
            tracing::trace!(target: "raya_foreign::registry", signature = %descriptor.signature(), "duplicate downcall registration");
            return false;
        }
        self.tables
            .names
            .entry(address)
            .or_insert_with(|| naming::downcall_stub_name(&descriptor));
        self.tables.downcalls.insert(descriptor, address);
        true
    }

    /// Register a generic upcall stub. Returns false if already present.
    pub fn register_upcall(&mut self, descriptor: ManagedEntryPoint, address: StubAddress) -> bool {
        if self.tables.upcalls.contains_key(&descriptor) {
            return false;
        }
        self.tables
            .names
            .entry(address)
            .or_insert_with(|| naming::upcall_stub_name(&descriptor));
        self.tables.upcalls.insert(descriptor, address);
        true
    }

    /// Register a stub specialized for `binding`. Returns false if already present.
    pub fn register_direct_upcall(
        &mut self,
        binding: BindingId,
        descriptor: ManagedEntryPoint,
        address: StubAddress,
    ) -> bool {
        let key = (binding, descriptor);
        if self.tables.direct_upcalls.contains_key(&key) {
            return false;
        }
        self.tables
            .names
            .entry(address)
            .or_insert_with(|| naming::direct_upcall_stub_name(binding.0, &key.1));
        self.tables.direct_upcalls.insert(key, address);
        true
    }

    /// Generate and register the downcall stub for `descriptor` unless one exists
    pub fn generate_downcall(
        &mut self,
        generator: &dyn StubGenerator,
        descriptor: &NativeEntryPoint,
    ) -> ForeignResult<StubAddress> {
        if let Some(address) = self.tables.downcalls.get(descriptor) {
            return Ok(*address);
        }
        let symbol = naming::downcall_stub_name(descriptor);
        let address = generator.downcall_stub(descriptor, &symbol)?;
        tracing::debug!(target: "raya_foreign::registry", %symbol, %address, "generated downcall stub");
        self.tables.names.insert(address, symbol);
        self.tables.downcalls.insert(descriptor.clone(), address);
        Ok(address)
    }

    /// Generate and register the generic upcall stub for `descriptor` unless one exists
    pub fn generate_upcall(
        &mut self,
        generator: &dyn StubGenerator,
        descriptor: &ManagedEntryPoint,
    ) -> ForeignResult<StubAddress> {
        if let Some(address) = self.tables.upcalls.get(descriptor) {
            return Ok(*address);
        }
        let symbol = naming::upcall_stub_name(descriptor);
        let address = generator.upcall_stub(descriptor, &symbol)?;
        tracing::debug!(target: "raya_foreign::registry", %symbol, %address, "generated upcall stub");
        self.tables.names.insert(address, symbol);
        self.tables.upcalls.insert(descriptor.clone(), address);
        Ok(address)
    }

    /// Ask the generator for a direct stub; `None` when it cannot specialize
    pub fn generate_direct_upcall(
        &mut self,
        generator: &dyn StubGenerator,
        binding: BindingId,
        descriptor: &ManagedEntryPoint,
    ) -> ForeignResult<Option<StubAddress>> {
        let key = (binding, descriptor.clone());
        if let Some(address) = self.tables.direct_upcalls.get(&key) {
            return Ok(Some(*address));
        }
        let symbol = naming::direct_upcall_stub_name(binding.0, descriptor);
        let Some(address) = generator.direct_upcall_stub(binding, descriptor, &symbol)? else {
            return Ok(None);
        };
        tracing::debug!(target: "raya_foreign::registry", %symbol, %address, %binding, "generated direct upcall stub");
        self.tables.names.insert(address, symbol);
        self.tables.direct_upcalls.insert(key, address);
        Ok(Some(address))
    }

    /// Freeze the registry
    pub fn build(self) -> StubRegistry {
        tracing::debug!(
            target: "raya_foreign::registry",
            downcalls = self.tables.downcalls.len(),
            upcalls = self.tables.upcalls.len(),
            direct_upcalls = self.tables.direct_upcalls.len(),
            "stub registry sealed"
        );
        StubRegistry { tables: self.tables }
    }
}

/// Immutable run-time registry
pub struct StubRegistry {
    tables: Tables,
}

impl fmt::Debug for StubRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StubRegistry")
            .field("downcalls", &self.tables.downcalls.len())
            .field("upcalls", &self.tables.upcalls.len())
            .field("direct_upcalls", &self.tables.direct_upcalls.len())
            .finish()
    }
}

impl StubRegistry {
    /// A registry with no stubs
    pub fn empty() -> Self {
        StubRegistryBuilder::new().build()
    }

    pub fn downcall(&self, descriptor: &NativeEntryPoint) -> Option<StubAddress> {
        self.tables.downcalls.get(descriptor).copied()
    }

    pub fn upcall(&self, descriptor: &ManagedEntryPoint) -> Option<StubAddress> {
        self.tables.upcalls.get(descriptor).copied()
    }

    pub fn direct_upcall(&self, binding: BindingId, descriptor: &ManagedEntryPoint) -> Option<StubAddress> {
        // the tuple key needs an owned descriptor; direct lookups are rare
        self.tables
            .direct_upcalls
            .get(&(binding, descriptor.clone()))
            .copied()
    }

    /// Symbol name of a registered stub
    pub fn symbol_of(&self, address: StubAddress) -> Option<&str> {
        self.tables.names.get(&address).map(String::as_str)
    }

    pub fn downcall_count(&self) -> usize {
        self.tables.downcalls.len()
    }

    pub fn upcall_count(&self) -> usize {
        self.tables.upcalls.len()
    }

    pub fn direct_upcall_count(&self) -> usize {
        self.tables.direct_upcalls.len()
    }
}
