//! Entry-point descriptors
//!
//! A descriptor is the value that keys a generated stub: the lowered
//! signature, where each slot lives, and the capabilities of the call.
//! `NativeEntryPoint` describes a downcall, `ManagedEntryPoint` an upcall.
//! Both are plain values with structural equality and hashing.

use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::abi::{Abi, CallArrangement, Storage};
use crate::capture::CaptureMask;
use crate::error::{invariant_violation, ForeignResult};
use crate::layout::{Carrier, FunctionType, MethodType};

/// Whether a downcall may skip the managed/native transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Critical {
    /// Regular call with a full transition
    #[default]
    No,
    /// No transition; when `allow_heap_access` is set, address arguments may
    /// point into the managed heap and are passed as (object, offset) pairs
    Yes { allow_heap_access: bool },
}

/// Options a downcall binding was linked with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct LinkOptions {
    pub capture: CaptureMask,
    pub critical: Critical,
}

impl LinkOptions {
    pub fn capture(mut self, mask: CaptureMask) -> Self {
        self.capture = mask;
        self
    }

    pub fn critical(mut self, allow_heap_access: bool) -> Self {
        self.critical = Critical::Yes { allow_heap_access };
        self
    }

    pub fn needs_transition(&self) -> bool {
        matches!(self.critical, Critical::No)
    }

    pub fn allow_heap_access(&self) -> bool {
        matches!(self.critical, Critical::Yes { allow_heap_access: true })
    }
}

/// Descriptor of a downcall
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NativeEntryPoint {
    signature: MethodType,
    parameter_storage: Vec<Storage>,
    return_storage: Vec<Storage>,
    return_buffer_size: usize,
    capture_mask: CaptureMask,
    needs_transition: bool,
    allow_heap_access: bool,
}

impl NativeEntryPoint {
    /// Classify `function_type` under `abi` and build its descriptor
    pub fn make(abi: Abi, function_type: &FunctionType, options: &LinkOptions) -> ForeignResult<Self> {
        let arrangement = abi.assign(function_type, options)?;
        Ok(Self::from_arrangement(arrangement, options))
    }

    pub fn from_arrangement(arrangement: CallArrangement, options: &LinkOptions) -> Self {
        let descriptor = Self {
            signature: arrangement.signature,
            parameter_storage: arrangement.parameter_storage,
            return_storage: arrangement.return_storage,
            return_buffer_size: arrangement.return_buffer_size,
            capture_mask: options.capture,
            needs_transition: options.needs_transition(),
            allow_heap_access: options.allow_heap_access(),
        };
        descriptor.validate();
        descriptor
    }

    fn validate(&self) {
        if self.parameter_storage.len() != self.signature.params.len() {
            invariant_violation(format!(
                "{} parameter storages for {} parameters",
                self.parameter_storage.len(),
                self.signature.params.len()
            ));
        }
        if self.needs_transition && self.allow_heap_access {
            invariant_violation("heap access requested on a transitioning call");
        }
        for (i, storage) in self.parameter_storage.iter().enumerate() {
            if !storage.is_placeholder() {
                continue;
            }
            let return_buffer = i == 0 && self.needs_return_buffer();
            let fused_offset = self.allow_heap_access
                && i > 0
                && self.signature.params[i - 1] == Carrier::Object
                && self.signature.params[i] == Carrier::I64
                && !self.parameter_storage[i - 1].is_placeholder();
            if !return_buffer && !fused_offset {
                invariant_violation(format!("unexpected placeholder storage at slot {}", i));
            }
        }
    }

    pub fn signature(&self) -> &MethodType {
        &self.signature
    }

    pub fn parameter_storage(&self) -> &[Storage] {
        &self.parameter_storage
    }

    pub fn return_storage(&self) -> &[Storage] {
        &self.return_storage
    }

    pub fn return_buffer_size(&self) -> usize {
        self.return_buffer_size
    }

    pub fn needs_return_buffer(&self) -> bool {
        self.return_storage.len() > 1
    }

    pub fn capture_mask(&self) -> CaptureMask {
        self.capture_mask
    }

    pub fn captures_call_state(&self) -> bool {
        !self.capture_mask.is_empty()
    }

    pub fn needs_transition(&self) -> bool {
        self.needs_transition
    }

    pub fn allow_heap_access(&self) -> bool {
        self.allow_heap_access
    }
}

/// Descriptor of an upcall
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ManagedEntryPoint {
    signature: MethodType,
    parameter_storage: Vec<Storage>,
    return_storage: Vec<Storage>,
    return_buffer_size: usize,
}

impl ManagedEntryPoint {
    pub fn make(abi: Abi, function_type: &FunctionType) -> Self {
        Self::from_arrangement(abi.assign_upcall(function_type))
    }

    pub fn from_arrangement(arrangement: CallArrangement) -> Self {
        if arrangement.parameter_storage.len() != arrangement.signature.params.len() {
            invariant_violation("upcall storage count differs from parameter count");
        }
        if arrangement.parameter_storage.iter().any(Storage::is_placeholder) {
            invariant_violation("upcall parameters cannot have placeholder storage");
        }
        Self {
            signature: arrangement.signature,
            parameter_storage: arrangement.parameter_storage,
            return_storage: arrangement.return_storage,
            return_buffer_size: arrangement.return_buffer_size,
        }
    }

    pub fn signature(&self) -> &MethodType {
        &self.signature
    }

    pub fn parameter_storage(&self) -> &[Storage] {
        &self.parameter_storage
    }

    pub fn return_storage(&self) -> &[Storage] {
        &self.return_storage
    }

    pub fn return_buffer_size(&self) -> usize {
        self.return_buffer_size
    }

    pub fn needs_return_buffer(&self) -> bool {
        self.return_storage.len() > 1
    }
}

/// Interned descriptors, one per distinct signature and options.
///
/// Entries are never evicted: the stubs they key live for the whole process.
pub struct EntryPointCache {
    abi: Abi,
    downcalls: RwLock<FxHashMap<(FunctionType, LinkOptions), Arc<NativeEntryPoint>>>,
    upcalls: RwLock<FxHashMap<FunctionType, Arc<ManagedEntryPoint>>>,
}

impl EntryPointCache {
    pub fn new(abi: Abi) -> Self {
        Self {
            abi,
            downcalls: RwLock::new(FxHashMap::default()),
            upcalls: RwLock::new(FxHashMap::default()),
        }
    }

    pub fn downcall(&self, function_type: &FunctionType, options: &LinkOptions) -> ForeignResult<Arc<NativeEntryPoint>> {
        let key = (function_type.clone(), *options);
        if let Some(found) = self.downcalls.read().get(&key) {
            return Ok(found.clone());
        }

        let descriptor = Arc::new(NativeEntryPoint::make(self.abi, function_type, options)?);
        tracing::debug!(
            target: "raya_foreign::descriptor",
            function_type = %function_type,
            signature = %descriptor.signature(),
            "new downcall descriptor"
        );
        Ok(self.downcalls.write().entry(key).or_insert(descriptor).clone())
    }

    pub fn upcall(&self, function_type: &FunctionType) -> Arc<ManagedEntryPoint> {
        if let Some(found) = self.upcalls.read().get(function_type) {
            return found.clone();
        }

        let descriptor = Arc::new(ManagedEntryPoint::make(self.abi, function_type));
        tracing::debug!(
            target: "raya_foreign::descriptor",
            function_type = %function_type,
            signature = %descriptor.signature(),
            "new upcall descriptor"
        );
        self.upcalls
            .write()
            .entry(function_type.clone())
            .or_insert(descriptor)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.downcalls.read().len() + self.upcalls.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::x64;
    use crate::capture::CapturableState;
    use crate::layout::ValueLayout;
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    fn hash_of<T: Hash>(value: &T) -> u64 {
        let mut hasher = DefaultHasher::new();
        value.hash(&mut hasher);
        hasher.finish()
    }

    fn add_type() -> FunctionType {
        FunctionType::new(vec![ValueLayout::I64, ValueLayout::I64], Some(ValueLayout::I64))
    }

    #[test]
    fn test_descriptors_are_structural_keys() {
        let d1 = NativeEntryPoint::make(Abi::SysV, &add_type(), &LinkOptions::default()).unwrap();
        let d2 = NativeEntryPoint::make(Abi::SysV, &add_type(), &LinkOptions::default()).unwrap();
        assert_eq!(d1, d2);
        assert_eq!(hash_of(&d1), hash_of(&d2));

        let mut map = FxHashMap::default();
        map.insert(d1, 1usize);
        assert_eq!(map.get(&d2), Some(&1));
    }

    #[test]
    fn test_options_change_the_descriptor() {
        let plain = NativeEntryPoint::make(Abi::SysV, &add_type(), &LinkOptions::default()).unwrap();
        let critical = NativeEntryPoint::make(Abi::SysV, &add_type(), &LinkOptions::default().critical(false)).unwrap();
        assert_ne!(plain, critical);
        assert!(plain.needs_transition());
        assert!(!critical.needs_transition());
        assert!(!critical.allow_heap_access());
    }

    #[test]
    fn test_flags_follow_arrangement() {
        let options = LinkOptions::default()
            .critical(true)
            .capture(CaptureMask::of(&[CapturableState::Errno]));
        let fty = FunctionType::new(vec![ValueLayout::Address], None);
        let d = NativeEntryPoint::make(Abi::SysV, &fty, &options).unwrap();
        assert!(d.captures_call_state());
        assert!(d.allow_heap_access());
        assert!(!d.needs_return_buffer());
        assert_eq!(d.parameter_storage().len(), d.signature().params.len());
        assert_eq!(d.parameter_storage()[3], Storage::Placeholder);
    }

    #[test]
    #[should_panic(expected = "unexpected placeholder storage at slot 1")]
    fn test_placeholder_without_heap_access_is_fatal() {
        let arrangement = CallArrangement {
            signature: MethodType::new(vec![Carrier::I64, Carrier::I64], None),
            parameter_storage: vec![Storage::Register(x64::R10), Storage::Placeholder],
            return_storage: vec![],
            return_buffer_size: 0,
        };
        NativeEntryPoint::from_arrangement(arrangement, &LinkOptions::default());
    }

    #[test]
    fn test_cache_interns_descriptors() {
        let cache = EntryPointCache::new(Abi::SysV);
        let a = cache.downcall(&add_type(), &LinkOptions::default()).unwrap();
        let b = cache.downcall(&add_type(), &LinkOptions::default()).unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        let u1 = cache.upcall(&add_type());
        let u2 = cache.upcall(&add_type());
        assert!(Arc::ptr_eq(&u1, &u2));
        assert_eq!(cache.len(), 2);
    }
}
