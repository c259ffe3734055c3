//! Deterministic stub symbol names
//!
//! Names are derived from the carrier tags plus a hash of the storage
//! assignment, so two bindings with the same ABI shape share one stub and
//! one name across builds.

use sha2::{Digest, Sha256};

use crate::abi::Storage;
use crate::descriptor::{ManagedEntryPoint, NativeEntryPoint};
use crate::layout::{Carrier, MethodType};

/// Hex digits of the storage hash kept in a name
const HASH_DIGITS: usize = 16;

fn tags(signature: &MethodType) -> (String, char) {
    let params: String = signature.params.iter().map(|c| c.tag()).collect();
    let ret = signature.ret.map_or('V', Carrier::tag);
    (params, ret)
}

fn storage_hash(parts: &[&[Storage]], flags: &str) -> String {
    let mut hasher = Sha256::new();
    for (i, storages) in parts.iter().enumerate() {
        hasher.update([i as u8]);
        for storage in storages.iter() {
            hasher.update(storage.to_string().as_bytes());
            hasher.update(b";");
        }
    }
    hasher.update(flags.as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..HASH_DIGITS].to_string()
}

/// Symbol name of the downcall stub for `descriptor`
pub fn downcall_stub_name(descriptor: &NativeEntryPoint) -> String {
    let (params, ret) = tags(descriptor.signature());
    let flags = format!(
        "t{}h{}c{:x}",
        descriptor.needs_transition() as u8,
        descriptor.allow_heap_access() as u8,
        descriptor.capture_mask().bits()
    );
    let hash = storage_hash(
        &[descriptor.parameter_storage(), descriptor.return_storage()],
        &flags,
    );
    format!("downcall_{}_{}_{}", params, ret, hash)
}

/// Symbol name of the generic upcall stub for `descriptor`
pub fn upcall_stub_name(descriptor: &ManagedEntryPoint) -> String {
    let (params, ret) = tags(descriptor.signature());
    let hash = storage_hash(&[descriptor.parameter_storage(), descriptor.return_storage()], "");
    format!("upcall_{}_{}_{}", params, ret, hash)
}

/// Symbol name of a direct upcall stub specialized for one binding
pub fn direct_upcall_stub_name(binding: u64, descriptor: &ManagedEntryPoint) -> String {
    format!("{}_direct_{:x}", upcall_stub_name(descriptor), binding)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::Abi;
    use crate::descriptor::LinkOptions;
    use crate::layout::{FunctionType, ValueLayout};

    #[test]
    fn test_downcall_name_shape() {
        let fty = FunctionType::new(vec![ValueLayout::I64, ValueLayout::F64], Some(ValueLayout::I32));
        let d = NativeEntryPoint::make(Abi::SysV, &fty, &LinkOptions::default()).unwrap();
        let name = downcall_stub_name(&d);
        assert!(name.starts_with("downcall_JJD_I_"), "{}", name);
        assert_eq!(name.len(), "downcall_JJD_I_".len() + HASH_DIGITS);
    }

    #[test]
    fn test_same_shape_same_name() {
        // an address and an i64 lower to the same slot
        let a = FunctionType::new(vec![ValueLayout::Address], None);
        let b = FunctionType::new(vec![ValueLayout::I64], None);
        let da = NativeEntryPoint::make(Abi::SysV, &a, &LinkOptions::default()).unwrap();
        let db = NativeEntryPoint::make(Abi::SysV, &b, &LinkOptions::default()).unwrap();
        assert_eq!(downcall_stub_name(&da), downcall_stub_name(&db));
    }

    #[test]
    fn test_storage_changes_hash() {
        let fty = FunctionType::new(vec![ValueLayout::I64, ValueLayout::F64], None);
        let sysv = NativeEntryPoint::make(Abi::SysV, &fty, &LinkOptions::default()).unwrap();
        let win = NativeEntryPoint::make(Abi::Win64, &fty, &LinkOptions::default()).unwrap();
        assert_ne!(downcall_stub_name(&sysv), downcall_stub_name(&win));
    }

    #[test]
    fn test_direct_upcall_name_includes_binding() {
        let fty = FunctionType::new(vec![ValueLayout::I32], Some(ValueLayout::I32));
        let d = ManagedEntryPoint::make(Abi::SysV, &fty);
        let name = direct_upcall_stub_name(0xab, &d);
        assert!(name.starts_with("upcall_I_I_"));
        assert!(name.ends_with("_direct_ab"));
    }
}
