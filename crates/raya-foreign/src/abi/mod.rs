//! Calling conventions
//!
//! Each supported ABI implements `CallingConvention`, which classifies a
//! `FunctionType` into per-slot storage and builds the adaptation pipeline
//! for the resulting descriptor. The host ABI is resolved once into an `Abi`
//! value; call sites dispatch on that value, never on a trait object.
//!
//! Hardware parameter order for downcalls is
//! `[return-buffer] call-target [capture-buffer] args...`.

pub mod sysv;
pub mod win64;
pub mod x64;

use std::fmt;

use serde::Deserialize;

use crate::adapt::AdaptationPipeline;
use crate::capture::CapturableState;
use crate::descriptor::{LinkOptions, NativeEntryPoint};
use crate::error::{ForeignError, ForeignResult};
use crate::layout::{Carrier, FunctionType, MethodType};

pub use sysv::SysV;
pub use win64::Win64;

/// Register file a register belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegisterClass {
    Integer,
    Vector,
}

/// A machine register (class + hardware encoding)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Register {
    pub class: RegisterClass,
    pub index: u8,
}

impl Register {
    pub const fn integer(index: u8) -> Self {
        Self {
            class: RegisterClass::Integer,
            index,
        }
    }

    pub const fn vector(index: u8) -> Self {
        Self {
            class: RegisterClass::Vector,
            index,
        }
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(x64::register_name(*self))
    }
}

/// Where one hardware slot lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Storage {
    /// Intentionally unassigned: the leading return-buffer slot, or the
    /// offset half of a fused (object, offset) pair
    Placeholder,
    Register(Register),
    /// Byte offset into the outgoing argument area
    Stack { offset: u32, size: u8 },
}

impl Storage {
    pub fn is_placeholder(&self) -> bool {
        matches!(self, Storage::Placeholder)
    }

    pub fn is_integer_register(&self) -> bool {
        matches!(
            self,
            Storage::Register(Register {
                class: RegisterClass::Integer,
                ..
            })
        )
    }
}

impl fmt::Display for Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Storage::Placeholder => f.write_str("_"),
            Storage::Register(reg) => write!(f, "{}", reg),
            Storage::Stack { offset, size } => write!(f, "stack[{}:{}]", offset, size),
        }
    }
}

/// Registers with a fixed role at the call boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpecialRegisters {
    /// Downcall stubs receive the callee address here
    pub call_target: Register,
    /// Downcall stubs receive the capture-state buffer here
    pub capture_buffer: Register,
    /// Trampolines load the isolate identity here
    pub trampoline_isolate: Register,
    /// Trampolines load the closure cell address here
    pub trampoline_closure: Register,
    /// Trampolines load the stub cell address here before jumping through it
    pub trampoline_scratch: Register,
}

/// Result of classifying a signature under one ABI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallArrangement {
    pub signature: MethodType,
    pub parameter_storage: Vec<Storage>,
    pub return_storage: Vec<Storage>,
    /// Bytes the stub needs for a multi-register return, 0 otherwise
    pub return_buffer_size: usize,
}

/// Per-ABI classification output, before the downcall prefix is added
#[derive(Debug, Clone, Default)]
pub struct Classification {
    pub params: Vec<(Carrier, Storage)>,
    pub returns: Vec<(Carrier, Storage)>,
}

impl Classification {
    fn push_param(&mut self, carrier: Carrier, storage: Storage) {
        self.params.push((carrier, storage));
    }

    fn push_return(&mut self, carrier: Carrier, storage: Storage) {
        self.returns.push((carrier, storage));
    }
}

/// Behavior one ABI must provide
pub trait CallingConvention {
    /// ABI name (for diagnostics)
    fn name(&self) -> &'static str;

    fn special_registers(&self) -> SpecialRegisters;

    /// Bytes per upcall trampoline slot
    fn trampoline_size(&self) -> usize;

    /// Capturable states this platform supports, in capture order
    fn capture_order(&self) -> &'static [CapturableState];

    /// Classify parameters and return of `function_type`.
    ///
    /// Under `allow_heap_access` every `Address` parameter becomes an
    /// `(Object, I64)` pair whose second storage is `Placeholder`.
    fn classify(&self, function_type: &FunctionType, allow_heap_access: bool) -> Classification;

    /// Whether float arguments classified into integer registers must be
    /// reinterpreted as integers before the call
    fn reinterprets_floats_in_integer_registers(&self) -> bool {
        false
    }

    fn supports_capture(&self, state: CapturableState) -> bool {
        self.capture_order().contains(&state)
    }

    /// Storage assignment for a downcall
    fn assign(&self, function_type: &FunctionType, options: &LinkOptions) -> ForeignResult<CallArrangement> {
        self.check_capture(options)?;
        let classified = self.classify(function_type, options.allow_heap_access());
        let special = self.special_registers();

        let needs_return_buffer = classified.returns.len() > 1;
        let mut params = Vec::with_capacity(classified.params.len() + 3);
        if needs_return_buffer {
            params.push((Carrier::I64, Storage::Placeholder));
        }
        params.push((Carrier::I64, Storage::Register(special.call_target)));
        if !options.capture.is_empty() {
            params.push((Carrier::I64, Storage::Register(special.capture_buffer)));
        }
        params.extend(classified.params);

        Ok(arrangement(params, classified.returns))
    }

    /// Storage assignment for an upcall (no call-target or capture prefix)
    fn assign_upcall(&self, function_type: &FunctionType) -> CallArrangement {
        let classified = self.classify(function_type, false);
        arrangement(classified.params, classified.returns)
    }

    fn build_adaptation_pipeline(&self, descriptor: &NativeEntryPoint) -> AdaptationPipeline {
        AdaptationPipeline::for_entry_point(descriptor, self.reinterprets_floats_in_integer_registers())
    }

    fn check_capture(&self, options: &LinkOptions) -> ForeignResult<()> {
        if options.capture.unknown_bits() != 0 {
            return Err(ForeignError::UnsupportedConfiguration(format!(
                "unknown capture-state bits 0x{:x}",
                options.capture.unknown_bits()
            )));
        }
        for state in CapturableState::ALL {
            if options.capture.contains(state) && !self.supports_capture(state) {
                return Err(ForeignError::UnsupportedConfiguration(format!(
                    "{} cannot be captured under the {} ABI",
                    state,
                    self.name()
                )));
            }
        }
        Ok(())
    }
}

fn arrangement(params: Vec<(Carrier, Storage)>, returns: Vec<(Carrier, Storage)>) -> CallArrangement {
    let (param_carriers, parameter_storage): (Vec<_>, Vec<_>) = params.into_iter().unzip();
    let return_buffer_size = if returns.len() > 1 {
        returns.iter().map(|(c, _)| c.size().max(8)).sum()
    } else {
        0
    };
    let ret = match returns.as_slice() {
        [(carrier, _)] => Some(*carrier),
        _ => None,
    };
    let return_storage = returns.into_iter().map(|(_, s)| s).collect();
    CallArrangement {
        signature: MethodType::new(param_carriers, ret),
        parameter_storage,
        return_storage,
        return_buffer_size,
    }
}

/// The resolved ABI of this process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Abi {
    SysV,
    Win64,
}

impl Abi {
    /// ABI of the host, or `UnsupportedConfiguration` on any other target
    pub fn host() -> ForeignResult<Abi> {
        #[cfg(all(target_arch = "x86_64", windows))]
        {
            Ok(Abi::Win64)
        }

        #[cfg(all(target_arch = "x86_64", unix))]
        {
            Ok(Abi::SysV)
        }

        #[cfg(not(all(target_arch = "x86_64", any(unix, windows))))]
        {
            Err(ForeignError::UnsupportedConfiguration(format!(
                "no calling convention for {}-{}",
                std::env::consts::ARCH,
                std::env::consts::OS
            )))
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Abi::SysV => SysV.name(),
            Abi::Win64 => Win64.name(),
        }
    }

    pub fn special_registers(self) -> SpecialRegisters {
        match self {
            Abi::SysV => SysV.special_registers(),
            Abi::Win64 => Win64.special_registers(),
        }
    }

    pub fn trampoline_size(self) -> usize {
        match self {
            Abi::SysV => SysV.trampoline_size(),
            Abi::Win64 => Win64.trampoline_size(),
        }
    }

    pub fn capture_order(self) -> &'static [CapturableState] {
        match self {
            Abi::SysV => SysV.capture_order(),
            Abi::Win64 => Win64.capture_order(),
        }
    }

    pub fn assign(self, function_type: &FunctionType, options: &LinkOptions) -> ForeignResult<CallArrangement> {
        match self {
            Abi::SysV => SysV.assign(function_type, options),
            Abi::Win64 => Win64.assign(function_type, options),
        }
    }

    pub fn assign_upcall(self, function_type: &FunctionType) -> CallArrangement {
        match self {
            Abi::SysV => SysV.assign_upcall(function_type),
            Abi::Win64 => Win64.assign_upcall(function_type),
        }
    }

    pub fn build_adaptation_pipeline(self, descriptor: &NativeEntryPoint) -> AdaptationPipeline {
        match self {
            Abi::SysV => SysV.build_adaptation_pipeline(descriptor),
            Abi::Win64 => Win64.build_adaptation_pipeline(descriptor),
        }
    }

    /// Write one trampoline slot. Both ABIs share the x86-64 template.
    pub fn emit_trampoline(self, out: &mut [u8], isolate: u64, closure_cell: u64, stub_cell: u64) -> usize {
        x64::emit_trampoline(out, &self.special_registers(), isolate, closure_cell, stub_cell)
    }
}

impl fmt::Display for Abi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::CaptureMask;
    use crate::layout::ValueLayout;

    #[test]
    fn test_downcall_prefix_order() {
        let fty = FunctionType::new(vec![ValueLayout::I32], Some(ValueLayout::I32));
        let options = LinkOptions::default().capture(CaptureMask::of(&[CapturableState::Errno]));
        let arr = Abi::SysV.assign(&fty, &options).unwrap();
        assert_eq!(arr.signature.params, vec![Carrier::I64, Carrier::I64, Carrier::I32]);
        assert_eq!(arr.parameter_storage[0], Storage::Register(x64::R10));
        assert_eq!(arr.parameter_storage[1], Storage::Register(x64::R11));
        assert_eq!(arr.parameter_storage[2], Storage::Register(x64::RDI));
    }

    #[test]
    fn test_unsupported_capture_is_rejected_eagerly() {
        let fty = FunctionType::new(vec![], None);
        let options = LinkOptions::default().capture(CaptureMask::of(&[CapturableState::GetLastError]));
        let err = Abi::SysV.assign(&fty, &options).unwrap_err();
        assert!(matches!(err, ForeignError::UnsupportedConfiguration(_)));
        assert!(Abi::Win64.assign(&fty, &options).is_ok());
    }

    #[test]
    fn test_storage_display() {
        assert_eq!(Storage::Placeholder.to_string(), "_");
        assert_eq!(Storage::Register(x64::RDI).to_string(), "rdi");
        assert_eq!(Storage::Stack { offset: 8, size: 8 }.to_string(), "stack[8:8]");
    }

    #[cfg(all(target_arch = "x86_64", unix))]
    #[test]
    fn test_host_abi() {
        assert_eq!(Abi::host().unwrap(), Abi::SysV);
    }
}
