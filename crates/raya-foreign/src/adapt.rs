//! Argument adaptation pipeline
//!
//! The generic call path hands a downcall stub one value per hardware slot,
//! including the prefix slots (return buffer, call target, capture buffer)
//! and the split halves of heap addresses. The pipeline reconciles that list
//! with what the hardware convention actually receives: it pulls out the
//! prefix values, fuses (object, offset) pairs into addresses and
//! reinterprets floats that travel in integer registers.
//!
//! Every operation is applied in lockstep to the carrier list, the storage
//! list and (at run time) the value list, so the three stay equal in length.

use std::fmt;

use crate::abi::Storage;
use crate::descriptor::NativeEntryPoint;
use crate::error::invariant_violation;
use crate::layout::Carrier;

/// A concrete argument value
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ArgValue {
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    /// Base address of a pinned managed object
    Object(usize),
}

impl ArgValue {
    pub fn carrier(&self) -> Carrier {
        match self {
            ArgValue::I8(_) => Carrier::I8,
            ArgValue::I16(_) => Carrier::I16,
            ArgValue::I32(_) => Carrier::I32,
            ArgValue::I64(_) => Carrier::I64,
            ArgValue::F32(_) => Carrier::F32,
            ArgValue::F64(_) => Carrier::F64,
            ArgValue::Object(_) => Carrier::Object,
        }
    }

    /// The value widened to one 64-bit argument word
    pub fn to_word(&self) -> u64 {
        match *self {
            ArgValue::I8(v) => v as i64 as u64,
            ArgValue::I16(v) => v as i64 as u64,
            ArgValue::I32(v) => v as i64 as u64,
            ArgValue::I64(v) => v as u64,
            ArgValue::F32(v) => v.to_bits() as u64,
            ArgValue::F64(v) => v.to_bits(),
            ArgValue::Object(base) => base as u64,
        }
    }

    fn reinterpret(self, to: Carrier) -> ArgValue {
        match (self, to) {
            (ArgValue::F32(v), Carrier::I32) => ArgValue::I32(v.to_bits() as i32),
            (ArgValue::F64(v), Carrier::I64) => ArgValue::I64(v.to_bits() as i64),
            (value, to) => invariant_violation(format!("cannot reinterpret {:?} as {}", value, to)),
        }
    }
}

/// Prefix value pulled out of the argument list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExtractKind {
    CallTarget,
    CaptureBuffer,
}

/// Operation applied to one original hardware slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Adaptation {
    NoOp,
    /// Keep the slot, asserting its carrier
    Check(Carrier),
    /// Remove the slot, remembering its value
    Extract(ExtractKind),
    /// Keep the slot, reinterpreting the bits as `Carrier`
    Reinterpret(Carrier),
    /// Remove the slot
    Drop,
    /// Replace this (object) slot by `object + offset`, the offset being the
    /// next slot's value
    FuseObjectOffset,
}

impl fmt::Display for Adaptation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Adaptation::NoOp => f.write_str("noop"),
            Adaptation::Check(c) => write!(f, "check({})", c),
            Adaptation::Extract(kind) => write!(f, "extract({:?})", kind),
            Adaptation::Reinterpret(c) => write!(f, "reinterpret({})", c),
            Adaptation::Drop => f.write_str("drop"),
            Adaptation::FuseObjectOffset => f.write_str("fuse(object, offset)"),
        }
    }
}

/// Result of applying a pipeline
#[derive(Debug, Clone, PartialEq)]
pub struct Adapted {
    pub types: Vec<Carrier>,
    pub storages: Vec<Storage>,
    pub values: Vec<ArgValue>,
    pub call_target: Option<ArgValue>,
    pub capture_buffer: Option<ArgValue>,
}

/// One adaptation per original hardware slot, in hardware order
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AdaptationPipeline {
    ops: Vec<Adaptation>,
    return_buffer: bool,
}

impl AdaptationPipeline {
    /// Build the pipeline for a downcall descriptor.
    ///
    /// `reinterpret_floats` enables the rewrite of float carriers assigned to
    /// integer registers (variadic floats under Win64).
    pub fn for_entry_point(descriptor: &NativeEntryPoint, reinterpret_floats: bool) -> Self {
        let params = &descriptor.signature().params;
        let storages = descriptor.parameter_storage();
        let mut ops = vec![Adaptation::NoOp; params.len()];
        let mut next = 0;

        if descriptor.needs_return_buffer() {
            ops[next] = Adaptation::Check(Carrier::I64);
            next += 1;
        }

        if next >= params.len() {
            invariant_violation("descriptor has no call-target slot");
        }
        ops[next] = Adaptation::Extract(ExtractKind::CallTarget);
        next += 1;

        if descriptor.captures_call_state() {
            if next >= params.len() {
                invariant_violation("descriptor has no capture-buffer slot");
            }
            ops[next] = Adaptation::Extract(ExtractKind::CaptureBuffer);
            next += 1;
        }
        let first_arg = next;

        for i in first_arg..params.len() {
            if !storages[i].is_placeholder() {
                continue;
            }
            if !descriptor.allow_heap_access() {
                invariant_violation(format!("placeholder storage at slot {} without heap access", i));
            }
            if i == first_arg || params[i - 1] != Carrier::Object || params[i] != Carrier::I64 {
                invariant_violation(format!("slot {} is not the offset half of an (object, offset) pair", i));
            }
            ops[i - 1] = Adaptation::FuseObjectOffset;
            ops[i] = Adaptation::Drop;
        }

        if reinterpret_floats {
            for i in (first_arg..params.len()).rev() {
                if params[i].is_float() && storages[i].is_integer_register() {
                    ops[i] = Adaptation::Reinterpret(params[i].same_width_integer());
                }
            }
        }

        Self {
            ops,
            return_buffer: descriptor.needs_return_buffer(),
        }
    }

    pub fn from_ops(ops: Vec<Adaptation>, return_buffer: bool) -> Self {
        Self { ops, return_buffer }
    }

    pub fn ops(&self) -> &[Adaptation] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Apply to a (types, storages, values) triple of equal length
    pub fn apply(&self, types: &[Carrier], storages: &[Storage], values: &[ArgValue]) -> Adapted {
        self.run(types, storages, Some(values))
    }

    /// Apply to the signature only (build time, no values yet)
    pub fn apply_types(&self, types: &[Carrier], storages: &[Storage]) -> (Vec<Carrier>, Vec<Storage>) {
        let adapted = self.run(types, storages, None);
        (adapted.types, adapted.storages)
    }

    fn run(&self, types: &[Carrier], storages: &[Storage], values: Option<&[ArgValue]>) -> Adapted {
        let n = self.ops.len();
        if types.len() != n || storages.len() != n || values.is_some_and(|v| v.len() != n) {
            invariant_violation(format!(
                "pipeline of {} operations applied to {} types, {} storages, {} values",
                n,
                types.len(),
                storages.len(),
                values.map_or(n, |v| v.len())
            ));
        }

        let mut out = Adapted {
            types: Vec::with_capacity(n),
            storages: Vec::with_capacity(n),
            values: Vec::with_capacity(if values.is_some() { n } else { 0 }),
            call_target: None,
            capture_buffer: None,
        };

        for (i, op) in self.ops.iter().enumerate() {
            let value = values.map(|v| v[i]);
            if let Some(v) = value {
                if v.carrier() != types[i] {
                    invariant_violation(format!("slot {} holds {} but is typed {}", i, v.carrier(), types[i]));
                }
            }
            match *op {
                Adaptation::NoOp => out.keep(types[i], storages[i], value),
                Adaptation::Check(expected) => {
                    if types[i] != expected {
                        invariant_violation(format!("slot {} is {}, expected {}", i, types[i], expected));
                    }
                    out.keep(types[i], storages[i], value);
                }
                Adaptation::Extract(kind) => {
                    let slot = match kind {
                        ExtractKind::CallTarget => &mut out.call_target,
                        ExtractKind::CaptureBuffer => &mut out.capture_buffer,
                    };
                    *slot = Some(value.unwrap_or(ArgValue::I64(0)));
                }
                Adaptation::Reinterpret(to) => {
                    if types[i].size() != to.size() {
                        invariant_violation(format!("reinterpret of {} as {} changes width", types[i], to));
                    }
                    out.keep(to, storages[i], value.map(|v| v.reinterpret(to)));
                }
                Adaptation::Drop => {}
                Adaptation::FuseObjectOffset => {
                    if types[i] != Carrier::Object || types.get(i + 1) != Some(&Carrier::I64) {
                        invariant_violation(format!("slot {} does not start an (object, offset) pair", i));
                    }
                    let fused = values.map(|v| match (v[i], v[i + 1]) {
                        (ArgValue::Object(base), ArgValue::I64(offset)) => {
                            ArgValue::I64((base as i64).wrapping_add(offset))
                        }
                        (a, b) => invariant_violation(format!("cannot fuse {:?} and {:?}", a, b)),
                    });
                    out.keep(Carrier::I64, storages[i], fused);
                }
            }
            if values.is_some() && out.values.len() != out.types.len() {
                invariant_violation(format!("adaptation {} at slot {} desynchronized the argument lists", op, i));
            }
        }

        self.check_postconditions(&out);
        out
    }

    fn check_postconditions(&self, out: &Adapted) {
        if out.types.len() != out.storages.len() {
            invariant_violation("adapted types and storages differ in length");
        }
        if out.call_target.is_none() {
            invariant_violation("adaptation did not extract the call target");
        }
        for (i, storage) in out.storages.iter().enumerate() {
            if storage.is_placeholder() && !(i == 0 && self.return_buffer) {
                invariant_violation(format!("placeholder storage survived adaptation at slot {}", i));
            }
        }
    }
}

impl Adapted {
    fn keep(&mut self, carrier: Carrier, storage: Storage, value: Option<ArgValue>) {
        self.types.push(carrier);
        self.storages.push(storage);
        if let Some(v) = value {
            self.values.push(v);
        }
    }
}
