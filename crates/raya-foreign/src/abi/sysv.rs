//! System V AMD64 calling convention (Linux, macOS, BSD)

use super::x64::{self, RAX, RCX, RDI, RDX, RSI, R8, R9};
use super::{CallingConvention, Classification, Register, SpecialRegisters, Storage};
use crate::capture::CapturableState;
use crate::layout::{Carrier, FunctionType, StructLayout, ValueLayout};

const INTEGER_ARGS: [Register; 6] = [RDI, RSI, RDX, RCX, R8, R9];
const VECTOR_ARG_COUNT: u8 = 8;
const INTEGER_RETURNS: [Register; 2] = [RAX, RDX];
const VECTOR_RETURN_COUNT: u8 = 2;
const STACK_SLOT: u32 = 8;

const CAPTURE_ORDER: [CapturableState; 1] = [CapturableState::Errno];

/// System V AMD64
#[derive(Debug, Clone, Copy, Default)]
pub struct SysV;

/// Eightbyte class of an aggregate piece
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArgClass {
    Integer,
    Sse,
}

/// Running register/stack allocation state
struct Allocator {
    next_integer: usize,
    next_vector: u8,
    stack_offset: u32,
}

impl Allocator {
    fn new() -> Self {
        Self {
            next_integer: 0,
            next_vector: 0,
            stack_offset: 0,
        }
    }

    fn integer(&mut self) -> Storage {
        match INTEGER_ARGS.get(self.next_integer) {
            Some(reg) => {
                self.next_integer += 1;
                Storage::Register(*reg)
            }
            None => self.stack(),
        }
    }

    fn vector(&mut self) -> Storage {
        if self.next_vector < VECTOR_ARG_COUNT {
            let reg = x64::xmm(self.next_vector);
            self.next_vector += 1;
            Storage::Register(reg)
        } else {
            self.stack()
        }
    }

    fn stack(&mut self) -> Storage {
        let storage = Storage::Stack {
            offset: self.stack_offset,
            size: STACK_SLOT as u8,
        };
        self.stack_offset += STACK_SLOT;
        storage
    }

    fn fits(&self, integers: usize, vectors: usize) -> bool {
        self.next_integer + integers <= INTEGER_ARGS.len()
            && self.next_vector as usize + vectors <= VECTOR_ARG_COUNT as usize
    }
}

/// Classify each eightbyte of a struct of at most 16 bytes
fn classify_eightbytes(layout: &StructLayout) -> Vec<(ArgClass, usize)> {
    let size = layout.size();
    let count = size.div_ceil(8);
    let mut classes = vec![ArgClass::Sse; count];
    let mut seen = vec![false; count];
    for (offset, field) in layout.flattened() {
        let idx = offset / 8;
        seen[idx] = true;
        if !field.is_float() {
            classes[idx] = ArgClass::Integer;
        }
    }
    classes
        .into_iter()
        .enumerate()
        .map(|(i, class)| {
            let bytes = (size - i * 8).min(8);
            // padding-only eightbytes travel as integers
            let class = if seen[i] { class } else { ArgClass::Integer };
            (class, bytes)
        })
        .collect()
}

fn eightbyte_carrier(class: ArgClass, bytes: usize) -> Carrier {
    match class {
        ArgClass::Sse if bytes <= 4 => Carrier::F32,
        ArgClass::Sse => Carrier::F64,
        ArgClass::Integer => integer_carrier(bytes),
    }
}

/// Smallest integer carrier holding `bytes`
fn integer_carrier(bytes: usize) -> Carrier {
    match bytes {
        0..=1 => Carrier::I8,
        2 => Carrier::I16,
        3..=4 => Carrier::I32,
        _ => Carrier::I64,
    }
}

fn is_memory_class(layout: &StructLayout) -> bool {
    layout.size() > 16
}

impl SysV {
    fn classify_struct_arg(&self, layout: &StructLayout, alloc: &mut Allocator, out: &mut Classification) {
        if !is_memory_class(layout) {
            let pieces = classify_eightbytes(layout);
            let integers = pieces.iter().filter(|(c, _)| *c == ArgClass::Integer).count();
            let vectors = pieces.len() - integers;
            if alloc.fits(integers, vectors) {
                for (class, bytes) in pieces {
                    let storage = match class {
                        ArgClass::Integer => alloc.integer(),
                        ArgClass::Sse => alloc.vector(),
                    };
                    out.push_param(eightbyte_carrier(class, bytes), storage);
                }
                return;
            }
        }
        // MEMORY class, or not enough registers: copied onto the stack in chunks
        let mut remaining = layout.size();
        while remaining > 0 {
            let bytes = remaining.min(8);
            out.push_param(integer_carrier(bytes), alloc.stack());
            remaining -= bytes;
        }
    }

    fn classify_return(&self, ret: &ValueLayout, alloc: &mut Allocator, out: &mut Classification) {
        match ret {
            ValueLayout::Struct(layout) if is_memory_class(layout) => {
                // caller-allocated result, address passed as hidden first argument
                let storage = alloc.integer();
                out.push_param(Carrier::I64, storage);
            }
            ValueLayout::Struct(layout) => {
                let mut next_integer = 0;
                let mut next_vector = 0;
                for (class, bytes) in classify_eightbytes(layout) {
                    let reg = match class {
                        ArgClass::Integer => {
                            next_integer += 1;
                            INTEGER_RETURNS[next_integer - 1]
                        }
                        ArgClass::Sse => {
                            next_vector += 1;
                            debug_assert!(next_vector <= VECTOR_RETURN_COUNT);
                            x64::xmm(next_vector - 1)
                        }
                    };
                    out.push_return(eightbyte_carrier(class, bytes), Storage::Register(reg));
                }
            }
            scalar => {
                if let Some(carrier) = scalar.scalar_carrier() {
                    let reg = if carrier.is_float() { x64::xmm(0) } else { RAX };
                    out.push_return(carrier, Storage::Register(reg));
                }
            }
        }
    }
}

impl CallingConvention for SysV {
    fn name(&self) -> &'static str {
        "SysV x86-64"
    }

    fn special_registers(&self) -> SpecialRegisters {
        x64::SPECIAL_REGISTERS
    }

    fn trampoline_size(&self) -> usize {
        x64::TRAMPOLINE_SIZE
    }

    fn capture_order(&self) -> &'static [CapturableState] {
        &CAPTURE_ORDER
    }

    fn classify(&self, function_type: &FunctionType, allow_heap_access: bool) -> Classification {
        let mut out = Classification::default();
        let mut alloc = Allocator::new();

        if let Some(ret) = &function_type.ret {
            self.classify_return(ret, &mut alloc, &mut out);
        }

        for param in &function_type.params {
            match param {
                ValueLayout::Struct(layout) => self.classify_struct_arg(layout, &mut alloc, &mut out),
                ValueLayout::Address if allow_heap_access => {
                    out.push_param(Carrier::Object, alloc.integer());
                    out.push_param(Carrier::I64, Storage::Placeholder);
                }
                ValueLayout::F32 | ValueLayout::F64 => {
                    let carrier = param.scalar_carrier().unwrap_or(Carrier::F64);
                    out.push_param(carrier, alloc.vector());
                }
                scalar => {
                    let carrier = scalar.scalar_carrier().unwrap_or(Carrier::I64);
                    out.push_param(carrier, alloc.integer());
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::LinkOptions;

    fn params(c: &Classification) -> Vec<Storage> {
        c.params.iter().map(|(_, s)| *s).collect()
    }

    #[test]
    fn test_integer_and_float_interleave() {
        let fty = FunctionType::new(
            vec![ValueLayout::I32, ValueLayout::F64, ValueLayout::I64, ValueLayout::F32],
            Some(ValueLayout::F64),
        );
        let c = SysV.classify(&fty, false);
        assert_eq!(
            params(&c),
            vec![
                Storage::Register(RDI),
                Storage::Register(x64::xmm(0)),
                Storage::Register(RSI),
                Storage::Register(x64::xmm(1)),
            ]
        );
        assert_eq!(c.returns, vec![(Carrier::F64, Storage::Register(x64::xmm(0)))]);
    }

    #[test]
    fn test_register_exhaustion_spills_to_stack() {
        let fty = FunctionType::new(vec![ValueLayout::I64; 8], None);
        let c = SysV.classify(&fty, false);
        assert_eq!(c.params[5].1, Storage::Register(R9));
        assert_eq!(c.params[6].1, Storage::Stack { offset: 0, size: 8 });
        assert_eq!(c.params[7].1, Storage::Stack { offset: 8, size: 8 });
    }

    #[test]
    fn test_small_struct_split_into_eightbytes() {
        let point = StructLayout::new(vec![ValueLayout::I64, ValueLayout::F64]);
        let fty = FunctionType::new(vec![ValueLayout::Struct(point)], None);
        let c = SysV.classify(&fty, false);
        assert_eq!(
            c.params,
            vec![
                (Carrier::I64, Storage::Register(RDI)),
                (Carrier::F64, Storage::Register(x64::xmm(0))),
            ]
        );
    }

    #[test]
    fn test_packed_floats_share_one_sse_eightbyte() {
        let pair = StructLayout::new(vec![ValueLayout::F32, ValueLayout::F32, ValueLayout::F32]);
        let fty = FunctionType::new(vec![ValueLayout::Struct(pair)], None);
        let c = SysV.classify(&fty, false);
        assert_eq!(
            c.params,
            vec![
                (Carrier::F64, Storage::Register(x64::xmm(0))),
                (Carrier::F32, Storage::Register(x64::xmm(1))),
            ]
        );
    }

    #[test]
    fn test_large_struct_goes_to_stack() {
        let big = StructLayout::new(vec![ValueLayout::I64, ValueLayout::I64, ValueLayout::I32]);
        let fty = FunctionType::new(vec![ValueLayout::Struct(big), ValueLayout::I32], None);
        let c = SysV.classify(&fty, false);
        assert_eq!(c.params.len(), 4);
        assert_eq!(c.params[0].1, Storage::Stack { offset: 0, size: 8 });
        assert_eq!(c.params[2], (Carrier::I64, Storage::Stack { offset: 16, size: 8 }));
        assert_eq!(c.params[3].1, Storage::Register(RDI));
    }

    #[test]
    fn test_two_register_struct_return_needs_buffer() {
        let pair = StructLayout::new(vec![ValueLayout::I64, ValueLayout::F64]);
        let fty = FunctionType::new(vec![ValueLayout::I32], Some(ValueLayout::Struct(pair)));
        let arr = SysV.assign(&fty, &LinkOptions::default()).unwrap();
        assert_eq!(arr.return_storage, vec![Storage::Register(RAX), Storage::Register(x64::xmm(0))]);
        assert_eq!(arr.parameter_storage[0], Storage::Placeholder);
        assert_eq!(arr.return_buffer_size, 16);
        assert_eq!(arr.signature.ret, None);
    }

    #[test]
    fn test_memory_return_uses_hidden_pointer() {
        let big = StructLayout::new(vec![ValueLayout::I64; 3]);
        let fty = FunctionType::new(vec![ValueLayout::I32], Some(ValueLayout::Struct(big)));
        let c = SysV.classify(&fty, false);
        assert!(c.returns.is_empty());
        assert_eq!(c.params[0], (Carrier::I64, Storage::Register(RDI)));
        assert_eq!(c.params[1], (Carrier::I32, Storage::Register(RSI)));
    }

    #[test]
    fn test_heap_access_address_becomes_pair() {
        let fty = FunctionType::new(vec![ValueLayout::Address, ValueLayout::I32], None);
        let c = SysV.classify(&fty, true);
        assert_eq!(
            c.params,
            vec![
                (Carrier::Object, Storage::Register(RDI)),
                (Carrier::I64, Storage::Placeholder),
                (Carrier::I32, Storage::Register(RSI)),
            ]
        );
    }
}
