//! Microsoft x64 calling convention (Windows)
//!
//! Four positional argument slots; slot `i` is either the `i`-th integer or
//! the `i`-th vector register depending on the argument type. The caller
//! reserves a 32-byte shadow area below the stack arguments.

use super::x64::{self, RAX, RCX, RDX, R8, R9};
use super::{CallingConvention, Classification, Register, SpecialRegisters, Storage};
use crate::capture::CapturableState;
use crate::layout::{Carrier, FunctionType, ValueLayout};

const INTEGER_ARGS: [Register; 4] = [RCX, RDX, R8, R9];
const SHADOW_SPACE: u32 = 32;
const STACK_SLOT: u32 = 8;

const CAPTURE_ORDER: [CapturableState; 3] = [
    CapturableState::GetLastError,
    CapturableState::WsaGetLastError,
    CapturableState::Errno,
];

/// Microsoft x64
#[derive(Debug, Clone, Copy, Default)]
pub struct Win64;

/// Positional slot allocator
struct Slots {
    next: usize,
}

impl Slots {
    fn integer(&mut self) -> Storage {
        let pos = self.take();
        match INTEGER_ARGS.get(pos) {
            Some(reg) => Storage::Register(*reg),
            None => stack_slot(pos),
        }
    }

    fn vector(&mut self) -> Storage {
        let pos = self.take();
        if pos < INTEGER_ARGS.len() {
            Storage::Register(x64::xmm(pos as u8))
        } else {
            stack_slot(pos)
        }
    }

    fn take(&mut self) -> usize {
        self.next += 1;
        self.next - 1
    }
}

fn stack_slot(pos: usize) -> Storage {
    Storage::Stack {
        offset: SHADOW_SPACE + (pos - INTEGER_ARGS.len()) as u32 * STACK_SLOT,
        size: STACK_SLOT as u8,
    }
}

/// Structs of exactly 1, 2, 4 or 8 bytes travel as integers
fn struct_as_integer(size: usize) -> Option<Carrier> {
    match size {
        1 => Some(Carrier::I8),
        2 => Some(Carrier::I16),
        4 => Some(Carrier::I32),
        8 => Some(Carrier::I64),
        _ => None,
    }
}

impl CallingConvention for Win64 {
    fn name(&self) -> &'static str {
        "Win64 x86-64"
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

    fn reinterprets_floats_in_integer_registers(&self) -> bool {
        true
    }

    fn classify(&self, function_type: &FunctionType, allow_heap_access: bool) -> Classification {
        let mut out = Classification::default();
        let mut slots = Slots { next: 0 };

        match &function_type.ret {
            Some(ValueLayout::Struct(layout)) => match struct_as_integer(layout.size()) {
                Some(carrier) => out.push_return(carrier, Storage::Register(RAX)),
                None => {
                    // hidden result pointer takes the first positional slot
                    let storage = slots.integer();
                    out.push_param(Carrier::I64, storage);
                }
            },
            Some(scalar) => {
                if let Some(carrier) = scalar.scalar_carrier() {
                    let reg = if carrier.is_float() { x64::xmm(0) } else { RAX };
                    out.push_return(carrier, Storage::Register(reg));
                }
            }
            None => {}
        }

        for (index, param) in function_type.params.iter().enumerate() {
            match param {
                ValueLayout::Struct(layout) => {
                    // larger structs are passed by reference to a caller copy
                    let carrier = struct_as_integer(layout.size()).unwrap_or(Carrier::I64);
                    out.push_param(carrier, slots.integer());
                }
                ValueLayout::Address if allow_heap_access => {
                    out.push_param(Carrier::Object, slots.integer());
                    out.push_param(Carrier::I64, Storage::Placeholder);
                }
                ValueLayout::F32 | ValueLayout::F64 => {
                    let carrier = param.scalar_carrier().unwrap_or(Carrier::F64);
                    // variadic floats go in the integer register of their slot
                    let storage = if function_type.is_variadic_param(index) {
                        slots.integer()
                    } else {
                        slots.vector()
                    };
                    out.push_param(carrier, storage);
                }
                scalar => {
                    let carrier = scalar.scalar_carrier().unwrap_or(Carrier::I64);
                    out.push_param(carrier, slots.integer());
                }
            }
        }
        out
    }
}
