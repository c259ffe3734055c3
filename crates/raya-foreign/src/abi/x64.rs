//! x86-64 registers and the upcall trampoline template
//!
//! Both supported calling conventions run on x86-64 and share the register
//! file and the trampoline encoding; they differ only in which registers
//! carry which arguments.

use super::{Register, RegisterClass, SpecialRegisters};

pub const RAX: Register = Register::integer(0);
pub const RCX: Register = Register::integer(1);
pub const RDX: Register = Register::integer(2);
pub const RBX: Register = Register::integer(3);
pub const RSP: Register = Register::integer(4);
pub const RBP: Register = Register::integer(5);
pub const RSI: Register = Register::integer(6);
pub const RDI: Register = Register::integer(7);
pub const R8: Register = Register::integer(8);
pub const R9: Register = Register::integer(9);
pub const R10: Register = Register::integer(10);
pub const R11: Register = Register::integer(11);
pub const R12: Register = Register::integer(12);
pub const R13: Register = Register::integer(13);
pub const R14: Register = Register::integer(14);
pub const R15: Register = Register::integer(15);

/// `xmm{index}`
pub const fn xmm(index: u8) -> Register {
    Register::vector(index)
}

const INTEGER_NAMES: [&str; 16] = [
    "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11", "r12", "r13",
    "r14", "r15",
];

const VECTOR_NAMES: [&str; 16] = [
    "xmm0", "xmm1", "xmm2", "xmm3", "xmm4", "xmm5", "xmm6", "xmm7", "xmm8", "xmm9", "xmm10",
    "xmm11", "xmm12", "xmm13", "xmm14", "xmm15",
];

pub fn register_name(reg: Register) -> &'static str {
    let table = match reg.class {
        RegisterClass::Integer => &INTEGER_NAMES,
        RegisterClass::Vector => &VECTOR_NAMES,
    };
    table.get(reg.index as usize).copied().unwrap_or("?")
}

/// Scratch registers used around the call boundary. All of them are
/// caller-saved and carry no arguments in either convention.
pub const SPECIAL_REGISTERS: SpecialRegisters = SpecialRegisters {
    call_target: R10,
    capture_buffer: R11,
    trampoline_isolate: R10,
    trampoline_closure: R11,
    trampoline_scratch: RAX,
};

/// Bytes per trampoline slot
pub const TRAMPOLINE_SIZE: usize = 32;

const INT3: u8 = 0xCC;

/// Write one trampoline into `out`:
///
/// ```text
/// mov  isolate_reg, imm64     ; isolate identity
/// mov  closure_reg, imm64     ; &closure cell
/// mov  scratch_reg, imm64     ; &stub cell
/// jmp  qword ptr [scratch_reg]
/// ```
///
/// Remaining bytes are filled with `int3`. Returns the encoded length.
pub fn emit_trampoline(
    out: &mut [u8],
    regs: &SpecialRegisters,
    isolate: u64,
    closure_cell: u64,
    stub_cell: u64,
) -> usize {
    let mut code = Vec::with_capacity(TRAMPOLINE_SIZE);
    encode_mov_imm64(&mut code, regs.trampoline_isolate, isolate);
    encode_mov_imm64(&mut code, regs.trampoline_closure, closure_cell);
    encode_mov_imm64(&mut code, regs.trampoline_scratch, stub_cell);
    encode_jmp_indirect(&mut code, regs.trampoline_scratch);

    if code.len() > out.len() {
        crate::error::invariant_violation(format!(
            "trampoline template needs {} bytes, slot has {}",
            code.len(),
            out.len()
        ));
    }
    out[..code.len()].copy_from_slice(&code);
    out[code.len()..].fill(INT3);
    code.len()
}

/// `mov r64, imm64` (REX.W B8+r io)
fn encode_mov_imm64(code: &mut Vec<u8>, reg: Register, imm: u64) {
    let idx = reg.index;
    code.push(0x48 | (idx >> 3));
    code.push(0xB8 + (idx & 7));
    code.extend_from_slice(&imm.to_le_bytes());
}

/// `jmp qword ptr [r64]` (FF /4)
fn encode_jmp_indirect(code: &mut Vec<u8>, reg: Register) {
    let idx = reg.index;
    if idx >= 8 {
        code.push(0x41);
    }
    code.push(0xFF);
    match idx & 7 {
        // rsp/r12 need a SIB byte
        4 => {
            code.push(0x24);
            code.push(0x24);
        }
        // rbp/r13 have no disp-less form
        5 => {
            code.push(0x65);
            code.push(0x00);
        }
        low => code.push(0x20 | low),
    }
}
