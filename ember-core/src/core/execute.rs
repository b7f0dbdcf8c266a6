//! Per-instruction execute handlers.
//!
//! Each handler has the [`InsnHandler`](super::insn_cache::InsnHandler)
//! signature: it executes one decoded instruction against the core and
//! returns the reference to the next instruction (the sequential successor,
//! a branch target, or an exception vector). Handlers are installed into
//! cache entries by the decoder and never re-decode.

use super::insn_cache::{DecodedInsn, InsnRef};
use super::irq::Exception;
use super::lsu::LoadKind;
use super::timing::event;
use super::Core;
use crate::io::SystemBus;
use crate::unit;

// Register-immediate and register-register operations

/// Executes an `addi` instruction.
///
/// > ADDI adds the sign-extended 12-bit immediate to register rs1. Arithmetic
/// > overflow is ignored and the result is simply the low XLEN bits of the
/// > result.
pub(crate) fn addi<B: SystemBus>(core: &mut Core<B>, insn: &DecodedInsn<B>) -> InsnRef {
    reg_imm_op(core, insn, |s, imm| s.wrapping_add_signed(imm))
}

/// Executes a `slti` instruction.
///
/// > SLTI (set less than immediate) places the value 1 in register rd if
/// > register rs1 is less than the sign-extended immediate when both are
/// > treated as signed numbers, else 0 is written to rd.
pub(crate) fn slti<B: SystemBus>(core: &mut Core<B>, insn: &DecodedInsn<B>) -> InsnRef {
    reg_imm_op(core, insn, |s, imm| ((s as i32) < imm) as u32)
}

/// Executes a `sltiu` instruction (compare as unsigned numbers, with the
/// immediate first sign-extended to XLEN bits).
pub(crate) fn sltiu<B: SystemBus>(core: &mut Core<B>, insn: &DecodedInsn<B>) -> InsnRef {
    reg_imm_op(core, insn, |s, imm| (s < imm as u32) as u32)
}

pub(crate) fn xori<B: SystemBus>(core: &mut Core<B>, insn: &DecodedInsn<B>) -> InsnRef {
    reg_imm_op(core, insn, |s, imm| s ^ imm as u32)
}

pub(crate) fn ori<B: SystemBus>(core: &mut Core<B>, insn: &DecodedInsn<B>) -> InsnRef {
    reg_imm_op(core, insn, |s, imm| s | imm as u32)
}

pub(crate) fn andi<B: SystemBus>(core: &mut Core<B>, insn: &DecodedInsn<B>) -> InsnRef {
    reg_imm_op(core, insn, |s, imm| s & imm as u32)
}

/// Executes a `slli` instruction. The decoder guarantees the shift amount in
/// `imm` fits in 5 bits.
pub(crate) fn slli<B: SystemBus>(core: &mut Core<B>, insn: &DecodedInsn<B>) -> InsnRef {
    reg_imm_op(core, insn, |s, imm| s << imm)
}

pub(crate) fn srli<B: SystemBus>(core: &mut Core<B>, insn: &DecodedInsn<B>) -> InsnRef {
    reg_imm_op(core, insn, |s, imm| s >> imm)
}

pub(crate) fn srai<B: SystemBus>(core: &mut Core<B>, insn: &DecodedInsn<B>) -> InsnRef {
    reg_imm_op(core, insn, |s, imm| ((s as i32) >> imm) as u32)
}

/// Executes a `lui` instruction.
///
/// > LUI places the U-immediate value in the top 20 bits of the destination
/// > register rd, filling in the lowest 12 bits with zeros.
pub(crate) fn lui<B: SystemBus>(core: &mut Core<B>, insn: &DecodedInsn<B>) -> InsnRef {
    core.regfile.set_x(insn.rd, insn.imm as u32 & !0xFFF);
    core.insn_next(insn)
}

/// Executes an `auipc` instruction.
///
/// > AUIPC forms a 32-bit offset from the 20-bit U-immediate, filling in the
/// > lowest 12 bits with zeros, adds this offset to the address of the AUIPC
/// > instruction, then places the result in register rd.
pub(crate) fn auipc<B: SystemBus>(core: &mut Core<B>, insn: &DecodedInsn<B>) -> InsnRef {
    let result = insn.addr.wrapping_add_signed(insn.imm & !0xFFF);
    core.regfile.set_x(insn.rd, result);
    core.insn_next(insn)
}

pub(crate) fn add<B: SystemBus>(core: &mut Core<B>, insn: &DecodedInsn<B>) -> InsnRef {
    reg_reg_op(core, insn, |s1, s2| s1.wrapping_add(s2))
}

pub(crate) fn sub<B: SystemBus>(core: &mut Core<B>, insn: &DecodedInsn<B>) -> InsnRef {
    reg_reg_op(core, insn, |s1, s2| s1.wrapping_sub(s2))
}

pub(crate) fn slt<B: SystemBus>(core: &mut Core<B>, insn: &DecodedInsn<B>) -> InsnRef {
    reg_reg_op(core, insn, |s1, s2| ((s1 as i32) < (s2 as i32)) as u32)
}

pub(crate) fn sltu<B: SystemBus>(core: &mut Core<B>, insn: &DecodedInsn<B>) -> InsnRef {
    reg_reg_op(core, insn, |s1, s2| (s1 < s2) as u32)
}

pub(crate) fn xor<B: SystemBus>(core: &mut Core<B>, insn: &DecodedInsn<B>) -> InsnRef {
    reg_reg_op(core, insn, |s1, s2| s1 ^ s2)
}

pub(crate) fn or<B: SystemBus>(core: &mut Core<B>, insn: &DecodedInsn<B>) -> InsnRef {
    reg_reg_op(core, insn, |s1, s2| s1 | s2)
}

pub(crate) fn and<B: SystemBus>(core: &mut Core<B>, insn: &DecodedInsn<B>) -> InsnRef {
    reg_reg_op(core, insn, |s1, s2| s1 & s2)
}

pub(crate) fn sll<B: SystemBus>(core: &mut Core<B>, insn: &DecodedInsn<B>) -> InsnRef {
    reg_reg_op(core, insn, |s1, s2| s1 << (s2 & 0x1F))
}

pub(crate) fn srl<B: SystemBus>(core: &mut Core<B>, insn: &DecodedInsn<B>) -> InsnRef {
    reg_reg_op(core, insn, |s1, s2| s1 >> (s2 & 0x1F))
}

pub(crate) fn sra<B: SystemBus>(core: &mut Core<B>, insn: &DecodedInsn<B>) -> InsnRef {
    reg_reg_op(core, insn, |s1, s2| ((s1 as i32) >> (s2 & 0x1F)) as u32)
}

// Jumps and branches

pub(crate) fn jal<B: SystemBus>(core: &mut Core<B>, insn: &DecodedInsn<B>) -> InsnRef {
    core.regfile
        .set_x(insn.rd, insn.addr.wrapping_add(insn.size as u32));
    core.perf_event_account(event::JUMP, 1);
    core.stall_jump_account();
    core.insn_get(insn.target)
}

pub(crate) fn jalr<B: SystemBus>(core: &mut Core<B>, insn: &DecodedInsn<B>) -> InsnRef {
    let target = core.regfile.x(insn.rs1).wrapping_add_signed(insn.imm) & !1;
    core.regfile
        .set_x(insn.rd, insn.addr.wrapping_add(insn.size as u32));
    core.perf_event_account(event::JUMP, 1);
    core.stall_jump_account();
    core.insn_get(target)
}

pub(crate) fn beq<B: SystemBus>(core: &mut Core<B>, insn: &DecodedInsn<B>) -> InsnRef {
    cond_branch(core, insn, |s1, s2| s1 == s2)
}

pub(crate) fn bne<B: SystemBus>(core: &mut Core<B>, insn: &DecodedInsn<B>) -> InsnRef {
    cond_branch(core, insn, |s1, s2| s1 != s2)
}

pub(crate) fn blt<B: SystemBus>(core: &mut Core<B>, insn: &DecodedInsn<B>) -> InsnRef {
    cond_branch(core, insn, |s1, s2| (s1 as i32) < (s2 as i32))
}

pub(crate) fn bge<B: SystemBus>(core: &mut Core<B>, insn: &DecodedInsn<B>) -> InsnRef {
    cond_branch(core, insn, |s1, s2| (s1 as i32) >= (s2 as i32))
}

pub(crate) fn bltu<B: SystemBus>(core: &mut Core<B>, insn: &DecodedInsn<B>) -> InsnRef {
    cond_branch(core, insn, |s1, s2| s1 < s2)
}

pub(crate) fn bgeu<B: SystemBus>(core: &mut Core<B>, insn: &DecodedInsn<B>) -> InsnRef {
    cond_branch(core, insn, |s1, s2| s1 >= s2)
}

// Loads and stores

pub(crate) fn lb<B: SystemBus>(core: &mut Core<B>, insn: &DecodedInsn<B>) -> InsnRef {
    load_op(core, insn, unit::BYTE, LoadKind::Byte)
}

pub(crate) fn lbu<B: SystemBus>(core: &mut Core<B>, insn: &DecodedInsn<B>) -> InsnRef {
    load_op(core, insn, unit::BYTE, LoadKind::ByteUnsigned)
}

pub(crate) fn lh<B: SystemBus>(core: &mut Core<B>, insn: &DecodedInsn<B>) -> InsnRef {
    load_op(core, insn, unit::HALFWORD, LoadKind::Halfword)
}

pub(crate) fn lhu<B: SystemBus>(core: &mut Core<B>, insn: &DecodedInsn<B>) -> InsnRef {
    load_op(core, insn, unit::HALFWORD, LoadKind::HalfwordUnsigned)
}

pub(crate) fn lw<B: SystemBus>(core: &mut Core<B>, insn: &DecodedInsn<B>) -> InsnRef {
    load_op(core, insn, unit::WORD, LoadKind::Word)
}

pub(crate) fn sb<B: SystemBus>(core: &mut Core<B>, insn: &DecodedInsn<B>) -> InsnRef {
    store_op(core, insn, unit::BYTE)
}

pub(crate) fn sh<B: SystemBus>(core: &mut Core<B>, insn: &DecodedInsn<B>) -> InsnRef {
    store_op(core, insn, unit::HALFWORD)
}

pub(crate) fn sw<B: SystemBus>(core: &mut Core<B>, insn: &DecodedInsn<B>) -> InsnRef {
    store_op(core, insn, unit::WORD)
}

/// Since only one hart lives behind the data port, `fence` degenerates to a
/// nop.
pub(crate) fn fence<B: SystemBus>(core: &mut Core<B>, insn: &DecodedInsn<B>) -> InsnRef {
    core.insn_next(insn)
}

// Multiply / divide

pub(crate) fn mul<B: SystemBus>(core: &mut Core<B>, insn: &DecodedInsn<B>) -> InsnRef {
    reg_reg_op(core, insn, |s1, s2| s1.wrapping_mul(s2))
}

pub(crate) fn mulh<B: SystemBus>(core: &mut Core<B>, insn: &DecodedInsn<B>) -> InsnRef {
    reg_reg_op(core, insn, |s1, s2| {
        ((s1 as i32 as i64 * s2 as i32 as i64) >> 32) as u32
    })
}

pub(crate) fn mulhsu<B: SystemBus>(core: &mut Core<B>, insn: &DecodedInsn<B>) -> InsnRef {
    reg_reg_op(core, insn, |s1, s2| {
        ((s1 as i32 as i64 * s2 as i64) >> 32) as u32
    })
}

pub(crate) fn mulhu<B: SystemBus>(core: &mut Core<B>, insn: &DecodedInsn<B>) -> InsnRef {
    reg_reg_op(core, insn, |s1, s2| {
        ((s1 as u64 * s2 as u64) >> 32) as u32
    })
}

/// Executes a `div` instruction.
///
/// Division by zero yields all-ones; overflow (`INT_MIN / -1`) yields
/// `INT_MIN`. The stall cycles model an early-termination divider: they grow
/// with the number of leading zero bits of the divisor magnitude.
pub(crate) fn div<B: SystemBus>(core: &mut Core<B>, insn: &DecodedInsn<B>) -> InsnRef {
    let divisor = core.regfile.x(insn.rs2) as i32;
    let dividend = core.regfile.x(insn.rs1) as i32;
    let result = match divisor {
        0 => -1,
        _ => dividend.wrapping_div(divisor),
    };
    core.regfile.set_x(insn.rd, result as u32);
    core.stall_insn_dependency_account(div_cycles(divisor));
    core.insn_next(insn)
}

/// Executes a `rem` instruction. Mirrors [`div`]: remainder of a zero divisor
/// is the dividend, remainder of the overflow case is zero.
pub(crate) fn rem<B: SystemBus>(core: &mut Core<B>, insn: &DecodedInsn<B>) -> InsnRef {
    let divisor = core.regfile.x(insn.rs2) as i32;
    let dividend = core.regfile.x(insn.rs1) as i32;
    let result = match divisor {
        0 => dividend,
        _ => dividend.wrapping_rem(divisor),
    };
    core.regfile.set_x(insn.rd, result as u32);
    core.stall_insn_dependency_account(div_cycles(divisor));
    core.insn_next(insn)
}

pub(crate) fn divu<B: SystemBus>(core: &mut Core<B>, insn: &DecodedInsn<B>) -> InsnRef {
    let divisor = core.regfile.x(insn.rs2);
    let dividend = core.regfile.x(insn.rs1);
    let result = match divisor {
        0 => u32::MAX,
        _ => dividend / divisor,
    };
    core.regfile.set_x(insn.rd, result);
    core.stall_insn_dependency_account(divisor.leading_zeros() as u64 + 3);
    core.insn_next(insn)
}

pub(crate) fn remu<B: SystemBus>(core: &mut Core<B>, insn: &DecodedInsn<B>) -> InsnRef {
    let divisor = core.regfile.x(insn.rs2);
    let dividend = core.regfile.x(insn.rs1);
    let result = match divisor {
        0 => dividend,
        _ => dividend % divisor,
    };
    core.regfile.set_x(insn.rd, result);
    core.stall_insn_dependency_account(divisor.leading_zeros() as u64 + 3);
    core.insn_next(insn)
}

/// Stall cycles of the signed divider: `clz(divisor) + 3` for a positive
/// divisor, `clz(-divisor) + 2` for a negative one, a single cycle for zero.
fn div_cycles(divisor: i32) -> u64 {
    match divisor {
        0 => 1,
        d if d > 0 => (d as u32).leading_zeros() as u64 + 3,
        d => (d.wrapping_neg() as u32).leading_zeros() as u64 + 2,
    }
}

// System instructions

pub(crate) fn csrrw<B: SystemBus>(core: &mut Core<B>, insn: &DecodedInsn<B>) -> InsnRef {
    let src = core.regfile.x(insn.rs1);
    csr_op(core, insn, true, move |_| src)
}

pub(crate) fn csrrs<B: SystemBus>(core: &mut Core<B>, insn: &DecodedInsn<B>) -> InsnRef {
    let mask = core.regfile.x(insn.rs1);
    csr_op(core, insn, mask != 0, move |old| old | mask)
}

pub(crate) fn csrrc<B: SystemBus>(core: &mut Core<B>, insn: &DecodedInsn<B>) -> InsnRef {
    let mask = core.regfile.x(insn.rs1);
    csr_op(core, insn, mask != 0, move |old| old & !mask)
}

/// The immediate CSR forms carry their 5-bit immediate in the `rs1` field.
pub(crate) fn csrrwi<B: SystemBus>(core: &mut Core<B>, insn: &DecodedInsn<B>) -> InsnRef {
    let src = u8::from(insn.rs1) as u32;
    csr_op(core, insn, true, move |_| src)
}

pub(crate) fn csrrsi<B: SystemBus>(core: &mut Core<B>, insn: &DecodedInsn<B>) -> InsnRef {
    let mask = u8::from(insn.rs1) as u32;
    csr_op(core, insn, mask != 0, move |old| old | mask)
}

pub(crate) fn csrrci<B: SystemBus>(core: &mut Core<B>, insn: &DecodedInsn<B>) -> InsnRef {
    let mask = u8::from(insn.rs1) as u32;
    csr_op(core, insn, mask != 0, move |old| old & !mask)
}

pub(crate) fn ecall<B: SystemBus>(core: &mut Core<B>, insn: &DecodedInsn<B>) -> InsnRef {
    let _ = insn;
    core.exception_raise(Exception::Ecall)
}

pub(crate) fn ebreak<B: SystemBus>(core: &mut Core<B>, insn: &DecodedInsn<B>) -> InsnRef {
    let _ = insn;
    core.exception_raise(Exception::Debug)
}

pub(crate) fn mret<B: SystemBus>(core: &mut Core<B>, insn: &DecodedInsn<B>) -> InsnRef {
    let _ = insn;
    core.irq_mret_handle()
}

pub(crate) fn dret<B: SystemBus>(core: &mut Core<B>, insn: &DecodedInsn<B>) -> InsnRef {
    let _ = insn;
    core.irq_dret_handle()
}

/// While suspended the current instruction pointer stays on the `wfi`
/// itself, so an accepted interrupt records it as the return pc and the
/// handler's `mret` resumes the wait in place. With a request already
/// pending the instruction falls through; the interrupt is taken on the next
/// cycle.
pub(crate) fn wfi<B: SystemBus>(core: &mut Core<B>, insn: &DecodedInsn<B>) -> InsnRef {
    match core.irq_wfi_handle() {
        true => core.insn_get(insn.addr),
        false => core.insn_next(insn),
    }
}

/// Installed by the decoder for any word with no matching pattern. The
/// exception is raised at execution time, in program order.
pub(crate) fn illegal<B: SystemBus>(core: &mut Core<B>, insn: &DecodedInsn<B>) -> InsnRef {
    let _ = insn;
    core.exception_raise(Exception::Illegal)
}

// Private generic implementations

fn reg_imm_op<B: SystemBus, F>(core: &mut Core<B>, insn: &DecodedInsn<B>, op: F) -> InsnRef
where
    F: FnOnce(u32, i32) -> u32,
{
    let result = op(core.regfile.x(insn.rs1), insn.imm);
    core.regfile.set_x(insn.rd, result);
    core.insn_next(insn)
}

fn reg_reg_op<B: SystemBus, F>(core: &mut Core<B>, insn: &DecodedInsn<B>, op: F) -> InsnRef
where
    F: FnOnce(u32, u32) -> u32,
{
    let result = op(core.regfile.x(insn.rs1), core.regfile.x(insn.rs2));
    core.regfile.set_x(insn.rd, result);
    core.insn_next(insn)
}

// Takes the branch if `predicate` returns `true`.
fn cond_branch<B: SystemBus, P>(core: &mut Core<B>, insn: &DecodedInsn<B>, predicate: P) -> InsnRef
where
    P: FnOnce(u32, u32) -> bool,
{
    core.perf_event_account(event::BRANCH, 1);
    if predicate(core.regfile.x(insn.rs1), core.regfile.x(insn.rs2)) {
        core.perf_event_account(event::TAKEN_BRANCH, 1);
        core.stall_taken_branch_account();
        core.insn_get(insn.target)
    } else {
        core.insn_next(insn)
    }
}

fn load_op<B: SystemBus>(
    core: &mut Core<B>,
    insn: &DecodedInsn<B>,
    size: u32,
    kind: LoadKind,
) -> InsnRef {
    let addr = core.regfile.x(insn.rs1).wrapping_add_signed(insn.imm);
    match core.lsu_load(insn.rd, addr, size, kind) {
        Some(vector) => vector,
        None => core.insn_next(insn),
    }
}

fn store_op<B: SystemBus>(core: &mut Core<B>, insn: &DecodedInsn<B>, size: u32) -> InsnRef {
    let addr = core.regfile.x(insn.rs1).wrapping_add_signed(insn.imm);
    let value = core.regfile.x(insn.rs2);
    match core.lsu_store(addr, value, size) {
        Some(vector) => vector,
        None => core.insn_next(insn),
    }
}

/// Shared CSR read-modify-write. `write` selects whether the register is
/// written at all (the set/clear forms skip the write side effects for a zero
/// mask).
fn csr_op<B: SystemBus, F>(
    core: &mut Core<B>,
    insn: &DecodedInsn<B>,
    write: bool,
    new_value: F,
) -> InsnRef
where
    F: FnOnce(u32) -> u32,
{
    let specifier = insn.imm as u16;
    let old = match core.csr_read(specifier) {
        Ok(old) => old,
        Err(_) => return core.exception_raise(Exception::Illegal),
    };
    if write {
        if let Err(_err) = core.csr_write(specifier, new_value(old)) {
            return core.exception_raise(Exception::Illegal);
        }
    }
    core.regfile.set_x(insn.rd, old);
    core.insn_next(insn)
}
