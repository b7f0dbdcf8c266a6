//! Memory-mapped debug slave.
//!
//! The debug unit exposes halt/step control, the halt cause, the GPRs and
//! CSRs, and the next/previous program counters through a word-addressed
//! register window. It also owns the software breakpoints: a breakpoint
//! swaps the cache entry's handler for a trap that halts the core, and is
//! re-armed after every cache flush (flushing recreates entries in the
//! *undecoded* state, dropping the trap with them).
//!
//! Register access while the core is running is rejected for everything that
//! reads or writes architectural state; such an access reports `Invalid` and
//! logs a warning, but never kills the core.

use super::insn_cache::{DecodedInsn, InsnRef};
use super::regfile::{Specifier, LEN};
use super::Core;
use crate::io::IoStatus;
use crate::io::SystemBus;
use bitvec::{order::Lsb0, view::BitView};
use log::{trace, warn};

/// Halt causes reported at [`offset::CAUSE`].
pub mod halt_cause {
    pub const EBREAK: u32 = 0;
    pub const ECALL: u32 = 1;
    pub const ILLEGAL: u32 = 2;
    pub const INVALID: u32 = 3;
    pub const INTERRUPT: u32 = 4;
    pub const HALT: u32 = 15;
    pub const STEP: u32 = 15;
}

/// Offsets of the debug register window.
pub mod offset {
    /// Control: bit 0 is step mode, bit 16 is halt.
    pub const CTRL: u32 = 0x0000;
    /// Bitmap of last halt reasons; bit 0 set on step.
    pub const HIT: u32 = 0x0004;
    /// Read-only halt cause.
    pub const CAUSE: u32 = 0x000C;
    /// 32 GPRs, one word each. Halted access only.
    pub const GPR_BASE: u32 = 0x0400;
    pub const GPR_LAST: u32 = 0x047C;
    /// Next program counter. Writing re-points the core, even if asleep.
    pub const NPC: u32 = 0x2000;
    /// Previous program counter (read-only).
    pub const PPC: u32 = 0x2004;
    /// CSRs by specifier (`offset / 4`), up to 0x7FFC.
    pub const CSR_BASE: u32 = 0x4000;
    pub const CSR_LAST: u32 = 0x7FFC;
}

const CTRL_STEP_BIT: usize = 0;
const CTRL_HALT_BIT: usize = 16;

/// Debug unit state.
#[derive(Debug, Default)]
pub(crate) struct DbgUnit {
    pub(crate) halt_cause: u32,
    pub(crate) hit_reg: u32,
    /// Address of the next instruction, latched when the core halts.
    pub(crate) npc: u32,
    /// Address of the previously executed instruction, latched on halt.
    pub(crate) ppc: u32,
    /// Addresses with an armed software breakpoint.
    pub(crate) breakpoints: Vec<u32>,
}

impl DbgUnit {
    pub(crate) fn new() -> Self {
        Self::default()
    }
}

impl<B: SystemBus> Core<B> {
    /// Access to the memory-mapped debug register window. Only word-sized,
    /// word-aligned accesses are defined; anything else reports
    /// [`IoStatus::Invalid`].
    pub fn dbg_unit_req(&mut self, offset: u32, data: &mut [u8], is_write: bool) -> IoStatus {
        trace!(
            "debug unit access (offset: {offset:#x}, size: {:#x}, is_write: {is_write})",
            data.len()
        );
        if data.len() != 4 || offset & 3 != 0 {
            return IoStatus::Invalid;
        }
        let value = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        let read = |data: &mut [u8], value: u32| data.copy_from_slice(&value.to_le_bytes());

        match offset {
            offset::CTRL => {
                if is_write {
                    let bits = value.view_bits::<Lsb0>();
                    let step_mode = bits[CTRL_STEP_BIT];
                    let halt = bits[CTRL_HALT_BIT];
                    trace!("writing DBG_CTRL (value: {value:#x}, halt: {halt}, step: {step_mode})");
                    self.exec.step_mode = step_mode;
                    self.set_halt_mode(halt, halt_cause::HALT);
                } else {
                    read(data, (self.exec.halted as u32) << 16 | self.exec.step_mode as u32);
                }
            }
            offset::HIT => {
                if is_write {
                    self.dbg.hit_reg = value;
                } else {
                    read(data, self.dbg.hit_reg);
                }
            }
            offset::CAUSE => {
                if is_write {
                    return IoStatus::Invalid;
                }
                read(data, self.dbg.halt_cause);
            }
            offset::GPR_BASE..=offset::GPR_LAST => {
                if !self.exec.halted {
                    warn!("trying to access GPR while core is not halted");
                    return IoStatus::Invalid;
                }
                let reg = (offset - offset::GPR_BASE) / 4;
                debug_assert!(reg < LEN as u32);
                let specifier = Specifier::new(reg).expect("the window covers exactly 32 GPRs");
                if is_write {
                    self.regfile.set_x(specifier, value);
                } else {
                    read(data, self.regfile.x(specifier));
                }
            }
            offset::NPC => {
                if !self.exec.halted {
                    warn!("trying to access debug registers while core is not halted");
                    return IoStatus::Invalid;
                }
                if is_write {
                    // Re-points the core to the written pc, even if asleep.
                    // Self-modifying code may have motivated the jump, so the
                    // decoded state is dropped wholesale.
                    self.cache_flush();
                    self.dbg.npc = value;
                    self.pc_set(value);
                    self.exec.wfi = false;
                    self.check_state();
                } else {
                    read(data, self.dbg.npc);
                }
            }
            offset::PPC => {
                if !self.exec.halted {
                    warn!("trying to access debug registers while core is not halted");
                    return IoStatus::Invalid;
                }
                if is_write {
                    return IoStatus::Invalid;
                }
                read(data, self.dbg.ppc);
            }
            offset::CSR_BASE..=offset::CSR_LAST => {
                let specifier = ((offset - offset::CSR_BASE) / 4) as u16;
                let result = if is_write {
                    self.csr_write(specifier, value)
                } else {
                    match self.csr_read(specifier) {
                        Ok(csr_value) => {
                            read(data, csr_value);
                            Ok(())
                        }
                        Err(err) => Err(err),
                    }
                };
                if result.is_err() {
                    return IoStatus::Invalid;
                }
            }
            _ => return IoStatus::Invalid,
        }
        IoStatus::Ok
    }

    /// Inbound external halt request port.
    pub fn halt_sync(&mut self, halted: bool) {
        trace!("received halt signal sync (halted: {halted})");
        self.set_halt_mode(halted, halt_cause::HALT);
    }

    /// Moves the core in or out of debug halt, reporting the transition on
    /// the halt-status port.
    pub(crate) fn set_halt_mode(&mut self, halted: bool, cause: u32) {
        self.dbg.halt_cause = cause;
        if self.exec.halted != halted {
            self.exec.halted = halted;
            self.bus.halt_status(halted);
        }
        self.check_state();
    }

    /// Arms a software breakpoint: the cache entry's handler is swapped for a
    /// trap that halts the core without executing the instruction.
    pub fn breakpoint_insert(&mut self, addr: u32) {
        if !self.dbg.breakpoints.contains(&addr) {
            self.dbg.breakpoints.push(addr);
        }
        if let Ok(insn) = self.try_insn_get(addr) {
            self.insn_cache.breakpoint_insert(insn, breakpoint_trap::<B>);
        }
    }

    /// Disarms a software breakpoint, restoring the original handler.
    pub fn breakpoint_remove(&mut self, addr: u32) {
        self.dbg.breakpoints.retain(|&armed| armed != addr);
        if let Ok(insn) = self.try_insn_get(addr) {
            self.insn_cache.breakpoint_remove(insn);
        }
    }

    /// Re-arms every software breakpoint after a cache flush dropped the trap
    /// handlers along with the entries.
    pub(crate) fn dbg_enable_all_breakpoints(&mut self) {
        for addr in std::mem::take(&mut self.dbg.breakpoints) {
            self.breakpoint_insert(addr);
        }
    }
}

/// Trap handler armed over a cache entry by [`Core::breakpoint_insert`].
/// Halts without retiring; the current instruction stays put so the debugger
/// observes the breakpoint address as NPC.
pub(crate) fn breakpoint_trap<B: SystemBus>(core: &mut Core<B>, insn: &DecodedInsn<B>) -> InsnRef {
    trace!("hit software breakpoint at {:#010x}", insn.addr);
    core.set_halt_mode(true, halt_cause::EBREAK);
    core.insn_get(insn.addr)
}
