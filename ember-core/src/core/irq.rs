//! Interrupt and exception path.
//!
//! Interrupts arrive as a level-sensitive request number on the `irq_req`
//! port (−1 deasserts). They are taken at the top of the slow dispatch path,
//! never mid-instruction; the only immediate effect of an injection is to
//! drop the core out of WFI. Taking an interrupt or exception clears the
//! global enable latch, so nesting is not re-entrant until `mret`/`dret`
//! restore the saved enable.
//!
//! Entry points are reached through a cached array of decoded-instruction
//! pointers: entries 0..=31 are the interrupt vectors at `base + 4*i`,
//! entries 32..=34 the exception vectors (reset, illegal, ecall) at
//! `base + 0x80/0x84/0x88`. The pointers are re-resolved whenever the vector
//! base is assigned or the instruction cache is flushed.

use super::csr::MCAUSE_IRQ_FLAG;
use super::dbg_unit::halt_cause;
use super::insn_cache::InsnRef;
use super::Core;
use crate::io::SystemBus;
use log::{trace, warn};

/// Number of cached vector pointers: 32 interrupt vectors plus 3 exception
/// vectors.
pub const VECTOR_COUNT: usize = 35;

/// Index of the first exception vector within the vector pointer array.
const EXCEPTION_SLOT_BASE: usize = 32;

/// Synchronous exceptions the core can raise.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Exception {
    /// Undecoded raw word with no matching pattern.
    Illegal,
    /// Environment call.
    Ecall,
    /// Debug entry (`ebreak` or an external debug request).
    Debug,
    /// Instruction fetch from a faulting address.
    InsnAccessFault,
    /// Data load from a faulting address.
    LoadAccessFault,
    /// Data store to a faulting address.
    StoreAccessFault,
}

impl Exception {
    /// The value written to `mcause`. Bit 31 stays clear for exceptions;
    /// environment calls write 11. Not used for [`Exception::Debug`], which
    /// goes through `depc` and leaves `mcause` untouched.
    fn mcause(self) -> u32 {
        match self {
            Self::InsnAccessFault => 1,
            Self::Illegal => 2,
            Self::Debug => 3,
            Self::LoadAccessFault => 5,
            Self::StoreAccessFault => 7,
            Self::Ecall => 11,
        }
    }

    /// The dedicated vector pointer slot, if the exception has one. The
    /// others vector through entry 0, resolved on demand.
    fn vector_slot(self) -> Option<usize> {
        match self {
            Self::Illegal => Some(EXCEPTION_SLOT_BASE + 1),
            Self::Ecall => Some(EXCEPTION_SLOT_BASE + 2),
            _ => None,
        }
    }

    /// The halt cause recorded for the debug unit.
    fn halt_cause(self) -> u32 {
        match self {
            Self::Illegal => halt_cause::ILLEGAL,
            Self::Ecall => halt_cause::ECALL,
            Self::Debug => halt_cause::EBREAK,
            Self::InsnAccessFault | Self::LoadAccessFault | Self::StoreAccessFault => {
                halt_cause::INVALID
            }
        }
    }
}

/// Interrupt request latching and vector pointer cache.
#[derive(Debug)]
pub struct IrqState {
    /// Currently requested interrupt number, −1 when none.
    pub(crate) req_irq: i32,
    /// Pending external debug request.
    pub(crate) req_debug: bool,
    /// Global interrupt enable latch (shadowed by the mstatus MIE bit).
    pub(crate) irq_enable: bool,
    /// Enable latch as it was before the last interrupt or exception entry;
    /// restored by `mret`.
    pub(crate) saved_irq_enable: bool,
    /// Enable latch as it was before debug entry; restored by `dret`.
    pub(crate) debug_saved_irq_enable: bool,
    /// Current (already masked) vector table base address.
    pub(crate) vector_base: u32,
    /// Cached decoded-instruction pointers to every entry point. `None` for
    /// slots whose address currently fails to translate.
    pub(crate) vectors: [Option<InsnRef>; VECTOR_COUNT],
    /// Cached pointer to the debug handler configured for this core.
    pub(crate) debug_handler: Option<InsnRef>,
}

impl IrqState {
    pub(crate) fn new() -> Self {
        Self {
            req_irq: -1,
            req_debug: false,
            irq_enable: false,
            saved_irq_enable: false,
            debug_saved_irq_enable: false,
            vector_base: 0,
            vectors: [None; VECTOR_COUNT],
            debug_handler: None,
        }
    }

    pub fn irq_enable(&self) -> bool {
        self.irq_enable
    }

    pub fn req_irq(&self) -> i32 {
        self.req_irq
    }
}

impl<B: SystemBus> Core<B> {
    /// Re-resolves all vector pointers for a new base address. The low 8
    /// bits of `base` are masked off; the table always starts on a 256-byte
    /// boundary.
    pub fn vector_table_set(&mut self, base: u32) {
        let base = base & !0xFF;
        trace!("setting vector table (addr: {base:#010x})");
        for i in 0..VECTOR_COUNT {
            let addr = base + 4 * i as u32;
            self.irq.vectors[i] = self.try_insn_get(addr).ok();
        }
        self.irq.vector_base = base;
    }

    /// Re-resolves every cached entry-point pointer after a cache flush.
    pub(crate) fn irq_cache_flush(&mut self) {
        self.vector_table_set(self.irq.vector_base);
        self.irq.debug_handler = self.try_insn_get(self.config.debug_handler).ok();
    }

    pub(crate) fn irq_reset(&mut self) {
        self.exec.elw_interrupted = false;
        self.irq.vector_base = 0;
        self.irq.irq_enable = false;
        self.irq.saved_irq_enable = false;
        self.irq.debug_saved_irq_enable = false;
        self.irq.req_irq = -1;
        self.irq.req_debug = false;
        self.irq.debug_handler = self.try_insn_get(self.config.debug_handler).ok();
    }

    /// Takes a pending debug request or interrupt, if any. Called at the top
    /// of the slow dispatch path. Returns `true` when an entry fired, in
    /// which case the current instruction pointer now designates the handler
    /// and the caller must not also execute an instruction this cycle.
    pub(crate) fn irq_check(&mut self) -> bool {
        if self.irq.req_debug && !self.exec.debug_mode {
            self.exec.debug_mode = true;
            self.csr.depc = self.exec.current_insn.addr();
            self.irq.debug_saved_irq_enable = self.irq.irq_enable;
            self.irq.irq_enable = false;
            self.irq.req_debug = false;
            let handler = self.debug_handler_ref();
            self.exec.current_insn = handler;
            self.prefetch_fetch(handler);
            return true;
        }
        let req_irq = self.irq.req_irq;
        if req_irq != -1 && self.irq.irq_enable {
            trace!("handling IRQ (irq: {req_irq})");

            self.csr.mepc = self.exec.current_insn.addr();
            self.irq.saved_irq_enable = self.irq.irq_enable;
            self.irq.irq_enable = false;
            self.irq.req_irq = -1;
            let vector = self.vector_ref(req_irq as usize);
            self.exec.current_insn = vector;
            self.csr.mcause = MCAUSE_IRQ_FLAG | req_irq as u32;
            self.dbg.halt_cause = halt_cause::INTERRUPT;

            trace!("acknowledging interrupt (irq: {req_irq})");
            self.bus.irq_ack(req_irq);

            // Models the pipeline flush of the taken interrupt.
            self.stall_insn_dependency_account(4);

            self.prefetch_fetch(vector);
            return true;
        }
        false
    }

    /// Raises a synchronous exception: saves the return pc and the enable
    /// latch, updates `mcause`, and returns the handler entry point that
    /// replaces the current instruction pointer.
    pub(crate) fn exception_raise(&mut self, exception: Exception) -> InsnRef {
        trace!("raising exception {exception:?}");
        self.dbg.halt_cause = exception.halt_cause();
        if exception == Exception::Debug {
            self.csr.depc = self.exec.current_insn.addr();
            self.irq.debug_saved_irq_enable = self.irq.irq_enable;
            self.irq.irq_enable = false;
            self.exec.debug_mode = true;
            return self.debug_handler_ref();
        }
        self.csr.mepc = self.exec.current_insn.addr();
        self.irq.saved_irq_enable = self.irq.irq_enable;
        self.irq.irq_enable = false;
        self.csr.mcause = exception.mcause();
        match exception.vector_slot() {
            Some(slot) => match self.irq.vectors[slot] {
                Some(vector) if self.insn_cache.is_current(vector) => vector,
                _ => self.vector_ref(0),
            },
            None => self.vector_ref(0),
        }
    }

    /// Returns from an interrupt or exception handler: restores the enable
    /// latch, clears `mcause`, and resumes at `mepc`. Execution drops back to
    /// the slow dispatch path so a pending interrupt is re-checked on the
    /// next cycle.
    pub(crate) fn irq_mret_handle(&mut self) -> InsnRef {
        self.switch_to_full_mode();
        self.irq.irq_enable = self.irq.saved_irq_enable;
        self.csr.mcause = 0;
        let mepc = self.csr.mepc;
        self.insn_get(mepc)
    }

    /// Returns from debug mode, resuming at `depc`.
    pub(crate) fn irq_dret_handle(&mut self) -> InsnRef {
        self.switch_to_full_mode();
        self.irq.irq_enable = self.irq.debug_saved_irq_enable;
        self.exec.debug_mode = false;
        let depc = self.csr.depc;
        self.insn_get(depc)
    }

    /// Handles a `wfi` instruction. The slow loop only checks for interrupts
    /// while they are globally enabled, but wfi ends as soon as one is
    /// requested even with interrupts disabled, so the sleep check looks at
    /// the raw request. Returns `true` if the core went to sleep.
    pub(crate) fn irq_wfi_handle(&mut self) -> bool {
        if self.irq.req_irq == -1 {
            self.exec.wfi = true;
            self.stalled_inc();
            return true;
        }
        false
    }

    /// Inbound `irq_req` port: latches the requested interrupt number, −1 to
    /// deassert. Wakes the core from WFI and restarts an interruptible
    /// stalled load if interrupts are enabled.
    pub fn irq_req_sync(&mut self, irq: i32) {
        trace!("received IRQ (irq: {irq})");
        self.irq.req_irq = irq;

        if irq != -1 && self.exec.wfi {
            self.exec.wfi = false;
            self.stalled_dec();
        }

        if self.exec.elw_stalled && irq != -1 && self.irq.irq_enable {
            self.elw_irq_unstall();
        }

        self.switch_to_full_mode();
    }

    /// Inbound external debug request. Taken at the next slow-path check.
    pub fn debug_req_sync(&mut self) {
        self.irq.req_debug = true;
        self.switch_to_full_mode();
        self.check_state();
    }

    /// Restarts an interruptible load that is stalled, so the interrupt can
    /// be taken with the load's own address as return pc. The instruction is
    /// replayed after the handler returns; `elw_interrupted` tells replay
    /// logic the first attempt was abandoned.
    fn elw_irq_unstall(&mut self) {
        trace!("interrupting pending interruptible load");
        if let Some(insn) = self.exec.elw_insn {
            self.exec.current_insn = insn;
        }
        self.exec.elw_stalled = false;
        self.exec.elw_interrupted = true;
        self.lsu_abandon_pending();
        self.stalled_dec();
    }

    /// Resolves the vector pointer for `slot`, falling back to an on-demand
    /// lookup when the cached pointer is missing or stale. An entry point
    /// that fails to translate halts the core; there is nowhere left to
    /// vector to.
    fn vector_ref(&mut self, slot: usize) -> InsnRef {
        if let Some(vector) = self.irq.vectors[slot] {
            if self.insn_cache.is_current(vector) {
                return vector;
            }
        }
        let addr = self.irq.vector_base + 4 * slot as u32;
        match self.try_insn_get(addr) {
            Ok(vector) => {
                self.irq.vectors[slot] = Some(vector);
                vector
            }
            Err(_) => {
                warn!("entry point at {addr:#010x} does not translate; halting core");
                self.set_halt_mode(true, halt_cause::INVALID);
                self.exec.current_insn
            }
        }
    }

    fn debug_handler_ref(&mut self) -> InsnRef {
        if let Some(handler) = self.irq.debug_handler {
            if self.insn_cache.is_current(handler) {
                return handler;
            }
        }
        let addr = self.config.debug_handler;
        match self.try_insn_get(addr) {
            Ok(handler) => {
                self.irq.debug_handler = Some(handler);
                handler
            }
            Err(_) => {
                warn!("debug handler at {addr:#010x} does not translate; halting core");
                self.set_halt_mode(true, halt_cause::INVALID);
                self.exec.current_insn
            }
        }
    }
}
