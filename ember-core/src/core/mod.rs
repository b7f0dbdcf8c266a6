//! The simulated core: an event-driven, cycle-accountable interpreter for a
//! 32-bit RISC-V variant.
//!
//! [`Core`] composes the subsystems (decoded-instruction cache, prefetcher,
//! decoder, register and CSR files, interrupt path, timing, load/store unit,
//! debug unit, and the execution loop) around a per-core [`Clock`]. The
//! platform embeds a core by implementing [`SystemBus`] for its outbound
//! ports and driving the inbound `*_sync`/`*_response` methods plus
//! [`Core::step`].

pub mod csr;
pub mod dbg_unit;
pub mod decode;
pub mod exec;
mod execute;
pub mod insn_cache;
pub mod irq;
mod lsu;
mod prefetch;
pub mod regfile;
pub mod timing;

#[cfg(test)]
pub(crate) mod tests;

use crate::clock::{Clock, Cycles};
use crate::io::{SystemBus, TranslationFault};
use csr::{CsrError, CsrFile, CsrSpecifier};
use decode::{Decode, Isa, IsaError};
use exec::{ExecHandler, ExecState};
use insn_cache::{DecodedInsn, InsnCache, InsnRef};
use irq::IrqState;
use log::trace;
use lsu::Lsu;
use prefetch::Prefetcher;
use regfile::Regfile;
use timing::Timing;

pub use irq::Exception;
pub use lsu::LoadKind;

use dbg_unit::DbgUnit;

/// Per-core configuration, injected at construction. There is no process-wide
/// mutable configuration state.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the `bootaddr` register resets to. The vector table base is
    /// the 256-byte-aligned base of this address.
    pub boot_addr: u32,
    /// Offset added to the boot address to form the entry pc.
    pub bootaddr_offset: u32,
    /// Initial state of the fetch-enable gate. While deasserted, the core
    /// stays stalled until a rising edge on the `fetchen` port.
    pub fetch_enable: bool,
    /// Together with [`Config::core_id`] composes the hart id:
    /// `mhartid = (cluster_id << 5) | core_id`.
    pub cluster_id: u32,
    pub core_id: u32,
    /// ISA string selecting decoder extensions, e.g. `"rv32imc"`.
    pub isa: String,
    /// Entry point of the debug handler the core vectors to on debug entry.
    pub debug_handler: u32,
    /// Additional plain read/write CSR specifiers backed by sparse storage.
    pub extra_csrs: Vec<CsrSpecifier>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            boot_addr: 0,
            bootaddr_offset: 0,
            fetch_enable: true,
            cluster_id: 0,
            core_id: 0,
            isa: "rv32imc".to_string(),
            debug_handler: 0x1A11_0800,
            extra_csrs: Vec::new(),
        }
    }
}

impl Config {
    pub fn mhartid(&self) -> u32 {
        (self.cluster_id << 5) | self.core_id
    }
}

/// A simulatable core instance.
///
/// All architectural state is owned by the core and mutated only by its
/// handlers; the outbound ports on `B` read or enqueue but never re-enter
/// instruction execution.
#[derive(Debug)]
pub struct Core<B: SystemBus> {
    pub(crate) config: Config,
    pub(crate) bus: B,
    pub(crate) clock: Clock<ExecHandler<B>>,
    pub(crate) decode: Decode,
    pub(crate) insn_cache: InsnCache<B>,
    pub(crate) regfile: Regfile,
    pub(crate) csr: CsrFile,
    pub(crate) irq: IrqState,
    pub(crate) timing: Timing,
    pub(crate) exec: ExecState,
    pub(crate) lsu: Lsu,
    pub(crate) prefetch: Prefetcher,
    pub(crate) dbg: DbgUnit,
}

impl<B: SystemBus> Core<B> {
    /// Builds a core in the reset-asserted state. Drive
    /// [`reset`](Self::reset)`(false)` to point it at the boot address and
    /// let [`check_state`](Self::check_state) start the loop.
    pub fn new(config: Config, bus: B) -> Result<Self, IsaError> {
        let isa = Isa::parse(&config.isa)?;
        let mut clock = Clock::new();
        let instr_event = clock.new_event(exec::exec_instr_check_all::<B> as ExecHandler<B>);
        let misaligned_event = clock.new_event(lsu::exec_misaligned::<B> as ExecHandler<B>);

        let mut insn_cache = InsnCache::new(decode::decode_on_demand::<B>);
        let entry_pc = config.boot_addr.wrapping_add(config.bootaddr_offset);
        let current_insn = insn_cache.get(entry_pc, entry_pc);

        let exec = ExecState {
            current_insn,
            prev_insn: None,
            instr_event,
            misaligned_event,
            active: false,
            stalled: if config.fetch_enable { 0 } else { 1 },
            wfi: false,
            halted: false,
            step_mode: false,
            do_step: false,
            debug_mode: false,
            clock_active: true,
            fetch_enable: config.fetch_enable,
            cache_sync: false,
            elw_stalled: false,
            elw_interrupted: false,
            elw_insn: None,
            bootaddr: config.boot_addr,
            wakeup_latency: 0,
        };

        let mut core = Self {
            csr: CsrFile::new(config.extra_csrs.iter().copied()),
            config,
            bus,
            clock,
            decode: Decode::new(isa),
            insn_cache,
            regfile: Regfile::new(),
            irq: IrqState::new(),
            timing: Timing::new(),
            exec,
            lsu: Lsu::new(),
            prefetch: Prefetcher::new(),
            dbg: DbgUnit::new(),
        };
        core.irq_reset();
        Ok(core)
    }

    /// Drives the hardware reset input. Asserting clears the architectural
    /// state (the decoded-instruction cache persists across resets);
    /// deasserting points the core at `bootaddr + bootaddr_offset`,
    /// re-resolves the vector table, and starts the loop if the fetch gate
    /// allows it.
    pub fn reset(&mut self, active: bool) {
        if active {
            trace!("reset asserted");
            let instr_event = self.exec.instr_event;
            let misaligned_event = self.exec.misaligned_event;
            self.clock.cancel(instr_event);
            self.clock.cancel(misaligned_event);
            self.regfile = Regfile::new();
            self.csr.reset();
            self.timing = Timing::new();
            self.lsu.reset();
            self.prefetch = Prefetcher::new();
            self.exec.prev_insn = None;
            self.exec.active = false;
            self.exec.stalled = if self.config.fetch_enable { 0 } else { 1 };
            self.exec.wfi = false;
            self.exec.halted = false;
            self.exec.step_mode = false;
            self.exec.do_step = false;
            self.exec.debug_mode = false;
            self.exec.cache_sync = false;
            self.exec.elw_stalled = false;
            self.exec.elw_interrupted = false;
            self.exec.elw_insn = None;
            self.exec.fetch_enable = self.config.fetch_enable;
            self.exec.bootaddr = self.config.boot_addr;
            self.exec.wakeup_latency = 0;
            self.irq_reset();
        } else {
            trace!("reset deasserted");
            self.vector_table_set(self.exec.bootaddr);
            let entry_pc = self
                .exec
                .bootaddr
                .wrapping_add(self.config.bootaddr_offset);
            self.pc_set(entry_pc);
            self.check_state();
        }
    }

    /// Runs the next enqueued clock event, if any. Returns `false` when the
    /// core is suspended (nothing enqueued); it then only resumes through an
    /// inbound port method.
    pub fn step(&mut self) -> bool {
        match self.clock.pop_due() {
            Some(handler) => {
                handler(self);
                true
            }
            None => false,
        }
    }

    /// Current simulated time in cycles.
    pub fn cycles(&self) -> Cycles {
        self.clock.cycles()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    pub fn regfile(&self) -> &Regfile {
        &self.regfile
    }

    pub fn regfile_mut(&mut self) -> &mut Regfile {
        &mut self.regfile
    }

    pub fn exec_state(&self) -> &ExecState {
        &self.exec
    }

    pub fn irq_state(&self) -> &IrqState {
        &self.irq
    }

    pub fn timing(&self) -> &Timing {
        &self.timing
    }

    /// `true` while a split misaligned access has not completed both halves.
    pub fn misaligned_access(&self) -> bool {
        self.lsu.misaligned_access()
    }

    /// Reads a CSR. `mstatus` and `mhartid` live outside the backing file:
    /// the former shadows the interrupt-enable latch, the latter comes from
    /// the configuration.
    pub fn csr_read(&self, specifier: CsrSpecifier) -> Result<u32, CsrError> {
        match specifier {
            csr::MSTATUS => Ok(csr::mstatus_from_irq_enable(self.irq.irq_enable)),
            csr::MHARTID => Ok(self.config.mhartid()),
            _ => self.csr.read(specifier),
        }
    }

    /// Writes a CSR. An interrupt-enable write drops the loop back to the
    /// slow dispatch path so a pending request is noticed on the next cycle.
    pub fn csr_write(&mut self, specifier: CsrSpecifier, value: u32) -> Result<(), CsrError> {
        match specifier {
            csr::MSTATUS => {
                self.irq.irq_enable = csr::irq_enable_from_mstatus(value);
                self.switch_to_full_mode();
                Ok(())
            }
            _ => self.csr.write(specifier, value),
        }
    }

    /// Inbound platform notification that decoded instructions may be stale
    /// (e.g. self-modifying code was written). Drops all decoded state.
    pub fn flush_cache_sync(&mut self, _active: bool) {
        self.cache_flush();
    }

    /// Drops every page of the decoded-instruction cache and everything
    /// resolved through it: the prefetch buffer, the cached vector pointers,
    /// and armed breakpoint traps (re-armed on the fresh entries). The
    /// current instruction pointer is re-resolved and refetched.
    pub fn cache_flush(&mut self) {
        trace!("flushing decoded-instruction state");
        self.insn_cache.flush();
        self.prefetch.flush();
        self.irq_cache_flush();
        self.dbg_enable_all_breakpoints();
        let pc = self.exec.current_insn.addr();
        self.pc_set(pc);
    }

    /// Clears the current-page shortcut without dropping decoded entries.
    /// Platforms with an MMU model call this when a mapping changes.
    pub fn cache_vflush(&mut self) {
        self.insn_cache.vflush();
    }

    /// Looks up the decoded entry for `vaddr`, creating it on first touch.
    /// A failing instruction-address translation raises an
    /// instruction-access exception and returns the handler entry point
    /// instead.
    pub(crate) fn insn_get(&mut self, vaddr: u32) -> InsnRef {
        match self.try_insn_get(vaddr) {
            Ok(insn) => insn,
            Err(fault) => {
                log::warn!("{fault}; raising instruction access fault");
                self.exception_raise(Exception::InsnAccessFault)
            }
        }
    }

    pub(crate) fn try_insn_get(&mut self, vaddr: u32) -> Result<InsnRef, TranslationFault> {
        if let Some(insn) = self.insn_cache.get_current_page(vaddr) {
            return Ok(insn);
        }
        let paddr = self.bus.insn_virt_to_phys(vaddr)?;
        Ok(self.insn_cache.get(vaddr, paddr))
    }

    /// Resolves the sequential successor of `insn`, preferring its
    /// speculative `next` link when it is still current.
    pub(crate) fn insn_next(&mut self, insn: &DecodedInsn<B>) -> InsnRef {
        match insn.next {
            Some(next) if self.insn_cache.is_current(next) => next,
            _ => self.insn_get(insn.addr.wrapping_add(insn.size as u32)),
        }
    }
}
