//! The execution loop.
//!
//! The loop is a clock event the core keeps re-enqueueing while it is
//! active. Two handler variants can be bound to the event: the *fast* one
//! only burns stall cycles and dispatches instructions; the *slow* one
//! additionally checks for pending interrupt/debug entries, accounts
//! performance counters, and applies the halt/step gates. The slow handler
//! rebinds the event to the fast one whenever nothing requires the extra
//! work, and everything that invalidates that decision (an interrupt
//! request, an interrupt-enable write, `mret`/`dret`) rebinds it back.
//!
//! The loop suspends (stops re-enqueueing itself) whenever the core stalls:
//! a pending memory response, WFI, debug halt, a deasserted fetch enable, or
//! the cache-flush rendezvous. External events re-evaluate the wake gate
//! through [`Core::check_state`].

use super::dbg_unit::halt_cause;
use super::insn_cache::{DecodedInsn, InsnRef};
use super::timing::event;
use super::Core;
use crate::clock::{ClockEvent, Cycles};
use crate::io::SystemBus;
use log::trace;

/// Handler payload of the core's clock events: the dispatch path is chosen
/// by rebinding this function pointer, not by any dynamic dispatch.
pub(crate) type ExecHandler<B> = fn(&mut Core<B>);

/// Mutable state of the execution loop.
#[derive(Debug)]
pub struct ExecState {
    /// The instruction the next loop iteration will execute.
    pub(crate) current_insn: InsnRef,
    /// The instruction that retired last, if any.
    pub(crate) prev_insn: Option<InsnRef>,
    pub(crate) instr_event: ClockEvent,
    pub(crate) misaligned_event: ClockEvent,
    /// `true` while the loop event keeps re-enqueueing itself.
    pub(crate) active: bool,
    /// Counting stall gate; the loop is suspended while nonzero.
    pub(crate) stalled: u32,
    pub(crate) wfi: bool,
    pub(crate) halted: bool,
    pub(crate) step_mode: bool,
    /// Lets exactly one instruction through the halt gate after a step
    /// resume.
    pub(crate) do_step: bool,
    pub(crate) debug_mode: bool,
    /// Clock gating input; the loop cannot wake while inactive.
    pub(crate) clock_active: bool,
    pub(crate) fetch_enable: bool,
    /// `true` between a cache-flush request and the platform's acknowledge.
    pub(crate) cache_sync: bool,
    /// An interruptible load is stalled and may be restarted by an enabled
    /// interrupt.
    pub(crate) elw_stalled: bool,
    /// The restarted interruptible load is being replayed.
    pub(crate) elw_interrupted: bool,
    pub(crate) elw_insn: Option<InsnRef>,
    /// Boot address as last driven on the `bootaddr` port.
    pub(crate) bootaddr: u32,
    /// Extra cycles charged when the loop wakes from a stall, carrying the
    /// latency of the response that released it.
    pub(crate) wakeup_latency: Cycles,
}

impl ExecState {
    pub fn halted(&self) -> bool {
        self.halted
    }

    pub fn wfi(&self) -> bool {
        self.wfi
    }

    pub fn stalled(&self) -> bool {
        self.stalled > 0
    }

    pub fn debug_mode(&self) -> bool {
        self.debug_mode
    }

    /// Address of the instruction the core will execute next.
    pub fn pc(&self) -> u32 {
        self.current_insn.addr()
    }
}

/// Fast dispatch: burn a stall cycle or execute one instruction, fetch the
/// next, re-enqueue.
pub(crate) fn exec_instr<B: SystemBus>(core: &mut Core<B>) {
    trace!(
        "handling instruction with fast handler (stall_cycles: {})",
        core.timing.stall_cycles()
    );
    if core.timing.stall_cycles == 0 {
        if let Some((current, insn)) = core.resolve_current() {
            let next = (insn.handler)(core, &insn);
            core.exec.prev_insn = Some(current);
            core.exec.current_insn = next;
            // Fetch ahead; an asynchronous response stalls the loop and the
            // next instruction executes when it arrives.
            core.prefetch_fetch(next);
        }
    } else {
        core.timing.stall_cycles -= 1;
    }
    core.exec_reenqueue();
}

/// Slow dispatch: everything the fast path does, plus the interrupt/debug
/// check, performance counter accounting, and the halt/step gates.
pub(crate) fn exec_instr_check_all<B: SystemBus>(core: &mut Core<B>) {
    trace!("handling instruction with slow handler");
    if core.timing.stall_cycles == 0 {
        // Switch back to the optimized handler only if nothing needs the
        // slow path anymore; HW counters in particular are only maintained
        // here.
        if core.can_switch_to_fast_mode() {
            let loop_event = core.exec.instr_event;
            core.clock.rebind(loop_event, exec_instr::<B>);
        }
        core.perf_event_account(event::CYCLES, 1);
        // Don't execute an instruction if an entry was taken and triggered a
        // pending fetch, or if the entry check itself stalled the core.
        if !core.irq_check() && core.exec.stalled == 0 {
            if let Some((current, insn)) = core.resolve_current() {
                let next = (insn.handler)(core, &insn);
                core.exec.prev_insn = Some(current);
                core.exec.current_insn = next;
                core.prefetch_fetch(next);
                if !core.exec.halted {
                    core.insn_account(&insn);
                }
            }
        }
        core.dbg_step_check();
    } else {
        core.timing.stall_cycles -= 1;
        core.perf_event_account(event::CYCLES, 1);
    }
    core.exec_reenqueue();
}

impl<B: SystemBus> Core<B> {
    /// Resolves the current instruction pointer into an entry, re-looking it
    /// up by address when a flush made it stale. Returns `None` when the
    /// re-resolution had to refetch asynchronously; the loop resumes once
    /// the response arrives.
    fn resolve_current(&mut self) -> Option<(InsnRef, DecodedInsn<B>)> {
        let current = self.exec.current_insn;
        if let Some(insn) = self.insn_cache.insn(current) {
            return Some((current, *insn));
        }
        let current = self.insn_get(current.addr());
        self.exec.current_insn = current;
        self.prefetch_fetch(current);
        if self.exec.stalled > 0 {
            return None;
        }
        self.insn_cache.insn(current).map(|insn| (current, *insn))
    }

    fn exec_reenqueue(&mut self) {
        if self.exec.active {
            let loop_event = self.exec.instr_event;
            self.clock.enqueue(loop_event, 1);
        }
    }

    fn can_switch_to_fast_mode(&self) -> bool {
        !self.exec.step_mode && !self.perf_counters_active() && self.dbg.breakpoints.is_empty()
    }

    /// Forces subsequent loop iterations through the slow dispatch path, so
    /// pending interrupt/debug entries are re-checked.
    pub(crate) fn switch_to_full_mode(&mut self) {
        let loop_event = self.exec.instr_event;
        self.clock.rebind(loop_event, exec_instr_check_all::<B>);
    }

    /// Suspends the loop: the event is cancelled and will not re-enqueue
    /// until the matching [`Core::stalled_dec`] brings the gate back to zero.
    pub(crate) fn stalled_inc(&mut self) {
        self.exec.stalled += 1;
        if self.exec.stalled == 1 {
            self.exec.active = false;
            let loop_event = self.exec.instr_event;
            self.clock.cancel(loop_event);
        }
    }

    pub(crate) fn stalled_dec(&mut self) {
        debug_assert!(self.exec.stalled > 0, "unbalanced stall release");
        self.exec.stalled = self.exec.stalled.saturating_sub(1);
        if self.exec.stalled == 0 {
            self.check_state();
        }
    }

    /// Re-evaluates the wake/sleep gate after any state change that could
    /// start or stop the loop. Every evaluation drops back to the slow
    /// dispatch path; the slow handler switches to fast again when it can.
    pub(crate) fn check_state(&mut self) {
        self.switch_to_full_mode();
        if !self.exec.active {
            if !self.exec.halted
                && self.exec.fetch_enable
                && self.exec.clock_active
                && self.exec.stalled == 0
                && (!self.exec.wfi || self.irq.req_irq != -1)
            {
                self.exec.wfi = false;
                self.exec.active = true;
                if self.exec.step_mode {
                    self.exec.do_step = true;
                }
                let delay = 1 + self.exec.wakeup_latency;
                let loop_event = self.exec.instr_event;
                self.clock.enqueue(loop_event, delay);
                self.perf_event_account(event::CYCLES, self.exec.wakeup_latency);
                self.exec.wakeup_latency = 0;
            }
        } else {
            if self.exec.halted && !self.exec.do_step {
                self.exec.active = false;
                self.halt_core();
            } else if self.exec.wfi {
                if self.irq.req_irq == -1 {
                    self.exec.active = false;
                } else {
                    self.exec.wfi = false;
                }
            }
            if !self.exec.active {
                let loop_event = self.exec.instr_event;
                self.clock.cancel(loop_event);
            }
        }
    }

    /// Latches the halt-time program counters for the debug unit.
    fn halt_core(&mut self) {
        trace!("halting core");
        self.dbg.npc = self.exec.current_insn.addr();
        self.dbg.ppc = self.exec.prev_insn.map(InsnRef::addr).unwrap_or(0);
    }

    /// Raises the step halt after each instruction executed in step mode.
    fn dbg_step_check(&mut self) {
        if self.exec.step_mode && !self.exec.debug_mode {
            self.exec.do_step = false;
            self.dbg.hit_reg |= 1;
            self.set_halt_mode(true, halt_cause::STEP);
        }
    }

    /// Re-points the core at `addr`: resolves the decoded entry and forces a
    /// refetch, since the loop fetches the current instruction in advance.
    pub(crate) fn pc_set(&mut self, addr: u32) {
        let insn = self.insn_get(addr);
        self.exec.current_insn = insn;
        self.prefetch_fetch(insn);
    }

    /// Inbound `bootaddr` port. Also re-resolves the vector table, which
    /// always lives at the 256-byte-aligned base of the boot address.
    pub fn bootaddr_sync(&mut self, value: u32) {
        trace!("setting boot address (value: {value:#010x})");
        self.exec.bootaddr = value;
        self.vector_table_set(value);
    }

    /// Inbound `fetchen` port. A rising edge points the core at
    /// `bootaddr + bootaddr_offset` and releases it; a falling edge stalls
    /// it.
    pub fn fetchen_sync(&mut self, active: bool) {
        trace!("setting fetch enable (active: {active})");
        let was_active = self.exec.fetch_enable;
        self.exec.fetch_enable = active;
        if !was_active && active {
            let target = self.exec.bootaddr.wrapping_add(self.config.bootaddr_offset);
            self.pc_set(target);
            self.stalled_dec();
        } else if was_active && !active {
            // A falling edge stalls the core to prevent it from executing.
            self.stalled_inc();
        }
    }

    /// Inbound clock gating port; the loop is suppressed while the clock is
    /// inactive.
    pub fn clock_sync(&mut self, active: bool) {
        trace!("setting clock (active: {active})");
        self.exec.clock_active = active;
        if active {
            self.check_state();
        } else if self.exec.active {
            self.exec.active = false;
            let loop_event = self.exec.instr_event;
            self.clock.cancel(loop_event);
        }
    }

    /// Starts the two-phase cache-flush handshake: raises the request on the
    /// bus and stalls until [`Core::flush_cache_ack_sync`].
    pub fn cache_flush_request(&mut self) {
        if !self.exec.cache_sync {
            self.exec.cache_sync = true;
            self.stalled_inc();
            self.bus.flush_cache_req();
        }
    }

    /// Inbound acknowledge of the cache-flush handshake; releases the
    /// rendezvous stall.
    pub fn flush_cache_ack_sync(&mut self, _active: bool) {
        if self.exec.cache_sync {
            self.exec.cache_sync = false;
            self.stalled_dec();
        }
    }
}
