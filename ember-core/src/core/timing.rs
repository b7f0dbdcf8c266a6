//! Cycle accounting: stall cycles and performance counter events.
//!
//! Stall cycles model pipeline and functional-unit latency: the execution
//! loop burns them one per clock event before the next instruction retires.
//!
//! The performance counters are the `pccr` CSRs, gated by the `pcmr` mode
//! register (global enable) and the `pcer` event mask. They only advance on
//! the slow dispatch path; enabling them forces the loop out of fast mode.

use super::csr::{PCCR_COUNT, PCMR_ACTIVE};
use super::insn_cache::DecodedInsn;
use super::Core;
use crate::clock::Cycles;
use crate::io::SystemBus;
use bitvec::{order::Lsb0, view::BitView};

/// Performance counter event numbers, indexing both the `pcer` mask and the
/// `pccr` counter array.
pub mod event {
    /// Active cycles.
    pub const CYCLES: usize = 0;
    /// Retired instructions.
    pub const INSTR: usize = 1;
    /// Cycles stalled on load interlocks.
    pub const LD_STALL: usize = 2;
    /// Cycles stalled on jumps and taken branches.
    pub const JMP_STALL: usize = 3;
    /// Cycles stalled on instruction fetch misses.
    pub const IMISS: usize = 4;
    /// Retired loads.
    pub const LD: usize = 5;
    /// Retired stores.
    pub const ST: usize = 6;
    /// Retired unconditional jumps.
    pub const JUMP: usize = 7;
    /// Retired conditional branches.
    pub const BRANCH: usize = 8;
    /// Retired conditional branches that were taken.
    pub const TAKEN_BRANCH: usize = 9;
    /// Retired compressed instructions.
    pub const RVC: usize = 10;
}

const_assert!(event::RVC < PCCR_COUNT);

/// Mutable timing state of the core.
#[derive(Debug, Clone, Default)]
pub struct Timing {
    /// Cycles left to burn before the next instruction retires.
    pub(crate) stall_cycles: Cycles,
}

impl Timing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stall_cycles(&self) -> Cycles {
        self.stall_cycles
    }
}

impl<B: SystemBus> Core<B> {
    /// Returns `true` if any performance counter event is enabled, which
    /// forces the slow dispatch path.
    pub(crate) fn perf_counters_active(&self) -> bool {
        self.csr.pcmr & PCMR_ACTIVE != 0 && self.csr.pcer != 0
    }

    /// Adds `count` to the counter of `event`, if counting is globally
    /// enabled and the event is selected in `pcer`.
    pub(crate) fn perf_event_account(&mut self, event: usize, count: Cycles) {
        if self.csr.pcmr & PCMR_ACTIVE != 0 && self.csr.pcer.view_bits::<Lsb0>()[event] {
            self.csr.pccr[event] = self.csr.pccr[event].wrapping_add(count as u32);
        }
    }

    /// Accounts one retired instruction.
    pub(crate) fn insn_account(&mut self, insn: &DecodedInsn<B>) {
        self.perf_event_account(event::INSTR, 1);
        if insn.size == 2 {
            self.perf_event_account(event::RVC, 1);
        }
    }

    /// Inserts stall cycles for an instruction-dependency hazard (e.g. the
    /// iterative divider).
    pub(crate) fn stall_insn_dependency_account(&mut self, cycles: Cycles) {
        self.timing.stall_cycles += cycles;
    }

    /// Inserts stall cycles for a load that completed with a latency.
    pub(crate) fn stall_load_account(&mut self, cycles: Cycles) {
        self.timing.stall_cycles += cycles;
        self.perf_event_account(event::LD_STALL, cycles);
    }

    /// Accounts the pipeline flush of an unconditional jump.
    pub(crate) fn stall_jump_account(&mut self) {
        self.timing.stall_cycles += 1;
        self.perf_event_account(event::JMP_STALL, 1);
    }

    /// Accounts the pipeline flush of a taken conditional branch.
    pub(crate) fn stall_taken_branch_account(&mut self) {
        self.timing.stall_cycles += 2;
        self.perf_event_account(event::JMP_STALL, 2);
    }

    /// Accounts an instruction fetch that missed the prefetch buffer.
    pub(crate) fn stall_fetch_account(&mut self, cycles: Cycles) {
        self.timing.stall_cycles += cycles;
        self.perf_event_account(event::IMISS, cycles);
    }
}
