//! Single-line instruction prefetch buffer.
//!
//! The prefetcher materialises the raw bytes of the next-to-execute
//! instruction into its cache entry before the entry's handler runs. A small
//! aligned line buffer amortises the fetch cost across sequentially decoded
//! instructions; a refill that the platform answers asynchronously stalls
//! the execution loop until [`Core::fetch_response`] arrives.
//!
//! A 32-bit instruction straddling the line end is materialised with two
//! refills. A refill that faults raises an instruction-access exception.

use super::dbg_unit::halt_cause;
use super::insn_cache::InsnRef;
use super::irq::Exception;
use super::Core;
use crate::clock::Cycles;
use crate::io::{IoResult, SystemBus};
use log::{trace, warn};

/// Size in bytes of the fetch buffer; one line of the instruction memory.
pub(crate) const LINE_BYTES: usize = 16;

#[derive(Debug)]
pub(crate) struct Prefetcher {
    buffer: [u8; LINE_BYTES],
    /// Base address the buffer currently holds, aligned to `LINE_BYTES`.
    base: u32,
    valid: bool,
    /// Instruction whose materialisation is waiting on a refill response.
    pending: Option<InsnRef>,
    /// Base address of the refill in flight.
    refill_base: u32,
    /// Low parcel of a straddling instruction, latched while the refill for
    /// its high parcel replaces the line it was read from.
    pending_low: Option<(u32, u16)>,
}

/// Why a halfword could not be produced synchronously.
enum FetchFail {
    /// Refill in flight; the core must stall.
    Pending,
    /// The fetch faulted at the recorded address.
    Fault(u32),
}

impl Prefetcher {
    pub(crate) fn new() -> Self {
        Self {
            buffer: [0; LINE_BYTES],
            base: 0,
            valid: false,
            pending: None,
            refill_base: 0,
            pending_low: None,
        }
    }

    /// Invalidates the buffer contents.
    pub(crate) fn flush(&mut self) {
        self.valid = false;
    }
}

impl<B: SystemBus> Core<B> {
    /// Ensures the raw bytes of `insn` are materialised into its cache
    /// entry. If a refill response is pending the loop is stalled; it
    /// resumes from [`Core::fetch_response`].
    pub(crate) fn prefetch_fetch(&mut self, insn: InsnRef) {
        let was_pending = self.prefetch.pending.is_some();
        let done = self.prefetch_resume(insn);
        match (done, was_pending) {
            (false, false) => self.stalled_inc(),
            (true, true) => self.stalled_dec(),
            _ => {}
        }
    }

    /// Inbound response for an earlier pending fetch refill: `data` holds the
    /// requested line.
    pub fn fetch_response(&mut self, data: &[u8], latency: Cycles) {
        trace!("fetch response (latency: {latency})");
        let Some(insn) = self.prefetch.pending.take() else {
            trace!("ignoring fetch response with no pending refill");
            return;
        };
        let n = data.len().min(LINE_BYTES);
        self.prefetch.buffer[..n].copy_from_slice(&data[..n]);
        self.prefetch.base = self.prefetch.refill_base;
        self.prefetch.valid = true;
        self.exec.wakeup_latency = latency;
        if self.prefetch_resume(insn) {
            self.stalled_dec();
        }
    }

    /// Drives the materialisation of `insn` as far as possible, vectoring
    /// through the exception path on a faulting fetch. Returns `false` when
    /// an asynchronous refill is in flight.
    fn prefetch_resume(&mut self, insn: InsnRef) -> bool {
        let mut insn = insn;
        loop {
            match self.prefetch_try(insn) {
                Ok(true) => {
                    self.prefetch.pending = None;
                    return true;
                }
                Ok(false) => {
                    self.prefetch.pending = Some(insn);
                    return false;
                }
                Err(fault_addr) => {
                    warn!("instruction fetch fault at {fault_addr:#010x}");
                    let vector = self.exception_raise(Exception::InsnAccessFault);
                    if vector.addr() == insn.addr() {
                        // The vector itself is unfetchable; give up and halt.
                        self.set_halt_mode(true, halt_cause::INVALID);
                        self.prefetch.pending = None;
                        return true;
                    }
                    self.exec.current_insn = vector;
                    insn = vector;
                }
            }
        }
    }

    /// Attempts to materialise the opcode of `insn` from the buffer. Returns
    /// `Ok(false)` when a refill went asynchronous, `Err(addr)` on a faulting
    /// fetch.
    fn prefetch_try(&mut self, insn: InsnRef) -> Result<bool, u32> {
        let addr = insn.addr();
        let low = match self.prefetch.pending_low {
            Some((low_addr, low)) if low_addr == addr => low,
            _ => match self.prefetch_halfword(addr) {
                Ok(halfword) => halfword,
                Err(FetchFail::Pending) => return Ok(false),
                Err(FetchFail::Fault(fault_addr)) => return Err(fault_addr),
            },
        };
        let opcode = if low & 0b11 == 0b11 {
            // 32-bit instruction: the high parcel may live in the next line,
            // in which case the refill replaces the line the low parcel came
            // from; latch it so an asynchronous refill can pick up here.
            let high = match self.prefetch_halfword(addr.wrapping_add(2)) {
                Ok(halfword) => halfword,
                Err(FetchFail::Pending) => {
                    self.prefetch.pending_low = Some((addr, low));
                    return Ok(false);
                }
                Err(FetchFail::Fault(fault_addr)) => {
                    self.prefetch.pending_low = None;
                    return Err(fault_addr);
                }
            };
            (high as u32) << 16 | low as u32
        } else {
            low as u32
        };
        self.prefetch.pending_low = None;
        if let Some(entry) = self.insn_cache.insn_mut(insn) {
            entry.opcode = opcode;
        }
        Ok(true)
    }

    fn prefetch_halfword(&mut self, addr: u32) -> Result<u16, FetchFail> {
        let covered = self.prefetch.valid
            && addr >= self.prefetch.base
            && addr.wrapping_add(2) <= self.prefetch.base.wrapping_add(LINE_BYTES as u32);
        if !covered {
            self.prefetch_refill(addr & !(LINE_BYTES as u32 - 1))?;
        }
        let offset = (addr - self.prefetch.base) as usize;
        Ok(u16::from_le_bytes([
            self.prefetch.buffer[offset],
            self.prefetch.buffer[offset + 1],
        ]))
    }

    fn prefetch_refill(&mut self, base: u32) -> Result<(), FetchFail> {
        trace!("refilling fetch buffer (base: {base:#010x})");
        self.prefetch.valid = false;
        self.prefetch.refill_base = base;
        let mut line = [0u8; LINE_BYTES];
        match self.bus.fetch_req(base, &mut line) {
            IoResult::Ok { latency } => {
                self.prefetch.buffer = line;
                self.prefetch.base = base;
                self.prefetch.valid = true;
                if latency > 0 {
                    self.stall_fetch_account(latency);
                }
                Ok(())
            }
            IoResult::Pending => Err(FetchFail::Pending),
            IoResult::Invalid => Err(FetchFail::Fault(base)),
        }
    }
}
