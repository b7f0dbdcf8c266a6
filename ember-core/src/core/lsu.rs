//! Load/store unit: aligned and misaligned data accesses.
//!
//! An aligned request is a single transaction on the data port. A request
//! crossing a natural word boundary is split into two aligned halves: the
//! first goes out immediately, the second is performed by an internal
//! continuation event one latency later. The outer operation behaves as
//! *pending* either way; the execution loop resumes only once every half has
//! completed.
//!
//! Completion of an asynchronous access runs a recorded callback that
//! finishes the architectural side of the instruction (writing the loaded
//! value with the right extension) before the loop is released.

use super::insn_cache::InsnRef;
use super::irq::Exception;
use super::regfile::Specifier;
use super::timing::event;
use super::Core;
use crate::clock::Cycles;
use crate::io::{IoResult, SystemBus};
use crate::Alignment;
use log::trace;

/// Destination extension of a pending load.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum LoadKind {
    Byte,
    ByteUnsigned,
    Halfword,
    HalfwordUnsigned,
    Word,
}

impl LoadKind {
    fn extend(self, buf: &[u8; 4]) -> u32 {
        match self {
            Self::Byte => buf[0] as i8 as i32 as u32,
            Self::ByteUnsigned => buf[0] as u32,
            Self::Halfword => u16::from_le_bytes([buf[0], buf[1]]) as i16 as i32 as u32,
            Self::HalfwordUnsigned => u16::from_le_bytes([buf[0], buf[1]]) as u32,
            Self::Word => u32::from_le_bytes(*buf),
        }
    }
}

/// The architectural operation awaiting completion of its memory access.
#[derive(Debug, Copy, Clone)]
struct PendingOp {
    rd: Specifier,
    /// `None` for stores, which have no architectural completion.
    kind: Option<LoadKind>,
    /// Data bytes: the value to store, or the loaded bytes as they arrive.
    buf: [u8; 4],
}

/// Bookkeeping for the second half of a split access.
#[derive(Debug, Copy, Clone)]
struct Misaligned {
    /// Address of the second aligned half.
    addr: u32,
    /// Size in bytes of the second half.
    size: u32,
    /// Offset of the second half's bytes within [`PendingOp::buf`].
    offset: u32,
    is_write: bool,
    /// `true` once the first half's data is in hand.
    first_done: bool,
}

#[derive(Debug, Default)]
pub(crate) struct Lsu {
    pending: Option<PendingOp>,
    misaligned: Option<Misaligned>,
}

impl Lsu {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn reset(&mut self) {
        self.pending = None;
        self.misaligned = None;
    }

    /// `true` while a split access has not completed both halves.
    pub(crate) fn misaligned_access(&self) -> bool {
        self.misaligned.is_some()
    }
}

/// Returns `true` if `addr..addr+size` straddles a natural word boundary.
fn crosses_word_boundary(addr: u32, size: u32) -> bool {
    Alignment::WORD.align_down(addr) != Alignment::WORD.align_down(addr.wrapping_add(size - 1))
}

impl<B: SystemBus> Core<B> {
    /// Issues a data load of `size` bytes. Returns `Some(vector)` when the
    /// access faulted and the exception path replaces the current
    /// instruction; `None` otherwise (the access completed, or the core is
    /// now stalled awaiting the response).
    pub(crate) fn lsu_load(
        &mut self,
        rd: Specifier,
        addr: u32,
        size: u32,
        kind: LoadKind,
    ) -> Option<InsnRef> {
        self.perf_event_account(event::LD, 1);
        if crosses_word_boundary(addr, size) {
            return self.lsu_misaligned_req(rd, Some(kind), addr, size, [0; 4]);
        }
        let mut buf = [0u8; 4];
        match self.bus.data_req(addr, &mut buf[..size as usize], false) {
            IoResult::Ok { latency } => {
                self.regfile.set_x(rd, kind.extend(&buf));
                if latency > 0 {
                    self.stall_load_account(latency);
                }
                None
            }
            IoResult::Pending => {
                self.lsu.pending = Some(PendingOp {
                    rd,
                    kind: Some(kind),
                    buf,
                });
                self.stalled_inc();
                None
            }
            IoResult::Invalid => Some(self.exception_raise(Exception::LoadAccessFault)),
        }
    }

    /// Variant of [`Self::lsu_load`] for interruptible (event-load style)
    /// accesses: while the access is pending, an enabled interrupt may
    /// abandon it and restart the instruction after the handler returns.
    /// Exposed for vendor-extension decoders.
    pub fn lsu_load_interruptible(
        &mut self,
        rd: Specifier,
        addr: u32,
        size: u32,
        kind: LoadKind,
    ) -> Option<InsnRef> {
        let stalled_before = self.exec.stalled;
        let result = self.lsu_load(rd, addr, size, kind);
        if self.exec.stalled > stalled_before {
            self.exec.elw_stalled = true;
            self.exec.elw_insn = Some(self.exec.current_insn);
        }
        result
    }

    /// Issues a data store of the low `size` bytes of `value`.
    pub(crate) fn lsu_store(&mut self, addr: u32, value: u32, size: u32) -> Option<InsnRef> {
        self.perf_event_account(event::ST, 1);
        let mut buf = value.to_le_bytes();
        if crosses_word_boundary(addr, size) {
            return self.lsu_misaligned_req(Specifier::X0, None, addr, size, buf);
        }
        match self.bus.data_req(addr, &mut buf[..size as usize], true) {
            IoResult::Ok { latency } => {
                if latency > 0 {
                    self.stall_insn_dependency_account(latency);
                }
                None
            }
            IoResult::Pending => {
                self.lsu.pending = Some(PendingOp {
                    rd: Specifier::X0,
                    kind: None,
                    buf,
                });
                self.stalled_inc();
                None
            }
            IoResult::Invalid => Some(self.exception_raise(Exception::StoreAccessFault)),
        }
    }

    /// Splits a word-boundary-crossing access into two aligned halves and
    /// performs the first. The second is carried out by the misaligned
    /// continuation event, or chained off the first half's response when that
    /// is asynchronous.
    fn lsu_misaligned_req(
        &mut self,
        rd: Specifier,
        kind: Option<LoadKind>,
        addr: u32,
        size: u32,
        value_buf: [u8; 4],
    ) -> Option<InsnRef> {
        let is_write = kind.is_none();
        let addr1 = addr.wrapping_add(size - 1) & !3;
        let size0 = (addr1 - addr) as usize;
        let size1 = size - size0 as u32;
        trace!(
            "misaligned data request (addr: {addr:#010x}, size: {size:#x}, is_write: {is_write})"
        );

        let mut buf = value_buf;
        let first = self.bus.data_req(addr, &mut buf[..size0], is_write);
        if first == IoResult::Invalid {
            // Partial failure: the fault is reported immediately and the
            // second half is never issued.
            return Some(self.exception_raise(match is_write {
                true => Exception::StoreAccessFault,
                false => Exception::LoadAccessFault,
            }));
        }
        self.lsu.pending = Some(PendingOp { rd, kind, buf });
        self.lsu.misaligned = Some(Misaligned {
            addr: addr1,
            size: size1,
            offset: size0 as u32,
            is_write,
            first_done: matches!(first, IoResult::Ok { .. }),
        });
        self.stalled_inc();
        if let IoResult::Ok { latency } = first {
            let continuation = self.exec.misaligned_event;
            self.clock.enqueue(continuation, latency + 1);
        }
        None
    }

    /// Performs the second half of a split access. Bound to the misaligned
    /// continuation event.
    pub(crate) fn lsu_misaligned_continue(&mut self) {
        let Some(m) = self.lsu.misaligned else {
            return;
        };
        debug_assert!(m.first_done);
        let Some(mut p) = self.lsu.pending else {
            return;
        };
        let offset = m.offset as usize;
        let size = m.size as usize;
        let mut half = [0u8; 4];
        half[..size].copy_from_slice(&p.buf[offset..offset + size]);
        match self.bus.data_req(m.addr, &mut half[..size], m.is_write) {
            IoResult::Ok { latency } => {
                if !m.is_write {
                    p.buf[offset..offset + size].copy_from_slice(&half[..size]);
                    self.lsu.pending = Some(p);
                }
                self.lsu.misaligned = None;
                self.exec.wakeup_latency = latency;
                self.lsu_complete();
                self.stalled_dec();
            }
            IoResult::Pending => {
                // Still stalled; the response completes the access.
            }
            IoResult::Invalid => {
                self.lsu.pending = None;
                self.lsu.misaligned = None;
                let vector = self.exception_raise(match m.is_write {
                    true => Exception::StoreAccessFault,
                    false => Exception::LoadAccessFault,
                });
                self.exec.current_insn = vector;
                self.prefetch_fetch(vector);
                self.stalled_dec();
            }
        }
    }

    /// Inbound response for an earlier [`IoResult::Pending`] data request.
    /// `data` carries the read payload (empty for writes); `latency` is
    /// charged before the next instruction retires.
    pub fn data_response(&mut self, data: &[u8], latency: Cycles) {
        if self.lsu.pending.is_none() {
            // The access was abandoned (interruptible load restart).
            trace!("ignoring data response with no pending access");
            return;
        }
        self.exec.wakeup_latency = latency;
        if let Some(mut m) = self.lsu.misaligned {
            if !m.first_done {
                // Asynchronous grant of the first half; schedule the second.
                if !m.is_write {
                    if let Some(p) = self.lsu.pending.as_mut() {
                        let n = data.len().min(m.offset as usize);
                        p.buf[..n].copy_from_slice(&data[..n]);
                    }
                }
                m.first_done = true;
                self.lsu.misaligned = Some(m);
                let continuation = self.exec.misaligned_event;
                self.clock.enqueue(continuation, latency + 1);
                return;
            }
            // Second-half response.
            if !m.is_write {
                if let Some(p) = self.lsu.pending.as_mut() {
                    let offset = m.offset as usize;
                    let n = data.len().min(m.size as usize);
                    p.buf[offset..offset + n].copy_from_slice(&data[..n]);
                }
            }
            self.lsu.misaligned = None;
            self.lsu_complete();
            self.stalled_dec();
            return;
        }
        if let Some(p) = self.lsu.pending.as_mut() {
            let n = data.len().min(4);
            p.buf[..n].copy_from_slice(&data[..n]);
        }
        self.lsu_complete();
        self.stalled_dec();
    }

    /// Finishes the architectural side of the completed access: for a load,
    /// writes the destination register with the proper extension.
    fn lsu_complete(&mut self) {
        if let Some(p) = self.lsu.pending.take() {
            if let Some(kind) = p.kind {
                self.regfile.set_x(p.rd, kind.extend(&p.buf));
            }
        }
        self.exec.elw_stalled = false;
        self.exec.elw_insn = None;
    }

    /// Drops the in-flight access of an interruptible load that is being
    /// restarted; a late response for it is ignored.
    pub(crate) fn lsu_abandon_pending(&mut self) {
        self.lsu.pending = None;
        self.lsu.misaligned = None;
    }
}

/// Clock-event handler performing the second half of a split access.
pub(crate) fn exec_misaligned<B: SystemBus>(core: &mut Core<B>) {
    core.lsu_misaligned_continue();
}
