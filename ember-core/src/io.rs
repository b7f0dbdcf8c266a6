//! The port layer connecting a core to the rest of the platform.
//!
//! The core is a *master* on its data and fetch ports: it issues requests and
//! the platform answers either synchronously (with a latency) or
//! asynchronously, in which case the core stalls its execution loop until the
//! matching `*_response` method on the core is invoked. The remaining
//! outbound ports (interrupt acknowledge, halt status, cache-flush request)
//! are plain notifications.
//!
//! Implementors decide which `(address, size)` pairs they support; an
//! unsupported access must be answered with [`IoResult::Invalid`] rather than
//! a panic, mirroring how real bus fabrics report decode errors. All data is
//! exchanged in little-endian byte order.

use crate::clock::Cycles;
use std::fmt::Debug;
use thiserror::Error;

/// Outcome of a request on a master io port.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum IoResult {
    /// The request was served synchronously. `latency` is the number of extra
    /// cycles the access took beyond the issuing cycle; the core accounts it
    /// before retiring the next instruction.
    Ok { latency: Cycles },
    /// The request was accepted but the response will arrive later through
    /// [`Core::data_response`](crate::core::Core::data_response) or
    /// [`Core::fetch_response`](crate::core::Core::fetch_response). The core
    /// stops re-enqueueing its loop event until then.
    Pending,
    /// The request targets an unmapped or faulting location.
    Invalid,
}

/// Outcome of an access to one of the core's memory-mapped slave ports.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[must_use]
pub enum IoStatus {
    Ok,
    Invalid,
}

/// Raised by the instruction-address translation hook when a virtual address
/// has no mapping.
#[derive(Error, Debug, Clone, Eq, PartialEq)]
#[error("instruction fetch address {0:#010x} does not translate")]
pub struct TranslationFault(pub u32);

/// The platform side of a core's outbound ports.
///
/// A single implementor stands in for everything the core reaches out to:
/// the data and fetch memory ports, the interrupt controller's acknowledge
/// input, and the platform hooks for halt status and cache-flush
/// coordination. Binding happens once, at core construction, so there is no
/// unbound-port state to check at runtime.
pub trait SystemBus: Debug {
    /// Issues a data memory request. On a write, `data` holds the bytes to
    /// store; on a read, the platform fills `data` before returning
    /// [`IoResult::Ok`]. For a [`IoResult::Pending`] read the bytes travel
    /// with the later response instead.
    fn data_req(&mut self, addr: u32, data: &mut [u8], is_write: bool) -> IoResult;

    /// Issues an instruction memory read. Same response contract as
    /// [`Self::data_req`].
    fn fetch_req(&mut self, addr: u32, data: &mut [u8]) -> IoResult;

    /// Acknowledges the interrupt the core just took.
    fn irq_ack(&mut self, irq: i32);

    /// Reports a change of the core's halted state.
    fn halt_status(&mut self, halted: bool) {
        let _ = halted;
    }

    /// First phase of the cache-flush handshake. The core stalls after
    /// raising this until the platform answers through
    /// [`Core::flush_cache_ack_sync`](crate::core::Core::flush_cache_ack_sync).
    fn flush_cache_req(&mut self) {}

    /// Translates a virtual instruction address to the physical address used
    /// to index the decoded-instruction cache. The default is the identity
    /// mapping; platforms with an MMU model override this.
    fn insn_virt_to_phys(&mut self, vaddr: u32) -> Result<u32, TranslationFault> {
        Ok(vaddr)
    }
}
