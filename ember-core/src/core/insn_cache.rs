//! Lazily populated cache of decoded instructions.
//!
//! Decoded state is shared across repeated executions of the same instruction
//! word: the first execution goes through the *undecoded* sentinel handler,
//! which materialises the raw opcode, decodes it, and installs a permanent
//! handler plus operand record in the cache entry. Every later execution
//! dispatches straight to that handler.
//!
//! Entries are grouped into fixed-size pages keyed by physical address.
//! Pages live until the whole cache is flushed; a flush bumps a generation
//! counter so that holders of [`InsnRef`]s (the execution loop's current
//! pointer, the irq vector cache, speculative `next` links) can detect
//! staleness and re-resolve by address instead of dereferencing stale
//! entries.

use super::regfile::Specifier;
use super::Core;
use crate::io::SystemBus;
use log::trace;
use nohash::IntMap;

/// Number of guest address bits covered by one page.
pub const INSN_PAGE_BITS: u32 = 12;
/// Number of guest address bytes covered by one page.
pub const INSN_PAGE_SIZE: u32 = 1 << INSN_PAGE_BITS;
/// Number of entries in a page: one per 2 bytes, so compressed instructions
/// get their own slot.
pub const INSN_PAGE_INSNS: usize = (INSN_PAGE_SIZE / 2) as usize;

/// An instruction handler: executes one decoded instruction against the core
/// and returns the pointer to the instruction to execute next.
pub type InsnHandler<B> = fn(&mut Core<B>, &DecodedInsn<B>) -> InsnRef;

/// Decode progress of a cache entry.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DecodeState {
    /// The entry still carries the decode-on-demand sentinel handler.
    Undecoded,
    /// A permanent handler and operand record are installed; the handler
    /// never re-decodes.
    Decoded,
    /// A software breakpoint trap handler is installed over the entry; the
    /// original handler is parked in [`DecodedInsn::saved`].
    Breakpoint,
}

/// Reference to a [`DecodedInsn`] inside an [`InsnCache`].
///
/// The reference records the page handle and slot it points at, along with
/// the cache generation it was created in. A reference from an older
/// generation is *stale*: it must not be dereferenced, and holders re-resolve
/// through [`Core::insn_get`] using the recorded address instead.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct InsnRef {
    addr: u32,
    page: u32,
    slot: u16,
    generation: u32,
}

impl InsnRef {
    /// The guest address of the referenced instruction. Valid even when the
    /// reference itself has gone stale.
    pub fn addr(self) -> u32 {
        self.addr
    }
}

/// One cached, pre-translated guest instruction.
#[derive(Debug)]
pub struct DecodedInsn<B: SystemBus> {
    /// Guest address of this instruction. Immutable after page creation.
    pub addr: u32,
    /// Raw opcode word, materialised by the prefetcher. For a compressed
    /// instruction only the low halfword is meaningful.
    pub opcode: u32,
    /// Instruction size in bytes: 2 (compressed) or 4.
    pub size: u8,
    pub state: DecodeState,
    pub handler: InsnHandler<B>,
    /// Original handler and state while a breakpoint is armed on this entry.
    pub saved: Option<(InsnHandler<B>, DecodeState)>,
    pub rd: Specifier,
    pub rs1: Specifier,
    pub rs2: Specifier,
    pub imm: i32,
    /// Branch target when statically known, otherwise 0.
    pub target: u32,
    /// Speculative link to the next sequential instruction. Only valid while
    /// the generation it was created in is current.
    pub next: Option<InsnRef>,
}

impl<B: SystemBus> Clone for DecodedInsn<B> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<B: SystemBus> Copy for DecodedInsn<B> {}

/// A page of decoded instructions covering `INSN_PAGE_SIZE` bytes of guest
/// addresses.
#[derive(Debug)]
struct InsnPage<B: SystemBus> {
    insns: Box<[DecodedInsn<B>]>,
}

/// The decoded-instruction cache: a mapping from page index (physical address
/// `>> INSN_PAGE_BITS`) to [`InsnPage`]. The cache exclusively owns its
/// pages.
#[derive(Debug)]
pub struct InsnCache<B: SystemBus> {
    pages: IntMap<u32, InsnPage<B>>,
    /// Bumped on every flush. See [`InsnRef`].
    generation: u32,
    /// Shortcut avoiding address translation while execution stays within one
    /// page: the virtual page base and the physical page index it mapped to.
    current_page: Option<(u32, u32)>,
    /// Decode-on-demand handler installed in fresh entries.
    sentinel: InsnHandler<B>,
}

impl<B: SystemBus> InsnCache<B> {
    pub fn new(sentinel: InsnHandler<B>) -> Self {
        Self {
            pages: IntMap::default(),
            generation: 0,
            current_page: None,
            sentinel,
        }
    }

    /// Looks up the entry for `vaddr`, which translates to physical address
    /// `paddr`. Creates and populates the page on first miss. Constant-time
    /// amortised.
    pub fn get(&mut self, vaddr: u32, paddr: u32) -> InsnRef {
        let page_index = paddr >> INSN_PAGE_BITS;
        let vbase = vaddr & !(INSN_PAGE_SIZE - 1);
        if !self.pages.contains_key(&page_index) {
            trace!("creating insn page at {vbase:#010x} (index {page_index:#x})");
            let sentinel = self.sentinel;
            let insns = (0..INSN_PAGE_INSNS)
                .map(|i| DecodedInsn {
                    addr: vbase + 2 * i as u32,
                    opcode: 0,
                    size: 2,
                    state: DecodeState::Undecoded,
                    handler: sentinel,
                    saved: None,
                    rd: Specifier::X0,
                    rs1: Specifier::X0,
                    rs2: Specifier::X0,
                    imm: 0,
                    target: 0,
                    next: None,
                })
                .collect();
            self.pages.insert(page_index, InsnPage { insns });
        }
        self.current_page = Some((vbase, page_index));
        InsnRef {
            addr: vaddr,
            page: page_index,
            slot: ((vaddr & (INSN_PAGE_SIZE - 1)) >> 1) as u16,
            generation: self.generation,
        }
    }

    /// Returns the entry for `vaddr` going through the current-page shortcut,
    /// or `None` if the address falls outside the current page (including
    /// after a [`Self::vflush`]); the caller must then translate the address
    /// and call [`Self::get`].
    pub fn get_current_page(&mut self, vaddr: u32) -> Option<InsnRef> {
        let (vbase, page_index) = self.current_page?;
        (vaddr & !(INSN_PAGE_SIZE - 1) == vbase).then(|| InsnRef {
            addr: vaddr,
            page: page_index,
            slot: ((vaddr & (INSN_PAGE_SIZE - 1)) >> 1) as u16,
            generation: self.generation,
        })
    }

    /// Drops all pages and bumps the generation counter, rendering every
    /// outstanding [`InsnRef`] stale.
    ///
    /// This only covers the cache itself. The core-level orchestration
    /// (prefetcher invalidation, vector re-resolution, breakpoint re-arming)
    /// lives in [`Core::cache_flush`].
    pub fn flush(&mut self) {
        trace!("flushing insn cache ({} pages)", self.pages.len());
        self.pages.clear();
        self.generation = self.generation.wrapping_add(1);
        self.current_page = None;
    }

    /// Partial, non-destructive flush: only drops the current-page shortcut.
    /// Used on page-boundary crossings; decoded entries are kept.
    pub fn vflush(&mut self) {
        self.current_page = None;
    }

    /// Returns `true` if `insn` was created in the current generation, i.e.
    /// no flush happened since.
    pub fn is_current(&self, insn: InsnRef) -> bool {
        insn.generation == self.generation
    }

    /// Dereferences `insn`, returning `None` if it is stale.
    pub fn insn(&self, insn: InsnRef) -> Option<&DecodedInsn<B>> {
        if !self.is_current(insn) {
            return None;
        }
        self.pages
            .get(&insn.page)
            .map(|page| &page.insns[insn.slot as usize])
    }

    /// Mutably dereferences `insn`, returning `None` if it is stale.
    pub fn insn_mut(&mut self, insn: InsnRef) -> Option<&mut DecodedInsn<B>> {
        if !self.is_current(insn) {
            return None;
        }
        self.pages
            .get_mut(&insn.page)
            .map(|page| &mut page.insns[insn.slot as usize])
    }

    pub fn is_decoded(&self, insn: InsnRef) -> bool {
        self.insn(insn)
            .is_some_and(|insn| insn.state == DecodeState::Decoded)
    }

    /// Installs a permanent handler and operand record in the entry, flipping
    /// it from *undecoded* to *decoded*. Called exactly once per entry
    /// lifetime, from the sentinel handler.
    #[allow(clippy::too_many_arguments)]
    pub fn install(
        &mut self,
        insn: InsnRef,
        handler: InsnHandler<B>,
        size: u8,
        rd: Specifier,
        rs1: Specifier,
        rs2: Specifier,
        imm: i32,
        target: u32,
        next: Option<InsnRef>,
    ) {
        let entry = self
            .insn_mut(insn)
            .expect("decode installs only into live entries");
        debug_assert_eq!(DecodeState::Undecoded, entry.state);
        entry.handler = handler;
        entry.state = DecodeState::Decoded;
        entry.size = size;
        entry.rd = rd;
        entry.rs1 = rs1;
        entry.rs2 = rs2;
        entry.imm = imm;
        entry.target = target;
        entry.next = next;
    }

    /// Replaces the entry's handler with a breakpoint trap handler while
    /// remembering the original. No-op if a breakpoint is already armed.
    pub fn breakpoint_insert(&mut self, insn: InsnRef, trap: InsnHandler<B>) {
        if let Some(entry) = self.insn_mut(insn) {
            if entry.state != DecodeState::Breakpoint {
                entry.saved = Some((entry.handler, entry.state));
                entry.handler = trap;
                entry.state = DecodeState::Breakpoint;
            }
        }
    }

    /// Restores the handler that was armed over by [`Self::breakpoint_insert`].
    pub fn breakpoint_remove(&mut self, insn: InsnRef) {
        if let Some(entry) = self.insn_mut(insn) {
            if let Some((handler, state)) = entry.saved.take() {
                entry.handler = handler;
                entry.state = state;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{IoResult, SystemBus};

    #[derive(Debug)]
    struct NullBus;

    impl SystemBus for NullBus {
        fn data_req(&mut self, _addr: u32, _data: &mut [u8], _is_write: bool) -> IoResult {
            IoResult::Invalid
        }

        fn fetch_req(&mut self, _addr: u32, _data: &mut [u8]) -> IoResult {
            IoResult::Invalid
        }

        fn irq_ack(&mut self, _irq: i32) {}
    }

    fn nop_handler(_core: &mut Core<NullBus>, insn: &DecodedInsn<NullBus>) -> InsnRef {
        insn.next.unwrap()
    }

    #[test]
    fn test_same_ref_between_flushes() {
        let mut cache = InsnCache::<NullBus>::new(nop_handler);
        let a = cache.get(0x1C00_8100, 0x1C00_8100);
        let b = cache.get(0x1C00_8100, 0x1C00_8100);
        assert_eq!(a, b);
        assert_eq!(0x1C00_8100, a.addr());
    }

    #[test]
    fn test_pages_initialized_undecoded() {
        let mut cache = InsnCache::<NullBus>::new(nop_handler);
        let r = cache.get(0x1C00_8102, 0x1C00_8102);
        let entry = cache.insn(r).unwrap();
        assert_eq!(DecodeState::Undecoded, entry.state);
        assert_eq!(0x1C00_8102, entry.addr);
        // Neighbouring slots of the same page share the lazily created page.
        let r2 = cache.get(0x1C00_8FFE, 0x1C00_8FFE);
        assert_eq!(r.page, r2.page);
    }

    #[test]
    fn test_flush_staleness() {
        let mut cache = InsnCache::<NullBus>::new(nop_handler);
        let r = cache.get(0x100, 0x100);
        assert!(cache.is_current(r));
        cache.flush();
        assert!(!cache.is_current(r));
        assert!(cache.insn(r).is_none());
        // Re-resolving by address yields a usable reference again.
        let r2 = cache.get(r.addr(), r.addr());
        assert!(cache.is_current(r2));
        assert_eq!(DecodeState::Undecoded, cache.insn(r2).unwrap().state);
    }

    #[test]
    fn test_vflush_keeps_entries() {
        let mut cache = InsnCache::<NullBus>::new(nop_handler);
        let r = cache.get(0x100, 0x100);
        assert!(cache.get_current_page(0x104).is_some());
        cache.vflush();
        assert!(cache.get_current_page(0x104).is_none());
        // The entry itself survives.
        assert!(cache.is_current(r));
        assert!(cache.insn(r).is_some());
    }

    #[test]
    fn test_current_page_shortcut_misses_other_pages() {
        let mut cache = InsnCache::<NullBus>::new(nop_handler);
        cache.get(0x1000, 0x1000);
        assert!(cache.get_current_page(0x1FFE).is_some());
        assert!(cache.get_current_page(0x2000).is_none());
    }

    #[test]
    fn test_breakpoint_swap() {
        fn trap(_core: &mut Core<NullBus>, insn: &DecodedInsn<NullBus>) -> InsnRef {
            insn.next.unwrap()
        }
        let mut cache = InsnCache::<NullBus>::new(nop_handler);
        let r = cache.get(0x100, 0x100);
        cache.breakpoint_insert(r, trap);
        assert_eq!(DecodeState::Breakpoint, cache.insn(r).unwrap().state);
        // Arming twice keeps the original saved handler.
        cache.breakpoint_insert(r, trap);
        cache.breakpoint_remove(r);
        let entry = cache.insn(r).unwrap();
        assert_eq!(DecodeState::Undecoded, entry.state);
        assert!(entry.saved.is_none());
    }
}
