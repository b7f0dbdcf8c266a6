//! End-to-end tests driving a core against a scriptable platform bus.

use super::csr;
use super::dbg_unit::{halt_cause, offset};
use super::regfile::Specifier;
use super::{Config, Core};
use crate::clock::Cycles;
use crate::io::{IoResult, IoStatus, SystemBus};
use nohash::IntMap;

/// One request observed on the data port.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) struct BusAccess {
    pub addr: u32,
    pub size: usize,
    pub is_write: bool,
}

/// Test stand-in for the platform: byte-sparse memory behind the data and
/// fetch ports, with scriptable latency, pending, and fault behavior.
#[derive(Debug, Default)]
pub(crate) struct TestBus {
    mem: IntMap<u32, u8>,
    pub data_latency: Cycles,
    pub fetch_latency: Cycles,
    /// Answer data requests with `Pending`, queueing them for the test to
    /// resolve through [`Core::data_response`].
    pub data_pending: bool,
    /// Same for fetch requests.
    pub fetch_pending: bool,
    /// `[lo, hi)` address ranges answering `Invalid`.
    pub invalid_ranges: Vec<(u32, u32)>,
    pub data_accesses: Vec<BusAccess>,
    pub pending_data: Vec<BusAccess>,
    pub pending_fetches: Vec<u32>,
    pub irq_acks: Vec<i32>,
    pub flush_reqs: u32,
    pub halt_reports: Vec<bool>,
}

impl TestBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_bytes(&mut self, addr: u32, bytes: &[u8]) {
        for (i, &byte) in bytes.iter().enumerate() {
            self.mem.insert(addr + i as u32, byte);
        }
    }

    pub fn read_bytes(&self, addr: u32, buf: &mut [u8]) {
        for (i, byte) in buf.iter_mut().enumerate() {
            *byte = self.mem.get(&(addr + i as u32)).copied().unwrap_or(0);
        }
    }

    pub fn peek(&self, addr: u32, len: usize) -> Vec<u8> {
        let mut buf = vec![0; len];
        self.read_bytes(addr, &mut buf);
        buf
    }

    pub fn write_word(&mut self, addr: u32, word: u32) {
        self.write_bytes(addr, &word.to_le_bytes());
    }

    pub fn load_program(&mut self, addr: u32, words: &[u32]) {
        for (i, &word) in words.iter().enumerate() {
            self.write_word(addr + 4 * i as u32, word);
        }
    }

    fn is_invalid(&self, addr: u32) -> bool {
        self.invalid_ranges
            .iter()
            .any(|&(lo, hi)| addr >= lo && addr < hi)
    }
}

impl SystemBus for TestBus {
    fn data_req(&mut self, addr: u32, data: &mut [u8], is_write: bool) -> IoResult {
        let access = BusAccess {
            addr,
            size: data.len(),
            is_write,
        };
        self.data_accesses.push(access);
        if self.is_invalid(addr) {
            return IoResult::Invalid;
        }
        if is_write {
            let bytes = data.to_vec();
            self.write_bytes(addr, &bytes);
        }
        if self.data_pending {
            self.pending_data.push(access);
            return IoResult::Pending;
        }
        if !is_write {
            let mut bytes = vec![0; data.len()];
            self.read_bytes(addr, &mut bytes);
            data.copy_from_slice(&bytes);
        }
        IoResult::Ok {
            latency: self.data_latency,
        }
    }

    fn fetch_req(&mut self, addr: u32, data: &mut [u8]) -> IoResult {
        if self.is_invalid(addr) {
            return IoResult::Invalid;
        }
        if self.fetch_pending {
            self.pending_fetches.push(addr);
            return IoResult::Pending;
        }
        let mut bytes = vec![0; data.len()];
        self.read_bytes(addr, &mut bytes);
        data.copy_from_slice(&bytes);
        IoResult::Ok {
            latency: self.fetch_latency,
        }
    }

    fn irq_ack(&mut self, irq: i32) {
        self.irq_acks.push(irq);
    }

    fn halt_status(&mut self, halted: bool) {
        self.halt_reports.push(halted);
    }

    fn flush_cache_req(&mut self) {
        self.flush_reqs += 1;
    }
}

// Instruction encodings used by the test programs.

fn addi(rd: u32, rs1: u32, imm: i32) -> u32 {
    ((imm as u32 & 0xFFF) << 20) | (rs1 << 15) | (rd << 7) | 0x13
}

fn lw(rd: u32, rs1: u32, imm: i32) -> u32 {
    ((imm as u32 & 0xFFF) << 20) | (rs1 << 15) | (0b010 << 12) | (rd << 7) | 0x03
}

fn sw(rs2: u32, rs1: u32, imm: i32) -> u32 {
    let imm = imm as u32 & 0xFFF;
    ((imm >> 5) << 25) | (rs2 << 20) | (rs1 << 15) | (0b010 << 12) | ((imm & 0x1F) << 7) | 0x23
}

fn div(rd: u32, rs1: u32, rs2: u32) -> u32 {
    (1 << 25) | (rs2 << 20) | (rs1 << 15) | (0b100 << 12) | (rd << 7) | 0x33
}

fn divu(rd: u32, rs1: u32, rs2: u32) -> u32 {
    div(rd, rs1, rs2) | (0b001 << 12)
}

/// `jal x0, 0`: jump to self.
const LOOP_FOREVER: u32 = 0x0000_006F;
const WFI: u32 = 0x1050_0073;
const MRET: u32 = 0x3020_0073;
const ECALL: u32 = 0x0000_0073;

const BOOT: u32 = 0x1C00_8080;
const ENTRY: u32 = 0x1C00_8100;
const VECTOR_BASE: u32 = 0x1C00_8000;

fn x(index: u32) -> Specifier {
    Specifier::new(index).unwrap()
}

fn config() -> Config {
    Config {
        boot_addr: BOOT,
        bootaddr_offset: 0x80,
        fetch_enable: true,
        isa: "rv32imc".to_string(),
        ..Config::default()
    }
}

/// Builds a core with `program` at the entry point and self-loops in every
/// vector slot, reset released and ready to run.
fn core_with_program(program: &[u32]) -> Core<TestBus> {
    let mut bus = TestBus::new();
    for slot in 0..35 {
        bus.write_word(VECTOR_BASE + 4 * slot, LOOP_FOREVER);
    }
    bus.load_program(ENTRY, program);
    let mut core = Core::new(config(), bus).unwrap();
    core.reset(false);
    core
}

fn run(core: &mut Core<TestBus>, events: usize) {
    for _ in 0..events {
        if !core.step() {
            break;
        }
    }
}

fn retired(core: &Core<TestBus>) -> Option<u32> {
    core.exec.prev_insn.map(|insn| insn.addr())
}

#[test]
fn test_reset_boot_sequence() {
    // Reset with fetch disabled: the first retired instruction must come
    // from boot_addr + bootaddr_offset once the fetch gate rises, and the
    // vector base is the 256-byte-aligned base of the boot address.
    let mut bus = TestBus::new();
    bus.load_program(ENTRY, &[addi(1, 0, 5), LOOP_FOREVER]);
    let mut core = Core::new(
        Config {
            fetch_enable: false,
            ..config()
        },
        bus,
    )
    .unwrap();
    core.reset(false);
    assert!(!core.step(), "core must stay asleep while fetch is disabled");

    core.fetchen_sync(true);
    run(&mut core, 1);
    assert_eq!(Some(ENTRY), retired(&core));
    assert_eq!(5, core.regfile.x(x(1)));
    assert_eq!(VECTOR_BASE, core.irq.vector_base);
}

#[test]
fn test_writes_to_x0_are_suppressed() {
    let mut core = core_with_program(&[addi(0, 0, 5), LOOP_FOREVER]);
    run(&mut core, 4);
    assert_eq!(0, core.regfile.x(Specifier::X0));
}

#[test]
fn test_decode_happens_once() {
    // jal x0, -4 back to the entry: the same two entries execute repeatedly
    // and must keep their decoded handlers and identity.
    let jal_back = 0xFFDF_F06F;
    let mut core = core_with_program(&[addi(1, 1, 1), jal_back]);
    run(&mut core, 2);
    let first = core.try_insn_get(ENTRY).unwrap();
    assert!(core.insn_cache.is_decoded(first));
    run(&mut core, 20);
    assert_eq!(first, core.try_insn_get(ENTRY).unwrap());
    assert!(core.insn_cache.is_decoded(first));
    // The loop actually made progress each iteration.
    assert!(core.regfile.x(x(1)) > 1);
}

#[test]
fn test_div_overflow_result_and_stall() {
    let mut core = core_with_program(&[div(5, 6, 7), LOOP_FOREVER]);
    core.regfile.set_x(x(6), 0x8000_0000);
    core.regfile.set_x(x(7), 0xFFFF_FFFF);
    run(&mut core, 1);
    assert_eq!(0x8000_0000, core.regfile.x(x(5)));
    // clz(|-1|) + 2 = clz(1) + 2 = 33
    assert_eq!(33, core.timing.stall_cycles());
}

#[test]
fn test_div_by_zero() {
    let mut core = core_with_program(&[div(5, 6, 7), LOOP_FOREVER]);
    core.regfile.set_x(x(6), 1234);
    run(&mut core, 1);
    assert_eq!(u32::MAX, core.regfile.x(x(5)));
    assert_eq!(1, core.timing.stall_cycles());
}

#[test]
fn test_divu_by_zero_stall() {
    let mut core = core_with_program(&[divu(5, 6, 7), LOOP_FOREVER]);
    core.regfile.set_x(x(6), 1234);
    run(&mut core, 1);
    assert_eq!(u32::MAX, core.regfile.x(x(5)));
    // leading_zeros(0) is 32, so a zero divisor stalls 32 + 3 cycles.
    assert_eq!(35, core.timing.stall_cycles());
}

#[test]
fn test_wfi_then_irq() {
    let mut core = core_with_program(&[WFI, LOOP_FOREVER]);
    core.irq.irq_enable = true;
    run(&mut core, 1);
    assert!(core.exec.wfi());
    assert!(!core.step(), "wfi suspends the loop");

    core.irq_req_sync(7);
    // Resumption happens within one tick of the injection.
    assert_eq!(Some(core.cycles() + 1), core.clock.next_due());
    run(&mut core, 1);
    assert_eq!(ENTRY, core.csr.mepc);
    assert_eq!(0x8000_0007, core.csr.mcause);
    assert!(core.irq.saved_irq_enable, "prior enable is saved on entry");
    assert!(!core.irq.irq_enable, "entry clears the enable latch");
    assert_eq!(vec![7], core.bus.irq_acks);
    assert_eq!(VECTOR_BASE + 4 * 7, core.exec.pc());
    // The pipeline-flush model charges 4 stall cycles before the vector
    // instruction retires.
    assert_eq!(4, core.timing.stall_cycles());
    run(&mut core, 5);
    assert_eq!(Some(VECTOR_BASE + 4 * 7), retired(&core));
}

#[test]
fn test_mret_restores_enable_and_returns() {
    let mut core = core_with_program(&[WFI, LOOP_FOREVER]);
    core.bus.write_word(VECTOR_BASE + 4 * 3, MRET);
    core.irq.irq_enable = true;
    run(&mut core, 1);
    core.irq_req_sync(3);
    // Entry check event + 4 stall cycles + the mret itself.
    run(&mut core, 6);
    assert_eq!(Some(VECTOR_BASE + 4 * 3), retired(&core));
    assert!(core.irq.irq_enable, "mret restores the saved enable");
    assert_eq!(0, core.csr.mcause);
    // Control returned to the wfi at mepc, which puts the core back to
    // sleep waiting for the next interrupt.
    run(&mut core, 2);
    assert_eq!(ENTRY, core.exec.pc());
    assert!(core.exec.wfi());
}

#[test]
fn test_misaligned_load_split() {
    // A 4-byte load at an address with alignment 1: two aligned halves of 3
    // and 1 bytes, whose aggregate equals a single 4-byte access.
    let mut core = core_with_program(&[lw(5, 6, 1), LOOP_FOREVER]);
    core.bus
        .write_bytes(0x1C00_0000, &[0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
    core.regfile.set_x(x(6), 0x1C00_0000);
    run(&mut core, 1);
    assert_eq!(
        vec![
            BusAccess {
                addr: 0x1C00_0001,
                size: 3,
                is_write: false
            },
            BusAccess {
                addr: 0x1C00_0004,
                size: 1,
                is_write: false
            },
        ],
        core.bus.data_accesses
    );
    assert!(core.exec.stalled(), "split access holds the loop");
    // The continuation event performs the second half one cycle later.
    run(&mut core, 1);
    assert_eq!(0x4433_2211, core.regfile.x(x(5)));
    assert!(!core.exec.stalled());
}

#[test]
fn test_misaligned_load_async_second_half() {
    let mut core = core_with_program(&[lw(5, 6, 1), LOOP_FOREVER]);
    core.bus
        .write_bytes(0x1C00_0000, &[0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
    core.regfile.set_x(x(6), 0x1C00_0000);
    run(&mut core, 1);
    // Make the second half asynchronous.
    core.bus.data_pending = true;
    run(&mut core, 1);
    assert!(core.exec.stalled());
    assert_eq!(1, core.bus.pending_data.len());
    let second = core.bus.pending_data[0];
    let bytes = core.bus.peek(second.addr, second.size);
    core.data_response(&bytes, 5);
    assert_eq!(0x4433_2211, core.regfile.x(x(5)));
    // The loop resumes io_latency + 1 cycles after the second response.
    assert_eq!(Some(core.cycles() + 6), core.clock.next_due());
}

#[test]
fn test_misaligned_store_split() {
    let mut core = core_with_program(&[sw(5, 6, 2), LOOP_FOREVER]);
    core.regfile.set_x(x(5), 0x5566_7788);
    core.regfile.set_x(x(6), 0x1C00_0000);
    run(&mut core, 2);
    assert_eq!(
        vec![
            BusAccess {
                addr: 0x1C00_0002,
                size: 2,
                is_write: true
            },
            BusAccess {
                addr: 0x1C00_0004,
                size: 2,
                is_write: true
            },
        ],
        core.bus.data_accesses
    );
    assert_eq!(
        vec![0x88, 0x77, 0x66, 0x55],
        core.bus.peek(0x1C00_0002, 4),
        "the guest observes the same bytes as one aligned store"
    );
}

#[test]
fn test_misaligned_first_half_fault_skips_second() {
    let mut core = core_with_program(&[lw(5, 6, 1), LOOP_FOREVER]);
    core.regfile.set_x(x(6), 0x1C00_0000);
    core.bus.invalid_ranges.push((0x1C00_0000, 0x1C00_0004));
    run(&mut core, 1);
    assert_eq!(1, core.bus.data_accesses.len(), "second half never issued");
    assert_eq!(5, core.csr.mcause, "load access fault");
    assert_eq!(VECTOR_BASE, core.exec.pc(), "vectored through entry 0");
}

#[test]
fn test_async_load_completes_on_response() {
    let mut core = core_with_program(&[lw(5, 6, 0), LOOP_FOREVER]);
    core.bus.write_word(0x1C00_0000, 0xCAFE_F00D);
    core.regfile.set_x(x(6), 0x1C00_0000);
    core.bus.data_pending = true;
    run(&mut core, 1);
    assert!(core.exec.stalled());
    assert_eq!(0, core.regfile.x(x(5)), "no write-back before the response");
    let bytes = core.bus.peek(0x1C00_0000, 4);
    core.data_response(&bytes, 2);
    assert_eq!(0xCAFE_F00D, core.regfile.x(x(5)));
    assert_eq!(Some(core.cycles() + 3), core.clock.next_due());
}

#[test]
fn test_async_fetch_stalls_and_resumes() {
    let mut bus = TestBus::new();
    bus.load_program(ENTRY, &[addi(1, 0, 9), LOOP_FOREVER]);
    bus.fetch_pending = true;
    let mut core = Core::new(config(), bus).unwrap();
    core.reset(false);
    assert!(!core.step(), "fetch miss suspends the loop");
    assert_eq!(vec![ENTRY], core.bus.pending_fetches);

    core.bus.fetch_pending = false;
    let line = core.bus.peek(ENTRY, 16);
    core.fetch_response(&line, 3);
    assert_eq!(Some(core.cycles() + 4), core.clock.next_due());
    run(&mut core, 1);
    assert_eq!(9, core.regfile.x(x(1)));
}

#[test]
fn test_illegal_instruction_vectors() {
    let mut core = core_with_program(&[0xFFFF_FFFF]);
    run(&mut core, 1);
    assert_eq!(2, core.csr.mcause);
    assert_eq!(ENTRY, core.csr.mepc);
    assert_eq!(VECTOR_BASE + 0x84, core.exec.pc());
    assert_eq!(halt_cause::ILLEGAL, core.dbg.halt_cause);
    assert!(!core.irq.irq_enable);
}

#[test]
fn test_ecall_vectors() {
    let mut core = core_with_program(&[ECALL]);
    run(&mut core, 1);
    assert_eq!(11, core.csr.mcause);
    assert_eq!(VECTOR_BASE + 0x88, core.exec.pc());
    assert_eq!(halt_cause::ECALL, core.dbg.halt_cause);
}

#[test]
fn test_debug_npc_write_repoints_core() {
    let mut core = core_with_program(&[addi(1, 1, 1), LOOP_FOREVER]);
    core.bus.load_program(0xDEAD_0000, &[addi(2, 0, 9), LOOP_FOREVER]);
    run(&mut core, 2);
    core.halt_sync(true);
    assert!(core.exec.halted());
    assert_eq!(vec![true], core.bus.halt_reports);

    let stale = core.try_insn_get(ENTRY).unwrap();
    let mut data = 0xDEAD_0000u32.to_le_bytes();
    assert_eq!(
        IoStatus::Ok,
        core.dbg_unit_req(offset::NPC, &mut data, true)
    );
    assert!(
        !core.insn_cache.is_current(stale),
        "NPC write flushes the decoded-instruction cache"
    );
    let mut readback = [0u8; 4];
    assert_eq!(
        IoStatus::Ok,
        core.dbg_unit_req(offset::NPC, &mut readback, false)
    );
    assert_eq!(0xDEAD_0000, u32::from_le_bytes(readback));

    core.halt_sync(false);
    run(&mut core, 1);
    assert_eq!(Some(0xDEAD_0000), retired(&core));
    assert_eq!(9, core.regfile.x(x(2)));
}

#[test]
fn test_single_step() {
    let mut core = core_with_program(&[addi(1, 0, 1), addi(2, 0, 2), LOOP_FOREVER]);
    core.halt_sync(true);
    assert!(!core.step());

    // Resume with step mode set: exactly one instruction retires.
    let mut ctrl = 1u32.to_le_bytes();
    assert_eq!(
        IoStatus::Ok,
        core.dbg_unit_req(offset::CTRL, &mut ctrl, true)
    );
    run(&mut core, 10);
    assert!(core.exec.halted());
    assert_eq!(1, core.regfile.x(x(1)));
    assert_eq!(0, core.regfile.x(x(2)));
    assert_eq!(halt_cause::STEP, core.dbg.halt_cause);
    assert_eq!(1, core.dbg.hit_reg & 1);

    // Step again: the second instruction retires, and only it.
    assert_eq!(
        IoStatus::Ok,
        core.dbg_unit_req(offset::CTRL, &mut ctrl, true)
    );
    run(&mut core, 10);
    assert_eq!(2, core.regfile.x(x(2)));
    assert_eq!(Some(ENTRY + 4), retired(&core));
}

#[test]
fn test_dbg_gpr_window_requires_halt() {
    let mut core = core_with_program(&[LOOP_FOREVER]);
    let mut data = [0u8; 4];
    assert_eq!(
        IoStatus::Invalid,
        core.dbg_unit_req(offset::GPR_BASE + 5 * 4, &mut data, false)
    );
    core.halt_sync(true);
    let mut value = 0x1234_5678u32.to_le_bytes();
    assert_eq!(
        IoStatus::Ok,
        core.dbg_unit_req(offset::GPR_BASE + 5 * 4, &mut value, true)
    );
    assert_eq!(0x1234_5678, core.regfile.x(x(5)));
    assert_eq!(
        IoStatus::Ok,
        core.dbg_unit_req(offset::GPR_BASE + 5 * 4, &mut data, false)
    );
    assert_eq!(0x1234_5678, u32::from_le_bytes(data));
}

#[test]
fn test_dbg_rejects_bad_width_and_offset() {
    let mut core = core_with_program(&[LOOP_FOREVER]);
    let mut halfword = [0u8; 2];
    assert_eq!(
        IoStatus::Invalid,
        core.dbg_unit_req(offset::CTRL, &mut halfword, false)
    );
    let mut word = [0u8; 4];
    assert_eq!(IoStatus::Invalid, core.dbg_unit_req(0x80, &mut word, false));
    assert_eq!(
        IoStatus::Invalid,
        core.dbg_unit_req(offset::CAUSE, &mut word, true)
    );
}

#[test]
fn test_dbg_csr_window_reads_mhartid() {
    let mut bus = TestBus::new();
    bus.load_program(ENTRY, &[LOOP_FOREVER]);
    let mut core = Core::new(
        Config {
            cluster_id: 1,
            core_id: 3,
            ..config()
        },
        bus,
    )
    .unwrap();
    core.reset(false);
    let mut data = [0u8; 4];
    assert_eq!(
        IoStatus::Ok,
        core.dbg_unit_req(offset::CSR_BASE + 0xF14 * 4, &mut data, false)
    );
    assert_eq!((1 << 5) | 3, u32::from_le_bytes(data));
}

#[test]
fn test_breakpoint_halts_without_retiring() {
    let mut core = core_with_program(&[addi(1, 0, 1), addi(2, 0, 2), LOOP_FOREVER]);
    core.breakpoint_insert(ENTRY + 4);
    run(&mut core, 10);
    assert!(core.exec.halted());
    assert_eq!(halt_cause::EBREAK, core.dbg.halt_cause);
    assert_eq!(1, core.regfile.x(x(1)));
    assert_eq!(0, core.regfile.x(x(2)), "breakpointed insn did not retire");
    assert_eq!(ENTRY + 4, core.dbg.npc);

    core.breakpoint_remove(ENTRY + 4);
    core.halt_sync(false);
    run(&mut core, 2);
    assert_eq!(2, core.regfile.x(x(2)));
}

#[test]
fn test_breakpoints_survive_cache_flush() {
    use super::insn_cache::DecodeState;
    let mut core = core_with_program(&[addi(1, 0, 1), addi(2, 0, 2), LOOP_FOREVER]);
    core.breakpoint_insert(ENTRY + 4);
    core.cache_flush();
    let insn = core.try_insn_get(ENTRY + 4).unwrap();
    assert_eq!(
        DecodeState::Breakpoint,
        core.insn_cache.insn(insn).unwrap().state
    );
}

#[test]
fn test_vector_base_low_bits_masked() {
    // The base register keeps its raw value while the vector table base is
    // masked to a 256-byte boundary (the unmasked interpretation would put
    // the table at the boot address itself).
    let mut core = core_with_program(&[LOOP_FOREVER]);
    core.bootaddr_sync(0x1C00_9084);
    assert_eq!(0x1C00_9000, core.irq.vector_base);
}

#[test]
fn test_perf_counters_count_retired_instructions() {
    use super::timing::event;
    let mut core = core_with_program(&[addi(1, 0, 1), addi(2, 0, 2), addi(3, 0, 3), WFI]);
    core.csr_write(csr::PCMR, csr::PCMR_ACTIVE).unwrap();
    core.csr_write(csr::PCER, 1 << event::INSTR).unwrap();
    run(&mut core, 6);
    assert_eq!(4, core.csr.pccr[event::INSTR], "three addis and the wfi");
}

#[test]
fn test_clock_gating_suppresses_loop() {
    let mut core = core_with_program(&[addi(1, 1, 1), 0xFFDF_F06F]);
    run(&mut core, 2);
    core.clock_sync(false);
    assert!(!core.step());
    let before = core.regfile.x(x(1));
    core.clock_sync(true);
    run(&mut core, 4);
    assert!(core.regfile.x(x(1)) > before);
}

#[test]
fn test_fetchen_falling_edge_stalls() {
    let mut core = core_with_program(&[addi(1, 1, 1), 0xFFDF_F06F]);
    run(&mut core, 2);
    core.fetchen_sync(false);
    assert!(!core.step());
    core.fetchen_sync(true);
    // The rising edge re-points the core at the boot entry.
    assert_eq!(ENTRY, core.exec.pc());
    run(&mut core, 2);
    assert!(core.regfile.x(x(1)) > 0);
}

#[test]
fn test_cache_flush_rendezvous() {
    let mut core = core_with_program(&[addi(1, 1, 1), 0xFFDF_F06F]);
    run(&mut core, 2);
    core.cache_flush_request();
    assert_eq!(1, core.bus.flush_reqs);
    assert!(!core.step(), "stalled between request and acknowledge");
    core.flush_cache_sync(true);
    core.flush_cache_ack_sync(true);
    run(&mut core, 2);
    assert!(core.regfile.x(x(1)) > 1);
}

#[test]
fn test_compressed_instructions_execute() {
    // c.addi x8, -3 ; c.nop ; then a full-width addi.
    let mut core = core_with_program(&[0x0001_1475, addi(1, 0, 7), LOOP_FOREVER]);
    run(&mut core, 3);
    assert_eq!(0xFFFF_FFFD, core.regfile.x(x(8)));
    assert_eq!(7, core.regfile.x(x(1)));
    assert_eq!(Some(ENTRY + 4), retired(&core), "2-byte stride entries");
}

#[test]
fn test_fetch_straddling_line_end() {
    // A 32-bit instruction whose parcels straddle the 16-byte fetch line:
    // c.nop at +12, addi x1, x0, 7 split across +14/+16, c.j 0 at +18.
    let addi_word = addi(1, 0, 7);
    let program = [
        addi(5, 0, 1),
        addi(6, 0, 2),
        addi(7, 0, 3),
        (addi_word & 0xFFFF) << 16 | 0x0001,
        0xA001 << 16 | (addi_word >> 16),
    ];
    let mut core = core_with_program(&program);
    run(&mut core, 3);
    // The straddling instruction's high parcel needs the second line; make
    // that refill asynchronous.
    core.bus.fetch_pending = true;
    run(&mut core, 1);
    assert!(core.exec.stalled());
    assert_eq!(vec![ENTRY + 16], core.bus.pending_fetches);
    core.bus.fetch_pending = false;
    let line = core.bus.peek(ENTRY + 16, 16);
    core.fetch_response(&line, 0);
    run(&mut core, 1);
    assert_eq!(7, core.regfile.x(x(1)));
    assert_eq!(Some(ENTRY + 14), retired(&core));
}

#[test]
fn test_interruptible_load_restarted_by_irq() {
    use super::LoadKind;
    let mut core = core_with_program(&[lw(5, 6, 0), LOOP_FOREVER]);
    core.bus.data_pending = true;
    core.irq.irq_enable = true;
    assert_eq!(
        None,
        core.lsu_load_interruptible(x(5), 0x1C00_0000, 4, LoadKind::Word)
    );
    assert!(core.exec.elw_stalled);
    assert!(core.exec.stalled());

    core.irq_req_sync(9);
    assert!(core.exec.elw_interrupted);
    assert!(!core.exec.stalled(), "restart releases the stall");
    // The abandoned access's late response must not disturb the restart.
    core.data_response(&[1, 2, 3, 4], 0);
    assert_eq!(0, core.regfile.x(x(5)));
    run(&mut core, 1);
    assert_eq!(0x8000_0009, core.csr.mcause);
}

#[test]
fn test_stale_next_links_are_relooked_up() {
    let mut core = core_with_program(&[addi(1, 1, 1), 0xFFDF_F06F]);
    run(&mut core, 4);
    let before = core.regfile.x(x(1));
    // Platform signals self-modifying code: all decoded state dropped while
    // the loop keeps running off re-resolved references.
    core.flush_cache_sync(true);
    run(&mut core, 4);
    assert!(core.regfile.x(x(1)) > before);
}
