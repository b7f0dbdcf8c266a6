//! Control and status registers.
//!
//! > RISC-V defines a separate address space of 4096 Control and Status
//! > registers associated with each hart.
//!
//! Only the registers this core actually implements get dedicated storage;
//! anything else can be declared through [`Config::extra_csrs`]
//! (see [`super::Config`]) and is backed by a sparse map. Accessing an
//! undeclared specifier raises an illegal-instruction exception through the
//! regular exception path.

use nohash::IntMap;
use thiserror::Error;

/// A 12-bit CSR specifier.
pub type CsrSpecifier = u16;

/// Machine status register. Only the MIE bit is implemented; it shadows the
/// interrupt-enable latch of the irq subsystem.
pub const MSTATUS: CsrSpecifier = 0x300;
/// Machine exception program counter.
pub const MEPC: CsrSpecifier = 0x341;
/// Machine trap cause.
pub const MCAUSE: CsrSpecifier = 0x342;
/// Debug exception program counter.
pub const DEPC: CsrSpecifier = 0x7B1;
/// First of the 32 performance counter value registers (`pccr0..pccr31`).
pub const PCCR_FIRST: CsrSpecifier = 0x780;
/// Last performance counter value register.
pub const PCCR_LAST: CsrSpecifier = 0x79F;
/// Performance counter event register: a bitmap selecting which events are
/// counted.
pub const PCER: CsrSpecifier = 0x7A0;
/// Performance counter mode register. Bit 0 globally enables counting.
pub const PCMR: CsrSpecifier = 0x7A1;
/// Hart id, read-only, composed from the cluster and core id configuration.
pub const MHARTID: CsrSpecifier = 0xF14;

/// In mcause, set for interrupts and clear for exceptions.
pub const MCAUSE_IRQ_FLAG: u32 = 1 << 31;

/// Number of implemented performance counters.
pub const PCCR_COUNT: usize = 32;

const_assert_eq!(PCCR_LAST - PCCR_FIRST + 1, PCCR_COUNT as u16);

/// Bit 0 of pcmr: counting globally enabled.
pub const PCMR_ACTIVE: u32 = 1 << 0;

/// MIE bit position in mstatus.
const MSTATUS_MIE_BIT: u32 = 3;

/// Errors that can occur when attempting to access a CSR.
#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum CsrError {
    #[error("unsupported CSR: {0:#05X}")]
    Unsupported(CsrSpecifier),
    #[error("writing to read-only CSR {0:#05X} is invalid")]
    WriteToReadOnly(CsrSpecifier),
}

/// Backing storage for the CSR address space.
///
/// Reads and writes of `mstatus` and `mhartid` are handled by the core
/// itself, since their values live elsewhere (the irq subsystem and the
/// configuration respectively).
#[derive(Debug, Clone)]
pub struct CsrFile {
    pub mepc: u32,
    pub mcause: u32,
    pub depc: u32,
    pub pcer: u32,
    pub pcmr: u32,
    pub pccr: [u32; PCCR_COUNT],
    /// Storage for platform-declared specifiers outside the implemented set.
    extra: IntMap<CsrSpecifier, u32>,
}

impl CsrFile {
    /// Creates a reset CSR file. `extra` declares additional plain
    /// read/write specifiers backed by sparse storage.
    pub fn new(extra: impl IntoIterator<Item = CsrSpecifier>) -> Self {
        Self {
            mepc: 0,
            mcause: 0,
            depc: 0,
            pcer: 0,
            pcmr: 0,
            pccr: [0; PCCR_COUNT],
            extra: extra.into_iter().map(|specifier| (specifier, 0)).collect(),
        }
    }

    /// Force all registers back to their reset values, keeping the declared
    /// extra specifiers.
    pub fn reset(&mut self) {
        self.mepc = 0;
        self.mcause = 0;
        self.depc = 0;
        self.pcer = 0;
        self.pcmr = 0;
        self.pccr = [0; PCCR_COUNT];
        for value in self.extra.values_mut() {
            *value = 0;
        }
    }

    /// Reads a CSR owned by this file. `mstatus` and `mhartid` are not owned
    /// here and return [`CsrError::Unsupported`].
    pub fn read(&self, specifier: CsrSpecifier) -> Result<u32, CsrError> {
        match specifier {
            MEPC => Ok(self.mepc),
            MCAUSE => Ok(self.mcause),
            DEPC => Ok(self.depc),
            PCER => Ok(self.pcer),
            PCMR => Ok(self.pcmr),
            PCCR_FIRST..=PCCR_LAST => Ok(self.pccr[(specifier - PCCR_FIRST) as usize]),
            _ => self
                .extra
                .get(&specifier)
                .copied()
                .ok_or(CsrError::Unsupported(specifier)),
        }
    }

    /// Writes a CSR owned by this file.
    pub fn write(&mut self, specifier: CsrSpecifier, value: u32) -> Result<(), CsrError> {
        match specifier {
            MEPC => self.mepc = value & !1,
            MCAUSE => self.mcause = value,
            DEPC => self.depc = value & !1,
            PCER => self.pcer = value,
            PCMR => self.pcmr = value,
            PCCR_FIRST..=PCCR_LAST => self.pccr[(specifier - PCCR_FIRST) as usize] = value,
            MHARTID => return Err(CsrError::WriteToReadOnly(specifier)),
            _ => match self.extra.get_mut(&specifier) {
                Some(slot) => *slot = value,
                None => return Err(CsrError::Unsupported(specifier)),
            },
        }
        Ok(())
    }
}

/// Composes the mstatus value from the interrupt-enable latch.
pub fn mstatus_from_irq_enable(irq_enable: bool) -> u32 {
    (irq_enable as u32) << MSTATUS_MIE_BIT
}

/// Extracts the MIE bit from an mstatus value.
pub fn irq_enable_from_mstatus(mstatus: u32) -> bool {
    mstatus & (1 << MSTATUS_MIE_BIT) != 0
}
