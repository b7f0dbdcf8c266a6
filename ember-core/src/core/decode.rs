//! Translates raw opcode words into handler + operand records.
//!
//! Decoding happens at most once per cache entry (see
//! [`super::insn_cache`]): the decoder fills in the permanent handler
//! function pointer and the operand descriptors. Unmatched words get the
//! illegal-instruction handler installed, so the exception is raised at
//! execution time, in program order.

use super::execute;
use super::insn_cache::{DecodedInsn, InsnHandler, InsnRef};
use super::irq::Exception;
use super::regfile::Specifier;
use super::Core;
use crate::io::SystemBus;
use thiserror::Error;

/// Instruction set extensions selected by the `isa` configuration string.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Isa {
    /// Integer multiplication and division.
    pub m: bool,
    /// Compressed (16-bit) instructions.
    pub c: bool,
}

#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum IsaError {
    #[error("isa string must start with \"rv32i\", got {0:?}")]
    UnsupportedBase(String),
    #[error("unsupported isa extension {1:?} in {0:?}")]
    UnsupportedExtension(String, char),
}

impl Isa {
    /// Parses an isa string of the form `rv32i[m][c]`.
    pub fn parse(isa: &str) -> Result<Self, IsaError> {
        let extensions = isa
            .strip_prefix("rv32i")
            .ok_or_else(|| IsaError::UnsupportedBase(isa.to_string()))?;
        let mut parsed = Self { m: false, c: false };
        for extension in extensions.chars() {
            match extension {
                'm' => parsed.m = true,
                'c' => parsed.c = true,
                other => return Err(IsaError::UnsupportedExtension(isa.to_string(), other)),
            }
        }
        Ok(parsed)
    }
}

/// Everything the decoder derives from one raw opcode word. The caller
/// installs this into the cache entry.
#[derive(Debug)]
pub struct Decoded<B: SystemBus> {
    pub handler: InsnHandler<B>,
    /// Instruction size in bytes: 2 or 4.
    pub size: u8,
    pub rd: Specifier,
    pub rs1: Specifier,
    pub rs2: Specifier,
    /// Immediate operand. For CSR instructions this is the 12-bit CSR
    /// specifier; the 5-bit immediate of the `csrr*i` forms travels in the
    /// `rs1` field, as in the hardware encoding.
    pub imm: i32,
    /// Branch target when statically known, otherwise 0.
    pub target: u32,
}

impl<B: SystemBus> Decoded<B> {
    fn illegal() -> Self {
        Self {
            handler: execute::illegal,
            size: 4,
            rd: Specifier::X0,
            rs1: Specifier::X0,
            rs2: Specifier::X0,
            imm: 0,
            target: 0,
        }
    }
}

/// The decoder. Owns the opcode tables, parameterized by the configured
/// extensions.
#[derive(Debug, Clone)]
pub struct Decode {
    isa: Isa,
}

impl Decode {
    pub fn new(isa: Isa) -> Self {
        Self { isa }
    }

    /// Decodes the instruction at `addr`. `word` holds the raw bytes; for a
    /// compressed instruction only the low halfword is used.
    pub fn decode<B: SystemBus>(&self, addr: u32, word: u32) -> Decoded<B> {
        if word & 0b11 != 0b11 {
            return match self.isa.c {
                true => self
                    .decode_compressed(addr, word as u16)
                    .unwrap_or_else(Decoded::illegal),
                false => Decoded::illegal(),
            };
        }
        self.decode_full(addr, word).unwrap_or_else(Decoded::illegal)
    }

    fn decode_full<B: SystemBus>(&self, addr: u32, word: u32) -> Option<Decoded<B>> {
        let decoded = |handler| Decoded::<B> {
            handler,
            size: 4,
            rd: rd(word),
            rs1: rs1(word),
            rs2: rs2(word),
            imm: 0,
            target: 0,
        };

        #[allow(clippy::unusual_byte_groupings)]
        match word & 0x7F {
            // LUI
            0b01_101_11 => Some(Decoded {
                imm: u_imm(word),
                ..decoded(execute::lui)
            }),
            // AUIPC
            0b00_101_11 => Some(Decoded {
                imm: u_imm(word),
                ..decoded(execute::auipc)
            }),
            // JAL
            0b11_011_11 => Some(Decoded {
                imm: j_imm(word),
                target: addr.wrapping_add_signed(j_imm(word)),
                ..decoded(execute::jal)
            }),
            // JALR
            0b11_001_11 => (funct3(word) == 0).then(|| Decoded {
                imm: i_imm(word),
                ..decoded(execute::jalr)
            }),
            // BRANCH
            0b11_000_11 => {
                let handler: InsnHandler<B> = match funct3(word) {
                    0b000 => execute::beq,
                    0b001 => execute::bne,
                    0b100 => execute::blt,
                    0b101 => execute::bge,
                    0b110 => execute::bltu,
                    0b111 => execute::bgeu,
                    _ => return None,
                };
                Some(Decoded {
                    imm: b_imm(word),
                    target: addr.wrapping_add_signed(b_imm(word)),
                    ..decoded(handler)
                })
            }
            // LOAD
            0b00_000_11 => {
                let handler: InsnHandler<B> = match funct3(word) {
                    0b000 => execute::lb,
                    0b001 => execute::lh,
                    0b010 => execute::lw,
                    0b100 => execute::lbu,
                    0b101 => execute::lhu,
                    _ => return None,
                };
                Some(Decoded {
                    imm: i_imm(word),
                    ..decoded(handler)
                })
            }
            // STORE
            0b01_000_11 => {
                let handler: InsnHandler<B> = match funct3(word) {
                    0b000 => execute::sb,
                    0b001 => execute::sh,
                    0b010 => execute::sw,
                    _ => return None,
                };
                Some(Decoded {
                    imm: s_imm(word),
                    ..decoded(handler)
                })
            }
            // OP-IMM
            0b00_100_11 => {
                let handler: InsnHandler<B> = match funct3(word) {
                    0b000 => execute::addi,
                    0b010 => execute::slti,
                    0b011 => execute::sltiu,
                    0b100 => execute::xori,
                    0b110 => execute::ori,
                    0b111 => execute::andi,
                    0b001 if funct7(word) == 0 => {
                        return Some(Decoded {
                            imm: shamt(word) as i32,
                            ..decoded(execute::slli)
                        })
                    }
                    0b101 if funct7(word) == 0 => {
                        return Some(Decoded {
                            imm: shamt(word) as i32,
                            ..decoded(execute::srli)
                        })
                    }
                    0b101 if funct7(word) == 0b0100000 => {
                        return Some(Decoded {
                            imm: shamt(word) as i32,
                            ..decoded(execute::srai)
                        })
                    }
                    _ => return None,
                };
                Some(Decoded {
                    imm: i_imm(word),
                    ..decoded(handler)
                })
            }
            // OP
            0b01_100_11 => {
                let handler: InsnHandler<B> = match (funct7(word), funct3(word)) {
                    (0b0000000, 0b000) => execute::add,
                    (0b0000000, 0b001) => execute::sll,
                    (0b0000000, 0b010) => execute::slt,
                    (0b0000000, 0b011) => execute::sltu,
                    (0b0000000, 0b100) => execute::xor,
                    (0b0000000, 0b101) => execute::srl,
                    (0b0000000, 0b110) => execute::or,
                    (0b0000000, 0b111) => execute::and,
                    (0b0100000, 0b000) => execute::sub,
                    (0b0100000, 0b101) => execute::sra,
                    (0b0000001, funct3) if self.isa.m => match funct3 {
                        0b000 => execute::mul,
                        0b001 => execute::mulh,
                        0b010 => execute::mulhsu,
                        0b011 => execute::mulhu,
                        0b100 => execute::div,
                        0b101 => execute::divu,
                        0b110 => execute::rem,
                        0b111 => execute::remu,
                        _ => unreachable!(),
                    },
                    _ => return None,
                };
                Some(decoded(handler))
            }
            // MISC-MEM
            0b00_011_11 => (funct3(word) == 0).then(|| decoded(execute::fence)),
            // SYSTEM
            0b11_100_11 => match funct3(word) {
                0b000 => {
                    let handler: InsnHandler<B> = match word {
                        0x0000_0073 => execute::ecall,
                        0x0010_0073 => execute::ebreak,
                        0x3020_0073 => execute::mret,
                        0x7B20_0073 => execute::dret,
                        0x1050_0073 => execute::wfi,
                        _ => return None,
                    };
                    Some(decoded(handler))
                }
                funct3 @ (0b001..=0b011 | 0b101..=0b111) => {
                    let handler: InsnHandler<B> = match funct3 & 0b011 {
                        0b001 => {
                            if funct3 & 0b100 == 0 {
                                execute::csrrw
                            } else {
                                execute::csrrwi
                            }
                        }
                        0b010 => {
                            if funct3 & 0b100 == 0 {
                                execute::csrrs
                            } else {
                                execute::csrrsi
                            }
                        }
                        _ => {
                            if funct3 & 0b100 == 0 {
                                execute::csrrc
                            } else {
                                execute::csrrci
                            }
                        }
                    };
                    Some(Decoded {
                        imm: csr_specifier(word) as i32,
                        ..decoded(handler)
                    })
                }
                _ => None,
            },
            _ => None,
        }
    }

    /// Expands a 16-bit compressed instruction into the same handler set as
    /// the full-width forms, with `size = 2`.
    fn decode_compressed<B: SystemBus>(&self, addr: u32, word: u16) -> Option<Decoded<B>> {
        let decoded = |handler, rd, rs1, rs2, imm| Decoded::<B> {
            handler,
            size: 2,
            rd,
            rs1,
            rs2,
            imm,
            target: 0,
        };
        let x0 = Specifier::X0;
        let x1 = Specifier::from_u5(1);
        let x2 = Specifier::from_u5(2);
        // Registers x8..x15 as used by the three-bit register fields.
        let rd_p = Specifier::from_u5(8 + ((word >> 2) & 0x7) as u8);
        let rs1_p = Specifier::from_u5(8 + ((word >> 7) & 0x7) as u8);
        let full_rd = Specifier::from_u5(((word >> 7) & 0x1F) as u8);
        let full_rs2 = Specifier::from_u5(((word >> 2) & 0x1F) as u8);
        let bit = |i: u16| ((word >> i) & 1) as u32;

        match (word & 0b11, (word >> 13) & 0b111) {
            (0b00, 0b000) => {
                // C.ADDI4SPN
                let nzuimm = (bit(12) << 5 | bit(11) << 4)
                    | (bit(10) << 9 | bit(9) << 8 | bit(8) << 7 | bit(7) << 6)
                    | bit(6) << 2
                    | bit(5) << 3;
                (nzuimm != 0).then(|| decoded(execute::addi, rd_p, x2, x0, nzuimm as i32))
            }
            (0b00, 0b010) => {
                // C.LW
                let uimm = (bit(12) << 5 | bit(11) << 4 | bit(10) << 3) | bit(6) << 2 | bit(5) << 6;
                Some(decoded(execute::lw, rd_p, rs1_p, x0, uimm as i32))
            }
            (0b00, 0b110) => {
                // C.SW
                let uimm = (bit(12) << 5 | bit(11) << 4 | bit(10) << 3) | bit(6) << 2 | bit(5) << 6;
                Some(decoded(execute::sw, x0, rs1_p, rd_p, uimm as i32))
            }
            (0b01, 0b000) => {
                // C.ADDI (and the canonical C.NOP)
                let imm = sign_extend(bit(12) << 5 | ((word >> 2) & 0x1F) as u32, 6);
                Some(decoded(execute::addi, full_rd, full_rd, x0, imm))
            }
            (0b01, 0b001) => {
                // C.JAL
                let imm = cj_imm(word);
                Some(Decoded {
                    target: addr.wrapping_add_signed(imm),
                    ..decoded(execute::jal, x1, x0, x0, imm)
                })
            }
            (0b01, 0b010) => {
                // C.LI
                let imm = sign_extend(bit(12) << 5 | ((word >> 2) & 0x1F) as u32, 6);
                Some(decoded(execute::addi, full_rd, x0, x0, imm))
            }
            (0b01, 0b011) => {
                if u8::from(full_rd) == 2 {
                    // C.ADDI16SP
                    let imm = sign_extend(
                        bit(12) << 9 | bit(6) << 4 | bit(5) << 6 | bit(4) << 8 | bit(3) << 7
                            | bit(2) << 5,
                        10,
                    );
                    (imm != 0).then(|| decoded(execute::addi, x2, x2, x0, imm))
                } else {
                    // C.LUI
                    let imm = sign_extend(bit(12) << 17 | (((word >> 2) & 0x1F) as u32) << 12, 18);
                    (imm != 0).then(|| decoded(execute::lui, full_rd, x0, x0, imm))
                }
            }
            (0b01, 0b100) => match (word >> 10) & 0b11 {
                0b00 => {
                    // C.SRLI
                    let shamt = bit(12) << 5 | ((word >> 2) & 0x1F) as u32;
                    (shamt < 32).then(|| decoded(execute::srli, rs1_p, rs1_p, x0, shamt as i32))
                }
                0b01 => {
                    // C.SRAI
                    let shamt = bit(12) << 5 | ((word >> 2) & 0x1F) as u32;
                    (shamt < 32).then(|| decoded(execute::srai, rs1_p, rs1_p, x0, shamt as i32))
                }
                0b10 => {
                    // C.ANDI
                    let imm = sign_extend(bit(12) << 5 | ((word >> 2) & 0x1F) as u32, 6);
                    Some(decoded(execute::andi, rs1_p, rs1_p, x0, imm))
                }
                _ => {
                    if bit(12) != 0 {
                        return None;
                    }
                    let handler: InsnHandler<B> = match (word >> 5) & 0b11 {
                        0b00 => execute::sub,
                        0b01 => execute::xor,
                        0b10 => execute::or,
                        _ => execute::and,
                    };
                    Some(decoded(handler, rs1_p, rs1_p, rd_p, 0))
                }
            },
            (0b01, 0b101) => {
                // C.J
                let imm = cj_imm(word);
                Some(Decoded {
                    target: addr.wrapping_add_signed(imm),
                    ..decoded(execute::jal, x0, x0, x0, imm)
                })
            }
            (0b01, 0b110 | 0b111) => {
                // C.BEQZ / C.BNEZ
                let imm = sign_extend(
                    bit(12) << 8 | bit(11) << 4 | bit(10) << 3 | bit(6) << 7 | bit(5) << 6
                        | bit(4) << 2
                        | bit(3) << 1
                        | bit(2) << 5,
                    9,
                );
                let handler: InsnHandler<B> = match (word >> 13) & 1 {
                    0 => execute::beq,
                    _ => execute::bne,
                };
                Some(Decoded {
                    target: addr.wrapping_add_signed(imm),
                    ..decoded(handler, x0, rs1_p, x0, imm)
                })
            }
            (0b10, 0b000) => {
                // C.SLLI
                let shamt = bit(12) << 5 | ((word >> 2) & 0x1F) as u32;
                (shamt < 32).then(|| decoded(execute::slli, full_rd, full_rd, x0, shamt as i32))
            }
            (0b10, 0b010) => {
                // C.LWSP
                let uimm = bit(12) << 5 | (((word >> 4) & 0b111) as u32) << 2 | bit(3) << 6
                    | bit(2) << 7;
                (u8::from(full_rd) != 0)
                    .then(|| decoded(execute::lw, full_rd, x2, x0, uimm as i32))
            }
            (0b10, 0b100) => match (bit(12), u8::from(full_rs2), u8::from(full_rd)) {
                (0, 0, 0) => None,
                // C.JR
                (0, 0, _) => Some(decoded(execute::jalr, x0, full_rd, x0, 0)),
                // C.MV
                (0, _, _) => Some(decoded(execute::add, full_rd, x0, full_rs2, 0)),
                // C.EBREAK
                (_, 0, 0) => Some(decoded(execute::ebreak, x0, x0, x0, 0)),
                // C.JALR
                (_, 0, _) => Some(decoded(execute::jalr, x1, full_rd, x0, 0)),
                // C.ADD
                (_, _, _) => Some(decoded(execute::add, full_rd, full_rd, full_rs2, 0)),
            },
            (0b10, 0b110) => {
                // C.SWSP
                let uimm = (((word >> 9) & 0b1111) as u32) << 2 | bit(8) << 6 | bit(7) << 7;
                Some(decoded(execute::sw, x0, x2, full_rs2, uimm as i32))
            }
            _ => None,
        }
    }
}

/// Returns the 5-bit *rd* value for R-type, I-type, U-type, J-type instructions.
fn rd(word: u32) -> Specifier {
    Specifier::from_u5(((word >> 7) & 0x1F) as u8)
}

/// Returns the 5-bit *rs1* value for R-type, I-type, S-type, B-type instructions.
fn rs1(word: u32) -> Specifier {
    Specifier::from_u5(((word >> 15) & 0x1F) as u8)
}

/// Returns the 5-bit *rs2* value for R-type, S-type, B-type instructions.
fn rs2(word: u32) -> Specifier {
    Specifier::from_u5(((word >> 20) & 0x1F) as u8)
}

/// Returns the 3-bit *funct3* value for R-type, I-type, S-type, B-type instructions.
fn funct3(word: u32) -> u8 {
    ((word >> 12) & 0b111) as u8
}

/// Returns the 7-bit *funct7* value for R-type instructions.
fn funct7(word: u32) -> u8 {
    (word >> 25) as u8
}

/// Returns the 5-bit *shamt* value for the immediate shift instructions.
fn shamt(word: u32) -> u32 {
    (word >> 20) & 0x1F
}

/// Returns the 12-bit CSR specifier of a SYSTEM instruction.
fn csr_specifier(word: u32) -> u16 {
    (word >> 20) as u16
}

/// Returns the 12-bit I-immediate sign-extended to 32 bits.
fn i_imm(word: u32) -> i32 {
    word as i32 >> 20
}

/// Returns the 12-bit S-immediate sign-extended to 32 bits.
fn s_imm(word: u32) -> i32 {
    let imm_11_5 = word & 0xFE00_0000;
    let imm_4_0 = word & 0x0000_0F80;
    (imm_11_5 | (imm_4_0 << 13)) as i32 >> 20
}

/// Returns the 13-bit B-immediate sign-extended to 32 bits.
fn b_imm(word: u32) -> i32 {
    let imm_12 = word & 0x8000_0000;
    let imm_10_5 = word & 0x7E00_0000;
    let imm_4_1 = word & 0x0000_0F00;
    let imm_11 = word & 0x0000_0080;
    (imm_12 | (imm_11 << 23) | (imm_10_5 >> 1) | (imm_4_1 << 12)) as i32 >> 19
}

/// Returns the signed 32-bit U-immediate.
fn u_imm(word: u32) -> i32 {
    (word & 0xFFFF_F000) as i32
}

/// Returns the 21-bit J-immediate sign-extended to 32 bits.
fn j_imm(word: u32) -> i32 {
    let imm_20 = word & 0x8000_0000;
    let imm_10_1 = word & 0x7FE0_0000;
    let imm_11 = word & 0x0010_0000;
    let imm_19_12 = word & 0x000F_F000;
    (imm_20 | (imm_19_12 << 11) | (imm_11 << 2) | (imm_10_1 >> 9)) as i32 >> 11
}

/// Returns the 12-bit immediate of the compressed jump forms, sign-extended.
fn cj_imm(word: u16) -> i32 {
    let bit = |i: u16| ((word >> i) & 1) as u32;
    sign_extend(
        bit(12) << 11
            | bit(11) << 4
            | bit(10) << 9
            | bit(9) << 8
            | bit(8) << 10
            | bit(7) << 6
            | bit(6) << 7
            | bit(5) << 3
            | bit(4) << 2
            | bit(3) << 1
            | bit(2) << 5,
        12,
    )
}

/// Sign-extends the low `bits` bits of `value`.
fn sign_extend(value: u32, bits: u32) -> i32 {
    debug_assert!(bits > 0 && bits < 32);
    (value << (32 - bits)) as i32 >> (32 - bits)
}

/// The decode-on-demand sentinel installed in fresh cache entries.
///
/// Executing it decodes the raw word the prefetcher materialised, installs
/// the permanent handler and operand record into the entry, then re-enters
/// execution for the same instruction through the freshly installed handler.
pub(crate) fn decode_on_demand<B: SystemBus>(
    core: &mut Core<B>,
    insn: &DecodedInsn<B>,
) -> InsnRef {
    let decoded: Decoded<B> = core.decode.decode(insn.addr, insn.opcode);
    let Ok(current) = core.try_insn_get(insn.addr) else {
        // The mapping changed under us since the fetch.
        return core.exception_raise(Exception::InsnAccessFault);
    };
    let next = core
        .try_insn_get(insn.addr.wrapping_add(decoded.size as u32))
        .ok();
    core.insn_cache.install(
        current,
        decoded.handler,
        decoded.size,
        decoded.rd,
        decoded.rs1,
        decoded.rs2,
        decoded.imm,
        decoded.target,
        next,
    );
    let installed = *core
        .insn_cache
        .insn(current)
        .expect("a just-installed entry is live");
    (installed.handler)(core, &installed)
}
