//! Instruction decoder and opcode mapper.
//!
//! Decode is committed on the fetch-acknowledge cycle (`do_decode`): source
//! and destination indices, the format-selected immediate, the illegal
//! classification, and the microcode entry address all become valid on the
//! following cycle. CSR instructions need a second pass — the address
//! classification has to be folded into the handler choice — modeled here as
//! an explicit two-state sub-machine rather than incidental register timing:
//! `commit` arms `Classify`, and the next `tick` resolves it.

use crate::csr::{self, CsrClass, cause};
use crate::exception::DecodeException;
use crate::insn::{Insn, Opcode, csr_op};
use crate::ucode::TRAP_SLOT;

/// Microcode entry addresses emitted by the opcode mapper. The default
/// microprogram places its routines to match.
pub mod map {
    /// Load handlers: `LOAD_BASE + funct3`.
    pub const LOAD_BASE: u8 = 0x08;
    /// Store handlers: `STORE_BASE + funct3`.
    pub const STORE_BASE: u8 = 0x10;
    /// First-pass CSR trampoline; the second pass re-dispatches from here.
    pub const CSR_PENDING: u8 = 0x24;
    /// Read of a read-only-zero CSR.
    pub const CSR_RO0: u8 = 0x25;
    /// CSRRW with rd = x0: write only, read-back skipped.
    pub const CSR_W: u8 = 0x26;
    pub const CSR_RW: u8 = 0x27;
    /// CSRRS/RC/RSI/RCI with zero source: pure read, write skipped.
    pub const CSR_R: u8 = 0x28;
    pub const CSR_RS: u8 = 0x29;
    pub const CSR_RC: u8 = 0x2A;
    /// CSRRWI with rd = x0.
    pub const CSR_WI: u8 = 0x2B;
    pub const CSR_RWI: u8 = 0x2C;
    pub const CSR_RSI: u8 = 0x2D;
    pub const CSR_RCI: u8 = 0x2E;
    /// FENCE and WFI both retire as a plain next-instruction step.
    pub const FENCE: u8 = 0x30;
    /// Immediate-operand ALU handlers: `OP_IMM_BASE + funct3` (+8 for the
    /// arithmetic-shift variant).
    pub const OP_IMM_BASE: u8 = 0x40;
    pub const AUIPC: u8 = 0x50;
    /// Branch handlers: `BRANCH_BASE + funct3`.
    pub const BRANCH_BASE: u8 = 0x88;
    pub const JALR: u8 = 0x98;
    pub const JAL: u8 = 0xB0;
    /// Register-operand ALU handlers: `OP_BASE + funct3` (+8 for the
    /// SUB/SRA variants).
    pub const OP_BASE: u8 = 0xC0;
    pub const LUI: u8 = 0xD0;
    pub const MRET: u8 = 0xF8;
}

/// Second-pass state of the CSR decode sub-machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CsrPass {
    Idle,
    /// Armed by `commit` for a CSR instruction; resolved on the next tick.
    Classify {
        class: CsrClass,
        ro_space: bool,
        op: u8,
        dst: u8,
        src: u8,
    },
}

#[derive(Debug)]
pub struct Decode {
    /// rs1 index latched at decode commit.
    pub src_a: u8,
    /// rs2 index latched at decode commit.
    pub src_b: u8,
    /// rd index latched at decode commit.
    pub dst: u8,
    /// Format-selected, extended immediate.
    pub imm: u32,
    /// Microcode entry address for the committed instruction.
    pub requested_op: u8,
    /// Compressed CSR slot address for the committed instruction.
    pub csr_encoding: u8,
    /// Illegal classification; valid for exactly one cycle per pass.
    pub exception: DecodeException,
    state: CsrPass,
}

impl Default for Decode {
    fn default() -> Self {
        Decode::new()
    }
}

impl Decode {
    pub fn new() -> Self {
        Decode {
            src_a: 0,
            src_b: 0,
            dst: 0,
            imm: 0,
            requested_op: TRAP_SLOT,
            csr_encoding: 0,
            exception: DecodeException::default(),
            state: CsrPass::Idle,
        }
    }

    /// Advance the CSR sub-machine one cycle. Runs every clock, before any
    /// `commit` for the same edge, so a pass armed last cycle resolves now.
    pub fn tick(&mut self) {
        match self.state {
            CsrPass::Idle => {
                self.exception = DecodeException::default();
            }
            CsrPass::Classify {
                class,
                ro_space,
                op,
                dst,
                src,
            } => {
                self.state = CsrPass::Idle;
                self.exception = DecodeException::default();

                // Illegal classification short-circuits: the sequencer
                // diverts to the exception handler before any routine with
                // register side effects is reached.
                let write_side = op == csr_op::RW || op == csr_op::RWI || src != 0;
                if class == CsrClass::Illegal || (ro_space && write_side) {
                    self.exception = DecodeException {
                        valid: true,
                        cause: cause::ILLEGAL_INSN,
                    };
                    return;
                }

                self.requested_op = match class {
                    CsrClass::ReadOnlyZero => map::CSR_RO0,
                    _ => match (op, dst, src) {
                        (csr_op::RW, 0, _) => map::CSR_W,
                        (csr_op::RW, _, _) => map::CSR_RW,
                        (csr_op::RS | csr_op::RC, _, 0) => map::CSR_R,
                        (csr_op::RS, _, _) => map::CSR_RS,
                        (csr_op::RC, _, _) => map::CSR_RC,
                        (csr_op::RWI, 0, _) => map::CSR_WI,
                        (csr_op::RWI, _, _) => map::CSR_RWI,
                        (csr_op::RSI | csr_op::RCI, _, 0) => map::CSR_R,
                        (csr_op::RSI, _, _) => map::CSR_RSI,
                        _ => map::CSR_RCI,
                    },
                };
            }
        }
    }

    /// Decode commit: latch everything derivable from the fetched word.
    /// Results are valid from the next cycle.
    pub fn commit(&mut self, raw: u32) {
        let insn = Insn(raw);
        let opcode = insn.opcode();

        self.src_a = insn.rs1();
        self.src_b = insn.rs2();
        self.dst = insn.rd();
        self.state = CsrPass::Idle;

        // Immediate selection by format; opcodes without an immediate leave
        // the latch untouched, exactly like a disabled enable.
        match opcode {
            Opcode::OpImm | Opcode::Jalr | Opcode::Load => self.imm = insn.imm_i(),
            Opcode::Lui | Opcode::Auipc => self.imm = insn.imm_u(),
            Opcode::Jal => self.imm = insn.imm_j(),
            Opcode::Branch => self.imm = insn.imm_b(),
            Opcode::Store => self.imm = insn.imm_s(),
            _ => {}
        }

        self.requested_op = self.map_entry(insn);
        self.exception = self.classify(insn);
    }

    /// The opcode mapper's first pass.
    fn map_entry(&mut self, insn: Insn) -> u8 {
        let f3 = insn.funct3();
        let alt = (insn.funct7() >> 5 & 1) << 3;
        match insn.opcode() {
            Opcode::OpImm => {
                if f3 == 1 || f3 == 5 {
                    map::OP_IMM_BASE | f3 | alt
                } else {
                    map::OP_IMM_BASE | f3
                }
            }
            Opcode::Lui => map::LUI,
            Opcode::Auipc => map::AUIPC,
            Opcode::Op => map::OP_BASE | f3 | alt,
            Opcode::Jal => map::JAL,
            Opcode::Jalr => map::JALR,
            Opcode::Branch => map::BRANCH_BASE | f3,
            Opcode::Load => map::LOAD_BASE | f3,
            Opcode::Store => map::STORE_BASE | f3,
            Opcode::MiscMem => map::FENCE,
            Opcode::System => {
                if insn.raw() == Insn::MRET {
                    map::MRET
                } else if insn.raw() == Insn::WFI {
                    map::FENCE
                } else if f3 != 0 && f3 != 4 {
                    // CSR access: arm the second pass; the trampoline word
                    // re-dispatches once classification is in.
                    self.csr_encoding = csr::compress(insn.csr_addr());
                    self.state = CsrPass::Classify {
                        class: csr::classify(insn.csr_addr()),
                        ro_space: csr::read_only_space(insn.csr_addr()),
                        op: f3,
                        dst: insn.rd(),
                        src: insn.rs1(),
                    };
                    map::CSR_PENDING
                } else {
                    // ECALL/EBREAK and malformed SYSTEM encodings trap via
                    // the decoder-exception path and never dispatch.
                    TRAP_SLOT
                }
            }
            Opcode::Custom0 | Opcode::Unknown => TRAP_SLOT,
        }
    }

    /// Statically- and probably-illegal classification.
    fn classify(&self, insn: Insn) -> DecodeException {
        let f3 = insn.funct3();
        let f7 = insn.funct7();
        let mut exc = DecodeException {
            valid: false,
            cause: cause::ILLEGAL_INSN,
        };

        // Malformed encodings are unconditionally illegal, regardless of
        // what the opcode field claims. Covers the all-zeros word and every
        // compressed encoding.
        if insn.raw() & 0b11 != 0b11 {
            exc.valid = true;
            return exc;
        }

        match insn.opcode() {
            Opcode::OpImm => match f3 {
                1 => exc.valid = f7 != 0,
                5 => exc.valid = f7 != 0 && f7 != 0b0100000,
                _ => {}
            },
            Opcode::Op => {
                if f3 == 0 || f3 == 5 {
                    exc.valid = f7 != 0 && f7 != 0b0100000;
                } else {
                    exc.valid = f7 != 0;
                }
            }
            Opcode::Lui | Opcode::Auipc | Opcode::Jal => {}
            Opcode::Jalr => exc.valid = f3 != 0,
            Opcode::Branch => exc.valid = f3 == 2 || f3 == 3,
            Opcode::Load => exc.valid = f3 == 3 || f3 >= 6,
            Opcode::Store => exc.valid = f3 >= 3,
            Opcode::MiscMem => exc.valid = f3 != 0,
            Opcode::System => {
                if insn.raw() == Insn::ECALL {
                    exc.valid = true;
                    exc.cause = cause::ECALL_MMODE;
                } else if insn.raw() == Insn::EBREAK {
                    exc.valid = true;
                    exc.cause = cause::BREAKPOINT;
                } else if insn.raw() == Insn::MRET || insn.raw() == Insn::WFI {
                    // Recognized as fixed bit patterns.
                } else if f3 != 0 && f3 != 4 {
                    // CSR access; legality is the second pass's call.
                } else {
                    exc.valid = true;
                }
            }
            // Catch-all: custom space, reserved major opcodes, all-ones.
            Opcode::Custom0 | Opcode::Unknown => exc.valid = true,
        }
        exc
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::csr::{CSR_MSCRATCH, CSR_MVENDORID};

    fn commit(raw: u32) -> Decode {
        let mut d = Decode::new();
        d.commit(raw);
        d
    }

    fn csr_insn(f3: u8, csr: u16, rs1: u8, rd: u8) -> u32 {
        (csr as u32) << 20
            | (rs1 as u32) << 15
            | (f3 as u32) << 12
            | (rd as u32) << 7
            | 0b1110011
    }

    #[test]
    fn test_malformed_always_illegal() {
        for raw in [0x0000_0000u32, 0xFFFF_FFFF, 0x0000_0001, 0xDEAD_BEF2] {
            let d = commit(raw);
            assert!(d.exception.valid, "{raw:#010x}");
            assert_eq!(d.exception.cause, cause::ILLEGAL_INSN);
        }
    }

    #[test]
    fn test_basic_mapping() {
        // ADDI x1, x0, 1
        let d = commit(0x0010_0093);
        assert!(!d.exception.valid);
        assert_eq!(d.requested_op, map::OP_IMM_BASE);
        assert_eq!(d.dst, 1);
        assert_eq!(d.imm, 1);
        // ADD x3, x1, x2
        let d = commit(0x0020_81B3);
        assert_eq!(d.requested_op, map::OP_BASE);
        // SUB x3, x1, x2
        let d = commit(0x4020_81B3);
        assert_eq!(d.requested_op, map::OP_BASE | 0x8);
        // SRAI x1, x1, 2
        let d = commit(0x4020_D093);
        assert_eq!(d.requested_op, map::OP_IMM_BASE | 0x5 | 0x8);
        assert!(!d.exception.valid);
    }

    #[test]
    fn test_reserved_funct7_bits_illegal() {
        // ADD with funct7 = 0b0000001 (the M extension's MUL).
        let d = commit(0x0220_81B3);
        assert!(d.exception.valid);
        // SLLI with nonzero funct7.
        let d = commit(0x0820_9093);
        assert!(d.exception.valid);
        // SRLI with funct7 = 0b0100000 is SRAI: legal.
        let d = commit(0x4020_D093);
        assert!(!d.exception.valid);
    }

    #[test]
    fn test_unsupported_widths_illegal() {
        // LD (f3=3) is RV64 only.
        let d = commit(0x0000_B003);
        assert!(d.exception.valid);
        // SD (f3=3) likewise.
        let d = commit(0x0000_B023);
        assert!(d.exception.valid);
        // JALR with f3 != 0.
        let d = commit(0x0000_9067);
        assert!(d.exception.valid);
        // Branch f3 = 2 is unassigned.
        let d = commit(0x0000_A063);
        assert!(d.exception.valid);
        // FENCE with nonzero f3.
        let d = commit(0x0000_100F);
        assert!(d.exception.valid);
    }

    #[test]
    fn test_system_fixed_patterns() {
        let d = commit(Insn::ECALL);
        assert!(d.exception.valid);
        assert_eq!(d.exception.cause, cause::ECALL_MMODE);
        let d = commit(Insn::EBREAK);
        assert!(d.exception.valid);
        assert_eq!(d.exception.cause, cause::BREAKPOINT);
        let d = commit(Insn::MRET);
        assert!(!d.exception.valid);
        assert_eq!(d.requested_op, map::MRET);
        let d = commit(Insn::WFI);
        assert!(!d.exception.valid);
        assert_eq!(d.requested_op, map::FENCE);
    }

    #[test]
    fn test_csr_two_pass_dispatch() {
        // CSRRW x1, mscratch, x2: first pass parks on the trampoline.
        let mut d = commit(csr_insn(csr_op::RW, CSR_MSCRATCH, 2, 1));
        assert_eq!(d.requested_op, map::CSR_PENDING);
        assert!(!d.exception.valid);
        // Second pass resolves to the read-write routine.
        d.tick();
        assert_eq!(d.requested_op, map::CSR_RW);
        assert!(!d.exception.valid);
        // And the pulse clears afterwards.
        d.tick();
        assert!(!d.exception.valid);
    }

    #[test]
    fn test_csr_skip_variants() {
        // CSRRW with rd = x0 skips the read-back.
        let mut d = commit(csr_insn(csr_op::RW, CSR_MSCRATCH, 2, 0));
        d.tick();
        assert_eq!(d.requested_op, map::CSR_W);
        // CSRRS with rs1 = x0 is a pure read.
        let mut d = commit(csr_insn(csr_op::RS, CSR_MSCRATCH, 0, 1));
        d.tick();
        assert_eq!(d.requested_op, map::CSR_R);
        // CSRRCI with zero immediate likewise.
        let mut d = commit(csr_insn(csr_op::RCI, CSR_MSCRATCH, 0, 1));
        d.tick();
        assert_eq!(d.requested_op, map::CSR_R);
        // CSRRSI with a nonzero immediate does read-modify-write.
        let mut d = commit(csr_insn(csr_op::RSI, CSR_MSCRATCH, 3, 1));
        d.tick();
        assert_eq!(d.requested_op, map::CSR_RSI);
    }

    #[test]
    fn test_csr_illegal_short_circuits() {
        // Unimplemented CSR address.
        let mut d = commit(csr_insn(csr_op::RW, 0x123, 2, 1));
        d.tick();
        assert!(d.exception.valid);
        assert_eq!(d.exception.cause, cause::ILLEGAL_INSN);
        // Write to read-only space.
        let mut d = commit(csr_insn(csr_op::RW, CSR_MVENDORID, 2, 1));
        d.tick();
        assert!(d.exception.valid);
        // Set with nonzero source in read-only space.
        let mut d = commit(csr_insn(csr_op::RS, CSR_MVENDORID, 2, 1));
        d.tick();
        assert!(d.exception.valid);
        // Pure read of read-only space is fine.
        let mut d = commit(csr_insn(csr_op::RS, CSR_MVENDORID, 0, 1));
        d.tick();
        assert!(!d.exception.valid);
        assert_eq!(d.requested_op, map::CSR_RO0);
    }

    #[test]
    fn test_csr_write_to_ro0_in_writable_space_allowed() {
        // misa is read-only zero but sits in writable space: CSRRW succeeds
        // with the write ignored.
        let mut d = commit(csr_insn(csr_op::RW, 0x301, 2, 1));
        d.tick();
        assert!(!d.exception.valid);
        assert_eq!(d.requested_op, map::CSR_RO0);
    }

    #[test]
    fn test_system_f3_4_illegal() {
        let d = commit(csr_insn(4, 0x300, 0, 0));
        assert!(d.exception.valid);
    }
}
