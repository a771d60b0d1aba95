//! The default microprogram.
//!
//! This table is a data artifact: the engine loads it exactly as it would an
//! externally assembled image (`UcodeRom::from_image` round-trips it). Entry
//! addresses are fixed by the opcode mapper (`decode::map`); routine bodies
//! live in the gaps between them.
//!
//! Timing rules the routines are written against:
//!
//! * a value latched into A/B this cycle reaches the ALU next cycle;
//! * the ALU output visible this cycle is the result of last cycle's op;
//! * a register/CSR read this cycle is on the port next cycle, and the port
//!   holds until the next read;
//! * register/CSR writes, PC loads, and the address/data latches all consume
//!   the output visible *this* cycle.
//!
//! Every routine ends by returning to slot 0 (next fetch) or diverting to
//! the exception handler; the only loops are the bus-acknowledge waits and
//! the shift stall.

use crate::csr::slot;
use crate::decode::map;
use crate::ucode::{
    ASrc, AluCmd, AluOMod, AluOp, BSrc, CondTest, CsrOp, CsrSel, ExceptCtl, JmpType, MemExtend,
    MemSel, MicroWord, PcAction, RegRSel, TRAP_SLOT, UCODE_DEPTH, UcodeRom,
};

// Shared routine words.
const RETIRE: u8 = 0x30; // pc += 4, back to fetch (also the FENCE/WFI entry)
const WRITEBACK: u8 = 0x38; // rd <- ALU output, pc += 4, back to fetch

// Routine blocks, placed in the gaps between mapper entry points.
const CSR_RO0_BODY: u8 = 0x31;
const CSR_W_BODY: u8 = 0x32;
const CSR_R_BODY: u8 = 0x35;
const CSR_WI_BODY: u8 = 0x3A;
const CSR_RW_BODY: u8 = 0x52;
const CSR_RS_BODY: u8 = 0x57;
const CSR_RWI_BODY: u8 = 0x5B;
const LOAD_BODY: [u8; 8] = [0x60, 0x64, 0x68, 0, 0x6C, 0x70, 0, 0]; // by funct3
const STORE_BODY: [u8; 4] = [0x74, 0x7A, 0x80, 0]; // by funct3
const BRANCH_CMP: u8 = 0x90; // six compare words
const BRANCH_TEST: u8 = 0x96;
const BRANCH_TARGET: u8 = 0x9C;
const JAL_LINK: u8 = 0xB2; // JALR joins the JAL chain here
const CSR_RC_BODY: u8 = 0xA0;
const CSR_RSI_BODY: u8 = 0xA8;
const CSR_RCI_BODY: u8 = 0xB5;
const OP_EXEC: u8 = 0xD4; // ten register-op execute words
const EXC: u8 = 0xE8; // exception handler

/// Unconditional jump; used both for routine glue and to route any slot
/// that must never execute into the trap slot.
fn jump(target: u8) -> MicroWord {
    MicroWord {
        jmp_type: JmpType::Direct,
        cond_test: CondTest::True,
        target,
        ..MicroWord::NOP
    }
}

/// Loop on this slot until the bus acknowledges, then fall through.
fn wait_mem(this: u8) -> MicroWord {
    MicroWord {
        jmp_type: JmpType::Direct,
        cond_test: CondTest::MemValid,
        invert_test: true,
        target: this,
        mem_req: true,
        ..MicroWord::NOP
    }
}

/// Retire: increment the PC and return to fetch.
fn retire() -> MicroWord {
    MicroWord {
        pc_action: PcAction::Inc,
        jmp_type: JmpType::DirectZero,
        cond_test: CondTest::True,
        invert_test: true,
        ..MicroWord::NOP
    }
}

/// Return to fetch without touching the PC.
fn to_fetch() -> MicroWord {
    MicroWord {
        jmp_type: JmpType::DirectZero,
        cond_test: CondTest::True,
        invert_test: true,
        ..MicroWord::NOP
    }
}

/// Perform an ALU op and jump to the shared writeback word.
fn alu_to_writeback(op: AluOp) -> MicroWord {
    MicroWord {
        alu_op: op,
        alu_cmd: begin_if_shift(op),
        ..jump(WRITEBACK)
    }
}

fn begin_if_shift(op: AluOp) -> AluCmd {
    match op {
        AluOp::Sll | AluOp::Srl | AluOp::Sra => AluCmd::Begin,
        _ => AluCmd::Hold,
    }
}

/// Divert to the exception handler if the selected check fires, otherwise
/// fall through.
fn check(ctl: ExceptCtl) -> MicroWord {
    MicroWord {
        except_ctl: ctl,
        jmp_type: JmpType::Direct,
        cond_test: CondTest::Exception,
        target: EXC,
        ..MicroWord::NOP
    }
}

/// Build the default microcode store.
pub fn default_rom() -> UcodeRom {
    let mut t = vec![jump(TRAP_SLOT); UCODE_DEPTH];

    // --- reset and fetch ---------------------------------------------------

    // Reset vector: one settle cycle, then the first fetch.
    t[2] = jump(0);

    // Fetch: hold the strobe until the instruction arrives. Decode commits
    // automatically on the acknowledge cycle; rs1 is read the same cycle
    // through the unregistered path so its value is on the port at dispatch.
    t[0] = MicroWord {
        mem_req: true,
        insn_fetch: true,
        reg_read: true,
        jmp_type: JmpType::Direct,
        cond_test: CondTest::MemValid,
        invert_test: true,
        target: 0,
        ..MicroWord::NOP
    };

    // Dispatch: the once-per-instruction exception/interrupt checkpoint,
    // then jump into the instruction's routine. rs1/imm are staged into the
    // operand latches and rs2 is read for whoever needs it.
    t[1] = MicroWord {
        except_ctl: ExceptCtl::LatchDecoder,
        jmp_type: JmpType::Map,
        cond_test: CondTest::Exception,
        target: EXC,
        latch_a: true,
        a_src: ASrc::Gp,
        latch_b: true,
        b_src: BSrc::Imm,
        reg_read: true,
        reg_r_sel: RegRSel::InsnRs2,
        ..MicroWord::NOP
    };

    // Shared tails.
    t[RETIRE as usize] = retire();
    t[WRITEBACK as usize] = MicroWord {
        reg_write: true,
        ..retire()
    };

    // --- OP-IMM: one execute word each, operands staged by dispatch --------

    t[(map::OP_IMM_BASE | 0x0) as usize] = alu_to_writeback(AluOp::Add); // ADDI
    t[(map::OP_IMM_BASE | 0x1) as usize] = alu_to_writeback(AluOp::Sll); // SLLI
    t[(map::OP_IMM_BASE | 0x2) as usize] = alu_to_writeback(AluOp::CmpLt); // SLTI
    t[(map::OP_IMM_BASE | 0x3) as usize] = alu_to_writeback(AluOp::CmpLtu); // SLTIU
    t[(map::OP_IMM_BASE | 0x4) as usize] = alu_to_writeback(AluOp::Xor); // XORI
    t[(map::OP_IMM_BASE | 0x5) as usize] = alu_to_writeback(AluOp::Srl); // SRLI
    t[(map::OP_IMM_BASE | 0x6) as usize] = alu_to_writeback(AluOp::Or); // ORI
    t[(map::OP_IMM_BASE | 0x7) as usize] = alu_to_writeback(AluOp::And); // ANDI
    t[(map::OP_IMM_BASE | 0xD) as usize] = alu_to_writeback(AluOp::Sra); // SRAI

    // --- OP: swap rs2 into B, then the same execute words ------------------

    let op_exec = |i: u8| MicroWord {
        latch_b: true,
        b_src: BSrc::Gp,
        ..jump(OP_EXEC + i)
    };
    t[(map::OP_BASE | 0x0) as usize] = op_exec(0); // ADD
    t[(map::OP_BASE | 0x1) as usize] = op_exec(1); // SLL
    t[(map::OP_BASE | 0x2) as usize] = op_exec(2); // SLT
    t[(map::OP_BASE | 0x3) as usize] = op_exec(3); // SLTU
    t[(map::OP_BASE | 0x4) as usize] = op_exec(4); // XOR
    t[(map::OP_BASE | 0x5) as usize] = op_exec(5); // SRL
    t[(map::OP_BASE | 0x6) as usize] = op_exec(6); // OR
    t[(map::OP_BASE | 0x7) as usize] = op_exec(7); // AND
    t[(map::OP_BASE | 0x8) as usize] = op_exec(8); // SUB
    t[(map::OP_BASE | 0xD) as usize] = op_exec(9); // SRA

    for (i, op) in [
        AluOp::Add,
        AluOp::Sll,
        AluOp::CmpLt,
        AluOp::CmpLtu,
        AluOp::Xor,
        AluOp::Srl,
        AluOp::Or,
        AluOp::And,
        AluOp::Sub,
        AluOp::Sra,
    ]
    .into_iter()
    .enumerate()
    {
        t[OP_EXEC as usize + i] = alu_to_writeback(op);
    }

    // --- LUI / AUIPC --------------------------------------------------------

    // LUI: rd <- 0 + imm.
    t[map::LUI as usize] = MicroWord {
        latch_a: true,
        a_src: ASrc::Zero,
        ..MicroWord::NOP
    };
    t[map::LUI as usize + 1] = alu_to_writeback(AluOp::Add);

    // AUIPC: rd <- imm + pc.
    t[map::AUIPC as usize] = MicroWord {
        latch_a: true,
        a_src: ASrc::Imm,
        latch_b: true,
        b_src: BSrc::Pc,
        ..MicroWord::NOP
    };
    t[map::AUIPC as usize + 1] = alu_to_writeback(AluOp::Add);

    // --- branches -----------------------------------------------------------

    // Entry: rs2 into B (rs1 already in A), then the per-condition compare.
    for (f3, cmp) in [(0u8, 0u8), (1, 1), (4, 2), (5, 3), (6, 4), (7, 5)] {
        t[(map::BRANCH_BASE | f3) as usize] = MicroWord {
            latch_b: true,
            b_src: BSrc::Gp,
            ..jump(BRANCH_CMP + cmp)
        };
    }
    for (i, op) in [
        AluOp::CmpEq,
        AluOp::CmpNe,
        AluOp::CmpLt,
        AluOp::CmpGe,
        AluOp::CmpLtu,
        AluOp::CmpGeu,
    ]
    .into_iter()
    .enumerate()
    {
        t[BRANCH_CMP as usize + i] = MicroWord {
            alu_op: op,
            ..jump(BRANCH_TEST)
        };
    }

    // Compare result is 0/1: zero means not taken. Stage imm/pc for the
    // target computation on the way through.
    t[BRANCH_TEST as usize] = MicroWord {
        jmp_type: JmpType::Direct,
        cond_test: CondTest::CmpAluOZero,
        target: RETIRE,
        latch_a: true,
        a_src: ASrc::Imm,
        latch_b: true,
        b_src: BSrc::Pc,
        ..MicroWord::NOP
    };
    // Taken: target = imm + pc.
    t[BRANCH_TEST as usize + 1] = MicroWord {
        alu_op: AluOp::Add,
        ..jump(BRANCH_TARGET)
    };
    // A taken branch to a misaligned target traps before the PC moves.
    t[BRANCH_TARGET as usize] = check(ExceptCtl::LatchJal);
    t[BRANCH_TARGET as usize + 1] = MicroWord {
        pc_action: PcAction::LoadAbs,
        ..to_fetch()
    };

    // --- JAL / JALR ---------------------------------------------------------

    // JAL: target = imm + pc.
    t[map::JAL as usize] = MicroWord {
        latch_a: true,
        a_src: ASrc::Imm,
        latch_b: true,
        b_src: BSrc::Pc,
        ..MicroWord::NOP
    };
    t[map::JAL as usize + 1] = MicroWord {
        alu_op: AluOp::Add,
        ..MicroWord::NOP
    };
    // JALR: target = (rs1 + imm) with bit 0 cleared; joins the JAL chain.
    t[map::JALR as usize] = MicroWord {
        alu_op: AluOp::Add,
        alu_o_mod: AluOMod::ClearLsb,
        ..jump(JAL_LINK)
    };
    // Check the target, stage 4 + pc for the link value.
    t[JAL_LINK as usize] = MicroWord {
        latch_a: true,
        a_src: ASrc::Four,
        latch_b: true,
        b_src: BSrc::Pc,
        alu_op: AluOp::Add,
        alu_o_mod: AluOMod::ClearLsb,
        ..check(ExceptCtl::LatchJal)
    };
    // Load the PC from the target while the link value computes.
    t[JAL_LINK as usize + 1] = MicroWord {
        pc_action: PcAction::LoadAbs,
        alu_op: AluOp::Add,
        ..MicroWord::NOP
    };
    t[JAL_LINK as usize + 2] = MicroWord {
        reg_write: true,
        ..to_fetch()
    };

    // --- loads --------------------------------------------------------------

    // Entry: effective address = rs1 + imm.
    for f3 in [0u8, 1, 2, 4, 5] {
        t[(map::LOAD_BASE | f3) as usize] = MicroWord {
            alu_op: AluOp::Add,
            ..jump(LOAD_BODY[f3 as usize])
        };
    }
    for (f3, sel, extend) in [
        (0u8, MemSel::Byte, MemExtend::Sign),
        (1, MemSel::Half, MemExtend::Sign),
        (2, MemSel::Word, MemExtend::Zero),
        (4, MemSel::Byte, MemExtend::Zero),
        (5, MemSel::Half, MemExtend::Zero),
    ] {
        let body = LOAD_BODY[f3 as usize];
        // Latch the address and check its alignment before any bus traffic;
        // byte accesses cannot misalign and skip the check.
        let ctl = if sel == MemSel::Byte {
            ExceptCtl::None
        } else {
            ExceptCtl::LatchLoadAdr
        };
        t[body as usize] = MicroWord {
            latch_adr: true,
            mem_sel: sel,
            latch_a: true,
            a_src: ASrc::Zero,
            ..check(ctl)
        };
        t[body as usize + 1] = MicroWord {
            mem_sel: sel,
            mem_extend: extend,
            latch_b: true,
            b_src: BSrc::DatR,
            ..wait_mem(body + 1)
        };
        // rd <- 0 + data.
        t[body as usize + 2] = alu_to_writeback(AluOp::Add);
    }

    // --- stores -------------------------------------------------------------

    for f3 in [0u8, 1, 2] {
        t[(map::STORE_BASE | f3) as usize] = MicroWord {
            alu_op: AluOp::Add,
            ..jump(STORE_BODY[f3 as usize])
        };
    }
    for (f3, sel) in [(0u8, MemSel::Byte), (1, MemSel::Half), (2, MemSel::Word)] {
        let body = STORE_BODY[f3 as usize];
        let ctl = if sel == MemSel::Byte {
            ExceptCtl::None
        } else {
            ExceptCtl::LatchStoreAdr
        };
        // Latch and check the address; stage 0 + rs2 for the store data.
        t[body as usize] = MicroWord {
            latch_adr: true,
            mem_sel: sel,
            latch_a: true,
            a_src: ASrc::Zero,
            latch_b: true,
            b_src: BSrc::Gp,
            ..check(ctl)
        };
        t[body as usize + 1] = MicroWord {
            alu_op: AluOp::Add,
            ..MicroWord::NOP
        };
        // Align the store data into its lane.
        t[body as usize + 2] = MicroWord {
            latch_data: true,
            mem_sel: sel,
            ..MicroWord::NOP
        };
        t[body as usize + 3] = MicroWord {
            write_mem: true,
            mem_sel: sel,
            ..wait_mem(body + 3)
        };
        t[body as usize + 4] = retire();
    }

    // --- FENCE / WFI --------------------------------------------------------
    // Both retire as plain no-ops; a pending interrupt is taken at the next
    // dispatch checkpoint. (RETIRE doubles as the entry.)

    // --- CSR routines -------------------------------------------------------

    // Trampoline: the second decode pass has resolved by now; re-check for
    // an illegal access, then dispatch to the real handler.
    t[map::CSR_PENDING as usize] = MicroWord {
        except_ctl: ExceptCtl::LatchDecoder,
        jmp_type: JmpType::Map,
        cond_test: CondTest::Exception,
        target: EXC,
        ..MicroWord::NOP
    };

    // Read-only zero: rd <- 0 (A & anything).
    t[map::CSR_RO0 as usize] = MicroWord {
        latch_a: true,
        a_src: ASrc::Zero,
        ..jump(CSR_RO0_BODY)
    };
    t[CSR_RO0_BODY as usize] = alu_to_writeback(AluOp::And);

    // CSRW (rd = x0): csr <- rs1, no read-back.
    t[map::CSR_W as usize] = MicroWord {
        reg_read: true,
        ..jump(CSR_W_BODY)
    };
    t[CSR_W_BODY as usize] = MicroWord {
        latch_a: true,
        a_src: ASrc::Zero,
        latch_b: true,
        b_src: BSrc::Gp,
        ..MicroWord::NOP
    };
    t[CSR_W_BODY as usize + 1] = MicroWord {
        alu_op: AluOp::Add,
        ..MicroWord::NOP
    };
    t[CSR_W_BODY as usize + 2] = csr_write_retire();

    // CSRRW: rd <- csr, csr <- rs1.
    t[map::CSR_RW as usize] = csr_read_entry(CSR_RW_BODY);
    t[CSR_RW_BODY as usize] = MicroWord {
        latch_b: true,
        b_src: BSrc::Csr,
        latch_a: true,
        a_src: ASrc::Zero,
        reg_read: true,
        ..MicroWord::NOP
    };
    t[CSR_RW_BODY as usize + 1] = MicroWord {
        alu_op: AluOp::Add,
        latch_b: true,
        b_src: BSrc::Gp,
        ..MicroWord::NOP
    };
    t[CSR_RW_BODY as usize + 2] = MicroWord {
        reg_write: true,
        alu_op: AluOp::Add,
        ..MicroWord::NOP
    };
    t[CSR_RW_BODY as usize + 3] = csr_write_retire();

    // CSRR (zero source): rd <- csr, no write.
    t[map::CSR_R as usize] = csr_read_entry(CSR_R_BODY);
    t[CSR_R_BODY as usize] = MicroWord {
        latch_b: true,
        b_src: BSrc::Csr,
        latch_a: true,
        a_src: ASrc::Zero,
        ..MicroWord::NOP
    };
    t[CSR_R_BODY as usize + 1] = alu_to_writeback(AluOp::Add);

    // CSRRS: rd <- csr, csr <- csr | rs1.
    t[map::CSR_RS as usize] = csr_read_entry(CSR_RS_BODY);
    t[CSR_RS_BODY as usize] = MicroWord {
        latch_b: true,
        b_src: BSrc::Csr,
        latch_a: true,
        a_src: ASrc::Zero,
        reg_read: true,
        ..MicroWord::NOP
    };
    t[CSR_RS_BODY as usize + 1] = MicroWord {
        alu_op: AluOp::Add,
        latch_a: true,
        a_src: ASrc::Gp,
        ..MicroWord::NOP
    };
    t[CSR_RS_BODY as usize + 2] = MicroWord {
        reg_write: true,
        alu_op: AluOp::Or,
        ..MicroWord::NOP
    };
    t[CSR_RS_BODY as usize + 3] = csr_write_retire();

    // CSRRC: rd <- csr, csr <- csr & !rs1. The mask inverts through -1 XOR
    // and the CSR is read a second time once the mask is in A.
    t[map::CSR_RC as usize] = csr_read_entry(CSR_RC_BODY);
    t[CSR_RC_BODY as usize] = MicroWord {
        latch_b: true,
        b_src: BSrc::Csr,
        latch_a: true,
        a_src: ASrc::Zero,
        reg_read: true,
        ..MicroWord::NOP
    };
    t[CSR_RC_BODY as usize + 1] = MicroWord {
        alu_op: AluOp::Add,
        latch_a: true,
        a_src: ASrc::NegOne,
        ..MicroWord::NOP
    };
    t[CSR_RC_BODY as usize + 2] = MicroWord {
        reg_write: true,
        latch_b: true,
        b_src: BSrc::Gp,
        ..MicroWord::NOP
    };
    t[CSR_RC_BODY as usize + 3] = MicroWord {
        alu_op: AluOp::Xor,
        csr_op: CsrOp::Read,
        csr_sel: CsrSel::Insn,
        ..MicroWord::NOP
    };
    t[CSR_RC_BODY as usize + 4] = MicroWord {
        latch_a: true,
        a_src: ASrc::AluO,
        latch_b: true,
        b_src: BSrc::Csr,
        ..MicroWord::NOP
    };
    t[CSR_RC_BODY as usize + 5] = MicroWord {
        alu_op: AluOp::And,
        ..MicroWord::NOP
    };
    t[CSR_RC_BODY as usize + 6] = csr_write_retire();

    // CSRWI (rd = x0): csr <- zimm.
    t[map::CSR_WI as usize] = MicroWord {
        latch_a: true,
        a_src: ASrc::Zero,
        latch_b: true,
        b_src: BSrc::CsrImm,
        ..jump(CSR_WI_BODY)
    };
    t[CSR_WI_BODY as usize] = MicroWord {
        alu_op: AluOp::Add,
        ..MicroWord::NOP
    };
    t[CSR_WI_BODY as usize + 1] = csr_write_retire();

    // CSRRWI: rd <- csr, csr <- zimm.
    t[map::CSR_RWI as usize] = csr_read_entry(CSR_RWI_BODY);
    t[CSR_RWI_BODY as usize] = MicroWord {
        latch_b: true,
        b_src: BSrc::Csr,
        latch_a: true,
        a_src: ASrc::Zero,
        ..MicroWord::NOP
    };
    t[CSR_RWI_BODY as usize + 1] = MicroWord {
        alu_op: AluOp::Add,
        latch_b: true,
        b_src: BSrc::CsrImm,
        ..MicroWord::NOP
    };
    t[CSR_RWI_BODY as usize + 2] = MicroWord {
        reg_write: true,
        alu_op: AluOp::Add,
        ..MicroWord::NOP
    };
    t[CSR_RWI_BODY as usize + 3] = csr_write_retire();

    // CSRRSI: rd <- csr, csr <- csr | zimm, through the output feedback.
    t[map::CSR_RSI as usize] = csr_read_entry(CSR_RSI_BODY);
    t[CSR_RSI_BODY as usize] = MicroWord {
        latch_b: true,
        b_src: BSrc::Csr,
        latch_a: true,
        a_src: ASrc::Zero,
        ..MicroWord::NOP
    };
    t[CSR_RSI_BODY as usize + 1] = MicroWord {
        alu_op: AluOp::Add,
        ..MicroWord::NOP
    };
    t[CSR_RSI_BODY as usize + 2] = MicroWord {
        reg_write: true,
        latch_a: true,
        a_src: ASrc::AluO,
        latch_b: true,
        b_src: BSrc::CsrImm,
        ..MicroWord::NOP
    };
    t[CSR_RSI_BODY as usize + 3] = MicroWord {
        alu_op: AluOp::Or,
        ..MicroWord::NOP
    };
    t[CSR_RSI_BODY as usize + 4] = csr_write_retire();

    // CSRRCI: rd <- csr, csr <- csr & !zimm.
    t[map::CSR_RCI as usize] = csr_read_entry(CSR_RCI_BODY);
    t[CSR_RCI_BODY as usize] = MicroWord {
        latch_b: true,
        b_src: BSrc::Csr,
        latch_a: true,
        a_src: ASrc::Zero,
        ..MicroWord::NOP
    };
    t[CSR_RCI_BODY as usize + 1] = MicroWord {
        alu_op: AluOp::Add,
        latch_a: true,
        a_src: ASrc::NegOne,
        ..MicroWord::NOP
    };
    t[CSR_RCI_BODY as usize + 2] = MicroWord {
        reg_write: true,
        latch_b: true,
        b_src: BSrc::CsrImm,
        ..MicroWord::NOP
    };
    t[CSR_RCI_BODY as usize + 3] = MicroWord {
        alu_op: AluOp::Xor,
        csr_op: CsrOp::Read,
        csr_sel: CsrSel::Insn,
        ..MicroWord::NOP
    };
    t[CSR_RCI_BODY as usize + 4] = MicroWord {
        latch_a: true,
        a_src: ASrc::AluO,
        latch_b: true,
        b_src: BSrc::Csr,
        ..MicroWord::NOP
    };
    t[CSR_RCI_BODY as usize + 5] = MicroWord {
        alu_op: AluOp::And,
        ..MicroWord::NOP
    };
    t[CSR_RCI_BODY as usize + 6] = csr_write_retire();

    // --- MRET ---------------------------------------------------------------

    t[map::MRET as usize] = MicroWord {
        csr_op: CsrOp::Read,
        csr_sel: CsrSel::Target,
        target: slot::MEPC,
        ..MicroWord::NOP
    };
    t[map::MRET as usize + 1] = MicroWord {
        latch_b: true,
        b_src: BSrc::Csr,
        latch_a: true,
        a_src: ASrc::Zero,
        ..MicroWord::NOP
    };
    t[map::MRET as usize + 2] = MicroWord {
        alu_op: AluOp::Add,
        ..MicroWord::NOP
    };
    t[map::MRET as usize + 3] = MicroWord {
        pc_action: PcAction::LoadAbs,
        except_ctl: ExceptCtl::LeaveInt,
        ..to_fetch()
    };

    // --- exception handler --------------------------------------------------
    //
    // mepc <- pc; mcause <- the router's latch; mstatus trap entry;
    // pc <- mtvec. The faulting instruction never moved the PC, so this
    // serves exceptions and interrupts alike.

    t[EXC as usize] = MicroWord {
        latch_a: true,
        a_src: ASrc::Zero,
        latch_b: true,
        b_src: BSrc::Pc,
        ..MicroWord::NOP
    };
    t[EXC as usize + 1] = MicroWord {
        alu_op: AluOp::Add,
        ..MicroWord::NOP
    };
    t[EXC as usize + 2] = MicroWord {
        csr_op: CsrOp::Write,
        csr_sel: CsrSel::Target,
        target: slot::MEPC,
        latch_b: true,
        b_src: BSrc::McauseLatch,
        ..MicroWord::NOP
    };
    t[EXC as usize + 3] = MicroWord {
        alu_op: AluOp::Add,
        ..MicroWord::NOP
    };
    t[EXC as usize + 4] = MicroWord {
        csr_op: CsrOp::Write,
        csr_sel: CsrSel::Target,
        target: slot::MCAUSE,
        except_ctl: ExceptCtl::EnterInt,
        ..MicroWord::NOP
    };
    t[EXC as usize + 5] = MicroWord {
        csr_op: CsrOp::Read,
        csr_sel: CsrSel::Target,
        target: slot::MTVEC,
        ..MicroWord::NOP
    };
    t[EXC as usize + 6] = MicroWord {
        latch_b: true,
        b_src: BSrc::Csr,
        ..MicroWord::NOP
    };
    t[EXC as usize + 7] = MicroWord {
        alu_op: AluOp::Add,
        ..MicroWord::NOP
    };
    t[EXC as usize + 8] = MicroWord {
        pc_action: PcAction::LoadAbs,
        ..to_fetch()
    };

    UcodeRom::from_words(t)
}

/// Common CSR-routine entry: read the instruction's CSR onto the port and
/// jump to the routine body.
fn csr_read_entry(body: u8) -> MicroWord {
    MicroWord {
        csr_op: CsrOp::Read,
        csr_sel: CsrSel::Insn,
        ..jump(body)
    }
}

/// Common CSR-routine tail: write the ALU output to the instruction's CSR
/// and retire.
fn csr_write_retire() -> MicroWord {
    MicroWord {
        csr_op: CsrOp::Write,
        csr_sel: CsrSel::Insn,
        ..retire()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ucode::{FETCH_SLOT, RESET_SLOT};

    #[test]
    fn test_fixed_slots() {
        let rom = default_rom();
        // Reset falls through to fetch.
        let reset = rom.word(RESET_SLOT);
        assert_eq!(reset.jmp_type, JmpType::Direct);
        assert_eq!(reset.target, FETCH_SLOT);
        // Fetch asserts the strobe and waits for the bus.
        let fetch = rom.word(FETCH_SLOT);
        assert!(fetch.mem_req && fetch.insn_fetch);
        assert_eq!(fetch.cond_test, CondTest::MemValid);
        // The trap slot itself holds only the poison jump.
        assert_eq!(*rom.word(TRAP_SLOT), jump(TRAP_SLOT));
    }

    #[test]
    fn test_dispatch_is_the_interrupt_checkpoint() {
        let rom = default_rom();
        let dispatch = rom.word(1);
        assert_eq!(dispatch.except_ctl, ExceptCtl::LatchDecoder);
        assert_eq!(dispatch.jmp_type, JmpType::Map);
        assert_eq!(dispatch.target, EXC);
    }

    #[test]
    fn test_unused_slots_poisoned() {
        let rom = default_rom();
        // Entry slots for encodings the decoder rejects must never run; they
        // are wired straight at the trap slot.
        for addr in [0x0B, 0x0E, 0x0F, 0x48, 0x8A, 0x8B, 0xC9] {
            assert_eq!(*rom.word(addr), jump(TRAP_SLOT), "slot {addr:#x}");
        }
    }

    #[test]
    fn test_alignment_checked_before_memory_request() {
        let rom = default_rom();
        for body in [0x64u8, 0x68, 0x70] {
            let chk = rom.word(body);
            assert_eq!(chk.except_ctl, ExceptCtl::LatchLoadAdr);
            assert!(!chk.mem_req);
            assert!(rom.word(body + 1).mem_req);
        }
        for body in [0x7Au8, 0x80] {
            assert_eq!(rom.word(body).except_ctl, ExceptCtl::LatchStoreAdr);
            assert!(!rom.word(body).mem_req);
        }
    }

    /// Static walk of the jump graph: every slot reachable from reset either
    /// waits on a predicate, ends at fetch, or reaches the trap slot only
    /// via the poison jumps.
    #[test]
    fn test_reachable_slots_terminate() {
        let rom = default_rom();
        let mut seen = [false; UCODE_DEPTH];
        let mut stack = vec![RESET_SLOT, FETCH_SLOT];
        while let Some(addr) = stack.pop() {
            if seen[addr as usize] {
                continue;
            }
            seen[addr as usize] = true;
            if addr == TRAP_SLOT {
                continue;
            }
            let w = rom.word(addr);
            match w.jmp_type {
                JmpType::Cont => stack.push(addr.wrapping_add(1)),
                JmpType::Map => {
                    stack.push(w.target);
                    // Mapper outputs are the entry constants; covered by
                    // pushing every entry that decode can emit.
                }
                JmpType::Direct => {
                    stack.push(w.target);
                    stack.push(addr.wrapping_add(1));
                }
                JmpType::DirectZero => {
                    stack.push(w.target);
                    stack.push(0);
                }
            }
        }
        // Seed the mapper targets and walk again.
        let entries: Vec<u8> = (0..8)
            .map(|f3| map::LOAD_BASE | f3)
            .chain((0..8).map(|f3| map::STORE_BASE | f3))
            .chain((0..16).map(|x| map::OP_IMM_BASE | x))
            .chain((0..16).map(|x| map::OP_BASE | x))
            .chain((0..8).map(|f3| map::BRANCH_BASE | f3))
            .chain([
                map::LUI,
                map::AUIPC,
                map::JAL,
                map::JALR,
                map::FENCE,
                map::MRET,
                map::CSR_PENDING,
                map::CSR_RO0,
                map::CSR_W,
                map::CSR_RW,
                map::CSR_R,
                map::CSR_RS,
                map::CSR_RC,
                map::CSR_WI,
                map::CSR_RWI,
                map::CSR_RSI,
                map::CSR_RCI,
            ])
            .collect();
        let mut stack = entries;
        while let Some(addr) = stack.pop() {
            if seen[addr as usize] {
                continue;
            }
            seen[addr as usize] = true;
            if addr == TRAP_SLOT {
                continue;
            }
            let w = rom.word(addr);
            match w.jmp_type {
                JmpType::Cont => stack.push(addr.wrapping_add(1)),
                JmpType::Map | JmpType::Direct => {
                    stack.push(w.target);
                    stack.push(addr.wrapping_add(1));
                }
                JmpType::DirectZero => {
                    stack.push(w.target);
                    stack.push(0);
                }
            }
        }
        // Spot-check that the real routine bodies were visited.
        for addr in [WRITEBACK, RETIRE, EXC, map::MRET, 0x60, 0x74, CSR_RW_BODY] {
            assert!(seen[addr as usize], "slot {addr:#x} unreachable");
        }
    }
}
