//! Core top level: one `step()` per clock cycle.
//!
//! A step evaluates the current microword against registered state (the
//! combinational half of the cycle), then commits every storage update for
//! the edge: operand latches, the ALU result, register/CSR file traffic, the
//! PC, the bus address/data latches, decode, and the microprogram counter.
//! Values consumed during a step are captured before anything is written, so
//! ordering inside the commit cannot leak next-cycle state into this cycle.

use thiserror::Error;

use crate::align;
use crate::alu::Alu;
use crate::bus::{Bus, BusRequest};
use crate::control::{Sequencer, TestInputs, test_mux};
use crate::csr::{self, CsrClass};
use crate::datapath::{ProgramCounter, RegFile};
use crate::decode::Decode;
use crate::exception::ExceptionRouter;
use crate::insn::Insn;
use crate::program;
use crate::ucode::{
    ASrc, BSrc, CsrOp, CsrSel, ExceptCtl, MicroWord, RegRSel, RegWSel, TRAP_SLOT, UcodeRom,
};

/// Host-level failures. Architectural traps are not errors; they dispatch
/// through the microcode exception path.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoreError {
    /// The sequencer reached the reserved "not implemented" slot. This is a
    /// defect in the microprogram or the mapper, not a runtime condition.
    #[error("microcode reached the reserved trap slot from {from:#04x}")]
    Unimplemented { from: u8 },
}

pub struct Core {
    ucode: UcodeRom,
    seq: Sequencer,
    alu: Alu,
    decode: Decode,
    regs: RegFile,
    pc: ProgramCounter,
    exc: ExceptionRouter,
    /// Byte address latched for the next data transfer.
    data_adr: u32,
    /// Lane-aligned write data driving the bus.
    write_data: u32,
    /// Slot executing this cycle; kept for trap reporting.
    last_upc: u8,
    cycles: u64,
}

impl Default for Core {
    fn default() -> Self {
        Core::new(program::default_rom())
    }
}

impl Core {
    pub fn new(ucode: UcodeRom) -> Self {
        Core {
            ucode,
            seq: Sequencer::new(),
            alu: Alu::new(),
            decode: Decode::new(),
            regs: RegFile::new(),
            pc: ProgramCounter::default(),
            exc: ExceptionRouter::new(),
            data_adr: 0,
            write_data: 0,
            last_upc: 0,
            cycles: 0,
        }
    }

    /// Program counter as a byte address.
    pub fn pc(&self) -> u32 {
        self.pc.byte_addr()
    }

    /// General-purpose register value.
    pub fn reg(&self, index: u8) -> u32 {
        self.regs.gp_peek(index)
    }

    /// CSR value by its 12-bit address, as a CSR read would return it.
    /// `None` for addresses that trap.
    pub fn csr(&self, addr: u16) -> Option<u32> {
        match csr::classify(addr) {
            CsrClass::Implemented(slot) => Some(self.regs.csr_peek(slot)),
            CsrClass::ReadOnlyZero => Some(0),
            CsrClass::Illegal => None,
        }
    }

    /// Microcode address executing on the next step.
    pub fn upc(&self) -> u8 {
        self.seq.upc()
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Run for at most `budget` cycles. The budget is the external watchdog:
    /// a bus that never acknowledges stalls forever by design.
    pub fn run(&mut self, bus: &mut dyn Bus, irq: bool, budget: u64) -> Result<(), CoreError> {
        for _ in 0..budget {
            self.step(bus, irq)?;
        }
        Ok(())
    }

    /// Advance one clock cycle.
    pub fn step(&mut self, bus: &mut dyn Bus, irq: bool) -> Result<(), CoreError> {
        self.cycles += 1;
        // mip.MEIP follows the level-sensitive line every cycle; delivery
        // waits for the microcode checkpoint.
        self.regs.set_meip(irq);

        // A counted shift freezes the microprogram until ready asserts.
        if self.alu.shift_in_progress() {
            self.alu.tick_shift();
            bus.tick(None);
            return Ok(());
        }

        let upc = self.seq.upc();
        if upc == TRAP_SLOT {
            return Err(CoreError::Unimplemented { from: self.last_upc });
        }
        self.last_upc = upc;
        let word = *self.ucode.word(upc);

        // ---- combinational phase: everything reads registered state ----

        let alu_o = self.alu.output();
        let pc_bytes = self.pc.byte_addr();
        let port = self.regs.port();
        let mcause_bits = self.exc.mcause_bits();

        let request = word.mem_req.then(|| {
            if word.insn_fetch {
                BusRequest {
                    addr: self.pc.word_addr(),
                    sel: 0b1111,
                    we: false,
                    dat_w: 0,
                }
            } else {
                BusRequest {
                    addr: self.data_adr >> 2,
                    sel: align::bus_sel(word.mem_sel, self.data_adr),
                    we: word.write_mem,
                    dat_w: self.write_data,
                }
            }
        });
        let reply = bus.tick(request.as_ref());
        let mem_valid = word.mem_req && reply.ack;
        let do_decode = word.insn_fetch && reply.ack;

        let check = self.exc.check(
            word.except_ctl,
            &self.decode.exception,
            self.regs.interrupt_pending(),
            alu_o & 0b11,
            word.mem_sel,
        );

        let test = test_mux(
            word.cond_test,
            word.invert_test,
            TestInputs {
                exception: check.is_some(),
                alu_zero: alu_o == 0,
                mem_valid,
            },
        );
        let next_upc = self
            .seq
            .next(word.jmp_type, test, word.target, self.decode.requested_op);

        if log::log_enabled!(log::Level::Trace) {
            log::trace!(
                "cycle {:>6} upc={:#04x} pc={:#010x} o={:#010x} test={} next={:#04x}",
                self.cycles,
                upc,
                pc_bytes,
                alu_o,
                test,
                next_upc
            );
        }

        // ---- commit phase: the clock edge ----

        if let Some(cause) = check {
            log::debug!(
                "exception check {:?} fired: cause={} interrupt={}",
                word.except_ctl,
                cause.0,
                cause.1
            );
            self.exc.latch(cause);
        }

        // The ALU consumes the operand latches as they stood this cycle.
        self.alu.clock(word.alu_op, word.alu_cmd, word.alu_o_mod);

        if word.latch_a {
            self.alu.a = match word.a_src {
                ASrc::Gp => port,
                ASrc::Imm => self.decode.imm,
                ASrc::AluO => alu_o,
                ASrc::Zero => 0,
                ASrc::Four => 4,
                ASrc::NegOne => u32::MAX,
                ASrc::ThirtyOne => 31,
            };
        }
        if word.latch_b {
            self.alu.b = match word.b_src {
                BSrc::Gp => port,
                BSrc::Pc => pc_bytes,
                BSrc::Imm => self.decode.imm,
                BSrc::One => 1,
                BSrc::DatR => {
                    align::read_data(word.mem_sel, word.mem_extend, self.data_adr, reply.dat_r)
                }
                BSrc::CsrImm => self.decode.src_a as u32,
                BSrc::Csr => port,
                BSrc::McauseLatch => mcause_bits,
            };
        }

        // Register file / CSR file: one port each way per cycle; a CSR op
        // preempts the general-purpose selectors.
        match word.csr_op {
            CsrOp::None => {
                // Write before read: the storage is transparent.
                if word.reg_write {
                    let adr = match word.reg_w_sel {
                        RegWSel::InsnRd => self.decode.dst,
                        RegWSel::Zero => 0,
                    };
                    self.regs.gp_write(adr, alu_o);
                }
                if word.reg_read {
                    let adr = match word.reg_r_sel {
                        // During the fetch-acknowledge cycle the rs1 index
                        // comes straight off the bus, one cycle ahead of the
                        // decode latch.
                        RegRSel::InsnRs1 if word.insn_fetch => Insn(reply.dat_r).rs1(),
                        RegRSel::InsnRs1 => self.decode.src_a,
                        RegRSel::InsnRs2 => self.decode.src_b,
                    };
                    self.regs.gp_read(adr);
                }
            }
            CsrOp::Read => {
                self.regs.csr_read(self.csr_slot(&word));
            }
            CsrOp::Write => {
                self.regs.csr_write(self.csr_slot(&word), alu_o);
            }
        }

        match word.except_ctl {
            ExceptCtl::EnterInt => self.regs.enter_trap(),
            ExceptCtl::LeaveInt => self.regs.leave_trap(),
            _ => {}
        }

        self.pc.apply(word.pc_action, alu_o >> 2);

        // Write data aligns against the address latched on a previous cycle.
        if word.latch_data {
            self.write_data = align::write_data(word.mem_sel, self.data_adr, alu_o);
        }
        if word.latch_adr {
            self.data_adr = alu_o;
        }

        // The CSR sub-machine resolves a pass armed last cycle before a new
        // decode can arm another.
        self.decode.tick();
        if do_decode {
            self.decode.commit(reply.dat_r);
        }

        self.seq.advance(next_upc);
        Ok(())
    }

    fn csr_slot(&self, word: &MicroWord) -> u8 {
        match word.csr_sel {
            CsrSel::Insn => self.decode.csr_encoding & 0xF,
            CsrSel::Target => word.target & 0xF,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Memory;
    use crate::ucode::{FETCH_SLOT, RESET_SLOT};

    #[test]
    fn test_reset_reaches_fetch() {
        let mut core = Core::default();
        let mut mem = Memory::new(64);
        assert_eq!(core.upc(), RESET_SLOT);
        core.step(&mut mem, false).unwrap();
        assert_eq!(core.upc(), FETCH_SLOT);
        assert_eq!(core.pc(), 0);
    }

    #[test]
    fn test_fetch_waits_for_acknowledge() {
        let mut core = Core::default();
        let mut mem = Memory::with_wait_states(64, 3);
        // ADDI x1, x0, 1
        mem.load_words(0, &[0x0010_0093]);
        core.step(&mut mem, false).unwrap();
        // Three wait states: the sequencer must hold at the fetch slot.
        for _ in 0..3 {
            core.step(&mut mem, false).unwrap();
            assert_eq!(core.upc(), FETCH_SLOT);
        }
        core.step(&mut mem, false).unwrap();
        assert_ne!(core.upc(), FETCH_SLOT);
    }

    #[test]
    fn test_trap_slot_is_a_hard_error() {
        use crate::ucode::{JmpType, MicroWord, UCODE_DEPTH, UcodeRom};
        let mut words = vec![MicroWord::NOP; UCODE_DEPTH];
        // Reset slot jumps straight into the reserved slot.
        words[RESET_SLOT as usize] = MicroWord {
            jmp_type: JmpType::Direct,
            target: TRAP_SLOT,
            ..MicroWord::NOP
        };
        let mut core = Core::new(UcodeRom::from_words(words));
        let mut mem = Memory::new(16);
        core.step(&mut mem, false).unwrap();
        let err = core.step(&mut mem, false).unwrap_err();
        assert_eq!(err, CoreError::Unimplemented { from: RESET_SLOT });
    }
}
