//! Exception router: microcode-directed checks and the single cause latch.
//!
//! Only one check mode is active per microcode step (selected by the word's
//! `except_ctl` field), and a check overwrites the latch rather than
//! accumulating, so priority between exception classes is sequenced by the
//! microprogram, not by hardware arbitration.

use crate::csr::{cause, mcause_value};
use crate::ucode::{ExceptCtl, MemSel};

/// Illegal-instruction information handed over by the decoder.
#[derive(Debug, Clone, Copy, Default)]
pub struct DecodeException {
    /// An exception was detected on the decode pass that completed last
    /// cycle. Valid for exactly one cycle.
    pub valid: bool,
    /// Cause code, qualified by `valid`.
    pub cause: u32,
}

/// Result of one exception check: the (cause, interrupt) pair to latch.
pub type Check = Option<(u32, bool)>;

#[derive(Debug, Default)]
pub struct ExceptionRouter {
    cause: u32,
    interrupt: bool,
}

impl ExceptionRouter {
    pub fn new() -> Self {
        ExceptionRouter::default()
    }

    /// The latched cause in mcause layout (interrupt flag in bit 31).
    pub fn mcause_bits(&self) -> u32 {
        mcause_value(self.cause, self.interrupt)
    }

    /// Run the check selected by `ctl` against this cycle's sources.
    ///
    /// Returns the pair to latch if the checked condition holds. The
    /// `ENTER_INT`/`LEAVE_INT` codes are handled by the CSR file and never
    /// produce a check here.
    pub fn check(
        &self,
        ctl: ExceptCtl,
        decode: &DecodeException,
        interrupt_pending: bool,
        alu_lo: u32,
        mem_sel: MemSel,
    ) -> Check {
        match ctl {
            ExceptCtl::LatchDecoder => {
                if decode.valid {
                    Some((decode.cause, false))
                } else if interrupt_pending {
                    Some((cause::MEXT_INT, true))
                } else {
                    None
                }
            }
            ExceptCtl::LatchStoreAdr => {
                misaligned(mem_sel, alu_lo).then_some((cause::STORE_MISALIGNED, false))
            }
            ExceptCtl::LatchLoadAdr => {
                misaligned(mem_sel, alu_lo).then_some((cause::LOAD_MISALIGNED, false))
            }
            ExceptCtl::LatchJal => {
                (alu_lo & 0b10 != 0).then_some((cause::INSN_MISALIGNED, false))
            }
            ExceptCtl::None | ExceptCtl::EnterInt | ExceptCtl::LeaveInt => None,
        }
    }

    /// Latch a check result on the clock edge. Last check wins.
    pub fn latch(&mut self, check: (u32, bool)) {
        (self.cause, self.interrupt) = check;
    }
}

/// Half-word transfers need bit 0 clear; word transfers need bits [1:0].
fn misaligned(sel: MemSel, adr_lo: u32) -> bool {
    match sel {
        MemSel::Half => adr_lo & 0b01 != 0,
        MemSel::Word => adr_lo & 0b11 != 0,
        MemSel::Byte | MemSel::Auto => false,
    }
}
