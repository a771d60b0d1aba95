//! Control unit: microprogram sequencing and the condition-test multiplexer.
//!
//! The sequencer owns the microprogram counter. On reset it points at slot 2
//! and the microcode store is valid from the first cycle, so no reset guard
//! is needed. Field fan-out is trivial in software (the core reads the
//! current word directly); what remains here is next-address generation and
//! the one data-dependent decision point microcode has: the test mux.

use crate::ucode::{CondTest, JmpType, RESET_SLOT};

/// Predicate inputs the test multiplexer selects from.
#[derive(Debug, Clone, Copy)]
pub struct TestInputs {
    /// An exception check fired this cycle.
    pub exception: bool,
    /// The ALU output is zero this cycle.
    pub alu_zero: bool,
    /// The bus acknowledged this cycle.
    pub mem_valid: bool,
}

/// Resolve the microword's condition test against this cycle's predicates.
pub fn test_mux(cond: CondTest, invert: bool, inputs: TestInputs) -> bool {
    let raw = match cond {
        CondTest::Exception => inputs.exception,
        CondTest::CmpAluOZero => inputs.alu_zero,
        CondTest::MemValid => inputs.mem_valid,
        CondTest::True => true,
    };
    raw ^ invert
}

/// Microprogram counter and next-address generation.
#[derive(Debug)]
pub struct Sequencer {
    upc: u8,
    /// Vector address input reserved for future vectored dispatch; no jump
    /// type consumes it yet.
    pub vec_adr: u8,
}

impl Default for Sequencer {
    fn default() -> Self {
        Sequencer::new()
    }
}

impl Sequencer {
    pub fn new() -> Self {
        Sequencer {
            upc: RESET_SLOT,
            vec_adr: 0,
        }
    }

    /// Address of the microinstruction executing this cycle.
    pub fn upc(&self) -> u8 {
        self.upc
    }

    /// Compute the next microcode address from the current word's jump
    /// fields and the resolved test.
    pub fn next(&self, jmp: JmpType, test: bool, target: u8, opcode_adr: u8) -> u8 {
        let next_adr = self.upc.wrapping_add(1);
        match jmp {
            JmpType::Cont => next_adr,
            JmpType::Map => {
                if test {
                    target
                } else {
                    opcode_adr
                }
            }
            JmpType::Direct => {
                if test {
                    target
                } else {
                    next_adr
                }
            }
            JmpType::DirectZero => {
                if test {
                    target
                } else {
                    0
                }
            }
        }
    }

    /// Commit the next address on the clock edge.
    pub fn advance(&mut self, next: u8) {
        self.upc = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INPUTS: TestInputs = TestInputs {
        exception: true,
        alu_zero: false,
        mem_valid: true,
    };

    #[test]
    fn test_mux_selects_and_inverts() {
        assert!(test_mux(CondTest::Exception, false, INPUTS));
        assert!(!test_mux(CondTest::Exception, true, INPUTS));
        assert!(!test_mux(CondTest::CmpAluOZero, false, INPUTS));
        assert!(test_mux(CondTest::CmpAluOZero, true, INPUTS));
        assert!(test_mux(CondTest::MemValid, false, INPUTS));
        assert!(test_mux(CondTest::True, false, INPUTS));
        assert!(!test_mux(CondTest::True, true, INPUTS));
    }

    #[test]
    fn test_reset_vector() {
        let seq = Sequencer::new();
        assert_eq!(seq.upc(), RESET_SLOT);
    }

    #[test]
    fn test_jump_types() {
        let mut seq = Sequencer::new();
        seq.advance(0x40);
        assert_eq!(seq.next(JmpType::Cont, false, 0x99, 0x77), 0x41);
        assert_eq!(seq.next(JmpType::Cont, true, 0x99, 0x77), 0x41);
        assert_eq!(seq.next(JmpType::Map, true, 0x99, 0x77), 0x99);
        assert_eq!(seq.next(JmpType::Map, false, 0x99, 0x77), 0x77);
        assert_eq!(seq.next(JmpType::Direct, true, 0x99, 0x77), 0x99);
        assert_eq!(seq.next(JmpType::Direct, false, 0x99, 0x77), 0x41);
        assert_eq!(seq.next(JmpType::DirectZero, true, 0x99, 0x77), 0x99);
        assert_eq!(seq.next(JmpType::DirectZero, false, 0x99, 0x77), 0);
    }

    #[test]
    fn test_next_adr_wraps() {
        let mut seq = Sequencer::new();
        seq.advance(0xFF);
        assert_eq!(seq.next(JmpType::Cont, false, 0, 0), 0);
    }
}
