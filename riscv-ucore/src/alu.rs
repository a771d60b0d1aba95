//! Multi-cycle arithmetic logic unit.
//!
//! Single-cycle operations (add, subtract, bitwise ops, the six compares)
//! register their result on every clock: the output is valid one cycle after
//! the operands were latched. Shifts run one bit position per cycle from an
//! internal counter loaded by [`AluCmd::Begin`]; `ready` asserts exactly
//! n+1 cycles after the begin pulse (a zero-length shift still takes one
//! settle cycle). [`AluCmd::Hold`] never restarts an in-flight shift, so
//! repeating the same opcode across cycles is unambiguous.

use crate::ucode::{AluCmd, AluOMod, AluOp};

#[derive(Debug, Clone, Copy)]
struct ShiftState {
    op: AluOp,
    value: u32,
    remaining: u32,
}

#[derive(Debug, Default)]
pub struct Alu {
    /// A operand latch (written by the source multiplexer).
    pub a: u32,
    /// B operand latch (written by the source multiplexer).
    pub b: u32,
    o: u32,
    ready: bool,
    shift: Option<ShiftState>,
}

impl Alu {
    pub fn new() -> Self {
        Alu::default()
    }

    /// Registered result of the operation performed last cycle.
    pub fn output(&self) -> u32 {
        self.o
    }

    pub fn ready(&self) -> bool {
        self.ready
    }

    /// True while a counted shift still owns the output register.
    pub fn shift_in_progress(&self) -> bool {
        self.shift.is_some()
    }

    /// One clock edge: compute from the currently latched operands.
    ///
    /// Must be called before the operand latches are overwritten for the
    /// next cycle.
    pub fn clock(&mut self, op: AluOp, cmd: AluCmd, omod: AluOMod) {
        if self.shift.is_some() {
            self.tick_shift();
            return;
        }

        match op {
            AluOp::Sll | AluOp::Srl | AluOp::Sra if cmd == AluCmd::Begin => {
                self.shift = Some(ShiftState {
                    op,
                    value: self.a,
                    remaining: self.b & 0x1F,
                });
                self.ready = false;
            }
            _ => {
                let raw = match op {
                    AluOp::Add => self.a.wrapping_add(self.b),
                    AluOp::Sub => self.a.wrapping_sub(self.b),
                    AluOp::And => self.a & self.b,
                    AluOp::Or => self.a | self.b,
                    AluOp::Xor => self.a ^ self.b,
                    AluOp::CmpEq => (self.a == self.b) as u32,
                    AluOp::CmpNe => (self.a != self.b) as u32,
                    AluOp::CmpLt => ((self.a as i32) < self.b as i32) as u32,
                    AluOp::CmpGe => (self.a as i32 >= self.b as i32) as u32,
                    AluOp::CmpLtu => (self.a < self.b) as u32,
                    AluOp::CmpGeu => (self.a >= self.b) as u32,
                    // A shift opcode with Hold and nothing in flight keeps
                    // the last result; reissuing requires a fresh Begin.
                    AluOp::Sll | AluOp::Srl | AluOp::Sra => {
                        self.ready = true;
                        return;
                    }
                };
                self.o = match omod {
                    AluOMod::None => raw,
                    AluOMod::InvLsb => raw ^ 1,
                    AluOMod::ClearLsb => raw & !1,
                };
                self.ready = true;
            }
        }
    }

    /// Advance an in-flight shift by one clock while the sequencer stalls.
    pub fn tick_shift(&mut self) {
        let Some(mut s) = self.shift else { return };
        if s.remaining > 0 {
            s.value = match s.op {
                AluOp::Sll => s.value << 1,
                AluOp::Srl => s.value >> 1,
                AluOp::Sra => (s.value as i32 >> 1) as u32,
                _ => unreachable!("only shifts are counted"),
            };
            s.remaining -= 1;
            self.shift = Some(s);
        } else {
            self.o = s.value;
            self.ready = true;
            self.shift = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_single(op: AluOp, a: u32, b: u32) -> u32 {
        let mut alu = Alu::new();
        alu.a = a;
        alu.b = b;
        alu.clock(op, AluCmd::Hold, AluOMod::None);
        assert!(alu.ready());
        alu.output()
    }

    #[test]
    fn test_add_two_complement() {
        assert_eq!(run_single(AluOp::Add, 255, -1i32 as u32), 254);
        assert_eq!(run_single(AluOp::Add, 0xFFFF_FFFF, 1), 0);
    }

    #[test]
    fn test_sub() {
        assert_eq!(run_single(AluOp::Sub, 0, 1), u32::MAX);
        assert_eq!(run_single(AluOp::Sub, 7, 7), 0);
    }

    #[test]
    fn test_bitwise() {
        assert_eq!(run_single(AluOp::And, 0b1100, 0b1010), 0b1000);
        assert_eq!(run_single(AluOp::Or, 0b1100, 0b1010), 0b1110);
        assert_eq!(run_single(AluOp::Xor, 0b1100, 0b1010), 0b0110);
    }

    #[test]
    fn test_signed_compares() {
        assert_eq!(run_single(AluOp::CmpLt, 0, 1), 1);
        assert_eq!(run_single(AluOp::CmpLt, -1i32 as u32, 1), 1);
        assert_eq!(run_single(AluOp::CmpLt, 1, -1i32 as u32), 0);
        assert_eq!(run_single(AluOp::CmpGe, 1, -1i32 as u32), 1);
        assert_eq!(run_single(AluOp::CmpGe, -5i32 as u32, -5i32 as u32), 1);
    }

    #[test]
    fn test_unsigned_compares() {
        assert_eq!(run_single(AluOp::CmpLtu, 1, -1i32 as u32), 1);
        assert_eq!(run_single(AluOp::CmpLtu, -1i32 as u32, 1), 0);
        assert_eq!(run_single(AluOp::CmpGeu, -1i32 as u32, 1), 1);
        assert_eq!(run_single(AluOp::CmpEq, 5, 5), 1);
        assert_eq!(run_single(AluOp::CmpNe, 5, 5), 0);
    }

    #[test]
    fn test_output_modifiers() {
        let mut alu = Alu::new();
        alu.a = 0x1003;
        alu.b = 0;
        alu.clock(AluOp::Add, AluCmd::Hold, AluOMod::ClearLsb);
        assert_eq!(alu.output(), 0x1002);
        alu.clock(AluOp::Add, AluCmd::Hold, AluOMod::InvLsb);
        assert_eq!(alu.output(), 0x1002);
    }

    /// Ready asserts exactly n+1 clocks after the begin pulse.
    #[test]
    fn test_shift_timing() {
        for n in [0u32, 1, 5, 31] {
            let mut alu = Alu::new();
            alu.a = 1;
            alu.b = n;
            alu.clock(AluOp::Sll, AluCmd::Begin, AluOMod::None);
            let mut clocks = 0;
            while !alu.ready() {
                assert!(alu.shift_in_progress());
                alu.clock(AluOp::Sll, AluCmd::Hold, AluOMod::None);
                clocks += 1;
                assert!(clocks <= n + 1, "shift by {n} overran");
            }
            assert_eq!(clocks, n + 1, "shift by {n}");
            assert_eq!(alu.output(), 1u32 << n);
        }
    }

    #[test]
    fn test_shift_kinds() {
        let cases = [
            (AluOp::Sll, 0x8000_0001u32, 4, 0x0000_0010u32),
            (AluOp::Srl, 0x8000_0000, 4, 0x0800_0000),
            (AluOp::Sra, 0x8000_0000, 4, 0xF800_0000),
            (AluOp::Sra, 0x4000_0000, 2, 0x1000_0000),
        ];
        for (op, a, n, expect) in cases {
            let mut alu = Alu::new();
            alu.a = a;
            alu.b = n;
            alu.clock(op, AluCmd::Begin, AluOMod::None);
            while !alu.ready() {
                alu.clock(op, AluCmd::Hold, AluOMod::None);
            }
            assert_eq!(alu.output(), expect, "{op:?} {a:#x} >> {n}");
        }
    }

    /// Holding the same shift opcode does not restart the operation, and a
    /// completed shift is not restarted without a fresh Begin.
    #[test]
    fn test_hold_is_not_restart() {
        let mut alu = Alu::new();
        alu.a = 2;
        alu.b = 3;
        alu.clock(AluOp::Sll, AluCmd::Begin, AluOMod::None);
        for _ in 0..4 {
            alu.clock(AluOp::Sll, AluCmd::Hold, AluOMod::None);
        }
        assert_eq!(alu.output(), 16);
        // Same opcode, Hold: result stays, nothing re-launches.
        alu.clock(AluOp::Sll, AluCmd::Hold, AluOMod::None);
        assert!(alu.ready());
        assert!(!alu.shift_in_progress());
        assert_eq!(alu.output(), 16);
    }

    /// Intermediate outputs of an unfinished shift are not the final result.
    #[test]
    fn test_not_ready_until_done() {
        let mut alu = Alu::new();
        alu.a = 1;
        alu.b = 8;
        alu.clock(AluOp::Sll, AluCmd::Begin, AluOMod::None);
        for _ in 0..8 {
            alu.clock(AluOp::Sll, AluCmd::Hold, AluOMod::None);
            assert!(!alu.ready());
        }
        alu.clock(AluOp::Sll, AluCmd::Hold, AluOMod::None);
        assert!(alu.ready());
        assert_eq!(alu.output(), 256);
    }
}
