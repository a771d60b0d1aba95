//! Microcode store: control-word fields, the packed record format, and the
//! decode-once-at-load table.
//!
//! A microcode image is produced offline by an assembler and shipped as 256
//! fixed-width little-endian records plus a field-layout table describing
//! each named field's bit offset and width. The engine decodes the packed
//! records into structured [`MicroWord`]s exactly once, at load time; the
//! sequencer then runs an ordinary table-driven state machine over them.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of microcode slots. Slot 2 is the reset entry, slot 0 the
/// fetch/dispatch entry, slot 255 the "not implemented" trap.
pub const UCODE_DEPTH: usize = 256;
/// Reset entry point.
pub const RESET_SLOT: u8 = 2;
/// Instruction fetch / dispatch entry point.
pub const FETCH_SLOT: u8 = 0;
/// Reserved "not implemented" trap slot.
pub const TRAP_SLOT: u8 = 255;

/// Bytes per packed record (48 field bits, stored as a little-endian u64).
pub const RECORD_BYTES: usize = 8;

macro_rules! ucode_enum {
    ($(#[$meta:meta])* $name:ident { $($(#[$vmeta:meta])* $variant:ident = $value:expr,)+ }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
        pub enum $name {
            $($(#[$vmeta])* $variant = $value,)+
        }

        impl $name {
            pub fn bits(self) -> u64 {
                self as u64
            }

            pub fn from_bits(bits: u64) -> Option<Self> {
                $(
                    if bits == $value {
                        return Some($name::$variant);
                    }
                )+
                None
            }
        }
    };
}

ucode_enum! {
    /// Type of jump the sequencer performs for this microinstruction.
    JmpType {
        /// Advance to the next sequential microinstruction.
        #[default]
        Cont = 0,
        /// Condition met: jump to `target`. Otherwise jump to the address
        /// supplied by the opcode mapper.
        Map = 1,
        /// Condition met: jump to `target`. Otherwise continue sequentially.
        Direct = 2,
        /// Condition met: jump to `target`. Otherwise return to slot 0.
        DirectZero = 3,
    }
}

ucode_enum! {
    /// Condition-test selector for the control unit's test multiplexer.
    CondTest {
        /// An exception was detected this cycle.
        Exception = 0,
        /// The ALU output is zero this cycle.
        CmpAluOZero = 1,
        /// The bus acknowledged the in-flight transaction this cycle.
        MemValid = 2,
        /// Constant true.
        #[default]
        True = 3,
    }
}

ucode_enum! {
    /// ALU operation performed this cycle.
    AluOp {
        #[default]
        Add = 0,
        Sub = 1,
        And = 2,
        Or = 3,
        Xor = 4,
        Sll = 5,
        Srl = 6,
        Sra = 7,
        CmpEq = 8,
        CmpNe = 9,
        /// Signed less-than; result is 0 or 1.
        CmpLt = 10,
        /// Signed greater-or-equal; result is 0 or 1.
        CmpGe = 11,
        CmpLtu = 12,
        CmpGeu = 13,
    }
}

ucode_enum! {
    /// Multi-cycle operation command. `Begin` loads the shift counter on
    /// this cycle's edge; `Hold` never restarts an in-flight operation.
    AluCmd {
        #[default]
        Hold = 0,
        Begin = 1,
    }
}

ucode_enum! {
    /// Modify the ALU result before it is registered.
    AluOMod {
        #[default]
        None = 0,
        InvLsb = 1,
        /// Clear bit 0 of the result (JALR target masking).
        ClearLsb = 2,
    }
}

ucode_enum! {
    /// Action on the program counter this cycle.
    PcAction {
        #[default]
        Hold = 0,
        /// Advance by 4 bytes (one word).
        Inc = 1,
        /// Load the word address from the ALU output (bits [31:2]).
        LoadAbs = 2,
        /// Add the word address from the ALU output (bits [31:2]).
        LoadRel = 3,
    }
}

ucode_enum! {
    /// Source selected into the ALU A operand latch.
    ASrc {
        /// Register file read port (value read last cycle).
        #[default]
        Gp = 0,
        /// Decoded immediate of the current instruction.
        Imm = 1,
        /// ALU output fed back, for chaining operations.
        AluO = 2,
        Zero = 3,
        Four = 4,
        NegOne = 5,
        ThirtyOne = 6,
    }
}

ucode_enum! {
    /// Source selected into the ALU B operand latch.
    BSrc {
        /// Register file read port (value read last cycle).
        #[default]
        Gp = 0,
        /// Program counter, as a byte address.
        Pc = 1,
        /// Decoded immediate of the current instruction.
        Imm = 2,
        One = 3,
        /// Bus read data, aligned and extended per `mem_sel`/`mem_extend`.
        DatR = 4,
        /// Zero-extended 5-bit CSR immediate (the rs1 field).
        CsrImm = 5,
        /// CSR file read port (value read last cycle).
        Csr = 6,
        /// The exception router's (cause, interrupt) latch, mcause layout.
        McauseLatch = 7,
    }
}

ucode_enum! {
    /// Register file read-address selector.
    RegRSel {
        #[default]
        InsnRs1 = 0,
        InsnRs2 = 1,
    }
}

ucode_enum! {
    /// Register file write-address selector.
    RegWSel {
        #[default]
        InsnRd = 0,
        /// Write to x0: architecturally discarded at the storage boundary.
        Zero = 1,
    }
}

ucode_enum! {
    /// CSR file operation. Anything but `None` preempts the general-purpose
    /// register selectors for this cycle.
    CsrOp {
        #[default]
        None = 0,
        Read = 1,
        Write = 2,
    }
}

ucode_enum! {
    /// CSR slot-address selector.
    CsrSel {
        /// Compressed address derived from the current instruction.
        #[default]
        Insn = 0,
        /// Low bits of the `target` field name the slot directly.
        Target = 1,
    }
}

ucode_enum! {
    /// Width of the memory transfer in progress.
    MemSel {
        /// Instruction fetch or no transfer; width handled automatically.
        #[default]
        Auto = 0,
        Byte = 1,
        Half = 2,
        Word = 3,
    }
}

ucode_enum! {
    /// Extension applied to sub-word read data.
    MemExtend {
        #[default]
        Zero = 0,
        Sign = 1,
    }
}

ucode_enum! {
    /// Exception-handling task for this cycle. Selecting a check mode here
    /// is the only way a check happens, so mutual exclusion between checks
    /// is structural rather than a program-correctness convention.
    ExceptCtl {
        #[default]
        None = 0,
        /// Check the decoder's illegal classification, then the pending
        /// interrupt condition. Decode-illegal wins within the same check.
        LatchDecoder = 1,
        /// Check bit 1 of the just-computed jump target.
        LatchJal = 2,
        /// Check store effective-address alignment against the width.
        LatchStoreAdr = 3,
        /// Check load effective-address alignment against the width.
        LatchLoadAdr = 4,
        /// mstatus: MPIE <= MIE, MIE <= 0.
        EnterInt = 5,
        /// mstatus: MIE <= MPIE, MPIE <= 1.
        LeaveInt = 6,
    }
}

/// One decoded microcode control word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MicroWord {
    pub jmp_type: JmpType,
    pub cond_test: CondTest,
    pub invert_test: bool,
    pub target: u8,

    pub alu_op: AluOp,
    pub alu_cmd: AluCmd,
    pub alu_o_mod: AluOMod,
    pub a_src: ASrc,
    pub b_src: BSrc,
    pub latch_a: bool,
    pub latch_b: bool,

    pub pc_action: PcAction,
    pub reg_read: bool,
    pub reg_write: bool,
    pub reg_r_sel: RegRSel,
    pub reg_w_sel: RegWSel,
    pub csr_op: CsrOp,
    pub csr_sel: CsrSel,

    pub mem_req: bool,
    pub mem_sel: MemSel,
    pub mem_extend: MemExtend,
    pub latch_adr: bool,
    pub latch_data: bool,
    pub write_mem: bool,
    pub insn_fetch: bool,

    pub except_ctl: ExceptCtl,
}

impl MicroWord {
    /// All-default word: sequential continue, no latches, no side effects.
    pub const NOP: MicroWord = MicroWord {
        jmp_type: JmpType::Cont,
        cond_test: CondTest::True,
        invert_test: false,
        target: 0,
        alu_op: AluOp::Add,
        alu_cmd: AluCmd::Hold,
        alu_o_mod: AluOMod::None,
        a_src: ASrc::Gp,
        b_src: BSrc::Gp,
        latch_a: false,
        latch_b: false,
        pc_action: PcAction::Hold,
        reg_read: false,
        reg_write: false,
        reg_r_sel: RegRSel::InsnRs1,
        reg_w_sel: RegWSel::InsnRd,
        csr_op: CsrOp::None,
        csr_sel: CsrSel::Insn,
        mem_req: false,
        mem_sel: MemSel::Auto,
        mem_extend: MemExtend::Zero,
        latch_adr: false,
        latch_data: false,
        write_mem: false,
        insn_fetch: false,
        except_ctl: ExceptCtl::None,
    };
}

/// One named field in a packed microcode record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    pub offset: u8,
    pub width: u8,
}

/// Bit layout of a packed microcode record, shipped alongside the image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldTable {
    pub fields: Vec<FieldDef>,
}

/// `(name, width)` for every field the engine consumes.
const FIELD_SPECS: [(&str, u8); 26] = [
    ("jmp_type", 2),
    ("cond_test", 2),
    ("invert_test", 1),
    ("target", 8),
    ("alu_op", 4),
    ("alu_cmd", 1),
    ("alu_o_mod", 2),
    ("a_src", 3),
    ("b_src", 3),
    ("latch_a", 1),
    ("latch_b", 1),
    ("pc_action", 2),
    ("reg_read", 1),
    ("reg_write", 1),
    ("reg_r_sel", 1),
    ("reg_w_sel", 1),
    ("csr_op", 2),
    ("csr_sel", 1),
    ("mem_req", 1),
    ("mem_sel", 2),
    ("mem_extend", 1),
    ("latch_adr", 1),
    ("latch_data", 1),
    ("write_mem", 1),
    ("insn_fetch", 1),
    ("except_ctl", 3),
];

impl FieldTable {
    /// The layout emitted by the reference assembler: fields packed
    /// back-to-back in `FIELD_SPECS` order, LSB first.
    pub fn reference() -> Self {
        let mut fields = Vec::with_capacity(FIELD_SPECS.len());
        let mut offset = 0u8;
        for (name, width) in FIELD_SPECS {
            fields.push(FieldDef {
                name: name.to_string(),
                offset,
                width,
            });
            offset += width;
        }
        FieldTable { fields }
    }

    /// Deserialize a field table from its bincode wire form.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, UcodeError> {
        bincode::deserialize(bytes).map_err(|e| UcodeError::FieldTable(e.to_string()))
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        bincode::serialize(self).expect("field table serialization cannot fail")
    }

    fn lookup(&self, name: &str) -> Result<&FieldDef, UcodeError> {
        let mut found = None;
        for f in &self.fields {
            if f.name == name {
                if found.is_some() {
                    return Err(UcodeError::DuplicateField(name.to_string()));
                }
                found = Some(f);
            }
        }
        found.ok_or_else(|| UcodeError::MissingField(name.to_string()))
    }

    /// Check the table names every engine field with the expected width and
    /// that no two fields overlap.
    fn validate(&self) -> Result<(), UcodeError> {
        let mut occupied = 0u64;
        for (name, width) in FIELD_SPECS {
            let def = self.lookup(name)?;
            if def.width != width {
                return Err(UcodeError::FieldWidth {
                    name: name.to_string(),
                    expected: width,
                    got: def.width,
                });
            }
            if def.offset as u16 + def.width as u16 > (RECORD_BYTES * 8) as u16 {
                return Err(UcodeError::FieldRange(name.to_string()));
            }
            let mask = (((1u128 << def.width) - 1) << def.offset) as u64;
            if occupied & mask != 0 {
                return Err(UcodeError::FieldOverlap(name.to_string()));
            }
            occupied |= mask;
        }
        Ok(())
    }

    fn extract(&self, record: u64, name: &str) -> u64 {
        // Validated up front; lookup cannot fail here.
        let def = self.lookup(name).expect("validated field table");
        (record >> def.offset) & ((1u64 << def.width) - 1)
    }

    fn insert(&self, record: &mut u64, name: &str, value: u64) {
        let def = self.lookup(name).expect("validated field table");
        let mask = (1u64 << def.width) - 1;
        *record = *record & !(mask << def.offset) | (value & mask) << def.offset;
    }
}

/// Errors loading a microcode image or its field table.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum UcodeError {
    #[error("microcode image is {got} bytes, expected {expected}")]
    ImageSize { expected: usize, got: usize },
    #[error("field table is missing field `{0}`")]
    MissingField(String),
    #[error("field table defines `{0}` more than once")]
    DuplicateField(String),
    #[error("field `{name}` is {got} bits wide, engine expects {expected}")]
    FieldWidth { name: String, expected: u8, got: u8 },
    #[error("field `{0}` extends past the record width")]
    FieldRange(String),
    #[error("field `{0}` overlaps another field")]
    FieldOverlap(String),
    #[error("record {slot}: field `{name}` holds out-of-range value {value}")]
    BadEnum { slot: usize, name: &'static str, value: u64 },
    #[error("malformed field table: {0}")]
    FieldTable(String),
}

/// The decoded microcode store.
#[derive(Debug, Clone)]
pub struct UcodeRom {
    words: Vec<MicroWord>,
}

impl UcodeRom {
    /// Build a store directly from structured words.
    pub fn from_words(words: Vec<MicroWord>) -> Self {
        assert_eq!(words.len(), UCODE_DEPTH);
        UcodeRom { words }
    }

    pub fn word(&self, addr: u8) -> &MicroWord {
        &self.words[addr as usize]
    }

    /// Decode a packed image against its field table. The image is parsed
    /// once here; execution never touches packed bits again.
    pub fn from_image(image: &[u8], table: &FieldTable) -> Result<Self, UcodeError> {
        table.validate()?;
        let expected = UCODE_DEPTH * RECORD_BYTES;
        if image.len() != expected {
            return Err(UcodeError::ImageSize {
                expected,
                got: image.len(),
            });
        }

        let mut words = Vec::with_capacity(UCODE_DEPTH);
        for slot in 0..UCODE_DEPTH {
            let mut raw = [0u8; RECORD_BYTES];
            raw.copy_from_slice(&image[slot * RECORD_BYTES..(slot + 1) * RECORD_BYTES]);
            let record = u64::from_le_bytes(raw);
            words.push(decode_record(record, table, slot)?);
        }
        log::debug!("microcode image decoded: {} records", UCODE_DEPTH);
        Ok(UcodeRom { words })
    }

    /// Pack the store back into image form under the given layout.
    pub fn to_image(&self, table: &FieldTable) -> Result<Vec<u8>, UcodeError> {
        table.validate()?;
        let mut out = Vec::with_capacity(UCODE_DEPTH * RECORD_BYTES);
        for word in &self.words {
            out.extend_from_slice(&encode_record(word, table).to_le_bytes());
        }
        Ok(out)
    }
}

fn decode_record(record: u64, table: &FieldTable, slot: usize) -> Result<MicroWord, UcodeError> {
    macro_rules! field {
        ($ty:ty, $name:literal) => {{
            let v = table.extract(record, $name);
            <$ty>::from_bits(v).ok_or(UcodeError::BadEnum {
                slot,
                name: $name,
                value: v,
            })?
        }};
    }
    macro_rules! flag {
        ($name:literal) => {
            table.extract(record, $name) != 0
        };
    }

    Ok(MicroWord {
        jmp_type: field!(JmpType, "jmp_type"),
        cond_test: field!(CondTest, "cond_test"),
        invert_test: flag!("invert_test"),
        target: table.extract(record, "target") as u8,
        alu_op: field!(AluOp, "alu_op"),
        alu_cmd: field!(AluCmd, "alu_cmd"),
        alu_o_mod: field!(AluOMod, "alu_o_mod"),
        a_src: field!(ASrc, "a_src"),
        b_src: field!(BSrc, "b_src"),
        latch_a: flag!("latch_a"),
        latch_b: flag!("latch_b"),
        pc_action: field!(PcAction, "pc_action"),
        reg_read: flag!("reg_read"),
        reg_write: flag!("reg_write"),
        reg_r_sel: field!(RegRSel, "reg_r_sel"),
        reg_w_sel: field!(RegWSel, "reg_w_sel"),
        csr_op: field!(CsrOp, "csr_op"),
        csr_sel: field!(CsrSel, "csr_sel"),
        mem_req: flag!("mem_req"),
        mem_sel: field!(MemSel, "mem_sel"),
        mem_extend: field!(MemExtend, "mem_extend"),
        latch_adr: flag!("latch_adr"),
        latch_data: flag!("latch_data"),
        write_mem: flag!("write_mem"),
        insn_fetch: flag!("insn_fetch"),
        except_ctl: field!(ExceptCtl, "except_ctl"),
    })
}

fn encode_record(word: &MicroWord, table: &FieldTable) -> u64 {
    let mut record = 0u64;
    table.insert(&mut record, "jmp_type", word.jmp_type.bits());
    table.insert(&mut record, "cond_test", word.cond_test.bits());
    table.insert(&mut record, "invert_test", word.invert_test as u64);
    table.insert(&mut record, "target", word.target as u64);
    table.insert(&mut record, "alu_op", word.alu_op.bits());
    table.insert(&mut record, "alu_cmd", word.alu_cmd.bits());
    table.insert(&mut record, "alu_o_mod", word.alu_o_mod.bits());
    table.insert(&mut record, "a_src", word.a_src.bits());
    table.insert(&mut record, "b_src", word.b_src.bits());
    table.insert(&mut record, "latch_a", word.latch_a as u64);
    table.insert(&mut record, "latch_b", word.latch_b as u64);
    table.insert(&mut record, "pc_action", word.pc_action.bits());
    table.insert(&mut record, "reg_read", word.reg_read as u64);
    table.insert(&mut record, "reg_write", word.reg_write as u64);
    table.insert(&mut record, "reg_r_sel", word.reg_r_sel.bits());
    table.insert(&mut record, "reg_w_sel", word.reg_w_sel.bits());
    table.insert(&mut record, "csr_op", word.csr_op.bits());
    table.insert(&mut record, "csr_sel", word.csr_sel.bits());
    table.insert(&mut record, "mem_req", word.mem_req as u64);
    table.insert(&mut record, "mem_sel", word.mem_sel.bits());
    table.insert(&mut record, "mem_extend", word.mem_extend.bits());
    table.insert(&mut record, "latch_adr", word.latch_adr as u64);
    table.insert(&mut record, "latch_data", word.latch_data as u64);
    table.insert(&mut record, "write_mem", word.write_mem as u64);
    table.insert(&mut record, "insn_fetch", word.insn_fetch as u64);
    table.insert(&mut record, "except_ctl", word.except_ctl.bits());
    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program;

    #[test]
    fn test_reference_layout_fits_one_record() {
        let table = FieldTable::reference();
        assert!(table.validate().is_ok());
        let last = table.fields.last().unwrap();
        assert!(last.offset + last.width <= (RECORD_BYTES * 8) as u8);
    }

    #[test]
    fn test_default_program_survives_image_form() {
        let rom = program::default_rom();
        let table = FieldTable::reference();
        let image = rom.to_image(&table).unwrap();
        assert_eq!(image.len(), UCODE_DEPTH * RECORD_BYTES);
        let reloaded = UcodeRom::from_image(&image, &table).unwrap();
        for addr in 0..UCODE_DEPTH {
            assert_eq!(reloaded.word(addr as u8), rom.word(addr as u8), "slot {addr}");
        }
    }

    #[test]
    fn test_truncated_image_rejected() {
        let table = FieldTable::reference();
        let err = UcodeRom::from_image(&[0u8; 100], &table).unwrap_err();
        assert!(matches!(err, UcodeError::ImageSize { .. }));
    }

    #[test]
    fn test_out_of_range_enum_rejected() {
        let table = FieldTable::reference();
        let mut image = vec![0u8; UCODE_DEPTH * RECORD_BYTES];
        // alu_op is 4 bits; 0b1111 names no operation.
        let mut record = 0u64;
        table.insert(&mut record, "alu_op", 0b1111);
        image[0..RECORD_BYTES].copy_from_slice(&record.to_le_bytes());
        let err = UcodeRom::from_image(&image, &table).unwrap_err();
        assert_eq!(
            err,
            UcodeError::BadEnum {
                slot: 0,
                name: "alu_op",
                value: 0b1111
            }
        );
    }

    #[test]
    fn test_missing_field_rejected() {
        let mut table = FieldTable::reference();
        table.fields.retain(|f| f.name != "jmp_type");
        let image = vec![0u8; UCODE_DEPTH * RECORD_BYTES];
        let err = UcodeRom::from_image(&image, &table).unwrap_err();
        assert_eq!(err, UcodeError::MissingField("jmp_type".to_string()));
    }

    #[test]
    fn test_field_table_round_trips_through_bincode() {
        let table = FieldTable::reference();
        let bytes = table.to_bytes();
        assert_eq!(FieldTable::from_bytes(&bytes).unwrap(), table);
    }
}
