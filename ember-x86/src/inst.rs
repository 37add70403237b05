use crate::flags::{DecodeFlags, OperandSize};
use crate::regs::Reg;
use crate::tables::InstInfo;

/// Which opcode table a decoded instruction was matched in.
///
/// Together with [`DecodedInstruction::op`] this uniquely names the matched
/// table entry; the IR builder dispatches on the pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TableId {
    /// One-byte table.
    Base,
    /// Two-byte (`0F`) table.
    Second,
    /// Two-byte table under last-escape `0x66`.
    OpSizeMod,
    /// Two-byte table under last-escape `0xF3`.
    RepMod,
    /// Two-byte table under last-escape `0xF2`.
    RepNeMod,
    /// Primary opcode groups.
    PrimaryGroup,
    /// Secondary opcode groups.
    SecondGroup,
    /// Privileged second-group ModRM subtable.
    SecondModRm,
    /// x87 escape table.
    X87,
    /// `0F 38` table.
    F38,
    /// `0F 3A` table.
    F3A,
    /// VEX tables.
    Vex,
    /// 3DNow! table.
    DddNow,
}

/// One decoded operand slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Operand {
    /// Slot unused.
    #[default]
    None,
    /// Plain register.
    Gpr {
        /// Selected register.
        reg: Reg,
        /// Legacy `ah/ch/dh/bh` high-byte access.
        high_bits: bool,
    },
    /// Register holding the address of the operand (`mod == 0`, no
    /// displacement).
    GprDirect {
        /// Base register.
        reg: Reg,
    },
    /// Register plus displacement addressing.
    GprIndirect {
        /// Base register.
        reg: Reg,
        /// Sign-extended displacement.
        displacement: i32,
    },
    /// Scale-index-base addressing.
    Sib {
        /// Effective scale, `1 | 2 | 4 | 8`.
        scale: u8,
        /// Index register; [`Reg::INVALID`] when the encoding names none.
        index: Reg,
        /// Base register; [`Reg::INVALID`] when the encoding names none.
        base: Reg,
        /// Sign-extended displacement.
        offset: i64,
    },
    /// RIP-relative literal.
    RipRelative {
        /// Sign-extended 32-bit displacement.
        literal: i64,
    },
    /// Immediate literal.
    Literal {
        /// Immediate value, sign-extended when the table entry demands it.
        value: u64,
        /// Encoded byte width of the literal.
        size: u8,
    },
}

impl Operand {
    /// `true` when the slot carries anything.
    pub const fn is_some(&self) -> bool {
        !matches!(self, Operand::None)
    }

    /// `true` for [`Operand::Literal`].
    pub const fn is_literal(&self) -> bool {
        matches!(self, Operand::Literal { .. })
    }

    /// The literal value, if this is one.
    pub const fn literal(&self) -> Option<u64> {
        match self {
            Operand::Literal { value, .. } => Some(*value),
            _ => None,
        }
    }
}

/// A fully decoded guest instruction.
#[derive(Debug, Clone, Copy)]
pub struct DecodedInstruction {
    /// Guest program counter of the first byte.
    pub pc: u64,
    /// Index of the matched entry inside [`DecodedInstruction::table`].
    pub op: u16,
    /// Table the entry was matched in.
    pub table: TableId,
    /// Prefix and structural flags.
    pub flags: DecodeFlags,
    /// Destination operand width after prefix promotion.
    pub dst_size: OperandSize,
    /// Source operand width after prefix promotion.
    pub src_size: OperandSize,
    /// Raw ModRM byte when one was decoded.
    pub modrm: Option<u8>,
    /// Raw SIB byte when one was decoded.
    pub sib: Option<u8>,
    /// Destination operand.
    pub dest: Operand,
    /// First source operand.
    pub src1: Operand,
    /// Second source operand.
    pub src2: Operand,
    /// Total encoded length in bytes.
    pub size: u8,
    /// Matched opcode-table record.
    pub info: &'static InstInfo,
}

impl DecodedInstruction {
    /// Table record for this instruction.
    pub fn info(&self) -> &'static InstInfo {
        self.info
    }

    /// Number of literal operands carried (the encoding allows at most one).
    pub fn literal_count(&self) -> usize {
        [self.dest, self.src1, self.src2]
            .iter()
            .filter(|o| o.is_literal())
            .count()
    }
}

/// A decoded run of one or more guest basic blocks.
///
/// The first instruction starts at [`DecodedBlock::entry`]; every later
/// instruction starts where its predecessor ended. The run stops at the
/// first block-ender the continuation policy could not see past.
#[derive(Debug, Clone, Default)]
pub struct DecodedBlock {
    /// Guest PC of the first instruction.
    pub entry: u64,
    /// Decoded instructions in guest order.
    pub instructions: Vec<DecodedInstruction>,
}

impl DecodedBlock {
    /// Sum of the decoded instruction lengths, i.e. the bytes consumed from
    /// the guest stream.
    pub fn byte_len(&self) -> usize {
        self.instructions.iter().map(|i| i.size as usize).sum()
    }
}
