use bitflags::bitflags;

bitflags! {
    /// Prefix and structural state accumulated while decoding one
    /// instruction.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DecodeFlags: u32 {
        /// `0x66` operand-size override seen.
        const OPERAND_SIZE = 1 << 0;
        /// `0x67` address-size override seen.
        const ADDRESS_SIZE = 1 << 1;
        /// `0xF0` lock prefix seen.
        const LOCK = 1 << 2;
        /// A legacy prefix reached a position where only escape prefixes are
        /// allowed; the instruction is malformed.
        const LEGACY_PREFIX = 1 << 3;
        /// Any REX byte (`0x40..=0x4F`) seen.
        const REX_PREFIX = 1 << 4;
        /// A ModRM byte is part of the encoding.
        const MODRM_PRESENT = 1 << 5;
        /// A SIB byte is part of the encoding.
        const SIB_PRESENT = 1 << 6;
        /// REX.W: widen the operation to 64 bits.
        const REX_WIDENING = 1 << 7;
        /// REX.B: extend the ModRM r/m, SIB base or opcode register field.
        const REX_XGPR_B = 1 << 8;
        /// REX.X: extend the SIB index field.
        const REX_XGPR_X = 1 << 9;
        /// REX.R: extend the ModRM reg field.
        const REX_XGPR_R = 1 << 10;
        /// `0x64` fs segment override.
        const FS_PREFIX = 1 << 11;
        /// `0x65` gs segment override.
        const GS_PREFIX = 1 << 12;
        /// `0xF3` rep prefix.
        const REP_PREFIX = 1 << 13;
        /// `0xF2` repne prefix.
        const REPNE_PREFIX = 1 << 14;
    }
}

/// Operand width selected for one side of an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum OperandSize {
    /// 8-bit.
    B8 = 1,
    /// 16-bit.
    B16 = 2,
    /// 32-bit.
    B32 = 4,
    /// 64-bit.
    B64 = 8,
    /// 128-bit (XMM).
    B128 = 16,
}

impl OperandSize {
    /// Width in bytes.
    pub const fn bytes(self) -> u8 {
        self as u8
    }

    /// Width in bits.
    pub const fn bits(self) -> u16 {
        (self as u16) * 8
    }
}
