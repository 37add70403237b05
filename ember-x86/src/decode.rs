use crate::flags::{DecodeFlags, OperandSize};
use crate::inst::{DecodedBlock, DecodedInstruction, Operand, TableId};
use crate::modrm::{ModRm, Sib};
use crate::regs::{map_modrm_to_reg, Reg, NO_INVALID_OFFSET};
use crate::tables::{self, InstFlags, InstInfo, InstType, SizeSpec};
use crate::MAX_INST_SIZE;

/// Upper bound on instructions decoded into one block.
const DECODED_BUFFER_CAP: usize = 0x1_0000;

/// Decoder knobs derived from the translator configuration.
#[derive(Debug, Clone)]
pub struct DecodeOptions {
    /// Continue decoding across basic-block boundaries when the continuation
    /// policy allows it.
    pub multiblock: bool,
    /// Cap on instructions per decoded block; `-1` means unlimited.
    pub max_inst_per_block: i64,
    /// Propagate a mid-block decode failure instead of returning the partial
    /// block.
    pub break_on_frontend_failure: bool,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self {
            multiblock: false,
            max_inst_per_block: -1,
            break_on_frontend_failure: false,
        }
    }
}

/// Failure to decode a guest instruction.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// Encoding ran past the 15-byte limit.
    #[error("instruction at {pc:#x} exceeds {} bytes", MAX_INST_SIZE)]
    TooLong {
        /// PC of the offending instruction.
        pc: u64,
    },
    /// The byte stream ended mid-instruction.
    #[error("byte stream exhausted while decoding at {pc:#x}")]
    Exhausted {
        /// PC of the offending instruction.
        pc: u64,
    },
    /// Matched entry is unpopulated or illegal in 64-bit mode.
    #[error("invalid or unknown opcode {op:#06x} ({table:?}) at {pc:#x}")]
    InvalidOpcode {
        /// Table the lookup ran in.
        table: TableId,
        /// Entry index.
        op: u16,
        /// PC of the offending instruction.
        pc: u64,
    },
    /// A legacy prefix appeared where only an opcode may.
    #[error("legacy prefix in opcode position at {pc:#x}")]
    LegacyPrefix {
        /// PC of the offending instruction.
        pc: u64,
    },
    /// XOP escapes are not supported.
    #[error("unsupported XOP encoding at {pc:#x}")]
    UnsupportedXop {
        /// PC of the offending instruction.
        pc: u64,
    },
    /// An unknown VEX map_select value.
    #[error("unsupported VEX map select {map_select} at {pc:#x}")]
    UnsupportedVexMap {
        /// Decoded map_select field.
        map_select: u8,
        /// PC of the offending instruction.
        pc: u64,
    },
    /// The table entry and the consumed bytes disagree.
    #[error("{bytes} undecoded trailing bytes at {pc:#x}")]
    TrailingBytes {
        /// Bytes the entry demanded but operand decoding never consumed.
        bytes: u8,
        /// PC of the offending instruction.
        pc: u64,
    },
}

/// Peeking byte cursor over one instruction's encoding.
struct ByteCursor<'a> {
    bytes: &'a [u8],
    pos: usize,
    pc: u64,
}

impl<'a> ByteCursor<'a> {
    fn new(bytes: &'a [u8], pc: u64) -> Self {
        Self { bytes, pos: 0, pc }
    }

    fn read_u8(&mut self) -> Result<u8, DecodeError> {
        if self.pos >= MAX_INST_SIZE {
            return Err(DecodeError::TooLong { pc: self.pc });
        }
        let b = *self
            .bytes
            .get(self.pos)
            .ok_or(DecodeError::Exhausted { pc: self.pc })?;
        self.pos += 1;
        Ok(b)
    }

    fn peek(&self, offset: usize) -> Result<u8, DecodeError> {
        self.bytes
            .get(self.pos + offset)
            .copied()
            .ok_or(DecodeError::Exhausted { pc: self.pc })
    }

    /// Little-endian read of `size` bytes; `size` must be 0, 1, 2, 4 or 8.
    fn read_data(&mut self, size: u8) -> Result<u64, DecodeError> {
        let mut value: u64 = 0;
        let mut i = 0;
        while i < size {
            value |= u64::from(self.read_u8()?) << (8 * i);
            i += 1;
        }
        Ok(value)
    }

    fn len(&self) -> u8 {
        self.pos as u8
    }
}

/// Working state for one instruction decode.
struct InstDecoder<'a> {
    cur: ByteCursor<'a>,
    pc: u64,
    flags: DecodeFlags,
    /// Last of `{0x66, 0xF2, 0xF3}` seen; selects two-byte subtables.
    last_escape_prefix: u8,
    modrm: Option<u8>,
    sib: Option<u8>,
    dest: Operand,
    src1: Operand,
    src2: Operand,
    dst_size: OperandSize,
    src_size: OperandSize,
    /// Opcode bytes that trail the operands (3DNow! postfix encoding).
    trailing_opcode_bytes: u8,
}

/// Which operand slot the generic paths write next.
#[derive(Clone, Copy, PartialEq)]
enum Slot {
    Dest,
    Src1,
    Src2,
}

impl<'a> InstDecoder<'a> {
    fn new(bytes: &'a [u8], pc: u64) -> Self {
        Self {
            cur: ByteCursor::new(bytes, pc),
            pc,
            flags: DecodeFlags::empty(),
            last_escape_prefix: 0,
            modrm: None,
            sib: None,
            dest: Operand::None,
            src1: Operand::None,
            src2: Operand::None,
            dst_size: OperandSize::B32,
            src_size: OperandSize::B32,
            trailing_opcode_bytes: 0,
        }
    }

    fn set_slot(&mut self, slot: Slot, operand: Operand) {
        match slot {
            Slot::Dest => self.dest = operand,
            Slot::Src1 => self.src1 = operand,
            Slot::Src2 => self.src2 = operand,
        }
    }

    fn run(mut self) -> Result<DecodedInstruction, DecodeError> {
        loop {
            let op = self.cur.read_u8()?;
            match op {
                0x0F => return self.escape_op(),
                0x66 => {
                    self.flags |= DecodeFlags::OPERAND_SIZE;
                    self.last_escape_prefix = op;
                }
                0x67 => self.flags |= DecodeFlags::ADDRESS_SIZE,
                // es/cs/ds overrides are meaningless in 64-bit mode but
                // compilers pad nops with them.
                0x26 | 0x2E | 0x3E => {}
                0x40..=0x4F => {
                    self.flags |= DecodeFlags::REX_PREFIX;
                    if op & 0b1000 != 0 {
                        self.flags |= DecodeFlags::REX_WIDENING;
                    }
                    if op & 0b0001 != 0 {
                        self.flags |= DecodeFlags::REX_XGPR_B;
                    }
                    if op & 0b0010 != 0 {
                        self.flags |= DecodeFlags::REX_XGPR_X;
                    }
                    if op & 0b0100 != 0 {
                        self.flags |= DecodeFlags::REX_XGPR_R;
                    }
                }
                0xF0 => self.flags |= DecodeFlags::LOCK,
                0xF2 => {
                    self.flags |= DecodeFlags::REPNE_PREFIX;
                    self.last_escape_prefix = op;
                }
                0xF3 => {
                    self.flags |= DecodeFlags::REP_PREFIX;
                    self.last_escape_prefix = op;
                }
                0x64 => self.flags |= DecodeFlags::FS_PREFIX,
                0x65 => self.flags |= DecodeFlags::GS_PREFIX,
                _ => return self.normal_op_header(TableId::Base, op as u16),
            }
        }
    }

    fn escape_op(mut self) -> Result<DecodedInstruction, DecodeError> {
        let escape_op = self.cur.read_u8()?;
        match escape_op {
            0x0F => {
                // 3DNow!: 0F 0F [ModRM] [SIB] [disp] [opcode]. The opcode
                // byte trails the displacement, so grab ModRM addressing
                // first and peek at the real opcode.
                let modrm_byte = self.cur.read_u8()?;
                self.modrm = Some(modrm_byte);
                self.flags |= DecodeFlags::MODRM_PRESENT;

                let modrm = ModRm(modrm_byte);
                let mut displacement = 0u8;
                self.decode_modrm(modrm, &mut displacement);
                self.decode_sib(modrm, &mut displacement)?;

                let op = self.cur.peek(displacement as usize)?;
                self.trailing_opcode_bytes = 1;
                self.normal_op_header(TableId::DddNow, op as u16)
            }
            0x38 => {
                let prefix: u16 = match self.last_escape_prefix {
                    0xF2 => 2,
                    0x66 => 1,
                    _ => 0,
                };
                let op = (prefix << 8) | self.cur.read_u8()? as u16;
                self.normal_op_header(TableId::F38, op)
            }
            0x3A => {
                let mut prefix: u16 = if self.last_escape_prefix == 0x66 { 1 } else { 0 };
                if self.flags.contains(DecodeFlags::REX_PREFIX) {
                    prefix |= 1 << 1;
                }
                let op = (prefix << 8) | self.cur.read_u8()? as u16;
                self.normal_op_header(TableId::F3A, op)
            }
            _ => {
                // x86-64 abuses the three legacy prefixes 0x66/0xF2/0xF3 to
                // extend the two-byte table. Only the last one before the
                // escape selects the subtable, and it stops acting as an
                // operand modifier once it has.
                match self.last_escape_prefix {
                    0xF3 => {
                        self.flags &= !DecodeFlags::REP_PREFIX;
                        self.normal_op_header(TableId::RepMod, escape_op as u16)
                    }
                    0xF2 => {
                        self.flags &= !DecodeFlags::REPNE_PREFIX;
                        self.normal_op_header(TableId::RepNeMod, escape_op as u16)
                    }
                    0x66 => {
                        self.flags &= !DecodeFlags::OPERAND_SIZE;
                        self.normal_op_header(TableId::OpSizeMod, escape_op as u16)
                    }
                    _ => self.normal_op_header(TableId::Second, escape_op as u16),
                }
            }
        }
    }

    fn lookup(table: TableId, op: u16) -> &'static InstInfo {
        let idx = op as usize;
        match table {
            TableId::Base => &tables::BASE_OPS[idx],
            TableId::Second => &tables::SECOND_BASE_OPS[idx],
            TableId::OpSizeMod => &tables::OP_SIZE_MOD_OPS[idx],
            TableId::RepMod => &tables::REP_MOD_OPS[idx],
            TableId::RepNeMod => &tables::REPNE_MOD_OPS[idx],
            TableId::PrimaryGroup => &tables::PRIMARY_GROUP_OPS[idx],
            TableId::SecondGroup => &tables::SECOND_GROUP_OPS[idx],
            TableId::SecondModRm => &tables::SECOND_MODRM_OPS[idx],
            TableId::X87 => &tables::X87_OPS[idx],
            TableId::F38 => &tables::H0F38_OPS[idx],
            TableId::F3A => &tables::H0F3A_OPS[idx],
            TableId::Vex => &tables::VEX_OPS[idx],
            TableId::DddNow => &tables::DDD_NOW_OPS[idx],
        }
    }

    fn read_modrm(&mut self) -> Result<ModRm, DecodeError> {
        let byte = match self.modrm {
            Some(b) => b,
            None => {
                let b = self.cur.read_u8()?;
                self.modrm = Some(b);
                b
            }
        };
        self.flags |= DecodeFlags::MODRM_PRESENT;
        Ok(ModRm(byte))
    }

    fn normal_op_header(
        mut self,
        table: TableId,
        op: u16,
    ) -> Result<DecodedInstruction, DecodeError> {
        let info = Self::lookup(table, op);

        if matches!(info.kind, InstType::LegacyPrefix) {
            self.flags |= DecodeFlags::LEGACY_PREFIX;
            return Err(DecodeError::LegacyPrefix { pc: self.pc });
        }
        if matches!(info.kind, InstType::Invalid) {
            return Err(DecodeError::InvalidOpcode { table, op, pc: self.pc });
        }

        if let Some(group) = info.kind.secondary_group() {
            let prefix = match self.last_escape_prefix {
                0xF3 => 1,
                0x66 => 2,
                0xF2 => 3,
                _ => 0,
            };
            let modrm = self.read_modrm()?;
            let idx = tables::second_group_index(group, prefix, modrm.reg()) as u16;
            let grouped = Self::lookup(TableId::SecondGroup, idx);
            if matches!(grouped.kind, InstType::SecondGroupModRm) {
                // Privileged subtable selection; most reg fields are invalid.
                let field = tables::SECOND_MODRM_FIELDS[modrm.reg() as usize].ok_or(
                    DecodeError::InvalidOpcode { table: TableId::SecondModRm, op: idx, pc: self.pc },
                )?;
                let sub = ((field << 3) | modrm.rm()) as u16;
                return self.normal_op(TableId::SecondModRm, sub);
            }
            return self.normal_op(TableId::SecondGroup, idx);
        }

        if matches!(info.kind, InstType::X87TablePrefix) {
            let modrm = self.read_modrm()?;
            let idx = tables::x87_index(op as u8, modrm.0) as u16;
            return self.normal_op(TableId::X87, idx);
        }

        if let Some(group) = info.kind.primary_group() {
            let modrm = self.read_modrm()?;
            let idx = tables::primary_group_index(group, info.more_bytes, modrm.reg()) as u16;
            return self.normal_op(TableId::PrimaryGroup, idx);
        }

        if matches!(info.kind, InstType::VexTablePrefix) {
            let mut map_select = 1u8;
            let pp;
            let byte1 = self.cur.read_u8()?;
            if op == 0xC5 {
                // Two-byte VEX.
                pp = byte1 & 0b11;
            } else {
                // Three-byte VEX.
                let byte2 = self.cur.read_u8()?;
                pp = byte2 & 0b11;
                map_select = byte1 & 0b11111;
                if !(1..=3).contains(&map_select) {
                    return Err(DecodeError::UnsupportedVexMap { map_select, pc: self.pc });
                }
            }
            let vex_op = self.cur.read_u8()?;
            let idx = tables::vex_index(map_select, pp, vex_op) as u16;
            return self.normal_op(TableId::Vex, idx);
        }

        if matches!(info.kind, InstType::XopTablePrefix) {
            return Err(DecodeError::UnsupportedXop { pc: self.pc });
        }

        self.normal_op(table, op)
    }

    /// `mod` and `rm` alone can demand a displacement.
    fn decode_modrm(&mut self, modrm: ModRm, displacement: &mut u8) {
        if modrm.mode() == 0b01 {
            *displacement = 1;
        } else if modrm.mode() == 0b10 {
            *displacement = 4;
        } else if modrm.mode() == 0 && modrm.rm() == 0b101 {
            *displacement = 4;
        }
        self.flags |= DecodeFlags::MODRM_PRESENT;
    }

    /// Pull the SIB byte when the addressing form has one and fold in its
    /// displacement corner cases.
    fn decode_sib(&mut self, modrm: ModRm, displacement: &mut u8) -> Result<bool, DecodeError> {
        let has_sib = modrm.mode() != 0b11 && modrm.rm() == 0b100;
        if !has_sib {
            return Ok(false);
        }

        let sib = match self.sib {
            Some(b) => Sib(b),
            None => {
                let b = self.cur.read_u8()?;
                self.sib = Some(b);
                Sib(b)
            }
        };
        self.flags |= DecodeFlags::SIB_PRESENT;

        if modrm.mode() == 0b01 {
            *displacement = 1;
        } else if modrm.mode() == 0b10 {
            *displacement = 4;
        } else if modrm.mode() == 0b00 && modrm.rm() == 0b101 {
            *displacement = 4;
        } else if modrm.mode() == 0b00 && modrm.rm() == 0b100 && sib.base() == 0b101 {
            *displacement = 4;
        }

        Ok(true)
    }

    /// Decode both sides of a ModRM operand pair: the reg field names a
    /// register, the r/m field names a register or a memory form.
    #[allow(clippy::too_many_arguments)]
    fn modrm_operands(
        &mut self,
        has_sib: bool,
        bytes: &mut u8,
        displacement: u8,
        xmm_gpr: bool,
        xmm_nongpr: bool,
        gpr_8bit: bool,
        nongpr_8bit: bool,
        high_xmm: bool,
    ) -> Result<(Operand, Operand), DecodeError> {
        let modrm = ModRm(self.modrm.unwrap_or(0));
        let has_rex = self.flags.contains(DecodeFlags::REX_PREFIX);

        let gpr = Operand::Gpr {
            reg: map_modrm_to_reg(
                u8::from(self.flags.contains(DecodeFlags::REX_XGPR_R)),
                modrm.reg(),
                gpr_8bit,
                has_rex,
                xmm_gpr,
                NO_INVALID_OFFSET,
            ),
            high_bits: (gpr_8bit && modrm.reg() >= 0b100 && !has_rex) || high_xmm,
        };

        let rex_b = u8::from(self.flags.contains(DecodeFlags::REX_XGPR_B));
        let non_gpr = if modrm.mode() == 0b11 {
            Operand::Gpr {
                reg: map_modrm_to_reg(
                    rex_b,
                    modrm.rm(),
                    nongpr_8bit,
                    has_rex,
                    xmm_nongpr,
                    NO_INVALID_OFFSET,
                ),
                high_bits: (nongpr_8bit && modrm.rm() >= 0b100 && !has_rex) || high_xmm,
            }
        } else if has_sib {
            let sib = Sib(self.sib.unwrap_or(0));
            // Index 0b100 without REX.X never names a register; base 0b101
            // under mod 0 is replaced by the 32-bit displacement.
            let index = map_modrm_to_reg(
                u8::from(self.flags.contains(DecodeFlags::REX_XGPR_X)),
                sib.index(),
                false,
                false,
                false,
                0b100,
            );
            let base = map_modrm_to_reg(
                rex_b,
                sib.base(),
                false,
                false,
                false,
                if modrm.mode() == 0 { 0b101 } else { NO_INVALID_OFFSET },
            );

            debug_assert!(displacement <= 4);
            let mut literal = self.cur.read_data(displacement)? as i64;
            if displacement == 1 {
                literal = i64::from(literal as i8);
            } else if displacement == 4 {
                literal = i64::from(literal as i32);
            }
            *bytes = bytes.wrapping_sub(displacement);

            Operand::Sib {
                scale: 1 << sib.scale(),
                index,
                base,
                offset: literal,
            }
        } else if modrm.mode() == 0 {
            if modrm.rm() == 0b101 {
                // RIP-relative 32-bit displacement.
                let literal = self.cur.read_data(4)? as u32;
                *bytes = bytes.wrapping_sub(4);
                Operand::RipRelative {
                    literal: i64::from(literal as i32),
                }
            } else {
                Operand::GprDirect {
                    reg: map_modrm_to_reg(rex_b, modrm.rm(), false, false, false, NO_INVALID_OFFSET),
                }
            }
        } else {
            let disp_size = if modrm.mode() == 1 { 1 } else { 4 };
            let mut literal = self.cur.read_data(disp_size)? as i64;
            if disp_size == 1 {
                literal = i64::from(literal as i8);
            } else {
                literal = i64::from(literal as i32);
            }
            *bytes = bytes.wrapping_sub(disp_size);

            Operand::GprIndirect {
                reg: map_modrm_to_reg(rex_b, modrm.rm(), false, false, false, NO_INVALID_OFFSET),
                displacement: literal as i32,
            }
        };

        Ok((gpr, non_gpr))
    }

    fn normal_op(mut self, table: TableId, op: u16) -> Result<DecodedInstruction, DecodeError> {
        let info = Self::lookup(table, op);

        if matches!(info.kind, InstType::LegacyPrefix) {
            self.flags |= DecodeFlags::LEGACY_PREFIX;
            return Err(DecodeError::LegacyPrefix { pc: self.pc });
        }
        if matches!(info.kind, InstType::Invalid) {
            return Err(DecodeError::InvalidOpcode { table, op, pc: self.pc });
        }
        if info.kind.primary_group().is_some() || info.kind.secondary_group().is_some() {
            // Groups must have routed through the header path already.
            return Err(DecodeError::InvalidOpcode { table, op, pc: self.pc });
        }

        self.dst_size = self.operand_size(info.dst_size);
        self.src_size = self.operand_size(info.src_size);

        let has_modrm = self.flags.contains(DecodeFlags::MODRM_PRESENT)
            || info.flags.contains(InstFlags::MODRM);

        let widening = self.flags.contains(DecodeFlags::REX_WIDENING);
        let narrowing = self.flags.contains(DecodeFlags::OPERAND_SIZE);
        let is_8bit_src = self.src_size == OperandSize::B8;
        let is_8bit_dst = self.dst_size == OperandSize::B8;
        let has_rex = self.flags.contains(DecodeFlags::REX_PREFIX);
        let xmm = info.flags.contains(InstFlags::XMM_FLAGS);
        let xmm_src = xmm && !info.flags.contains(InstFlags::SF_SRC_GPR);
        let xmm_dst = xmm && !info.flags.contains(InstFlags::SF_DST_GPR);
        let high_xmm = info.flags.contains(InstFlags::SF_HIGH_XMM);
        let mut displacement = 0u8;

        let mut dest_slot = Slot::Dest;

        if info.flags.intersects(InstFlags::SF_DST_RAX | InstFlags::SF_DST_RDX) {
            // Some instructions hardcode their destination register.
            let reg = if info.flags.contains(InstFlags::SF_DST_RAX) {
                Reg::RAX
            } else {
                Reg::RDX
            };
            self.dest = Operand::Gpr { reg, high_bits: false };
            dest_slot = Slot::Src1;
        }

        if info.flags.contains(InstFlags::SF_REX_IN_BYTE) {
            // The low opcode nibble selects the destination GPR; REX.B
            // extends it.
            let bits = (op & 0b111) as u8;
            let operand = Operand::Gpr {
                reg: map_modrm_to_reg(
                    u8::from(self.flags.contains(DecodeFlags::REX_XGPR_B)),
                    bits,
                    is_8bit_dst,
                    has_rex,
                    false,
                    NO_INVALID_OFFSET,
                ),
                high_bits: (is_8bit_dst && !has_rex && bits >= 0b100) || high_xmm,
            };
            self.set_slot(dest_slot, operand);
        }

        let mut has_sib = false;
        if has_modrm {
            let modrm = self.read_modrm()?;
            self.decode_modrm(modrm, &mut displacement);
            has_sib = self.decode_sib(modrm, &mut displacement)?;
        }

        let mut bytes = info.more_bytes.wrapping_add(displacement);
        if info.flags.contains(InstFlags::DISPLACE_SIZE_MUL_2) && widening {
            bytes <<= 1;
        }
        if info.flags.contains(InstFlags::DISPLACE_SIZE_DIV_2) && narrowing {
            bytes >>= 1;
        }

        if info.flags.contains(InstFlags::MODRM) && info.flags.contains(InstFlags::SF_MOD_DST) {
            // r/m side is the destination, reg side the source. A trailing
            // literal or hardcoded source still claims src1 afterwards; for
            // group encodings the reg field is only the opcode selector.
            let (gpr, non_gpr) = self.modrm_operands(
                has_sib,
                &mut bytes,
                displacement,
                xmm_src,
                xmm_dst,
                is_8bit_src,
                is_8bit_dst,
                high_xmm,
            )?;
            self.src1 = gpr;
            self.dest = non_gpr;
        }

        let mut src_slot = Slot::Src1;
        if info.flags.contains(InstFlags::MODRM) && !info.flags.contains(InstFlags::SF_MOD_DST) {
            let (gpr, non_gpr) = self.modrm_operands(
                has_sib,
                &mut bytes,
                displacement,
                xmm_dst,
                xmm_src,
                is_8bit_dst,
                is_8bit_src,
                high_xmm,
            )?;
            self.dest = gpr;
            self.src1 = non_gpr;
            src_slot = Slot::Src2;
        } else if info.flags.contains(InstFlags::SF_SRC_RAX) {
            self.set_slot(src_slot, Operand::Gpr { reg: Reg::RAX, high_bits: false });
            src_slot = Slot::Src2;
        } else if info.flags.contains(InstFlags::SF_SRC_RCX) {
            self.set_slot(src_slot, Operand::Gpr { reg: Reg::RCX, high_bits: false });
            src_slot = Slot::Src2;
        }

        if bytes != 0 {
            if bytes > 8 {
                return Err(DecodeError::TrailingBytes { bytes, pc: self.pc });
            }

            let mut literal = self.cur.read_data(bytes)?;
            if info.flags.contains(InstFlags::SRC_SEXT) {
                literal = match bytes {
                    1 => i64::from(literal as i8) as u64,
                    2 => i64::from(literal as i16) as u64,
                    _ => i64::from(literal as i32) as u64,
                };
            }

            self.set_slot(src_slot, Operand::Literal { value: literal, size: bytes });
            bytes = 0;
        }

        if bytes != 0 {
            return Err(DecodeError::TrailingBytes { bytes, pc: self.pc });
        }

        // 3DNow! carries its real opcode after the operands; fold it into
        // the instruction length now that the operands are consumed.
        let mut trailing = self.trailing_opcode_bytes;
        while trailing != 0 {
            self.cur.read_u8()?;
            trailing -= 1;
        }

        Ok(DecodedInstruction {
            pc: self.pc,
            op,
            table,
            flags: self.flags,
            dst_size: self.dst_size,
            src_size: self.src_size,
            modrm: self.modrm,
            sib: self.sib,
            dest: self.dest,
            src1: self.src1,
            src2: self.src2,
            size: self.cur.len(),
            info,
        })
    }

    /// Final operand width after prefix promotion (operand-size override
    /// drops the default to 16 bits, REX.W promotes it to 64).
    fn operand_size(&self, spec: SizeSpec) -> OperandSize {
        match spec {
            SizeSpec::B8 => OperandSize::B8,
            SizeSpec::B16 => OperandSize::B16,
            SizeSpec::B128 => OperandSize::B128,
            SizeSpec::B64 => OperandSize::B64,
            SizeSpec::Def => {
                if self.flags.contains(DecodeFlags::OPERAND_SIZE) {
                    OperandSize::B16
                } else if self.flags.contains(DecodeFlags::REX_WIDENING) {
                    OperandSize::B64
                } else {
                    OperandSize::B32
                }
            }
        }
    }
}

/// Prefix-aware x86-64 block decoder.
///
/// Decodes from an entry PC until the first block-ender the continuation
/// policy cannot see past. With `multiblock` enabled, conditional forward
/// branches widen the window and let decoding continue past unconditional
/// enders their targets already cover.
#[derive(Debug)]
pub struct Decoder {
    options: DecodeOptions,
    buffer: Vec<DecodedInstruction>,
    entry: u64,
    max_cond_branch_forward: u64,
    max_cond_branch_backwards: u64,
    symbol_min: u64,
    symbol_max: u64,
}

impl Decoder {
    /// New decoder with the given options.
    pub fn new(options: DecodeOptions) -> Self {
        Self {
            options,
            buffer: Vec::new(),
            entry: 0,
            max_cond_branch_forward: 0,
            max_cond_branch_backwards: u64::MAX,
            symbol_min: 0,
            symbol_max: u64::MAX,
        }
    }

    /// Window covered by conditional branches in the last decoded block:
    /// `(farthest backward target, farthest forward target)`.
    pub fn multiblock_window(&self) -> (u64, u64) {
        (self.max_cond_branch_backwards, self.max_cond_branch_forward)
    }

    /// Decode a single instruction at `pc` from `stream`.
    pub fn decode_instruction(
        &self,
        stream: &[u8],
        pc: u64,
    ) -> Result<DecodedInstruction, DecodeError> {
        InstDecoder::new(stream, pc).run()
    }

    /// Decode a run of guest basic blocks starting at `pc`.
    ///
    /// On a mid-block decode failure the partial block is returned unless
    /// `break_on_frontend_failure` is set; a failure on the very first
    /// instruction always propagates.
    pub fn decode_block(&mut self, stream: &[u8], pc: u64) -> Result<DecodedBlock, DecodeError> {
        self.buffer.clear();
        self.entry = pc;
        self.max_cond_branch_forward = 0;
        self.max_cond_branch_backwards = u64::MAX;
        // No symbol provider: be optimistic about the multiblock range.
        self.symbol_min = 0;
        self.symbol_max = u64::MAX;

        let mut offset = 0usize;
        loop {
            let inst = match self.decode_instruction(&stream[offset..], pc + offset as u64) {
                Ok(inst) => inst,
                Err(err) => {
                    if self.buffer.is_empty() || self.options.break_on_frontend_failure {
                        return Err(err);
                    }
                    tracing::debug!(
                        pc = pc + offset as u64,
                        entry = pc,
                        error = %err,
                        "frontend failure, returning partial block"
                    );
                    break;
                }
            };
            self.buffer.push(inst);

            let flags = inst.info.flags;
            let mut can_continue =
                !flags.intersects(InstFlags::BLOCK_END | InstFlags::SETS_RIP);

            if flags.contains(InstFlags::BLOCK_END) {
                // A conditional branch decoded earlier may already have
                // covered the bytes past this ender.
                can_continue = self.block_end_can_continue_past(&inst);
            }
            if flags.contains(InstFlags::SETS_RIP) {
                // Keep evaluating even when continuation is already decided;
                // the branch has to widen the window either way.
                can_continue |= self.branch_target_in_multiblock_range(&inst);
            }

            if !can_continue {
                break;
            }
            if self.options.max_inst_per_block >= 0
                && self.buffer.len() as i64 >= self.options.max_inst_per_block
            {
                break;
            }
            if self.buffer.len() >= DECODED_BUFFER_CAP {
                break;
            }

            offset += inst.size as usize;
            if offset >= stream.len() {
                break;
            }
        }

        Ok(DecodedBlock {
            entry: pc,
            instructions: core::mem::take(&mut self.buffer),
        })
    }

    fn block_end_can_continue_past(&self, inst: &DecodedInstruction) -> bool {
        if !self.options.multiblock {
            return false;
        }
        // A conditional forward branch seen earlier jumps past this PC, so
        // the bytes beyond the ender are live code:
        //
        //   test eax, eax
        //   jne  .continue
        //   ud2              <- ender we may decode past
        // .continue:
        inst.pc <= self.max_cond_branch_forward
    }

    fn branch_target_in_multiblock_range(&mut self, inst: &DecodedInstruction) -> bool {
        if !self.options.multiblock {
            return false;
        }

        let mut conditional = true;
        let target = match (inst.table, inst.op) {
            // Short conditional branches only; the long-form two-byte Jcc
            // always ends the decoded run.
            (TableId::Base, 0x70..=0x7F) => branch_target(inst),
            (TableId::Base, 0xE9 | 0xEB) => {
                conditional = false;
                branch_target(inst)
            }
            (TableId::Base, 0xC2 | 0xC3) => {
                conditional = false;
                0
            }
            _ => return false,
        };

        if target > self.symbol_min && target <= self.symbol_max {
            if conditional {
                self.max_cond_branch_forward = self.max_cond_branch_forward.max(target);
                self.max_cond_branch_backwards = self.max_cond_branch_backwards.min(target);
            }
            return true;
        }
        false
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new(DecodeOptions::default())
    }
}

/// Branch target: PC + instruction length + sign-extended literal.
fn branch_target(inst: &DecodedInstruction) -> u64 {
    let literal = inst.src1.literal().unwrap_or(0);
    inst.pc
        .wrapping_add(u64::from(inst.size))
        .wrapping_add(literal)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_one(bytes: &[u8]) -> DecodedInstruction {
        Decoder::default().decode_instruction(bytes, 0x1000).unwrap()
    }

    #[test]
    fn rex_w_mov_reg_reg() {
        // mov rax, rbx
        let inst = decode_one(&[0x48, 0x89, 0xD8]);
        assert_eq!(inst.size, 3);
        assert!(inst.flags.contains(DecodeFlags::REX_PREFIX | DecodeFlags::REX_WIDENING));
        assert_eq!(inst.dst_size, OperandSize::B64);
        assert_eq!(inst.src_size, OperandSize::B64);
        assert_eq!(inst.dest, Operand::Gpr { reg: Reg::RAX, high_bits: false });
        assert_eq!(inst.src1, Operand::Gpr { reg: Reg::RBX, high_bits: false });
    }

    #[test]
    fn wide_nop_with_sib_disp32() {
        // nopl 0x0(%rax,%rax,1) -- the canonical 8-byte alignment nop.
        let inst = decode_one(&[0x0F, 0x1F, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00]);
        assert_eq!(inst.size, 8);
        assert!(inst.flags.contains(DecodeFlags::MODRM_PRESENT | DecodeFlags::SIB_PRESENT));
        match inst.src1 {
            Operand::Sib { offset, scale, .. } => {
                assert_eq!(offset, 0);
                assert_eq!(scale, 1);
            }
            other => panic!("expected SIB operand, got {other:?}"),
        }
    }

    #[test]
    fn rejects_oversize_instruction() {
        // Enough prefixes to blow the 15-byte budget.
        let bytes = [0x66; 20];
        let err = Decoder::default()
            .decode_instruction(&bytes, 0)
            .unwrap_err();
        assert!(matches!(err, DecodeError::TooLong { .. }));
    }

    #[test]
    fn imm8_sign_extension() {
        // add rax, -1 (48 83 C0 FF)
        let inst = decode_one(&[0x48, 0x83, 0xC0, 0xFF]);
        assert_eq!(inst.table, TableId::PrimaryGroup);
        assert_eq!(inst.dest, Operand::Gpr { reg: Reg::RAX, high_bits: false });
        // For store-direction ops the literal claims src1; the reg field was
        // only the group selector.
        assert_eq!(inst.src1, Operand::Literal { value: u64::MAX, size: 1 });
    }

    #[test]
    fn mov_imm64_under_rex_w() {
        // movabs rax, 0x1122334455667788
        let inst = decode_one(&[
            0x48, 0xB8, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11,
        ]);
        assert_eq!(inst.size, 10);
        assert_eq!(
            inst.src1,
            Operand::Literal { value: 0x1122_3344_5566_7788, size: 8 }
        );
    }
}
