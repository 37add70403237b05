//! Static x86-64 opcode tables.
//!
//! A single `op!` row is the source of truth for one table entry: name,
//! routing kind, decode flags, the declared destination/source width and the
//! trailing immediate byte count. The decoder walks these tables; it never
//! hardcodes per-instruction knowledge.
//!
//! Coverage is the practically-exercised subset of the 64-bit ISA. Every
//! unpopulated entry is [`InstType::Invalid`] and fails decoding.

use bitflags::bitflags;

/// Routing kind of a table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstType {
    /// Unpopulated or illegal in 64-bit mode.
    Invalid,
    /// Plain instruction decoded by the generic operand path.
    Normal,
    /// Legacy prefix byte found where only an opcode may appear.
    LegacyPrefix,
    /// Primary opcode group 1 (`0x80/0x81/0x83`).
    Group1,
    /// Primary opcode group 1A (`0x8F`).
    Group1A,
    /// Primary opcode group 2 (shift/rotate family).
    Group2,
    /// Primary opcode group 3 (`0xF6/0xF7`).
    Group3,
    /// Primary opcode group 4 (`0xFE`).
    Group4,
    /// Primary opcode group 5 (`0xFF`).
    Group5,
    /// Primary opcode group 11 (`0xC6/0xC7`).
    Group11,
    /// Secondary group 6.
    Group6,
    /// Secondary group 7.
    Group7,
    /// Secondary group 8.
    Group8,
    /// Secondary group 9 (`0F C7`).
    Group9,
    /// Secondary group 10.
    Group10,
    /// Secondary group 12.
    Group12,
    /// Secondary group 13.
    Group13,
    /// Secondary group 14.
    Group14,
    /// Secondary group 15 (`0F AE`).
    Group15,
    /// Secondary group 16 (`0F 18`, prefetch).
    Group16,
    /// Secondary group 17.
    Group17,
    /// Secondary group P (`0F 0D`).
    GroupP,
    /// Secondary-group entry that routes once more through the ModRM byte.
    SecondGroupModRm,
    /// `0xD8..=0xDF` escape into the x87 table.
    X87TablePrefix,
    /// Reserved table-prefix routing.
    ModRmTablePrefix,
    /// `0xC4`/`0xC5` VEX escape.
    VexTablePrefix,
    /// `0x8F` XOP escape (unsupported).
    XopTablePrefix,
}

impl InstType {
    /// Index of a primary group for table addressing, if this is one.
    pub const fn primary_group(self) -> Option<u16> {
        Some(match self {
            InstType::Group1 => 0,
            InstType::Group1A => 1,
            InstType::Group2 => 2,
            InstType::Group3 => 3,
            InstType::Group4 => 4,
            InstType::Group5 => 5,
            InstType::Group11 => 6,
            _ => return None,
        })
    }

    /// Index of a secondary group for table addressing, if this is one.
    pub const fn secondary_group(self) -> Option<u16> {
        Some(match self {
            InstType::Group6 => 0,
            InstType::Group7 => 1,
            InstType::Group8 => 2,
            InstType::Group9 => 3,
            InstType::Group10 => 4,
            InstType::Group12 => 5,
            InstType::Group13 => 6,
            InstType::Group14 => 7,
            InstType::Group15 => 8,
            InstType::Group16 => 9,
            InstType::Group17 => 10,
            InstType::GroupP => 11,
            _ => return None,
        })
    }
}

bitflags! {
    /// Per-entry decode properties.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct InstFlags: u32 {
        /// The encoding carries a ModRM byte.
        const MODRM = 1 << 0;
        /// The ModRM r/m side is the destination (store direction).
        const SF_MOD_DST = 1 << 1;
        /// Destination is hardcoded to `rax`.
        const SF_DST_RAX = 1 << 2;
        /// Destination is hardcoded to `rdx`.
        const SF_DST_RDX = 1 << 3;
        /// First source is hardcoded to `rax`.
        const SF_SRC_RAX = 1 << 4;
        /// First source is hardcoded to `rcx`.
        const SF_SRC_RCX = 1 << 5;
        /// The low opcode nibble selects the destination register
        /// (`push r`, `mov r, imm` family); REX.B extends it.
        const SF_REX_IN_BYTE = 1 << 6;
        /// Operands live in the XMM file unless a `SF_*_GPR` override says
        /// otherwise.
        const XMM_FLAGS = 1 << 7;
        /// With [`InstFlags::XMM_FLAGS`]: the source is still a GPR.
        const SF_SRC_GPR = 1 << 8;
        /// With [`InstFlags::XMM_FLAGS`]: the destination is still a GPR.
        const SF_DST_GPR = 1 << 9;
        /// Register selection uses the legacy high-byte quirk targets.
        const SF_HIGH_XMM = 1 << 10;
        /// Sign-extend the trailing literal to 64 bits.
        const SRC_SEXT = 1 << 11;
        /// Literal doubles with REX.W (`mov r64, imm64`).
        const DISPLACE_SIZE_MUL_2 = 1 << 12;
        /// Literal halves under an operand-size override.
        const DISPLACE_SIZE_DIV_2 = 1 << 13;
        /// Terminates a basic block unconditionally (ret, trap, halt).
        const BLOCK_END = 1 << 14;
        /// Writes the guest RIP (branches, calls).
        const SETS_RIP = 1 << 15;
        /// x87 floating point operation.
        const X87 = 1 << 16;
    }
}

/// Operand width declared by a table entry, before prefix promotion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeSpec {
    /// Default width: 32-bit, promoted to 16 by `0x66` or 64 by REX.W.
    Def,
    /// Always 8-bit.
    B8,
    /// Always 16-bit.
    B16,
    /// Always 64-bit.
    B64,
    /// Always 128-bit.
    B128,
}

/// One opcode-table record.
#[derive(Debug, Clone, Copy)]
pub struct InstInfo {
    /// Mnemonic.
    pub name: &'static str,
    /// Routing kind.
    pub kind: InstType,
    /// Decode properties.
    pub flags: InstFlags,
    /// Declared destination width.
    pub dst_size: SizeSpec,
    /// Declared source width.
    pub src_size: SizeSpec,
    /// Trailing immediate bytes before scaling; for group-escape entries
    /// this is the encoding selector instead.
    pub more_bytes: u8,
}

impl InstInfo {
    /// `true` for entries that decode to a real instruction.
    pub const fn is_valid(&self) -> bool {
        !matches!(self.kind, InstType::Invalid | InstType::LegacyPrefix)
    }
}

const INVALID: InstInfo = InstInfo {
    name: "invalid",
    kind: InstType::Invalid,
    flags: InstFlags::empty(),
    dst_size: SizeSpec::Def,
    src_size: SizeSpec::Def,
    more_bytes: 0,
};

macro_rules! fl {
    () => { InstFlags::empty() };
    ($($f:ident)|+) => { InstFlags::from_bits_retain(0 $( | InstFlags::$f.bits() )+) };
}

macro_rules! op {
    ($name:literal, $kind:ident, $flags:expr, $dst:ident, $src:ident, $more:expr) => {
        InstInfo {
            name: $name,
            kind: InstType::$kind,
            flags: $flags,
            dst_size: SizeSpec::$dst,
            src_size: SizeSpec::$src,
            more_bytes: $more,
        }
    };
}

macro_rules! fill {
    ($t:ident, { $($idx:expr => $e:expr;)* }) => {
        $( $t[$idx as usize] = $e; )*
    };
}

/// Number of primary groups times 64 slots each (`(group << 6) | (sel << 3) | reg`).
pub const PRIMARY_GROUP_TABLE_LEN: usize = 7 << 6;
/// Number of secondary groups times 32 slots each (`(group << 5) | (prefix << 3) | reg`).
pub const SECOND_GROUP_TABLE_LEN: usize = 12 << 5;

/// Primary group table index.
pub const fn primary_group_index(group: u16, selector: u8, reg: u8) -> usize {
    ((group as usize) << 6) | ((selector as usize) << 3) | reg as usize
}

/// Secondary group table index.
pub const fn second_group_index(group: u16, prefix: u8, reg: u8) -> usize {
    ((group as usize) << 5) | ((prefix as usize) << 3) | reg as usize
}

/// x87 table index: `((escape - 0xD8) << 8) | modrm`.
pub const fn x87_index(escape_op: u8, modrm: u8) -> usize {
    (((escape_op - 0xD8) as usize) << 8) | modrm as usize
}

/// VEX table index: `((map_select - 1) << 10) | (pp << 8) | opcode`.
pub const fn vex_index(map_select: u8, pp: u8, opcode: u8) -> usize {
    (((map_select - 1) as usize) << 10) | ((pp as usize) << 8) | opcode as usize
}

/// One-byte opcode table.
pub static BASE_OPS: [InstInfo; 256] = base_ops();

const fn base_ops() -> [InstInfo; 256] {
    let mut t = [INVALID; 256];

    // ALU families share one encoding shape: r/m,r ; r,r/m ; al,imm8 ; eax,imm.
    macro_rules! alu_family {
        ($t:ident, $base:expr, $name:literal) => {
            fill!($t, {
                $base + 0 => op!($name, Normal, fl!(MODRM | SF_MOD_DST), B8, B8, 0);
                $base + 1 => op!($name, Normal, fl!(MODRM | SF_MOD_DST), Def, Def, 0);
                $base + 2 => op!($name, Normal, fl!(MODRM), B8, B8, 0);
                $base + 3 => op!($name, Normal, fl!(MODRM), Def, Def, 0);
                $base + 4 => op!($name, Normal, fl!(SF_DST_RAX), B8, B8, 1);
                $base + 5 => op!($name, Normal, fl!(SF_DST_RAX | SRC_SEXT | DISPLACE_SIZE_DIV_2), Def, Def, 4);
            });
        };
    }

    alu_family!(t, 0x00, "add");
    alu_family!(t, 0x08, "or");
    alu_family!(t, 0x10, "adc");
    alu_family!(t, 0x18, "sbb");
    alu_family!(t, 0x20, "and");
    alu_family!(t, 0x28, "sub");
    alu_family!(t, 0x30, "xor");
    alu_family!(t, 0x38, "cmp");

    let mut i = 0x50;
    while i <= 0x57 {
        t[i] = op!("push", Normal, fl!(SF_REX_IN_BYTE), B64, B64, 0);
        i += 1;
    }
    let mut i = 0x58;
    while i <= 0x5F {
        t[i] = op!("pop", Normal, fl!(SF_REX_IN_BYTE), B64, B64, 0);
        i += 1;
    }

    fill!(t, {
        0x63 => op!("movsxd", Normal, fl!(MODRM | SRC_SEXT), Def, Def, 0);
        0x68 => op!("push", Normal, fl!(SRC_SEXT | DISPLACE_SIZE_DIV_2), B64, Def, 4);
        0x69 => op!("imul", Normal, fl!(MODRM | SRC_SEXT | DISPLACE_SIZE_DIV_2), Def, Def, 4);
        0x6A => op!("push", Normal, fl!(SRC_SEXT), B64, B8, 1);
        0x6B => op!("imul", Normal, fl!(MODRM | SRC_SEXT), Def, Def, 1);
    });

    // Short conditional branches.
    let mut i = 0x70;
    while i <= 0x7F {
        t[i] = op!("jcc", Normal, fl!(SETS_RIP | SRC_SEXT), Def, B8, 1);
        i += 1;
    }

    fill!(t, {
        0x80 => op!("group1", Group1, fl!(), Def, Def, 0);
        0x81 => op!("group1", Group1, fl!(), Def, Def, 1);
        0x83 => op!("group1", Group1, fl!(), Def, Def, 3);
    });

    fill!(t, {
        0x84 => op!("test", Normal, fl!(MODRM | SF_MOD_DST), B8, B8, 0);
        0x85 => op!("test", Normal, fl!(MODRM | SF_MOD_DST), Def, Def, 0);
        0x86 => op!("xchg", Normal, fl!(MODRM | SF_MOD_DST), B8, B8, 0);
        0x87 => op!("xchg", Normal, fl!(MODRM | SF_MOD_DST), Def, Def, 0);
        0x88 => op!("mov", Normal, fl!(MODRM | SF_MOD_DST), B8, B8, 0);
        0x89 => op!("mov", Normal, fl!(MODRM | SF_MOD_DST), Def, Def, 0);
        0x8A => op!("mov", Normal, fl!(MODRM), B8, B8, 0);
        0x8B => op!("mov", Normal, fl!(MODRM), Def, Def, 0);
        0x8D => op!("lea", Normal, fl!(MODRM), Def, Def, 0);
        0x8F => op!("group1a", Group1A, fl!(), Def, Def, 0);
        0x90 => op!("nop", Normal, fl!(), Def, Def, 0);
        0x98 => op!("cwde", Normal, fl!(SF_DST_RAX | SF_SRC_RAX), Def, Def, 0);
        0x99 => op!("cdq", Normal, fl!(SF_DST_RDX | SF_SRC_RAX), Def, Def, 0);
        0xA8 => op!("test", Normal, fl!(SF_DST_RAX), B8, B8, 1);
        0xA9 => op!("test", Normal, fl!(SF_DST_RAX | SRC_SEXT | DISPLACE_SIZE_DIV_2), Def, Def, 4);
    });

    let mut i = 0xB0;
    while i <= 0xB7 {
        t[i] = op!("mov", Normal, fl!(SF_REX_IN_BYTE), B8, B8, 1);
        i += 1;
    }
    // mov r, imm: the only encoding with a genuine imm64 under REX.W.
    let mut i = 0xB8;
    while i <= 0xBF {
        t[i] = op!(
            "mov",
            Normal,
            fl!(SF_REX_IN_BYTE | DISPLACE_SIZE_MUL_2 | DISPLACE_SIZE_DIV_2),
            Def,
            Def,
            4
        );
        i += 1;
    }

    fill!(t, {
        0xC0 => op!("group2", Group2, fl!(), Def, Def, 0);
        0xC1 => op!("group2", Group2, fl!(), Def, Def, 1);
        0xD0 => op!("group2", Group2, fl!(), Def, Def, 2);
        0xD1 => op!("group2", Group2, fl!(), Def, Def, 3);
        0xD2 => op!("group2", Group2, fl!(), Def, Def, 4);
        0xD3 => op!("group2", Group2, fl!(), Def, Def, 5);
        0xC2 => op!("ret", Normal, fl!(BLOCK_END | SETS_RIP), B64, B16, 2);
        0xC3 => op!("ret", Normal, fl!(BLOCK_END | SETS_RIP), B64, B64, 0);
        0xC6 => op!("group11", Group11, fl!(), Def, Def, 0);
        0xC7 => op!("group11", Group11, fl!(), Def, Def, 1);
        0xC9 => op!("leave", Normal, fl!(), B64, B64, 0);
        0xCC => op!("int3", Normal, fl!(BLOCK_END), Def, Def, 0);
        0xCD => op!("int", Normal, fl!(BLOCK_END), Def, B8, 1);
        0xE8 => op!("call", Normal, fl!(SETS_RIP | SRC_SEXT | DISPLACE_SIZE_DIV_2), B64, Def, 4);
        0xE9 => op!("jmp", Normal, fl!(BLOCK_END | SETS_RIP | SRC_SEXT | DISPLACE_SIZE_DIV_2), Def, Def, 4);
        0xEB => op!("jmp", Normal, fl!(BLOCK_END | SETS_RIP | SRC_SEXT), Def, B8, 1);
        0xF4 => op!("hlt", Normal, fl!(BLOCK_END), Def, Def, 0);
        0xF6 => op!("group3", Group3, fl!(), Def, Def, 0);
        0xF7 => op!("group3", Group3, fl!(), Def, Def, 1);
        0xFE => op!("group4", Group4, fl!(), Def, Def, 0);
        0xFF => op!("group5", Group5, fl!(), Def, Def, 0);
    });

    // x87 escape range.
    let mut i = 0xD8;
    while i <= 0xDF {
        t[i] = op!("x87", X87TablePrefix, fl!(X87), Def, Def, 0);
        i += 1;
    }

    // VEX escapes; 0xC4 is the three-byte form, 0xC5 the two-byte form.
    t[0xC4] = op!("vex", VexTablePrefix, fl!(), Def, Def, 0);
    t[0xC5] = op!("vex", VexTablePrefix, fl!(), Def, Def, 0);

    t
}

/// Two-byte (`0F`) opcode table, no mandatory prefix.
pub static SECOND_BASE_OPS: [InstInfo; 256] = second_base_ops();

const fn second_base_ops() -> [InstInfo; 256] {
    let mut t = [INVALID; 256];

    fill!(t, {
        0x05 => op!("syscall", Normal, fl!(), B64, B64, 0);
        0x0B => op!("ud2", Normal, fl!(BLOCK_END), Def, Def, 0);
        0x0D => op!("groupp", GroupP, fl!(), Def, Def, 0);
        0x10 => op!("movups", Normal, fl!(MODRM | XMM_FLAGS), B128, B128, 0);
        0x11 => op!("movups", Normal, fl!(MODRM | SF_MOD_DST | XMM_FLAGS), B128, B128, 0);
        0x18 => op!("group16", Group16, fl!(), Def, Def, 0);
        0x1F => op!("nop", Normal, fl!(MODRM), Def, Def, 0);
        0x28 => op!("movaps", Normal, fl!(MODRM | XMM_FLAGS), B128, B128, 0);
        0x29 => op!("movaps", Normal, fl!(MODRM | SF_MOD_DST | XMM_FLAGS), B128, B128, 0);
        0x31 => op!("rdtsc", Normal, fl!(SF_DST_RAX), Def, Def, 0);
        0xA2 => op!("cpuid", Normal, fl!(SF_DST_RAX | SF_SRC_RAX), Def, Def, 0);
        0xA3 => op!("bt", Normal, fl!(MODRM | SF_MOD_DST), Def, Def, 0);
        0xAE => op!("group15", Group15, fl!(), Def, Def, 0);
        0xAF => op!("imul", Normal, fl!(MODRM), Def, Def, 0);
        0xB6 => op!("movzx", Normal, fl!(MODRM), Def, B8, 0);
        0xB7 => op!("movzx", Normal, fl!(MODRM), Def, B16, 0);
        0xBE => op!("movsx", Normal, fl!(MODRM), Def, B8, 0);
        0xBF => op!("movsx", Normal, fl!(MODRM), Def, B16, 0);
        0xC0 => op!("xadd", Normal, fl!(MODRM | SF_MOD_DST), B8, B8, 0);
        0xC1 => op!("xadd", Normal, fl!(MODRM | SF_MOD_DST), Def, Def, 0);
        0xC7 => op!("group9", Group9, fl!(), Def, Def, 0);
    });

    // cmovcc.
    let mut i = 0x40;
    while i <= 0x4F {
        t[i] = op!("cmovcc", Normal, fl!(MODRM), Def, Def, 0);
        i += 1;
    }
    // Long conditional branches.
    let mut i = 0x80;
    while i <= 0x8F {
        t[i] = op!("jcc", Normal, fl!(SETS_RIP | SRC_SEXT | DISPLACE_SIZE_DIV_2), Def, Def, 4);
        i += 1;
    }
    // setcc.
    let mut i = 0x90;
    while i <= 0x9F {
        t[i] = op!("setcc", Normal, fl!(MODRM | SF_MOD_DST), B8, B8, 0);
        i += 1;
    }

    t
}

/// Two-byte table under a last-escape `0x66` prefix.
pub static OP_SIZE_MOD_OPS: [InstInfo; 256] = op_size_mod_ops();

const fn op_size_mod_ops() -> [InstInfo; 256] {
    let mut t = [INVALID; 256];
    fill!(t, {
        0x10 => op!("movupd", Normal, fl!(MODRM | XMM_FLAGS), B128, B128, 0);
        0x11 => op!("movupd", Normal, fl!(MODRM | SF_MOD_DST | XMM_FLAGS), B128, B128, 0);
        0x28 => op!("movapd", Normal, fl!(MODRM | XMM_FLAGS), B128, B128, 0);
        0x29 => op!("movapd", Normal, fl!(MODRM | SF_MOD_DST | XMM_FLAGS), B128, B128, 0);
        0x6E => op!("movd", Normal, fl!(MODRM | XMM_FLAGS | SF_SRC_GPR), B128, Def, 0);
        0x6F => op!("movdqa", Normal, fl!(MODRM | XMM_FLAGS), B128, B128, 0);
        0x7E => op!("movd", Normal, fl!(MODRM | SF_MOD_DST | XMM_FLAGS | SF_DST_GPR), Def, B128, 0);
        0x7F => op!("movdqa", Normal, fl!(MODRM | SF_MOD_DST | XMM_FLAGS), B128, B128, 0);
        0xEF => op!("pxor", Normal, fl!(MODRM | XMM_FLAGS), B128, B128, 0);
    });
    t
}

/// Two-byte table under a last-escape `0xF3` prefix.
pub static REP_MOD_OPS: [InstInfo; 256] = rep_mod_ops();

const fn rep_mod_ops() -> [InstInfo; 256] {
    let mut t = [INVALID; 256];
    fill!(t, {
        0x10 => op!("movss", Normal, fl!(MODRM | XMM_FLAGS), B128, B128, 0);
        0x11 => op!("movss", Normal, fl!(MODRM | SF_MOD_DST | XMM_FLAGS), B128, B128, 0);
        0x6F => op!("movdqu", Normal, fl!(MODRM | XMM_FLAGS), B128, B128, 0);
        0x7F => op!("movdqu", Normal, fl!(MODRM | SF_MOD_DST | XMM_FLAGS), B128, B128, 0);
        0xB8 => op!("popcnt", Normal, fl!(MODRM), Def, Def, 0);
    });
    t
}

/// Two-byte table under a last-escape `0xF2` prefix.
pub static REPNE_MOD_OPS: [InstInfo; 256] = repne_mod_ops();

const fn repne_mod_ops() -> [InstInfo; 256] {
    let mut t = [INVALID; 256];
    fill!(t, {
        0x10 => op!("movsd", Normal, fl!(MODRM | XMM_FLAGS), B128, B128, 0);
        0x11 => op!("movsd", Normal, fl!(MODRM | SF_MOD_DST | XMM_FLAGS), B128, B128, 0);
        0x12 => op!("movddup", Normal, fl!(MODRM | XMM_FLAGS), B128, B128, 0);
    });
    t
}

/// Primary opcode groups, addressed by [`primary_group_index`]. The escape
/// entry's `more_bytes` is the selector distinguishing e.g. `0x80` from
/// `0x83`.
pub static PRIMARY_GROUP_OPS: [InstInfo; PRIMARY_GROUP_TABLE_LEN] = primary_group_ops();

const fn primary_group_ops() -> [InstInfo; PRIMARY_GROUP_TABLE_LEN] {
    let mut t = [INVALID; PRIMARY_GROUP_TABLE_LEN];

    const GROUP1_NAMES: [&str; 8] = ["add", "or", "adc", "sbb", "and", "sub", "xor", "cmp"];
    let mut reg = 0;
    while reg < 8 {
        // 0x80: r/m8, imm8.
        t[primary_group_index(0, 0, reg as u8)] = InstInfo {
            name: GROUP1_NAMES[reg],
            kind: InstType::Normal,
            flags: fl!(MODRM | SF_MOD_DST),
            dst_size: SizeSpec::B8,
            src_size: SizeSpec::B8,
            more_bytes: 1,
        };
        // 0x81: r/m, immz.
        t[primary_group_index(0, 1, reg as u8)] = InstInfo {
            name: GROUP1_NAMES[reg],
            kind: InstType::Normal,
            flags: fl!(MODRM | SF_MOD_DST | SRC_SEXT | DISPLACE_SIZE_DIV_2),
            dst_size: SizeSpec::Def,
            src_size: SizeSpec::Def,
            more_bytes: 4,
        };
        // 0x83: r/m, imm8 sign-extended.
        t[primary_group_index(0, 3, reg as u8)] = InstInfo {
            name: GROUP1_NAMES[reg],
            kind: InstType::Normal,
            flags: fl!(MODRM | SF_MOD_DST | SRC_SEXT),
            dst_size: SizeSpec::Def,
            src_size: SizeSpec::Def,
            more_bytes: 1,
        };
        reg += 1;
    }

    // Group 1A: pop r/m.
    t[primary_group_index(1, 0, 0)] =
        op!("pop", Normal, fl!(MODRM | SF_MOD_DST), B64, B64, 0);

    const GROUP2_NAMES: [&str; 8] = ["rol", "ror", "rcl", "rcr", "shl", "shr", "shl", "sar"];
    let mut reg = 0;
    while reg < 8 {
        // 0xC0 / 0xC1: shift by imm8.
        t[primary_group_index(2, 0, reg as u8)] = InstInfo {
            name: GROUP2_NAMES[reg],
            kind: InstType::Normal,
            flags: fl!(MODRM | SF_MOD_DST),
            dst_size: SizeSpec::B8,
            src_size: SizeSpec::B8,
            more_bytes: 1,
        };
        t[primary_group_index(2, 1, reg as u8)] = InstInfo {
            name: GROUP2_NAMES[reg],
            kind: InstType::Normal,
            flags: fl!(MODRM | SF_MOD_DST),
            dst_size: SizeSpec::Def,
            src_size: SizeSpec::B8,
            more_bytes: 1,
        };
        // 0xD0 / 0xD1: shift by one.
        t[primary_group_index(2, 2, reg as u8)] = InstInfo {
            name: GROUP2_NAMES[reg],
            kind: InstType::Normal,
            flags: fl!(MODRM | SF_MOD_DST),
            dst_size: SizeSpec::B8,
            src_size: SizeSpec::B8,
            more_bytes: 0,
        };
        t[primary_group_index(2, 3, reg as u8)] = InstInfo {
            name: GROUP2_NAMES[reg],
            kind: InstType::Normal,
            flags: fl!(MODRM | SF_MOD_DST),
            dst_size: SizeSpec::Def,
            src_size: SizeSpec::Def,
            more_bytes: 0,
        };
        // 0xD2 / 0xD3: shift by cl.
        t[primary_group_index(2, 4, reg as u8)] = InstInfo {
            name: GROUP2_NAMES[reg],
            kind: InstType::Normal,
            flags: fl!(MODRM | SF_MOD_DST | SF_SRC_RCX),
            dst_size: SizeSpec::B8,
            src_size: SizeSpec::B8,
            more_bytes: 0,
        };
        t[primary_group_index(2, 5, reg as u8)] = InstInfo {
            name: GROUP2_NAMES[reg],
            kind: InstType::Normal,
            flags: fl!(MODRM | SF_MOD_DST | SF_SRC_RCX),
            dst_size: SizeSpec::Def,
            src_size: SizeSpec::Def,
            more_bytes: 0,
        };
        reg += 1;
    }

    // Group 3: 0xF6 (selector 0) and 0xF7 (selector 1).
    fill!(t, {
        primary_group_index(3, 0, 0) => op!("test", Normal, fl!(MODRM | SF_MOD_DST), B8, B8, 1);
        primary_group_index(3, 0, 1) => op!("test", Normal, fl!(MODRM | SF_MOD_DST), B8, B8, 1);
        primary_group_index(3, 0, 2) => op!("not", Normal, fl!(MODRM | SF_MOD_DST), B8, B8, 0);
        primary_group_index(3, 0, 3) => op!("neg", Normal, fl!(MODRM | SF_MOD_DST), B8, B8, 0);
        primary_group_index(3, 0, 4) => op!("mul", Normal, fl!(MODRM | SF_DST_RAX), B8, B8, 0);
        primary_group_index(3, 0, 5) => op!("imul", Normal, fl!(MODRM | SF_DST_RAX), B8, B8, 0);
        primary_group_index(3, 0, 6) => op!("div", Normal, fl!(MODRM | SF_DST_RAX), B8, B8, 0);
        primary_group_index(3, 0, 7) => op!("idiv", Normal, fl!(MODRM | SF_DST_RAX), B8, B8, 0);
        primary_group_index(3, 1, 0) => op!("test", Normal, fl!(MODRM | SF_MOD_DST | SRC_SEXT | DISPLACE_SIZE_DIV_2), Def, Def, 4);
        primary_group_index(3, 1, 1) => op!("test", Normal, fl!(MODRM | SF_MOD_DST | SRC_SEXT | DISPLACE_SIZE_DIV_2), Def, Def, 4);
        primary_group_index(3, 1, 2) => op!("not", Normal, fl!(MODRM | SF_MOD_DST), Def, Def, 0);
        primary_group_index(3, 1, 3) => op!("neg", Normal, fl!(MODRM | SF_MOD_DST), Def, Def, 0);
        primary_group_index(3, 1, 4) => op!("mul", Normal, fl!(MODRM | SF_DST_RAX), Def, Def, 0);
        primary_group_index(3, 1, 5) => op!("imul", Normal, fl!(MODRM | SF_DST_RAX), Def, Def, 0);
        primary_group_index(3, 1, 6) => op!("div", Normal, fl!(MODRM | SF_DST_RAX), Def, Def, 0);
        primary_group_index(3, 1, 7) => op!("idiv", Normal, fl!(MODRM | SF_DST_RAX), Def, Def, 0);
    });

    // Group 4 / group 5.
    fill!(t, {
        primary_group_index(4, 0, 0) => op!("inc", Normal, fl!(MODRM | SF_MOD_DST), B8, B8, 0);
        primary_group_index(4, 0, 1) => op!("dec", Normal, fl!(MODRM | SF_MOD_DST), B8, B8, 0);
        primary_group_index(5, 0, 0) => op!("inc", Normal, fl!(MODRM | SF_MOD_DST), Def, Def, 0);
        primary_group_index(5, 0, 1) => op!("dec", Normal, fl!(MODRM | SF_MOD_DST), Def, Def, 0);
        primary_group_index(5, 0, 2) => op!("call", Normal, fl!(MODRM | SETS_RIP), B64, B64, 0);
        primary_group_index(5, 0, 4) => op!("jmp", Normal, fl!(MODRM | BLOCK_END | SETS_RIP), B64, B64, 0);
        primary_group_index(5, 0, 6) => op!("push", Normal, fl!(MODRM), B64, B64, 0);
    });

    // Group 11: mov r/m, imm.
    fill!(t, {
        primary_group_index(6, 0, 0) => op!("mov", Normal, fl!(MODRM | SF_MOD_DST), B8, B8, 1);
        primary_group_index(6, 1, 0) => op!("mov", Normal, fl!(MODRM | SF_MOD_DST | SRC_SEXT | DISPLACE_SIZE_DIV_2), Def, Def, 4);
    });

    t
}

/// Secondary opcode groups, addressed by [`second_group_index`] with the
/// last-escape-prefix class as the middle key.
pub static SECOND_GROUP_OPS: [InstInfo; SECOND_GROUP_TABLE_LEN] = second_group_ops();

const fn second_group_ops() -> [InstInfo; SECOND_GROUP_TABLE_LEN] {
    let mut t = [INVALID; SECOND_GROUP_TABLE_LEN];
    // Group 7 hosts the privileged ModRM subtable (xgetbv and friends).
    t[second_group_index(1, 0, 1)] =
        op!("group7-modrm", SecondGroupModRm, fl!(), Def, Def, 0);
    fill!(t, {
        // Group 9: cmpxchg8b/16b.
        second_group_index(3, 0, 1) => op!("cmpxchg16b", Normal, fl!(MODRM | SF_MOD_DST), Def, Def, 0);
        // Group 15: fences and MXCSR.
        second_group_index(8, 0, 2) => op!("ldmxcsr", Normal, fl!(MODRM), Def, Def, 0);
        second_group_index(8, 0, 3) => op!("stmxcsr", Normal, fl!(MODRM | SF_MOD_DST), Def, Def, 0);
        second_group_index(8, 0, 5) => op!("lfence", Normal, fl!(MODRM), Def, Def, 0);
        second_group_index(8, 0, 6) => op!("mfence", Normal, fl!(MODRM), Def, Def, 0);
        second_group_index(8, 0, 7) => op!("sfence", Normal, fl!(MODRM), Def, Def, 0);
        // Group 16 / group P: prefetch hints decode as nops with memory form.
        second_group_index(9, 0, 0) => op!("prefetchnta", Normal, fl!(MODRM), Def, Def, 0);
        second_group_index(9, 0, 1) => op!("prefetcht0", Normal, fl!(MODRM), Def, Def, 0);
        second_group_index(11, 0, 0) => op!("prefetch", Normal, fl!(MODRM), Def, Def, 0);
    });
    t
}

/// Privileged second-group ModRM subtable, addressed `(field << 3) | rm`.
pub static SECOND_MODRM_OPS: [InstInfo; 32] = second_modrm_ops();

const fn second_modrm_ops() -> [InstInfo; 32] {
    let mut t = [INVALID; 32];
    // xgetbv: 0F 01 D0 routes through reg=2 (field 1), rm=0.
    t[(1 << 3) | 0] = op!("xgetbv", Normal, fl!(SF_DST_RAX), Def, Def, 0);
    t
}

/// ModRM reg field to privileged-subtable field mapping; `None` entries are
/// invalid selections.
pub const SECOND_MODRM_FIELDS: [Option<u8>; 8] =
    [None, Some(0), Some(1), Some(2), None, None, None, Some(3)];

/// x87 escape table, addressed by [`x87_index`].
pub static X87_OPS: [InstInfo; 2048] = x87_ops();

const fn x87_ops() -> [InstInfo; 2048] {
    let mut t = [INVALID; 2048];

    let mut modrm = 0usize;
    while modrm < 256 {
        let mrm = modrm as u8;
        let mode = mrm >> 6;
        let reg = (mrm >> 3) & 0b111;

        // D8: single-precision arithmetic, register and memory forms.
        if mode == 0b11 {
            let d8 = match reg {
                0 => Some("fadd"),
                1 => Some("fmul"),
                4 => Some("fsub"),
                6 => Some("fdiv"),
                _ => None,
            };
            if let Some(name) = d8 {
                t[x87_index(0xD8, mrm)] = InstInfo {
                    name,
                    kind: InstType::Normal,
                    flags: fl!(X87),
                    dst_size: SizeSpec::B128,
                    src_size: SizeSpec::B128,
                    more_bytes: 0,
                };
            }
        } else {
            let d8 = match reg {
                0 => Some("fadd"),
                1 => Some("fmul"),
                4 => Some("fsub"),
                6 => Some("fdiv"),
                _ => None,
            };
            if let Some(name) = d8 {
                t[x87_index(0xD8, mrm)] = InstInfo {
                    name,
                    kind: InstType::Normal,
                    flags: fl!(X87 | MODRM),
                    dst_size: SizeSpec::B128,
                    src_size: SizeSpec::Def,
                    more_bytes: 0,
                };
            }
        }

        // D9: fld/fst/fstp m32 and the register-stack forms.
        if mode == 0b11 {
            if reg == 0 {
                t[x87_index(0xD9, mrm)] = InstInfo {
                    name: "fld",
                    kind: InstType::Normal,
                    flags: fl!(X87),
                    dst_size: SizeSpec::B128,
                    src_size: SizeSpec::B128,
                    more_bytes: 0,
                };
            }
            if mrm == 0xE8 {
                t[x87_index(0xD9, mrm)] = InstInfo {
                    name: "fld1",
                    kind: InstType::Normal,
                    flags: fl!(X87),
                    dst_size: SizeSpec::B128,
                    src_size: SizeSpec::B128,
                    more_bytes: 0,
                };
            }
            if mrm == 0xEE {
                t[x87_index(0xD9, mrm)] = InstInfo {
                    name: "fldz",
                    kind: InstType::Normal,
                    flags: fl!(X87),
                    dst_size: SizeSpec::B128,
                    src_size: SizeSpec::B128,
                    more_bytes: 0,
                };
            }
        } else if reg == 0 || reg == 2 || reg == 3 {
            t[x87_index(0xD9, mrm)] = InstInfo {
                name: if reg == 0 { "fld" } else if reg == 2 { "fst" } else { "fstp" },
                kind: InstType::Normal,
                flags: fl!(X87 | MODRM),
                dst_size: SizeSpec::B128,
                src_size: SizeSpec::Def,
                more_bytes: 0,
            };
        }

        // DD: the m64 forms plus fstp st(i).
        if mode == 0b11 {
            if reg == 3 {
                t[x87_index(0xDD, mrm)] = InstInfo {
                    name: "fstp",
                    kind: InstType::Normal,
                    flags: fl!(X87),
                    dst_size: SizeSpec::B128,
                    src_size: SizeSpec::B128,
                    more_bytes: 0,
                };
            }
        } else if reg == 0 || reg == 2 || reg == 3 {
            t[x87_index(0xDD, mrm)] = InstInfo {
                name: if reg == 0 { "fld" } else if reg == 2 { "fst" } else { "fstp" },
                kind: InstType::Normal,
                flags: fl!(X87 | MODRM),
                dst_size: SizeSpec::B128,
                src_size: SizeSpec::B64,
                more_bytes: 0,
            };
        }

        // DE: faddp and friends, register forms only.
        if mode == 0b11 {
            let de = match reg {
                0 => Some("faddp"),
                1 => Some("fmulp"),
                4 => Some("fsubp"),
                6 => Some("fdivp"),
                _ => None,
            };
            if let Some(name) = de {
                t[x87_index(0xDE, mrm)] = InstInfo {
                    name,
                    kind: InstType::Normal,
                    flags: fl!(X87),
                    dst_size: SizeSpec::B128,
                    src_size: SizeSpec::B128,
                    more_bytes: 0,
                };
            }
        }

        modrm += 1;
    }

    t
}

/// `0F 38` table: `(prefix_class << 8) | opcode` with classes none/66/F2.
pub static H0F38_OPS: [InstInfo; 3 * 256] = h0f38_ops();

const fn h0f38_ops() -> [InstInfo; 3 * 256] {
    let mut t = [INVALID; 3 * 256];
    // 66 0F 38 00: pshufb.
    t[(1 << 8) | 0x00] = op!("pshufb", Normal, fl!(MODRM | XMM_FLAGS), B128, B128, 0);
    t
}

/// `0F 3A` table: `(prefix_class << 8) | opcode` with classes none/66 plus a
/// REX bit.
pub static H0F3A_OPS: [InstInfo; 4 * 256] = h0f3a_ops();

const fn h0f3a_ops() -> [InstInfo; 4 * 256] {
    let mut t = [INVALID; 4 * 256];
    // 66 0F 3A 0F: palignr.
    t[(1 << 8) | 0x0F] = op!("palignr", Normal, fl!(MODRM | XMM_FLAGS), B128, B128, 1);
    t
}

/// VEX tables, addressed by [`vex_index`].
pub static VEX_OPS: [InstInfo; 3 * 1024] = vex_ops();

const fn vex_ops() -> [InstInfo; 3 * 1024] {
    let mut t = [INVALID; 3 * 1024];
    // VEX.66.0F EF: vpxor.
    t[vex_index(1, 1, 0xEF)] = op!("vpxor", Normal, fl!(MODRM | XMM_FLAGS), B128, B128, 0);
    t
}

/// XOP tables; nothing is supported, every entry rejects.
pub static XOP_OPS: [InstInfo; 3 * 1024] = [INVALID; 3 * 1024];

/// 3DNow! postfix-opcode table.
pub static DDD_NOW_OPS: [InstInfo; 256] = ddd_now_ops();

const fn ddd_now_ops() -> [InstInfo; 256] {
    let mut t = [INVALID; 256];
    fill!(t, {
        0x9E => op!("pfadd", Normal, fl!(MODRM | XMM_FLAGS), B64, B64, 0);
        0xB4 => op!("pfmul", Normal, fl!(MODRM | XMM_FLAGS), B64, B64, 0);
    });
    t
}

static_assertions::const_assert_eq!(PRIMARY_GROUP_TABLE_LEN, 448);
static_assertions::const_assert_eq!(SECOND_GROUP_TABLE_LEN, 384);
