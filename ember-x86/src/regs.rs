use core::fmt;

/// Guest register identifier.
///
/// Covers the sixteen general purpose registers followed by the sixteen XMM
/// registers. The numbering is shared with the IR layer, which derives guest
/// context offsets from it.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Reg(u8);

impl Reg {
    /// `rax`
    pub const RAX: Reg = Reg(0);
    /// `rcx`
    pub const RCX: Reg = Reg(1);
    /// `rdx`
    pub const RDX: Reg = Reg(2);
    /// `rbx`
    pub const RBX: Reg = Reg(3);
    /// `rsp`
    pub const RSP: Reg = Reg(4);
    /// `rbp`
    pub const RBP: Reg = Reg(5);
    /// `rsi`
    pub const RSI: Reg = Reg(6);
    /// `rdi`
    pub const RDI: Reg = Reg(7);
    /// `r8`
    pub const R8: Reg = Reg(8);
    /// `r9`
    pub const R9: Reg = Reg(9);
    /// `r10`
    pub const R10: Reg = Reg(10);
    /// `r11`
    pub const R11: Reg = Reg(11);
    /// `r12`
    pub const R12: Reg = Reg(12);
    /// `r13`
    pub const R13: Reg = Reg(13);
    /// `r14`
    pub const R14: Reg = Reg(14);
    /// `r15`
    pub const R15: Reg = Reg(15);
    /// `xmm0`
    pub const XMM0: Reg = Reg(16);
    /// `xmm15`
    pub const XMM15: Reg = Reg(31);
    /// Sentinel for an operand slot that names no register, e.g. a SIB byte
    /// without an index register.
    pub const INVALID: Reg = Reg(0xff);

    /// XMM register by index, `0..16`.
    pub const fn xmm(index: u8) -> Reg {
        Reg(16 + index)
    }

    /// Raw register number.
    pub const fn to_u8(self) -> u8 {
        self.0
    }

    /// `true` unless this is [`Reg::INVALID`].
    pub const fn is_valid(self) -> bool {
        self.0 != 0xff
    }

    /// `true` for `rax..=r15`.
    pub const fn is_gpr(self) -> bool {
        self.0 < 16
    }

    /// `true` for `xmm0..=xmm15`.
    pub const fn is_xmm(self) -> bool {
        self.0 >= 16 && self.0 < 32
    }
}

impl fmt::Debug for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const GPRS: [&str; 16] = [
            "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11",
            "r12", "r13", "r14", "r15",
        ];
        if self.is_gpr() {
            f.write_str(GPRS[self.0 as usize])
        } else if self.is_xmm() {
            write!(f, "xmm{}", self.0 - 16)
        } else {
            f.write_str("invalid")
        }
    }
}

/// Map a ModRM register field (plus the relevant REX extension bit) to a
/// guest register.
///
/// `high_bits` requests the legacy `ah/ch/dh/bh` aliasing: without a REX
/// prefix, 8-bit encodings `>= 4` name the high byte of the first four GPRs.
/// `invalid_offset` marks the one encoding that must be treated as "no
/// register" (SIB index `0b100`, or a SIB base of `0b101` under mod 0).
pub(crate) fn map_modrm_to_reg(
    rex_bit: u8,
    bits: u8,
    high_bits: bool,
    has_rex: bool,
    xmm: bool,
    invalid_offset: u8,
) -> Reg {
    // With high-byte aliasing the encoding still names the low four GPRs.
    const GPR_8BIT_HIGH: [u8; 8] = [0, 1, 2, 3, 0, 1, 2, 3];

    let offset = (rex_bit << 3) | bits;
    if offset == invalid_offset {
        return Reg::INVALID;
    }

    if xmm {
        Reg::xmm(offset)
    } else if high_bits && !has_rex {
        Reg(GPR_8BIT_HIGH[(offset & 0b111) as usize] | (offset & 0b1000))
    } else {
        Reg(offset)
    }
}

/// Encoding never maps to a register: passed as `invalid_offset` when every
/// encoding is valid.
pub(crate) const NO_INVALID_OFFSET: u8 = 16;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn high_byte_aliasing_without_rex() {
        // `ah` encodes as 4 in an 8-bit context without REX.
        let r = map_modrm_to_reg(0, 4, true, false, false, NO_INVALID_OFFSET);
        assert_eq!(r, Reg::RAX);
        // With a REX prefix the same encoding names `spl`, i.e. rsp.
        let r = map_modrm_to_reg(0, 4, true, true, false, NO_INVALID_OFFSET);
        assert_eq!(r, Reg::RSP);
    }

    #[test]
    fn rex_bit_extends_to_high_gprs() {
        assert_eq!(
            map_modrm_to_reg(1, 0b010, false, true, false, NO_INVALID_OFFSET),
            Reg::R10
        );
    }

    #[test]
    fn invalid_offset_yields_no_register() {
        assert_eq!(map_modrm_to_reg(0, 0b100, false, false, false, 0b100), Reg::INVALID);
        // The same encoding with the REX extension bit set is a real index.
        assert_eq!(
            map_modrm_to_reg(1, 0b100, false, false, false, 0b100),
            Reg::R12
        );
    }
}
