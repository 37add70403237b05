//! Guest CPU context layout.
//!
//! Context load/store ops address the guest state by byte offset into this
//! structure; the backend materializes it as the thread's state block. Only
//! the offsets matter to the core.

use core::mem::offset_of;

use ember_x86::Reg;

/// Architectural guest state, one instance per guest thread.
#[derive(Debug, Clone)]
#[repr(C)]
pub struct CpuState {
    /// Guest instruction pointer.
    pub rip: u64,
    /// General purpose registers, in [`Reg`] numbering order.
    pub gregs: [u64; 16],
    /// XMM register file.
    pub xmm: [[u64; 2]; 16],
    /// `fs` segment base.
    pub fs: u64,
    /// `gs` segment base.
    pub gs: u64,
    /// Flag byte array; each architectural flag gets one byte.
    pub flags: [u8; 48],
    /// x87/MMX register stack, 16 bytes per slot.
    pub mm: [[u64; 2]; 8],
}

/// Byte index of the x87 TOP pointer inside [`CpuState::flags`].
pub const X87_TOP_FLAG_LOC: usize = 33;

/// Context offset of a general purpose register.
pub const fn gpr_offset(index: usize) -> u32 {
    (offset_of!(CpuState, gregs) + index * 8) as u32
}

/// Context offset of an XMM register.
pub const fn xmm_offset(index: usize) -> u32 {
    (offset_of!(CpuState, xmm) + index * 16) as u32
}

/// Context offset of the guest RIP.
pub const fn rip_offset() -> u32 {
    offset_of!(CpuState, rip) as u32
}

/// Context offset of one byte inside the flag array.
pub const fn flag_offset(loc: usize) -> u32 {
    (offset_of!(CpuState, flags) + loc) as u32
}

/// Context offset of the x87 TOP byte.
pub const fn x87_top_offset() -> u32 {
    flag_offset(X87_TOP_FLAG_LOC)
}

/// Context offset of the first x87/MMX stack slot.
pub const fn mm_base_offset() -> u32 {
    offset_of!(CpuState, mm) as u32
}

/// Context offset of the register a decoded operand names.
pub fn reg_offset(reg: Reg) -> u32 {
    debug_assert!(reg.is_valid());
    if reg.is_gpr() {
        gpr_offset(reg.to_u8() as usize)
    } else {
        xmm_offset((reg.to_u8() - 16) as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_are_stable_and_disjoint() {
        assert_eq!(gpr_offset(0), 8);
        assert_eq!(gpr_offset(15) - gpr_offset(14), 8);
        assert_eq!(xmm_offset(1) - xmm_offset(0), 16);
        assert!(x87_top_offset() > xmm_offset(15));
        assert!(mm_base_offset() > x87_top_offset());
    }

    #[test]
    fn reg_offset_follows_numbering() {
        assert_eq!(reg_offset(Reg::RAX), gpr_offset(0));
        assert_eq!(reg_offset(Reg::R15), gpr_offset(15));
        assert_eq!(reg_offset(Reg::XMM0), xmm_offset(0));
    }
}
