//! Guest ISA primitives for the Ember dynamic binary translator.
//!
//! This crate owns everything the translator core needs to know about the
//! 64-bit x86 guest encoding: register numbering, ModRM/SIB byte views,
//! prefix bookkeeping, the opcode tables, the decoded-instruction model and
//! the prefix-aware variable-length block decoder.
//!
//! The IR layer consumes [`DecodedInstruction`]s; nothing here depends on it.

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![deny(unused_must_use)]

mod decode;
mod flags;
mod inst;
mod modrm;
mod regs;
pub mod tables;

pub use decode::{DecodeError, DecodeOptions, Decoder};
pub use flags::{DecodeFlags, OperandSize};
pub use inst::{DecodedBlock, DecodedInstruction, Operand, TableId};
pub use modrm::{ModRm, Sib};
pub use regs::Reg;

/// Maximum legal length of a single x86 instruction in bytes.
pub const MAX_INST_SIZE: usize = 15;
