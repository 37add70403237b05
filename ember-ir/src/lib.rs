//! Translation core of the Ember dynamic binary translator.
//!
//! Decoded guest instructions (from [`ember_x86`]) are lowered into a linear
//! SSA IR, run through an ordered pass pipeline (x87 elimination and
//! lowering, the classical cleanup passes, compaction) and finally through
//! the graph-coloring register allocator. The outputs a host backend
//! consumes are the final [`ir::IrView`], the allocator's
//! [`regalloc::AllocationData`] and the spill-slot count.

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![deny(unused_must_use)]

pub mod builder;
pub mod config;
pub mod cpu;
pub mod dump;
pub mod ir;
pub mod passes;

pub use builder::{IrBuilder, TranslationError};
pub use config::Config;
pub use ir::{IrEmitter, IrOp, IrView, NodeId, RegClass};
pub use passes::regalloc::{self, AllocationData, RegAllocError, RegisterAllocationPass, SpillSlot};
pub use passes::{Pass, PassError, PassManager};
