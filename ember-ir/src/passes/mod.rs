//! Pass framework and the default pipeline.
//!
//! The manager owns an ordered sequence of pass slots plus a parallel set of
//! validation passes. The register-allocation and compaction slots are
//! addressable because other passes interrogate them: the IR dump wants the
//! allocation map, and the allocator reruns compaction every iteration.
//! Compaction must run before register allocation — renumbering afterwards
//! would break the backend's SSA-index-to-register lookup.

mod compaction;
mod const_prop;
mod context_elim;
mod dce;
mod dead_store;
mod dump_ir;
mod lower_x87;
pub mod regalloc;
mod replace_x87;
mod syscall_opt;
mod validation;

pub use compaction::Compaction;
pub use const_prop::ConstProp;
pub use context_elim::ContextLoadStoreElim;
pub use dce::DeadCodeElim;
pub use dead_store::DeadStoreElim;
pub use dump_ir::DumpIr;
pub use lower_x87::LowerX87;
pub use replace_x87::ReplaceX87;
pub use syscall_opt::SyscallOpt;
pub use validation::{IrValidation, ValueDominanceValidation};

use crate::config::Config;
use crate::ir::IrEmitter;
use regalloc::{RegAllocError, RegisterAllocationPass};

/// Fatal pass failure; the translation unit is discarded.
#[derive(Debug, thiserror::Error)]
pub enum PassError {
    /// Register allocation could not make progress.
    #[error(transparent)]
    RegAlloc(#[from] RegAllocError),
}

/// One mutation pass over the IR.
pub trait Pass {
    /// Name for diagnostics.
    fn name(&self) -> &'static str;

    /// Run over `ir`; returns whether anything changed.
    fn run(&mut self, ir: &mut IrEmitter) -> Result<bool, PassError>;
}

enum PassSlot {
    Pass(Box<dyn Pass>),
    RegisterAllocation,
    Dump(DumpIr),
}

/// Ordered pass pipeline.
#[derive(Default)]
pub struct PassManager {
    passes: Vec<PassSlot>,
    validation: Vec<Box<dyn Pass>>,
    ra: Option<RegisterAllocationPass>,
}

impl PassManager {
    /// Empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a pass.
    pub fn insert_pass(&mut self, pass: Box<dyn Pass>) {
        self.passes.push(PassSlot::Pass(pass));
    }

    /// Append a validation pass; runs after the pipeline in debug builds.
    pub fn insert_validation_pass(&mut self, pass: Box<dyn Pass>) {
        self.validation.push(pass);
    }

    /// Append an IR dump slot.
    pub fn insert_dump_pass(&mut self, dump: DumpIr) {
        self.passes.push(PassSlot::Dump(dump));
    }

    /// Append the register allocation pass.
    ///
    /// `optimize_sra` is accepted for interface parity with callers that
    /// drive static register allocation; this core registers no SRA pass,
    /// so the flag has nothing to optimize.
    pub fn insert_register_allocation_pass(&mut self, optimize_sra: bool) {
        let _ = optimize_sra;
        self.ra = Some(RegisterAllocationPass::new());
        self.passes.push(PassSlot::RegisterAllocation);
        self.passes
            .push(PassSlot::Dump(DumpIr::new("after-ra", true)));
    }

    /// Register the default pipeline in its fixed order.
    pub fn add_default_passes(
        &mut self,
        config: &Config,
        inline_constants: bool,
        static_reg_alloc: bool,
    ) {
        if !config.disable_passes {
            self.insert_pass(Box::new(ReplaceX87::new(
                config.unsafe_replace_x87,
                config.multiblock,
            )));
        }

        if config.dumps_phase("replace-x87") {
            self.insert_dump_pass(DumpIr::new("replace-x87", false));
        }

        // Not an optimization; lowering always runs.
        self.insert_pass(Box::new(LowerX87::default()));

        if !config.disable_passes {
            self.insert_pass(Box::new(ContextLoadStoreElim::default()));
            self.insert_pass(Box::new(DeadStoreElim::default()));
            self.insert_pass(Box::new(DeadCodeElim::default()));
            self.insert_pass(Box::new(ConstProp::new(inline_constants)));
            self.insert_pass(Box::new(SyscallOpt::default()));
            self.insert_pass(Box::new(DeadCodeElim::default()));
        }

        if inline_constants && static_reg_alloc {
            // Static register allocation is not part of this core; see
            // DESIGN.md.
            tracing::debug!("static register allocation requested but unavailable");
        }

        self.insert_pass(Box::new(Compaction::default()));

        if config.dumps_phase("before-ra") {
            self.insert_dump_pass(DumpIr::new("before-ra", false));
        }
    }

    /// Register the default validation passes.
    pub fn add_default_validation_passes(&mut self) {
        self.insert_validation_pass(Box::new(IrValidation::default()));
        self.insert_validation_pass(Box::new(ValueDominanceValidation::default()));
    }

    /// `true` once a register allocation pass is registered.
    pub fn has_ra_pass(&self) -> bool {
        self.ra.is_some()
    }

    /// The register allocation pass, for configuration and result queries.
    pub fn ra_pass(&self) -> Option<&RegisterAllocationPass> {
        self.ra.as_ref()
    }

    /// Mutable access to the register allocation pass.
    pub fn ra_pass_mut(&mut self) -> Option<&mut RegisterAllocationPass> {
        self.ra.as_mut()
    }

    /// Run every pass in order; validation passes follow in debug builds.
    pub fn run(&mut self, ir: &mut IrEmitter) -> Result<bool, PassError> {
        let mut changed = false;
        for slot in self.passes.iter_mut() {
            match slot {
                PassSlot::Pass(pass) => {
                    let result = pass.run(ir)?;
                    tracing::trace!(pass = pass.name(), changed = result, "pass finished");
                    changed |= result;
                }
                PassSlot::RegisterAllocation => {
                    let ra = self.ra.as_mut().expect("RA slot without RA pass");
                    changed |= ra.run(ir)?;
                }
                PassSlot::Dump(dump) => {
                    let ra_data = self
                        .ra
                        .as_ref()
                        .and_then(RegisterAllocationPass::allocation_data);
                    dump.run_with_ra(ir, ra_data);
                }
            }
        }

        if cfg!(debug_assertions) {
            for pass in self.validation.iter_mut() {
                changed |= pass.run(ir)?;
            }
        }

        Ok(changed)
    }
}
