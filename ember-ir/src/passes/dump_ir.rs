//! IR dump pass.

use crate::dump;
use crate::ir::IrEmitter;
use crate::regalloc::AllocationData;

/// Logs the IR at a named pipeline phase, with register assignments once
/// allocation has run.
#[derive(Debug)]
pub struct DumpIr {
    phase: &'static str,
    with_ra: bool,
}

impl DumpIr {
    /// Dump slot for `phase`; `with_ra` annotates register assignments.
    pub fn new(phase: &'static str, with_ra: bool) -> Self {
        Self { phase, with_ra }
    }

    /// Phase name this slot dumps at.
    pub fn phase(&self) -> &'static str {
        self.phase
    }

    pub(crate) fn run_with_ra(&self, ir: &IrEmitter, ra: Option<&AllocationData>) {
        let ra = if self.with_ra { ra } else { None };
        let text = dump::dump_to_string(&ir.view(), ra);
        tracing::info!(phase = self.phase, "IR dump\n{text}");
    }
}
