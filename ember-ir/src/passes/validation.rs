//! Debug-build invariant checks.
//!
//! Registered as validation passes and run after the pipeline; violations
//! are programming errors in a pass, so they trip `debug_assert!` rather
//! than returning a recoverable error.

use crate::ir::{IrEmitter, IrOp, NodeId};
use crate::passes::{Pass, PassError};

/// Structural checks: node 0 is the only header, every block brackets a
/// well-formed chain, and code nodes are never structural ops.
#[derive(Debug, Default)]
pub struct IrValidation;

impl Pass for IrValidation {
    fn name(&self) -> &'static str {
        "IRValidation"
    }

    fn run(&mut self, ir: &mut IrEmitter) -> Result<bool, PassError> {
        let view = ir.view();

        debug_assert!(
            matches!(view.op(view.header_id()), IrOp::IrHeader { .. }),
            "first op must be the IR header"
        );
        for id in (0..view.ssa_count()).map(NodeId) {
            if id != view.header_id() && !view.is_dead(id) {
                debug_assert!(
                    !matches!(view.op(id), IrOp::IrHeader { .. }),
                    "{id} is a second IRHeader"
                );
            }
        }

        for block in view.blocks() {
            debug_assert!(
                matches!(view.op(block), IrOp::CodeBlock { .. }),
                "block list entry {block} is not a CodeBlock"
            );
            let Some((begin, last)) = view.code_range(block) else {
                if let IrOp::CodeBlock { begin, last, .. } = view.op(block) {
                    debug_assert!(
                        begin.is_none() && last.is_none(),
                        "half-bracketed block {block}"
                    );
                }
                continue;
            };

            let mut reached_last = false;
            for id in view.iter_range(begin, last) {
                debug_assert!(
                    !matches!(view.op(id), IrOp::IrHeader { .. } | IrOp::CodeBlock { .. }),
                    "structural op {id} inside code of {block}"
                );
                debug_assert!(!view.is_dead(id), "dead node {id} linked in {block}");
                reached_last = id == last;
            }
            debug_assert!(reached_last, "block {block} chain never reaches its last node");
        }

        Ok(false)
    }
}

/// Every argument must reference a definition already seen walking the
/// blocks in program order.
#[derive(Debug, Default)]
pub struct ValueDominanceValidation;

impl Pass for ValueDominanceValidation {
    fn name(&self) -> &'static str {
        "ValueDominanceValidation"
    }

    fn run(&mut self, ir: &mut IrEmitter) -> Result<bool, PassError> {
        let view = ir.view();
        let mut defined = vec![false; view.ssa_count() as usize];

        for block in view.blocks() {
            for id in view.code(block) {
                for arg in view.op(id).args().iter() {
                    debug_assert!(
                        defined[arg.index()],
                        "{id} uses {arg} before its definition"
                    );
                }
                defined[id.index()] = true;
            }
        }

        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::RegClass;

    #[test]
    fn clean_program_passes_validation() {
        let mut ir = IrEmitter::new();
        ir.allocate_header(0);
        ir.create_code_block();
        let v = ir.constant(1);
        ir.store_context(RegClass::Gpr, 8, 0x10, v);
        ir.exit_function();

        assert!(!IrValidation.run(&mut ir).unwrap());
        assert!(!ValueDominanceValidation.run(&mut ir).unwrap());
    }

    #[test]
    #[should_panic(expected = "before its definition")]
    #[cfg(debug_assertions)]
    fn use_before_def_is_caught() {
        let mut ir = IrEmitter::new();
        ir.allocate_header(0);
        ir.create_code_block();
        let v = ir.constant(1);
        let early = ir.store_context(RegClass::Gpr, 8, 0x10, v);
        ir.exit_function();

        // Move the definition after its use.
        ir.set_write_cursor(Some(early));
        let late = ir.constant(2);
        ir.replace_all_uses_with(v, late);

        let _ = ValueDominanceValidation.run(&mut ir);
    }
}
