//! Dead code elimination.

use crate::ir::{IrEmitter, NodeId};
use crate::passes::{Pass, PassError};

/// Removes value definitions with no remaining uses and no side effects.
/// Worklist-driven so chains of dead ops die in one run.
#[derive(Debug, Default)]
pub struct DeadCodeElim;

impl Pass for DeadCodeElim {
    fn name(&self) -> &'static str {
        "DeadCodeElimination"
    }

    fn run(&mut self, ir: &mut IrEmitter) -> Result<bool, PassError> {
        let mut changed = false;

        let view = ir.view();
        let mut uses = vec![0u32; view.ssa_count() as usize];
        let code: Vec<NodeId> = view.all_code().collect();
        for &id in &code {
            for arg in view.op(id).args().iter() {
                uses[arg.index()] += 1;
            }
        }

        let mut worklist: Vec<NodeId> = code
            .iter()
            .copied()
            .filter(|&id| {
                let op = view.op(id);
                op.has_dest() && !op.has_side_effects() && uses[id.index()] == 0
            })
            .collect();

        while let Some(id) = worklist.pop() {
            if ir.view().is_dead(id) {
                continue;
            }
            let args = ir.view().op(id).args();
            ir.remove(id);
            changed = true;

            for arg in args.iter() {
                uses[arg.index()] -= 1;
                if uses[arg.index()] == 0 {
                    let op = ir.view().op(arg);
                    if op.has_dest() && !op.has_side_effects() && !ir.view().is_dead(arg) {
                        worklist.push(arg);
                    }
                }
            }
        }

        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::RegClass;

    #[test]
    fn removes_dead_chains_but_keeps_stores() {
        let mut ir = IrEmitter::new();
        ir.allocate_header(0);
        ir.create_code_block();
        let a = ir.constant(1);
        let b = ir.constant(2);
        let dead_sum = ir.add(8, a, b);
        let live = ir.constant(3);
        ir.store_context(RegClass::Gpr, 8, 0x10, live);
        ir.exit_function();

        assert!(DeadCodeElim.run(&mut ir).unwrap());
        let view = ir.view();
        assert!(view.is_dead(dead_sum));
        assert!(view.is_dead(a));
        assert!(view.is_dead(b));
        assert!(!view.is_dead(live));
        // Second run is a fixpoint.
        assert!(!DeadCodeElim.run(&mut ir).unwrap());
    }
}
