//! Dead context-store elimination.

use std::collections::HashMap;

use crate::ir::{IrEmitter, IrOp, NodeId};
use crate::passes::{Pass, PassError};

/// Removes a context store that is overwritten by a later store to the same
/// slot within the block before anything could observe it. Indexed context
/// accesses and syscalls observe arbitrary context and act as barriers.
#[derive(Debug, Default)]
pub struct DeadStoreElim;

fn ranges_overlap(a_off: u32, a_size: u8, b_off: u32, b_size: u8) -> bool {
    a_off < b_off + u32::from(b_size) && b_off < a_off + u32::from(a_size)
}

impl Pass for DeadStoreElim {
    fn name(&self) -> &'static str {
        "DeadStoreElimination"
    }

    fn run(&mut self, ir: &mut IrEmitter) -> Result<bool, PassError> {
        let mut changed = false;

        let blocks: Vec<NodeId> = ir.view().blocks().collect();
        for block in blocks {
            // offset -> (store node, size) of the youngest unobserved store.
            let mut pending: HashMap<u32, (NodeId, u8)> = HashMap::new();
            let code: Vec<NodeId> = ir.view().code(block).collect();

            for id in code {
                if ir.view().is_dead(id) {
                    continue;
                }
                match *ir.view().op(id) {
                    IrOp::StoreContext { offset, .. } => {
                        let size = ir.view().node(id).size;
                        if let Some(&(old, old_size)) = pending.get(&offset) {
                            if old_size == size {
                                ir.remove(old);
                                changed = true;
                            }
                        }
                        // A partially overlapping older store can still be
                        // observed; drop its tracking conservatively.
                        pending.retain(|&o, &mut (_, s)| !ranges_overlap(o, s, offset, size));
                        pending.insert(offset, (id, size));
                    }
                    IrOp::LoadContext { offset, .. } => {
                        let size = ir.view().node(id).size;
                        pending.retain(|&o, &mut (_, s)| !ranges_overlap(o, s, offset, size));
                    }
                    IrOp::LoadContextIndexed { .. }
                    | IrOp::StoreContextIndexed { .. }
                    | IrOp::Syscall { .. }
                    | IrOp::ExitFunction
                    | IrOp::Jump { .. }
                    | IrOp::CondJump { .. } => pending.clear(),
                    _ => {}
                }
            }
        }

        Ok(changed)
    }
}
