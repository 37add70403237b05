//! Context load/store forwarding.

use std::collections::HashMap;

use crate::ir::{IrEmitter, IrOp, NodeId, RegClass};
use crate::passes::{Pass, PassError};

/// Forwards known context values to later loads within a block: a load
/// after a store to the same slot reads the stored value, and a repeated
/// load reuses the first. Indexed accesses and syscalls clobber all
/// tracking.
#[derive(Debug, Default)]
pub struct ContextLoadStoreElim;

#[derive(Clone, Copy)]
struct KnownValue {
    value: NodeId,
    size: u8,
    class: RegClass,
}

fn ranges_overlap(a_off: u32, a_size: u8, b_off: u32, b_size: u8) -> bool {
    a_off < b_off + u32::from(b_size) && b_off < a_off + u32::from(a_size)
}

impl Pass for ContextLoadStoreElim {
    fn name(&self) -> &'static str {
        "ContextLoadStoreElimination"
    }

    fn run(&mut self, ir: &mut IrEmitter) -> Result<bool, PassError> {
        let mut changed = false;

        let blocks: Vec<NodeId> = ir.view().blocks().collect();
        for block in blocks {
            let mut known: HashMap<u32, KnownValue> = HashMap::new();
            let code: Vec<NodeId> = ir.view().code(block).collect();

            for id in code {
                if ir.view().is_dead(id) {
                    continue;
                }
                match *ir.view().op(id) {
                    IrOp::StoreContext { value, offset, class } => {
                        let size = ir.view().node(id).size;
                        known.retain(|&o, k| !ranges_overlap(o, k.size, offset, size));
                        known.insert(offset, KnownValue { value, size, class });
                    }
                    IrOp::LoadContext { offset, class } => {
                        let size = ir.view().node(id).size;
                        match known.get(&offset) {
                            Some(k) if k.size == size && k.class == class => {
                                ir.replace_all_uses_with(id, k.value);
                                ir.remove(id);
                                changed = true;
                            }
                            _ => {
                                // Remember the loaded value for reuse.
                                known.retain(|&o, k| !ranges_overlap(o, k.size, offset, size));
                                known.insert(offset, KnownValue { value: id, size, class });
                            }
                        }
                    }
                    IrOp::LoadContextIndexed { .. }
                    | IrOp::StoreContextIndexed { .. }
                    | IrOp::Syscall { .. } => known.clear(),
                    _ => {}
                }
            }
        }

        Ok(changed)
    }
}
