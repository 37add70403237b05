//! IR compaction.

use crate::ir::{IrEmitter, IrOp, Node, NodeId};
use crate::passes::{Pass, PassError};

/// Rebuilds the arena with dense, monotonic indices in program order:
/// header, then each block followed by its code. Tombstoned slots are
/// dropped. The vector-keyed register allocator depends on this running
/// first; renumbering after allocation would detach the backend's
/// SSA-index-to-register mapping.
#[derive(Debug, Default)]
pub struct Compaction;

impl Pass for Compaction {
    fn name(&self) -> &'static str {
        "IRCompaction"
    }

    fn run(&mut self, ir: &mut IrEmitter) -> Result<bool, PassError> {
        Ok(compact(ir))
    }
}

/// Compact `ir` in place; infallible, also driven directly by the register
/// allocator between iterations.
pub(crate) fn compact(ir: &mut IrEmitter) -> bool {
    let view = ir.view();
    let old_count = view.ssa_count() as usize;

    // Pass 1: assign new ids in program order.
    let mut remap: Vec<Option<NodeId>> = vec![None; old_count];
    let mut order: Vec<NodeId> = Vec::with_capacity(old_count);

    let header = view.header_id();
    remap[header.index()] = Some(NodeId(0));
    order.push(header);

    for block in view.blocks() {
        remap[block.index()] = Some(NodeId(order.len() as u32));
        order.push(block);
        for id in view.code(block) {
            remap[id.index()] = Some(NodeId(order.len() as u32));
            order.push(id);
        }
    }

    let changed = order.len() != old_count
        || order
            .iter()
            .enumerate()
            .any(|(new, old)| new != old.index());

    // Pass 2: rebuild nodes with rewritten links and references.
    let map = |id: NodeId| remap[id.index()].expect("reachable node missed in pass 1");
    let mut nodes: Vec<Node> = Vec::with_capacity(order.len());
    let mut last_block = None;

    for (new_index, &old_id) in order.iter().enumerate() {
        let mut node = *view.node(old_id);
        node.prev = (new_index > 0).then(|| NodeId(new_index as u32 - 1));
        node.next = (new_index + 1 < order.len()).then(|| NodeId(new_index as u32 + 1));

        match &mut node.op {
            IrOp::IrHeader { blocks, .. } => {
                *blocks = blocks.map(map);
            }
            IrOp::CodeBlock { begin, last, next } => {
                *begin = begin.map(map);
                *last = last.map(map);
                *next = next.map(map);
                last_block = Some(NodeId(new_index as u32));
            }
            op => {
                op.for_each_arg_mut(|arg| *arg = map(*arg));
                op.for_each_block_ref_mut(|target| *target = map(*target));
            }
        }
        nodes.push(node);
    }

    ir.replace_storage(nodes, NodeId(0), last_block);
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::RegClass;
    use crate::passes::DeadCodeElim;

    #[test]
    fn indices_are_dense_after_removals() {
        let mut ir = IrEmitter::new();
        ir.allocate_header(0);
        let block = ir.create_code_block();
        let dead = ir.constant(1);
        let live = ir.constant(2);
        ir.store_context(RegClass::Gpr, 8, 0x10, live);
        ir.exit_function();
        let _ = dead;
        let _ = block;

        DeadCodeElim.run(&mut ir).unwrap();
        assert!(Compaction.run(&mut ir).unwrap());

        let view = ir.view();
        // Dense: ids are exactly 0..ssa_count, in chain order.
        let mut expected = 0u32;
        let mut cur = Some(view.header_id());
        while let Some(id) = cur {
            assert_eq!(id.raw(), expected);
            expected += 1;
            cur = view.next_of(id);
        }
        assert_eq!(expected, view.ssa_count());

        // Arguments still reference the right payloads.
        let store = view
            .all_code()
            .find(|&id| matches!(view.op(id), IrOp::StoreContext { .. }))
            .unwrap();
        let arg = view.op(store).args().as_slice()[0];
        assert_eq!(*view.op(arg), IrOp::Constant { value: 2 });
    }

    #[test]
    fn compaction_of_compact_ir_reports_no_change() {
        let mut ir = IrEmitter::new();
        ir.allocate_header(0);
        ir.create_code_block();
        let v = ir.constant(1);
        ir.store_context(RegClass::Gpr, 8, 0x10, v);
        ir.exit_function();

        assert!(!Compaction.run(&mut ir).unwrap());
    }
}
