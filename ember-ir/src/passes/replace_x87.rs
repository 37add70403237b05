//! x87 stack peephole.
//!
//! Tracks the logical TOP displacement through a block, folds `AdjustTop`
//! chains into a single trailing adjustment, forwards stack stores to stack
//! loads through a per-slot table, and lowers `F80Add` onto the vector
//! float unit. Gated by the `unsafe_replace_x87` configuration knob and
//! disabled entirely under multiblock, where the single-block top tracking
//! does not hold.

use crate::ir::{IrEmitter, IrOp, NodeId};
use crate::passes::{Pass, PassError};

/// Per-slot record of the youngest pending stack store.
#[derive(Debug, Clone, Copy)]
struct SlotStore {
    node: NodeId,
    value: NodeId,
    /// A later stack load already consumed this value.
    forwarded: bool,
}

/// The unsafe x87 stack optimizer.
#[derive(Debug)]
pub struct ReplaceX87 {
    enabled: bool,
    multiblock: bool,
}

impl ReplaceX87 {
    /// Pass gated on the `unsafe_replace_x87` and `multiblock` settings.
    pub fn new(enabled: bool, multiblock: bool) -> Self {
        Self { enabled, multiblock }
    }

    /// Unwrap an `F80CvtTo` argument into a double-precision value.
    ///
    /// Returns `None` when the argument is not a conversion this pass can
    /// reason about; the caller must flush and bail.
    fn convert_arg_to_double(ir: &mut IrEmitter, arg: NodeId) -> Option<NodeId> {
        match *ir.view().op(arg) {
            IrOp::F80CvtTo { src } => {
                let size = ir.view().node(arg).size;
                if size == 8 {
                    // Already a double.
                    Some(src)
                } else {
                    debug_assert_eq!(size, 4);
                    Some(ir.float_f_to_f(8, 4, src))
                }
            }
            _ => None,
        }
    }

    /// Remove pending stores whose value every later load already consumed;
    /// the slot traffic was transient and nothing re-reads it within the
    /// block. Runs on every path out of the pass.
    fn retire_forwarded_stores(
        ir: &mut IrEmitter,
        stack_stores: &[Option<SlotStore>; 8],
    ) -> bool {
        let mut changed = false;
        for store in stack_stores.iter().flatten() {
            if store.forwarded && !ir.view().is_dead(store.node) {
                ir.remove(store.node);
                changed = true;
            }
        }
        changed
    }
}

impl Pass for ReplaceX87 {
    fn name(&self) -> &'static str {
        "ReplaceX87"
    }

    fn run(&mut self, ir: &mut IrEmitter) -> Result<bool, PassError> {
        if !self.enabled {
            return Ok(false);
        }
        if self.multiblock {
            // Top tracking is strictly single-block.
            return Ok(false);
        }

        let mut changed = false;
        let original_cursor = ir.write_cursor();

        let mut current_top: i32 = 0;
        // Alive node the trailing top flush is inserted after.
        let mut flush_after: Option<NodeId> = None;
        let mut stack_stores: [Option<SlotStore>; 8] = [None; 8];

        let code: Vec<NodeId> = ir.view().all_code().collect();
        for id in code {
            if ir.view().is_dead(id) {
                continue;
            }
            match *ir.view().op(id) {
                IrOp::X87AdjustTop { offset } => {
                    current_top += offset;
                    // The folded adjustment is re-emitted at the flush point.
                    flush_after = ir.view().prev_of(id);
                    ir.remove(id);
                    changed = true;
                }
                IrOp::X87StackStore { offset, value } => {
                    let slot = (current_top + offset) & 7;
                    if let Some(old) = stack_stores[slot as usize] {
                        // Every load of the old store was already forwarded.
                        if flush_after == Some(old.node) {
                            flush_after = ir.view().prev_of(old.node);
                        }
                        ir.remove(old.node);
                    }
                    if let IrOp::X87StackStore { offset: o, .. } = ir.op_mut(id) {
                        *o = current_top + offset;
                    }
                    changed = true;
                    flush_after = Some(id);
                    stack_stores[slot as usize] =
                        Some(SlotStore { node: id, value, forwarded: false });
                }
                IrOp::X87StackLoad { offset } => {
                    let slot = (current_top + offset) & 7;
                    if let Some(store) = stack_stores[slot as usize].as_mut() {
                        store.forwarded = true;
                        let value = store.value;
                        ir.replace_all_uses_with(id, value);
                    }
                    if let IrOp::X87StackLoad { offset: o } = ir.op_mut(id) {
                        *o = current_top + offset;
                    }
                    changed = true;
                    flush_after = Some(id);
                }
                IrOp::X87GetTop => {
                    if current_top != 0 {
                        // The real TOP is stale here; flush the pending
                        // adjustment and stop reasoning about this block.
                        ir.set_write_cursor(Some(id));
                        ir.x87_adjust_top(current_top);
                        changed |= Self::retire_forwarded_stores(ir, &stack_stores);
                        ir.set_write_cursor(original_cursor);
                        return Ok(changed);
                    }
                }
                IrOp::X87SetTop { .. } => {
                    if current_top != 0 {
                        if let Some(anchor) = flush_after {
                            ir.set_write_cursor(Some(anchor));
                            ir.x87_adjust_top(current_top);
                        }
                    }
                    changed |= Self::retire_forwarded_stores(ir, &stack_stores);
                    ir.set_write_cursor(original_cursor);
                    return Ok(changed);
                }
                IrOp::F80Add { lhs, rhs } => {
                    ir.set_write_cursor(Some(id));
                    let (Some(a), Some(b)) = (
                        Self::convert_arg_to_double(ir, lhs),
                        Self::convert_arg_to_double(ir, rhs),
                    ) else {
                        // Ambiguous operand shape: flush and bail.
                        if current_top != 0 {
                            if let Some(anchor) = flush_after {
                                ir.set_write_cursor(Some(anchor));
                                ir.x87_adjust_top(current_top);
                            }
                        }
                        changed |= Self::retire_forwarded_stores(ir, &stack_stores);
                        ir.set_write_cursor(original_cursor);
                        return Ok(changed);
                    };
                    let sum = ir.vfadd(8, 8, a, b);
                    let wrapped = ir.f80_cvt_to(sum, 8);
                    ir.replace_all_uses_with(id, wrapped);
                    changed = true;
                }
                _ => {}
            }
        }

        if current_top != 0 {
            if let Some(anchor) = flush_after {
                // The top update belongs after the last op that used it.
                ir.set_write_cursor(Some(anchor));
                ir.x87_adjust_top(current_top);
            }
        }

        changed |= Self::retire_forwarded_stores(ir, &stack_stores);

        ir.set_write_cursor(original_cursor);
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::RegClass;

    fn pass() -> ReplaceX87 {
        ReplaceX87::new(true, false)
    }

    #[test]
    fn disabled_pass_reports_no_change() {
        let mut ir = IrEmitter::new();
        ir.allocate_header(0);
        ir.create_code_block();
        ir.x87_adjust_top(1);
        ir.exit_function();
        assert!(!ReplaceX87::new(false, false).run(&mut ir).unwrap());
        assert!(!ReplaceX87::new(true, true).run(&mut ir).unwrap());
    }

    #[test]
    fn store_forwards_to_load_and_folds_adjustments() {
        let mut ir = IrEmitter::new();
        ir.allocate_header(0);
        ir.create_code_block();
        let v1 = ir.load_context(16, 0x100, RegClass::Fpr);
        ir.x87_adjust_top(1);
        ir.x87_stack_store(0, v1);
        let load = ir.x87_stack_load(0);
        let sink = ir.store_context(RegClass::Fpr, 16, 0x200, load);
        ir.exit_function();

        assert!(pass().run(&mut ir).unwrap());
        let view = ir.view();

        // The load's consumer now reads v1 directly.
        assert_eq!(view.op(sink).args().as_slice(), &[v1]);
        // The store was transient and is gone.
        let names: Vec<_> = view.all_code().map(|id| view.op(id).name()).collect();
        assert!(!names.contains(&"X87StackStore"));
        // Exactly one trailing AdjustTop(+1) remains.
        let adjusts: Vec<_> = view
            .all_code()
            .filter(|&id| matches!(view.op(id), IrOp::X87AdjustTop { offset: 1 }))
            .collect();
        assert_eq!(adjusts.len(), 1);
    }

    #[test]
    fn zero_net_adjustment_still_retires_forwarded_stores() {
        // Push, store, read back, pop: the displacement cancels out but the
        // slot traffic is just as transient.
        let mut ir = IrEmitter::new();
        ir.allocate_header(0);
        ir.create_code_block();
        let v1 = ir.load_context(16, 0x100, RegClass::Fpr);
        ir.x87_adjust_top(-1);
        ir.x87_stack_store(0, v1);
        let load = ir.x87_stack_load(0);
        let sink = ir.store_context(RegClass::Fpr, 16, 0x200, load);
        ir.x87_adjust_top(1);
        ir.exit_function();

        assert!(pass().run(&mut ir).unwrap());
        let view = ir.view();

        assert_eq!(view.op(sink).args().as_slice(), &[v1]);
        let names: Vec<_> = view.all_code().map(|id| view.op(id).name()).collect();
        assert!(!names.contains(&"X87StackStore"));
        // Net-zero displacement: no adjustment is re-emitted either.
        assert!(!names.contains(&"X87AdjustTop"));
    }

    #[test]
    fn set_top_with_pending_displacement_flushes_and_bails() {
        let mut ir = IrEmitter::new();
        ir.allocate_header(0);
        ir.create_code_block();
        ir.x87_adjust_top(2);
        let top = ir.constant(3);
        ir.x87_set_top(top);
        ir.exit_function();

        assert!(pass().run(&mut ir).unwrap());
        let view = ir.view();
        let names: Vec<_> = view.all_code().map(|id| view.op(id).name()).collect();
        // The folded +2 was re-materialized before the SetTop.
        assert_eq!(
            names,
            ["X87AdjustTop", "Constant", "X87SetTop", "ExitFunction"]
        );
    }

    #[test]
    fn set_top_bail_still_retires_forwarded_stores() {
        let mut ir = IrEmitter::new();
        ir.allocate_header(0);
        ir.create_code_block();
        let v1 = ir.load_context(16, 0x100, RegClass::Fpr);
        ir.x87_adjust_top(1);
        ir.x87_stack_store(0, v1);
        let load = ir.x87_stack_load(0);
        let sink = ir.store_context(RegClass::Fpr, 16, 0x200, load);
        let top = ir.constant(0);
        ir.x87_set_top(top);
        ir.exit_function();

        assert!(pass().run(&mut ir).unwrap());
        let view = ir.view();

        assert_eq!(view.op(sink).args().as_slice(), &[v1]);
        let names: Vec<_> = view.all_code().map(|id| view.op(id).name()).collect();
        // The forwarded store is retired even though the pass bailed.
        assert!(!names.contains(&"X87StackStore"));
        assert!(names.contains(&"X87SetTop"));
        // The pending +1 was flushed before the bail.
        let adjusts = view
            .all_code()
            .filter(|&id| matches!(view.op(id), IrOp::X87AdjustTop { offset: 1 }))
            .count();
        assert_eq!(adjusts, 1);
    }

    #[test]
    fn ambiguous_f80_operand_bail_still_retires_forwarded_stores() {
        let mut ir = IrEmitter::new();
        ir.allocate_header(0);
        ir.create_code_block();
        let v1 = ir.load_context(16, 0x100, RegClass::Fpr);
        ir.x87_adjust_top(1);
        ir.x87_stack_store(0, v1);
        let load = ir.x87_stack_load(0);
        ir.store_context(RegClass::Fpr, 16, 0x200, load);
        // Operands are raw loads, not F80CvtTo wrappers: ambiguous.
        let raw1 = ir.load_context(16, 0x110, RegClass::Fpr);
        let raw2 = ir.load_context(16, 0x120, RegClass::Fpr);
        let sum = ir.f80_add(raw1, raw2);
        ir.store_context(RegClass::Fpr, 16, 0x210, sum);
        ir.exit_function();

        assert!(pass().run(&mut ir).unwrap());
        let view = ir.view();
        let names: Vec<_> = view.all_code().map(|id| view.op(id).name()).collect();
        assert!(!names.contains(&"X87StackStore"));
        // The ambiguous add is left untouched.
        assert!(names.contains(&"F80Add"));
        assert!(!names.contains(&"VFAdd"));
    }

    #[test]
    fn f80_add_lowers_to_vector_double_math() {
        let mut ir = IrEmitter::new();
        ir.allocate_header(0);
        ir.create_code_block();
        let raw1 = ir.load_context(8, 0x100, RegClass::Fpr);
        let raw2 = ir.load_context(8, 0x110, RegClass::Fpr);
        let a = ir.f80_cvt_to(raw1, 8);
        let b = ir.f80_cvt_to(raw2, 8);
        let sum = ir.f80_add(a, b);
        let sink = ir.store_context(RegClass::Fpr, 16, 0x200, sum);
        ir.exit_function();

        assert!(pass().run(&mut ir).unwrap());
        let view = ir.view();
        let names: Vec<_> = view.all_code().map(|id| view.op(id).name()).collect();
        assert!(names.contains(&"VFAdd"));
        // The store consumes the re-wrapped result.
        let arg = view.op(sink).args().as_slice()[0];
        assert!(matches!(view.op(arg), IrOp::F80CvtTo { .. }));
    }
}
