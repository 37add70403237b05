//! Lowering of abstract x87 stack ops into concrete context accesses.

use crate::cpu;
use crate::ir::{IrEmitter, IrOp, NodeId, RegClass};
use crate::passes::{Pass, PassError};

/// Replaces `X87GetTop`/`X87SetTop`/`X87AdjustTop` and the stack load/store
/// ops with TOP-pointer arithmetic over the guest context. Not an
/// optimization; always runs.
#[derive(Debug, Default)]
pub struct LowerX87;

impl LowerX87 {
    /// `(top + offset) & 7`, or `top` itself for a zero offset.
    fn stack_index(ir: &mut IrEmitter, top: NodeId, offset: i32) -> NodeId {
        if offset == 0 {
            return top;
        }
        let mask = ir.constant(7);
        let amount = ir.constant(offset.unsigned_abs() as u64);
        let sum = if offset >= 0 {
            ir.add(1, top, amount)
        } else {
            ir.sub(1, top, amount)
        };
        ir.and(1, sum, mask)
    }
}

impl Pass for LowerX87 {
    fn name(&self) -> &'static str {
        "LowerX87"
    }

    fn run(&mut self, ir: &mut IrEmitter) -> Result<bool, PassError> {
        let mut changed = false;
        let original_cursor = ir.write_cursor();
        let code: Vec<NodeId> = ir.view().all_code().collect();

        for id in code {
            if ir.view().is_dead(id) {
                continue;
            }
            match *ir.view().op(id) {
                IrOp::X87GetTop => {
                    ir.set_write_cursor(Some(id));
                    let top = ir.load_context(1, cpu::x87_top_offset(), RegClass::Gpr);
                    ir.replace_all_uses_with(id, top);
                    changed = true;
                }
                IrOp::X87SetTop { top } => {
                    ir.set_write_cursor(Some(id));
                    ir.store_context(RegClass::Gpr, 1, cpu::x87_top_offset(), top);
                    ir.remove(id);
                    changed = true;
                }
                IrOp::X87AdjustTop { offset } => {
                    ir.set_write_cursor(Some(id));
                    let top = ir.load_context(1, cpu::x87_top_offset(), RegClass::Gpr);
                    let new_top = Self::stack_index(ir, top, offset);
                    ir.store_context(RegClass::Gpr, 1, cpu::x87_top_offset(), new_top);
                    ir.remove(id);
                    changed = true;
                }
                IrOp::X87StackLoad { offset } => {
                    ir.set_write_cursor(Some(id));
                    let top = ir.load_context(1, cpu::x87_top_offset(), RegClass::Gpr);
                    let index = Self::stack_index(ir, top, offset);
                    let result = ir.load_context_indexed(
                        index,
                        16,
                        cpu::mm_base_offset(),
                        16,
                        RegClass::Fpr,
                    );
                    ir.replace_all_uses_with(id, result);
                    changed = true;
                }
                IrOp::X87StackStore { offset, value } => {
                    ir.set_write_cursor(Some(id));
                    let top = ir.load_context(1, cpu::x87_top_offset(), RegClass::Gpr);
                    let index = Self::stack_index(ir, top, offset);
                    ir.store_context_indexed(
                        value,
                        index,
                        16,
                        cpu::mm_base_offset(),
                        16,
                        RegClass::Fpr,
                    );
                    ir.remove(id);
                    changed = true;
                }
                _ => {}
            }
        }

        ir.set_write_cursor(original_cursor);
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn program_with(ops: impl FnOnce(&mut IrEmitter)) -> IrEmitter {
        let mut ir = IrEmitter::new();
        ir.allocate_header(0);
        ir.create_code_block();
        ops(&mut ir);
        ir
    }

    #[test]
    fn adjust_top_lowers_to_masked_arithmetic() {
        let mut ir = program_with(|ir| {
            ir.x87_adjust_top(-1);
            ir.exit_function();
        });
        let changed = LowerX87.run(&mut ir).unwrap();
        assert!(changed);

        let view = ir.view();
        let names: Vec<_> = view.all_code().map(|id| view.op(id).name()).collect();
        assert_eq!(
            names,
            ["LoadContext", "Constant", "Constant", "Sub", "And", "StoreContext", "ExitFunction"]
        );
    }

    #[test]
    fn stack_load_at_top_skips_index_math() {
        let mut ir = program_with(|ir| {
            let v = ir.x87_stack_load(0);
            ir.store_context(RegClass::Fpr, 16, 0x200, v);
            ir.exit_function();
        });
        LowerX87.run(&mut ir).unwrap();

        let view = ir.view();
        let names: Vec<_> = view.all_code().map(|id| view.op(id).name()).collect();
        // Old stack load remains for DCE; uses moved to the indexed load.
        assert_eq!(
            names,
            ["X87StackLoad", "LoadContext", "LoadContextIndexed", "StoreContext", "ExitFunction"]
        );
        let store_args: Vec<_> = view
            .all_code()
            .filter(|&id| matches!(view.op(id), IrOp::StoreContext { .. }))
            .flat_map(|id| view.op(id).args().iter().collect::<Vec<_>>())
            .collect();
        assert!(matches!(
            view.op(store_args[0]),
            IrOp::LoadContextIndexed { .. }
        ));
    }
}
