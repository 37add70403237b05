//! Constant folding and pooling.

use std::collections::HashMap;

use crate::ir::{IrEmitter, IrOp, NodeId};
use crate::passes::{Pass, PassError};

/// Folds ALU ops over two constants in place and, unless the backend will
/// inline immediates anyway, pools duplicate constants within a block so a
/// value is defined once.
#[derive(Debug)]
pub struct ConstProp {
    inline_constants: bool,
}

impl ConstProp {
    /// `inline_constants` mirrors the backend's ability to encode
    /// immediates directly; when set, pooling is skipped.
    pub fn new(inline_constants: bool) -> Self {
        Self { inline_constants }
    }

    fn fold(op: &IrOp, size: u8, lhs: u64, rhs: u64) -> Option<u64> {
        let value = match op {
            IrOp::Add { .. } => lhs.wrapping_add(rhs),
            IrOp::Sub { .. } => lhs.wrapping_sub(rhs),
            IrOp::And { .. } => lhs & rhs,
            IrOp::Or { .. } => lhs | rhs,
            IrOp::Xor { .. } => lhs ^ rhs,
            _ => return None,
        };
        Some(if size >= 8 {
            value
        } else {
            value & ((1u64 << (u32::from(size) * 8)) - 1)
        })
    }
}

impl Pass for ConstProp {
    fn name(&self) -> &'static str {
        "ConstProp"
    }

    fn run(&mut self, ir: &mut IrEmitter) -> Result<bool, PassError> {
        let mut changed = false;

        // Folding: rewrite the op into the constant it computes.
        let code: Vec<NodeId> = ir.view().all_code().collect();
        for id in code {
            if ir.view().is_dead(id) {
                continue;
            }
            let op = *ir.view().op(id);
            let args = op.args();
            let &[lhs, rhs] = args.as_slice() else { continue };
            let (IrOp::Constant { value: a }, IrOp::Constant { value: b }) =
                (*ir.view().op(lhs), *ir.view().op(rhs))
            else {
                continue;
            };
            let size = ir.view().node(id).size;
            if let Some(value) = Self::fold(&op, size, a, b) {
                *ir.op_mut(id) = IrOp::Constant { value };
                changed = true;
            }
        }

        if self.inline_constants {
            return Ok(changed);
        }

        // Pooling, per block to preserve dominance.
        let blocks: Vec<NodeId> = ir.view().blocks().collect();
        for block in blocks {
            let mut pool: HashMap<u64, NodeId> = HashMap::new();
            let code: Vec<NodeId> = ir.view().code(block).collect();
            for id in code {
                if ir.view().is_dead(id) {
                    continue;
                }
                let IrOp::Constant { value } = *ir.view().op(id) else {
                    continue;
                };
                match pool.get(&value) {
                    Some(&first) => {
                        ir.replace_all_uses_with(id, first);
                        changed = true;
                    }
                    None => {
                        pool.insert(value, id);
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
    fn folds_constant_alu_chains() {
        let mut ir = IrEmitter::new();
        ir.allocate_header(0);
        ir.create_code_block();
        let a = ir.constant(40);
        let b = ir.constant(2);
        let sum = ir.add(8, a, b);
        ir.store_context(RegClass::Gpr, 8, 0x10, sum);
        ir.exit_function();

        assert!(ConstProp::new(false).run(&mut ir).unwrap());
        assert_eq!(*ir.view().op(sum), IrOp::Constant { value: 42 });
    }

    #[test]
    fn narrow_fold_masks_to_operand_size() {
        let mut ir = IrEmitter::new();
        ir.allocate_header(0);
        ir.create_code_block();
        let a = ir.constant(0xFF);
        let b = ir.constant(0x01);
        let sum = ir.add(1, a, b);
        ir.store_context(RegClass::Gpr, 1, 0x10, sum);
        ir.exit_function();

        ConstProp::new(false).run(&mut ir).unwrap();
        assert_eq!(*ir.view().op(sum), IrOp::Constant { value: 0 });
    }

    #[test]
    fn pools_duplicate_constants_unless_inlining() {
        let mut ir = IrEmitter::new();
        ir.allocate_header(0);
        ir.create_code_block();
        let a = ir.constant(7);
        let b = ir.constant(7);
        let sink = ir.store_context(RegClass::Gpr, 8, 0x10, b);
        ir.exit_function();

        assert!(ConstProp::new(false).run(&mut ir).unwrap());
        assert_eq!(ir.view().op(sink).args().as_slice(), &[a]);

        let mut ir2 = IrEmitter::new();
        ir2.allocate_header(0);
        ir2.create_code_block();
        let _ = ir2.constant(7);
        let b2 = ir2.constant(7);
        let sink2 = ir2.store_context(RegClass::Gpr, 8, 0x10, b2);
        ir2.exit_function();

        assert!(!ConstProp::new(true).run(&mut ir2).unwrap());
        assert_eq!(ir2.view().op(sink2).args().as_slice(), &[b2]);
    }
}
