//! Textual IR dump, optionally annotated with register assignments.

use core::fmt::{self, Write};

use crate::ir::{IrOp, IrView, RegClass};
use crate::regalloc::AllocationData;

/// Write a dump of `view` into `out`.
pub fn dump(
    out: &mut impl Write,
    view: &IrView<'_>,
    ra: Option<&AllocationData>,
) -> fmt::Result {
    writeln!(out, "IRHeader entry={:#x} ssa={}", view.entry(), view.ssa_count())?;
    for block in view.blocks() {
        writeln!(out, "{block} = CodeBlock")?;
        for id in view.code(block) {
            let node = view.node(id);
            write!(out, "  ")?;
            if node.op.has_dest() {
                write!(out, "{id} = ")?;
            }
            write!(out, "{} i{}", node.op.name(), u32::from(node.size) * 8)?;
            write_payload(out, &node.op)?;
            for arg in node.op.args().iter() {
                write!(out, " {arg}")?;
            }
            if let (Some(ra), true) = (ra, node.op.has_dest()) {
                let (class, reg) = ra.unpack(id);
                let class = match class {
                    Some(RegClass::Gpr) => "GPR",
                    Some(RegClass::Fpr) => "FPR",
                    None => "?",
                };
                write!(out, " ({class} r{reg})")?;
            }
            writeln!(out)?;
        }
    }
    Ok(())
}

fn write_payload(out: &mut impl Write, op: &IrOp) -> fmt::Result {
    match op {
        IrOp::Constant { value } => write!(out, " {value:#x}"),
        IrOp::LoadContext { offset, .. } | IrOp::StoreContext { offset, .. } => {
            write!(out, " ctx+{offset:#x}")
        }
        IrOp::LoadContextIndexed { offset, stride, .. }
        | IrOp::StoreContextIndexed { offset, stride, .. } => {
            write!(out, " ctx+{offset:#x}*{stride}")
        }
        IrOp::X87AdjustTop { offset } => write!(out, " {offset:+}"),
        IrOp::X87StackLoad { offset } | IrOp::X87StackStore { offset, .. } => {
            write!(out, " st{offset:+}")
        }
        IrOp::SpillRegister { slot, .. } | IrOp::FillRegister { slot, .. } => {
            write!(out, " slot{slot}")
        }
        IrOp::Jump { target } => write!(out, " -> {target}"),
        IrOp::CondJump { true_target, false_target, .. } => {
            write!(out, " -> {true_target} / {false_target}")
        }
        _ => Ok(()),
    }
}

/// Dump to a fresh string; diagnostics helper.
pub fn dump_to_string(view: &IrView<'_>, ra: Option<&AllocationData>) -> String {
    let mut out = String::new();
    // Writing into a String cannot fail.
    let _ = dump(&mut out, view, ra);
    out
}
