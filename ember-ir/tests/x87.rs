use ember_ir::ir::{IrEmitter, IrOp, RegClass};
use ember_ir::passes::{DeadCodeElim, LowerX87, Pass, ReplaceX87};
use ember_ir::{Config, PassManager};

/// `AdjustTop(+1); StackStore(0, v1); StackLoad(0)` collapses to direct use
/// of `v1` with a single trailing top adjustment.
#[test]
fn transient_stack_traffic_collapses() {
    let mut ir = IrEmitter::new();
    ir.allocate_header(0);
    ir.create_code_block();
    let v1 = ir.load_context(16, 0x100, RegClass::Fpr);
    ir.x87_adjust_top(1);
    ir.x87_stack_store(0, v1);
    let load = ir.x87_stack_load(0);
    let consumer = ir.store_context(RegClass::Fpr, 16, 0x200, load);
    ir.exit_function();

    let mut pass = ReplaceX87::new(true, false);
    assert!(pass.run(&mut ir).unwrap());
    // The forwarded load is dead now.
    DeadCodeElim.run(&mut ir).unwrap();

    let view = ir.view();
    assert_eq!(view.op(consumer).args().as_slice(), &[v1]);

    let names: Vec<_> = view.all_code().map(|id| view.op(id).name()).collect();
    assert!(!names.contains(&"X87StackStore"));
    assert!(!names.contains(&"X87StackLoad"));
    assert_eq!(
        names.iter().filter(|n| **n == "X87AdjustTop").count(),
        1,
        "exactly one folded top adjustment survives"
    );
}

/// The surviving abstract adjustment lowers to TOP arithmetic over the
/// context, leaving no abstract stack ops for the backend.
#[test]
fn peephole_then_lowering_leaves_only_context_ops() {
    let mut ir = IrEmitter::new();
    ir.allocate_header(0);
    ir.create_code_block();
    let v1 = ir.load_context(16, 0x100, RegClass::Fpr);
    ir.x87_adjust_top(1);
    ir.x87_stack_store(0, v1);
    let load = ir.x87_stack_load(0);
    ir.store_context(RegClass::Fpr, 16, 0x200, load);
    ir.exit_function();

    ReplaceX87::new(true, false).run(&mut ir).unwrap();
    LowerX87::default().run(&mut ir).unwrap();
    DeadCodeElim.run(&mut ir).unwrap();

    let view = ir.view();
    for id in view.all_code() {
        assert!(
            !matches!(
                view.op(id),
                IrOp::X87GetTop
                    | IrOp::X87SetTop { .. }
                    | IrOp::X87AdjustTop { .. }
                    | IrOp::X87StackLoad { .. }
                    | IrOp::X87StackStore { .. }
            ),
            "abstract x87 op {id} survived lowering"
        );
    }
}

/// Without the unsafe peephole the stack ops still lower, indexed off the
/// real TOP value.
#[test]
fn default_pipeline_lowers_stack_ops_without_peephole() {
    let mut ir = IrEmitter::new();
    ir.allocate_header(0);
    ir.create_code_block();
    let a = ir.x87_stack_load(0);
    let b = ir.x87_stack_load(1);
    let sum = ir.f80_add(a, b);
    ir.x87_stack_store(0, sum);
    ir.exit_function();

    let config = Config::default();
    let mut manager = PassManager::new();
    manager.add_default_passes(&config, false, false);
    manager.add_default_validation_passes();
    manager.run(&mut ir).unwrap();

    let view = ir.view();
    let names: Vec<_> = view.all_code().map(|id| view.op(id).name()).collect();
    assert!(names.contains(&"LoadContextIndexed"));
    assert!(names.contains(&"StoreContextIndexed"));
    assert!(names.contains(&"F80Add"), "F80Add is untouched without the unsafe pass");
    assert!(!names.contains(&"X87StackLoad"));
    assert!(!names.contains(&"X87StackStore"));
}
