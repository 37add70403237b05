use ember_ir::ir::{IrEmitter, RegClass};
use ember_ir::{Config, IrBuilder, PassManager};
use ember_x86::Decoder;
use rstest::rstest;

fn translate(code: &[u8], config: &Config) -> IrEmitter {
    let mut decoder = Decoder::new(config.decode_options());
    let block = decoder.decode_block(code, 0x40_0000).unwrap();
    IrBuilder::new().translate(&block).unwrap()
}

fn manager(config: &Config) -> PassManager {
    let mut manager = PassManager::new();
    manager.add_default_passes(config, false, false);
    manager.add_default_validation_passes();
    manager.insert_register_allocation_pass(false);
    let ra = manager.ra_pass_mut().unwrap();
    ra.add_registers(RegClass::Gpr, 16);
    ra.add_registers(RegClass::Fpr, 16);
    manager
}

#[test]
fn straight_line_function_compiles_to_allocated_ir() {
    // mov rax, rbx ; add rax, rcx ; ret
    let config = Config::default();
    let mut ir = translate(&[0x48, 0x89, 0xD8, 0x48, 0x01, 0xC8, 0xC3], &config);
    let mut pm = manager(&config);

    assert!(pm.run(&mut ir).unwrap());
    let ra = pm.ra_pass().unwrap();
    assert!(ra.had_full_ra());
    assert_eq!(ra.spill_slot_count(), 0);

    // Backend contract: dense indices, a register for every value, nothing
    // virtual.
    let view = ir.view();
    let data = ra.allocation_data().unwrap();
    let mut ids = Vec::new();
    for id in view.all_code() {
        ids.push(id.raw());
        let op = view.op(id);
        for arg in op.args().iter() {
            assert!(arg.raw() < id.raw(), "{id} uses a later definition {arg}");
        }
        if op.has_dest() {
            let (class, reg) = data.unpack(id);
            assert!(class.is_some());
            assert!(reg < 16);
        }
    }
    assert!(ids.windows(2).all(|w| w[0] < w[1]), "code indices not monotonic");
}

#[test]
fn multiblock_branch_compiles_with_allocation_across_blocks() {
    // jne +2 ; ud2 ; mov eax, ebx ; ret, with multiblock decoding.
    let config = Config { multiblock: true, ..Config::default() };
    let mut ir = translate(&[0x75, 0x02, 0x0F, 0x0B, 0x89, 0xD8, 0xC3], &config);
    let mut pm = manager(&config);

    pm.run(&mut ir).unwrap();
    let ra = pm.ra_pass().unwrap();
    assert!(ra.had_full_ra());

    let view = ir.view();
    assert!(view.blocks().count() >= 3);
}

#[test]
fn redundant_guest_moves_collapse_before_allocation() {
    // mov rax, rbx ; mov rcx, rax — the second load of rax forwards from
    // the first store, so a single context load feeds both stores.
    let config = Config::default();
    let mut ir = translate(&[0x48, 0x89, 0xD8, 0x48, 0x89, 0xC1, 0xC3], &config);
    let mut pm = manager(&config);
    pm.run(&mut ir).unwrap();

    let view = ir.view();
    let loads = view
        .all_code()
        .filter(|&id| view.op(id).name() == "LoadContext")
        .count();
    assert_eq!(loads, 1, "context forwarding should leave one load");
}

#[test]
fn interpreter_only_units_skip_allocation() {
    // cpuid is outside the builder subset; the unit is flagged for the
    // interpreter and the allocator must not touch it.
    let config = Config::default();
    let mut ir = translate(&[0x0F, 0xA2], &config);
    let mut pm = manager(&config);
    pm.run(&mut ir).unwrap();

    assert!(ir.view().should_interpret());
    let ra = pm.ra_pass().unwrap();
    assert!(ra.allocation_data().is_none());
}

#[test]
fn syscall_exit_keeps_only_needed_argument_loads() {
    // mov rax, 60 ; mov rdi, 0 ; syscall ; ret
    let code = [
        0x48, 0xC7, 0xC0, 0x3C, 0x00, 0x00, 0x00, // mov rax, 60
        0x48, 0xC7, 0xC7, 0x00, 0x00, 0x00, 0x00, // mov rdi, 0
        0x0F, 0x05, // syscall
        0xC3, // ret
    ];
    let config = Config::default();
    let mut ir = translate(&code, &config);
    let mut pm = manager(&config);
    pm.run(&mut ir).unwrap();

    // Context forwarding feeds rax and rdi straight from their immediates
    // and the squashed trailing argument loads fall to DCE, so no context
    // load survives at all.
    let view = ir.view();
    let loads = view
        .all_code()
        .filter(|&id| view.op(id).name() == "LoadContext")
        .count();
    assert_eq!(loads, 0);

    let ra = pm.ra_pass().unwrap();
    assert!(ra.had_full_ra());
}

#[rstest]
#[case::reg_moves(&[0x48, 0x89, 0xD8, 0x48, 0x89, 0xC1, 0x48, 0x89, 0xCA, 0xC3])]
#[case::alu_mix(&[0x48, 0x31, 0xC0, 0x48, 0x01, 0xD8, 0x48, 0x29, 0xC8, 0xC3])]
#[case::imm_forms(&[0xB8, 0x2A, 0x00, 0x00, 0x00, 0x48, 0x83, 0xC0, 0x01, 0xC3])]
#[case::x87_stack(&[0xD9, 0xC1, 0xD8, 0xC1, 0xDD, 0xD8, 0xC3])]
fn covered_programs_reach_full_allocation(#[case] code: &[u8]) {
    let config = Config::default();
    let mut ir = translate(code, &config);
    let mut pm = manager(&config);
    pm.run(&mut ir).unwrap();

    assert!(!ir.view().should_interpret());
    assert!(pm.ra_pass().unwrap().had_full_ra());
}

mod props {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        // The pipeline is total over arbitrary byte streams: whatever the
        // decoder accepts either lowers and allocates or is flagged for the
        // interpreter; nothing panics and no virtual register escapes.
        #[test]
        fn pipeline_is_total_over_random_streams(
            bytes in proptest::collection::vec(any::<u8>(), 1..48),
        ) {
            let config = Config::default();
            let mut decoder = Decoder::new(config.decode_options());
            let Ok(block) = decoder.decode_block(&bytes, 0x1000) else {
                return Ok(());
            };
            let Ok(mut ir) = IrBuilder::new().translate(&block) else {
                return Ok(());
            };
            let mut pm = manager(&config);
            if pm.run(&mut ir).is_err() {
                return Ok(());
            }

            let view = ir.view();
            if let Some(data) = pm.ra_pass().unwrap().allocation_data() {
                for id in view.all_code() {
                    if view.op(id).has_dest() {
                        let (_, reg) = data.unpack(id);
                        prop_assert!(reg < 16);
                    }
                }
            }
        }
    }
}

#[test]
fn disabled_passes_still_lower_and_allocate() {
    let config = Config { disable_passes: true, ..Config::default() };
    let mut ir = translate(&[0x48, 0x89, 0xD8, 0xC3], &config);
    let mut pm = manager(&config);
    pm.run(&mut ir).unwrap();

    let ra = pm.ra_pass().unwrap();
    assert!(ra.had_full_ra());
}
