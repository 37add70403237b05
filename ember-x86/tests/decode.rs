use ember_x86::{
    DecodeError, DecodeFlags, DecodeOptions, DecodedBlock, Decoder, Operand, OperandSize, Reg,
};
use rstest::rstest;

fn block_decoder(multiblock: bool) -> Decoder {
    Decoder::new(DecodeOptions {
        multiblock,
        ..DecodeOptions::default()
    })
}

fn assert_chained(block: &DecodedBlock) {
    let mut pc = block.entry;
    for inst in &block.instructions {
        assert_eq!(inst.pc, pc, "pc chain broken at {pc:#x}");
        pc += u64::from(inst.size);
    }
}

#[test]
fn rex_w_mov_decodes_to_one_instruction() {
    // mov rax, rbx at 0x1000.
    let mut dec = block_decoder(false);
    let block = dec.decode_block(&[0x48, 0x89, 0xD8], 0x1000).unwrap();
    assert_eq!(block.instructions.len(), 1);
    let inst = &block.instructions[0];
    assert_eq!(inst.size, 3);
    assert!(inst
        .flags
        .contains(DecodeFlags::REX_PREFIX | DecodeFlags::REX_WIDENING));
    assert_eq!(inst.dst_size, OperandSize::B64);
    assert_eq!(inst.src_size, OperandSize::B64);
    assert_eq!(inst.dest, Operand::Gpr { reg: Reg::RAX, high_bits: false });
    assert_eq!(inst.src1, Operand::Gpr { reg: Reg::RBX, high_bits: false });
}

#[test]
fn sib_nop_decodes_with_both_structure_flags() {
    let mut dec = block_decoder(false);
    let block = dec
        .decode_block(&[0x0F, 0x1F, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00], 0x2000)
        .unwrap();
    assert_eq!(block.instructions.len(), 1);
    let inst = &block.instructions[0];
    assert_eq!(inst.size, 8);
    assert!(inst
        .flags
        .contains(DecodeFlags::MODRM_PRESENT | DecodeFlags::SIB_PRESENT));
    assert!(matches!(inst.src1, Operand::Sib { offset: 0, .. }));
}

#[test]
fn conditional_forward_branch_covers_trailing_ender() {
    // jne +0x02; ud2; mov eax, ebx; ret
    //
    // The jne target lands past the ud2, so multiblock decoding continues
    // through the trap.
    let code = [
        0x75, 0x02, // jne +2
        0x0F, 0x0B, // ud2
        0x89, 0xD8, // mov eax, ebx
        0xC3, // ret
    ];
    let mut dec = block_decoder(true);
    let block = dec.decode_block(&code, 0x4000).unwrap();
    let names: Vec<_> = block.instructions.iter().map(|i| i.info.name).collect();
    assert_eq!(names, ["jcc", "ud2", "mov", "ret"]);
    assert_chained(&block);
}

#[test]
fn without_multiblock_the_trap_ends_the_block() {
    let code = [0x75, 0x02, 0x0F, 0x0B, 0x89, 0xD8, 0xC3];
    let mut dec = block_decoder(false);
    let block = dec.decode_block(&code, 0x4000).unwrap();
    // Even the conditional branch ends the block when multiblock is off.
    assert_eq!(block.instructions.len(), 1);
    assert_eq!(block.instructions[0].info.name, "jcc");
}

#[test]
fn decoded_bytes_equal_stream_bytes_consumed() {
    // Straight-line run ending in ret.
    let code = [
        0x55, // push rbp
        0x48, 0x89, 0xE5, // mov rbp, rsp
        0xB8, 0x2A, 0x00, 0x00, 0x00, // mov eax, 42
        0x5D, // pop rbp
        0xC3, // ret
    ];
    let mut dec = block_decoder(false);
    let block = dec.decode_block(&code, 0).unwrap();
    assert_eq!(block.byte_len(), code.len());
    assert_chained(&block);
}

#[test]
fn partial_block_is_returned_when_not_breaking_on_failure() {
    let code = [
        0x89, 0xD8, // mov eax, ebx
        0x06, // illegal in 64-bit mode
    ];
    let mut strict = Decoder::new(DecodeOptions {
        break_on_frontend_failure: true,
        ..DecodeOptions::default()
    });
    assert!(strict.decode_block(&code, 0).is_err());

    let mut lenient = Decoder::new(DecodeOptions {
        break_on_frontend_failure: false,
        ..DecodeOptions::default()
    });
    let block = lenient.decode_block(&code, 0).unwrap();
    assert_eq!(block.instructions.len(), 1);
    assert_eq!(block.instructions[0].info.name, "mov");
}

#[test]
fn failure_on_first_instruction_always_propagates() {
    let mut lenient = Decoder::new(DecodeOptions {
        break_on_frontend_failure: false,
        ..DecodeOptions::default()
    });
    let err = lenient.decode_block(&[0x06], 0).unwrap_err();
    assert!(matches!(err, DecodeError::InvalidOpcode { .. }));
}

#[test]
fn max_inst_per_block_caps_the_run() {
    let code = [0x90; 32]; // nops forever
    let mut dec = Decoder::new(DecodeOptions {
        max_inst_per_block: 4,
        ..DecodeOptions::default()
    });
    let block = dec.decode_block(&code, 0).unwrap();
    assert_eq!(block.instructions.len(), 4);
}

#[rstest]
#[case::add_rm8_r8(&[0x00, 0xD8], "add", 2)]
#[case::xor_self(&[0x31, 0xC0], "xor", 2)]
#[case::push_r15(&[0x41, 0x57], "push", 2)]
#[case::lea(&[0x48, 0x8D, 0x45, 0x08], "lea", 4)]
#[case::movzx(&[0x0F, 0xB6, 0xC3], "movzx", 3)]
#[case::setcc(&[0x0F, 0x94, 0xC0], "setcc", 3)]
#[case::syscall(&[0x0F, 0x05], "syscall", 2)]
#[case::rep_movss(&[0xF3, 0x0F, 0x10, 0xC1], "movss", 4)]
#[case::op66_movapd(&[0x66, 0x0F, 0x28, 0xC1], "movapd", 4)]
#[case::shl_cl(&[0xD3, 0xE0], "shl", 2)]
#[case::fadd_st(&[0xD8, 0xC1], "fadd", 2)]
fn single_instruction_mnemonics(
    #[case] bytes: &[u8],
    #[case] name: &str,
    #[case] size: u8,
) {
    let dec = Decoder::default();
    let inst = dec.decode_instruction(bytes, 0x100).unwrap();
    assert_eq!(inst.info.name, name);
    assert_eq!(inst.size, size);
}

#[test]
fn high_byte_registers_without_rex() {
    // mov ah, bl: 88 DC (mod 11, reg=bl, rm=ah)
    let dec = Decoder::default();
    let inst = dec.decode_instruction(&[0x88, 0xDC], 0).unwrap();
    // `ah` is the high byte of rax.
    assert_eq!(inst.dest, Operand::Gpr { reg: Reg::RAX, high_bits: true });
    assert_eq!(inst.src1, Operand::Gpr { reg: Reg::RBX, high_bits: false });
}

mod props {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        // The decoder must never panic, and a decoded block must satisfy the
        // byte-accounting and PC-chaining invariants regardless of input.
        #[test]
        fn block_decode_is_total_and_chained(
            bytes in proptest::collection::vec(any::<u8>(), 0..64),
            multiblock in any::<bool>(),
        ) {
            let mut dec = Decoder::new(DecodeOptions {
                multiblock,
                break_on_frontend_failure: false,
                ..DecodeOptions::default()
            });
            if let Ok(block) = dec.decode_block(&bytes, 0x1000) {
                prop_assert!(block.byte_len() <= bytes.len());
                let mut pc = block.entry;
                for inst in &block.instructions {
                    prop_assert_eq!(inst.pc, pc);
                    prop_assert!(inst.size >= 1);
                    prop_assert!((inst.size as usize) <= ember_x86::MAX_INST_SIZE);
                    pc += u64::from(inst.size);
                }
            }
        }
    }
}
