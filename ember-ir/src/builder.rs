//! Lowering of decoded guest instructions into IR.
//!
//! The builder covers the register-to-register core of the guest ISA plus
//! the x87 register-stack forms and syscalls; that is what the pass
//! pipeline and the register allocator need to see realistic programs.
//! Anything outside the covered subset flags the unit as interpreter-only
//! via the header's `should_interpret` bit and stops lowering — full guest
//! semantics belong to the opcode dispatcher, not this core.

use std::collections::HashMap;

use ember_x86::tables::InstFlags;
use ember_x86::{DecodedBlock, DecodedInstruction, Operand, Reg, TableId};

use crate::cpu;
use crate::ir::{IrEmitter, NodeId, RegClass};

/// Lowering failure; translation of the unit is abandoned.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TranslationError {
    /// The decoded block carried no instructions.
    #[error("decoded block at {entry:#x} is empty")]
    EmptyBlock {
        /// Entry PC of the block.
        entry: u64,
    },
}

/// Guest flag bytes read by conditional branches; byte index inside the
/// context flag array matches the architectural bit position.
const RFLAG_CF_LOC: usize = 0;
const RFLAG_PF_LOC: usize = 2;
const RFLAG_ZF_LOC: usize = 6;
const RFLAG_SF_LOC: usize = 7;
const RFLAG_OF_LOC: usize = 11;

/// Translates decoded blocks into IR programs.
#[derive(Debug, Default)]
pub struct IrBuilder {
    /// Group start PC to code-block node.
    block_map: HashMap<u64, NodeId>,
    /// Synthesized exit blocks keyed by the RIP they store.
    exit_stubs: HashMap<u64, NodeId>,
}

impl IrBuilder {
    /// Fresh builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Lower one decoded block into a complete IR program.
    pub fn translate(&mut self, block: &DecodedBlock) -> Result<IrEmitter, TranslationError> {
        if block.instructions.is_empty() {
            return Err(TranslationError::EmptyBlock { entry: block.entry });
        }

        self.block_map.clear();
        self.exit_stubs.clear();

        let groups = split_basic_blocks(&block.instructions);

        let mut ir = IrEmitter::new();
        ir.allocate_header(block.entry);

        for group in &groups {
            let node = ir.create_code_block();
            self.block_map.insert(group[0].pc, node);
        }

        // Exit stubs for branch edges that leave the decoded range; created
        // up front so the chain stays block-per-block.
        for group in &groups {
            let last = group.last().expect("groups are non-empty");
            if let Some((taken, fallthrough)) = branch_edges(last) {
                // Unconditional branches never use their fallthrough edge.
                let unconditional = last.info.flags.contains(InstFlags::BLOCK_END);
                let edge_buf = [taken, fallthrough];
                let edges = if unconditional { &edge_buf[..1] } else { &edge_buf[..] };
                for &rip in edges {
                    if !self.block_map.contains_key(&rip) && !self.exit_stubs.contains_key(&rip) {
                        let stub = ir.create_code_block();
                        emit_exit(&mut ir, Some(rip));
                        self.exit_stubs.insert(rip, stub);
                    }
                }
            }
        }

        'groups: for group in &groups {
            let node = self.block_map[&group[0].pc];
            ir.set_write_cursor(Some(node));

            let mut terminated = false;
            for inst in group.iter() {
                match self.lower(&mut ir, inst) {
                    Lowered::Ok => {}
                    Lowered::Terminator => terminated = true,
                    Lowered::Unsupported => {
                        tracing::debug!(
                            pc = inst.pc,
                            name = inst.info.name,
                            "unsupported instruction, marking unit interpreter-only"
                        );
                        ir.set_should_interpret(true);
                        emit_exit(&mut ir, Some(inst.pc));
                        break 'groups;
                    }
                }
            }
            if !terminated {
                let last = group.last().expect("groups are non-empty");
                emit_exit(&mut ir, Some(last.pc + u64::from(last.size)));
            }
        }

        Ok(ir)
    }

    fn resolve_target(&self, rip: u64) -> NodeId {
        self.block_map
            .get(&rip)
            .or_else(|| self.exit_stubs.get(&rip))
            .copied()
            .expect("branch edges were scanned up front")
    }

    fn lower(&mut self, ir: &mut IrEmitter, inst: &DecodedInstruction) -> Lowered {
        match inst.info.name {
            "nop" => Lowered::Ok,
            "mov" => self.lower_mov(ir, inst),
            "add" | "sub" | "and" | "or" | "xor" => self.lower_alu(ir, inst),
            "jcc" => self.lower_jcc(ir, inst),
            "jmp" => self.lower_jmp(ir, inst),
            "ret" | "ud2" | "hlt" | "int3" | "int" => {
                emit_exit(ir, None);
                Lowered::Terminator
            }
            "syscall" => self.lower_syscall(ir, inst),
            "fld" | "fadd" | "faddp" | "fstp" => self.lower_x87(ir, inst),
            _ => Lowered::Unsupported,
        }
    }

    fn lower_mov(&mut self, ir: &mut IrEmitter, inst: &DecodedInstruction) -> Lowered {
        let size = inst.dst_size.bytes();
        let Some(value) = load_operand(ir, &inst.src1, size) else {
            return Lowered::Unsupported;
        };
        match store_operand(ir, &inst.dest, size, value) {
            true => Lowered::Ok,
            false => Lowered::Unsupported,
        }
    }

    fn lower_alu(&mut self, ir: &mut IrEmitter, inst: &DecodedInstruction) -> Lowered {
        let size = inst.dst_size.bytes();
        let Some(lhs) = load_operand(ir, &inst.dest, size) else {
            return Lowered::Unsupported;
        };
        let Some(rhs) = load_operand(ir, &inst.src1, size) else {
            return Lowered::Unsupported;
        };
        let result = match inst.info.name {
            "add" => ir.add(size, lhs, rhs),
            "sub" => ir.sub(size, lhs, rhs),
            "and" => ir.and(size, lhs, rhs),
            "or" => ir.or(size, lhs, rhs),
            "xor" => ir.xor(size, lhs, rhs),
            _ => unreachable!("filtered by caller"),
        };
        match store_operand(ir, &inst.dest, size, result) {
            true => Lowered::Ok,
            false => Lowered::Unsupported,
        }
    }

    fn lower_jcc(&mut self, ir: &mut IrEmitter, inst: &DecodedInstruction) -> Lowered {
        let cc = match (inst.table, inst.op) {
            (TableId::Base, op @ 0x70..=0x7F) => (op - 0x70) as u8,
            (TableId::Second, op @ 0x80..=0x8F) => (op - 0x80) as u8,
            _ => return Lowered::Unsupported,
        };
        // Only the single-flag conditions are covered.
        let flag_loc = match cc & !1 {
            0x0 => RFLAG_OF_LOC,
            0x2 => RFLAG_CF_LOC,
            0x4 => RFLAG_ZF_LOC,
            0x8 => RFLAG_SF_LOC,
            0xA => RFLAG_PF_LOC,
            _ => return Lowered::Unsupported,
        };

        let Some((taken, fallthrough)) = branch_edges(inst) else {
            return Lowered::Unsupported;
        };
        let taken_block = self.resolve_target(taken);
        let fallthrough_block = self.resolve_target(fallthrough);

        let cond = ir.load_context(1, cpu::flag_offset(flag_loc), RegClass::Gpr);
        if cc & 1 == 0 {
            ir.cond_jump(cond, taken_block, fallthrough_block);
        } else {
            // Negated condition: branch taken when the flag byte is zero.
            ir.cond_jump(cond, fallthrough_block, taken_block);
        }
        Lowered::Terminator
    }

    fn lower_jmp(&mut self, ir: &mut IrEmitter, inst: &DecodedInstruction) -> Lowered {
        if inst.info.flags.contains(InstFlags::MODRM) {
            // Indirect jump; target unknown.
            return Lowered::Unsupported;
        }
        let Some((taken, _)) = branch_edges(inst) else {
            return Lowered::Unsupported;
        };
        let target = self.resolve_target(taken);
        ir.jump(target);
        Lowered::Terminator
    }

    fn lower_syscall(&mut self, ir: &mut IrEmitter, _inst: &DecodedInstruction) -> Lowered {
        const ARG_REGS: [Reg; 7] =
            [Reg::RAX, Reg::RDI, Reg::RSI, Reg::RDX, Reg::R10, Reg::R8, Reg::R9];
        let mut args = [NodeId(0); 7];
        for (slot, reg) in args.iter_mut().zip(ARG_REGS) {
            *slot = ir.load_context(8, cpu::reg_offset(reg), RegClass::Gpr);
        }
        let result = ir.syscall(&args);
        ir.store_context(RegClass::Gpr, 8, cpu::reg_offset(Reg::RAX), result);
        Lowered::Ok
    }

    fn lower_x87(&mut self, ir: &mut IrEmitter, inst: &DecodedInstruction) -> Lowered {
        if inst.info.flags.contains(InstFlags::MODRM) {
            // Memory forms need the address pipeline; register-stack forms
            // only.
            return Lowered::Unsupported;
        }
        let modrm = inst.modrm.unwrap_or(0);
        let sti = i32::from(modrm & 0b111);
        match inst.info.name {
            "fld" => {
                let value = ir.x87_stack_load(sti);
                ir.x87_adjust_top(-1);
                ir.x87_stack_store(0, value);
            }
            "fadd" => {
                let a = ir.x87_stack_load(0);
                let b = ir.x87_stack_load(sti);
                let sum = ir.f80_add(a, b);
                ir.x87_stack_store(0, sum);
            }
            "faddp" => {
                let a = ir.x87_stack_load(0);
                let b = ir.x87_stack_load(sti);
                let sum = ir.f80_add(a, b);
                ir.x87_stack_store(sti, sum);
                ir.x87_adjust_top(1);
            }
            "fstp" => {
                let value = ir.x87_stack_load(0);
                ir.x87_stack_store(sti, value);
                ir.x87_adjust_top(1);
            }
            _ => return Lowered::Unsupported,
        }
        Lowered::Ok
    }
}

enum Lowered {
    Ok,
    Terminator,
    Unsupported,
}

/// Split a decoded run into guest basic blocks at every block-ender or
/// RIP-writing instruction.
fn split_basic_blocks(insts: &[DecodedInstruction]) -> Vec<&[DecodedInstruction]> {
    let mut groups = Vec::new();
    let mut start = 0;
    for (i, inst) in insts.iter().enumerate() {
        if inst
            .info
            .flags
            .intersects(InstFlags::BLOCK_END | InstFlags::SETS_RIP)
        {
            groups.push(&insts[start..=i]);
            start = i + 1;
        }
    }
    if start < insts.len() {
        groups.push(&insts[start..]);
    }
    groups
}

/// `(taken, fallthrough)` guest PCs of a direct branch.
fn branch_edges(inst: &DecodedInstruction) -> Option<(u64, u64)> {
    if !inst.info.flags.contains(InstFlags::SETS_RIP)
        || inst.info.flags.contains(InstFlags::MODRM)
    {
        return None;
    }
    let literal = inst.src1.literal()?;
    let fallthrough = inst.pc.wrapping_add(u64::from(inst.size));
    Some((fallthrough.wrapping_add(literal), fallthrough))
}

/// Store the exit RIP (when known) and leave the unit.
fn emit_exit(ir: &mut IrEmitter, rip: Option<u64>) {
    if let Some(rip) = rip {
        let value = ir.constant(rip);
        ir.store_context(RegClass::Gpr, 8, cpu::rip_offset(), value);
    }
    ir.exit_function();
}

/// Lower a register or literal operand to a value; memory forms and the
/// legacy high-byte registers are outside the covered subset.
fn load_operand(ir: &mut IrEmitter, operand: &Operand, size: u8) -> Option<NodeId> {
    match operand {
        Operand::Gpr { reg, high_bits: false } if reg.is_gpr() => {
            Some(ir.load_context(size, cpu::reg_offset(*reg), RegClass::Gpr))
        }
        Operand::Gpr { reg, high_bits: false } if reg.is_xmm() => {
            Some(ir.load_context(16, cpu::reg_offset(*reg), RegClass::Fpr))
        }
        Operand::Literal { value, .. } => Some(ir.constant(*value)),
        _ => None,
    }
}

fn store_operand(ir: &mut IrEmitter, operand: &Operand, size: u8, value: NodeId) -> bool {
    match operand {
        Operand::Gpr { reg, high_bits: false } if reg.is_gpr() => {
            ir.store_context(RegClass::Gpr, size, cpu::reg_offset(*reg), value);
            true
        }
        Operand::Gpr { reg, high_bits: false } if reg.is_xmm() => {
            ir.store_context(RegClass::Fpr, 16, cpu::reg_offset(*reg), value);
            true
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::IrOp;
    use ember_x86::{DecodeOptions, Decoder};

    fn translate(code: &[u8], multiblock: bool) -> IrEmitter {
        let mut decoder = Decoder::new(DecodeOptions {
            multiblock,
            ..DecodeOptions::default()
        });
        let block = decoder.decode_block(code, 0x1000).unwrap();
        IrBuilder::new().translate(&block).unwrap()
    }

    #[test]
    fn mov_and_add_lower_to_context_ops() {
        // mov rax, rbx ; add rax, rcx ; ret
        let ir = translate(&[0x48, 0x89, 0xD8, 0x48, 0x01, 0xC8, 0xC3], false);
        let view = ir.view();
        let ops: Vec<&'static str> = view.all_code().map(|id| view.op(id).name()).collect();
        assert_eq!(
            ops,
            [
                "LoadContext",
                "StoreContext",
                "LoadContext",
                "LoadContext",
                "Add",
                "StoreContext",
                "ExitFunction",
            ]
        );
        assert!(!view.should_interpret());
    }

    #[test]
    fn conditional_branch_produces_two_blocks_and_a_condjump() {
        // jne +2 ; ud2 ; mov eax, ebx ; ret  (multiblock covers the ud2)
        let ir = translate(&[0x75, 0x02, 0x0F, 0x0B, 0x89, 0xD8, 0xC3], true);
        let view = ir.view();
        let blocks: Vec<_> = view.blocks().collect();
        // jcc block, ud2 block, mov+ret block.
        assert!(blocks.len() >= 3);
        let has_condjump = view
            .all_code()
            .any(|id| matches!(view.op(id), IrOp::CondJump { .. }));
        assert!(has_condjump);
    }

    #[test]
    fn unsupported_instruction_marks_interpreter_only() {
        // cpuid is outside the builder subset.
        let ir = translate(&[0x0F, 0xA2], false);
        assert!(ir.view().should_interpret());
    }

    #[test]
    fn x87_register_forms_lower_to_stack_ops() {
        // fld st(1) ; faddp ; ret
        let ir = translate(&[0xD9, 0xC1, 0xDE, 0xC1, 0xC3], false);
        let view = ir.view();
        let names: Vec<_> = view.all_code().map(|id| view.op(id).name()).collect();
        assert!(names.contains(&"X87StackLoad"));
        assert!(names.contains(&"X87AdjustTop"));
        assert!(names.contains(&"F80Add"));
        assert!(!view.should_interpret());
    }
}
