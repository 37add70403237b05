//! Constrained graph-coloring register allocation.
//!
//! Every value-defining node gets a register of its declared class. The
//! allocator iterates `{compact, liveness, interference, color, spill}`
//! until every class fits its physical budget: coloring hands out virtual
//! registers past the physical count rather than failing, and the spill
//! phase then rematerializes an encompassing constant or inserts one
//! spill/fill pair per iteration. One spill per iteration keeps the
//! liveness data honest; each iteration strictly lowers the failing class's
//! pressure, which bounds the loop.

mod graph;

use std::collections::HashMap;

use graph::{
    pack_reg, packed_class, packed_reg, LiveRange, RegisterGraph, INVALID_REG, INVALID_REGCLASS,
};

use crate::ir::{IrEmitter, IrOp, IrView, NodeId, RegClass};
use crate::passes::compaction;

/// Fatal allocation failure; the translation unit must be discarded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegAllocError {
    /// A node over budget had no interference the spill ladder could take.
    #[error("no spill candidate for %ssa{node} (class {class}, live [{begin}, {end}))")]
    NoSpillCandidate {
        /// Over-budget node.
        node: u32,
        /// Its register class tag.
        class: u32,
        /// Live range begin.
        begin: u32,
        /// Live range end.
        end: u32,
    },
    /// The chosen spill victim is part of a tie chain.
    #[error("spilling tied register %ssa{node} is unsupported")]
    TiedSpill {
        /// The tied victim.
        node: u32,
    },
    /// A tie chain demands more registers than the class owns.
    #[error("tie chain of {len} nodes exceeds class budget {budget}")]
    InfeasibleTieChain {
        /// Chain length.
        len: u32,
        /// Physical registers in the class.
        budget: u32,
    },
}

/// One spill slot's owner and class, for the backend's frame layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpillSlot {
    /// Node whose value the slot was created for.
    pub node: NodeId,
    /// Register class stored in the slot.
    pub class: RegClass,
}

/// Final SSA-index to register mapping handed to the backend.
#[derive(Debug, Clone)]
pub struct AllocationData {
    map: Vec<u64>,
    spill_slots: Vec<SpillSlot>,
}

impl AllocationData {
    /// Packed register of a node: high 32 bits class, low 32 register.
    pub fn dest_register(&self, node: NodeId) -> u64 {
        self.map[node.index()]
    }

    /// Class and register number of a node, `None` class for non-values.
    pub fn unpack(&self, node: NodeId) -> (Option<RegClass>, u32) {
        let packed = self.map[node.index()];
        if packed == INVALID_REGCLASS {
            return (None, u32::MAX);
        }
        (RegClass::from_u32(packed_class(packed)), packed_reg(packed))
    }

    /// Spill slots the frame must provide.
    pub fn spill_slot_count(&self) -> u32 {
        self.spill_slots.len() as u32
    }

    /// Per-slot owner and class.
    pub fn spill_slots(&self) -> &[SpillSlot] {
        &self.spill_slots
    }
}

/// IR size at which interference switches from the quadratic scan to the
/// block-partitioned strategy.
const BLOCK_INTERFERENCE_THRESHOLD: u32 = 2048;

/// The constrained allocator.
#[derive(Debug, Default)]
pub struct RegisterAllocationPass {
    physical_register_count: [u32; RegClass::COUNT],
    top_ra_pressure: [u32; RegClass::COUNT],
    graph: RegisterGraph,
    live_ranges: Vec<LiveRange>,
    local_block_interferences: HashMap<u32, Vec<u32>>,
    global_block_interferences: Vec<u32>,
    /// Backend-injected co-allocation constraints, forward chains.
    ties: Vec<(NodeId, NodeId)>,
    spill_slot_count: u32,
    had_full_ra: bool,
    allocation: Option<AllocationData>,
}

impl RegisterAllocationPass {
    /// Allocator with no registers configured; callers add classes before
    /// the first run.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare the physical register count of a class.
    pub fn add_registers(&mut self, class: RegClass, count: u32) {
        self.physical_register_count[class as usize] = count;
    }

    /// Reserve the conflict table of a class; fixed maximum, allocated once.
    pub fn allocate_register_conflicts(&mut self, class: RegClass, max_regs: u32) {
        self.graph.allocate_register_conflicts(class, max_regs);
    }

    /// Ban a symmetric register pairing (e.g. an FPR aliasing a GPR byte).
    pub fn add_register_conflict(
        &mut self,
        class_a: RegClass,
        reg_a: u32,
        class_b: RegClass,
        reg_b: u32,
    ) {
        self.graph.add_register_conflict(class_a, reg_a, class_b, reg_b);
    }

    /// Force `a` and `b` into the same register; `b` becomes `a`'s forward
    /// tie partner.
    pub fn add_tie(&mut self, a: NodeId, b: NodeId) {
        self.ties.push((a, b));
    }

    /// Packed register of a node after a successful run.
    pub fn dest_register(&self, node: NodeId) -> u64 {
        self.graph.nodes[node.index()].reg_and_class
    }

    /// Allocation results, once a run has completed.
    pub fn allocation_data(&self) -> Option<&AllocationData> {
        self.allocation.as_ref()
    }

    /// Spill slots consumed by the last run.
    pub fn spill_slot_count(&self) -> u32 {
        self.spill_slot_count
    }

    /// `true` when every class fit its physical budget.
    pub fn had_full_ra(&self) -> bool {
        self.had_full_ra
    }

    /// Run allocation to completion.
    pub fn run(&mut self, ir: &mut IrEmitter) -> Result<bool, RegAllocError> {
        if ir.view().should_interpret() {
            return Ok(false);
        }

        let mut changed = false;
        self.spill_slot_count = 0;
        self.graph.spill_stack.clear();

        loop {
            self.had_full_ra = true;

            // The virtual allocation phase reruns compaction every step.
            changed |= self.run_allocate_virtual_registers(ir)?;

            for class in 0..RegClass::COUNT {
                // Virtual registers fit the physical file only when the top
                // pressure stays below the register count.
                self.had_full_ra &=
                    self.top_ra_pressure[class] < self.physical_register_count[class];
            }
            if self.had_full_ra {
                break;
            }

            self.spill_registers(ir)?;
            changed = true;
        }

        self.allocation = Some(AllocationData {
            map: self.graph.nodes.iter().map(|n| n.reg_and_class).collect(),
            spill_slots: self
                .graph
                .spill_stack
                .iter()
                .map(|unit| SpillSlot { node: NodeId(unit.node), class: unit.class })
                .collect(),
        });
        Ok(changed)
    }

    fn run_allocate_virtual_registers(
        &mut self,
        ir: &mut IrEmitter,
    ) -> Result<bool, RegAllocError> {
        self.global_block_interferences.clear();
        self.local_block_interferences.clear();
        self.top_ra_pressure = [0; RegClass::COUNT];

        let changed = compaction::compact(ir);

        let view = ir.view();
        let ssa_count = view.ssa_count();
        self.graph.reset(ssa_count);
        self.find_node_classes(&view);
        self.calculate_live_ranges(&view);

        // The linear forward scan wins on small programs; the smarter
        // block-partitioned walk wins on large ones.
        if ssa_count >= BLOCK_INTERFERENCE_THRESHOLD {
            self.calculate_block_interferences(&view);
            self.calculate_block_node_interference(&view);
        } else {
            self.calculate_node_interference(&view);
        }
        self.allocate_virtual_registers()?;

        Ok(changed)
    }

    fn find_node_classes(&mut self, view: &IrView<'_>) {
        for id in view.all_code() {
            let op = &view.node(id).op;
            if op.has_dest() {
                self.graph.nodes[id.index()].reg_and_class =
                    pack_reg(op.register_class(), INVALID_REG);
            }
        }
        for &(a, b) in &self.ties {
            self.graph.nodes[a.index()].tie_partner = Some(b.raw());
        }
    }

    fn calculate_live_ranges(&mut self, view: &IrView<'_>) {
        self.live_ranges.clear();
        self.live_ranges
            .resize(view.ssa_count() as usize, LiveRange::EMPTY);

        for id in view.all_code() {
            let node = view.node(id);
            if node.op.has_dest() {
                let range = &mut self.live_ranges[id.index()];
                range.begin = id.raw();
                range.end = id.raw() + 1;
                range.remat_cost = match node.op {
                    IrOp::Constant { .. } => 1,
                    _ => -1,
                };
            }
            for arg in node.op.args().iter() {
                let range = &mut self.live_ranges[arg.index()];
                range.end = range.end.max(id.raw());
            }
        }
    }

    /// Quadratic pairwise interference; fine below the block threshold.
    fn calculate_node_interference(&mut self, view: &IrView<'_>) {
        let code: Vec<NodeId> = view.all_code().collect();
        for (i, &a) in code.iter().enumerate() {
            for &b in &code[i + 1..] {
                if self.live_ranges[a.index()].overlaps(&self.live_ranges[b.index()]) {
                    self.graph.add_interference(a.raw(), b.raw());
                }
            }
        }
    }

    /// Partition nodes into block-local and global sets.
    fn calculate_block_interferences(&mut self, view: &IrView<'_>) {
        for block in view.blocks() {
            let Some((begin, last)) = view.code_range(block) else { continue };
            let local = self
                .local_block_interferences
                .entry(block.raw())
                .or_default();
            for id in view.code(block) {
                let range = &self.live_ranges[id.index()];
                if range.begin >= begin.raw() && range.end <= last.raw() + 1 {
                    // Fully inside the block.
                    local.push(id.raw());
                } else {
                    self.global_block_interferences.push(id.raw());
                }
            }
        }
    }

    /// Per block, test every node against the block's locals plus the
    /// global set; sidesteps the all-pairs comparison across blocks.
    fn calculate_block_node_interference(&mut self, view: &IrView<'_>) {
        for block in view.blocks() {
            let locals = self
                .local_block_interferences
                .get(&block.raw())
                .cloned()
                .unwrap_or_default();
            let mut interferences = Vec::new();

            for id in view.code(block) {
                let range = &self.live_ranges[id.index()];
                interferences.clear();

                for &rhs in locals.iter().chain(self.global_block_interferences.iter()) {
                    if rhs != id.raw() && range.overlaps(&self.live_ranges[rhs as usize]) {
                        interferences.push(rhs);
                    }
                }
                for &rhs in &interferences {
                    self.graph.add_interference(id.raw(), rhs);
                }
            }
        }
    }

    fn allocate_virtual_registers(&mut self) -> Result<(), RegAllocError> {
        for i in 0..self.graph.nodes.len() as u32 {
            let reg_and_class = self.graph.nodes[i as usize].reg_and_class;
            if reg_and_class == INVALID_REGCLASS || packed_reg(reg_and_class) != INVALID_REG {
                continue;
            }
            let class = RegClass::from_u32(packed_class(reg_and_class))
                .expect("corrupt class tag in register graph");

            // Gather the forward tie chain; a plain node is a chain of one.
            let mut chain = vec![i];
            let mut cursor = self.graph.nodes[i as usize].tie_partner;
            while let Some(partner) = cursor {
                chain.push(partner);
                cursor = self.graph.nodes[partner as usize].tie_partner;
            }
            let budget = self.physical_register_count[class as usize];
            if chain.len() > 1 && chain.len() as u32 > budget {
                return Err(RegAllocError::InfeasibleTieChain {
                    len: chain.len() as u32,
                    budget,
                });
            }

            // Smallest register not clashing with any prior assignment of
            // the whole chain; falls into the virtual range past the
            // physical file when nothing fits.
            let mut reg = 0u32;
            let assigned = loop {
                let candidate = pack_reg(class, reg);
                let clashes = chain
                    .iter()
                    .any(|&member| self.graph.node_clashes_with_register(member, candidate));
                if !clashes {
                    break candidate;
                }
                reg += 1;
            };

            let pressure = &mut self.top_ra_pressure[class as usize];
            *pressure = (*pressure).max(packed_reg(assigned));
            for &member in &chain {
                self.graph.nodes[member as usize].reg_and_class = assigned;
            }
        }
        Ok(())
    }

    /// First node in `[begin, end]` whose arguments reference `target`.
    fn find_first_use(
        view: &IrView<'_>,
        target: NodeId,
        begin: NodeId,
        end: NodeId,
    ) -> Option<NodeId> {
        view.iter_range(begin, end)
            .find(|&id| view.op(id).args().iter().any(|arg| arg == target))
    }

    /// First node from `begin` to the end of the program whose arguments
    /// reference `target`. Spill fills and rematerializations may land in a
    /// later block than the pressure point when the victim crosses blocks.
    fn find_first_use_from(
        view: &IrView<'_>,
        target: NodeId,
        begin: NodeId,
    ) -> Option<NodeId> {
        let mut cursor = Some(begin);
        while let Some(id) = cursor {
            if view.op(id).args().iter().any(|arg| arg == target) {
                return Some(id);
            }
            cursor = view.next_of(id);
        }
        None
    }

    /// Walking backward from `end` to `begin`, the definition of `target`
    /// or its latest use.
    fn find_last_use_before(
        view: &IrView<'_>,
        target: NodeId,
        begin: NodeId,
        end: NodeId,
    ) -> Option<NodeId> {
        let mut cur = Some(end);
        while let Some(id) = cur {
            if id == target {
                return Some(id);
            }
            if view.op(id).args().iter().any(|arg| arg == target) {
                return Some(id);
            }
            if id == begin {
                break;
            }
            cur = view.prev_of(id);
        }
        None
    }

    /// Pick the interference to evict for an over-budget `current` node.
    ///
    /// With `remat = Some(cost)` only rematerializable candidates of that
    /// cost are considered (the constant path); with `None` the ladder
    /// looks for a real spill victim. Returns `None` when nothing fits.
    fn find_node_to_spill(
        &self,
        view: &IrView<'_>,
        current: NodeId,
        op_range: &LiveRange,
        remat: Option<i32>,
    ) -> Option<u32> {
        let current_location = current.raw();
        let mut victim: Option<u32> = None;
        let mut farthest_next_use = 0u32;

        let interference_list = &self.graph.nodes[current.index()].interference;

        // Candidates whose range encompasses the current node with no use
        // inside the current range: rematerialize (constants) or spill
        // before the definition and fill at the next use.
        for &interference in interference_list {
            let int_range = &self.live_ranges[interference as usize];
            let eligible = match remat {
                Some(cost) => int_range.remat_cost == cost,
                None => int_range.remat_cost == -1,
            };
            if !eligible {
                continue;
            }

            // An interference fully inside the current range frees nothing:
            // current stays live across all of it.
            if op_range.begin <= int_range.begin && op_range.end >= int_range.end {
                continue;
            }

            if current_location > int_range.begin && op_range.end < int_range.end {
                // Only profitable when the interference is idle across the
                // whole current range.
                let range_end = NodeId(op_range.end.min(view.ssa_count() - 1));
                let used_inside =
                    Self::find_first_use(view, NodeId(interference), current, range_end).is_some();
                if used_inside {
                    continue;
                }
                let int_end = NodeId(int_range.end.min(view.ssa_count() - 1));
                if let Some(next_use) =
                    Self::find_first_use(view, NodeId(interference), current, int_end)
                {
                    let distance = next_use.raw() - current_location;
                    if distance >= farthest_next_use {
                        victim = Some(interference);
                        farthest_next_use = distance;
                    }
                } else if remat.is_some() {
                    // A constant with no further use is free to drop.
                    victim = Some(interference);
                }
            }
        }

        if victim.is_none() {
            // Candidates overlapping only the beginning of the current
            // range: evictable when the current definition itself does not
            // read them.
            for &interference in interference_list {
                let int_range = &self.live_ranges[interference as usize];
                let eligible = match remat {
                    Some(cost) => int_range.remat_cost == cost,
                    None => true,
                };
                if !eligible {
                    continue;
                }
                if op_range.begin <= int_range.begin && op_range.end >= int_range.end {
                    continue;
                }

                if current_location > int_range.begin && op_range.end > int_range.end {
                    let used_at_current =
                        Self::find_first_use(view, NodeId(interference), current, current)
                            .is_some();
                    if used_at_current {
                        continue;
                    }
                    let int_end = NodeId(int_range.end.min(view.ssa_count() - 1));
                    if let Some(next_use) =
                        Self::find_first_use(view, NodeId(interference), current, int_end)
                    {
                        let distance = next_use.raw() - current_location;
                        if distance >= farthest_next_use {
                            victim = Some(interference);
                            farthest_next_use = distance;
                        }
                    }
                }

                // The symmetric route, an interference overlapping only the
                // end of the current range, stays disabled: its fill-point
                // search runs past the candidate's definition and picks a
                // bogus insertion site.
            }
        }

        victim
    }

    /// Slot for a spilled node: reuse any slot whose accumulated range is
    /// disjoint from the node's, widening it, else grow the stack.
    fn find_spill_slot(&mut self, node: u32, class: RegClass) -> u32 {
        let node_range = self.live_ranges[node as usize];
        for (i, unit) in self.graph.spill_stack.iter_mut().enumerate() {
            let disjoint =
                node_range.begin >= unit.range.end || unit.range.begin >= node_range.end;
            if disjoint {
                unit.range.begin = unit.range.begin.min(node_range.begin);
                unit.range.end = unit.range.end.max(node_range.end);
                self.graph.nodes[node as usize].spill_slot = i as u32;
                return i as u32;
            }
        }

        let slot = self.spill_slot_count;
        self.graph.spill_stack.push(graph::SpillStackUnit {
            node,
            class,
            range: node_range,
        });
        self.graph.nodes[node as usize].spill_slot = slot;
        self.spill_slot_count += 1;
        slot
    }

    /// One spill or rematerialization, then return so the next iteration
    /// recomputes liveness.
    fn spill_registers(&mut self, ir: &mut IrEmitter) -> Result<(), RegAllocError> {
        let last_cursor = ir.write_cursor();

        let blocks: Vec<NodeId> = ir.view().blocks().collect();
        for block in blocks {
            let Some((block_begin, _)) = ir.view().code_range(block) else {
                continue;
            };
            let code: Vec<NodeId> = ir.view().code(block).collect();

            for current in code {
                if !ir.view().op(current).has_dest() {
                    continue;
                }
                let reg_and_class = self.graph.nodes[current.index()].reg_and_class;
                let class_tag = packed_class(reg_and_class);
                let needs_spill =
                    packed_reg(reg_and_class) >= self.physical_register_count[class_tag as usize];
                if !needs_spill {
                    continue;
                }

                let op_range = self.live_ranges[current.index()];
                let mut spilled = false;

                // Constants first: rematerializing beats touching memory.
                if let Some(constant_node) = {
                    let view = ir.view();
                    self.find_node_to_spill(&view, current, &op_range, Some(1))
                } {
                    spilled =
                        self.rematerialize_constant(ir, NodeId(constant_node), current);
                }

                if !spilled {
                    let victim = {
                        let view = ir.view();
                        self.find_node_to_spill(&view, current, &op_range, None)
                    }
                    .ok_or(RegAllocError::NoSpillCandidate {
                        node: current.raw(),
                        class: class_tag,
                        begin: op_range.begin,
                        end: op_range.end,
                    })?;

                    if self.graph.nodes[victim as usize].tie_partner.is_some()
                        || self
                            .ties
                            .iter()
                            .any(|&(_, b)| b.raw() == victim)
                    {
                        return Err(RegAllocError::TiedSpill { node: victim });
                    }

                    spilled = self.spill_victim(ir, NodeId(victim), current, block_begin);
                }

                ir.set_write_cursor(last_cursor);
                if spilled {
                    // One spill per iteration; liveness is stale now.
                    return Ok(());
                }
            }
        }

        Ok(())
    }

    /// Re-emit a fresh constant at every use site from the pressure point
    /// onward, ending the original's live range there.
    fn rematerialize_constant(
        &mut self,
        ir: &mut IrEmitter,
        constant: NodeId,
        current: NodeId,
    ) -> bool {
        let IrOp::Constant { value } = *ir.view().op(constant) else {
            return false;
        };

        let mut uses: Vec<NodeId> = Vec::new();
        {
            let view = ir.view();
            let mut cursor = Some(current);
            while let Some(id) = cursor {
                if view.op(id).args().iter().any(|arg| arg == constant) {
                    uses.push(id);
                }
                cursor = view.next_of(id);
            }
        }
        if uses.is_empty() {
            return false;
        }

        for use_site in uses {
            let anchor = ir
                .view()
                .prev_of(use_site)
                .expect("a code node always has a predecessor");
            ir.set_write_cursor(Some(anchor));
            let fresh = ir.constant(value);
            ir.replace_uses_with_inclusive(constant, fresh, use_site, use_site);
        }

        // The original definition dies when nothing is left reading it.
        let still_used = {
            let view = ir.view();
            view.all_code()
                .any(|id| view.op(id).args().iter().any(|arg| arg == constant))
        };
        if !still_used {
            ir.remove(constant);
        }
        true
    }

    /// Insert the spill after the victim's last use before `current` and
    /// the fill just before its next use, rewriting the remaining reads.
    fn spill_victim(
        &mut self,
        ir: &mut IrEmitter,
        victim: NodeId,
        current: NodeId,
        block_begin: NodeId,
    ) -> bool {
        let victim_packed = self.graph.nodes[victim.index()].reg_and_class;
        let victim_class = RegClass::from_u32(packed_class(victim_packed))
            .expect("spill victim was never classed");
        let slot = self.find_spill_slot(victim.raw(), victim_class);

        let (victim_size, victim_elem) = {
            let node = ir.view().node(victim);
            (node.size, node.elem_size)
        };

        let anchor = {
            let view = ir.view();
            // A victim defined in an earlier block has no use to anchor on
            // here; spill right before the pressured definition instead.
            Self::find_last_use_before(&view, victim, block_begin, current)
                .or_else(|| view.prev_of(current))
        };
        let Some(anchor) = anchor else {
            return false;
        };

        ir.set_write_cursor(Some(anchor));
        let spill = ir.spill_register(victim, slot, victim_class);
        ir.set_sizes(spill, victim_size, victim_elem);

        let first_use_after = {
            let view = ir.view();
            view.next_of(spill)
                .and_then(|start| Self::find_first_use_from(&view, victim, start))
        };
        let Some(first_use) = first_use_after else {
            ir.remove(spill);
            return false;
        };

        let anchor = ir
            .view()
            .prev_of(first_use)
            .expect("a code node always has a predecessor");
        ir.set_write_cursor(Some(anchor));
        let fill = ir.fill_register(slot, victim_class);
        ir.set_sizes(fill, victim_size, victim_elem);
        // Every read from the fill onward observes the reloaded value.
        ir.replace_all_uses_from(victim, fill, first_use);

        true
    }
}
