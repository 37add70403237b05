//! Backing storage for the constrained register allocator.
//!
//! Everything is keyed by SSA index into flat arenas; compaction runs
//! before every allocation iteration so the indices are dense. Interference
//! is stored twice per node: a bitset for O(1) membership and a vector for
//! ordered iteration.

use crate::ir::RegClass;

/// Register number marker for "no register assigned yet".
pub(crate) const INVALID_REG: u32 = u32::MAX;
/// Packed marker for "does not participate in allocation".
pub(crate) const INVALID_REGCLASS: u64 = u64::MAX;

/// Pack a class and register number: high 32 bits class, low 32 register.
pub(crate) const fn pack_reg(class: RegClass, reg: u32) -> u64 {
    ((class as u64) << 32) | reg as u64
}

pub(crate) const fn packed_class(reg_and_class: u64) -> u32 {
    (reg_and_class >> 32) as u32
}

pub(crate) const fn packed_reg(reg_and_class: u64) -> u32 {
    reg_and_class as u32
}

/// Dense bitset over SSA indices.
#[derive(Debug, Default, Clone)]
pub(crate) struct BitSet {
    words: Vec<u64>,
}

impl BitSet {
    pub(crate) fn resize_cleared(&mut self, bits: usize) {
        self.words.clear();
        self.words.resize(bits.div_ceil(64), 0);
    }

    pub(crate) fn set(&mut self, bit: u32) {
        self.words[(bit / 64) as usize] |= 1u64 << (bit % 64);
    }

    pub(crate) fn contains(&self, bit: u32) -> bool {
        self.words[(bit / 64) as usize] & (1u64 << (bit % 64)) != 0
    }
}

/// Half-open live interval over SSA indices plus the rematerialization
/// marker (`-1` = not rematerializable, `1` = cheap constant).
#[derive(Debug, Clone, Copy)]
pub(crate) struct LiveRange {
    pub begin: u32,
    pub end: u32,
    pub remat_cost: i32,
}

impl LiveRange {
    pub(crate) const EMPTY: LiveRange = LiveRange { begin: u32::MAX, end: 0, remat_cost: -1 };

    pub(crate) fn overlaps(&self, other: &LiveRange) -> bool {
        !(self.begin >= other.end || other.begin >= self.end)
    }
}

/// Per-SSA-node allocation state.
#[derive(Debug, Clone)]
pub(crate) struct RegisterNode {
    /// Assigned register and class, [`INVALID_REGCLASS`] when the node does
    /// not define a value.
    pub reg_and_class: u64,
    /// Next node in a tie chain that must share this node's register.
    pub tie_partner: Option<u32>,
    /// Interference list, ordered by insertion.
    pub interference: Vec<u32>,
    /// Interference membership.
    pub interference_set: BitSet,
    /// Spill slot assigned to this node, if spilled.
    pub spill_slot: u32,
}

impl RegisterNode {
    fn cleared() -> Self {
        Self {
            reg_and_class: INVALID_REGCLASS,
            tie_partner: None,
            interference: Vec::new(),
            interference_set: BitSet::default(),
            spill_slot: u32::MAX,
        }
    }
}

/// One spill-stack slot and the union of live ranges it has served.
#[derive(Debug, Clone)]
pub(crate) struct SpillStackUnit {
    pub node: u32,
    pub class: RegClass,
    pub range: LiveRange,
}

/// Per-class allocation configuration.
#[derive(Debug, Default, Clone)]
pub(crate) struct ClassInfo {
    /// Per physical register: packed registers banned from co-assignment.
    /// Sized once via [`RegisterGraph::allocate_register_conflicts`].
    pub conflicts: Vec<Vec<u64>>,
}

/// The whole allocation graph.
#[derive(Debug, Default)]
pub(crate) struct RegisterGraph {
    pub classes: [ClassInfo; RegClass::COUNT],
    pub nodes: Vec<RegisterNode>,
    pub spill_stack: Vec<SpillStackUnit>,
}

impl RegisterGraph {
    /// Reserve the conflict table for `class`; the table is allocated once
    /// with a fixed maximum register count.
    pub(crate) fn allocate_register_conflicts(&mut self, class: RegClass, max_regs: u32) {
        self.classes[class as usize]
            .conflicts
            .resize(max_regs as usize, Vec::new());
    }

    /// Ban co-assignment of two registers, symmetrically.
    pub(crate) fn add_register_conflict(
        &mut self,
        class_a: RegClass,
        reg_a: u32,
        class_b: RegClass,
        reg_b: u32,
    ) {
        let add = |info: &mut ClassInfo, reg: u32, packed: u64| {
            if let Some(list) = info.conflicts.get_mut(reg as usize) {
                if !list.contains(&packed) {
                    list.push(packed);
                }
            }
        };
        add(&mut self.classes[class_a as usize], reg_a, pack_reg(class_b, reg_b));
        add(&mut self.classes[class_b as usize], reg_b, pack_reg(class_a, reg_a));
    }

    /// `true` when assigning `candidate` next to an existing `assigned`
    /// register is illegal.
    pub(crate) fn registers_clash(&self, candidate: u64, assigned: u64) -> bool {
        if assigned == INVALID_REGCLASS {
            return false;
        }
        if candidate == assigned {
            return true;
        }
        let class = packed_class(candidate) as usize;
        let reg = packed_reg(candidate) as usize;
        self.classes[class]
            .conflicts
            .get(reg)
            .is_some_and(|list| list.contains(&assigned))
    }

    /// Clear per-node state for a fresh iteration over `count` SSA nodes.
    pub(crate) fn reset(&mut self, count: u32) {
        self.nodes.clear();
        self.nodes.resize(count as usize, RegisterNode::cleared());
        for node in &mut self.nodes {
            node.interference_set.resize_cleared(count as usize);
        }
    }

    /// Record that `a` and `b` are simultaneously live, in both directions.
    pub(crate) fn add_interference(&mut self, a: u32, b: u32) {
        let node = &mut self.nodes[a as usize];
        if !node.interference_set.contains(b) {
            node.interference_set.set(b);
            node.interference.push(b);
        }
        let node = &mut self.nodes[b as usize];
        if !node.interference_set.contains(a) {
            node.interference_set.set(a);
            node.interference.push(a);
        }
    }

    /// `true` when `node` may not take `candidate` because of an already
    /// assigned interfering node or a conflict-table entry.
    pub(crate) fn node_clashes_with_register(&self, node: u32, candidate: u64) -> bool {
        self.nodes[node as usize]
            .interference
            .iter()
            .any(|&other| self.registers_clash(candidate, self.nodes[other as usize].reg_and_class))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interference_is_symmetric_and_deduplicated() {
        let mut graph = RegisterGraph::default();
        graph.reset(4);
        graph.add_interference(1, 2);
        graph.add_interference(1, 2);
        graph.add_interference(2, 1);

        assert_eq!(graph.nodes[1].interference, vec![2]);
        assert_eq!(graph.nodes[2].interference, vec![1]);
        assert!(graph.nodes[1].interference_set.contains(2));
        assert!(graph.nodes[2].interference_set.contains(1));
    }

    #[test]
    fn conflict_table_bans_cross_class_pairs() {
        let mut graph = RegisterGraph::default();
        graph.reset(2);
        // Symmetry needs both class tables allocated.
        graph.allocate_register_conflicts(RegClass::Fpr, 32);
        graph.allocate_register_conflicts(RegClass::Gpr, 32);
        // FPR 0 aliases GPR 0's low byte.
        graph.add_register_conflict(RegClass::Fpr, 0, RegClass::Gpr, 0);

        assert!(graph.registers_clash(pack_reg(RegClass::Fpr, 0), pack_reg(RegClass::Gpr, 0)));
        assert!(graph.registers_clash(pack_reg(RegClass::Gpr, 0), pack_reg(RegClass::Fpr, 0)));
        assert!(!graph.registers_clash(pack_reg(RegClass::Fpr, 1), pack_reg(RegClass::Gpr, 0)));
    }

    #[test]
    fn live_range_overlap_is_half_open() {
        let a = LiveRange { begin: 0, end: 5, remat_cost: -1 };
        let b = LiveRange { begin: 5, end: 9, remat_cost: -1 };
        let c = LiveRange { begin: 4, end: 6, remat_cost: -1 };
        assert!(!a.overlaps(&b));
        assert!(a.overlaps(&c));
        assert!(c.overlaps(&b));
    }
}
