//! The switch builder.
//!
//! Cases are collected between `begin_switch`/`end_switch`. Integer cases
//! (when dynamic profile data says the switch expression is likely an
//! int) are deferred, sorted, and lowered to a mix of jump tables and
//! balanced binary search; string cases (likely-string profile) become a
//! single-character jump table or an identity dictionary. Anything else
//! flushes pending cases and falls back to a plain equality branch.
//!
//! None of these operations can fail at compile time. When the emitted
//! fast path depends on a profile assumption (int-ness/string-ness of the
//! switch expression), the profiled switch instruction is converted into
//! a bailout so a mispredicted type re-enters the interpreter instead of
//! running unsound code.

use rustc_hash::FxHashSet;
use vesper_core::intern::InternedString;

use crate::bailout::BailOutKind;
use crate::ir::{
    Instr, InstrId, IrFunc, MultiBrData, MultiBrKind, OpCode, Opnd, IRType,
};

use super::case_node::{CaseNode, CaseValue};

/// Byte-code offset marking compiler-introduced instructions.
pub const NO_BYTE_CODE_OFFSET: u32 = u32::MAX;

// Lowering thresholds. Linear chains at or below the linear counts,
// jump tables only for spans at least the minimum size with at most
// the holes-threshold percentage of unfilled slots.
const MAX_LINEAR_INT_CASE_COUNT: usize = 3;
const MAX_LINEAR_STR_CASE_COUNT: usize = 4;
const MIN_SWITCH_JUMP_TABLE_SIZE: i64 = 64;
const SWITCH_OPT_HOLES_THRESHOLD: i64 = 50;
const MAX_SINGLE_CHAR_STR_JUMP_TABLE_SIZE: u32 = 128;
const MAX_SINGLE_CHAR_STR_JUMP_TABLE_RATIO: u32 = 2;

/// Profiled type of a switch expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchProfile {
    /// The expression has been a tagged int.
    LikelyTaggedInt,
    /// The expression has been a string.
    LikelyString,
    /// Mixed or unknown; no fast path.
    Other,
}

/// Capability surface through which the builder mutates the owning IR
/// builder's instruction stream.
///
/// Both the normal and the asm.js IR builders implement this; the switch
/// builder itself is shared unchanged between them.
pub trait SwitchAdapter {
    /// Append a branch whose target byte-code offset is resolved by the
    /// owner; returns the instruction's id.
    fn add_branch_instr(
        &mut self,
        func: &mut IrFunc,
        instr: Instr,
        offset: u32,
        target_offset: u32,
    ) -> InstrId;

    /// Append a non-branching instruction.
    fn add_instr(&mut self, func: &mut IrFunc, instr: Instr, offset: u32) -> InstrId;

    /// Record a branch-target relocation for an already-appended
    /// instruction.
    fn create_reloc_record(
        &mut self,
        func: &mut IrFunc,
        branch: InstrId,
        offset: u32,
        target_offset: u32,
    );

    /// Convert a previously appended instruction into a bailout.
    fn convert_to_bail_out(&mut self, func: &mut IrFunc, instr: InstrId, kind: BailOutKind);
}

/// Builds branch structures for one switch statement at a time.
pub struct SwitchBuilder {
    case_nodes: Vec<CaseNode>,
    seen_only_single_char_str_case_nodes: bool,
    profiled_switch_instr: Option<InstrId>,
    is_asm_js: bool,
    switch_opt_enabled: bool,
    /// Whether a bailout still has to be generated for this switch.
    switch_opt_build_bail: bool,
    /// Profile says the switch expression is an integer.
    switch_int_dyn_profile: bool,
    /// Profile says the switch expression is a string.
    switch_str_dyn_profile: bool,
    int_const_switch_cases: FxHashSet<i32>,
    str_const_switch_cases: FxHashSet<InternedString>,
}

impl SwitchBuilder {
    /// Create a builder. `switch_opt_enabled` comes from the engine's
    /// phase flags; with it off every case lowers to a plain branch.
    pub fn new(is_asm_js: bool, switch_opt_enabled: bool) -> Self {
        SwitchBuilder {
            case_nodes: Vec::new(),
            seen_only_single_char_str_case_nodes: true,
            profiled_switch_instr: None,
            is_asm_js,
            switch_opt_enabled,
            switch_opt_build_bail: false,
            switch_int_dyn_profile: false,
            switch_str_dyn_profile: false,
            int_const_switch_cases: FxHashSet::default(),
            str_const_switch_cases: FxHashSet::default(),
        }
    }

    /// Prepare for a new switch statement.
    pub fn begin_switch(&mut self) {
        self.int_const_switch_cases.clear();
        self.str_const_switch_cases.clear();

        if self.is_asm_js {
            // asm.js switches are statically int; never bail.
            self.switch_opt_build_bail = false;
            self.switch_int_dyn_profile = true;
            debug_assert!(!self.switch_str_dyn_profile);
        }
    }

    /// Record the profiled switch instruction and its profile.
    pub fn set_profiled_instruction(&mut self, instr: InstrId, profile: SwitchProfile) {
        self.profiled_switch_instr = Some(instr);
        self.switch_opt_build_bail = true;
        self.switch_int_dyn_profile = profile == SwitchProfile::LikelyTaggedInt;
        self.switch_str_dyn_profile = profile == SwitchProfile::LikelyString;
    }

    /// Handle one case instruction: defer it for optimized lowering, or
    /// emit a plain equality branch.
    pub fn on_case(
        &mut self,
        func: &mut IrFunc,
        adapter: &mut dyn SwitchAdapter,
        src1: Opnd,
        src2: Opnd,
        offset: u32,
        target_offset: u32,
    ) {
        let value = case_value_of(func, &src2);
        let is_int_const = matches!(value, Some(CaseValue::Int(_)));
        let is_str_const = matches!(value, Some(CaseValue::Str(_)));

        // A duplicate case value can never be reached; emit nothing.
        if self.switch_opt_enabled && is_int_const {
            let v = value.unwrap_or(CaseValue::Int(0)).int_const();
            if !self.int_const_switch_cases.insert(v) {
                return;
            }
        }
        if self.switch_opt_enabled && is_str_const {
            if let Some(CaseValue::Str(s)) = value {
                if !self.str_const_switch_cases.insert(s) {
                    return;
                }
            }
        }

        let eq_op = if is_str_const { OpCode::BrStrEq } else { OpCode::BrEq };
        let branch = Instr::new(eq_op).with_src1(src1).with_src2(src2).at_offset(offset);

        let mut deferred = false;
        if self.switch_opt_enabled {
            if self.switch_int_dyn_profile && is_int_const {
                let node = CaseNode::new(branch.clone(), offset, target_offset, value.unwrap());
                self.case_nodes.push(node);
                deferred = true;
            } else if self.switch_str_dyn_profile && is_str_const {
                let node = CaseNode::new(branch.clone(), offset, target_offset, value.unwrap());
                if let Some(s) = node.upper_bound_str_const() {
                    self.seen_only_single_char_str_case_nodes =
                        self.seen_only_single_char_str_case_nodes && s.len() == 1;
                }
                self.case_nodes.push(node);
                deferred = true;
            }
        }

        if !deferred {
            self.flush_cases(func, adapter, offset);
            adapter.add_branch_instr(func, branch, offset, target_offset);
        }
    }

    /// Lower all deferred cases; called when optimized collection must
    /// stop (non-constant case, end of switch).
    pub fn flush_cases(
        &mut self,
        func: &mut IrFunc,
        adapter: &mut dyn SwitchAdapter,
        target_offset: u32,
    ) {
        if self.case_nodes.is_empty() {
            return;
        }

        if self.switch_int_dyn_profile {
            self.build_case_br_instr(func, adapter, target_offset);
        } else if self.switch_str_dyn_profile {
            self.build_multi_br_case_instr_for_strings(func, adapter, target_offset);
        } else {
            debug_assert!(false, "deferred cases without a profile");
        }
    }

    /// Finish the switch: flush and emit the default branch.
    pub fn end_switch(
        &mut self,
        func: &mut IrFunc,
        adapter: &mut dyn SwitchAdapter,
        offset: u32,
        target_offset: u32,
    ) {
        self.flush_cases(func, adapter, target_offset);
        debug_assert!(self.case_nodes.is_empty());

        let branch = Instr::new(OpCode::Br).at_offset(offset);
        adapter.add_branch_instr(func, branch, offset, target_offset);

        self.profiled_switch_instr = None;
    }

    fn reset_case_nodes(&mut self) {
        self.case_nodes.clear();
        self.seen_only_single_char_str_case_nodes = true;
    }

    // ---- integer lowering ----

    fn build_case_br_instr(
        &mut self,
        func: &mut IrFunc,
        adapter: &mut dyn SwitchAdapter,
        target_offset: u32,
    ) {
        debug_assert!(self.is_asm_js || self.profiled_switch_instr.is_some());
        let count = self.case_nodes.len();

        if count <= MAX_LINEAR_INT_CASE_COUNT {
            self.build_linear_traverse_instr(func, adapter, 0, count - 1, target_offset);
            self.reset_case_nodes();
            return;
        }

        self.refine_case_nodes();
        self.build_optimized_integer_case_instrs(func, adapter, target_offset);
        self.reset_case_nodes();

        // Optimization definitely happened above the linear threshold;
        // the int fast path needs its guard.
        self.build_bail_on_not_integer(func, adapter);
    }

    /// Sort cases and merge consecutive empty cases sharing one block,
    /// dropping duplicates.
    fn refine_case_nodes(&mut self) {
        self.case_nodes.sort();

        let mut refined: Vec<CaseNode> = Vec::with_capacity(self.case_nodes.len());
        for curr_index in 1..self.case_nodes.len() {
            let prev = &self.case_nodes[curr_index - 1];
            let prev_target = prev.target_offset();
            let prev_value = prev.upper_bound_int_const();
            let prev_lower = prev.lower_bound();
            let curr = &self.case_nodes[curr_index];

            if prev_target == curr.target_offset()
                && (prev_value + 1 == curr.upper_bound_int_const()
                    || prev_value == curr.upper_bound_int_const())
            {
                // Empty consecutive case: widen the current node down to
                // the run's lower bound.
                self.case_nodes[curr_index].set_lower_bound(prev_lower);
            } else if let Some(last) = refined.last() {
                // Duplicate non-empty cases keep only the first.
                if last.upper_bound_int_const() != prev_value {
                    refined.push(prev.clone());
                }
            } else {
                refined.push(prev.clone());
            }
        }
        if let Some(last) = self.case_nodes.last() {
            refined.push(last.clone());
        }
        self.case_nodes = refined;
    }

    /// Partition sorted cases into dense clusters (jump tables) and
    /// sparse stretches (binary search), emitting block by block.
    fn build_optimized_integer_case_instrs(
        &mut self,
        func: &mut IrFunc,
        adapter: &mut dyn SwitchAdapter,
        target_offset: u32,
    ) {
        let mut start_jmp_table_index = 0usize;
        let mut end_jmp_table_index = 0usize;
        let mut start_binary_trav_index = 0usize;

        let mut multi_br: Option<InstrId> = None;

        for current_index in 0..self.case_nodes.len().saturating_sub(1) {
            let next_index = current_index + 1;
            let current_value = self.case_nodes[current_index].upper_bound_int_const() as i64;
            let next_value = self.case_nodes[next_index].upper_bound_int_const() as i64;

            if current_value + 1 != next_value {
                debug_assert!(next_index == end_jmp_table_index + 1);
                let end_value = self.case_nodes[end_jmp_table_index].upper_bound_int_const() as i64;
                let start_value =
                    self.case_nodes[start_jmp_table_index].upper_bound_int_const() as i64;

                let speculated_size = next_value - start_value + 1;
                let table_size = end_value - start_value + 1;
                let filled = (next_index - start_jmp_table_index + 1) as i64;

                if speculated_size != 0
                    && filled * 100 / speculated_size < 100 - SWITCH_OPT_HOLES_THRESHOLD
                {
                    // Extending through the hole would leave the table
                    // too sparse; close the current cluster.
                    if table_size >= MIN_SWITCH_JUMP_TABLE_SIZE {
                        let fall_thr_offset = self.case_nodes[end_jmp_table_index].offset();
                        self.try_build_binary_tree_or_multi_br(
                            func,
                            adapter,
                            &mut multi_br,
                            fall_thr_offset,
                            start_jmp_table_index,
                            end_jmp_table_index,
                            start_binary_trav_index,
                            target_offset,
                        );
                        start_binary_trav_index = next_index;
                    }
                    start_jmp_table_index = next_index;
                    end_jmp_table_index = next_index;
                } else {
                    end_jmp_table_index += 1;
                }
            } else {
                end_jmp_table_index += 1;
            }
        }

        let end_value = self.case_nodes[end_jmp_table_index].upper_bound_int_const() as i64;
        let start_value = self.case_nodes[start_jmp_table_index].upper_bound_int_const() as i64;
        let table_size = end_value - start_value + 1;

        if table_size < MIN_SWITCH_JUMP_TABLE_SIZE {
            self.build_binary_traverse_instr(
                func,
                adapter,
                start_binary_trav_index,
                end_jmp_table_index,
                target_offset,
            );
            if let Some(pending) = multi_br.take() {
                let next_offset = func
                    .arena
                    .next(pending)
                    .map(|id| func.arena.instr(id).byte_code_offset)
                    .unwrap_or(target_offset);
                self.fix_up_multi_br_jump_table(func, adapter, pending, next_offset);
            }
        } else {
            let fall_thr_offset = self.case_nodes[end_jmp_table_index].offset();
            self.try_build_binary_tree_or_multi_br(
                func,
                adapter,
                &mut multi_br,
                fall_thr_offset,
                start_jmp_table_index,
                end_jmp_table_index,
                start_binary_trav_index,
                target_offset,
            );
            let pending = multi_br.take().expect("jump table was just built");
            self.fix_up_multi_br_jump_table(func, adapter, pending, target_offset);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn try_build_binary_tree_or_multi_br(
        &mut self,
        func: &mut IrFunc,
        adapter: &mut dyn SwitchAdapter,
        multi_br: &mut Option<InstrId>,
        fall_thr_offset: u32,
        start_jmp_table_index: usize,
        end_jmp_table_index: usize,
        start_binary_trav_index: usize,
        default_target_offset: u32,
    ) {
        // Binary tree for the sparse stretch before the cluster, if any.
        if start_jmp_table_index != start_binary_trav_index {
            let end_binary_trav_index = start_jmp_table_index - 1;
            self.build_binary_traverse_instr(
                func,
                adapter,
                start_binary_trav_index,
                end_binary_trav_index,
                fall_thr_offset,
            );
            if let Some(pending) = multi_br.take() {
                let next_offset = func
                    .arena
                    .next(pending)
                    .map(|id| func.arena.instr(id).byte_code_offset)
                    .unwrap_or(fall_thr_offset);
                self.fix_up_multi_br_jump_table(func, adapter, pending, next_offset);
            }
        }

        if let Some(pending) = multi_br.take() {
            self.fix_up_multi_br_jump_table(func, adapter, pending, fall_thr_offset);
        }

        *multi_br = Some(self.build_multi_br_case_instr_for_ints(
            func,
            adapter,
            start_jmp_table_index,
            end_jmp_table_index,
            default_target_offset,
        ));
    }

    /// Patch a jump table's default target and create the relocations for
    /// its boundary checks once the real fall-through offset is known.
    fn fix_up_multi_br_jump_table(
        &mut self,
        func: &mut IrFunc,
        adapter: &mut dyn SwitchAdapter,
        multi_br: InstrId,
        target_offset: u32,
    ) {
        let offset = {
            let instr = func.arena.instr_mut(multi_br);
            if let Some(data) = instr.multi_br.as_deref_mut() {
                data.fix_default_target(target_offset);
            }
            instr.byte_code_offset
        };

        let sub_instr = func.arena.prev(multi_br).expect("offset calculation instruction");
        let upper_bound_check = func.arena.prev(sub_instr).expect("upper boundary check");
        let lower_bound_check = func.arena.prev(upper_bound_check).expect("lower boundary check");
        debug_assert_eq!(func.arena.instr(sub_instr).opcode, OpCode::Sub);
        debug_assert_eq!(func.arena.instr(upper_bound_check).opcode, OpCode::BrGt);
        debug_assert_eq!(func.arena.instr(lower_bound_check).opcode, OpCode::BrLt);

        adapter.create_reloc_record(func, upper_bound_check, offset, target_offset);
        adapter.create_reloc_record(func, lower_bound_check, offset, target_offset);
    }

    /// Emit bound checks, index normalization, and the jump table for
    /// cases `[start, end]`.
    fn build_multi_br_case_instr_for_ints(
        &mut self,
        func: &mut IrFunc,
        adapter: &mut dyn SwitchAdapter,
        start: usize,
        end: usize,
        target_offset: u32,
    ) -> InstrId {
        debug_assert!(!self.case_nodes.is_empty());
        debug_assert!(self.is_asm_js || self.profiled_switch_instr.is_some());

        // Src1 is the same register in every case node.
        let src_opnd = self.case_nodes[start].case_instr.src1.clone().expect("case source");
        let last_case_offset = self.case_nodes[end].offset();

        let base_case_value = self.case_nodes[start].lower_bound_int_const();
        let last_case_value = self.case_nodes[end].upper_bound_int_const();
        let table_size = (last_case_value as i64 - base_case_value as i64 + 1) as usize;

        let mut data = MultiBrData::new(MultiBrKind::IntJumpTable, target_offset);
        data.base_case_value = base_case_value;
        data.last_case_value = last_case_value;
        data.targets = vec![target_offset; table_size];

        // Walk table slots from the top, consuming case nodes; slots
        // inside a merged [lower, upper] range share the run's target,
        // holes keep the default.
        let mut case_index = end as isize;
        let mut lower_rel = 1i64;
        let mut upper_rel = 0i64;
        let mut case_target = target_offset;
        for jmp_index in (0..table_size).rev() {
            let j = jmp_index as i64;
            let node_matches = case_index >= start as isize && {
                let node = &self.case_nodes[case_index as usize];
                j == node.upper_bound_int_const() as i64 - base_case_value as i64
            };
            if node_matches {
                let node = &self.case_nodes[case_index as usize];
                lower_rel = node.lower_bound_int_const() as i64 - base_case_value as i64;
                upper_rel = node.upper_bound_int_const() as i64 - base_case_value as i64;
                case_target = node.target_offset();
                case_index -= 1;
                data.add_to_jump_table(case_target, jmp_index);
            } else if j >= lower_rel && j <= upper_rel {
                data.add_to_jump_table(case_target, jmp_index);
            } else {
                data.add_to_jump_table(target_offset, jmp_index);
            }
        }

        // Boundary checks; their relocations are created later, once the
        // fall-through target is known.
        let lower_bound_check = Instr::new(OpCode::BrLt)
            .with_src1(src_opnd.clone())
            .with_src2(Opnd::int32(base_case_value))
            .at_offset(last_case_offset);
        adapter.add_instr(func, lower_bound_check, last_case_offset);

        let upper_bound_check = Instr::new(OpCode::BrGt)
            .with_src1(src_opnd.clone())
            .with_src2(Opnd::int32(last_case_value))
            .at_offset(last_case_offset);
        adapter.add_instr(func, upper_bound_check, last_case_offset);

        // Normalize the switch value into a table index.
        let index_sym = func.new_sym(IRType::Int32);
        let index_opnd = Opnd::reg(index_sym, IRType::Int32);
        let sub = Instr::new(OpCode::Sub)
            .with_dst(index_opnd.clone())
            .with_src1(src_opnd)
            .with_src2(Opnd::int32(base_case_value))
            .at_offset(last_case_offset);
        adapter.add_instr(func, sub, last_case_offset);

        let mut multi_br_instr =
            Instr::new(OpCode::MultiBr).with_src1(index_opnd).at_offset(last_case_offset);
        multi_br_instr.multi_br = Some(Box::new(data));
        let multi_br = adapter.add_instr(func, multi_br_instr, last_case_offset);
        adapter.create_reloc_record(func, multi_br, last_case_offset, target_offset);

        multi_br
    }

    /// Binary search over cases `[start, end]`: branch right when the
    /// switch value is at least the middle case's lower bound, recurse
    /// both halves, linear chains at the leaves.
    fn build_binary_traverse_instr(
        &mut self,
        func: &mut IrFunc,
        adapter: &mut dyn SwitchAdapter,
        start: usize,
        end: usize,
        default_leaf_branch: u32,
    ) {
        if start > end {
            return;
        }

        if end - start <= MAX_LINEAR_INT_CASE_COUNT - 1 {
            self.build_linear_traverse_instr(func, adapter, start, end, default_leaf_branch);
            return;
        }

        let mid = start + (end - start + 1) / 2;
        let mid_lower = self.case_nodes[mid].lower_bound_int_const();
        let mid_offset = self.case_nodes[mid].offset();
        let start_offset = self.case_nodes[start].offset();
        let src1 = self.case_nodes[start].case_instr.src1.clone().expect("case source");

        let branch = Instr::new(OpCode::BrGe)
            .with_src1(src1)
            .with_src2(Opnd::int32(mid_lower))
            .at_offset(start_offset);
        adapter.add_branch_instr(func, branch, start_offset, mid_offset);

        self.build_binary_traverse_instr(func, adapter, start, mid - 1, default_leaf_branch);
        self.build_binary_traverse_instr(func, adapter, mid, end, default_leaf_branch);
    }

    /// Linear chain over cases `[start, end]`.
    fn build_linear_traverse_instr(
        &mut self,
        func: &mut IrFunc,
        adapter: &mut dyn SwitchAdapter,
        start: usize,
        end: usize,
        fall_thr_offset: u32,
    ) {
        debug_assert!(fall_thr_offset != 0);
        for index in start..=end {
            let node = &self.case_nodes[index];

            let single_value = if node.is_upper_bound_int_const() {
                node.lower_bound_int_const() == node.upper_bound_int_const()
            } else {
                // String cases never merge into ranges.
                true
            };

            if single_value {
                let instr = node.case_instr.clone();
                let offset = node.offset();
                let target = node.target_offset();
                adapter.add_branch_instr(func, instr, offset, target);
            } else {
                self.build_empty_cases_instr(func, adapter, index, fall_thr_offset);
            }
        }

        let branch = Instr::new(OpCode::Br).at_offset(NO_BYTE_CODE_OFFSET);
        adapter.add_branch_instr(func, branch, NO_BYTE_CODE_OFFSET, fall_thr_offset);
    }

    /// Range test for a merged run of empty cases:
    /// below the run falls through, at or below its upper bound hits the
    /// shared block.
    fn build_empty_cases_instr(
        &mut self,
        func: &mut IrFunc,
        adapter: &mut dyn SwitchAdapter,
        index: usize,
        fall_thr_offset: u32,
    ) {
        let (src1, offset, target, lower, upper) = {
            let node = &self.case_nodes[index];
            debug_assert!(node.lower_bound() != node.upper_bound());
            (
                node.case_instr.src1.clone().expect("case source"),
                node.offset(),
                node.target_offset(),
                node.lower_bound_int_const(),
                node.upper_bound_int_const(),
            )
        };

        let below = Instr::new(OpCode::BrLt)
            .with_src1(src1.clone())
            .with_src2(Opnd::int32(lower))
            .at_offset(offset);
        adapter.add_branch_instr(func, below, offset, fall_thr_offset);

        let within = Instr::new(OpCode::BrLe)
            .with_src1(src1)
            .with_src2(Opnd::int32(upper))
            .at_offset(offset);
        adapter.add_branch_instr(func, within, offset, target);

        self.build_bail_on_not_integer(func, adapter);
    }

    // ---- string lowering ----

    fn build_multi_br_case_instr_for_strings(
        &mut self,
        func: &mut IrFunc,
        adapter: &mut dyn SwitchAdapter,
        target_offset: u32,
    ) {
        debug_assert!(!self.case_nodes.is_empty());
        debug_assert!(self.profiled_switch_instr.is_some() && !self.is_asm_js);

        if self.case_nodes.len() < MAX_LINEAR_STR_CASE_COUNT {
            let end = self.case_nodes.len() - 1;
            self.build_linear_traverse_instr(func, adapter, 0, end, target_offset);
            self.reset_case_nodes();
            return;
        }

        let src_opnd = self.case_nodes[0].case_instr.src1.clone().expect("case source");
        let last_case_offset = self.case_nodes[self.case_nodes.len() - 1].offset();
        let case_count = self.case_nodes.len() as u32;

        // Either the table is within the absolute limit or it is dense
        // relative to the case count.
        let max_jump_table_size = MAX_SINGLE_CHAR_STR_JUMP_TABLE_SIZE
            .max(MAX_SINGLE_CHAR_STR_JUMP_TABLE_RATIO * case_count);

        let mut generate_dictionary = true;
        let mut min_char = u32::MAX;
        let mut max_char = 0u32;
        if self.seen_only_single_char_str_case_nodes {
            generate_dictionary = false;
            for node in &self.case_nodes {
                let s = node.upper_bound_str_const().expect("string case");
                let c = s.single_char().expect("single-char case") as u32;
                min_char = min_char.min(c);
                max_char = max_char.max(c);
                if max_char - min_char > max_jump_table_size {
                    generate_dictionary = true;
                    break;
                }
            }
        }

        let mut data;
        if generate_dictionary {
            data = MultiBrData::new(MultiBrKind::StrDictionary, target_offset);
            for node in &self.case_nodes {
                let s = node.upper_bound_str_const().expect("string case");
                data.add_to_dictionary(s, node.target_offset());
            }
        } else {
            // Saving fewer than 16 slots is not worth the subtract.
            if min_char < 16 {
                min_char = 0;
            }
            data = MultiBrData::new(MultiBrKind::SingleCharStrJumpTable, target_offset);
            data.base_case_value = min_char as i32;
            data.last_case_value = max_char as i32;
            let table_size = (max_char - min_char + 1) as usize;
            for i in 0..table_size {
                data.add_to_jump_table(target_offset, i);
            }
            for node in &self.case_nodes {
                let s = node.upper_bound_str_const().expect("string case");
                let c = s.single_char().expect("single-char case") as u32;
                data.add_to_jump_table(node.target_offset(), (c - min_char) as usize);
            }
        }

        let mut multi_br_instr =
            Instr::new(OpCode::MultiBr).with_src1(src_opnd).at_offset(last_case_offset);
        multi_br_instr.multi_br = Some(Box::new(data));
        let multi_br = adapter.add_instr(func, multi_br_instr, last_case_offset);
        adapter.create_reloc_record(func, multi_br, last_case_offset, target_offset);

        self.build_bail_on_not_string(func, adapter);
        self.reset_case_nodes();
    }

    // ---- profile guards ----

    fn build_bail_on_not_integer(&mut self, func: &mut IrFunc, adapter: &mut dyn SwitchAdapter) {
        if !self.switch_opt_build_bail {
            return;
        }
        let instr = self.profiled_switch_instr.expect("profiled switch instruction");
        adapter.convert_to_bail_out(func, instr, BailOutKind::ExpectingInteger);
        // One bailout per switch, even if lowering runs again for later
        // case clusters.
        self.switch_opt_build_bail = false;
    }

    fn build_bail_on_not_string(&mut self, func: &mut IrFunc, adapter: &mut dyn SwitchAdapter) {
        if !self.switch_opt_build_bail {
            return;
        }
        let instr = self.profiled_switch_instr.expect("profiled switch instruction");
        adapter.convert_to_bail_out(func, instr, BailOutKind::ExpectingString);
        self.switch_opt_build_bail = false;
    }
}

/// Resolve an operand to a case-label constant, if it is one.
fn case_value_of(func: &IrFunc, opnd: &Opnd) -> Option<CaseValue> {
    if let Some(v) = opnd.as_int32_const() {
        return Some(CaseValue::Int(v));
    }
    if let Some(s) = opnd.as_str_const() {
        return Some(CaseValue::Str(s));
    }
    if let Some(sym_id) = opnd.sym() {
        let sym = func.sym(sym_id);
        if let Some(v) = sym.int_const_value() {
            if let Ok(v) = i32::try_from(v) {
                return Some(CaseValue::Int(v));
            }
        }
        if let Some(s) = sym.str_const_value() {
            return Some(CaseValue::Str(s));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use vesper_core::intern;

    /// Test adapter: appends into the function and records relocations
    /// and bailout conversions on the side.
    struct TestAdapter {
        relocs: Vec<(InstrId, u32)>,
        bailed: Option<(InstrId, BailOutKind)>,
    }

    impl TestAdapter {
        fn new() -> Self {
            TestAdapter { relocs: Vec::new(), bailed: None }
        }

        fn target_of(&self, id: InstrId) -> Option<u32> {
            self.relocs.iter().rev().find(|(i, _)| *i == id).map(|(_, t)| *t)
        }
    }

    impl SwitchAdapter for TestAdapter {
        fn add_branch_instr(
            &mut self,
            func: &mut IrFunc,
            instr: Instr,
            offset: u32,
            target_offset: u32,
        ) -> InstrId {
            let id = func.arena.append(instr);
            self.create_reloc_record(func, id, offset, target_offset);
            id
        }

        fn add_instr(&mut self, func: &mut IrFunc, instr: Instr, _offset: u32) -> InstrId {
            func.arena.append(instr)
        }

        fn create_reloc_record(
            &mut self,
            _func: &mut IrFunc,
            branch: InstrId,
            _offset: u32,
            target_offset: u32,
        ) {
            self.relocs.push((branch, target_offset));
        }

        fn convert_to_bail_out(&mut self, func: &mut IrFunc, instr: InstrId, kind: BailOutKind) {
            func.arena.instr_mut(instr).convert_to_bailout(kind);
            self.bailed = Some((instr, kind));
        }
    }

    fn int_switch(
        cases: &[(i32, u32, u32)],
        default_target: u32,
    ) -> (IrFunc, TestAdapter, Vec<OpCode>) {
        let mut func = IrFunc::new();
        let mut adapter = TestAdapter::new();
        let mut builder = SwitchBuilder::new(false, true);

        let profiled = func.arena.append(Instr::new(OpCode::Ld));
        builder.begin_switch();
        builder.set_profiled_instruction(profiled, SwitchProfile::LikelyTaggedInt);

        let value_sym = func.new_sym(IRType::Var);
        let src1 = Opnd::reg(value_sym, IRType::Var);
        for &(value, offset, target) in cases {
            builder.on_case(&mut func, &mut adapter, src1.clone(), Opnd::int32(value), offset, target);
        }
        builder.end_switch(&mut func, &mut adapter, 90, default_target);

        let ops = func.arena.iter().map(|id| func.arena.instr(id).opcode).collect();
        (func, adapter, ops)
    }

    #[test]
    fn test_small_switch_is_linear() {
        let (_, adapter, ops) = int_switch(&[(1, 10, 100), (2, 20, 200), (100, 30, 300)], 400);
        // Profiled Ld, three equality branches, chain terminator, default.
        assert_eq!(
            ops,
            vec![OpCode::Ld, OpCode::BrEq, OpCode::BrEq, OpCode::BrEq, OpCode::Br, OpCode::Br]
        );
        // No jump table, no binary tree, and no bailout for the linear
        // fallback path.
        assert!(adapter.bailed.is_none());
    }

    #[test]
    fn test_sparse_switch_builds_binary_tree() {
        let cases: Vec<(i32, u32, u32)> =
            (0..8).map(|i| (i * 100, 10 + i as u32, 1000 + i as u32)).collect();
        let (_, adapter, ops) = int_switch(&cases, 4000);
        // Sparse values: no MultiBr, at least one BrGe pivot.
        assert!(!ops.contains(&OpCode::MultiBr));
        assert!(ops.contains(&OpCode::BrGe));
        // The int fast path got its profile guard.
        assert_eq!(adapter.bailed.map(|(_, k)| k), Some(BailOutKind::ExpectingInteger));
    }

    #[test]
    fn test_dense_switch_builds_jump_table() {
        let cases: Vec<(i32, u32, u32)> =
            (0..64).map(|i| (i, 10 + i as u32, 1000 + i as u32)).collect();
        let (func, adapter, ops) = int_switch(&cases, 4000);
        assert!(ops.contains(&OpCode::MultiBr));
        assert!(ops.contains(&OpCode::Sub));
        assert!(ops.contains(&OpCode::BrLt));
        assert!(ops.contains(&OpCode::BrGt));

        let multi_br = func
            .arena
            .iter()
            .find(|&id| func.arena.instr(id).opcode == OpCode::MultiBr)
            .unwrap();
        let data = func.arena.instr(multi_br).multi_br.as_deref().unwrap();
        assert_eq!(data.kind, MultiBrKind::IntJumpTable);
        assert_eq!(data.base_case_value, 0);
        assert_eq!(data.last_case_value, 63);
        assert_eq!(data.targets.len(), 64);
        assert_eq!(data.lookup_int(5), 1005);
        assert_eq!(data.lookup_int(64), 4000);
        assert_eq!(data.lookup_int(-1), 4000);

        // Boundary checks were relocated to the default target.
        let lower = func
            .arena
            .iter()
            .find(|&id| func.arena.instr(id).opcode == OpCode::BrLt)
            .unwrap();
        assert_eq!(adapter.target_of(lower), Some(4000));
    }

    #[test]
    fn test_duplicate_case_emits_nothing() {
        let (_, _, ops) = int_switch(&[(1, 10, 100), (1, 20, 200), (2, 30, 300)], 400);
        // Second `case 1:` is unreachable; only two equality branches.
        assert_eq!(ops.iter().filter(|&&op| op == OpCode::BrEq).count(), 2);
    }

    #[test]
    fn test_empty_case_runs_merge_into_range() {
        // Four consecutive values sharing one block, plus a distinct
        // tail case to exceed the linear threshold.
        let cases =
            [(1, 10, 100), (2, 11, 100), (3, 12, 100), (4, 13, 100), (40, 14, 200)];
        let (_, _, ops) = int_switch(&cases, 400);
        // The run lowers to a range test: BrLt below, BrLe within.
        assert!(ops.contains(&OpCode::BrLt));
        assert!(ops.contains(&OpCode::BrLe));
    }

    #[test]
    fn test_string_switch_dictionary() {
        let mut func = IrFunc::new();
        let mut adapter = TestAdapter::new();
        let mut builder = SwitchBuilder::new(false, true);

        let profiled = func.arena.append(Instr::new(OpCode::Ld));
        builder.begin_switch();
        builder.set_profiled_instruction(profiled, SwitchProfile::LikelyString);

        let value_sym = func.new_sym(IRType::Var);
        let src1 = Opnd::reg(value_sym, IRType::Var);
        let labels = ["alpha", "beta", "gamma", "delta", "epsilon"];
        for (i, label) in labels.iter().enumerate() {
            let src2 = Opnd::StrConst { value: intern(label) };
            builder.on_case(&mut func, &mut adapter, src1.clone(), src2, 10 + i as u32, 100 + i as u32);
        }
        builder.end_switch(&mut func, &mut adapter, 90, 500);

        let multi_br = func
            .arena
            .iter()
            .find(|&id| func.arena.instr(id).opcode == OpCode::MultiBr)
            .expect("dictionary MultiBr");
        let data = func.arena.instr(multi_br).multi_br.as_deref().unwrap();
        assert_eq!(data.kind, MultiBrKind::StrDictionary);
        assert_eq!(data.lookup_str(intern("gamma")), 102);
        assert_eq!(data.lookup_str(intern("zeta")), 500);
        assert_eq!(adapter.bailed.map(|(_, k)| k), Some(BailOutKind::ExpectingString));
    }

    #[test]
    fn test_single_char_string_switch_uses_table() {
        let mut func = IrFunc::new();
        let mut adapter = TestAdapter::new();
        let mut builder = SwitchBuilder::new(false, true);

        let profiled = func.arena.append(Instr::new(OpCode::Ld));
        builder.begin_switch();
        builder.set_profiled_instruction(profiled, SwitchProfile::LikelyString);

        let value_sym = func.new_sym(IRType::Var);
        let src1 = Opnd::reg(value_sym, IRType::Var);
        for (i, label) in ["a", "b", "c", "e"].iter().enumerate() {
            let src2 = Opnd::StrConst { value: intern(label) };
            builder.on_case(&mut func, &mut adapter, src1.clone(), src2, 10 + i as u32, 100 + i as u32);
        }
        builder.end_switch(&mut func, &mut adapter, 90, 500);

        let multi_br = func
            .arena
            .iter()
            .find(|&id| func.arena.instr(id).opcode == OpCode::MultiBr)
            .expect("single-char MultiBr");
        let data = func.arena.instr(multi_br).multi_br.as_deref().unwrap();
        assert_eq!(data.kind, MultiBrKind::SingleCharStrJumpTable);
        // Min char 'a' is under 16 away from 0? No: the min-char slide
        // only fires for chars below 16; 'a' keeps its base.
        assert_eq!(data.lookup_str(intern("b")), 101);
        assert_eq!(data.lookup_str(intern("d")), 500);
        assert_eq!(data.lookup_str(intern("e")), 103);
    }

    #[test]
    fn test_unprofiled_case_flushes_and_falls_back() {
        let mut func = IrFunc::new();
        let mut adapter = TestAdapter::new();
        let mut builder = SwitchBuilder::new(false, true);

        let profiled = func.arena.append(Instr::new(OpCode::Ld));
        builder.begin_switch();
        builder.set_profiled_instruction(profiled, SwitchProfile::Other);

        let value_sym = func.new_sym(IRType::Var);
        let src1 = Opnd::reg(value_sym, IRType::Var);
        builder.on_case(&mut func, &mut adapter, src1.clone(), Opnd::int32(1), 10, 100);
        builder.on_case(&mut func, &mut adapter, src1, Opnd::int32(2), 20, 200);
        builder.end_switch(&mut func, &mut adapter, 90, 400);

        // Plain equality branches, no deferral, no bailout.
        let ops: Vec<OpCode> = func.arena.iter().map(|id| func.arena.instr(id).opcode).collect();
        assert_eq!(ops, vec![OpCode::Ld, OpCode::BrEq, OpCode::BrEq, OpCode::Br]);
        assert!(adapter.bailed.is_none());
    }
}
