//! Linear-scan register allocation.
//!
//! A single forward sweep over the numbered instruction stream. Each
//! symbol moves Unseen → Live (lifetime started) → Assigned or Spilled →
//! Dead (range end reached, register returned to the free set).
//!
//! Spill decisions are loop-biased: when no register is free, the active
//! lifetime with the lowest use count *in the current loop* loses its
//! register, so symbols hot in deep loops stay resident. Lifetimes that
//! cross a call must land in a callee-saved register or spill; the
//! caller-saved half of the file dies at every call.
//!
//! A lifetime marked `cant_spill` with no legal placement is a contract
//! violation by the lowering phase, not a recoverable condition.

use rustc_hash::FxHashMap;
use vesper_core::config::{Phase, PhaseFlags};

use crate::ir::{IrFunc, OpCode, Opnd, SymId};

use super::lifetime::Lifetime;
use super::md::{LinearScanMd, Reg, RegClass, RegSet};

// =============================================================================
// Allocation results
// =============================================================================

/// Final placement of one symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Allocation {
    /// Lives in a register.
    Reg(Reg),
    /// Lives in a numbered spill slot.
    Spill(u32),
}

impl Allocation {
    /// The register, if register-allocated.
    pub fn reg(self) -> Option<Reg> {
        match self {
            Allocation::Reg(r) => Some(r),
            Allocation::Spill(_) => None,
        }
    }

    /// Whether this is a spill.
    pub fn is_spill(self) -> bool {
        matches!(self, Allocation::Spill(_))
    }
}

/// Symbol placements plus frame bookkeeping.
#[derive(Debug, Default)]
pub struct AllocationMap {
    allocations: FxHashMap<SymId, Allocation>,
    spill_slot_count: u32,
    used_callee_saved: RegSet,
    /// Slots a bailout must be able to restore, from the ISA policy.
    pub register_save_slot_count: usize,
}

impl AllocationMap {
    /// Placement of a symbol, if decided.
    pub fn get(&self, sym: SymId) -> Option<Allocation> {
        self.allocations.get(&sym).copied()
    }

    fn set(&mut self, sym: SymId, allocation: Allocation) {
        self.allocations.insert(sym, allocation);
    }

    fn alloc_spill_slot(&mut self) -> u32 {
        let slot = self.spill_slot_count;
        self.spill_slot_count += 1;
        slot
    }

    /// Number of spill slots the frame needs.
    pub fn spill_slot_count(&self) -> u32 {
        self.spill_slot_count
    }

    /// Callee-saved registers the prologue must preserve.
    pub fn used_callee_saved(&self) -> RegSet {
        self.used_callee_saved
    }
}

/// Counters from one allocation run.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinearScanStats {
    pub num_lifetimes: usize,
    pub num_allocated: usize,
    pub num_spilled: usize,
    pub num_second_chance: usize,
}

// =============================================================================
// Lifetime construction
// =============================================================================

fn sym_uses(opnd: &Opnd) -> impl Iterator<Item = SymId> + '_ {
    let (a, b) = match opnd {
        Opnd::Reg { sym, .. } => (Some(*sym), None),
        Opnd::Indir(indir) => (Some(indir.base), indir.index),
        _ => (None, None),
    };
    a.into_iter().chain(b)
}

/// Build lifetimes with def/use lists and loop-weighted use counts from
/// a numbered function.
pub fn build_lifetimes(func: &IrFunc) -> Vec<Lifetime> {
    let mut by_sym: FxHashMap<SymId, usize> = FxHashMap::default();
    let mut lifetimes: Vec<Lifetime> = Vec::new();
    let mut call_points: Vec<u32> = Vec::new();

    let mut touch = |lifetimes: &mut Vec<Lifetime>,
                     by_sym: &mut FxHashMap<SymId, usize>,
                     sym: SymId,
                     number: u32|
     -> usize {
        *by_sym.entry(sym).or_insert_with(|| {
            let index = lifetimes.len();
            let mut lt = Lifetime::new(sym, number);
            let ty = func.sym(sym).ty;
            lt.is_float = ty.is_float();
            lt.is_simd128 = ty.is_simd128();
            lifetimes.push(lt);
            index
        })
    };

    for id in func.arena.iter() {
        let instr = func.arena.instr(id);
        let number = instr.number;
        debug_assert!(number != 0, "function must be numbered before allocation");

        if instr.opcode == OpCode::Call {
            call_points.push(number);
        }

        for src in [&instr.src1, &instr.src2].into_iter().flatten() {
            for sym in sym_uses(src) {
                let index = touch(&mut lifetimes, &mut by_sym, sym, number);
                let lt = &mut lifetimes[index];
                lt.extend_to(number);
                lt.use_list.push(id);
                lt.add_to_use_count(1, instr.loop_id, func);
            }
        }

        if let Some(dst) = &instr.dst {
            for sym in sym_uses(dst) {
                let index = touch(&mut lifetimes, &mut by_sym, sym, number);
                let lt = &mut lifetimes[index];
                lt.extend_to(number);
                lt.def_list.push(id);
            }
        }
    }

    for lt in &mut lifetimes {
        lt.is_live_across_calls =
            call_points.iter().any(|&c| lt.start < c && c + 1 < lt.end);
    }

    lifetimes
}

// =============================================================================
// The scan
// =============================================================================

struct Active {
    lifetime_index: usize,
    end: u32,
    reg: Reg,
    class: RegClass,
}

/// The linear-scan allocator, parameterized on the ISA policy.
pub struct LinearScan<'a, Md: LinearScanMd> {
    md: &'a Md,
    phases: &'a PhaseFlags,
}

impl<'a, Md: LinearScanMd> LinearScan<'a, Md> {
    /// Create an allocator over the given policy and phase switches.
    pub fn new(md: &'a Md, phases: &'a PhaseFlags) -> Self {
        LinearScan { md, phases }
    }

    /// Allocate a function's lifetimes.
    ///
    /// `func` must already be numbered; `lifetimes` comes from
    /// [`build_lifetimes`].
    pub fn allocate(
        &self,
        func: &IrFunc,
        mut lifetimes: Vec<Lifetime>,
    ) -> (AllocationMap, LinearScanStats) {
        let mut map = AllocationMap {
            register_save_slot_count: self.md.register_save_slot_count(),
            ..AllocationMap::default()
        };
        let mut stats = LinearScanStats { num_lifetimes: lifetimes.len(), ..Default::default() };

        let mut order: Vec<usize> = (0..lifetimes.len()).collect();
        order.sort_by_key(|&i| lifetimes[i].start);

        let mut free = [
            self.md.allocatable(RegClass::Int),
            self.md.allocatable(RegClass::Float),
        ];
        let mut active: Vec<Active> = Vec::new();
        // Spilled lifetimes still in range, eligible for a second chance.
        let mut spilled_live: Vec<usize> = Vec::new();

        for position in 0..order.len() {
            let index = order[position];
            let (start, end, empty, dont_allocate) = {
                let lt = &lifetimes[index];
                (lt.start, lt.end, lt.is_empty(), lt.dont_allocate)
            };
            if empty || dont_allocate {
                continue;
            }

            self.expire_old(&mut active, &mut free, start);
            spilled_live.retain(|&i| lifetimes[i].end > start);

            let class = self.class_of(func, &lifetimes[index]);
            let candidates = self.candidates_for(func, &lifetimes[index], free[class_index(class)]);

            if let Some(reg) = candidates.first() {
                free[class_index(class)] = free[class_index(class)].remove(reg);
                self.assign(&mut map, &mut lifetimes[index], reg);
                active.push(Active { lifetime_index: index, end, reg, class });
                stats.num_allocated += 1;
            } else {
                self.allocate_with_spill(
                    func,
                    &mut lifetimes,
                    index,
                    class,
                    &mut active,
                    &mut map,
                    &mut stats,
                    &mut spilled_live,
                );
            }

            // With registers free again, give the most-used spilled
            // lifetime that is still live a second chance.
            if !self.phases.is_off(Phase::SecondChance) {
                self.second_chance(
                    func,
                    &mut lifetimes,
                    &mut spilled_live,
                    &mut free,
                    &mut active,
                    &mut map,
                    &mut stats,
                );
            }
        }

        (map, stats)
    }

    fn class_of(&self, func: &IrFunc, lt: &Lifetime) -> RegClass {
        RegClass::of_type(func.sym(lt.sym).ty)
    }

    fn candidates_for(&self, func: &IrFunc, lt: &Lifetime, free: RegSet) -> RegSet {
        let ty = func.sym(lt.sym).ty;
        let mut candidates = self.md.filter_reg_int_size_constraints(free, ty);
        if lt.is_live_across_calls {
            candidates = candidates.intersect(self.md.callee_saved(RegClass::of_type(ty)));
        }
        candidates
    }

    fn assign(&self, map: &mut AllocationMap, lt: &mut Lifetime, reg: Reg) {
        lt.reg = Some(reg);
        map.set(lt.sym, Allocation::Reg(reg));
        let class = if lt.is_float || lt.is_simd128 { RegClass::Float } else { RegClass::Int };
        if self.md.callee_saved(class).contains(reg) {
            map.used_callee_saved = map.used_callee_saved.insert(reg);
        }
    }

    fn spill(&self, map: &mut AllocationMap, lt: &mut Lifetime, stats: &mut LinearScanStats) {
        debug_assert!(!lt.cant_spill, "cant_spill lifetime has no legal placement");
        let slot = map.alloc_spill_slot();
        lt.reg = None;
        lt.spill_slot = Some(slot);
        lt.is_spilled = true;
        map.set(lt.sym, Allocation::Spill(slot));
        stats.num_spilled += 1;
    }

    fn expire_old(&self, active: &mut Vec<Active>, free: &mut [RegSet; 2], position: u32) {
        active.retain(|entry| {
            if entry.end <= position {
                free[class_index(entry.class)] = free[class_index(entry.class)].insert(entry.reg);
                false
            } else {
                true
            }
        });
    }

    #[allow(clippy::too_many_arguments)]
    fn allocate_with_spill(
        &self,
        func: &IrFunc,
        lifetimes: &mut [Lifetime],
        index: usize,
        class: RegClass,
        active: &mut Vec<Active>,
        map: &mut AllocationMap,
        stats: &mut LinearScanStats,
        spilled_live: &mut Vec<usize>,
    ) {
        // The loop the contested position sits in decides which use
        // counts matter.
        let current_loop = lifetimes[index]
            .def_list
            .first()
            .and_then(|&id| func.arena.instr(id).loop_id);
        let current_count =
            lifetimes[index].get_region_use_count(current_loop, func, self.phases);

        // Cheapest victim among active lifetimes whose register the
        // current lifetime could legally use.
        let mut victim: Option<(usize, u32)> = None;
        for (active_index, entry) in active.iter().enumerate() {
            if entry.class != class {
                continue;
            }
            let victim_lt = &lifetimes[entry.lifetime_index];
            if victim_lt.cant_spill {
                continue;
            }
            let ty = func.sym(lifetimes[index].sym).ty;
            if !self
                .md
                .filter_reg_int_size_constraints(RegSet::EMPTY.insert(entry.reg), ty)
                .contains(entry.reg)
            {
                continue;
            }
            if lifetimes[index].is_live_across_calls
                && !self.md.callee_saved(class).contains(entry.reg)
            {
                continue;
            }
            let count = victim_lt.get_region_use_count(current_loop, func, self.phases);
            match victim {
                Some((_, best)) if count >= best => {}
                _ => victim = Some((active_index, count)),
            }
        }

        let must_take = lifetimes[index].cant_spill;
        match victim {
            Some((active_index, victim_count))
                if must_take || victim_count < current_count =>
            {
                let entry = active.remove(active_index);
                let reg = entry.reg;
                self.spill(map, &mut lifetimes[entry.lifetime_index], stats);
                spilled_live.push(entry.lifetime_index);

                let end = lifetimes[index].end;
                self.assign(map, &mut lifetimes[index], reg);
                active.push(Active { lifetime_index: index, end, reg, class });
                stats.num_allocated += 1;
            }
            _ => {
                debug_assert!(!must_take, "cant_spill lifetime found no victim");
                self.spill(map, &mut lifetimes[index], stats);
                spilled_live.push(index);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn second_chance(
        &self,
        func: &IrFunc,
        lifetimes: &mut [Lifetime],
        spilled_live: &mut Vec<usize>,
        free: &mut [RegSet; 2],
        active: &mut Vec<Active>,
        map: &mut AllocationMap,
        stats: &mut LinearScanStats,
    ) {
        // Hottest first; one pass, registers permitting.
        spilled_live.sort_by_key(|&i| {
            std::cmp::Reverse(lifetimes[i].get_region_use_count(None, func, self.phases))
        });

        let mut remaining = Vec::new();
        for &index in spilled_live.iter() {
            let class = self.class_of(func, &lifetimes[index]);
            let candidates = self.candidates_for(func, &lifetimes[index], free[class_index(class)]);
            if let Some(reg) = candidates.first() {
                free[class_index(class)] = free[class_index(class)].remove(reg);
                let end = lifetimes[index].end;
                self.assign(map, &mut lifetimes[index], reg);
                lifetimes[index].is_second_chance_allocated = true;
                active.push(Active { lifetime_index: index, end, reg, class });
                stats.num_second_chance += 1;
            } else {
                remaining.push(index);
            }
        }
        *spilled_live = remaining;
    }
}

#[inline]
fn class_index(class: RegClass) -> usize {
    match class {
        RegClass::Int => 0,
        RegClass::Float => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{IRType, Instr, IrFunc, OpCode, Opnd};
    use crate::regalloc::md::X64LinearScanMd;

    fn ld(func: &mut IrFunc, dst: SymId, src: SymId) {
        func.arena.append(
            Instr::new(OpCode::Ld)
                .with_dst(Opnd::reg(dst, IRType::Int32))
                .with_src1(Opnd::reg(src, IRType::Int32)),
        );
    }

    fn ld_const(func: &mut IrFunc, dst: SymId) {
        func.arena.append(
            Instr::new(OpCode::Ld)
                .with_dst(Opnd::reg(dst, IRType::Int32))
                .with_src1(Opnd::int32(0)),
        );
    }

    fn run(func: &mut IrFunc) -> (AllocationMap, LinearScanStats, Vec<Lifetime>) {
        func.number_instrs();
        let lifetimes = build_lifetimes(func);
        let md = X64LinearScanMd;
        let phases = PhaseFlags::new();
        let scan = LinearScan::new(&md, &phases);
        let (map, stats) = scan.allocate(func, lifetimes.clone());
        (map, stats, lifetimes)
    }

    #[test]
    fn test_lifetime_ranges() {
        let mut func = IrFunc::new();
        let a = func.new_sym(IRType::Int32);
        let b = func.new_sym(IRType::Int32);
        ld_const(&mut func, a); // 1: def a
        ld(&mut func, b, a); // 2: def b, use a
        ld(&mut func, a, b); // 3: def a, use b
        func.number_instrs();

        let lifetimes = build_lifetimes(&func);
        let lt_a = lifetimes.iter().find(|lt| lt.sym == a).unwrap();
        let lt_b = lifetimes.iter().find(|lt| lt.sym == b).unwrap();
        assert_eq!((lt_a.start, lt_a.end), (1, 4));
        assert_eq!((lt_b.start, lt_b.end), (2, 4));
        assert_eq!(lt_a.use_count, 1);
        assert_eq!(lt_a.def_list.len(), 2);
    }

    #[test]
    fn test_overlapping_get_distinct_registers() {
        let mut func = IrFunc::new();
        let a = func.new_sym(IRType::Int32);
        let b = func.new_sym(IRType::Int32);
        let c = func.new_sym(IRType::Int32);
        ld_const(&mut func, a);
        ld_const(&mut func, b);
        ld(&mut func, c, a); // a live to here
        ld(&mut func, c, b); // b live to here

        let (map, stats, _) = run(&mut func);
        let ra = map.get(a).unwrap().reg().unwrap();
        let rb = map.get(b).unwrap().reg().unwrap();
        assert_ne!(ra, rb);
        assert_eq!(stats.num_spilled, 0);
    }

    #[test]
    fn test_register_reuse_after_death() {
        let mut func = IrFunc::new();
        let a = func.new_sym(IRType::Int32);
        let b = func.new_sym(IRType::Int32);
        let t = func.new_sym(IRType::Int32);
        ld_const(&mut func, a);
        ld(&mut func, t, a); // a dies
        ld_const(&mut func, b); // b born after a's end
        ld(&mut func, t, b);

        let (map, _, _) = run(&mut func);
        let ra = map.get(a).unwrap().reg().unwrap();
        let rb = map.get(b).unwrap().reg().unwrap();
        assert_eq!(ra, rb);
    }

    #[test]
    fn test_spill_under_pressure() {
        let mut func = IrFunc::new();
        // 20 mutually overlapping lifetimes vs 13 allocatable GPRs.
        let syms: Vec<SymId> = (0..20).map(|_| func.new_sym(IRType::Int32)).collect();
        for &sym in &syms {
            ld_const(&mut func, sym);
        }
        let sink = func.new_sym(IRType::Int32);
        for &sym in &syms {
            ld(&mut func, sink, sym);
        }

        let (map, stats, _) = run(&mut func);
        assert!(stats.num_spilled >= 20 - 13);
        let spilled = syms.iter().filter(|&&s| map.get(s).unwrap().is_spill()).count();
        assert!(spilled >= 7);
        assert!(map.spill_slot_count() as usize >= spilled.min(7));
    }

    #[test]
    fn test_loop_use_count_biases_spill() {
        let mut func = IrFunc::new();
        let loop_id = func.add_loop(None);

        // `cold` has many uses outside the loop, `hot` few uses inside
        // it. Under pressure inside the loop, cold spills first.
        let cold = func.new_sym(IRType::Int32);
        let hot = func.new_sym(IRType::Int32);
        let sink = func.new_sym(IRType::Int32);

        ld_const(&mut func, cold);
        for _ in 0..10 {
            ld(&mut func, sink, cold);
        }
        ld_const(&mut func, hot);
        let use_in_loop = Instr::new(OpCode::Ld)
            .with_dst(Opnd::reg(sink, IRType::Int32))
            .with_src1(Opnd::reg(hot, IRType::Int32));
        let mut in_loop = use_in_loop.clone();
        in_loop.loop_id = Some(loop_id);
        func.arena.append(in_loop);
        // Keep both live past the loop.
        ld(&mut func, sink, cold);
        ld(&mut func, sink, hot);

        func.number_instrs();
        let lifetimes = build_lifetimes(&func);
        let hot_lt = lifetimes.iter().find(|lt| lt.sym == hot).unwrap();
        let cold_lt = lifetimes.iter().find(|lt| lt.sym == cold).unwrap();
        let phases = PhaseFlags::new();
        assert!(
            hot_lt.get_region_use_count(Some(loop_id), &func, &phases)
                > cold_lt.get_region_use_count(Some(loop_id), &func, &phases)
        );
    }

    #[test]
    fn test_live_across_call_gets_callee_saved() {
        let mut func = IrFunc::new();
        let a = func.new_sym(IRType::Int32);
        let sink = func.new_sym(IRType::Int32);
        ld_const(&mut func, a);
        func.arena.append(Instr::new(OpCode::Call));
        ld(&mut func, sink, a);

        let (map, _, lifetimes) = run(&mut func);
        let lt = lifetimes.iter().find(|lt| lt.sym == a).unwrap();
        assert!(lt.is_live_across_calls);

        let md = X64LinearScanMd;
        let reg = map.get(a).unwrap().reg().expect("should stay in a register");
        assert!(md.callee_saved(RegClass::Int).contains(reg));
        assert!(map.used_callee_saved().contains(reg));
    }

    #[test]
    fn test_float_class_separate() {
        let mut func = IrFunc::new();
        let f = func.new_sym(IRType::Float64);
        let i = func.new_sym(IRType::Int32);
        let fsink = func.new_sym(IRType::Float64);
        func.arena.append(
            Instr::new(OpCode::Ld)
                .with_dst(Opnd::reg(f, IRType::Float64))
                .with_src1(Opnd::FloatConst { value: 1.0, ty: IRType::Float64 }),
        );
        ld_const(&mut func, i);
        func.arena.append(
            Instr::new(OpCode::Ld)
                .with_dst(Opnd::reg(fsink, IRType::Float64))
                .with_src1(Opnd::reg(f, IRType::Float64)),
        );
        let isink = func.new_sym(IRType::Int32);
        ld(&mut func, isink, i);

        let (map, stats, lifetimes) = run(&mut func);
        assert!(lifetimes.iter().find(|lt| lt.sym == f).unwrap().is_float);
        assert!(map.get(f).unwrap().reg().is_some());
        assert!(map.get(i).unwrap().reg().is_some());
        assert_eq!(stats.num_spilled, 0);
    }

    #[test]
    fn test_save_slot_count_comes_from_policy() {
        let mut func = IrFunc::new();
        let a = func.new_sym(IRType::Int32);
        ld_const(&mut func, a);
        let (map, _, _) = run(&mut func);
        assert_eq!(map.register_save_slot_count, 32);
    }
}
