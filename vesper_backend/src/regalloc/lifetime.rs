//! Lifetimes.
//!
//! One [`Lifetime`] exists per register-candidate stack symbol, covering
//! the half-open instruction-number range `[start, end)` and carrying the
//! bookkeeping the scan's spill heuristics need: def/use lists, flat and
//! per-loop use counts, and the speculative "adjust" counters used when
//! second-chance allocation tentatively re-evaluates a region.
//!
//! Use counts are loop-weighted through the loop-parent chain: a use
//! inside a loop increments the count of every enclosing loop, so the
//! spill heuristic can see how expensive a symbol is *within the loop
//! currently being allocated*, not just globally.

use smallvec::SmallVec;
use vesper_core::config::{Phase, PhaseFlags};

use crate::ir::{InstrId, IrFunc, LoopId, SymId};

use super::md::Reg;

/// Live range and allocation state of one symbol.
#[derive(Debug, Clone)]
pub struct Lifetime {
    /// The symbol this lifetime belongs to.
    pub sym: SymId,
    /// First instruction number at which the symbol is live.
    pub start: u32,
    /// Instruction number past the last use.
    pub end: u32,
    /// Defining instructions.
    pub def_list: SmallVec<[InstrId; 4]>,
    /// Using instructions.
    pub use_list: SmallVec<[InstrId; 4]>,
    /// Flat use count.
    pub use_count: u32,
    /// Pending speculative increments, reconciled by
    /// [`Lifetime::apply_use_count_adjust`].
    pub use_count_adjust: u32,
    region_use_count: Option<Vec<u32>>,
    region_use_count_adjust: Option<Vec<u32>>,
    /// Assigned register, while Live.
    pub reg: Option<Reg>,
    /// Assigned spill slot, if spilled.
    pub spill_slot: Option<u32>,
    /// Whether the lifetime has been spilled.
    pub is_spilled: bool,
    /// The range crosses a call instruction.
    pub is_live_across_calls: bool,
    /// The symbol holds a float.
    pub is_float: bool,
    /// The symbol holds a SIMD vector.
    pub is_simd128: bool,
    /// Spilling this lifetime is illegal; upstream lowering guarantees a
    /// register placement exists.
    pub cant_spill: bool,
    /// Never allocate a register (symbol lives in memory).
    pub dont_allocate: bool,
    /// Re-allocated after an earlier spill.
    pub is_second_chance_allocated: bool,
    /// Spilling costs only the store (value is rematerializable).
    pub is_cheap_spill: bool,
}

impl Lifetime {
    /// Create a lifetime starting at `start`.
    pub fn new(sym: SymId, start: u32) -> Self {
        Lifetime {
            sym,
            start,
            end: start,
            def_list: SmallVec::new(),
            use_list: SmallVec::new(),
            use_count: 0,
            use_count_adjust: 0,
            region_use_count: None,
            region_use_count_adjust: None,
            reg: None,
            spill_slot: None,
            is_spilled: false,
            is_live_across_calls: false,
            is_float: false,
            is_simd128: false,
            cant_spill: false,
            dont_allocate: false,
            is_second_chance_allocated: false,
            is_cheap_spill: false,
        }
    }

    fn ensure_region_counts(&mut self, func: &IrFunc) {
        if self.region_use_count.is_none() {
            self.region_use_count = Some(vec![0; func.loop_count() + 1]);
            self.region_use_count_adjust = Some(vec![0; func.loop_count() + 1]);
        }
    }

    /// Add `amount` uses, attributed to `loop_id` and all its ancestors.
    pub fn add_to_use_count(&mut self, amount: u32, loop_id: Option<LoopId>, func: &IrFunc) {
        debug_assert!(self.use_count.checked_add(amount).is_some());
        self.use_count += amount;

        if let Some(leaf) = loop_id {
            self.ensure_region_counts(func);
            let counts = self.region_use_count.as_mut().expect("region counts allocated");
            for ancestor in func.loop_chain(leaf) {
                counts[func.loop_at(ancestor).number as usize] += amount;
            }
        }
    }

    /// Remove `amount` uses along the same chain.
    pub fn sub_from_use_count(&mut self, amount: u32, loop_id: Option<LoopId>, func: &IrFunc) {
        debug_assert!(self.use_count >= amount);
        self.use_count -= amount;

        debug_assert!(loop_id.is_none() || self.region_use_count.is_some());
        if let Some(leaf) = loop_id {
            if let Some(counts) = self.region_use_count.as_mut() {
                for ancestor in func.loop_chain(leaf) {
                    let slot = &mut counts[func.loop_at(ancestor).number as usize];
                    debug_assert!(*slot >= amount);
                    *slot -= amount;
                }
            }
        }
    }

    /// Use count attributed to `loop_id`, or the flat count when no loop
    /// is given or loop tracking is phase-disabled.
    pub fn get_region_use_count(
        &self,
        loop_id: Option<LoopId>,
        func: &IrFunc,
        phases: &PhaseFlags,
    ) -> u32 {
        if let Some(loop_id) = loop_id {
            if !phases.is_off(Phase::RegionUseCount) {
                return match &self.region_use_count {
                    Some(counts) => counts[func.loop_at(loop_id).number as usize],
                    None => 0,
                };
            }
        }
        self.use_count
    }

    /// Speculatively add uses while a region is tentatively re-evaluated.
    pub fn add_to_use_count_adjust(&mut self, amount: u32, loop_id: Option<LoopId>, func: &IrFunc) {
        debug_assert!(self.use_count_adjust.checked_add(amount).is_some());
        self.use_count_adjust += amount;

        if let Some(leaf) = loop_id {
            self.ensure_region_counts(func);
            let adjusts = self.region_use_count_adjust.as_mut().expect("region counts allocated");
            for ancestor in func.loop_chain(leaf) {
                adjusts[func.loop_at(ancestor).number as usize] += amount;
            }
        }
    }

    /// Reconcile speculative increments back into the authoritative
    /// counts. Idempotent: the adjust counters zero out, so a second call
    /// is a no-op.
    pub fn apply_use_count_adjust(&mut self, loop_id: Option<LoopId>, func: &IrFunc) {
        debug_assert!(self.use_count >= self.use_count_adjust);
        self.use_count -= self.use_count_adjust;
        self.use_count_adjust = 0;

        if loop_id.is_some() && self.region_use_count.is_some() {
            let counts = self.region_use_count.as_mut().expect("region counts allocated");
            let adjusts = self.region_use_count_adjust.as_mut().expect("region counts allocated");
            for ancestor in func.loop_chain(loop_id.expect("checked above")) {
                let number = func.loop_at(ancestor).number as usize;
                debug_assert!(counts[number] >= adjusts[number]);
                counts[number] -= adjusts[number];
                adjusts[number] = 0;
            }
        }
    }

    /// Extend the range to cover a use at `instr_number`.
    pub fn extend_to(&mut self, instr_number: u32) {
        if instr_number >= self.end {
            self.end = instr_number + 1;
        }
        if instr_number < self.start {
            self.start = instr_number;
        }
    }

    /// Whether the lifetime is live at `instr_number`.
    #[inline]
    pub fn contains(&self, instr_number: u32) -> bool {
        self.start <= instr_number && instr_number < self.end
    }

    /// Whether the range is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }
}
