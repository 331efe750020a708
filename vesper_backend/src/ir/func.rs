//! Per-function compilation container.
//!
//! An [`IrFunc`] owns everything with function-compile lifetime: the
//! instruction arena, the stack-symbol table, the loop tree, and the EH
//! region table. It is created when a work item is dispatched and dropped
//! in bulk when codegen for that function finishes.

use vesper_core::intern::InternedString;

use super::instr::{Instr, InstrArena, InstrId, OpCode};
use super::region::{Region, RegionId, RegionKind};
use super::types::IRType;

/// Id of a stack symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SymId(u32);

impl SymId {
    /// Raw table index.
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Id of a loop in the loop tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LoopId(u32);

impl LoopId {
    /// Raw table index.
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Constant value bound to a single-def symbol.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SymConst {
    Int(i64),
    Float(f64),
    Str(InternedString),
    Addr(u64),
}

/// A stack symbol: a virtual register or spillable local.
#[derive(Debug, Clone)]
pub struct StackSym {
    /// Id of this symbol.
    pub id: SymId,
    /// Declared type.
    pub ty: IRType,
    /// Known constant value, for single-def constant symbols.
    pub const_value: Option<SymConst>,
    /// Assigned stack home (byte offset from frame base), once allocated.
    pub home_offset: Option<i32>,
    /// Whether this symbol has exactly one definition.
    pub is_single_def: bool,
}

impl StackSym {
    /// Whether the symbol is bound to an integer constant.
    pub fn is_int_const(&self) -> bool {
        matches!(self.const_value, Some(SymConst::Int(_)))
    }

    /// Whether the symbol is bound to a string constant.
    pub fn is_str_const(&self) -> bool {
        matches!(self.const_value, Some(SymConst::Str(_)))
    }

    /// Integer constant payload.
    pub fn int_const_value(&self) -> Option<i64> {
        match self.const_value {
            Some(SymConst::Int(v)) => Some(v),
            _ => None,
        }
    }

    /// String constant payload.
    pub fn str_const_value(&self) -> Option<InternedString> {
        match self.const_value {
            Some(SymConst::Str(s)) => Some(s),
            _ => None,
        }
    }
}

/// A node in the loop tree.
#[derive(Debug, Clone)]
pub struct Loop {
    /// Dense loop number, used to index per-loop use counts.
    pub number: u32,
    /// Enclosing loop.
    pub parent: Option<LoopId>,
}

/// The per-function compilation state.
pub struct IrFunc {
    /// Instruction list.
    pub arena: InstrArena,
    syms: Vec<StackSym>,
    loops: Vec<Loop>,
    regions: Vec<Region>,
    next_instr_number: u32,
}

impl IrFunc {
    /// Create an empty function.
    pub fn new() -> Self {
        IrFunc {
            arena: InstrArena::new(),
            syms: Vec::new(),
            loops: Vec::new(),
            regions: Vec::new(),
            next_instr_number: 1,
        }
    }

    // ---- symbols ----

    /// Allocate a new symbol of the given type.
    pub fn new_sym(&mut self, ty: IRType) -> SymId {
        let id = SymId(self.syms.len() as u32);
        self.syms.push(StackSym {
            id,
            ty,
            const_value: None,
            home_offset: None,
            is_single_def: false,
        });
        id
    }

    /// Allocate a single-def symbol bound to a constant.
    pub fn new_const_sym(&mut self, ty: IRType, value: SymConst) -> SymId {
        let id = self.new_sym(ty);
        let sym = &mut self.syms[id.index()];
        sym.const_value = Some(value);
        sym.is_single_def = true;
        id
    }

    /// Borrow a symbol.
    #[inline]
    pub fn sym(&self, id: SymId) -> &StackSym {
        &self.syms[id.index()]
    }

    /// Mutably borrow a symbol.
    #[inline]
    pub fn sym_mut(&mut self, id: SymId) -> &mut StackSym {
        &mut self.syms[id.index()]
    }

    /// Number of symbols.
    pub fn sym_count(&self) -> usize {
        self.syms.len()
    }

    // ---- loops ----

    /// Add a loop under `parent`.
    pub fn add_loop(&mut self, parent: Option<LoopId>) -> LoopId {
        let id = LoopId(self.loops.len() as u32);
        self.loops.push(Loop { number: id.0, parent });
        id
    }

    /// Borrow a loop.
    #[inline]
    pub fn loop_at(&self, id: LoopId) -> &Loop {
        &self.loops[id.index()]
    }

    /// Number of loops (loop numbers are `0..loop_count`).
    pub fn loop_count(&self) -> usize {
        self.loops.len()
    }

    /// Iterate a loop's ancestor chain, innermost first, self included.
    pub fn loop_chain(&self, id: LoopId) -> LoopChain<'_> {
        LoopChain { func: self, cur: Some(id) }
    }

    // ---- regions ----

    /// Create a new EH region under `parent`.
    pub fn new_region(&mut self, kind: RegionKind, parent: Option<RegionId>) -> RegionId {
        let id = RegionId::new(self.regions.len() as u32);
        self.regions.push(Region::new(id, kind, parent));
        id
    }

    /// Borrow a region.
    #[inline]
    pub fn region(&self, id: RegionId) -> &Region {
        &self.regions[id.index()]
    }

    /// Mutably borrow a region.
    #[inline]
    pub fn region_mut(&mut self, id: RegionId) -> &mut Region {
        &mut self.regions[id.index()]
    }

    /// Self if `id` is a try region, else the nearest try ancestor.
    pub fn self_or_first_try_ancestor(&self, id: RegionId) -> Option<RegionId> {
        let mut cur = Some(id);
        while let Some(region_id) = cur {
            let region = self.region(region_id);
            if region.kind == RegionKind::Try {
                return Some(region_id);
            }
            cur = region.parent;
        }
        None
    }

    // ---- numbering ----

    /// Assign sequential instruction numbers in program order.
    ///
    /// Register allocation's live ranges are expressed in these numbers,
    /// so the pass must run after the last structural IR change.
    pub fn number_instrs(&mut self) {
        let ids: Vec<InstrId> = self.arena.iter().collect();
        for id in ids {
            let number = self.next_instr_number;
            self.next_instr_number += 1;
            self.arena.instr_mut(id).number = number;
        }
    }

    /// Append a convenience label instruction.
    pub fn append_label(&mut self) -> InstrId {
        self.arena.append(Instr::new(OpCode::Label))
    }
}

impl Default for IrFunc {
    fn default() -> Self {
        Self::new()
    }
}

/// Iterator over a loop's ancestor chain.
pub struct LoopChain<'a> {
    func: &'a IrFunc,
    cur: Option<LoopId>,
}

impl Iterator for LoopChain<'_> {
    type Item = LoopId;

    fn next(&mut self) -> Option<LoopId> {
        let id = self.cur?;
        self.cur = self.func.loop_at(id).parent;
        Some(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sym_table() {
        let mut func = IrFunc::new();
        let a = func.new_sym(IRType::Int32);
        let b = func.new_const_sym(IRType::Int32, SymConst::Int(7));
        assert_ne!(a, b);
        assert!(!func.sym(a).is_int_const());
        assert!(func.sym(b).is_int_const());
        assert_eq!(func.sym(b).int_const_value(), Some(7));
        assert!(func.sym(b).is_single_def);
    }

    #[test]
    fn test_loop_chain() {
        let mut func = IrFunc::new();
        let outer = func.add_loop(None);
        let mid = func.add_loop(Some(outer));
        let inner = func.add_loop(Some(mid));
        let chain: Vec<u32> = func.loop_chain(inner).map(|l| func.loop_at(l).number).collect();
        assert_eq!(chain, vec![2, 1, 0]);
    }

    #[test]
    fn test_numbering() {
        let mut func = IrFunc::new();
        func.arena.append(Instr::new(OpCode::Label));
        func.arena.append(Instr::new(OpCode::Ld));
        func.arena.append(Instr::new(OpCode::Ret));
        func.number_instrs();
        let numbers: Vec<u32> = func.arena.iter().map(|id| func.arena.instr(id).number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
    }

    #[test]
    fn test_first_try_ancestor() {
        let mut func = IrFunc::new();
        let root = func.new_region(RegionKind::Root, None);
        let try_region = func.new_region(RegionKind::Try, Some(root));
        let catch_region = func.new_region(RegionKind::Catch, Some(try_region));
        assert_eq!(func.self_or_first_try_ancestor(try_region), Some(try_region));
        assert_eq!(func.self_or_first_try_ancestor(catch_region), Some(try_region));
        assert_eq!(func.self_or_first_try_ancestor(root), None);
    }
}
