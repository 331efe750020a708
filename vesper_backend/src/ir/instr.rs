//! Instructions and the per-function instruction arena.
//!
//! Instructions form a doubly-linked list inside an [`InstrArena`]:
//! nodes are arena slots addressed by [`InstrId`], links are ids rather
//! than pointers, and the whole arena is dropped in bulk when the
//! function's compilation ends. Lowering and register allocation splice
//! into the list in place; the encoder walks it front to back.

use smallvec::SmallVec;
use vesper_core::intern::InternedString;

use crate::bailout::BailOutKind;
use super::func::LoopId;
use super::opnd::Opnd;
use super::region::RegionId;

/// Arena id of an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstrId(u32);

impl InstrId {
    /// Raw arena index.
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Machine-independent opcode set manipulated by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    /// Branch target; carries no operands.
    Label,
    /// No operation.
    Nop,
    /// Copy src1 to dst.
    Ld,
    Add,
    Sub,
    Mul,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Sar,
    /// Compare src1 against src2, setting condition codes.
    Cmp,
    /// Unconditional branch.
    Br,
    BrEq,
    BrNeq,
    BrLt,
    BrLe,
    BrGt,
    BrGe,
    /// Branch on string equality (case labels).
    BrStrEq,
    /// Indexed branch through a jump table.
    MultiBr,
    Call,
    Ret,
    /// Unconditional transfer to the interpreter.
    BailOut,
    /// Bail out unless src1 is a tagged int.
    BailOnNotInt,
    /// Bail out unless src1 is a string.
    BailOnNotString,
}

impl OpCode {
    /// Whether this opcode transfers control.
    #[inline]
    pub fn is_branch(self) -> bool {
        matches!(
            self,
            OpCode::Br
                | OpCode::BrEq
                | OpCode::BrNeq
                | OpCode::BrLt
                | OpCode::BrLe
                | OpCode::BrGt
                | OpCode::BrGe
                | OpCode::BrStrEq
                | OpCode::MultiBr
        )
    }

    /// Whether this is a conditional branch.
    #[inline]
    pub fn is_conditional_branch(self) -> bool {
        self.is_branch() && !matches!(self, OpCode::Br | OpCode::MultiBr)
    }

    /// Whether this opcode can bail out to the interpreter.
    #[inline]
    pub fn is_bailout(self) -> bool {
        matches!(self, OpCode::BailOut | OpCode::BailOnNotInt | OpCode::BailOnNotString)
    }
}

/// Shape of a `MultiBr` dispatch structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MultiBrKind {
    /// Dense table indexed by `value - base_case_value`.
    IntJumpTable,
    /// Dense table indexed by the single character of a string.
    SingleCharStrJumpTable,
    /// Dictionary keyed by interned-string identity.
    StrDictionary,
}

/// Branch targets of a `MultiBr`, expressed as byte-code offsets.
///
/// The switch builder fills these in; the IR builder that owns byte-code
/// offset resolution later rewrites them into label ids
/// (`Instr::multi_targets`).
#[derive(Debug, Clone)]
pub struct MultiBrData {
    /// Table shape.
    pub kind: MultiBrKind,
    /// Case value of table slot 0 (or the minimum character).
    pub base_case_value: i32,
    /// Case value of the last table slot (or the maximum character).
    pub last_case_value: i32,
    /// Jump-table slots, as byte-code target offsets.
    pub targets: Vec<u32>,
    /// Dictionary entries, for `StrDictionary`.
    pub dictionary: Vec<(InternedString, u32)>,
    /// Default (fall-through) byte-code offset.
    pub default_target: u32,
}

impl MultiBrData {
    /// Create an empty table of the given shape.
    pub fn new(kind: MultiBrKind, default_target: u32) -> Self {
        MultiBrData {
            kind,
            base_case_value: 0,
            last_case_value: 0,
            targets: Vec::new(),
            dictionary: Vec::new(),
            default_target,
        }
    }

    /// Set table slot `index` to branch to `target_offset`.
    pub fn add_to_jump_table(&mut self, target_offset: u32, index: usize) {
        debug_assert!(self.kind != MultiBrKind::StrDictionary);
        if index >= self.targets.len() {
            self.targets.resize(index + 1, self.default_target);
        }
        self.targets[index] = target_offset;
    }

    /// Add a dictionary entry.
    pub fn add_to_dictionary(&mut self, str_const: InternedString, target_offset: u32) {
        debug_assert!(self.kind == MultiBrKind::StrDictionary);
        self.dictionary.push((str_const, target_offset));
    }

    /// Patch the default target once the fall-through offset is known.
    pub fn fix_default_target(&mut self, target_offset: u32) {
        for slot in &mut self.targets {
            if *slot == self.default_target {
                *slot = target_offset;
            }
        }
        self.default_target = target_offset;
    }

    /// Resolve an int switch value to its target offset.
    pub fn lookup_int(&self, value: i32) -> u32 {
        debug_assert!(self.kind == MultiBrKind::IntJumpTable);
        if value < self.base_case_value || value > self.last_case_value {
            return self.default_target;
        }
        self.targets
            .get((value - self.base_case_value) as usize)
            .copied()
            .unwrap_or(self.default_target)
    }

    /// Resolve a string switch value to its target offset.
    pub fn lookup_str(&self, value: InternedString) -> u32 {
        match self.kind {
            MultiBrKind::StrDictionary => self
                .dictionary
                .iter()
                .find(|(s, _)| *s == value)
                .map(|(_, t)| *t)
                .unwrap_or(self.default_target),
            MultiBrKind::SingleCharStrJumpTable => match value.single_char() {
                Some(c) => {
                    let index = c as i32 - self.base_case_value;
                    if index < 0 {
                        return self.default_target;
                    }
                    self.targets.get(index as usize).copied().unwrap_or(self.default_target)
                }
                None => self.default_target,
            },
            MultiBrKind::IntJumpTable => self.default_target,
        }
    }
}

/// One instruction.
#[derive(Debug, Clone)]
pub struct Instr {
    /// Opcode.
    pub opcode: OpCode,
    /// Destination operand.
    pub dst: Option<Opnd>,
    /// First source operand.
    pub src1: Option<Opnd>,
    /// Second source operand.
    pub src2: Option<Opnd>,
    /// Branch target (label id) for branch opcodes.
    pub target: Option<InstrId>,
    /// Jump-table targets for `MultiBr`, once resolved to labels.
    pub multi_targets: SmallVec<[InstrId; 4]>,
    /// Unresolved jump-table structure for `MultiBr`.
    pub multi_br: Option<Box<MultiBrData>>,
    /// Position assigned by the numbering pass; 0 until numbered.
    pub number: u32,
    /// Byte-code offset this instruction was built from.
    pub byte_code_offset: u32,
    /// Innermost enclosing loop, if any.
    pub loop_id: Option<LoopId>,
    /// Enclosing EH region, if any.
    pub region: Option<RegionId>,
    /// Bailout kind attached by lowering, if this instruction may bail.
    pub bail_out_kind: Option<BailOutKind>,
}

impl Instr {
    /// Create a bare instruction with no operands.
    pub fn new(opcode: OpCode) -> Self {
        Instr {
            opcode,
            dst: None,
            src1: None,
            src2: None,
            target: None,
            multi_targets: SmallVec::new(),
            multi_br: None,
            number: 0,
            byte_code_offset: 0,
            loop_id: None,
            region: None,
            bail_out_kind: None,
        }
    }

    /// Builder-style destination.
    pub fn with_dst(mut self, dst: Opnd) -> Self {
        self.dst = Some(dst);
        self
    }

    /// Builder-style first source.
    pub fn with_src1(mut self, src1: Opnd) -> Self {
        self.src1 = Some(src1);
        self
    }

    /// Builder-style second source.
    pub fn with_src2(mut self, src2: Opnd) -> Self {
        self.src2 = Some(src2);
        self
    }

    /// Builder-style branch target.
    pub fn with_target(mut self, target: InstrId) -> Self {
        debug_assert!(self.opcode.is_branch());
        self.target = Some(target);
        self
    }

    /// Builder-style byte-code offset.
    pub fn at_offset(mut self, offset: u32) -> Self {
        self.byte_code_offset = offset;
        self
    }

    /// Convert this instruction into a bailout of the given kind,
    /// dropping any speculative fast-path operands.
    pub fn convert_to_bailout(&mut self, kind: BailOutKind) {
        self.opcode = OpCode::BailOut;
        self.bail_out_kind = Some(kind);
        self.dst = None;
        self.target = None;
        self.multi_targets.clear();
        self.multi_br = None;
    }
}

struct InstrNode {
    instr: Instr,
    prev: Option<InstrId>,
    next: Option<InstrId>,
}

/// Arena-backed doubly-linked instruction list.
#[derive(Default)]
pub struct InstrArena {
    nodes: Vec<InstrNode>,
    head: Option<InstrId>,
    tail: Option<InstrId>,
}

impl InstrArena {
    /// Create an empty arena.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of instructions ever allocated (removals do not shrink).
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the list is empty.
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// First instruction in program order.
    pub fn head(&self) -> Option<InstrId> {
        self.head
    }

    /// Last instruction in program order.
    pub fn tail(&self) -> Option<InstrId> {
        self.tail
    }

    fn alloc(&mut self, instr: Instr) -> InstrId {
        let id = InstrId(self.nodes.len() as u32);
        self.nodes.push(InstrNode { instr, prev: None, next: None });
        id
    }

    /// Allocate an instruction without linking it into the list.
    ///
    /// Used for labels that must exist (as branch targets) before their
    /// position is known.
    pub fn alloc_detached(&mut self, instr: Instr) -> InstrId {
        self.alloc(instr)
    }

    /// Append an instruction at the end of the list.
    pub fn append(&mut self, instr: Instr) -> InstrId {
        let id = self.alloc(instr);
        self.link_last(id);
        id
    }

    /// Link a previously detached instruction at the end of the list.
    pub fn append_detached(&mut self, id: InstrId) {
        debug_assert!(self.nodes[id.index()].prev.is_none());
        debug_assert!(self.nodes[id.index()].next.is_none());
        debug_assert!(self.head != Some(id));
        self.link_last(id);
    }

    fn link_last(&mut self, id: InstrId) {
        match self.tail {
            Some(tail) => {
                self.nodes[tail.index()].next = Some(id);
                self.nodes[id.index()].prev = Some(tail);
                self.tail = Some(id);
            }
            None => {
                self.head = Some(id);
                self.tail = Some(id);
            }
        }
    }

    /// Insert a new instruction after `pos`.
    pub fn insert_after(&mut self, pos: InstrId, instr: Instr) -> InstrId {
        let id = self.alloc(instr);
        let next = self.nodes[pos.index()].next;
        self.nodes[id.index()].prev = Some(pos);
        self.nodes[id.index()].next = next;
        self.nodes[pos.index()].next = Some(id);
        match next {
            Some(next) => self.nodes[next.index()].prev = Some(id),
            None => self.tail = Some(id),
        }
        id
    }

    /// Insert a new instruction before `pos`.
    pub fn insert_before(&mut self, pos: InstrId, instr: Instr) -> InstrId {
        let id = self.alloc(instr);
        let prev = self.nodes[pos.index()].prev;
        self.nodes[id.index()].next = Some(pos);
        self.nodes[id.index()].prev = prev;
        self.nodes[pos.index()].prev = Some(id);
        match prev {
            Some(prev) => self.nodes[prev.index()].next = Some(id),
            None => self.head = Some(id),
        }
        id
    }

    /// Unlink an instruction from the list. The slot stays allocated.
    pub fn remove(&mut self, id: InstrId) {
        let (prev, next) = {
            let node = &self.nodes[id.index()];
            (node.prev, node.next)
        };
        match prev {
            Some(prev) => self.nodes[prev.index()].next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => self.nodes[next.index()].prev = prev,
            None => self.tail = prev,
        }
        self.nodes[id.index()].prev = None;
        self.nodes[id.index()].next = None;
    }

    /// Borrow an instruction.
    #[inline]
    pub fn instr(&self, id: InstrId) -> &Instr {
        &self.nodes[id.index()].instr
    }

    /// Mutably borrow an instruction.
    #[inline]
    pub fn instr_mut(&mut self, id: InstrId) -> &mut Instr {
        &mut self.nodes[id.index()].instr
    }

    /// Id of the instruction after `id` in program order.
    #[inline]
    pub fn next(&self, id: InstrId) -> Option<InstrId> {
        self.nodes[id.index()].next
    }

    /// Id of the instruction before `id` in program order.
    #[inline]
    pub fn prev(&self, id: InstrId) -> Option<InstrId> {
        self.nodes[id.index()].prev
    }

    /// Iterate ids in program order.
    pub fn iter(&self) -> InstrIter<'_> {
        InstrIter { arena: self, cur: self.head }
    }
}

/// Program-order id iterator.
pub struct InstrIter<'a> {
    arena: &'a InstrArena,
    cur: Option<InstrId>,
}

impl Iterator for InstrIter<'_> {
    type Item = InstrId;

    fn next(&mut self) -> Option<InstrId> {
        let id = self.cur?;
        self.cur = self.arena.next(id);
        Some(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opcodes(arena: &InstrArena) -> Vec<OpCode> {
        arena.iter().map(|id| arena.instr(id).opcode).collect()
    }

    #[test]
    fn test_append_order() {
        let mut arena = InstrArena::new();
        arena.append(Instr::new(OpCode::Label));
        arena.append(Instr::new(OpCode::Ld));
        arena.append(Instr::new(OpCode::Ret));
        assert_eq!(opcodes(&arena), vec![OpCode::Label, OpCode::Ld, OpCode::Ret]);
    }

    #[test]
    fn test_insert_before_after() {
        let mut arena = InstrArena::new();
        let first = arena.append(Instr::new(OpCode::Label));
        let last = arena.append(Instr::new(OpCode::Ret));
        arena.insert_after(first, Instr::new(OpCode::Ld));
        arena.insert_before(last, Instr::new(OpCode::Add));
        assert_eq!(opcodes(&arena), vec![OpCode::Label, OpCode::Ld, OpCode::Add, OpCode::Ret]);
    }

    #[test]
    fn test_remove() {
        let mut arena = InstrArena::new();
        let a = arena.append(Instr::new(OpCode::Label));
        let b = arena.append(Instr::new(OpCode::Ld));
        let c = arena.append(Instr::new(OpCode::Ret));
        arena.remove(b);
        assert_eq!(opcodes(&arena), vec![OpCode::Label, OpCode::Ret]);
        arena.remove(a);
        arena.remove(c);
        assert!(arena.is_empty());
    }

    #[test]
    fn test_detached_label() {
        let mut arena = InstrArena::new();
        let label = arena.alloc_detached(Instr::new(OpCode::Label));
        let br = Instr::new(OpCode::Br).with_target(label);
        arena.append(br);
        arena.append_detached(label);
        assert_eq!(opcodes(&arena), vec![OpCode::Br, OpCode::Label]);
        let head = arena.head().unwrap();
        assert_eq!(arena.instr(head).target, Some(label));
    }

    #[test]
    fn test_convert_to_bailout() {
        let mut instr = Instr::new(OpCode::MultiBr);
        instr.multi_targets.push(InstrId(0));
        instr.convert_to_bailout(BailOutKind::IntOnly);
        assert_eq!(instr.opcode, OpCode::BailOut);
        assert_eq!(instr.bail_out_kind, Some(BailOutKind::IntOnly));
        assert!(instr.multi_targets.is_empty());
    }
}
