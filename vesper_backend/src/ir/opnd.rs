//! Operand variants.
//!
//! An [`Opnd`] is a tagged variant over everything an instruction can
//! name: a register-candidate symbol, a stack home, integer/float/address
//! constants, an indirect memory reference, a branch target, or a
//! multi-branch jump table. Every value-producing operand carries an
//! [`IRType`]; width mismatches between an operand's type and the
//! operation applied to it are upstream bugs, checked here only by debug
//! assertions.

use smallvec::SmallVec;
use vesper_core::intern::InternedString;

use super::instr::InstrId;
use super::types::IRType;
use super::func::SymId;

/// Indirect memory reference: `[base + index * scale + offset]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndirOpnd {
    /// Base address symbol.
    pub base: SymId,
    /// Optional index symbol.
    pub index: Option<SymId>,
    /// Scale applied to the index (1, 2, 4, or 8).
    pub scale: u8,
    /// Constant displacement.
    pub offset: i32,
    /// Type of the value at the address.
    pub ty: IRType,
}

/// An instruction operand.
#[derive(Debug, Clone, PartialEq)]
pub enum Opnd {
    /// Register-candidate symbol.
    Reg { sym: SymId, ty: IRType },
    /// Symbol addressed through its stack home.
    SymStack { sym: SymId, ty: IRType },
    /// Integer constant.
    IntConst { value: i64, ty: IRType },
    /// Floating-point constant.
    FloatConst { value: f64, ty: IRType },
    /// Address constant (helper entry points, runtime addresses).
    AddrConst { value: u64, ty: IRType },
    /// Interned string constant (switch case labels).
    StrConst { value: InternedString },
    /// Indirect memory reference.
    Indir(IndirOpnd),
    /// Branch target label.
    Label(InstrId),
    /// Multi-branch jump table of targets.
    MultiBr(SmallVec<[InstrId; 4]>),
}

impl Opnd {
    /// Create a register operand.
    #[inline]
    pub fn reg(sym: SymId, ty: IRType) -> Self {
        debug_assert!(ty.is_reg_allocatable());
        Opnd::Reg { sym, ty }
    }

    /// Create an int32 constant operand.
    #[inline]
    pub fn int32(value: i32) -> Self {
        Opnd::IntConst { value: value as i64, ty: IRType::Int32 }
    }

    /// Create an integer constant of an explicit type.
    #[inline]
    pub fn int_const(value: i64, ty: IRType) -> Self {
        debug_assert!(ty.is_int());
        Opnd::IntConst { value, ty }
    }

    /// The operand's declared type.
    pub fn ty(&self) -> IRType {
        match self {
            Opnd::Reg { ty, .. }
            | Opnd::SymStack { ty, .. }
            | Opnd::IntConst { ty, .. }
            | Opnd::FloatConst { ty, .. }
            | Opnd::AddrConst { ty, .. } => *ty,
            Opnd::Indir(indir) => indir.ty,
            Opnd::StrConst { .. } => IRType::Var,
            Opnd::Label(_) | Opnd::MultiBr(_) => IRType::Illegal,
        }
    }

    /// The symbol this operand reads or writes, if any.
    pub fn sym(&self) -> Option<SymId> {
        match self {
            Opnd::Reg { sym, .. } | Opnd::SymStack { sym, .. } => Some(*sym),
            _ => None,
        }
    }

    /// Whether this is an integer constant.
    #[inline]
    pub fn is_int_const(&self) -> bool {
        matches!(self, Opnd::IntConst { .. })
    }

    /// Whether this is a string constant.
    #[inline]
    pub fn is_str_const(&self) -> bool {
        matches!(self, Opnd::StrConst { .. })
    }

    /// Integer constant payload, if this is one.
    pub fn as_int_const(&self) -> Option<i64> {
        match self {
            Opnd::IntConst { value, .. } => Some(*value),
            _ => None,
        }
    }

    /// Int32 constant payload, if this is an int32-typed constant.
    pub fn as_int32_const(&self) -> Option<i32> {
        match self {
            Opnd::IntConst { value, ty: IRType::Int32 } => Some(*value as i32),
            _ => None,
        }
    }

    /// String constant payload, if this is one.
    pub fn as_str_const(&self) -> Option<InternedString> {
        match self {
            Opnd::StrConst { value } => Some(*value),
            _ => None,
        }
    }

    /// Branch-target payload, if this is a label operand.
    pub fn as_label(&self) -> Option<InstrId> {
        match self {
            Opnd::Label(id) => Some(*id),
            _ => None,
        }
    }
}
