//! Bailout metadata and inlinee frame reconstruction.
//!
//! A bailout abandons JIT code mid-execution and resumes in the
//! interpreter. The hard part is inlining: an inlined callee never had a
//! real stack frame, so the metadata here records, per inlined call, where
//! each argument lives (register, stack slot, or compile-time constant)
//! and [`InlineeFrameRecord::restore_frames`] synthesizes the frames the
//! interpreter expects to see.
//!
//! Restoration must reproduce the exact tagged [`Var`] bit patterns the
//! interpreter would have produced itself; a mismatch silently corrupts
//! interpreted execution afterwards, which is why every location carries
//! its raw representation ([`RawRepr`]) and conversion goes through the
//! one shared `Var` encoding.

use smallvec::SmallVec;
use vesper_core::Var;

use crate::ir::IRType;

// =============================================================================
// BailOutKind
// =============================================================================

/// Why JIT code had to give up on its speculative assumptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BailOutKind {
    /// Speculated int arithmetic saw a non-int or overflow.
    IntOnly,
    /// Speculated float arithmetic saw a non-number.
    NumberOnly,
    /// A switch optimized for integers saw a non-integer expression.
    ExpectingInteger,
    /// A switch optimized for strings saw a non-string expression.
    ExpectingString,
    /// A helper made an implicit call the optimizer assumed away.
    OnImplicitCalls,
    /// A value assumed primitive was an object.
    OnNotPrimitive,
    /// An inline cache or constructor-cache guard failed.
    OnEquivalentTypeCheck,
    /// Generic, non-speculative bailout.
    Shared,
}

// =============================================================================
// BailoutConstantValue
// =============================================================================

/// A constant captured at JIT time, tagged by its [`IRType`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BailoutConstantValue {
    /// Integer constant of a signed int type.
    Int { value: i64, ty: IRType },
    /// Float64 constant.
    Float(f64),
    /// Already-encoded runtime value.
    Var(Var),
}

impl BailoutConstantValue {
    /// Capture an int32 constant.
    #[inline]
    pub fn from_int32(value: i32) -> Self {
        BailoutConstantValue::Int { value: value as i64, ty: IRType::Int32 }
    }

    /// Capture an integer constant of an explicit signed type.
    #[inline]
    pub fn from_int(value: i64, ty: IRType) -> Self {
        debug_assert!(ty.is_signed_int());
        BailoutConstantValue::Int { value, ty }
    }

    /// Capture a float constant.
    #[inline]
    pub fn from_float64(value: f64) -> Self {
        BailoutConstantValue::Float(value)
    }

    /// Capture an already-tagged value.
    #[inline]
    pub fn from_var(value: Var) -> Self {
        BailoutConstantValue::Var(value)
    }

    /// The IRType tag of this constant.
    pub fn ty(&self) -> IRType {
        match self {
            BailoutConstantValue::Int { ty, .. } => *ty,
            BailoutConstantValue::Float(_) => IRType::Float64,
            BailoutConstantValue::Var(_) => IRType::Var,
        }
    }

    /// Produce the runtime `Var` the interpreter would have had.
    pub fn to_var(&self) -> Var {
        match *self {
            BailoutConstantValue::Int { value, .. } => {
                if let Ok(small) = i32::try_from(value) {
                    Var::from_int32(small)
                } else {
                    // Out-of-range ints exist as numbers at runtime.
                    Var::from_float64(value as f64)
                }
            }
            BailoutConstantValue::Float(value) => Var::from_float64(value),
            BailoutConstantValue::Var(value) => value,
        }
    }

    /// Tag-and-payload equality.
    pub fn is_equal(&self, other: &BailoutConstantValue) -> bool {
        self == other
    }
}

// =============================================================================
// Value locations
// =============================================================================

/// Raw representation of a value sitting in a register or stack slot.
///
/// Optimized code keeps numbers unboxed; restoration must know whether
/// raw bits are already a tagged `Var`, an unboxed `f64`, or a lossless
/// `i32` so it re-tags them correctly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawRepr {
    /// Bits are already a tagged `Var`.
    Var,
    /// Bits are raw IEEE float64.
    Float64,
    /// Low 32 bits are a lossless int32.
    LosslessInt32,
}

/// Machine placement of a live value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Place {
    /// Architectural register, by encoding.
    Register(u8),
    /// Stack slot index within the bailed-out frame.
    StackSlot(u32),
}

/// Where one inlinee argument lives at the bailout point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InlineFrameInfoValue {
    /// The argument is dead; restores as the null value.
    None,
    /// The argument lives in a register or stack slot.
    Sym { place: Place, repr: RawRepr },
    /// The argument is a compile-time constant.
    Const(BailoutConstantValue),
}

impl InlineFrameInfoValue {
    /// Whether this is a constant binding.
    #[inline]
    pub fn is_const(&self) -> bool {
        matches!(self, InlineFrameInfoValue::Const(_))
    }
}

// =============================================================================
// Bailout frame capture
// =============================================================================

/// Machine state captured at the bailout point.
///
/// `registers` is indexed by architectural register encoding; `stack` by
/// frame slot index.
#[derive(Debug)]
pub struct BailoutFrame<'a> {
    /// Register file snapshot.
    pub registers: &'a [u64],
    /// Spill-area snapshot.
    pub stack: &'a [u64],
}

impl BailoutFrame<'_> {
    fn read(&self, place: Place) -> u64 {
        match place {
            Place::Register(reg) => self.registers[reg as usize],
            Place::StackSlot(slot) => self.stack[slot as usize],
        }
    }
}

fn restore_value(value: &InlineFrameInfoValue, frame: &BailoutFrame<'_>) -> Var {
    match value {
        InlineFrameInfoValue::None => Var::NULL,
        InlineFrameInfoValue::Const(constant) => constant.to_var(),
        InlineFrameInfoValue::Sym { place, repr } => {
            let raw = frame.read(*place);
            match repr {
                RawRepr::Var => Var::from_bits(raw),
                RawRepr::Float64 => Var::from_float64(f64::from_bits(raw)),
                RawRepr::LosslessInt32 => Var::from_int32(raw as u32 as i32),
            }
        }
    }
}

// =============================================================================
// InlineeFrameRecord
// =============================================================================

/// Bailout metadata for one (possibly nested) inlined call.
///
/// Records chain outward through `parent`: the innermost inlinee points
/// at its inliner, up to the physical frame.
#[derive(Debug, Clone)]
pub struct InlineeFrameRecord {
    /// Callee function handle.
    pub function_id: u32,
    /// Byte-code offset of the call site in the inliner.
    pub inlinee_start_offset: u32,
    /// Inline depth; the outermost inlinee is depth 1.
    pub inline_depth: u32,
    /// Argument bindings, `this` first.
    pub args: SmallVec<[InlineFrameInfoValue; 4]>,
    /// The inliner's record, absent for a direct inlinee of the
    /// physical frame.
    pub parent: Option<Box<InlineeFrameRecord>>,
}

/// One synthesized interpreter frame.
#[derive(Debug, Clone, PartialEq)]
pub struct InlinedFrameLayout {
    /// Callee function handle.
    pub function_id: u32,
    /// Byte-code offset of the call site in the inliner.
    pub inlinee_start_offset: u32,
    /// Restored argument values.
    pub args: Vec<Var>,
}

impl InlineeFrameRecord {
    /// Create a record for a call at `inlinee_start_offset`.
    pub fn new(function_id: u32, inlinee_start_offset: u32, inline_depth: u32) -> Self {
        InlineeFrameRecord {
            function_id,
            inlinee_start_offset,
            inline_depth,
            args: SmallVec::new(),
            parent: None,
        }
    }

    /// Chain this record under its inliner's record.
    pub fn with_parent(mut self, parent: InlineeFrameRecord) -> Self {
        debug_assert!(parent.inline_depth + 1 == self.inline_depth);
        self.parent = Some(Box::new(parent));
        self
    }

    /// Add an argument binding.
    pub fn push_arg(&mut self, value: InlineFrameInfoValue) {
        self.args.push(value);
    }

    /// Reconstruct the logical frames this record chain describes,
    /// outermost first.
    ///
    /// Walking outward-in matches the order the interpreter rebuilds its
    /// stack: the inliner's frame must exist before the inlinee's frame
    /// is pushed onto it.
    pub fn restore_frames(&self, frame: &BailoutFrame<'_>) -> Vec<InlinedFrameLayout> {
        let mut chain: Vec<&InlineeFrameRecord> = Vec::with_capacity(self.inline_depth as usize);
        let mut cur = Some(self);
        while let Some(record) = cur {
            chain.push(record);
            cur = record.parent.as_deref();
        }
        chain.reverse();

        chain
            .into_iter()
            .map(|record| InlinedFrameLayout {
                function_id: record.function_id,
                inlinee_start_offset: record.inlinee_start_offset,
                args: record.args.iter().map(|arg| restore_value(arg, frame)).collect(),
            })
            .collect()
    }
}
