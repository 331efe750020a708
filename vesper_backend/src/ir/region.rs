//! EH regions.
//!
//! A [`Region`] mirrors one static try/catch/finally block. Regions form
//! a tree through parent ids, carry links to their matching
//! try/catch/finally partners, the set of write-through symbols (locals
//! that must be stored to their stack home across handler boundaries),
//! and the [`EhBailoutData`] a bailout needs to unwind back through the
//! handler frames one return thunk at a time.

use rustc_hash::FxHashSet;

use super::func::SymId;
use super::instr::InstrId;

/// Kind of an EH region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RegionKind {
    Root,
    Try,
    Catch,
    Finally,
}

/// Id of a region in the function's region table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegionId(u32);

impl RegionId {
    /// Create from a raw table index.
    #[inline]
    pub(crate) const fn new(index: u32) -> Self {
        RegionId(index)
    }

    /// Raw table index.
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Bailout metadata for one EH region.
///
/// A bailout inside nested handlers cannot unwind in one step: the
/// JIT frame and each helper frame return separately, each through its
/// region's return thunk. `nesting_depth` says how many frames that is;
/// `catch_offset` is where the interpreter re-enters the handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EhBailoutData {
    /// Number of EH frames between this region and the function root.
    pub nesting_depth: u32,
    /// Byte-code offset of the catch handler, 0 for non-catch regions.
    pub catch_offset: u32,
    /// Parent region's bailout data, if any.
    pub parent: Option<RegionId>,
}

/// One static try/catch/finally region.
#[derive(Debug, Clone)]
pub struct Region {
    /// Id of this region.
    pub id: RegionId,
    /// Kind.
    pub kind: RegionKind,
    /// Enclosing region.
    pub parent: Option<RegionId>,
    /// The try region this catch/finally belongs to.
    pub matching_try: Option<RegionId>,
    /// The catch region paired with this try.
    pub matching_catch: Option<RegionId>,
    /// The finally region paired with this try.
    pub matching_finally: Option<RegionId>,
    /// First instruction of the region.
    pub start: Option<InstrId>,
    /// Last instruction of the region.
    pub end: Option<InstrId>,
    /// Locals that must be written through to their stack home so the
    /// handler sees current values.
    pub write_through_syms: FxHashSet<SymId>,
    /// Bailout unwind metadata, filled in during lowering.
    pub eh_bailout_data: Option<EhBailoutData>,
    /// Label of this region's bailout return thunk, once emitted.
    pub bailout_return_thunk_label: Option<InstrId>,
    /// Whether the return thunk has been emitted.
    pub return_thunk_emitted: bool,
}

impl Region {
    pub(crate) fn new(id: RegionId, kind: RegionKind, parent: Option<RegionId>) -> Self {
        Region {
            id,
            kind,
            parent,
            matching_try: None,
            matching_catch: None,
            matching_finally: None,
            start: None,
            end: None,
            write_through_syms: FxHashSet::default(),
            eh_bailout_data: None,
            bailout_return_thunk_label: None,
            return_thunk_emitted: false,
        }
    }

    /// Compute and attach bailout data from the parent chain.
    ///
    /// The root region has depth 0; every non-root region is one frame
    /// deeper than its parent.
    pub fn allocate_eh_bailout_data(
        &mut self,
        parent_data: Option<&EhBailoutData>,
        catch_offset: u32,
    ) {
        let nesting_depth = match self.kind {
            RegionKind::Root => 0,
            _ => parent_data.map_or(1, |p| p.nesting_depth + 1),
        };
        self.eh_bailout_data = Some(EhBailoutData {
            nesting_depth,
            catch_offset,
            parent: self.parent,
        });
    }
}
