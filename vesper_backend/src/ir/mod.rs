//! Typed IR model.
//!
//! A function arrives from the bytecode front end as a doubly-linked list
//! of [`Instr`]s over typed [`Opnd`]s, held in an [`IrFunc`] together with
//! its symbol table, loop tree, and EH region tree. The list is mutated
//! in place by lowering and register allocation, then handed to the
//! encoder.

pub mod bounds;
pub mod func;
pub mod instr;
pub mod opnd;
pub mod region;
pub mod types;

pub use bounds::{IntConstantBounds, IntOverflowDoesNotMatterRange};
pub use func::{IrFunc, Loop, LoopId, StackSym, SymConst, SymId};
pub use instr::{Instr, InstrArena, InstrId, MultiBrData, MultiBrKind, OpCode};
pub use opnd::{IndirOpnd, Opnd};
pub use region::{EhBailoutData, Region, RegionId, RegionKind};
pub use types::IRType;
