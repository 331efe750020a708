//! JIT compilation backend for the Vesper engine.
//!
//! The backend consumes a per-function IR instruction list (produced by
//! the bytecode front end) and lowers it to executable machine code:
//!
//! - Typed IR model: operands, instructions, EH regions
//! - Switch lowering: jump tables, binary search, string dictionaries
//! - Linear-scan register allocation with per-ISA policy
//! - Bailout metadata: inlinee frame reconstruction, EH bailout chains
//! - Machine encoding plus OS unwind metadata (.eh_frame / function tables)
//! - The codegen driver: work items, background compilation, entry thunks
//! - Inlining policy
//!
//! Compilation never touches live GC-managed runtime objects; everything
//! the backend needs from the runtime is captured in immutable JIT-time
//! snapshots when a work item is created.

#![deny(unsafe_op_in_unsafe_fn)]

pub mod bailout;
pub mod codegen;
pub mod encoder;
pub mod error;
pub mod inlining;
pub mod ir;
pub mod regalloc;
pub mod switches;

pub use error::{CodeGenError, CodeGenResult};
