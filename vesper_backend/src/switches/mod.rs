//! Switch-statement lowering.
//!
//! Converts a run of `case` tests into an efficient branch structure:
//! dense integer cases become a jump table, sparse ones a balanced
//! binary search over range comparisons, and very small sets a linear
//! compare chain. String switches get a single-character jump table when
//! every label is one character, else an identity dictionary.
//!
//! The builder is shared between the normal and asm.js IR builders via
//! the [`SwitchAdapter`] capability; everything it emits flows through
//! that trait. When dynamic profile data contradicts the statically
//! observed case types, the builder converts the profiled switch
//! instruction into a bailout rather than emitting an unsound fast path.

mod builder;
mod case_node;

pub use builder::{SwitchAdapter, SwitchBuilder, SwitchProfile};
pub use case_node::{CaseNode, CaseValue};
