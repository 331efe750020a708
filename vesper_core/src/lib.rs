//! Shared leaf crate for the Vesper engine.
//!
//! Everything here is consumed by both the JIT backend and the recycler:
//!
//! - **Var**: the tagged runtime value representation. Bailout
//!   reconstruction must reproduce these exact bit patterns, so the
//!   encoding lives in one place.
//! - **Config**: engine configuration and per-phase kill switches.
//! - **Intern**: pointer-identity interned strings, used by string-valued
//!   switch dictionaries.

#![deny(unsafe_op_in_unsafe_fn)]

pub mod config;
pub mod intern;
pub mod value;

pub use config::{EngineConfig, Phase, PhaseFlags};
pub use intern::{intern, InternedString};
pub use value::Var;
