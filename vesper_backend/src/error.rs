//! Backend error types.
//!
//! Compilation failure is recoverable from the runtime's point of view:
//! the function simply keeps running in the interpreter. The one
//! exception is unwind-table registration failure, which is escalated via
//! [`fatal_out_of_memory`] because code whose frames cannot be walked
//! must never run.

use std::fmt;

/// Result alias for backend operations.
pub type CodeGenResult<T> = Result<T, CodeGenError>;

/// Errors produced by the compilation pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodeGenError {
    /// Code or metadata memory could not be allocated.
    OutOfMemory,
    /// The code generator has been closed; no new work is accepted.
    Closed,
    /// The IR contains an opcode the encoder does not support.
    UnsupportedOpcode(&'static str),
}

impl fmt::Display for CodeGenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodeGenError::OutOfMemory => write!(f, "out of memory during code generation"),
            CodeGenError::Closed => write!(f, "native code generator is closed"),
            CodeGenError::UnsupportedOpcode(op) => write!(f, "unsupported opcode: {}", op),
        }
    }
}

impl std::error::Error for CodeGenError {}

/// Escalate an unrecoverable allocation failure.
///
/// Used where no failure return exists in the contract (unwind-table
/// registration): a JIT function whose unwind info is not registered
/// cannot safely run, so the process must not continue.
#[cold]
pub fn fatal_out_of_memory(what: &str) -> ! {
    panic!("fatal out of memory: {}", what);
}
