//! The Vesper recycler: the memory subsystem the whole engine allocates
//! through.
//!
//! The pieces, leaf to root:
//!
//! - **Allocation policy**: a byte ceiling plus an optional host callback
//!   gating every page-level allocation.
//! - **Page allocator**: segment-based OS page management; every segment
//!   is admitted through the policy manager.
//! - **Page pool**: per-collection page cache with *deferred* freeing:
//!   pages return to the OS only once parallel marking has quiesced.
//! - **Mark contexts**: per-worker mark/track stacks backed by pool
//!   pages, splittable for parallel load balancing.
//! - **Collector**: drives parallel marking over the contexts.
//! - **Fast allocator**: the bump-allocation structure whose exact field
//!   layout JIT-emitted inline allocation sequences index into.
//!
//! Page-pool and mark-context state is deliberately unsynchronized; each
//! parallel mark worker owns a private pool, and the one shared counter
//! (the policy manager's) takes its lock only when concurrency support
//! is requested.

#![deny(unsafe_op_in_unsafe_fn)]

pub mod collector;
pub mod fast_allocator;
pub mod heuristic;
pub mod mark_context;
pub mod page_allocator;
pub mod page_pool;
pub mod policy;
mod platform;
mod stats;

pub use collector::{Collector, ObjectTracer};
pub use fast_allocator::RecyclerFastAllocator;
pub use heuristic::RecyclerHeuristic;
pub use mark_context::{MarkCandidate, MarkContext, MAX_SPLIT_TARGETS};
pub use page_allocator::{PageAllocator, RecyclerPageAllocator};
pub use page_pool::{PagePool, PagePoolPage};
pub use policy::{AllocationPolicyManager, MemoryAllocateEvent};
pub use stats::CollectorStats;

/// Recycler error type.
///
/// Out-of-memory during collection is recoverable at this layer: the
/// cycle aborts cleanly and the next collection starts fresh. Whether it
/// surfaces to script is the runtime's decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecyclerError {
    /// A page-level allocation was denied or failed.
    OutOfMemory,
}

impl std::fmt::Display for RecyclerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecyclerError::OutOfMemory => write!(f, "recycler out of memory"),
        }
    }
}

impl std::error::Error for RecyclerError {}
