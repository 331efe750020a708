//! The parallel mark driver.
//!
//! Owns the primary mark context plus a bounded set of parallel sibling
//! contexts, each with its own private page pool. A mark phase pushes
//! the roots, splits the work across the siblings, and lets each worker
//! drain its own context, so workers never share a stack or a pool, so
//! marking itself needs no locks. Only after every worker has quiesced
//! does the driver call `release_free_pages` on the pools; that deferred
//! free is the whole reason the pools exist.
//!
//! Out of memory mid-mark takes the abort path: every context discards
//! its state and returns its pages, leaving nothing that could leak into
//! the next cycle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use vesper_core::config::{EngineConfig, Phase};

use crate::heuristic::RecyclerHeuristic;
use crate::mark_context::{MarkCandidate, MarkContext, TrackedObject, MAX_SPLIT_TARGETS};
use crate::policy::AllocationPolicyManager;
use crate::stats::CollectorStats;
use crate::RecyclerError;

/// Minimum outstanding entries before parallel marking pays off.
const PARALLEL_MARK_THRESHOLD: usize = 64;

/// Visits an object's outgoing references.
///
/// Implementations push each referenced object through `push`; the
/// tracer itself decides (via its own mark bits) whether a reference is
/// newly discovered. Must be callable from multiple workers at once.
pub trait ObjectTracer: Sync {
    /// Scan one object, pushing newly discovered candidates.
    fn trace(&self, candidate: MarkCandidate, push: &mut dyn FnMut(MarkCandidate));
}

/// Result of a completed mark phase.
#[derive(Debug, Default)]
pub struct MarkOutcome {
    /// Objects scanned.
    pub objects_marked: u64,
    /// Bytes scanned.
    pub bytes_scanned: u64,
    /// Finalizable objects found, for deferred processing.
    pub tracked: Vec<TrackedObject>,
}

/// The collection driver.
pub struct Collector {
    primary: MarkContext,
    parallel: Vec<MarkContext>,
    heuristic: RecyclerHeuristic,
    stats: CollectorStats,
}

impl Collector {
    /// Create a collector with contexts sized from the configuration.
    pub fn new(
        config: &EngineConfig,
        policy: Option<Arc<AllocationPolicyManager>>,
        heuristic: RecyclerHeuristic,
    ) -> Result<Self, RecyclerError> {
        let parallel_count = if config.phases.is_off(Phase::ParallelMark) {
            0
        } else {
            config.max_parallel_mark.min(MAX_SPLIT_TARGETS)
        };

        let mut primary = MarkContext::new(policy.clone());
        primary.reserve_pages(1)?;

        let mut parallel = Vec::with_capacity(parallel_count);
        for _ in 0..parallel_count {
            let mut context = MarkContext::new(policy.clone());
            context.reserve_pages(1)?;
            parallel.push(context);
        }

        Ok(Collector { primary, parallel, heuristic, stats: CollectorStats::default() })
    }

    /// Whether the allocation burst since the last collection justifies
    /// one now.
    pub fn should_collect(&self, uncollected_alloc_bytes: usize) -> bool {
        self.heuristic.should_collect(uncollected_alloc_bytes)
    }

    /// Accumulated statistics.
    pub fn stats(&self) -> &CollectorStats {
        &self.stats
    }

    /// Run one mark phase over `roots`.
    ///
    /// On success every context is drained and its deferred pages are
    /// released. On out-of-memory the phase aborts cleanly and the next
    /// call starts fresh.
    pub fn mark<T: ObjectTracer>(
        &mut self,
        roots: &[MarkCandidate],
        tracer: &T,
    ) -> Result<MarkOutcome, RecyclerError> {
        for root in roots {
            if !self.primary.add_candidate(root.obj, root.byte_count) {
                self.abort_all();
                return Err(RecyclerError::OutOfMemory);
            }
        }

        let use_parallel =
            !self.parallel.is_empty() && self.primary.mark_count() >= PARALLEL_MARK_THRESHOLD;

        let aborted = AtomicBool::new(false);
        let mut outcome = MarkOutcome::default();

        if use_parallel {
            // Distribute everything; split returns only after every
            // target stack is populated, and only then do the workers
            // start.
            let split_entries;
            {
                let mut targets: Vec<&mut MarkContext> = self.parallel.iter_mut().collect();
                split_entries = self.primary.split(&mut targets);
            }
            self.stats.split_entries += split_entries as u64;
            self.stats.parallel_marks += 1;

            let primary = &mut self.primary;
            let worker_stats: Vec<(u64, u64)> = std::thread::scope(|scope| {
                let mut handles = Vec::with_capacity(self.parallel.len());
                for context in self.parallel.iter_mut() {
                    let aborted = &aborted;
                    handles.push(scope.spawn(move || drain(context, tracer, aborted)));
                }
                // The primary picks up whatever the split left behind
                // (nothing, unless a target pool refused a page).
                let own = drain(primary, tracer, &aborted);
                let mut all = vec![own];
                for handle in handles {
                    all.push(handle.join().expect("mark worker panicked"));
                }
                all
            });

            for (objects, bytes) in worker_stats {
                outcome.objects_marked += objects;
                outcome.bytes_scanned += bytes;
            }
        } else {
            let (objects, bytes) = drain(&mut self.primary, tracer, &aborted);
            outcome.objects_marked += objects;
            outcome.bytes_scanned += bytes;
        }

        if aborted.load(Ordering::Acquire) {
            self.abort_all();
            self.stats.aborts += 1;
            return Err(RecyclerError::OutOfMemory);
        }

        // Deferred finalizable processing happens on one thread, after
        // marking proper.
        for context in std::iter::once(&mut self.primary).chain(self.parallel.iter_mut()) {
            while let Some(tracked) = context.pop_tracked_object() {
                outcome.tracked.push(tracked);
            }
        }

        // All workers have quiesced; now it is safe to give pages back.
        self.primary.release();
        for context in &mut self.parallel {
            context.release();
        }

        self.stats.collections += 1;
        self.stats.objects_marked += outcome.objects_marked;
        self.stats.bytes_scanned += outcome.bytes_scanned;
        Ok(outcome)
    }

    fn abort_all(&mut self) {
        self.primary.abort();
        for context in &mut self.parallel {
            context.abort();
        }
    }
}

/// Drain one context to empty, tracing each candidate into the same
/// context. Sets `aborted` (and stops) if the context's pool cannot
/// grow the stack.
fn drain<T: ObjectTracer>(
    context: &mut MarkContext,
    tracer: &T,
    aborted: &AtomicBool,
) -> (u64, u64) {
    let mut objects = 0u64;
    let mut bytes = 0u64;

    while let Some(candidate) = context.pop_candidate() {
        if aborted.load(Ordering::Acquire) {
            // Another worker failed; drop the rest, the driver aborts.
            continue;
        }
        objects += 1;
        bytes += candidate.byte_count as u64;

        let mut push_failed = false;
        tracer.trace(candidate, &mut |next| {
            if !push_failed && !context.add_candidate(next.obj, next.byte_count) {
                push_failed = true;
            }
        });
        if push_failed {
            aborted.store(true, Ordering::Release);
        }
    }

    (objects, bytes)
}
