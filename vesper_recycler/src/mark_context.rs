//! Per-worker marking state.
//!
//! A [`MarkContext`] is one mark worker's private world: a mark stack of
//! candidates (object pointer + byte count) and a track stack of
//! finalizable objects needing deferred processing, both backed by pages
//! from the context's own [`PagePool`] so workers never contend on a
//! shared allocator mid-mark.
//!
//! [`MarkContext::split`] redistributes outstanding mark entries across
//! sibling contexts for load balancing. The contract is strict: the
//! multiset of entries across the targets after a split equals the
//! multiset before. Losing an entry under-marks (premature collection
//! of a live object), duplicating one hands the same object to two
//! workers. `split` returns only after every target stack is populated,
//! which is the happens-before edge parallel marking relies on.

use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::Arc;

use crate::page_allocator::PAGE_SIZE;
use crate::page_pool::{PagePool, PagePoolPage};
use crate::policy::AllocationPolicyManager;
use crate::RecyclerError;

/// Maximum sibling contexts one split may distribute across.
pub const MAX_SPLIT_TARGETS: usize = 3;

/// One unit of marking work: an object and its size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarkCandidate {
    /// The object to scan.
    pub obj: *mut u8,
    /// Bytes to scan.
    pub byte_count: usize,
}

// Candidates reference heap objects owned by the heap, not by the
// stack that carries them between workers.
unsafe impl Send for MarkCandidate {}

/// A finalizable object queued for deferred processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackedObject {
    /// The object requiring finalization handling.
    pub obj: *mut u8,
}

unsafe impl Send for TrackedObject {}

// =============================================================================
// PagePoolStack
// =============================================================================

struct Chunk {
    page: PagePoolPage,
    count: usize,
}

/// A stack of `T` stored in page-pool pages.
///
/// The current chunk's page is freed back to the pool the moment it
/// empties, so an empty stack holds no pages.
struct PagePoolStack<T: Copy> {
    chunks: Vec<Chunk>,
    len: usize,
    _marker: PhantomData<T>,
}

impl<T: Copy> PagePoolStack<T> {
    const fn per_page() -> usize {
        PAGE_SIZE / std::mem::size_of::<T>()
    }

    fn new() -> Self {
        PagePoolStack { chunks: Vec::new(), len: 0, _marker: PhantomData }
    }

    fn slot(page: &PagePoolPage, index: usize) -> NonNull<T> {
        debug_assert!(index < Self::per_page());
        let base = page.base().as_ptr() as *mut T;
        NonNull::new(unsafe { base.add(index) }).expect("slot in page")
    }

    /// Push a value, drawing a page from `pool` when the current chunk
    /// is full. Fails only when the pool cannot produce a page.
    fn push(&mut self, pool: &mut PagePool, value: T) -> bool {
        let needs_page = match self.chunks.last() {
            Some(chunk) => chunk.count == Self::per_page(),
            None => true,
        };
        if needs_page {
            let page = match pool.get_page(true) {
                Some(page) => page,
                None => return false,
            };
            self.chunks.push(Chunk { page, count: 0 });
        }
        let chunk = self.chunks.last_mut().expect("chunk present");
        unsafe {
            Self::slot(&chunk.page, chunk.count).as_ptr().write(value);
        }
        chunk.count += 1;
        self.len += 1;
        true
    }

    /// Pop a value, returning emptied chunk pages to `pool`.
    fn pop(&mut self, pool: &mut PagePool) -> Option<T> {
        let chunk = self.chunks.last_mut()?;
        debug_assert!(chunk.count > 0);
        chunk.count -= 1;
        let value = unsafe { Self::slot(&chunk.page, chunk.count).as_ptr().read() };
        self.len -= 1;
        if chunk.count == 0 {
            let chunk = self.chunks.pop().expect("chunk present");
            pool.free_page(chunk.page);
        }
        Some(value)
    }

    fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn len(&self) -> usize {
        self.len
    }

    /// Discard all entries, returning every page to `pool`.
    fn clear(&mut self, pool: &mut PagePool) {
        for chunk in self.chunks.drain(..) {
            pool.free_page(chunk.page);
        }
        self.len = 0;
    }
}

// =============================================================================
// MarkContext
// =============================================================================

/// One worker's mark/track stacks plus the private page pool backing
/// them.
pub struct MarkContext {
    page_pool: PagePool,
    mark_stack: PagePoolStack<MarkCandidate>,
    track_stack: PagePoolStack<TrackedObject>,
}

impl MarkContext {
    /// Create a context with its own pool.
    pub fn new(policy: Option<Arc<AllocationPolicyManager>>) -> Self {
        MarkContext {
            page_pool: PagePool::new(policy),
            mark_stack: PagePoolStack::new(),
            track_stack: PagePoolStack::new(),
        }
    }

    /// Pre-commit pages so marking can start without touching the OS.
    pub fn reserve_pages(&mut self, page_count: usize) -> Result<(), RecyclerError> {
        self.page_pool.reserve_pages(page_count)
    }

    /// Queue an object for scanning. `false` means the pool is out of
    /// memory and the caller must abort the cycle.
    #[must_use]
    pub fn add_candidate(&mut self, obj: *mut u8, byte_count: usize) -> bool {
        self.mark_stack.push(&mut self.page_pool, MarkCandidate { obj, byte_count })
    }

    /// Take the next object to scan.
    pub fn pop_candidate(&mut self) -> Option<MarkCandidate> {
        self.mark_stack.pop(&mut self.page_pool)
    }

    /// Queue a finalizable object for deferred processing.
    #[must_use]
    pub fn add_tracked_object(&mut self, obj: *mut u8) -> bool {
        self.track_stack.push(&mut self.page_pool, TrackedObject { obj })
    }

    /// Take the next finalizable object.
    pub fn pop_tracked_object(&mut self) -> Option<TrackedObject> {
        self.track_stack.pop(&mut self.page_pool)
    }

    /// Outstanding mark entries.
    pub fn mark_count(&self) -> usize {
        self.mark_stack.len()
    }

    /// The GC-phase termination check: no mark work, no track work, and
    /// no pages checked out by either stack.
    pub fn is_empty(&self) -> bool {
        self.mark_stack.is_empty()
            && self.track_stack.is_empty()
            && self.page_pool.in_use_count() == 0
    }

    /// Redistribute outstanding mark entries across up to
    /// [`MAX_SPLIT_TARGETS`] sibling contexts.
    ///
    /// All entries move; the source is left with none. Every target is
    /// fully populated before `split` returns. Returns the number of
    /// entries moved; on a target-pool OOM the remaining entries stay in
    /// the source and the caller aborts the cycle.
    pub fn split(&mut self, targets: &mut [&mut MarkContext]) -> usize {
        debug_assert!(!targets.is_empty() && targets.len() <= MAX_SPLIT_TARGETS);

        let mut moved = 0;
        let mut next_target = 0;
        while let Some(candidate) = self.pop_candidate() {
            let target = &mut targets[next_target];
            if !target.mark_stack.push(&mut target.page_pool, candidate) {
                // Put it back; the cycle is about to abort.
                let restored =
                    self.mark_stack.push(&mut self.page_pool, candidate);
                debug_assert!(restored, "source page was just freed");
                return moved;
            }
            moved += 1;
            next_target = (next_target + 1) % targets.len();
        }
        moved
    }

    /// Release pool pages deferred during marking. Call only after all
    /// parallel marking has quiesced.
    pub fn release(&mut self) {
        debug_assert!(self.mark_stack.is_empty());
        debug_assert!(self.track_stack.is_empty());
        self.page_pool.release_free_pages();
    }

    /// Emergency stop: discard all mark state and return every page, so
    /// the next collection attempt starts clean.
    pub fn abort(&mut self) {
        self.mark_stack.clear(&mut self.page_pool);
        self.track_stack.clear(&mut self.page_pool);
        self.page_pool.release_free_pages();
    }

    /// The context's private pool.
    pub fn page_pool(&self) -> &PagePool {
        &self.page_pool
    }
}

// Contexts move to worker threads whole; their pools are private.
unsafe impl Send for MarkContext {}
