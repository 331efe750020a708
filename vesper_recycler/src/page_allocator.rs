//! Segment-based page allocation.
//!
//! Pages come from large OS segments reserved in one shot; singles are
//! recycled through a free list before any new segment is mapped. Every
//! segment reservation is admitted through the
//! [`AllocationPolicyManager`](crate::policy::AllocationPolicyManager)
//! when one is attached.
//!
//! Not internally synchronized: each owner (a recycler's collection
//! driver, a mark worker's private pool) has its own allocator.

use std::ptr::NonNull;
use std::sync::Arc;

use crate::platform;
use crate::policy::AllocationPolicyManager;

pub use crate::platform::PAGE_SIZE;

/// Pages per standard segment.
const SEGMENT_PAGE_COUNT: usize = 64;

struct Segment {
    base: NonNull<u8>,
    page_count: usize,
}

/// Allocates OS pages in segment-sized bites.
pub struct PageAllocator {
    policy: Option<Arc<AllocationPolicyManager>>,
    segments: Vec<Segment>,
    free_pages: Vec<NonNull<u8>>,
    /// Pages currently handed out.
    used_page_count: usize,
    /// Pages ever carved fresh from a segment (diagnostics; the page
    /// pool's reuse property is tested against this).
    fresh_page_count: usize,
    /// Decommit free pages beyond this count on `decommit_now`.
    max_free_page_count: usize,
}

impl PageAllocator {
    /// Create an allocator, optionally gated by a policy manager.
    pub fn new(policy: Option<Arc<AllocationPolicyManager>>) -> Self {
        PageAllocator {
            policy,
            segments: Vec::new(),
            free_pages: Vec::new(),
            used_page_count: 0,
            fresh_page_count: 0,
            max_free_page_count: SEGMENT_PAGE_COUNT * 4,
        }
    }

    /// Cap on cached free pages.
    pub fn set_max_free_page_count(&mut self, count: usize) {
        self.max_free_page_count = count;
    }

    fn map_segment(&mut self, page_count: usize) -> Option<NonNull<u8>> {
        let bytes = page_count * PAGE_SIZE;
        if let Some(policy) = &self.policy {
            if !policy.request_alloc(bytes, false) {
                return None;
            }
        }
        let base = unsafe { platform::reserve_commit(bytes) };
        let base = match NonNull::new(base) {
            Some(base) => base,
            None => {
                if let Some(policy) = &self.policy {
                    policy.report_free(bytes);
                    policy.report_failure(bytes);
                }
                return None;
            }
        };
        self.segments.push(Segment { base, page_count });
        Some(base)
    }

    /// Allocate `page_count` contiguous pages.
    ///
    /// Single pages reuse the free list; multi-page runs map a dedicated
    /// segment.
    pub fn alloc_pages(&mut self, page_count: usize) -> Option<NonNull<u8>> {
        debug_assert!(page_count > 0);

        if page_count == 1 {
            if let Some(page) = self.free_pages.pop() {
                self.used_page_count += 1;
                return Some(page);
            }
            // Carve a fresh segment into the free list and hand out the
            // first page.
            let base = self.map_segment(SEGMENT_PAGE_COUNT)?;
            for index in (1..SEGMENT_PAGE_COUNT).rev() {
                let page = unsafe { base.as_ptr().add(index * PAGE_SIZE) };
                self.free_pages.push(NonNull::new(page).expect("segment page"));
            }
            self.used_page_count += 1;
            self.fresh_page_count += 1;
            return Some(base);
        }

        let base = self.map_segment(page_count)?;
        self.used_page_count += page_count;
        self.fresh_page_count += page_count;
        Some(base)
    }

    /// Return pages to the free list. They stay committed until
    /// [`PageAllocator::decommit_now`].
    pub fn release_pages(&mut self, base: NonNull<u8>, page_count: usize) {
        debug_assert!(self.used_page_count >= page_count);
        self.used_page_count -= page_count;
        for index in 0..page_count {
            let page = unsafe { base.as_ptr().add(index * PAGE_SIZE) };
            self.free_pages.push(NonNull::new(page).expect("released page"));
        }
    }

    /// Decommit cached free pages beyond the configured cap.
    pub fn decommit_now(&mut self) {
        while self.free_pages.len() > self.max_free_page_count {
            let page = self.free_pages.pop().expect("checked non-empty");
            unsafe {
                platform::decommit(page.as_ptr(), PAGE_SIZE);
            }
        }
    }

    /// Pages currently handed out.
    pub fn used_page_count(&self) -> usize {
        self.used_page_count
    }

    /// Pages ever carved fresh from segments.
    pub fn fresh_page_count(&self) -> usize {
        self.fresh_page_count
    }

    /// Cached reusable pages.
    pub fn free_page_count(&self) -> usize {
        self.free_pages.len()
    }
}

/// A page allocator configured with the recycler's own defaults.
///
/// GC-thread allocators (mark-stack pools) differ from ordinary ones
/// only in tuning: the cached-free-page cap comes from the
/// memory-scaled heuristic instead of the segment-count default.
pub struct RecyclerPageAllocator;

impl RecyclerPageAllocator {
    /// Build an allocator tuned by `heuristic`.
    pub fn new(
        policy: Option<Arc<AllocationPolicyManager>>,
        heuristic: &crate::heuristic::RecyclerHeuristic,
    ) -> PageAllocator {
        let mut allocator = PageAllocator::new(policy);
        allocator.set_max_free_page_count(heuristic.default_max_free_page_count);
        allocator
    }
}

impl Drop for PageAllocator {
    fn drop(&mut self) {
        debug_assert!(self.used_page_count == 0, "pages leaked past allocator teardown");
        for segment in &self.segments {
            let bytes = segment.page_count * PAGE_SIZE;
            unsafe {
                platform::release(segment.base.as_ptr(), bytes);
            }
            if let Some(policy) = &self.policy {
                policy.report_free(bytes);
            }
        }
    }
}

// Owners move allocators between threads (a mark worker's pool); the
// allocator itself is never shared concurrently.
unsafe impl Send for PageAllocator {}
