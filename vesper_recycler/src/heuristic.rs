//! Collection heuristics.
//!
//! Tuning constants scaled to machine memory: how many free pages the
//! allocators may cache, how large an uncollected-allocation burst may
//! grow before a collection is worth its pause, and the mark-stack page
//! budget for parallel workers. Tiers follow total physical memory;
//! a low-memory device caches little and collects eagerly.

use crate::page_allocator::PAGE_SIZE;

const MB: usize = 1024 * 1024;

/// Memory-scaled recycler tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecyclerHeuristic {
    /// Free pages an allocator may cache before decommitting.
    pub default_max_free_page_count: usize,
    /// Pages one allocation request may take from a segment.
    pub default_max_alloc_page_count: usize,
    /// Uncollected allocation bytes that trigger a collection.
    pub max_uncollected_alloc_bytes: usize,
    /// Page budget for each parallel mark stack.
    pub max_mark_stack_page_count: usize,
}

impl RecyclerHeuristic {
    /// Derive the tier for a machine with `total_physical_bytes` of
    /// memory.
    pub fn new(total_physical_bytes: u64) -> Self {
        if total_physical_bytes <= 1024 * MB as u64 {
            RecyclerHeuristic {
                default_max_free_page_count: 16 * MB / PAGE_SIZE,
                default_max_alloc_page_count: 32,
                max_uncollected_alloc_bytes: 16 * MB,
                max_mark_stack_page_count: 16,
            }
        } else if total_physical_bytes <= 4096 * MB as u64 {
            RecyclerHeuristic {
                default_max_free_page_count: 64 * MB / PAGE_SIZE,
                default_max_alloc_page_count: 64,
                max_uncollected_alloc_bytes: 32 * MB,
                max_mark_stack_page_count: 32,
            }
        } else {
            RecyclerHeuristic {
                default_max_free_page_count: 512 * MB / PAGE_SIZE,
                default_max_alloc_page_count: 256,
                max_uncollected_alloc_bytes: 64 * MB,
                max_mark_stack_page_count: 64,
            }
        }
    }

    /// Whether the uncollected-allocation burst justifies collecting.
    #[inline]
    pub fn should_collect(&self, uncollected_alloc_bytes: usize) -> bool {
        uncollected_alloc_bytes >= self.max_uncollected_alloc_bytes
    }
}
