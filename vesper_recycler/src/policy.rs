//! Allocation admission control.
//!
//! A single gate in front of all page allocation: a configurable byte
//! ceiling plus an optional host callback notified of every allocate,
//! free, and failure. The counter must stay accurate even for
//! allocations the gate could not prevent: an `external_alloc` request
//! that is denied still records its usage, because the memory already
//! exists and future decisions must see it.

use parking_lot::Mutex;

/// Event reported to the host callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryAllocateEvent {
    /// An allocation is being requested; a `false` return vetoes it.
    MemoryAllocate,
    /// Bytes were returned.
    MemoryFree,
    /// A request was denied or failed.
    MemoryFailure,
}

/// Host callback: observes events, may veto `MemoryAllocate`.
pub type MemoryAllocationCallback =
    Box<dyn Fn(MemoryAllocateEvent, usize) -> bool + Send + Sync>;

struct Inner {
    memory_limit: usize,
    current_memory: usize,
    callback: Option<MemoryAllocationCallback>,
}

impl Inner {
    fn request_alloc(&mut self, byte_count: usize, external_alloc: bool) -> bool {
        let denied = match self.current_memory.checked_add(byte_count) {
            None => true,
            Some(new_current) => {
                new_current > self.memory_limit
                    || self
                        .callback
                        .as_ref()
                        .is_some_and(|cb| !cb(MemoryAllocateEvent::MemoryAllocate, byte_count))
            }
        };

        if denied {
            if let Some(cb) = &self.callback {
                cb(MemoryAllocateEvent::MemoryFailure, byte_count);
            }
            // The caller could not hold this allocation back; track it
            // anyway so the books stay right.
            if external_alloc {
                self.current_memory = self.current_memory.saturating_add(byte_count);
            }
            false
        } else {
            self.current_memory += byte_count;
            true
        }
    }

    fn report(&mut self, event: MemoryAllocateEvent, byte_count: usize) {
        if event == MemoryAllocateEvent::MemoryFree {
            debug_assert!(self.current_memory >= byte_count);
            self.current_memory = self.current_memory.saturating_sub(byte_count);
        }
        if let Some(cb) = &self.callback {
            // The callback must be minimal and must not re-enter us.
            cb(event, byte_count);
        }
    }
}

/// Tracks current usage against a limit, shared by every allocator of
/// one recycler (or the whole process).
pub struct AllocationPolicyManager {
    /// Whether concurrent allocators share this manager. Kept for
    /// diagnostics; the lock itself is uncontended in the
    /// single-threaded case.
    support_concurrency: bool,
    inner: Mutex<Inner>,
}

impl AllocationPolicyManager {
    /// Create a manager with no limit.
    pub fn new(support_concurrency: bool) -> Self {
        AllocationPolicyManager {
            support_concurrency,
            inner: Mutex::new(Inner {
                memory_limit: usize::MAX,
                current_memory: 0,
                callback: None,
            }),
        }
    }

    /// Whether this manager serves concurrent allocators.
    pub fn supports_concurrency(&self) -> bool {
        self.support_concurrency
    }

    /// Current tracked usage in bytes.
    pub fn get_usage(&self) -> usize {
        self.inner.lock().current_memory
    }

    /// Current limit in bytes.
    pub fn get_limit(&self) -> usize {
        self.inner.lock().memory_limit
    }

    /// Set the limit. Existing usage above the new limit only blocks
    /// future allocations.
    pub fn set_limit(&self, new_limit: usize) {
        self.inner.lock().memory_limit = new_limit;
    }

    /// Ask permission to allocate `byte_count` bytes.
    ///
    /// Returns `false` (and reports `MemoryFailure`) if the new total
    /// would overflow, exceed the limit, or the host vetoes. With
    /// `external_alloc`, a denied request still records the usage: the
    /// allocation already happened and cannot be prevented.
    pub fn request_alloc(&self, byte_count: usize, external_alloc: bool) -> bool {
        self.inner.lock().request_alloc(byte_count, external_alloc)
    }

    /// Record freed bytes.
    pub fn report_free(&self, byte_count: usize) {
        self.inner.lock().report(MemoryAllocateEvent::MemoryFree, byte_count);
    }

    /// Report a failure that happened outside the gate.
    pub fn report_failure(&self, byte_count: usize) {
        self.inner.lock().report(MemoryAllocateEvent::MemoryFailure, byte_count);
    }

    /// Install (or clear) the host callback.
    pub fn set_memory_allocation_callback(&self, callback: Option<MemoryAllocationCallback>) {
        self.inner.lock().callback = callback;
    }
}

impl std::fmt::Debug for AllocationPolicyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("AllocationPolicyManager")
            .field("support_concurrency", &self.support_concurrency)
            .field("current_memory", &inner.current_memory)
            .field("memory_limit", &inner.memory_limit)
            .finish()
    }
}
