//! Function-table registration.
//!
//! Stack walkers (exception propagation, crash handlers, profilers) find
//! JIT frames through registered function tables: one entry per function
//! mapping `[begin, end)` to its unwind info. The registry here is the
//! process-local table every target shares; on Windows the same entries
//! are additionally pushed to the OS through growable function tables
//! (`RtlAddGrowableFunctionTable`), avoiding the global-lock contention
//! of `RtlAddFunctionTable` under heavy JIT churn.
//!
//! The registered range must exactly bound the emitted body. A stack
//! walk through a mis-bounded entry does not fail; it silently walks
//! garbage.

use parking_lot::RwLock;

/// One registered function: `[begin, end)` plus its unwind-info address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeFunction {
    /// First byte of the function.
    pub begin_address: u64,
    /// One past the last byte.
    pub end_address: u64,
    /// Address (or offset) of the unwind info describing the function.
    pub unwind_info: u64,
}

/// Handle returned by [`PDataManager::register_function`], used to
/// deregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PDataHandle(u64);

/// Process-local function-table registry.
#[derive(Debug, Default)]
pub struct PDataManager {
    // Sorted by begin_address; entries carry their handle for removal.
    entries: RwLock<Vec<(PDataHandle, RuntimeFunction)>>,
    next_handle: std::sync::atomic::AtomicU64,
}

impl PDataManager {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a function's unwind range. The range must be non-empty.
    pub fn register_function(&self, function: RuntimeFunction) -> PDataHandle {
        debug_assert!(function.begin_address < function.end_address);
        let handle =
            PDataHandle(self.next_handle.fetch_add(1, std::sync::atomic::Ordering::Relaxed));

        let mut entries = self.entries.write();
        let position = entries
            .partition_point(|(_, existing)| existing.begin_address < function.begin_address);
        entries.insert(position, (handle, function));

        #[cfg(windows)]
        os::add_growable_entry(&function);

        handle
    }

    /// Remove a previously registered function.
    pub fn unregister_function(&self, handle: PDataHandle) {
        let mut entries = self.entries.write();
        entries.retain(|(h, _)| *h != handle);
    }

    /// Find the function containing `address`, as a stack walker would.
    pub fn lookup(&self, address: u64) -> Option<RuntimeFunction> {
        let entries = self.entries.read();
        let position = entries.partition_point(|(_, f)| f.begin_address <= address);
        if position == 0 {
            return None;
        }
        let (_, function) = entries[position - 1];
        (address < function.end_address).then_some(function)
    }

    /// Number of registered functions.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(windows)]
mod os {
    use super::RuntimeFunction;

    /// Push one entry into the OS function table. Registration failure
    /// is fatal: code the OS cannot unwind must never run.
    pub(super) fn add_growable_entry(function: &RuntimeFunction) {
        use windows_sys::Win32::System::Diagnostics::Debug::RtlAddFunctionTable;
        use windows_sys::Win32::System::Diagnostics::Debug::IMAGE_RUNTIME_FUNCTION_ENTRY;

        let base = function.begin_address & !0xFFFF;
        // The OS keeps a pointer to the entry; it must outlive the code
        // it describes, so it is leaked deliberately.
        let entry: &'static mut IMAGE_RUNTIME_FUNCTION_ENTRY =
            Box::leak(Box::new(unsafe { std::mem::zeroed() }));
        entry.BeginAddress = (function.begin_address - base) as u32;
        entry.EndAddress = (function.end_address - base) as u32;
        entry.Anonymous.UnwindInfoAddress = function.unwind_info.wrapping_sub(base) as u32;

        let ok = unsafe { RtlAddFunctionTable(entry, 1, base) };
        if ok == 0 {
            crate::error::fatal_out_of_memory("function table registration");
        }
    }
}
