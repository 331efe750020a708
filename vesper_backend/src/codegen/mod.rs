//! The native code generator.
//!
//! Owns the queue of [`CodeGenWorkItem`]s, a background codegen thread,
//! and the installed-entry-point registry the dispatch path reads. The
//! interpreter's call path never learns anything about codegen: it asks
//! whether a function's entry point is still the check-codegen thunk
//! (not yet compiled) and calls whatever address it gets back.
//!
//! `close` is a two-state latch. Once closed, no new work is accepted;
//! in-flight background compiles finish normally but their results are
//! discarded instead of installed, so teardown never races an install
//! into freed runtime state.

pub mod exec_buffer;
pub mod function_body;
pub mod jit_time;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use vesper_core::config::{EngineConfig, Phase};

use crate::bailout::BailOutKind;
use crate::encoder::eh_frame::EhFrame;
use crate::encoder::pdata::{PDataHandle, PDataManager, RuntimeFunction};
use crate::encoder::{Encoder, NativeEncoderMd};
use crate::error::{CodeGenError, CodeGenResult};
use crate::ir::IrFunc;
use crate::regalloc::{build_lifetimes, LinearScan, NativeLinearScanMd};

pub use exec_buffer::ExecutableBuffer;
pub use function_body::{FunctionBody, StatementMapEntry};
pub use jit_time::{
    CodeGenWorkItemIdl, CtorCacheIdl, JitTimeConstructorCache,
    JitTimePolymorphicInlineCacheInfo, JitType, JitTypeHandler, PolyCacheInfoIdl, TypeHandlerIdl,
    TypeIdl,
};

// =============================================================================
// Work items
// =============================================================================

/// Requested execution tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JitMode {
    /// Fast compile, light optimization.
    Simple,
    /// Full optimizing compile.
    Full,
}

/// What a work item compiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkItemKind {
    /// A whole function body.
    Function,
    /// One loop body, by loop number.
    LoopBody(u32),
}

/// One unit of compilation: the function (or loop body), its IR, and
/// the JIT-time snapshots captured when it was queued.
pub struct CodeGenWorkItem {
    /// Function descriptor snapshot.
    pub body: FunctionBody,
    /// The IR to compile, produced by the IR builder.
    pub func: IrFunc,
    /// Function or loop body.
    pub kind: WorkItemKind,
    /// Requested tier.
    pub jit_mode: JitMode,
    /// Constructor-cache snapshots referenced by the IR.
    pub ctor_caches: Vec<JitTimeConstructorCache>,
    /// Polymorphic-cache utilization snapshot, if profiled.
    pub poly_cache_info: Option<JitTimePolymorphicInlineCacheInfo>,
}

impl CodeGenWorkItem {
    /// Create a whole-function work item.
    pub fn function(body: FunctionBody, func: IrFunc, jit_mode: JitMode) -> Self {
        CodeGenWorkItem {
            body,
            func,
            kind: WorkItemKind::Function,
            jit_mode,
            ctor_caches: Vec::new(),
            poly_cache_info: None,
        }
    }
}

// =============================================================================
// Compiled code
// =============================================================================

/// One bailout site of installed code.
#[derive(Debug, Clone, Copy)]
pub struct InstalledBailOut {
    /// Code offset of the transfer sequence.
    pub code_offset: u32,
    /// Byte-code offset to resume at.
    pub byte_code_offset: u32,
    /// Why the site bails.
    pub kind: BailOutKind,
}

/// Installed native code for one function, owning its memory and unwind
/// registration.
pub struct CompiledCode {
    buffer: ExecutableBuffer,
    entry: usize,
    #[allow(dead_code)] // keeps the registered frame alive
    eh_frame: EhFrame,
    pdata: PDataHandle,
    /// Bailout sites, sorted by code offset.
    pub bailouts: Vec<InstalledBailOut>,
}

impl CompiledCode {
    /// Entry address.
    pub fn entry(&self) -> usize {
        self.entry
    }

    /// Code size in bytes.
    pub fn size(&self) -> usize {
        self.buffer.len()
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Counters exposed for diagnostics.
#[derive(Debug, Default)]
pub struct CodeGenStats {
    /// Work items compiled and installed.
    pub functions_installed: AtomicU64,
    /// Compiles that failed (function stays interpreted).
    pub functions_failed: AtomicU64,
    /// Compiles completed after close and discarded.
    pub functions_discarded: AtomicU64,
}

// =============================================================================
// NativeCodeGen
// =============================================================================

/// The address handed out for not-yet-compiled functions.
///
/// The interpreter installs this as the function's entry point; calling
/// it requests compilation through the runtime's call path.
extern "C" fn check_codegen_thunk_target() {
    // Reached only through a mis-wired dispatch table.
    unreachable!("check-codegen thunk executed directly");
}

struct Shared {
    queue: Mutex<VecDeque<CodeGenWorkItem>>,
    work_available: Condvar,
    is_closed: AtomicBool,
    entry_points: DashMap<u32, usize>,
    compiled: Mutex<Vec<CompiledCode>>,
    pdata: PDataManager,
    stats: CodeGenStats,
    /// Address bailout sequences call into.
    bailout_helper: usize,
}

impl Shared {
    fn compile(&self, item: CodeGenWorkItem) -> CodeGenResult<(u32, CompiledCode)> {
        let CodeGenWorkItem { body, mut func, .. } = item;

        func.number_instrs();
        let lifetimes = build_lifetimes(&func);
        let md = NativeLinearScanMd::default();
        let phases = vesper_core::config::PhaseFlags::new();
        let (allocs, _stats) = LinearScan::new(&md, &phases).allocate(&func, lifetimes);

        let encoded = Encoder::new(NativeEncoderMd::default()).encode(&func, &allocs)?;

        let mut buffer =
            ExecutableBuffer::new(encoded.code.len()).ok_or(CodeGenError::OutOfMemory)?;
        if !buffer.write(&encoded.code) {
            return Err(CodeGenError::OutOfMemory);
        }
        let base = buffer.as_ptr() as u64;

        // Resolve install-time fixups: jump tables get absolute entry
        // addresses, bailout sites get the helper.
        for table in &encoded.jump_tables {
            buffer.patch_u64(table.imm64_patch_offset as usize, base + table.table_offset as u64);
            for (slot, label) in table.entry_labels.iter().enumerate() {
                let target = encoded.label_offsets.get(label).copied().unwrap_or(0);
                buffer.patch_u64(
                    table.table_offset as usize + slot * 8,
                    base + target as u64,
                );
            }
        }
        let mut bailouts = Vec::with_capacity(encoded.bailout_sites.len());
        for site in &encoded.bailout_sites {
            buffer.patch_u64(site.imm64_patch_offset as usize, self.bailout_helper as u64);
            bailouts.push(InstalledBailOut {
                code_offset: site.imm64_patch_offset,
                byte_code_offset: site.byte_code_offset,
                kind: site.kind,
            });
        }

        if !buffer.finalize() {
            return Err(CodeGenError::OutOfMemory);
        }

        // Unwind metadata: the registered range must exactly bound the
        // emitted body.
        let mut eh_frame = EhFrame::new();
        eh_frame.update_address_range(base, buffer.len() as u64);
        eh_frame.end();
        let pdata = self.pdata.register_function(RuntimeFunction {
            begin_address: base,
            end_address: base + buffer.len() as u64,
            unwind_info: eh_frame.buffer().as_ptr() as u64,
        });

        let entry = buffer.as_ptr() as usize;
        Ok((body.id, CompiledCode { buffer, entry, eh_frame, pdata, bailouts }))
    }

    fn install(&self, function_id: u32, code: CompiledCode) {
        self.entry_points.insert(function_id, code.entry());
        self.compiled.lock().push(code);
        self.stats.functions_installed.fetch_add(1, Ordering::Relaxed);
    }

    fn worker_loop(&self) {
        loop {
            let item = {
                let mut queue = self.queue.lock();
                loop {
                    if let Some(item) = queue.pop_front() {
                        break item;
                    }
                    if self.is_closed.load(Ordering::Acquire) {
                        return;
                    }
                    self.work_available.wait(&mut queue);
                }
            };

            match self.compile(item) {
                Ok((function_id, code)) => {
                    // A compile that finished after close completes but
                    // is never installed.
                    if self.is_closed.load(Ordering::Acquire) {
                        self.stats.functions_discarded.fetch_add(1, Ordering::Relaxed);
                        self.pdata.unregister_function(code.pdata);
                    } else {
                        self.install(function_id, code);
                    }
                }
                Err(_) => {
                    self.stats.functions_failed.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }
}

/// The JIT driver.
pub struct NativeCodeGen {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
    profile_mode: AtomicBool,
    debug_mode: AtomicBool,
}

impl NativeCodeGen {
    /// Create a driver, spawning the background thread unless disabled
    /// by configuration.
    pub fn new(config: &EngineConfig) -> Self {
        Self::with_bailout_helper(config, default_bailout_helper as usize)
    }

    /// Create a driver with an explicit bailout helper address.
    pub fn with_bailout_helper(config: &EngineConfig, bailout_helper: usize) -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            work_available: Condvar::new(),
            is_closed: AtomicBool::new(false),
            entry_points: DashMap::new(),
            compiled: Mutex::new(Vec::new()),
            pdata: PDataManager::new(),
            stats: CodeGenStats::default(),
            bailout_helper,
        });

        let background = config.codegen_threads > 0
            && !config.phases.is_off(Phase::BackgroundCodeGen);
        let worker = background.then(|| {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("vesper-codegen".into())
                .spawn(move || shared.worker_loop())
                .expect("spawn codegen thread")
        });

        NativeCodeGen {
            shared,
            worker,
            profile_mode: AtomicBool::new(false),
            debug_mode: AtomicBool::new(false),
        }
    }

    // ---- entry-point queries ----

    /// The thunk address installed for not-yet-compiled functions.
    pub fn check_codegen_thunk(&self) -> usize {
        check_codegen_thunk_target as usize
    }

    /// Whether `entry` is the check-codegen thunk (i.e. the function has
    /// not been compiled yet).
    pub fn is_codegen_thunk(&self, entry: usize) -> bool {
        entry == self.check_codegen_thunk()
    }

    /// The callable entry point for a function: its compiled code, or
    /// the thunk if compilation has not finished.
    pub fn entry_point(&self, function_id: u32) -> usize {
        self.shared
            .entry_points
            .get(&function_id)
            .map(|entry| *entry)
            .unwrap_or_else(|| self.check_codegen_thunk())
    }

    // ---- compilation entry points ----

    /// Compile and install a function on the calling thread.
    pub fn generate_function(&self, item: CodeGenWorkItem) -> CodeGenResult<usize> {
        if self.is_closed() {
            return Err(CodeGenError::Closed);
        }
        let (function_id, code) = self.shared.compile(item)?;
        let entry = code.entry();
        self.shared.install(function_id, code);
        Ok(entry)
    }

    /// Compile a loop body on the calling thread.
    pub fn generate_loop_body(&self, item: CodeGenWorkItem) -> CodeGenResult<usize> {
        debug_assert!(matches!(item.kind, WorkItemKind::LoopBody(_)));
        self.generate_function(item)
    }

    /// Queue a function for background compilation.
    pub fn queue_function(&self, item: CodeGenWorkItem) -> CodeGenResult<()> {
        if self.is_closed() {
            return Err(CodeGenError::Closed);
        }
        if self.worker.is_none() {
            // No background thread: compile in the foreground instead.
            self.generate_function(item)?;
            return Ok(());
        }
        self.shared.queue.lock().push_back(item);
        self.shared.work_available.notify_one();
        Ok(())
    }

    /// Compile a batch of functions in the foreground.
    pub fn generate_all_functions(
        &self,
        items: Vec<CodeGenWorkItem>,
    ) -> CodeGenResult<Vec<usize>> {
        items.into_iter().map(|item| self.generate_function(item)).collect()
    }

    // ---- mode switches ----

    /// Enter debug mode: dispatch must stop trusting installed code.
    pub fn update_for_debug_mode(&self) {
        self.debug_mode.store(true, Ordering::Release);
    }

    /// Whether debug mode is active.
    pub fn is_in_debug_mode(&self) -> bool {
        self.debug_mode.load(Ordering::Acquire)
    }

    /// Toggle profiling codegen.
    pub fn set_profile_mode(&self, enabled: bool) {
        self.profile_mode.store(enabled, Ordering::Release);
    }

    /// Whether profiling codegen is active.
    pub fn is_profile_mode(&self) -> bool {
        self.profile_mode.load(Ordering::Acquire)
    }

    // ---- teardown ----

    /// Close the generator: reject new work, drain the background
    /// thread cooperatively, and return once it has exited.
    pub fn close(&mut self) {
        if self.shared.is_closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.work_available.notify_all();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }

    /// Whether `close` has run.
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed.load(Ordering::Acquire)
    }

    /// Diagnostic counters.
    pub fn stats(&self) -> &CodeGenStats {
        &self.shared.stats
    }
}

impl Drop for NativeCodeGen {
    fn drop(&mut self) {
        self.close();
    }
}

/// Default bailout helper: patched in for bailout sites when the
/// embedder supplies none. Installed code built by tests never executes
/// its bailout path.
extern "C" fn default_bailout_helper() {
    unreachable!("bailout helper executed without an interpreter");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{IRType, Instr, OpCode, Opnd};

    fn trivial_item(id: u32, value: i32) -> CodeGenWorkItem {
        let mut func = IrFunc::new();
        let a = func.new_sym(IRType::Int32);
        func.arena.append(
            Instr::new(OpCode::Ld)
                .with_dst(Opnd::reg(a, IRType::Int32))
                .with_src1(Opnd::int32(value)),
        );
        func.arena.append(Instr::new(OpCode::Ret));
        CodeGenWorkItem::function(FunctionBody::new(id), func, JitMode::Full)
    }

    fn foreground_config() -> EngineConfig {
        EngineConfig { codegen_threads: 0, ..EngineConfig::default() }
    }

    #[test]
    fn test_thunk_identity() {
        let codegen = NativeCodeGen::new(&foreground_config());
        let thunk = codegen.check_codegen_thunk();
        assert!(codegen.is_codegen_thunk(thunk));
        assert!(!codegen.is_codegen_thunk(thunk + 1));
        // Unknown functions resolve to the thunk.
        assert_eq!(codegen.entry_point(1234), thunk);
    }

    #[test]
    fn test_foreground_generate_installs_entry() {
        let codegen = NativeCodeGen::new(&foreground_config());
        let entry = codegen.generate_function(trivial_item(7, 42)).expect("compile");
        assert!(!codegen.is_codegen_thunk(entry));
        assert_eq!(codegen.entry_point(7), entry);
        assert_eq!(codegen.stats().functions_installed.load(Ordering::Relaxed), 1);
    }

    #[test]
    #[cfg(target_arch = "x86_64")]
    fn test_generated_code_executes() {
        let codegen = NativeCodeGen::new(&foreground_config());
        let entry = codegen.generate_function(trivial_item(1, 42)).expect("compile");
        let f: extern "C" fn() -> u64 = unsafe { std::mem::transmute(entry) };
        assert_eq!(f(), 42);

        let entry = codegen.generate_function(trivial_item(2, 7)).expect("compile");
        let f: extern "C" fn() -> u64 = unsafe { std::mem::transmute(entry) };
        assert_eq!(f(), 7);
    }

    #[test]
    fn test_background_queue_compiles() {
        let config = EngineConfig { codegen_threads: 1, ..EngineConfig::default() };
        let mut codegen = NativeCodeGen::new(&config);
        codegen.queue_function(trivial_item(9, 1)).expect("queue");

        // Wait for the background install.
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while codegen.is_codegen_thunk(codegen.entry_point(9)) {
            assert!(std::time::Instant::now() < deadline, "background compile timed out");
            std::thread::yield_now();
        }
        codegen.close();
        assert!(codegen.is_closed());
    }

    #[test]
    fn test_close_latch() {
        let config = EngineConfig { codegen_threads: 1, ..EngineConfig::default() };
        let mut codegen = NativeCodeGen::new(&config);
        assert!(!codegen.is_closed());
        codegen.close();
        assert!(codegen.is_closed());
        // Idempotent.
        codegen.close();

        assert_eq!(codegen.queue_function(trivial_item(1, 1)), Err(CodeGenError::Closed));
        assert!(codegen.generate_function(trivial_item(2, 2)).is_err());
    }

    #[test]
    fn test_generate_all_functions() {
        let codegen = NativeCodeGen::new(&foreground_config());
        let entries = codegen
            .generate_all_functions(vec![trivial_item(1, 1), trivial_item(2, 2)])
            .expect("compile all");
        assert_eq!(entries.len(), 2);
        assert_ne!(entries[0], entries[1]);
    }

    #[test]
    fn test_mode_switches() {
        let codegen = NativeCodeGen::new(&foreground_config());
        assert!(!codegen.is_in_debug_mode());
        codegen.update_for_debug_mode();
        assert!(codegen.is_in_debug_mode());

        assert!(!codegen.is_profile_mode());
        codegen.set_profile_mode(true);
        assert!(codegen.is_profile_mode());
        codegen.set_profile_mode(false);
        assert!(!codegen.is_profile_mode());
    }
}
