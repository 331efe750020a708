//! Inlining policy.
//!
//! Pure heuristics, separate from inlining mechanics: given immutable
//! profile data, decide whether a call site is worth inlining. The
//! decider carries running state for one top-level compile: the
//! byte-code budget consumed so far and how many loop-containing
//! inlinees speculation has produced. That makes `inline_call_site` calls are
//! order-sensitive and the state is reset per compile. Nothing here is
//! thread-shared.

use crate::codegen::FunctionBody;

/// Requested execution tier, as the decider sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Lightly optimizing tier; inlining restricted to leaves.
    SimpleJit,
    /// Full optimizing tier.
    FullJit,
}

// =============================================================================
// Thresholds
// =============================================================================

/// Byte-code-size ceilings per call-site shape.
#[derive(Debug, Clone)]
pub struct InliningThreshold {
    /// Plain monomorphic calls.
    pub inline_threshold: u32,
    /// Constructor calls.
    pub constructor_inline_threshold: u32,
    /// Call sites outside any loop.
    pub outside_loop_inline_threshold: u32,
    /// Leaf inlinees (no profiled call sites of their own).
    pub leaf_inline_threshold: u32,
    /// Inlinees containing loops.
    pub loop_inline_threshold: u32,
    /// Polymorphic call sites.
    pub polymorphic_inline_threshold: u32,
    /// Call sites with constant arguments (folding potential).
    pub constant_argument_inline_threshold: u32,
    /// Total inlined byte code allowed in one top-level compile.
    pub inline_count_max: u32,
    /// Cap on loop-containing inlinees before inlining them stops.
    pub max_number_of_inlinees_with_loop: u32,
    /// Deepest allowed self-recursive inlining.
    pub max_recursive_depth: u32,
}

impl InliningThreshold {
    /// Default thresholds.
    pub fn new() -> Self {
        InliningThreshold {
            inline_threshold: 35,
            constructor_inline_threshold: 21,
            outside_loop_inline_threshold: 16,
            leaf_inline_threshold: 60,
            loop_inline_threshold: 25,
            polymorphic_inline_threshold: 32,
            constant_argument_inline_threshold: 157,
            inline_count_max: 1200,
            max_number_of_inlinees_with_loop: 40,
            max_recursive_depth: 2,
        }
    }

    /// Loosen every ceiling; used when profile data shows a hot,
    /// call-dominated function.
    pub fn set_aggressive_heuristics(&mut self) {
        self.inline_threshold *= 2;
        self.constructor_inline_threshold *= 2;
        self.leaf_inline_threshold *= 2;
        self.loop_inline_threshold *= 2;
        self.polymorphic_inline_threshold *= 2;
    }

    /// Back to defaults.
    pub fn reset(&mut self) {
        *self = InliningThreshold::new();
    }
}

impl Default for InliningThreshold {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Call-site description
// =============================================================================

/// What the profile knows about one call site.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallSiteInfo {
    /// The site constructs (`new`).
    pub is_constructor_call: bool,
    /// Multiple targets observed.
    pub is_polymorphic_call: bool,
    /// Number of arguments known constant.
    pub constant_arg_count: u16,
    /// Depth of self-recursive inlining already performed.
    pub recursive_inline_depth: u32,
    /// The site sits inside a loop of the inliner.
    pub is_inside_loop: bool,
}

// =============================================================================
// Decider
// =============================================================================

/// Per-top-level-compile inlining policy.
pub struct InliningDecider<'a> {
    threshold: InliningThreshold,
    top_func: &'a FunctionBody,
    is_loop_body: bool,
    is_in_debug_mode: bool,
    jit_mode: ExecutionMode,

    // Running state, reset per compile.
    bytecode_inlined_count: u32,
    number_of_inlinees_with_loop: u32,
}

impl<'a> InliningDecider<'a> {
    /// Create a decider for one top-level compile.
    pub fn new(
        top_func: &'a FunctionBody,
        is_loop_body: bool,
        is_in_debug_mode: bool,
        jit_mode: ExecutionMode,
    ) -> Self {
        InliningDecider {
            threshold: InliningThreshold::new(),
            top_func,
            is_loop_body,
            is_in_debug_mode,
            jit_mode,
            bytecode_inlined_count: 0,
            number_of_inlinees_with_loop: 0,
        }
    }

    // ---- predicates over immutable state ----

    /// Whether inlining into the top-level function is allowed at all.
    pub fn inline_into_top_func(&self) -> bool {
        // Step-debugging needs every frame real; loop bodies have no
        // inlining support.
        !self.is_in_debug_mode && !self.is_loop_body && self.jit_mode == ExecutionMode::FullJit
    }

    /// Whether an already-inlined function may inline further calls.
    pub fn inline_into_inliner(&self, inliner: &FunctionBody) -> bool {
        self.inline_into_top_func()
            && !inliner.is_in_debug_mode
            && inliner.profiled_call_site_count > 0
    }

    /// Whether the accumulated budget still permits more inlining.
    pub fn continue_inlining_user_defined_functions(&self, bytecode_inlined_count: u32) -> bool {
        bytecode_inlined_count < self.threshold.inline_count_max
    }

    // ---- the decision ----

    /// Decide one call site; consumes budget on acceptance, so call
    /// order matters.
    pub fn inline_call_site(
        &mut self,
        inliner: &FunctionBody,
        inlinee: &FunctionBody,
        site: CallSiteInfo,
    ) -> bool {
        if !self.inline_into_inliner(inliner) && inliner.id != self.top_func.id {
            return false;
        }
        if !self.inline_into_top_func() {
            return false;
        }
        if inlinee.is_in_debug_mode {
            return false;
        }
        if site.recursive_inline_depth > self.threshold.max_recursive_depth {
            return false;
        }
        if !self.continue_inlining_user_defined_functions(self.bytecode_inlined_count) {
            return false;
        }

        let size = inlinee.byte_code_size();
        if self.bytecode_inlined_count.saturating_add(size) > self.threshold.inline_count_max {
            return false;
        }

        if inlinee.has_loops()
            && self.number_of_inlinees_with_loop >= self.threshold.max_number_of_inlinees_with_loop
        {
            return false;
        }

        let ceiling = self.site_threshold(inlinee, site);
        if size > ceiling {
            return false;
        }

        self.bytecode_inlined_count += size;
        if inlinee.has_loops() {
            self.number_of_inlinees_with_loop += 1;
        }
        true
    }

    /// The ceiling applicable to one call site: the most permissive of
    /// the shapes that apply, gated down for sites outside loops.
    fn site_threshold(&self, inlinee: &FunctionBody, site: CallSiteInfo) -> u32 {
        let t = &self.threshold;
        let is_leaf = inlinee.profiled_call_site_count == 0;

        let mut ceiling = t.inline_threshold;
        if site.is_constructor_call {
            ceiling = t.constructor_inline_threshold;
        }
        if site.is_polymorphic_call {
            ceiling = ceiling.min(t.polymorphic_inline_threshold);
        }
        if inlinee.has_loops() {
            ceiling = ceiling.min(t.loop_inline_threshold);
        }
        if is_leaf {
            ceiling = ceiling.max(t.leaf_inline_threshold);
        }
        if site.constant_arg_count > 0 {
            ceiling = ceiling.max(t.constant_argument_inline_threshold);
        }
        if !site.is_inside_loop && !is_leaf {
            ceiling = ceiling.min(t.outside_loop_inline_threshold);
        }
        ceiling
    }

    // ---- running state ----

    /// Byte code inlined so far in this compile.
    pub fn bytecode_inlined_count(&self) -> u32 {
        self.bytecode_inlined_count
    }

    /// Loop-containing inlinees so far.
    pub fn number_of_inlinees_with_loop(&self) -> u32 {
        self.number_of_inlinees_with_loop
    }

    /// Count one more loop-containing inlinee (used by polymorphic
    /// paths that inline outside `inline_call_site`).
    pub fn increment_number_of_inlinees_with_loop(&mut self) {
        self.number_of_inlinees_with_loop += 1;
    }

    /// Tighten the loop-inlinee limit after a speculative pass found
    /// too many: beyond the cap, stop inlining them entirely.
    pub fn set_limit_on_inlinees_with_loop(&mut self, count_of_inlinees_with_loop: u32) {
        if self.threshold.max_number_of_inlinees_with_loop <= count_of_inlinees_with_loop {
            self.threshold.max_number_of_inlinees_with_loop = 0;
        }
    }

    /// Loosen thresholds for a hot compile.
    pub fn set_aggressive_heuristics(&mut self) {
        self.threshold.set_aggressive_heuristics();
    }

    /// Restore default thresholds.
    pub fn reset_inline_heuristics(&mut self) {
        self.threshold.reset();
    }

    /// Clear per-compile running state.
    pub fn reset_state(&mut self) {
        self.bytecode_inlined_count = 0;
        self.number_of_inlinees_with_loop = 0;
    }
}
