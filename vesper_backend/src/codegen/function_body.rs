//! Function-body descriptor.
//!
//! The minimal surface the backend needs from the bytecode front end:
//! the byte-code buffer, constant table, statement map, and the profile
//! counts the inlining policy reads. This is a snapshot, not a live
//! object; it is captured with the work item and immutable during
//! compilation.

use vesper_core::Var;

/// Maps a byte-code offset to its source statement, for bailout-time
/// attribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatementMapEntry {
    /// Byte-code offset the statement starts at.
    pub byte_code_offset: u32,
    /// Statement index in the source.
    pub statement_index: u32,
}

/// Immutable description of one function body.
#[derive(Debug, Clone)]
pub struct FunctionBody {
    /// Stable function handle.
    pub id: u32,
    /// Raw byte code.
    pub byte_code: Vec<u8>,
    /// Constant table, indexed by constant register.
    pub constants: Vec<Var>,
    /// Statement map, sorted by byte-code offset.
    pub statement_map: Vec<StatementMapEntry>,
    /// Number of profiled call sites.
    pub profiled_call_site_count: u32,
    /// Number of loops.
    pub loop_count: u32,
    /// Number of inline-cache slots.
    pub inline_cache_count: u32,
    /// Whether the function is being debugged (suppresses inlining).
    pub is_in_debug_mode: bool,
}

impl FunctionBody {
    /// Create a descriptor with empty tables.
    pub fn new(id: u32) -> Self {
        FunctionBody {
            id,
            byte_code: Vec::new(),
            constants: Vec::new(),
            statement_map: Vec::new(),
            profiled_call_site_count: 0,
            loop_count: 0,
            inline_cache_count: 0,
            is_in_debug_mode: false,
        }
    }

    /// Byte-code size, the unit of inlining budgets.
    #[inline]
    pub fn byte_code_size(&self) -> u32 {
        self.byte_code.len() as u32
    }

    /// Whether the function contains loops.
    #[inline]
    pub fn has_loops(&self) -> bool {
        self.loop_count > 0
    }

    /// Statement containing `byte_code_offset`, if mapped.
    pub fn statement_at(&self, byte_code_offset: u32) -> Option<u32> {
        let position = self
            .statement_map
            .partition_point(|entry| entry.byte_code_offset <= byte_code_offset);
        (position > 0).then(|| self.statement_map[position - 1].statement_index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statement_lookup() {
        let mut body = FunctionBody::new(1);
        body.statement_map = vec![
            StatementMapEntry { byte_code_offset: 0, statement_index: 0 },
            StatementMapEntry { byte_code_offset: 10, statement_index: 1 },
            StatementMapEntry { byte_code_offset: 30, statement_index: 2 },
        ];
        assert_eq!(body.statement_at(0), Some(0));
        assert_eq!(body.statement_at(9), Some(0));
        assert_eq!(body.statement_at(10), Some(1));
        assert_eq!(body.statement_at(100), Some(2));
    }

    #[test]
    fn test_sizes() {
        let mut body = FunctionBody::new(1);
        assert_eq!(body.byte_code_size(), 0);
        assert!(!body.has_loops());
        body.byte_code = vec![0; 48];
        body.loop_count = 2;
        assert_eq!(body.byte_code_size(), 48);
        assert!(body.has_loops());
    }
}
