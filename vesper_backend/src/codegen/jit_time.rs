//! JIT-time snapshots of runtime state.
//!
//! Codegen may run on a background thread or in a separate process, so
//! the backend never reads live, GC-managed runtime objects. Everything
//! it needs is captured when the work item is created, as a fixed-layout
//! `#[repr(C)]` wire struct (`*Idl`) that can cross a process boundary
//! byte-for-byte, wrapped in a typed view (`Jit*`) the compiler reads.
//!
//! Every view type must have exactly the size of its wire struct; the
//! `same_size!` assertions make a layout drift a compile error rather
//! than a silent ABI break.

macro_rules! same_size {
    ($view:ty, $idl:ty) => {
        const _: () =
            assert!(std::mem::size_of::<$view>() == std::mem::size_of::<$idl>());
    };
}

// =============================================================================
// Wire structs
// =============================================================================

/// Wire layout of a runtime type snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct TypeIdl {
    /// Runtime type id.
    pub type_id: u32,
    /// Type flags (shared, has-special-properties, ...).
    pub flags: u32,
    /// Address of the prototype object.
    pub prototype_addr: u64,
    /// Address of the type's entry point.
    pub entry_point_addr: u64,
    /// The type's handler snapshot.
    pub handler: TypeHandlerIdl,
}

/// Wire layout of a type-handler snapshot: the object-layout facts
/// emitted property accesses depend on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct TypeHandlerIdl {
    /// Number of properties stored inline in the object.
    pub inline_slot_capacity: u16,
    /// Byte offset of the first inline slot.
    pub offset_of_inline_slots: u16,
    /// Handler flags (locked, shared, extensible).
    pub flags: u32,
    /// Total slot capacity, inline plus aux.
    pub slot_capacity: u32,
    /// Properties currently in use.
    pub property_count: u32,
}

/// Wire layout of a constructor-cache snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct CtorCacheIdl {
    /// Guard value the emitted check compares against.
    pub guard_value: u64,
    /// Address of the cached type.
    pub type_addr: u64,
    /// Slot count of objects the constructor produces.
    pub slot_count: u32,
    /// Inline slot count of those objects.
    pub inline_slot_count: u32,
    /// Packed booleans, see the `CTOR_FLAG_*` constants.
    pub flags: u32,
    pub _reserved: u32,
}

/// `CtorCacheIdl::flags`: `new.target` checks can be skipped.
pub const CTOR_FLAG_SKIP_NEW_SC_OBJECT: u32 = 1 << 0;
/// `CtorCacheIdl::flags`: the constructor never returns an explicit
/// object.
pub const CTOR_FLAG_NO_EXPLICIT_RETURN: u32 = 1 << 1;
/// `CtorCacheIdl::flags`: the cached type is final after construction.
pub const CTOR_FLAG_TYPE_IS_FINAL: u32 = 1 << 2;
/// `CtorCacheIdl::flags`: the cache updates after the constructor runs.
pub const CTOR_FLAG_UPDATE_AFTER_CTOR: u32 = 1 << 3;

/// Wire layout of a polymorphic-inline-cache utilization snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct PolyCacheInfoIdl {
    /// Address of the runtime cache array.
    pub caches_addr: u64,
    /// Number of cache slots.
    pub cache_count: u32,
    /// Bit per slot: profitable to specialize on.
    pub utilized_bits: u32,
}

/// Wire layout of one unit of codegen work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct CodeGenWorkItemIdl {
    /// Function to compile.
    pub function_id: u32,
    /// Loop number for loop-body jobs, `u32::MAX` for whole functions.
    pub loop_number: u32,
    /// Execution tier requested.
    pub jit_mode: u8,
    pub _reserved: [u8; 3],
    /// Byte-code size, for tier heuristics.
    pub byte_code_size: u32,
}

// =============================================================================
// Views
// =============================================================================

/// Typed view over [`TypeIdl`].
#[derive(Debug, Clone, Copy)]
#[repr(transparent)]
pub struct JitType {
    idl: TypeIdl,
}

same_size!(JitType, TypeIdl);

impl JitType {
    /// Wrap a captured snapshot.
    pub fn new(idl: TypeIdl) -> Self {
        JitType { idl }
    }

    /// Runtime type id.
    pub fn type_id(&self) -> u32 {
        self.idl.type_id
    }

    /// Prototype address, for emitted guard compares.
    pub fn prototype_addr(&self) -> u64 {
        self.idl.prototype_addr
    }

    /// Handler view.
    pub fn handler(&self) -> JitTypeHandler {
        JitTypeHandler { idl: self.idl.handler }
    }
}

/// Typed view over [`TypeHandlerIdl`].
#[derive(Debug, Clone, Copy)]
#[repr(transparent)]
pub struct JitTypeHandler {
    idl: TypeHandlerIdl,
}

same_size!(JitTypeHandler, TypeHandlerIdl);

impl JitTypeHandler {
    /// Wrap a captured snapshot.
    pub fn new(idl: TypeHandlerIdl) -> Self {
        JitTypeHandler { idl }
    }

    /// Number of inline slots.
    pub fn inline_slot_capacity(&self) -> u16 {
        self.idl.inline_slot_capacity
    }

    /// Byte offset of the first inline slot; emitted property loads
    /// index from here.
    pub fn offset_of_inline_slots(&self) -> u16 {
        self.idl.offset_of_inline_slots
    }

    /// Whether a property index lands in the inline slots.
    pub fn is_inline_slot(&self, slot_index: u32) -> bool {
        slot_index < self.idl.inline_slot_capacity as u32
    }

    /// Total slot capacity.
    pub fn slot_capacity(&self) -> u32 {
        self.idl.slot_capacity
    }
}

/// Typed view over [`CtorCacheIdl`].
#[derive(Debug, Clone, Copy)]
#[repr(transparent)]
pub struct JitTimeConstructorCache {
    idl: CtorCacheIdl,
}

same_size!(JitTimeConstructorCache, CtorCacheIdl);

impl JitTimeConstructorCache {
    /// Wrap a captured snapshot.
    pub fn new(idl: CtorCacheIdl) -> Self {
        JitTimeConstructorCache { idl }
    }

    /// Guard value for the emitted validity check.
    pub fn guard_value(&self) -> u64 {
        self.idl.guard_value
    }

    /// Cached type address.
    pub fn type_addr(&self) -> u64 {
        self.idl.type_addr
    }

    /// Inline slot count of constructed objects.
    pub fn inline_slot_count(&self) -> u32 {
        self.idl.inline_slot_count
    }

    /// Total slot count of constructed objects.
    pub fn slot_count(&self) -> u32 {
        self.idl.slot_count
    }

    /// Whether `new.target` checks can be skipped.
    pub fn skip_new_sc_object(&self) -> bool {
        self.idl.flags & CTOR_FLAG_SKIP_NEW_SC_OBJECT != 0
    }

    /// Whether the cached type stays final after construction.
    pub fn type_is_final(&self) -> bool {
        self.idl.flags & CTOR_FLAG_TYPE_IS_FINAL != 0
    }

    /// Whether the cache updates after the constructor body runs.
    pub fn update_after_ctor(&self) -> bool {
        self.idl.flags & CTOR_FLAG_UPDATE_AFTER_CTOR != 0
    }
}

/// Typed view over [`PolyCacheInfoIdl`].
#[derive(Debug, Clone, Copy)]
#[repr(transparent)]
pub struct JitTimePolymorphicInlineCacheInfo {
    idl: PolyCacheInfoIdl,
}

same_size!(JitTimePolymorphicInlineCacheInfo, PolyCacheInfoIdl);

impl JitTimePolymorphicInlineCacheInfo {
    /// Wrap a captured snapshot.
    pub fn new(idl: PolyCacheInfoIdl) -> Self {
        JitTimePolymorphicInlineCacheInfo { idl }
    }

    /// Number of cache slots.
    pub fn cache_count(&self) -> u32 {
        self.idl.cache_count
    }

    /// Whether a slot's observed utilization justifies specializing.
    pub fn is_utilized(&self, cache_index: u32) -> bool {
        debug_assert!(cache_index < 32);
        self.idl.utilized_bits & (1 << cache_index) != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_views_are_transparent() {
        // A view is its wire struct, nothing more; transmuting a
        // received buffer into the view type is the zero-copy path.
        assert_eq!(std::mem::size_of::<JitType>(), std::mem::size_of::<TypeIdl>());
        assert_eq!(std::mem::align_of::<JitType>(), std::mem::align_of::<TypeIdl>());
    }

    #[test]
    fn test_handler_slot_classification() {
        let handler = JitTypeHandler::new(TypeHandlerIdl {
            inline_slot_capacity: 4,
            offset_of_inline_slots: 16,
            flags: 0,
            slot_capacity: 12,
            property_count: 6,
        });
        assert!(handler.is_inline_slot(0));
        assert!(handler.is_inline_slot(3));
        assert!(!handler.is_inline_slot(4));
        assert_eq!(handler.offset_of_inline_slots(), 16);
    }

    #[test]
    fn test_ctor_cache_flags() {
        let cache = JitTimeConstructorCache::new(CtorCacheIdl {
            guard_value: 0xABCD,
            type_addr: 0x1000,
            slot_count: 8,
            inline_slot_count: 4,
            flags: CTOR_FLAG_TYPE_IS_FINAL | CTOR_FLAG_UPDATE_AFTER_CTOR,
            _reserved: 0,
        });
        assert!(cache.type_is_final());
        assert!(cache.update_after_ctor());
        assert!(!cache.skip_new_sc_object());
        assert_eq!(cache.guard_value(), 0xABCD);
    }

    #[test]
    fn test_poly_cache_utilization() {
        let info = JitTimePolymorphicInlineCacheInfo::new(PolyCacheInfoIdl {
            caches_addr: 0x2000,
            cache_count: 8,
            utilized_bits: 0b1010,
        });
        assert!(!info.is_utilized(0));
        assert!(info.is_utilized(1));
        assert!(info.is_utilized(3));
        assert!(!info.is_utilized(4));
    }
}
