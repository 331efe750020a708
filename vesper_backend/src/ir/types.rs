//! IR value types.
//!
//! Every operand carries an [`IRType`] describing its machine-level
//! representation. All classification queries are O(1) lookups into a
//! static info table generated from the single `irtype_table!` invocation
//! below; adding a type means adding one table row, never touching the
//! query code.
//!
//! Operand widths are a hard contract: mixing widths without an explicit
//! convert instruction is a bug upstream, and both the register allocator
//! and the encoder assume it cannot happen.

use std::fmt;

/// Base representation category of an [`IRType`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TypeCategory {
    /// Signed two's-complement integer.
    SignedInt,
    /// Unsigned integer.
    UnsignedInt,
    /// IEEE floating point.
    Float,
    /// 128-bit SIMD vector.
    Simd,
    /// Tagged runtime value.
    Var,
    /// Condition code (flags register); never register-allocated.
    CondCode,
    /// No value (void destinations).
    Misc,
}

struct TypeInfo {
    category: TypeCategory,
    size_bytes: u8,
    reg_allocatable: bool,
    name: &'static str,
}

macro_rules! irtype_table {
    ($( $variant:ident = $idx:literal : $category:ident, $size:literal, $alloc:literal, $name:literal; )*) => {
        /// Machine-level type of an IR operand.
        #[derive(Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum IRType {
            $( $variant = $idx, )*
        }

        const TYPE_INFO: &[TypeInfo] = &[
            $( TypeInfo {
                category: TypeCategory::$category,
                size_bytes: $size,
                reg_allocatable: $alloc,
                name: $name,
            }, )*
        ];

        impl IRType {
            /// All types, in table order.
            pub const ALL: &'static [IRType] = &[ $( IRType::$variant, )* ];
        }
    };
}

irtype_table! {
    Illegal   = 0  : Misc,        0,  false, "illegal";
    Int8      = 1  : SignedInt,   1,  true,  "i8";
    Int16     = 2  : SignedInt,   2,  true,  "i16";
    Int32     = 3  : SignedInt,   4,  true,  "i32";
    Int64     = 4  : SignedInt,   8,  true,  "i64";
    Uint8     = 5  : UnsignedInt, 1,  true,  "u8";
    Uint16    = 6  : UnsignedInt, 2,  true,  "u16";
    Uint32    = 7  : UnsignedInt, 4,  true,  "u32";
    Uint64    = 8  : UnsignedInt, 8,  true,  "u64";
    Float32   = 9  : Float,       4,  true,  "f32";
    Float64   = 10 : Float,       8,  true,  "f64";
    Simd128F4 = 11 : Simd,        16, true,  "simd128.f4";
    Simd128I4 = 12 : Simd,        16, true,  "simd128.i4";
    Simd128D2 = 13 : Simd,        16, true,  "simd128.d2";
    Var       = 14 : Var,         8,  true,  "var";
    CondCode  = 15 : CondCode,    0,  false, "cc";
}

impl IRType {
    #[inline]
    fn info(self) -> &'static TypeInfo {
        // Enum discriminants are dense table indices.
        &TYPE_INFO[self as usize]
    }

    /// Representation category.
    #[inline]
    pub fn category(self) -> TypeCategory {
        self.info().category
    }

    /// Size in bytes (0 for non-value types).
    #[inline]
    pub fn size_bytes(self) -> usize {
        self.info().size_bytes as usize
    }

    /// Size in bits.
    #[inline]
    pub fn size_bits(self) -> usize {
        self.size_bytes() * 8
    }

    /// Whether the register allocator may place this type in a register.
    #[inline]
    pub fn is_reg_allocatable(self) -> bool {
        self.info().reg_allocatable
    }

    /// Signed integer of any width.
    #[inline]
    pub fn is_signed_int(self) -> bool {
        self.category() == TypeCategory::SignedInt
    }

    /// Unsigned integer of any width.
    #[inline]
    pub fn is_unsigned_int(self) -> bool {
        self.category() == TypeCategory::UnsignedInt
    }

    /// Any integer.
    #[inline]
    pub fn is_int(self) -> bool {
        self.is_signed_int() || self.is_unsigned_int()
    }

    /// Floating point of any width.
    #[inline]
    pub fn is_float(self) -> bool {
        self.category() == TypeCategory::Float
    }

    /// Any 128-bit SIMD variant.
    #[inline]
    pub fn is_simd128(self) -> bool {
        self.category() == TypeCategory::Simd
    }

    /// Tagged runtime value.
    #[inline]
    pub fn is_var(self) -> bool {
        self.category() == TypeCategory::Var
    }

    /// Whether two types have identical machine width.
    #[inline]
    pub fn same_size(self, other: IRType) -> bool {
        self.size_bytes() == other.size_bytes()
    }
}

impl fmt::Debug for IRType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.info().name)
    }
}

impl fmt::Display for IRType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_is_dense() {
        for (i, &ty) in IRType::ALL.iter().enumerate() {
            assert_eq!(ty as usize, i);
        }
        assert_eq!(TYPE_INFO.len(), IRType::ALL.len());
    }

    #[test]
    fn test_classification() {
        assert!(IRType::Int32.is_signed_int());
        assert!(!IRType::Int32.is_unsigned_int());
        assert!(IRType::Uint16.is_unsigned_int());
        assert!(IRType::Float64.is_float());
        assert!(IRType::Simd128F4.is_simd128());
        assert!(IRType::Var.is_var());
        assert!(!IRType::CondCode.is_reg_allocatable());
        assert!(!IRType::Illegal.is_reg_allocatable());
    }

    #[test]
    fn test_sizes() {
        assert_eq!(IRType::Int8.size_bytes(), 1);
        assert_eq!(IRType::Int32.size_bits(), 32);
        assert_eq!(IRType::Float64.size_bytes(), 8);
        assert_eq!(IRType::Simd128I4.size_bytes(), 16);
        assert_eq!(IRType::Var.size_bytes(), 8);
        assert!(IRType::Int64.same_size(IRType::Var));
        assert!(!IRType::Int32.same_size(IRType::Int64));
    }
}
