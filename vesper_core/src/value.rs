//! Tagged `Var` value representation.
//!
//! A `Var` is a single 64-bit word holding one of:
//!
//! - a **tagged int32**: the integer in the low 32 bits with the int tag
//!   (bit 48) set above it,
//! - an **encoded float64**: the IEEE bits XORed with the float mask,
//!   which shifts every valid double out of the pointer/tagged-int range,
//! - a **heap pointer**: a canonical 48-bit address, stored untouched.
//!
//! The encoding matters beyond this crate: bailout constant restoration
//! and JIT-emitted type checks both assume these exact bit patterns.
//! Changing a mask here is an ABI break for generated code.

use std::fmt;

/// Tag added above the low 32 bits for tagged integers.
const INT_TAG: u64 = 0x0001_0000_0000_0000;

/// XOR mask applied to raw `f64` bits.
///
/// Any finite or NaN double XORed with this lands at or above
/// `0x0004_...`, clear of both canonical pointers and tagged ints.
const FLOAT_MASK: u64 = 0xFFFC_0000_0000_0000;

/// Smallest encoded-float bit pattern.
const MIN_FLOAT_BITS: u64 = 0x0004_0000_0000_0000;

/// A tagged runtime value.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Var(u64);

impl Var {
    /// The null object pointer.
    pub const NULL: Var = Var(0);

    /// Create a tagged int32.
    #[inline]
    pub const fn from_int32(value: i32) -> Self {
        Var(INT_TAG | (value as u32 as u64))
    }

    /// Create an encoded float64.
    #[inline]
    pub const fn from_float64(value: f64) -> Self {
        Var(value.to_bits() ^ FLOAT_MASK)
    }

    /// Create a Var from a heap object address.
    ///
    /// The address must be canonical (high 16 bits clear); anything else
    /// would collide with the tagged-int or float ranges.
    #[inline]
    pub fn from_ptr(ptr: *const ()) -> Self {
        let bits = ptr as usize as u64;
        debug_assert!(bits < INT_TAG, "non-canonical heap address");
        Var(bits)
    }

    /// Reconstruct a Var from raw bits (e.g. from a bailout frame).
    #[inline]
    pub const fn from_bits(bits: u64) -> Self {
        Var(bits)
    }

    /// Raw 64-bit payload.
    #[inline]
    pub const fn bits(self) -> u64 {
        self.0
    }

    /// Check for the tagged-int encoding.
    #[inline]
    pub const fn is_tagged_int(self) -> bool {
        (self.0 >> 48) == 1
    }

    /// Check for the encoded-float encoding.
    #[inline]
    pub const fn is_float(self) -> bool {
        self.0 >= MIN_FLOAT_BITS
    }

    /// Check for the heap-pointer encoding.
    #[inline]
    pub const fn is_ptr(self) -> bool {
        self.0 < INT_TAG
    }

    /// Extract a tagged int32, if that is what this is.
    #[inline]
    pub const fn try_int32(self) -> Option<i32> {
        if self.is_tagged_int() {
            Some(self.0 as u32 as i32)
        } else {
            None
        }
    }

    /// Extract an encoded float64, if that is what this is.
    #[inline]
    pub fn try_float64(self) -> Option<f64> {
        if self.is_float() {
            Some(f64::from_bits(self.0 ^ FLOAT_MASK))
        } else {
            None
        }
    }

    /// Extract the heap pointer, if that is what this is.
    #[inline]
    pub fn try_ptr(self) -> Option<*const ()> {
        if self.is_ptr() {
            Some(self.0 as usize as *const ())
        } else {
            None
        }
    }
}

impl fmt::Debug for Var {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(i) = self.try_int32() {
            write!(f, "Var(int {})", i)
        } else if let Some(d) = self.try_float64() {
            write!(f, "Var(float {})", d)
        } else {
            write!(f, "Var(ptr {:#x})", self.0)
        }
    }
}
