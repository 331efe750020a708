//! Process-wide string interning.
//!
//! Interned strings have pointer identity: two equal `&str` contents
//! always intern to the same allocation, so `InternedString` equality and
//! hashing are pointer operations. String-switch dictionaries in the
//! backend rely on this: case lookup is a pointer compare, never a
//! content compare.
//!
//! Interned allocations are leaked deliberately; the interner lives for
//! the process.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::hash::{Hash, Hasher};
use std::sync::OnceLock;

/// Handle to an interned string.
///
/// Equality and hashing are by pointer, not content.
#[derive(Clone, Copy)]
pub struct InternedString(&'static str);

impl InternedString {
    /// The string contents.
    #[inline]
    pub fn as_str(self) -> &'static str {
        self.0
    }

    /// Length in bytes.
    #[inline]
    pub fn len(self) -> usize {
        self.0.len()
    }

    /// Whether this is the empty string.
    #[inline]
    pub fn is_empty(self) -> bool {
        self.0.is_empty()
    }

    /// The sole character, if this is a one-character string.
    #[inline]
    pub fn single_char(self) -> Option<char> {
        let mut chars = self.0.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => Some(c),
            _ => None,
        }
    }

    /// Stable address of the interned allocation.
    #[inline]
    pub fn as_ptr(self) -> *const u8 {
        self.0.as_ptr()
    }
}

impl PartialEq for InternedString {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self.0.as_ptr(), other.0.as_ptr())
    }
}

impl Eq for InternedString {}

impl Hash for InternedString {
    #[inline]
    fn hash<H: Hasher>(&self, state: &mut H) {
        (self.0.as_ptr() as usize).hash(state);
    }
}

impl std::fmt::Debug for InternedString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

impl std::fmt::Display for InternedString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.0)
    }
}

fn interner() -> &'static Mutex<FxHashMap<&'static str, &'static str>> {
    static INTERNER: OnceLock<Mutex<FxHashMap<&'static str, &'static str>>> = OnceLock::new();
    INTERNER.get_or_init(|| Mutex::new(FxHashMap::default()))
}

/// Intern a string, returning its canonical handle.
pub fn intern(s: &str) -> InternedString {
    let mut map = interner().lock();
    if let Some(&existing) = map.get(s) {
        return InternedString(existing);
    }
    let leaked: &'static str = Box::leak(s.to_owned().into_boxed_str());
    map.insert(leaked, leaked);
    InternedString(leaked)
}
