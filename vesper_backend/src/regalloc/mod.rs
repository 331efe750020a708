//! Register allocation.
//!
//! A linear-scan allocator over numbered IR, split into the
//! machine-independent scan ([`linear_scan`]), the per-symbol range
//! bookkeeping ([`lifetime`]), and the per-ISA policy ([`md`]). The ISA
//! policy is selected at build configuration time; the scan itself never
//! branches on the target architecture.

pub mod lifetime;
pub mod linear_scan;
pub mod md;

pub use lifetime::Lifetime;
pub use linear_scan::{build_lifetimes, Allocation, AllocationMap, LinearScan, LinearScanStats};
pub use md::{LinearScanMd, NativeLinearScanMd, Reg, RegClass, RegSet, X64LinearScanMd, X86LinearScanMd};
