//! Collection statistics.

/// Counters for one collector, accumulated across cycles.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectorStats {
    /// Completed mark phases.
    pub collections: u64,
    /// Aborted mark phases.
    pub aborts: u64,
    /// Objects marked, all cycles.
    pub objects_marked: u64,
    /// Bytes scanned, all cycles.
    pub bytes_scanned: u64,
    /// Mark phases that ran with parallel workers.
    pub parallel_marks: u64,
    /// Entries redistributed by splits.
    pub split_entries: u64,
}

impl CollectorStats {
    /// Fold per-worker counters into the total.
    pub fn merge(&mut self, other: &CollectorStats) {
        self.objects_marked += other.objects_marked;
        self.bytes_scanned += other.bytes_scanned;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge() {
        let mut total = CollectorStats { collections: 1, ..Default::default() };
        let worker = CollectorStats { objects_marked: 10, bytes_scanned: 160, ..Default::default() };
        total.merge(&worker);
        assert_eq!(total.objects_marked, 10);
        assert_eq!(total.bytes_scanned, 160);
        assert_eq!(total.collections, 1);
    }
}
