//! Block decisions over scan counts.

use serde::Serialize;

use crate::engine::ScanResult;

/// Scanned and blocked frame counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScanCounts {
    pub scan_count: u32,
    pub block_count: u32,
}

impl ScanCounts {
    pub fn new(scan_count: u32, block_count: u32) -> Self {
        Self {
            scan_count,
            block_count,
        }
    }

    pub fn add(&mut self, other: ScanCounts) {
        self.scan_count = self.scan_count.saturating_add(other.scan_count);
        self.block_count = self.block_count.saturating_add(other.block_count);
    }

    pub fn block_ratio(&self) -> f64 {
        if self.scan_count == 0 {
            0.0
        } else {
            self.block_count as f64 / self.scan_count as f64
        }
    }
}

impl From<&ScanResult> for ScanCounts {
    fn from(result: &ScanResult) -> Self {
        Self::new(result.scan_count, result.block_count)
    }
}

/// Whether a single round is damning on its own.
pub fn is_this_scan_block(round: ScanCounts, bail_count: u32) -> bool {
    round.block_count >= bail_count || (round.scan_count >= 3 && round.block_ratio() >= 0.66)
}

/// Whether the accumulated counts of a session, stream, or group warrant a block.
pub fn is_total_scan_block(total: ScanCounts) -> bool {
    (total.scan_count >= 8 && total.block_ratio() >= 0.5)
        || (total.scan_count >= 20 && total.block_ratio() >= 0.15)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bail_count_blocks() {
        assert!(is_this_scan_block(ScanCounts::new(3, 3), 3));
        assert!(is_this_scan_block(ScanCounts::new(10, 4), 4));
        assert!(!is_this_scan_block(ScanCounts::new(10, 3), 4));
    }

    #[test]
    fn test_round_ratio_needs_three_frames() {
        assert!(!is_this_scan_block(ScanCounts::new(2, 2), 5));
        assert!(is_this_scan_block(ScanCounts::new(3, 2), 5));
        assert!(!is_this_scan_block(ScanCounts::new(6, 3), 5));
    }

    #[test]
    fn test_total_thresholds() {
        assert!(!is_total_scan_block(ScanCounts::new(7, 7)));
        assert!(is_total_scan_block(ScanCounts::new(8, 4)));
        assert!(!is_total_scan_block(ScanCounts::new(19, 2)));
        assert!(is_total_scan_block(ScanCounts::new(20, 3)));
        assert!(!is_total_scan_block(ScanCounts::new(0, 0)));
    }

    #[test]
    fn test_counts_accumulate() {
        let mut total = ScanCounts::default();
        total.add(ScanCounts::new(3, 1));
        total.add(ScanCounts::new(5, 3));
        assert_eq!(total, ScanCounts::new(8, 4));
        assert_eq!(total.block_ratio(), 0.5);
    }
}
