//! Small scheduler-accounting helpers shared by `worker::query_stats` and
//! `czar::uberjob` rather than duplicated in each. Grounded in
//! `examples/original_source/src/wpublish/QueriesAndChunks.cc`'s
//! exponentially-weighted average-time-per-chunk bookkeeping, and mirrors
//! the teacher's own `src/common` layout of small free functions reused
//! across otherwise-unrelated subsystems.

use crate::task::ScanRating;

/// Exponentially-weighted rolling average: the first sample seeds the
/// average outright, every later sample blends in at `alpha`.
pub fn rolling_average(prev: f64, sample: f64, prior_count: u32, alpha: f64) -> f64 {
    if prior_count == 0 {
        sample
    } else {
        alpha * sample + (1.0 - alpha) * prev
    }
}

/// The more conservative (slower) of two scan ratings, used when the same
/// physical table is touched by sub-queries with different declared
/// ratings and only one combined rating can be sent to a worker.
pub fn max_scan_rating(a: ScanRating, b: ScanRating) -> ScanRating {
    if (b as u8) > (a as u8) {
        b
    } else {
        a
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rolling_average_seeds_then_blends() {
        let avg = rolling_average(0.0, 2.0, 0, 0.3);
        assert_eq!(avg, 2.0);
        let avg = rolling_average(avg, 4.0, 1, 0.3);
        assert!((avg - (0.3 * 4.0 + 0.7 * 2.0)).abs() < 1e-9);
    }

    #[test]
    fn max_scan_rating_picks_slower() {
        assert_eq!(max_scan_rating(ScanRating::Fast, ScanRating::Slow), ScanRating::Slow);
        assert_eq!(max_scan_rating(ScanRating::Slow, ScanRating::Fast), ScanRating::Slow);
    }
}
