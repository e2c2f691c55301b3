/// Share of perceived work attributed to the merge stage.
///
/// This is a fixed heuristic. It assumes the transfer and merge phases run one
/// after the other and that merging takes roughly a quarter of the time the
/// transfers do. Real ratios vary with file size and codec, so the resulting
/// percentage is an estimate for display, not a measurement.
pub const DEFAULT_MERGE_WEIGHT: f64 = 0.2;

/// Blend transfer counters and merge progress into one percentage in [0, 100].
///
/// `merge_progress` is a fraction in [0, 1]. With no known total the merge
/// progress alone drives the result.
pub fn percentage(total_size: u64, completed_size: u64, merge_progress: f64, merge_weight: f64) -> f64 {
    let w = merge_weight.clamp(0.0, 1.0);
    let merge = if merge_progress.is_finite() { merge_progress } else { 0.0 };

    let raw = if total_size == 0 {
        merge * 100.0
    } else {
        let transferred = completed_size as f64 / total_size as f64;
        (transferred * (1.0 - w) + merge * w) * 100.0
    };

    raw.clamp(0.0, 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_total_uses_merge_only() {
        assert_eq!(percentage(0, 0, 0.0, DEFAULT_MERGE_WEIGHT), 0.0);
        assert_eq!(percentage(0, 0, 0.37, DEFAULT_MERGE_WEIGHT), 0.37 * 100.0);
        assert_eq!(percentage(0, 500, 1.0, DEFAULT_MERGE_WEIGHT), 100.0);
    }

    #[test]
    fn test_audio_only_caps_at_transfer_share() {
        let p = percentage(1_000_000, 1_000_000, 0.0, DEFAULT_MERGE_WEIGHT);
        assert!((p - 80.0).abs() < 1e-9);

        let p = percentage(1_000_000, 999_000, 0.0, DEFAULT_MERGE_WEIGHT);
        assert!(p < 80.0);
    }

    #[test]
    fn test_combined_with_half_merged() {
        let p = percentage(4_000_000, 4_000_000, 0.5, DEFAULT_MERGE_WEIGHT);
        assert!((p - 90.0).abs() < 1e-9);
    }

    #[test]
    fn test_output_bounded() {
        let totals = [1u64, 7, 1_000, 3_000_000];
        let merges = [0.0, 0.25, 0.5, 0.99, 1.0];
        let weights = [0.0, 0.2, 0.5, 1.0];
        for &total in &totals {
            for completed in [0, total / 3, total / 2, total] {
                for &m in &merges {
                    for &w in &weights {
                        let p = percentage(total, completed, m, w);
                        assert!((0.0..=100.0).contains(&p), "{} {} {} {} -> {}", total, completed, m, w, p);
                    }
                }
            }
        }
    }

    #[test]
    fn test_out_of_range_inputs_clamped() {
        assert_eq!(percentage(100, 250, 0.0, DEFAULT_MERGE_WEIGHT), 100.0);
        assert_eq!(percentage(0, 0, 1.7, DEFAULT_MERGE_WEIGHT), 100.0);
        assert_eq!(percentage(0, 0, -0.4, DEFAULT_MERGE_WEIGHT), 0.0);
        assert_eq!(percentage(0, 0, f64::NAN, DEFAULT_MERGE_WEIGHT), 0.0);
    }
}
