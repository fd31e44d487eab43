use crate::model::DurationSummary;
use hdrhistogram::Histogram;
use std::time::Duration;

/// Longest task duration tracked precisely by the histogram (one week).
const MAX_TRACKED_MS: u64 = 7 * 24 * 3600 * 1000;

/// Compute (mean, median, 25th percentile, 75th percentile) from samples.
pub fn compute_metrics(samples: &[f64]) -> Option<(f64, f64, f64, f64)> {
    if samples.len() < 2 {
        return None;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let n = sorted.len();
    let mean = samples.iter().sum::<f64>() / n as f64;
    let median = sorted[n / 2];
    let p25 = sorted[n / 4];
    let p75 = sorted[3 * n / 4];
    Some((mean, median, p25, p75))
}

/// Completed partitions per minute of wall time.
pub fn throughput_per_minute(completed: usize, elapsed: Duration) -> f64 {
    let minutes = elapsed.as_secs_f64() / 60.0;
    if completed == 0 || minutes <= 0.0 {
        return 0.0;
    }
    completed as f64 / minutes
}

/// Minutes until every partition is done at the current rate; `None` while the rate is zero.
pub fn eta_minutes(total: usize, completed: usize, per_minute: f64) -> Option<f64> {
    if per_minute <= 0.0 || !per_minute.is_finite() {
        return None;
    }
    Some(total.saturating_sub(completed) as f64 / per_minute)
}

/// Distribution of task wall times, bucketed in milliseconds.
pub fn duration_summary(durations: &[Duration]) -> Option<DurationSummary> {
    if durations.is_empty() {
        return None;
    }
    let mut hist = Histogram::<u64>::new_with_bounds(1, MAX_TRACKED_MS, 3).ok()?;
    for d in durations {
        let ms = (d.as_millis() as u64).clamp(1, MAX_TRACKED_MS);
        hist.record(ms).ok()?;
    }
    let secs = |ms: u64| ms as f64 / 1000.0;
    Some(DurationSummary {
        mean_secs: hist.mean() / 1000.0,
        median_secs: secs(hist.value_at_quantile(0.5)),
        p25_secs: secs(hist.value_at_quantile(0.25)),
        p75_secs: secs(hist.value_at_quantile(0.75)),
        max_secs: secs(hist.max()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throughput_is_zero_before_anything_completes() {
        assert_eq!(throughput_per_minute(0, Duration::from_secs(60)), 0.0);
        assert_eq!(throughput_per_minute(5, Duration::ZERO), 0.0);
        assert_eq!(eta_minutes(10, 0, 0.0), None);
    }

    #[test]
    fn eta_uses_remaining_partitions() {
        let tput = throughput_per_minute(3, Duration::from_secs(90));
        assert!((tput - 2.0).abs() < 1e-9);
        assert_eq!(eta_minutes(10, 3, tput), Some(3.5));
        assert_eq!(eta_minutes(3, 3, tput), Some(0.0));
    }

    #[test]
    fn metrics_need_two_samples() {
        assert!(compute_metrics(&[1.0]).is_none());
        let (mean, median, p25, p75) = compute_metrics(&[4.0, 1.0, 3.0, 2.0]).unwrap();
        assert_eq!(mean, 2.5);
        assert_eq!(median, 3.0);
        assert_eq!(p25, 2.0);
        assert_eq!(p75, 4.0);
    }

    #[test]
    fn duration_summary_tracks_spread() {
        assert!(duration_summary(&[]).is_none());
        let d: Vec<Duration> = [1, 2, 3, 4, 10]
            .iter()
            .map(|s| Duration::from_secs(*s))
            .collect();
        let s = duration_summary(&d).unwrap();
        assert!((s.median_secs - 3.0).abs() < 0.01);
        assert!((s.max_secs - 10.0).abs() < 0.02);
        assert!((s.mean_secs - 4.0).abs() < 0.01);
    }
}
