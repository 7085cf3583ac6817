//! Tests for the ring buffer and its statistics

use chrono::Utc;

use crate::storage::memory::{percentile, MemoryBuffer};

fn write_all(buffer: &MemoryBuffer, target: &str, values: &[f64]) {
    for &v in values {
        buffer.write(target, Utc::now(), v);
    }
}

#[test]
fn test_unknown_target_is_empty() {
    let buffer = MemoryBuffer::default();
    let stats = buffer.get_stats("nobody");

    assert_eq!(stats.target, "nobody");
    assert_eq!(stats.sample_count, 0);
    assert_eq!(stats.loss_pct, 0.0);
    assert!(buffer.get_history("nobody", 10).is_empty());
}

#[test]
fn test_basic_stats() {
    let buffer = MemoryBuffer::default();
    write_all(&buffer, "t", &[10.0, 20.0, 30.0, 40.0]);

    let stats = buffer.get_stats("t");
    assert_eq!(stats.sample_count, 4);
    assert_eq!(stats.loss_pct, 0.0);
    assert_eq!(stats.min_ms, 10.0);
    assert_eq!(stats.max_ms, 40.0);
    assert_eq!(stats.avg_ms, 25.0);
    assert_eq!(stats.median_ms, 25.0);
    assert_eq!(stats.last_ms, 40.0);
    // Population stddev of [10,20,30,40] is sqrt(125)
    assert!((stats.stddev_ms - 125.0_f64.sqrt()).abs() < 1e-9);
    assert!(stats.last_update.is_some());
}

#[test]
fn test_cold_start_all_losses_is_empty_not_full_loss() {
    let buffer = MemoryBuffer::new(10);
    write_all(&buffer, "t", &[-1.0, -1.0, -1.0]);

    // No success yet: explicitly empty, not 100% loss
    let stats = buffer.get_stats("t");
    assert_eq!(stats.sample_count, 0);
    assert_eq!(stats.loss_pct, 0.0);
}

#[test]
fn test_window_starts_at_first_success() {
    let buffer = MemoryBuffer::new(10);
    write_all(&buffer, "t", &[-1.0, -1.0, 25.0, -1.0, 35.0]);

    // Window is [25, loss, 35]: the leading losses stay outside
    let stats = buffer.get_stats("t");
    assert_eq!(stats.sample_count, 3);
    assert!((stats.loss_pct - 100.0 / 3.0).abs() < 1e-9);
    assert_eq!(stats.min_ms, 25.0);
    assert_eq!(stats.max_ms, 35.0);
    assert_eq!(stats.last_ms, 35.0);
}

#[test]
fn test_wraparound_with_leading_losses() {
    // Property: after 2C+1 writes, the first C being losses and the
    // rest successes, the window covers exactly the successes still in
    // the buffer and reports their loss fraction.
    const C: usize = 8;
    let buffer = MemoryBuffer::new(C);

    let mut values = vec![-1.0; C];
    values.extend((0..=C).map(|i| 10.0 + i as f64));
    assert_eq!(values.len(), 2 * C + 1);
    write_all(&buffer, "t", &values);

    // The buffer now holds the last C samples, all successes
    let stats = buffer.get_stats("t");
    assert_eq!(stats.sample_count, C);
    assert_eq!(stats.loss_pct, 0.0);
    assert_eq!(stats.min_ms, 11.0);
    assert_eq!(stats.max_ms, 10.0 + C as f64);
}

#[test]
fn test_first_success_rescan_on_overwrite() {
    let buffer = MemoryBuffer::new(4);

    // One success, then only losses until it is overwritten
    write_all(&buffer, "t", &[50.0, -1.0, -1.0, -1.0]);
    let stats = buffer.get_stats("t");
    assert_eq!(stats.sample_count, 4);
    assert_eq!(stats.loss_pct, 75.0);

    // The 5th write overwrites the success; no success remains
    buffer.write("t", Utc::now(), -1.0);
    let stats = buffer.get_stats("t");
    assert_eq!(stats.sample_count, 0);
    assert_eq!(stats.loss_pct, 0.0);

    // A fresh success restarts the window
    buffer.write("t", Utc::now(), 75.0);
    let stats = buffer.get_stats("t");
    assert_eq!(stats.sample_count, 1);
    assert_eq!(stats.min_ms, 75.0);
}

#[test]
fn test_rescan_finds_oldest_remaining_success() {
    let buffer = MemoryBuffer::new(4);

    // success, loss, success, loss; first success at slot 0
    write_all(&buffer, "t", &[50.0, -1.0, 60.0, -1.0]);
    // Overwrite slot 0 with a loss; the window must restart at the
    // remaining success (60.0), not at the newest write
    buffer.write("t", Utc::now(), -1.0);

    let stats = buffer.get_stats("t");
    // Window: [60, loss, loss]
    assert_eq!(stats.sample_count, 3);
    assert!((stats.loss_pct - 200.0 / 3.0).abs() < 1e-9);
    assert_eq!(stats.min_ms, 60.0);
    assert_eq!(stats.max_ms, 60.0);
}

#[test]
fn test_history_chronological_with_losses() {
    let buffer = MemoryBuffer::new(4);
    write_all(&buffer, "t", &[10.0, -1.0, 30.0]);

    assert_eq!(buffer.get_history("t", 10), vec![10.0, -1.0, 30.0]);
    assert_eq!(buffer.get_history("t", 2), vec![-1.0, 30.0]);
    assert_eq!(buffer.get_history("t", 0), vec![10.0, -1.0, 30.0]);

    // Wrap: oldest falls off
    write_all(&buffer, "t", &[40.0, 50.0]);
    assert_eq!(buffer.get_history("t", 10), vec![-1.0, 30.0, 40.0, 50.0]);
}

#[test]
fn test_get_all_stats() {
    let buffer = MemoryBuffer::default();
    write_all(&buffer, "a", &[10.0]);
    write_all(&buffer, "b", &[20.0]);

    let all = buffer.get_all_stats();
    assert_eq!(all.len(), 2);
    assert_eq!(all["a"].last_ms, 10.0);
    assert_eq!(all["b"].last_ms, 20.0);
}

#[test]
fn test_percentile_interpolation_formula() {
    // Property: the percentile equals the linear-interpolation formula
    // idx = p/100*(k-1); v[floor]*(1-w) + v[ceil]*w
    let sorted = [10.0, 20.0, 30.0, 40.0, 50.0];
    for p in [0.0, 12.5, 25.0, 33.3, 50.0, 66.6, 75.0, 95.0, 100.0] {
        let idx = p / 100.0 * (sorted.len() - 1) as f64;
        let lower = idx.floor() as usize;
        let upper = idx.ceil() as usize;
        let w = idx - lower as f64;
        let expected = sorted[lower] * (1.0 - w) + sorted[upper] * w;
        assert!(
            (percentile(&sorted, p) - expected).abs() < 1e-9,
            "p = {p}"
        );
    }
}

#[test]
fn test_percentile_endpoints_and_midpoints() {
    let sorted = [10.0, 20.0, 30.0, 40.0];
    assert_eq!(percentile(&sorted, 0.0), 10.0);
    assert_eq!(percentile(&sorted, 100.0), 40.0);
    assert_eq!(percentile(&sorted, 50.0), 25.0);

    assert_eq!(percentile(&[42.0], 95.0), 42.0);
    assert_eq!(percentile(&[], 50.0), 0.0);

    // p95 over ten evenly spaced values interpolates between the two top ranks
    let ten: Vec<f64> = (1..=10).map(|i| i as f64 * 10.0).collect();
    assert!((percentile(&ten, 95.0) - 95.5).abs() < 1e-9);
}
