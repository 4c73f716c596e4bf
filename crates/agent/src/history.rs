//! Bounded bitrate history queue (spec.md §4.A, component A).
//!
//! A 10 s ring of raw bandwidth-estimate samples, used to smooth the noisy
//! per-tick estimate the ABR loop (`abr.rs`) classifies a trend from. Mirrors
//! the original's `utils.MovingAverage`-style windowed queue, generalized to
//! the normalisation function spec.md spells out exactly.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_secs(10);

/// Single-writer-under-mutex sliding window of `{bitrate, created_at}`
/// elements. Callers serialize access themselves (one history per peer,
/// guarded by the same mutex as the rest of its ABR state).
#[derive(Default)]
pub struct BitrateHistory {
    entries: VecDeque<(u64, Instant)>,
}

impl BitrateHistory {
    pub fn new() -> Self {
        Self { entries: VecDeque::new() }
    }

    /// Drops any element older than 10 s at `now`, then appends `bitrate`.
    pub fn push(&mut self, bitrate: u64, now: Instant) {
        while let Some(&(_, created_at)) = self.entries.front() {
            if now.duration_since(created_at) > WINDOW {
                self.entries.pop_front();
            } else {
                break;
            }
        }
        self.entries.push_back((bitrate, now));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn avg(&self) -> f64 {
        if self.entries.is_empty() {
            return 0.0;
        }
        let sum: u64 = self.entries.iter().map(|(b, _)| *b).sum();
        sum as f64 / self.entries.len() as f64
    }

    /// Average over the newest `n` elements (`n ≤ len`). `n ≤ 0` is
    /// identical to [`avg`](Self::avg).
    pub fn avg_last_n(&self, n: i64) -> f64 {
        if n <= 0 {
            return self.avg();
        }
        let n = (n as usize).min(self.entries.len());
        if n == 0 {
            return 0.0;
        }
        let sum: u64 = self.entries.iter().rev().take(n).map(|(b, _)| *b).sum();
        sum as f64 / n as f64
    }

    /// Smooths a raw estimate against the window's recent history:
    /// snapshot the pre-push average/length, push `current`, then average
    /// over just enough of the newest elements that a sharp drop stays
    /// responsive while a near-mean estimate gets strongly damped.
    pub fn normalise_bitrate(&mut self, current: u64, now: Instant) -> u64 {
        let avg_prev = self.avg();
        let len_prev = self.len();
        self.push(current, now);

        if avg_prev == 0.0 || len_prev == 0 || current == 0 {
            return current;
        }

        let n = ((current as f64 / avg_prev) * len_prev as f64).floor();
        let n = if n.is_finite() && n > 0.0 { n as i64 } else { 0 };
        let n = (n as usize).min(self.len());
        if n == 0 {
            current
        } else {
            self.avg_last_n(n as i64).floor() as u64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue_of(values: &[u64]) -> (BitrateHistory, Instant) {
        let start = Instant::now();
        let mut history = BitrateHistory::new();
        for (i, v) in values.iter().enumerate() {
            history.push(*v, start + Duration::from_millis(1100 * i as u64));
        }
        let next = start + Duration::from_millis(1100 * values.len() as u64);
        (history, next)
    }

    const QUEUE: [u64; 10] = [900, 750, 780, 1100, 950, 700, 800, 900, 1000, 1100];

    #[test]
    fn empty_history_normalises_to_the_input() {
        let mut history = BitrateHistory::new();
        assert_eq!(history.avg(), 0.0);
        assert_eq!(history.normalise_bitrate(500, Instant::now()), 500);
    }

    #[test]
    fn normalise_idempotent_on_the_current_average() {
        let (mut history, now) = queue_of(&QUEUE);
        let avg = history.avg().round() as u64;
        assert_eq!(history.normalise_bitrate(avg, now), avg);
    }

    #[test]
    fn normalise_big_drop() {
        let (mut history, start) = queue_of(&QUEUE);
        let expected = [816u64, 700, 537, 350, 350];
        for (i, want) in expected.iter().enumerate() {
            let now = start + Duration::from_millis(1100 * i as u64);
            assert_eq!(history.normalise_bitrate(350, now), *want);
        }
    }

    #[test]
    fn normalise_small_drop() {
        let (mut history, start) = queue_of(&QUEUE);
        let expected = [878u64, 842, 825, 825, 812, 787, 750, 700];
        for (i, want) in expected.iter().enumerate() {
            let now = start + Duration::from_millis(1100 * i as u64);
            assert_eq!(history.normalise_bitrate(700, now), *want);
        }
    }

    #[test]
    fn normalise_rise() {
        let (mut history, start) = queue_of(&QUEUE);
        let expected = [943u64, 1003, 1060, 1085];
        for (i, want) in expected.iter().enumerate() {
            let now = start + Duration::from_millis(1100 * i as u64);
            assert_eq!(history.normalise_bitrate(1350, now), *want);
        }
    }

    #[test]
    fn window_never_holds_an_element_older_than_ten_seconds() {
        let mut history = BitrateHistory::new();
        let start = Instant::now();
        for i in 0..30 {
            history.push(1000, start + Duration::from_secs(i));
        }
        for &(_, created_at) in &history.entries {
            assert!(start + Duration::from_secs(29) - created_at <= WINDOW);
        }
    }
}
