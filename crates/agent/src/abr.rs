//! Per-peer adaptive bitrate loop (spec.md §4.F, component F).
//!
//! Grounded in the teacher's `abr.rs` tick-loop shape (periodic wake-up,
//! read-stats, maybe-act), generalized from its loss/RTT-EMA heuristic to
//! the spec's target-vs-delivered-bitrate trend with hysteresis: a trend
//! has to hold for a minimum duration before it's acted on, and each
//! direction has its own backoff so the loop can't thrash.

use std::time::Instant;

use beam_protocol::config::AbrConfig;

use crate::selector::Direction;
use crate::trend::{self, Trend};

/// Hysteresis state for one peer's tier-switching decisions. Holds no I/O;
/// `tick` is a pure function of its inputs plus this accumulated state.
pub struct AbrState {
    config: AbrConfig,
    trend_since: Option<(Trend, Instant)>,
    last_down: Option<Instant>,
    last_up: Option<Instant>,
}

impl AbrState {
    pub fn new(config: AbrConfig) -> Self {
        Self {
            config,
            trend_since: None,
            last_down: None,
            last_up: None,
        }
    }

    /// Feed one sample of (target, delivered) bitrate for the peer's
    /// currently-selected tier. Returns `Some(direction)` when the trend has
    /// held long enough, and the corresponding backoff has elapsed, to act.
    ///
    /// A returned direction resets the trend tracking — the next tick starts
    /// measuring the new trend from scratch, same as the original clearing
    /// its running state on every bitrate change.
    pub fn tick(&mut self, target_bitrate: u64, stream_bitrate: u64, now: Instant) -> Option<Direction> {
        let trend = trend::classify(target_bitrate, stream_bitrate, self.config.theta);

        let held = match self.trend_since {
            Some((prev_trend, since)) if prev_trend == trend => now.duration_since(since),
            _ => {
                self.trend_since = Some((trend, now));
                std::time::Duration::ZERO
            }
        };

        match trend {
            Trend::Downward => {
                let required = std::time::Duration::from_secs(self.config.unstable_required_secs);
                let backoff_elapsed = self
                    .last_down
                    .is_none_or(|t| now.duration_since(t) >= std::time::Duration::from_secs(self.config.down_backoff_secs));
                if held >= required && backoff_elapsed {
                    self.trend_since = None;
                    self.last_down = Some(now);
                    return Some(Direction::Lower);
                }
            }
            Trend::Upward => {
                let required = std::time::Duration::from_secs(self.config.stable_required_secs);
                let backoff_elapsed = self
                    .last_up
                    .is_none_or(|t| now.duration_since(t) >= std::time::Duration::from_secs(self.config.up_backoff_secs));
                if held >= required && backoff_elapsed {
                    self.trend_since = None;
                    self.last_up = Some(now);
                    return Some(Direction::Higher);
                }
            }
            Trend::Neutral => {}
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> AbrConfig {
        AbrConfig {
            tick_ms: 1250,
            up_backoff_secs: 5,
            down_backoff_secs: 5,
            stable_required_secs: 5,
            unstable_required_secs: 5,
            theta: 0.1,
        }
    }

    #[test]
    fn downward_trend_needs_to_hold_before_acting() {
        let mut state = AbrState::new(config());
        let start = Instant::now();

        assert_eq!(state.tick(2000, 500, start), None);
        assert_eq!(
            state.tick(2000, 500, start + std::time::Duration::from_secs(3)),
            None
        );
        assert_eq!(
            state.tick(2000, 500, start + std::time::Duration::from_secs(6)),
            Some(Direction::Lower)
        );
    }

    #[test]
    fn trend_flip_resets_the_held_duration() {
        let mut state = AbrState::new(config());
        let start = Instant::now();

        assert_eq!(state.tick(2000, 500, start), None);
        assert_eq!(
            state.tick(2000, 500, start + std::time::Duration::from_secs(4)),
            None
        );
        // Trend flips to neutral right before the downward hold would fire.
        assert_eq!(
            state.tick(1000, 1000, start + std::time::Duration::from_secs(4) + std::time::Duration::from_millis(500)),
            None
        );
        assert_eq!(
            state.tick(2000, 500, start + std::time::Duration::from_secs(9)),
            None
        );
    }

    #[test]
    fn downward_backoff_blocks_a_second_immediate_switch() {
        let mut state = AbrState::new(config());
        let start = Instant::now();

        assert_eq!(
            state.tick(2000, 500, start + std::time::Duration::from_secs(6)),
            Some(Direction::Lower)
        );
        // Trend keeps being downward, but the backoff hasn't elapsed yet.
        assert_eq!(
            state.tick(2000, 500, start + std::time::Duration::from_secs(8)),
            None
        );
        assert_eq!(
            state.tick(2000, 500, start + std::time::Duration::from_secs(12)),
            Some(Direction::Lower)
        );
    }

    #[test]
    fn upward_trend_mirrors_downward() {
        let mut state = AbrState::new(config());
        let start = Instant::now();

        assert_eq!(state.tick(500, 2000, start), None);
        assert_eq!(
            state.tick(500, 2000, start + std::time::Duration::from_secs(6)),
            Some(Direction::Higher)
        );
    }

    #[test]
    fn neutral_trend_never_acts() {
        let mut state = AbrState::new(config());
        let start = Instant::now();
        for secs in 0..20 {
            assert_eq!(
                state.tick(1000, 1000, start + std::time::Duration::from_secs(secs)),
                None
            );
        }
    }
}
