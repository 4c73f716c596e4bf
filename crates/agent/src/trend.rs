//! Bitrate trend classification (spec.md §4.F, part of component F).
//!
//! Grounded in the original's adaptive loop (`internal/webrtc/peer.go`'s
//! periodic bitrate check), generalized from the teacher's loss/RTT-driven
//! `abr.rs` heuristic to the spec's target-vs-delivered-bitrate ratio.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trend {
    /// Delivered bitrate comfortably exceeds the current tier's target —
    /// there's headroom to move to a higher tier.
    Upward,
    Neutral,
    /// Delivered bitrate is falling behind the current tier's target —
    /// should move to a lower tier.
    Downward,
}

/// `diff = target / stream_bitrate` (spec.md §4.F). `diff > 1 + theta`
/// means the available bandwidth comfortably exceeds the current tier's
/// bitrate — there's headroom to move up; `diff < 1 - theta` means the
/// tier's bitrate is outrunning what's available — falling behind.
pub fn classify(target_bitrate: u64, stream_bitrate: u64, theta: f64) -> Trend {
    if stream_bitrate == 0 || target_bitrate == 0 {
        return Trend::Neutral;
    }
    let diff = target_bitrate as f64 / stream_bitrate as f64;
    if diff > 1.0 + theta {
        Trend::Upward
    } else if diff < 1.0 - theta {
        Trend::Downward
    } else {
        Trend::Neutral
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_keeping_up_is_neutral() {
        assert_eq!(classify(1000, 1000, 0.1), Trend::Neutral);
        assert_eq!(classify(1000, 950, 0.1), Trend::Neutral);
    }

    #[test]
    fn stream_falling_behind_is_downward() {
        assert_eq!(classify(500, 1000, 0.1), Trend::Downward);
    }

    #[test]
    fn stream_with_headroom_is_upward() {
        assert_eq!(classify(1000, 500, 0.1), Trend::Upward);
    }

    #[test]
    fn worked_example_diff_0_8_is_downward() {
        // spec.md's own worked scenario: attached to hq, diff=0.8 -> Downward.
        assert_eq!(classify(800, 1000, 0.1), Trend::Downward);
    }

    #[test]
    fn zero_stream_bitrate_is_neutral_not_downward() {
        // No samples published yet — don't punish a tier that hasn't had a
        // chance to report its bitrate.
        assert_eq!(classify(1000, 0, 0.1), Trend::Neutral);
    }
}
