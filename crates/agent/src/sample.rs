//! Value types shared by every stage of the capture → sink → track pipeline
//! (spec.md §3). Grounded in the `media.Sample`/`codec.RTPCodec` shape used
//! throughout the original's `pkg/types`, adapted to the `webrtc` crate's
//! own `Sample`/`RTCRtpCodecCapability` types at the boundary.

use std::time::{Duration, Instant};

use bytes::Bytes;

/// One encoded media sample, value-typed and cheap to clone/broadcast.
///
/// `delta_unit = false` marks a sample that can be decoded without any
/// prior sample — a keyframe for video, always false for audio.
#[derive(Debug, Clone)]
pub struct Sample {
    pub data: Bytes,
    pub duration: Duration,
    pub timestamp: Instant,
    pub delta_unit: bool,
}

impl Sample {
    pub fn keyframe(data: Bytes, duration: Duration) -> Self {
        Self {
            data,
            duration,
            timestamp: Instant::now(),
            delta_unit: false,
        }
    }

    pub fn delta(data: Bytes, duration: Duration) -> Self {
        Self {
            data,
            duration,
            timestamp: Instant::now(),
            delta_unit: true,
        }
    }

    /// Unix-epoch seconds at emission, used to index the bitrate bucket
    /// array (`floor(t_unix) mod 3`, spec.md §3/§4.B). `base` anchors the
    /// monotonic `Instant` clock to wall-clock time once per process.
    pub fn unix_seconds(&self, base: (Instant, u64)) -> u64 {
        let (base_instant, base_unix) = base;
        base_unix + self.timestamp.saturating_duration_since(base_instant).as_secs()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Audio,
    Video,
}

/// Immutable once a sink is created (spec.md §3).
#[derive(Debug, Clone)]
pub struct CodecDescriptor {
    pub kind: MediaKind,
    pub name: String,
    pub rtp_capability: webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability,
    pub clock_rate: u32,
}
