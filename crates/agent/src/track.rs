//! Per-peer video subscription (spec.md §4.F, component E): which tier one
//! peer's video track is currently attached to, and the migrate-on-switch
//! logic that keeps the keyframe gate correct across a tier change.
//!
//! State diagram (driven entirely by `sink::StreamSink`'s listener-state
//! machine; this type just remembers which sink owns the current handle):
//! `[none] --set_stream(S)--> [waiting_keyframe on S] --keyframe observed-->
//! [active on S] --set_stream(T≠S)--> [waiting_keyframe on T]`;
//! `[active on S] --remove_stream--> [none]`.
//!
//! Grounded in the teacher's `video.rs` IDR-wait bookkeeping, generalized
//! from "the one stream this process has" to "the one stream this peer is
//! currently subscribed to, which can change at runtime".

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::error::SinkError;
use crate::sample::{MediaKind, Sample};
use crate::sink::{ListenerHandle, StreamSink};

struct Attachment {
    video_id: String,
    sink: Arc<StreamSink>,
    handle: ListenerHandle,
}

/// A single peer's subscription to one video tier at a time. Not `Clone` —
/// owned by the peer task that reads its receiver.
pub struct PeerTrack {
    kind: MediaKind,
    buffer: usize,
    current: Option<Attachment>,
}

impl PeerTrack {
    pub fn new(kind: MediaKind, buffer: usize) -> Self {
        Self {
            kind,
            buffer,
            current: None,
        }
    }

    pub fn current_video_id(&self) -> Option<&str> {
        self.current.as_ref().map(|a| a.video_id.as_str())
    }

    pub fn is_attached(&self) -> bool {
        self.current.is_some()
    }

    /// Subscribes to `sink`, migrating off whatever sink this track was
    /// previously attached to. A no-op re-subscribe to the same sink still
    /// goes through `move_listener_to`, which is harmless but resets the
    /// keyframe gate — callers that care about idempotence should check
    /// `current_video_id()` first (the selector already returns the current
    /// id unchanged when there's nowhere else to step, so this is rare).
    pub fn set_stream(
        &mut self,
        video_id: impl Into<String>,
        sink: Arc<StreamSink>,
    ) -> Result<mpsc::Receiver<Sample>, SinkError> {
        let video_id = video_id.into();
        let (handle, rx) = match self.current.take() {
            Some(prev) => StreamSink::move_listener_to(&prev.sink, &sink, prev.handle, self.buffer)?,
            None => sink.attach(self.kind, self.buffer)?,
        };
        self.current = Some(Attachment {
            video_id,
            sink,
            handle,
        });
        Ok(rx)
    }

    /// Re-requests a keyframe on whatever sink this track is currently
    /// attached to (spec.md §4.F: RTCP PLI/FIR forwarding). A no-op if the
    /// track isn't attached.
    pub fn request_keyframe(&self) {
        if let Some(attachment) = &self.current {
            attachment.sink.request_keyframe();
        }
    }

    pub fn remove_stream(&mut self) {
        if let Some(attachment) = self.current.take() {
            attachment.sink.detach(attachment.handle);
        }
    }
}

impl Drop for PeerTrack {
    fn drop(&mut self) {
        self.remove_stream();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::encoder::{EncoderBackend, Pipeline};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::mpsc as std_mpsc;
    use std::time::Instant;
    use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;

    use crate::sample::CodecDescriptor;

    struct FakePipeline {
        rx: Option<std_mpsc::Receiver<Sample>>,
        keyframes_requested: Arc<AtomicU64>,
    }

    impl Pipeline for FakePipeline {
        fn play(&mut self) -> anyhow::Result<std_mpsc::Receiver<Sample>> {
            Ok(self.rx.take().unwrap())
        }
        fn emit_video_keyframe(&self) {
            self.keyframes_requested.fetch_add(1, Ordering::Relaxed);
        }
        fn destroy(self: Box<Self>) {}
    }

    struct FakeBackend {
        keyframes_requested: Arc<AtomicU64>,
    }

    impl EncoderBackend for FakeBackend {
        fn create_pipeline(&self, _description: &str) -> anyhow::Result<Box<dyn Pipeline>> {
            let (_tx, rx) = std_mpsc::channel();
            Ok(Box::new(FakePipeline {
                rx: Some(rx),
                keyframes_requested: Arc::clone(&self.keyframes_requested),
            }))
        }
    }

    fn test_codec() -> CodecDescriptor {
        CodecDescriptor {
            kind: MediaKind::Video,
            name: "h264".to_string(),
            rtp_capability: RTCRtpCodecCapability {
                mime_type: webrtc::api::media_engine::MIME_TYPE_H264.to_string(),
                clock_rate: 90_000,
                channels: 0,
                sdp_fmtp_line: String::new(),
                rtcp_feedback: vec![],
            },
            clock_rate: 90_000,
        }
    }

    fn sink(id: &str, keyframes_requested: &Arc<AtomicU64>) -> Arc<StreamSink> {
        let backend = Arc::new(FakeBackend {
            keyframes_requested: Arc::clone(keyframes_requested),
        });
        Arc::new(StreamSink::new(
            id,
            "fakesrc ! appsink name=sink",
            test_codec(),
            backend as Arc<dyn EncoderBackend>,
            (Instant::now(), 0),
        ))
    }

    #[test]
    fn set_stream_attaches_and_tracks_current_id() {
        let keyframes = Arc::new(AtomicU64::new(0));
        let lq = sink("lq", &keyframes);
        let mut track = PeerTrack::new(MediaKind::Video, 8);

        assert!(track.current_video_id().is_none());
        track.set_stream("lq", lq).unwrap();
        assert_eq!(track.current_video_id(), Some("lq"));
        assert_eq!(keyframes.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn set_stream_again_migrates_to_the_new_sink() {
        let keyframes = Arc::new(AtomicU64::new(0));
        let lq = sink("lq", &keyframes);
        let hq = sink("hq", &keyframes);
        let mut track = PeerTrack::new(MediaKind::Video, 8);

        track.set_stream("lq", lq.clone()).unwrap();
        assert_eq!(lq.listener_count(), 1);
        track.set_stream("hq", hq.clone()).unwrap();
        assert_eq!(lq.listener_count(), 0);
        assert_eq!(hq.listener_count(), 1);
        assert_eq!(track.current_video_id(), Some("hq"));
    }

    #[test]
    fn remove_stream_detaches_and_clears_current_id() {
        let keyframes = Arc::new(AtomicU64::new(0));
        let lq = sink("lq", &keyframes);
        let mut track = PeerTrack::new(MediaKind::Video, 8);

        track.set_stream("lq", lq.clone()).unwrap();
        track.remove_stream();
        assert!(track.current_video_id().is_none());
        assert_eq!(lq.listener_count(), 0);
    }

    #[test]
    fn dropping_track_detaches_from_its_sink() {
        let keyframes = Arc::new(AtomicU64::new(0));
        let lq = sink("lq", &keyframes);
        {
            let mut track = PeerTrack::new(MediaKind::Video, 8);
            track.set_stream("lq", lq.clone()).unwrap();
        }
        assert_eq!(lq.listener_count(), 0);
    }
}
