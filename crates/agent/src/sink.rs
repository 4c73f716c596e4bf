//! Stream sink (spec.md §4.A/§4.B/§5, component B): one pipeline per
//! encoding tier, multicast to every attached listener, with lazy
//! start/stop and a published, lock-free bitrate estimate.
//!
//! Grounded in the teacher's `video.rs` fan-out loop (single-peer version,
//! generalized here to many listeners) and the original's
//! `internal/capture/streamsink.go` for the pipeline lifecycle and the
//! lock-ordering protocol `move_listener_to` depends on.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc as tokio_mpsc;
use tracing::{debug, info, warn};

use crate::backend::{EncoderBackend, Pipeline};
use crate::error::SinkError;
use crate::sample::{CodecDescriptor, MediaKind, Sample};

/// Opaque per-attachment identity. Rust has no stable pointer-identity
/// equivalent to the original's listener-struct-pointer keys, so handles
/// are minted from a single process-wide counter instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerHandle(u64);

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

fn next_handle() -> ListenerHandle {
    ListenerHandle(NEXT_HANDLE.fetch_add(1, Ordering::Relaxed))
}

/// Process-wide lock taken before touching any two sinks together, so that
/// `move_listener_to` can never deadlock against a concurrent move in the
/// opposite direction (spec.md §5): migration_gate → source listeners-lock
/// → target listeners-lock, released in reverse.
static MIGRATION_GATE: Mutex<()> = Mutex::new(());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListenerState {
    WaitingKeyframe,
    Active,
}

struct Listener {
    kind: MediaKind,
    state: ListenerState,
    tx: tokio_mpsc::Sender<Sample>,
}

#[derive(Default)]
struct BucketClock {
    last_second: Option<u64>,
    accumulated: u64,
}

struct Running {
    pipeline: Box<dyn Pipeline>,
    /// Joined on `stop()`; detached otherwise (process exit reaps it).
    fanout: Option<std::thread::JoinHandle<()>>,
}

pub struct StreamSink {
    id: String,
    codec: CodecDescriptor,
    encoder: Arc<dyn EncoderBackend>,
    description: Mutex<String>,
    time_base: (std::time::Instant, u64),
    running: Mutex<Option<Running>>,
    listeners: Arc<Mutex<HashMap<ListenerHandle, Listener>>>,
    bitrate: Arc<AtomicU64>,
}

impl StreamSink {
    pub fn new(
        id: impl Into<String>,
        description: impl Into<String>,
        codec: CodecDescriptor,
        encoder: Arc<dyn EncoderBackend>,
        time_base: (std::time::Instant, u64),
    ) -> Self {
        Self {
            id: id.into(),
            codec,
            encoder,
            description: Mutex::new(description.into()),
            time_base,
            running: Mutex::new(None),
            listeners: Arc::new(Mutex::new(HashMap::new())),
            bitrate: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn codec(&self) -> &CodecDescriptor {
        &self.codec
    }

    /// Non-blocking published bitrate, refreshed once per wall-clock second
    /// by the fan-out thread (spec.md §4.B).
    pub fn bitrate(&self) -> u64 {
        self.bitrate.load(Ordering::Relaxed)
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().unwrap().len()
    }

    fn ensure_started(&self) -> Result<(), SinkError> {
        if self.running.lock().unwrap().is_some() {
            return Ok(());
        }
        self.start_pipeline()
    }

    /// Explicit pipeline control for screen-size-change storms (spec.md
    /// §4.B/§4.D): fails with `PipelineAlreadyExists` instead of silently
    /// succeeding, so a capture manager recreate loop can tell "already
    /// running" apart from "just started".
    pub fn create_pipeline(&self) -> Result<(), SinkError> {
        if self.running.lock().unwrap().is_some() {
            return Err(SinkError::PipelineAlreadyExists(self.id.clone()));
        }
        self.start_pipeline()
    }

    pub fn destroy_pipeline(&self) {
        if let Some(running) = self.running.lock().unwrap().take() {
            running.pipeline.destroy();
        }
    }

    /// Replaces the pipeline description used by the next `create_pipeline`
    /// / `ensure_started` call (spec.md §4.D: rebuilt with a new screen
    /// size after a resize). Does not touch a currently-live pipeline —
    /// callers destroy first.
    pub fn set_description(&self, description: impl Into<String>) {
        *self.description.lock().unwrap() = description.into();
    }

    fn start_pipeline(&self) -> Result<(), SinkError> {
        let mut running = self.running.lock().unwrap();
        let description = self.description.lock().unwrap().clone();
        let mut pipeline = self
            .encoder
            .create_pipeline(&description)
            .map_err(|source| SinkError::PipelineConstruction {
                sink_id: self.id.clone(),
                source,
            })?;
        let rx = pipeline
            .play()
            .map_err(|source| SinkError::PipelineConstruction {
                sink_id: self.id.clone(),
                source,
            })?;

        let sink_id = self.id.clone();
        let time_base = self.time_base;
        let bitrate = Arc::clone(&self.bitrate);
        let listeners_mutex = Arc::clone(&self.listeners);
        let handle = std::thread::Builder::new()
            .name(format!("sink-fanout-{sink_id}"))
            .spawn(move || fanout_loop(sink_id, rx, listeners_mutex, bitrate, time_base))
            .expect("failed to spawn fan-out thread");

        *running = Some(Running {
            pipeline,
            fanout: Some(handle),
        });
        info!(sink_id = %self.id, "sink pipeline started");
        Ok(())
    }

    /// Attaches a new listener, starting the pipeline on first attach and
    /// requesting a keyframe if this is the only video listener still
    /// waiting on one (spec.md §4.F: request once per newly-waiting
    /// listener, not once per attach).
    pub fn attach(
        &self,
        kind: MediaKind,
        buffer: usize,
    ) -> Result<(ListenerHandle, tokio_mpsc::Receiver<Sample>), SinkError> {
        self.ensure_started()?;
        let (tx, rx) = tokio_mpsc::channel(buffer);
        let handle = next_handle();

        let initial_state = match kind {
            MediaKind::Audio => ListenerState::Active,
            MediaKind::Video => ListenerState::WaitingKeyframe,
        };

        let mut listeners = self.listeners.lock().unwrap();
        let already_waiting = kind == MediaKind::Video
            && listeners
                .values()
                .any(|l| l.kind == MediaKind::Video && l.state == ListenerState::WaitingKeyframe);
        listeners.insert(
            handle,
            Listener {
                kind,
                state: initial_state,
                tx,
            },
        );
        drop(listeners);

        if kind == MediaKind::Video && !already_waiting {
            self.request_keyframe();
        }

        Ok((handle, rx))
    }

    pub fn detach(&self, handle: ListenerHandle) {
        let is_empty = {
            let mut listeners = self.listeners.lock().unwrap();
            listeners.remove(&handle);
            listeners.is_empty()
        };
        if is_empty {
            self.destroy_pipeline();
        }
    }

    pub fn request_keyframe(&self) {
        if let Some(running) = self.running.lock().unwrap().as_ref() {
            running.pipeline.emit_video_keyframe();
        }
    }

    /// Atomically moves `handle` from `self` to `to`, preserving its
    /// keyframe-gate state reset to waiting (a migrated video listener must
    /// see a fresh keyframe on its new stream, spec.md §4.F). Lock order is
    /// fixed process-wide via `MIGRATION_GATE` to avoid deadlocking a
    /// concurrent move in the opposite direction.
    pub fn move_listener_to(
        from: &StreamSink,
        to: &StreamSink,
        handle: ListenerHandle,
        buffer: usize,
    ) -> Result<(ListenerHandle, tokio_mpsc::Receiver<Sample>), SinkError> {
        let _gate = MIGRATION_GATE.lock().unwrap();
        to.ensure_started()?;

        let (kind, from_empty) = {
            let mut from_listeners = from.listeners.lock().unwrap();
            let Some(listener) = from_listeners.remove(&handle) else {
                return Err(SinkError::PipelineAlreadyExists(
                    "listener not found on source sink".to_string(),
                ));
            };
            (listener.kind, from_listeners.is_empty())
        };

        let (tx, rx) = tokio_mpsc::channel(buffer);
        let new_handle = next_handle();
        let initial_state = match kind {
            MediaKind::Audio => ListenerState::Active,
            MediaKind::Video => ListenerState::WaitingKeyframe,
        };

        let mut to_listeners = to.listeners.lock().unwrap();
        let already_waiting = kind == MediaKind::Video
            && to_listeners
                .values()
                .any(|l| l.kind == MediaKind::Video && l.state == ListenerState::WaitingKeyframe);
        to_listeners.insert(
            new_handle,
            Listener {
                kind,
                state: initial_state,
                tx,
            },
        );
        drop(to_listeners);

        if kind == MediaKind::Video && !already_waiting {
            to.request_keyframe();
        }

        if from_empty {
            from.destroy_pipeline();
        }

        Ok((new_handle, rx))
    }
}

impl Drop for StreamSink {
    fn drop(&mut self) {
        if let Some(running) = self.running.lock().unwrap().take() {
            running.pipeline.destroy();
        }
    }
}

fn fanout_loop(
    sink_id: String,
    rx: std::sync::mpsc::Receiver<Sample>,
    listeners: Arc<Mutex<HashMap<ListenerHandle, Listener>>>,
    bitrate: Arc<AtomicU64>,
    time_base: (std::time::Instant, u64),
) {
    let mut clock = BucketClock::default();

    while let Ok(sample) = rx.recv() {
        let unix_sec = sample.unix_seconds(time_base);
        // Publish the previous second's accumulated bucket the instant the
        // wall-clock second rolls over, then start a fresh accumulator
        // (spec.md §4.B's "publish previous, zero next", restated as an
        // explicit last-seen-second check rather than ring-buffer
        // zero-detection — behaviourally identical, easier to follow).
        match clock.last_second {
            Some(prev) if prev != unix_sec => {
                bitrate.store(clock.accumulated, Ordering::Relaxed);
                clock.accumulated = 0;
            }
            None => {}
            _ => {}
        }
        clock.last_second = Some(unix_sec);
        clock.accumulated += (sample.data.len() / 8) as u64;

        let mut dead = Vec::new();
        let mut locked = listeners.lock().unwrap();
        for (handle, listener) in locked.iter_mut() {
            if listener.kind == MediaKind::Video {
                if listener.state == ListenerState::WaitingKeyframe {
                    if sample.delta_unit {
                        continue;
                    }
                    listener.state = ListenerState::Active;
                    debug!(sink_id = %sink_id, "video listener promoted to active on keyframe");
                }
            }
            // A full channel means one slow listener; drop this sample for
            // just that one rather than blocking every other listener on
            // the same sink (spec.md §4.B). Only a closed channel — the
            // listener actually gone — gets detached here.
            match listener.tx.try_send(sample.clone()) {
                Ok(()) | Err(tokio_mpsc::error::TrySendError::Full(_)) => {}
                Err(tokio_mpsc::error::TrySendError::Closed(_)) => dead.push(*handle),
            }
        }
        for handle in dead {
            locked.remove(&handle);
        }
    }

    warn!(sink_id = %sink_id, "sink pipeline sample stream ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::encoder::{EncoderBackend, Pipeline};
    use bytes::Bytes;
    use std::sync::mpsc as std_mpsc;
    use std::time::{Duration, Instant};
    use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;

    struct FakePipeline {
        tx: Option<std_mpsc::Sender<Sample>>,
        rx: Option<std_mpsc::Receiver<Sample>>,
        keyframes_requested: Arc<AtomicU64>,
        destroys: Arc<AtomicU64>,
    }

    impl Pipeline for FakePipeline {
        fn play(&mut self) -> anyhow::Result<std_mpsc::Receiver<Sample>> {
            Ok(self.rx.take().unwrap())
        }
        fn emit_video_keyframe(&self) {
            self.keyframes_requested.fetch_add(1, Ordering::Relaxed);
        }
        fn destroy(self: Box<Self>) {
            self.destroys.fetch_add(1, Ordering::Relaxed);
        }
    }

    struct FakeBackend {
        keyframes_requested: Arc<AtomicU64>,
        destroys: Arc<AtomicU64>,
        sender: Mutex<Option<std_mpsc::Sender<Sample>>>,
    }

    impl EncoderBackend for FakeBackend {
        fn create_pipeline(&self, _description: &str) -> anyhow::Result<Box<dyn Pipeline>> {
            let (tx, rx) = std_mpsc::channel();
            *self.sender.lock().unwrap() = Some(tx.clone());
            Ok(Box::new(FakePipeline {
                tx: Some(tx),
                rx: Some(rx),
                keyframes_requested: Arc::clone(&self.keyframes_requested),
                destroys: Arc::clone(&self.destroys),
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

    fn make_sink() -> (StreamSink, Arc<FakeBackend>) {
        let backend = Arc::new(FakeBackend {
            keyframes_requested: Arc::new(AtomicU64::new(0)),
            destroys: Arc::new(AtomicU64::new(0)),
            sender: Mutex::new(None),
        });
        let sink = StreamSink::new(
            "hd",
            "fakesrc ! appsink name=sink",
            test_codec(),
            backend.clone() as Arc<dyn EncoderBackend>,
            (Instant::now(), 0),
        );
        (sink, backend)
    }

    #[tokio::test]
    async fn video_listener_starts_gated_until_keyframe() {
        let (sink, backend) = make_sink();
        let (handle, mut rx) = sink.attach(MediaKind::Video, 8).unwrap();
        assert_eq!(backend.keyframes_requested.load(Ordering::Relaxed), 1);

        let sender = backend.sender.lock().unwrap().clone().unwrap();
        sender
            .send(Sample::delta(Bytes::from_static(b"delta"), Duration::ZERO))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());

        sender
            .send(Sample::keyframe(Bytes::from_static(b"key"), Duration::ZERO))
            .unwrap();
        let got = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(!got.delta_unit);
        sink.detach(handle);
    }

    #[tokio::test]
    async fn second_video_listener_does_not_retrigger_keyframe_request() {
        let (sink, backend) = make_sink();
        let (_h1, _rx1) = sink.attach(MediaKind::Video, 8).unwrap();
        assert_eq!(backend.keyframes_requested.load(Ordering::Relaxed), 1);
        let (_h2, _rx2) = sink.attach(MediaKind::Video, 8).unwrap();
        assert_eq!(backend.keyframes_requested.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn audio_listener_is_active_immediately() {
        let (sink, backend) = make_sink();
        let (_handle, mut rx) = sink.attach(MediaKind::Audio, 8).unwrap();
        assert_eq!(backend.keyframes_requested.load(Ordering::Relaxed), 0);
        let sender = backend.sender.lock().unwrap().clone().unwrap();
        sender
            .send(Sample::delta(Bytes::from_static(b"audio"), Duration::ZERO))
            .unwrap();
        let got = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&got.data[..], b"audio");
    }

    #[tokio::test]
    async fn detach_destroys_pipeline_when_last_listener_leaves() {
        let (sink, backend) = make_sink();
        let (handle, _rx) = sink.attach(MediaKind::Audio, 8).unwrap();
        assert_eq!(backend.destroys.load(Ordering::Relaxed), 0);
        sink.detach(handle);
        assert_eq!(backend.destroys.load(Ordering::Relaxed), 1);
        assert_eq!(sink.listener_count(), 0);
    }

    #[tokio::test]
    async fn detach_keeps_pipeline_alive_while_other_listeners_remain() {
        let (sink, backend) = make_sink();
        let (h1, _rx1) = sink.attach(MediaKind::Audio, 8).unwrap();
        let (_h2, _rx2) = sink.attach(MediaKind::Audio, 8).unwrap();
        sink.detach(h1);
        assert_eq!(backend.destroys.load(Ordering::Relaxed), 0);
        assert_eq!(sink.listener_count(), 1);
    }

    #[tokio::test]
    async fn move_listener_to_destroys_source_when_it_becomes_empty() {
        let (from, from_backend) = make_sink();
        let (to, to_backend) = make_sink();
        let (handle, _rx) = from.attach(MediaKind::Audio, 8).unwrap();

        let (_new_handle, _new_rx) = StreamSink::move_listener_to(&from, &to, handle, 8).unwrap();

        assert_eq!(from.listener_count(), 0);
        assert_eq!(to.listener_count(), 1);
        assert_eq!(from_backend.destroys.load(Ordering::Relaxed), 1);
        assert_eq!(to_backend.destroys.load(Ordering::Relaxed), 0);
    }
}
