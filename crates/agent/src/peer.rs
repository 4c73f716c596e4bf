//! WebRTC peer (spec.md §4.F, component F): one peer connection, its two
//! media tracks, its data channel, and the per-peer ABR control loop.
//! `PeerRegistry` is the multi-peer generalization this needed — the
//! teacher ran exactly one swappable peer for a single-user desktop;
//! here many browsers attach concurrently, each keyed by `session_id`.
//!
//! Grounded in the teacher's `peer.rs` for `WebRTCPeer` itself (codec
//! registration, SDP handling, data channel, RTCP reader) and its
//! `abr.rs` for the tick-loop shape, generalized from a single EMA/loss
//! heuristic acting on one fixed encoder to the spec's target-vs-stream
//! trend acting on whichever tier the peer's track currently holds.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::Context;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tracing::{info, warn};
use uuid::Uuid;

use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_H264, MIME_TYPE_OPUS, MediaEngine};
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::RTCPFeedback;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::stats::StatsReportType;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use beam_protocol::config::IceConfig;
use beam_protocol::{DataChannelFrame, IceServerInfo, InputEvent, SignalingMessage};

use crate::abr::AbrState;
use crate::history::BitrateHistory;
use crate::backend::DesktopService;
use crate::capture::CaptureSet;
use crate::error::PeerError;
use crate::sample::MediaKind;
use crate::selector::{self, SelectionRequest};
use crate::sink::StreamSink;
use crate::track::PeerTrack;

/// A single `TrackLocalStaticSample` commits to one SDP fmtp line for the
/// whole connection lifetime, so every tier's encoder must emit a bitstream
/// this profile can decode (see DESIGN.md: tiers forced to `nvh264enc`'s
/// Main profile on a connection negotiated at Baseline are a known gap).
const H264_FMTP: &str = "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f";

fn h264_feedback() -> Vec<RTCPFeedback> {
    vec![
        RTCPFeedback { typ: "goog-remb".into(), parameter: "".into() },
        RTCPFeedback { typ: "ccm".into(), parameter: "fir".into() },
        RTCPFeedback { typ: "nack".into(), parameter: "".into() },
        RTCPFeedback { typ: "nack".into(), parameter: "pli".into() },
        RTCPFeedback { typ: "transport-cc".into(), parameter: "".into() },
    ]
}

/// One negotiated connection to a browser: the RTCPeerConnection, its two
/// `TrackLocalStaticSample`s, and its single input/cursor data channel.
pub struct WebRTCPeer {
    connection: Arc<RTCPeerConnection>,
    video_track: Arc<TrackLocalStaticSample>,
    audio_track: Arc<TrackLocalStaticSample>,
    video_sender: Arc<RTCRtpSender>,
    data_channel: Arc<AsyncMutex<Option<Arc<RTCDataChannel>>>>,
}

impl WebRTCPeer {
    pub async fn new(ice_servers: Vec<RTCIceServer>) -> anyhow::Result<Self> {
        let mut media_engine = MediaEngine::default();

        // H.264 + Opus only, deliberately skipping
        // `register_default_codecs()`: a browser that negotiates VP8/VP9/AV1
        // against an agent that only ever encodes H.264 ends up silent.
        media_engine.register_codec(
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_H264.to_string(),
                    clock_rate: 90_000,
                    channels: 0,
                    sdp_fmtp_line: H264_FMTP.to_string(),
                    rtcp_feedback: h264_feedback(),
                },
                payload_type: 125,
                ..Default::default()
            },
            RTPCodecType::Video,
        )?;
        media_engine.register_codec(
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_OPUS.to_string(),
                    clock_rate: 48_000,
                    channels: 2,
                    sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
                    rtcp_feedback: vec![],
                },
                payload_type: 111,
                ..Default::default()
            },
            RTPCodecType::Audio,
        )?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration { ice_servers, ..Default::default() };
        let connection = Arc::new(api.new_peer_connection(config).await?);

        let video_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_H264.to_string(),
                clock_rate: 90_000,
                sdp_fmtp_line: H264_FMTP.to_string(),
                ..Default::default()
            },
            "video".to_string(),
            "beam-media".to_string(),
        ));
        let audio_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: 48_000,
                channels: 2,
                ..Default::default()
            },
            "audio".to_string(),
            "beam-media".to_string(),
        ));

        let video_sender = connection
            .add_track(Arc::clone(&video_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .context("failed to add video track")?;
        connection
            .add_track(Arc::clone(&audio_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .context("failed to add audio track")?;

        connection.on_peer_connection_state_change(Box::new(move |state| {
            match state {
                RTCPeerConnectionState::Failed => warn!("peer connection failed"),
                RTCPeerConnectionState::Disconnected => warn!("peer connection disconnected, ICE reconnecting"),
                _ => info!(?state, "peer connection state changed"),
            }
            Box::pin(async {})
        }));

        Ok(Self {
            connection,
            video_track,
            audio_track,
            video_sender,
            data_channel: Arc::new(AsyncMutex::new(None)),
        })
    }

    /// PLI/FIR from the browser must re-request a keyframe on whichever
    /// sink the video track currently holds, so the caller is handed the
    /// request rather than this type owning a sink reference itself.
    pub fn start_rtcp_reader(&self, on_keyframe_request: impl Fn() + Send + Sync + 'static) {
        let sender = Arc::clone(&self.video_sender);
        tokio::spawn(async move {
            while let Ok((packets, _)) = sender.read_rtcp().await {
                for pkt in &packets {
                    let pkt_any = pkt.as_any();
                    if pkt_any
                        .downcast_ref::<rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication>()
                        .is_some()
                        || pkt_any
                            .downcast_ref::<rtcp::payload_feedbacks::full_intra_request::FullIntraRequest>()
                            .is_some()
                    {
                        on_keyframe_request();
                    }
                }
            }
        });
    }

    pub async fn create_offer(&self) -> anyhow::Result<String> {
        let offer = self.connection.create_offer(None).await.context("create_offer failed")?;
        self.connection.set_local_description(offer.clone()).await.context("set_local_description failed")?;
        Ok(offer.sdp)
    }

    pub async fn create_restart_offer(&self) -> anyhow::Result<String> {
        use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
        let options = RTCOfferOptions { ice_restart: true, ..Default::default() };
        let offer = self
            .connection
            .create_offer(Some(options))
            .await
            .context("create_offer (ice restart) failed")?;
        self.connection.set_local_description(offer.clone()).await.context("set_local_description failed")?;
        Ok(offer.sdp)
    }

    pub async fn handle_offer(&self, sdp: &str) -> anyhow::Result<String> {
        let offer = RTCSessionDescription::offer(sdp.to_string()).context("invalid SDP offer")?;
        self.connection.set_remote_description(offer).await.context("set_remote_description failed")?;
        let answer = self.connection.create_answer(None).await.context("create_answer failed")?;
        self.connection.set_local_description(answer.clone()).await.context("set_local_description failed")?;
        Ok(answer.sdp)
    }

    pub async fn handle_answer(&self, sdp: &str) -> anyhow::Result<()> {
        let answer = RTCSessionDescription::answer(sdp.to_string()).context("invalid SDP answer")?;
        self.connection.set_remote_description(answer).await.context("set_remote_description failed")?;
        Ok(())
    }

    pub async fn add_ice_candidate(
        &self,
        candidate: &str,
        sdp_mid: Option<&str>,
        sdp_mline_index: Option<u16>,
    ) -> anyhow::Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.to_string(),
            sdp_mid: sdp_mid.map(|s| s.to_string()),
            sdp_mline_index,
            ..Default::default()
        };
        self.connection.add_ice_candidate(init).await.context("add_ice_candidate failed")?;
        Ok(())
    }

    pub async fn write_video_sample(&self, data: bytes::Bytes, duration: Duration) -> anyhow::Result<()> {
        self.video_track
            .write_sample(&webrtc::media::Sample { data, duration, ..Default::default() })
            .await
            .context("write_video_sample failed")?;
        Ok(())
    }

    pub async fn write_audio_sample(&self, data: bytes::Bytes, duration: Duration) -> anyhow::Result<()> {
        self.audio_track
            .write_sample(&webrtc::media::Sample { data, duration, ..Default::default() })
            .await
            .context("write_audio_sample failed")?;
        Ok(())
    }

    pub fn on_ice_candidate(&self, callback: impl Fn(String, Option<String>, Option<u16>) + Send + Sync + 'static) {
        self.connection.on_ice_candidate(Box::new(move |candidate| {
            if let Some(c) = candidate {
                match c.to_json() {
                    Ok(json) => callback(json.candidate, json.sdp_mid, json.sdp_mline_index),
                    Err(e) => warn!("failed to serialize ICE candidate: {e}"),
                }
            }
            Box::pin(async {})
        }));
    }

    /// Wires the inbound data channel (label `"data"`, opened by the
    /// browser): every parsed [`InputEvent`] goes to `on_input`, and the
    /// channel handle is stashed so `send_data_channel_frame` can reply on
    /// it (cursor position/image, pong).
    pub fn on_input_event(&self, on_input: impl Fn(InputEvent) + Send + Sync + 'static) {
        let on_input = Arc::new(on_input);
        let slot = Arc::clone(&self.data_channel);
        self.connection.on_data_channel(Box::new(move |dc| {
            let on_input = Arc::clone(&on_input);
            let slot = Arc::clone(&slot);
            Box::pin(async move {
                if dc.label() != "data" {
                    return;
                }
                *slot.lock().await = Some(Arc::clone(&dc));
                dc.on_message(Box::new(move |msg| {
                    let on_input = Arc::clone(&on_input);
                    Box::pin(async move {
                        match serde_json::from_slice::<InputEvent>(&msg.data) {
                            Ok(event) => on_input(event),
                            Err(e) => warn!("invalid input event: {e}"),
                        }
                    })
                }));
            })
        }));
    }

    pub async fn send_data_channel_frame(&self, frame: &DataChannelFrame) -> anyhow::Result<()> {
        let dc = self.data_channel.lock().await;
        if let Some(dc) = dc.as_ref() {
            dc.send(&bytes::Bytes::from(frame.encode())).await.context("data channel send failed")?;
        }
        Ok(())
    }

    pub fn connection_state(&self) -> RTCPeerConnectionState {
        self.connection.connection_state()
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state() == RTCPeerConnectionState::Connected
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.connection_state(), RTCPeerConnectionState::Closed)
    }

    /// Cumulative video RTP counters, used by the ABR loop to derive a
    /// target-bitrate estimate (no bandwidth-estimator binding is wired up
    /// here, see DESIGN.md — this is a loss/throughput proxy instead).
    async fn video_rtp_counters(&self) -> RtpCounters {
        let stats = self.connection.get_stats().await;
        let mut counters = RtpCounters::default();
        for stat in stats.reports.values() {
            if let StatsReportType::OutboundRTP(rtp) = stat
                && rtp.kind == "video"
            {
                counters.bytes_sent = rtp.bytes_sent;
                counters.packets_sent = rtp.packets_sent;
            }
            if let StatsReportType::RemoteInboundRTP(remote) = stat
                && remote.kind == "video"
            {
                counters.packets_lost = remote.packets_lost.max(0) as u64;
            }
        }
        counters
    }

    pub async fn close(&self) -> anyhow::Result<()> {
        self.connection.close().await.context("close failed")?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct RtpCounters {
    bytes_sent: u64,
    packets_sent: u64,
    packets_lost: u64,
}

/// Estimated delivered bitrate over one interval, in the same `payload_len /
/// 8` units `StreamSink::bitrate()` publishes: bytes sent since `prev`,
/// loss-discounted, spread over the interval's wall-clock length. Stands in
/// for a real bandwidth estimator (see DESIGN.md).
fn estimate_target_bitrate(prev: &RtpCounters, now: &RtpCounters, interval: Duration) -> Option<u64> {
    let packets = now.packets_sent.saturating_sub(prev.packets_sent);
    if packets == 0 || interval.is_zero() {
        return None;
    }
    let bytes = now.bytes_sent.saturating_sub(prev.bytes_sent);
    let lost = now.packets_lost.saturating_sub(prev.packets_lost);
    let loss_rate = lost as f64 / (packets + lost) as f64;
    let delivered_bytes = bytes as f64 * (1.0 - loss_rate).max(0.0);
    let per_second = delivered_bytes / interval.as_secs_f64();
    Some((per_second / 8.0) as u64)
}

struct TrackSlot {
    track: PeerTrack,
    forward_task: Option<tokio::task::JoinHandle<()>>,
}

impl TrackSlot {
    fn new(kind: MediaKind, buffer: usize) -> Self {
        Self { track: PeerTrack::new(kind, buffer), forward_task: None }
    }
}

/// One connected browser's state (spec.md §4.F): its transport, its two
/// media subscriptions, and the ABR hysteresis driving the video one.
pub struct PeerSession {
    pub session_id: Uuid,
    peer: Arc<WebRTCPeer>,
    video: AsyncMutex<TrackSlot>,
    audio: AsyncMutex<TrackSlot>,
    abr: std::sync::Mutex<AbrState>,
    history: std::sync::Mutex<BitrateHistory>,
    video_auto: AtomicBool,
    outbound_tx: mpsc::Sender<SignalingMessage>,
}

impl PeerSession {
    pub async fn current_video_id(&self) -> Option<String> {
        self.video.lock().await.track.current_video_id().map(str::to_string)
    }

    pub fn video_auto(&self) -> bool {
        self.video_auto.load(Ordering::Relaxed)
    }

    /// Attaches (or migrates) the video track to `sink`/`video_id`. Returns
    /// `false` without touching anything if the track is already there
    /// (spec.md §4.E's `changed` flag).
    async fn set_video(&self, video_id: &str, sink: Arc<StreamSink>) -> Result<bool, PeerError> {
        let mut slot = self.video.lock().await;
        if slot.track.current_video_id() == Some(video_id) {
            return Ok(false);
        }
        let rx = slot.track.set_stream(video_id, sink)?;
        if let Some(old) = slot.forward_task.take() {
            old.abort();
        }
        let peer = Arc::clone(&self.peer);
        slot.forward_task = Some(tokio::spawn(forward_video(rx, peer)));
        Ok(true)
    }

    async fn set_audio(&self, sink: Arc<StreamSink>) -> Result<(), PeerError> {
        let mut slot = self.audio.lock().await;
        if slot.track.is_attached() {
            return Ok(());
        }
        let rx = slot.track.set_stream("audio", sink)?;
        let peer = Arc::clone(&self.peer);
        slot.forward_task = Some(tokio::spawn(forward_audio(rx, peer)));
        Ok(())
    }

    async fn request_video_keyframe(&self) {
        self.video.lock().await.track.request_keyframe();
    }
}

async fn forward_video(mut rx: mpsc::Receiver<crate::sample::Sample>, peer: Arc<WebRTCPeer>) {
    while let Some(sample) = rx.recv().await {
        if let Err(e) = peer.write_video_sample(sample.data, sample.duration).await {
            warn!("video write failed: {e:#}");
        }
    }
}

async fn forward_audio(mut rx: mpsc::Receiver<crate::sample::Sample>, peer: Arc<WebRTCPeer>) {
    while let Some(sample) = rx.recv().await {
        if let Err(e) = peer.write_audio_sample(sample.data, sample.duration).await {
            warn!("audio write failed: {e:#}");
        }
    }
}

/// Every active peer, keyed by the session id the signalling layer assigns
/// (spec.md §4.H). One process, many concurrent browsers.
pub struct PeerRegistry {
    ice_servers: Vec<RTCIceServer>,
    ice_server_info: Vec<IceServerInfo>,
    abr_tick: Duration,
    outbound_tx: mpsc::Sender<SignalingMessage>,
    desktop: Arc<dyn DesktopService>,
    resize_tx: mpsc::Sender<(u32, u32)>,
    sessions: std::sync::Mutex<HashMap<Uuid, Arc<PeerSession>>>,
    /// The declared host (spec.md:198), whose cursor-position broadcasts are
    /// suppressed. Grounded in the original's `SessionManager`-level
    /// `isHost(session)` (`session.go`): host status is a registry-wide
    /// computed property, not a per-session flag. With no session/membership
    /// layer in scope, the first peer to connect is host until it closes.
    host_session_id: std::sync::Mutex<Option<Uuid>>,
}

impl PeerRegistry {
    /// `resize_tx` carries client-requested `InputEvent::Resize`s out to
    /// whoever owns the `CaptureManager` (spec.md §4.D) — resizing touches
    /// every sink in the capture set, which this registry has no handle on.
    pub fn new(
        ice: &IceConfig,
        abr_tick_ms: u64,
        outbound_tx: mpsc::Sender<SignalingMessage>,
        desktop: Arc<dyn DesktopService>,
        resize_tx: mpsc::Sender<(u32, u32)>,
    ) -> Self {
        let mut ice_servers = Vec::new();
        let mut ice_server_info = Vec::new();
        if !ice.stun_urls.is_empty() {
            ice_servers.push(RTCIceServer { urls: ice.stun_urls.clone(), ..Default::default() });
            ice_server_info.push(IceServerInfo { urls: ice.stun_urls.clone(), username: None, credential: None });
        }
        if !ice.turn_urls.is_empty() {
            ice_servers.push(RTCIceServer {
                urls: ice.turn_urls.clone(),
                username: ice.turn_username.clone().unwrap_or_default(),
                credential: ice.turn_credential.clone().unwrap_or_default(),
                ..Default::default()
            });
            ice_server_info.push(IceServerInfo {
                urls: ice.turn_urls.clone(),
                username: ice.turn_username.clone(),
                credential: ice.turn_credential.clone(),
            });
        }
        Self {
            ice_servers,
            ice_server_info,
            abr_tick: Duration::from_millis(abr_tick_ms),
            outbound_tx,
            desktop,
            resize_tx,
            sessions: std::sync::Mutex::new(HashMap::new()),
            host_session_id: std::sync::Mutex::new(None),
        }
    }

    fn get(&self, session_id: Uuid) -> Result<Arc<PeerSession>, PeerError> {
        self.sessions.lock().unwrap().get(&session_id).cloned().ok_or(PeerError::ConnectionNotFound)
    }

    /// Whether `session_id` is the declared host (spec.md:198).
    pub fn is_host(&self, session_id: Uuid) -> bool {
        *self.host_session_id.lock().unwrap() == Some(session_id)
    }

    /// `signal/request`: create a peer, attach its initial tier/audio, emit
    /// the offer over `signal/provide`.
    pub async fn handle_request(
        &self,
        capture: &Arc<CaptureSet>,
        session_id: Uuid,
        video: Option<String>,
        bitrate: Option<u64>,
        video_auto: bool,
    ) -> anyhow::Result<()> {
        let peer = Arc::new(WebRTCPeer::new(self.ice_servers.clone()).await?);
        let session = Arc::new(PeerSession {
            session_id,
            peer: Arc::clone(&peer),
            video: AsyncMutex::new(TrackSlot::new(MediaKind::Video, 64)),
            audio: AsyncMutex::new(TrackSlot::new(MediaKind::Audio, 64)),
            abr: std::sync::Mutex::new(AbrState::new(Default::default())),
            history: std::sync::Mutex::new(BitrateHistory::new()),
            video_auto: AtomicBool::new(video_auto),
            outbound_tx: self.outbound_tx.clone(),
        });

        self.wire(&session);
        self.sessions.lock().unwrap().insert(session_id, Arc::clone(&session));
        self.host_session_id.lock().unwrap().get_or_insert(session_id);

        let request = SelectionRequest { video_id: video, direction: None, bitrate };
        let chosen = selector::select(&capture.video_ids, &capture.snapshots(), &request)?;
        let sink = capture.video_by_id(&chosen).context("selected tier missing from capture set")?.clone();
        session.set_video(&chosen, Arc::clone(&sink)).await?;
        session.set_audio(Arc::clone(&capture.audio)).await?;

        let sdp = peer.create_offer().await?;
        self.outbound_tx
            .send(SignalingMessage::Provide {
                session_id,
                sdp,
                ice_servers: self.ice_server_info.clone(),
                video: chosen.clone(),
                bitrate: sink.bitrate(),
                video_auto,
            })
            .await
            .ok();

        self.spawn_abr_loop(Arc::clone(&session), Arc::clone(capture));
        info!(%session_id, video = %chosen, "peer created");
        Ok(())
    }

    /// Wires RTCP keyframe requests, outbound trickle ICE and inbound input
    /// events for a freshly constructed session. Split out of
    /// `handle_request` because every closure needs `Arc<PeerSession>`,
    /// which only exists once the session is already behind an `Arc`.
    fn wire(&self, session: &Arc<PeerSession>) {
        let for_keyframe = Arc::clone(session);
        session.peer.start_rtcp_reader(move || {
            let session = Arc::clone(&for_keyframe);
            tokio::spawn(async move { session.request_video_keyframe().await });
        });

        let session_id = session.session_id;
        let outbound_tx = self.outbound_tx.clone();
        session.peer.on_ice_candidate(move |candidate, sdp_mid, sdp_mline_index| {
            let outbound_tx = outbound_tx.clone();
            let msg = SignalingMessage::IceCandidate { candidate, sdp_mid, sdp_mline_index, session_id };
            tokio::spawn(async move {
                outbound_tx.send(msg).await.ok();
            });
        });

        let desktop = Arc::clone(&self.desktop);
        let resize_tx = self.resize_tx.clone();
        session.peer.on_input_event(move |event| {
            // A client-requested resize must be serialized against every
            // other capture-set mutation, so it's handed off to whoever
            // owns the `CaptureManager` rather than injected here.
            if let InputEvent::Resize { w, h } = event {
                let resize_tx = resize_tx.clone();
                tokio::spawn(async move {
                    resize_tx.send((w, h)).await.ok();
                });
                return;
            }
            if let Err(e) = desktop.inject_input(&event) {
                warn!("input injection failed: {e:#}");
            }
        });
    }

    fn spawn_abr_loop(&self, session: Arc<PeerSession>, capture: Arc<CaptureSet>) {
        let tick = self.abr_tick;
        tokio::spawn(async move {
            let mut prev = RtpCounters::default();
            let mut last_tick = Instant::now();
            loop {
                tokio::time::sleep(tick).await;
                if session.peer.is_closed() {
                    break;
                }
                if !session.peer.is_connected() || !session.video_auto() {
                    continue;
                }
                let Some(video_id) = session.current_video_id().await else { continue };
                let Some(sink) = capture.video_by_id(&video_id) else { continue };
                let stream_bitrate = sink.bitrate();
                if stream_bitrate == 0 {
                    continue;
                }

                let now_counters = session.peer.video_rtp_counters().await;
                let interval = last_tick.elapsed();
                last_tick = Instant::now();
                let Some(target) = estimate_target_bitrate(&prev, &now_counters, interval) else {
                    prev = now_counters;
                    continue;
                };
                prev = now_counters;

                // Smooth the raw per-tick estimate against its own recent
                // history before it feeds the trend classifier, so one noisy
                // RTCP report can't trigger a tier switch by itself.
                let target = session.history.lock().unwrap().normalise_bitrate(target, Instant::now());

                let direction = session.abr.lock().unwrap().tick(target, stream_bitrate, Instant::now());
                let Some(direction) = direction else { continue };

                let request = SelectionRequest {
                    video_id: Some(video_id.clone()),
                    direction: Some(direction),
                    bitrate: None,
                };
                let new_id = match selector::select(&capture.video_ids, &capture.snapshots(), &request) {
                    Ok(id) => id,
                    Err(_) => {
                        info!(session_id = %session.session_id, %video_id, ?direction, "already at extreme tier");
                        continue;
                    }
                };
                if new_id == video_id {
                    continue;
                }
                let Some(new_sink) = capture.video_by_id(&new_id) else { continue };
                match session.set_video(&new_id, Arc::clone(new_sink)).await {
                    Ok(true) => {
                        let msg = SignalingMessage::Video {
                            session_id: session.session_id,
                            video: Some(new_id.clone()),
                            bitrate: Some(new_sink.bitrate()),
                            video_auto: true,
                        };
                        session.outbound_tx.send(msg).await.ok();
                        info!(session_id = %session.session_id, from = %video_id, to = %new_id, ?direction, "abr tier switch");
                    }
                    Ok(false) => {}
                    Err(e) => warn!("abr tier switch failed: {e:#}"),
                }
            }
        });
    }

    pub async fn handle_answer(&self, session_id: Uuid, sdp: String) -> anyhow::Result<()> {
        self.get(session_id)?.peer.handle_answer(&sdp).await
    }

    /// `signal/offer` inbound: the browser renegotiated. Answerer role,
    /// mirroring the teacher's `handle_offer`.
    pub async fn handle_offer(&self, session_id: Uuid, sdp: String) -> anyhow::Result<String> {
        self.get(session_id)?.peer.handle_offer(&sdp).await
    }

    pub async fn handle_ice_candidate(
        &self,
        session_id: Uuid,
        candidate: String,
        sdp_mid: Option<String>,
        sdp_mline_index: Option<u16>,
    ) -> anyhow::Result<()> {
        self.get(session_id)?.peer.add_ice_candidate(&candidate, sdp_mid.as_deref(), sdp_mline_index).await
    }

    pub async fn handle_restart(&self, session_id: Uuid) -> anyhow::Result<String> {
        self.get(session_id)?.peer.create_restart_offer().await
    }

    /// `signal/video` inbound: explicit tier pick or auto-mode toggle.
    pub async fn handle_video(
        &self,
        capture: &CaptureSet,
        session_id: Uuid,
        video: Option<String>,
        bitrate: Option<u64>,
        video_auto: bool,
    ) -> anyhow::Result<()> {
        let session = self.get(session_id)?;
        session.video_auto.store(video_auto, Ordering::Relaxed);

        let request = SelectionRequest { video_id: video, direction: None, bitrate };
        let chosen = selector::select(&capture.video_ids, &capture.snapshots(), &request)?;
        let sink = capture.video_by_id(&chosen).context("selected tier missing from capture set")?.clone();
        if session.set_video(&chosen, Arc::clone(&sink)).await? {
            self.outbound_tx
                .send(SignalingMessage::Video {
                    session_id,
                    video: Some(chosen.clone()),
                    bitrate: Some(sink.bitrate()),
                    video_auto,
                })
                .await
                .ok();
        }
        Ok(())
    }

    pub async fn handle_close(&self, session_id: Uuid) -> anyhow::Result<()> {
        if let Some(session) = self.sessions.lock().unwrap().remove(&session_id) {
            session.peer.close().await.ok();
        }
        let mut host = self.host_session_id.lock().unwrap();
        if *host == Some(session_id) {
            *host = None;
        }
        Ok(())
    }

    /// Broadcasts a cursor update (or pong) to every connected peer's data
    /// channel — cursor tracking is per-display, not per-peer, so the
    /// capture side feeds this rather than each session polling its own.
    /// `CursorPosition` is withheld from the declared host (spec.md:198):
    /// the host already sees its own cursor locally.
    pub async fn broadcast_frame(&self, frame: &DataChannelFrame) {
        let sessions: Vec<Arc<PeerSession>> = self.sessions.lock().unwrap().values().cloned().collect();
        for session in sessions {
            if matches!(frame, DataChannelFrame::CursorPosition { .. }) && self.is_host(session.session_id) {
                continue;
            }
            if let Err(e) = session.peer.send_data_channel_frame(frame).await {
                warn!(session_id = %session.session_id, "cursor frame send failed: {e:#}");
            }
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    /// The sender half of this registry's outbound signalling channel, for
    /// callers outside `wire()` that need to push a message (an offer/answer
    /// produced directly from a transport-level dispatch, for instance).
    pub fn outbound_tx(&self) -> mpsc::Sender<SignalingMessage> {
        self.outbound_tx.clone()
    }
}
