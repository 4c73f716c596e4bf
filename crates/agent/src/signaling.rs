//! Signalling transport (spec.md §4.H, component H): one reconnecting
//! WebSocket carrying JSON-encoded [`SignalingMessage`]s for every session
//! multiplexed on this agent, dispatched into the [`PeerRegistry`].
//!
//! Grounded in the teacher's `signaling.rs` for the reconnect/backoff loop
//! shape; its manual TLS certificate pinning (`rustls`/`rustls-pemfile`) is
//! dropped rather than carried forward (see DESIGN.md) since this agent
//! multiplexes many peers per connection instead of the teacher's
//! one-agent-one-session model, and production deployments are expected to
//! terminate TLS at a reverse proxy in front of the signalling endpoint.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::mpsc;
use tracing::{info, warn};

use beam_protocol::SignalingMessage;

use crate::capture::CaptureSet;
use crate::peer::PeerRegistry;

/// Runs forever, reconnecting with exponential backoff on any transport
/// error. `registry` and `capture` are shared with the rest of the agent;
/// every inbound message is dispatched synchronously before the next one is
/// read, so ordering within one session is preserved. `outbound_rx` is the
/// receiving half of the channel `registry` was built with — it survives
/// reconnects, so messages produced while disconnected (an ABR switch, a
/// `Close`) are simply delivered once the next connection comes up.
pub async fn run_signaling(
    server_url: &str,
    registry: Arc<PeerRegistry>,
    capture: Arc<CaptureSet>,
    mut outbound_rx: mpsc::Receiver<SignalingMessage>,
) {
    if server_url.is_empty() {
        info!("no signalling server url configured, idling");
        std::future::pending::<()>().await;
        return;
    }

    let mut backoff = Duration::from_secs(1);
    let max_backoff = Duration::from_secs(30);
    loop {
        info!(url = server_url, "connecting to signalling server");
        match connect_and_handle(server_url, &registry, &capture, &mut outbound_rx).await {
            Ok(()) => {
                info!("signalling connection closed cleanly");
                backoff = Duration::from_secs(1);
            }
            Err(e) => {
                warn!("signalling connection error: {e:#}");
                info!("reconnecting in {}s", backoff.as_secs());
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(max_backoff);
            }
        }
    }
}

async fn connect_and_handle(
    server_url: &str,
    registry: &Arc<PeerRegistry>,
    capture: &Arc<CaptureSet>,
    outbound_rx: &mut mpsc::Receiver<SignalingMessage>,
) -> anyhow::Result<()> {
    use futures_util::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::Message;

    let (ws_stream, _) = tokio_tungstenite::connect_async(server_url)
        .await
        .context("websocket connection failed")?;
    info!("connected to signalling server");
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    loop {
        tokio::select! {
            incoming = ws_rx.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<SignalingMessage>(&text) {
                            Ok(msg) => dispatch(registry, capture, &registry.outbound_tx(), msg).await,
                            Err(e) => warn!("invalid signalling message: {e}"),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Err(e)) => return Err(e.into()),
                    _ => {}
                }
            }
            Some(msg) = outbound_rx.recv() => {
                let text = serde_json::to_string(&msg).context("failed to encode outbound signalling message")?;
                ws_tx.send(Message::Text(text.into())).await?;
            }
        }
    }
}

async fn dispatch(
    registry: &Arc<PeerRegistry>,
    capture: &Arc<CaptureSet>,
    outbound_tx: &mpsc::Sender<SignalingMessage>,
    msg: SignalingMessage,
) {
    let result: anyhow::Result<()> = match msg {
        SignalingMessage::Request { session_id, video, bitrate, video_auto } => {
            registry.handle_request(capture, session_id, video, bitrate, video_auto).await
        }
        SignalingMessage::Answer { session_id, sdp } => registry.handle_answer(session_id, sdp).await,
        SignalingMessage::Offer { session_id, sdp } => {
            match registry.handle_offer(session_id, sdp).await {
                Ok(answer) => {
                    outbound_tx.send(SignalingMessage::Answer { session_id, sdp: answer }).await.ok();
                    Ok(())
                }
                Err(e) => Err(e),
            }
        }
        SignalingMessage::IceCandidate { session_id, candidate, sdp_mid, sdp_mline_index } => {
            registry.handle_ice_candidate(session_id, candidate, sdp_mid, sdp_mline_index).await
        }
        SignalingMessage::Video { session_id, video, bitrate, video_auto } => {
            registry.handle_video(capture, session_id, video, bitrate, video_auto).await
        }
        SignalingMessage::Restart { session_id, .. } => match registry.handle_restart(session_id).await {
            Ok(sdp) => {
                outbound_tx
                    .send(SignalingMessage::Restart { session_id, sdp: Some(sdp) })
                    .await
                    .ok();
                Ok(())
            }
            Err(e) => Err(e),
        },
        SignalingMessage::Close { session_id } => registry.handle_close(session_id).await,
        SignalingMessage::Provide { .. } | SignalingMessage::Error { .. } => {
            // Outbound-only shapes; receiving one inbound is a protocol
            // violation from the server side. Nothing to act on.
            Ok(())
        }
    };
    if let Err(e) = result {
        warn!("signalling dispatch failed: {e:#}");
    }
}
