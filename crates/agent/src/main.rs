mod abr;
mod backend;
mod capture;
mod cli;
mod error;
mod history;
mod peer;
mod sample;
mod selector;
mod signaling;
mod sink;
mod track;
mod trend;

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::mpsc;
use tracing::{info, warn};

use backend::desktop::{CursorUpdate, X11Desktop, clamp_resize_dimensions};
use backend::encoder::{EncoderBackend, GstBackend};
use backend::DesktopService;
use beam_protocol::DataChannelFrame;
use capture::CaptureManager;
use peer::PeerRegistry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = cli::parse_args()?;
    let config = cli::load_config(&args)?;
    info!(
        server_url = %args.server_url,
        display = %config.display.name,
        tiers = config.video.tiers.len(),
        "starting beam-agent"
    );

    let desktop: Arc<dyn DesktopService> =
        Arc::new(X11Desktop::new(&config.display.name).context("failed to initialize desktop backend")?);
    let encoder: Arc<dyn EncoderBackend> =
        Arc::new(GstBackend::new().context("failed to initialize GStreamer")?);

    let mut capture_manager = CaptureManager::new(
        &config,
        Arc::clone(&encoder),
        Arc::clone(&desktop),
        args.broadcast_url.clone(),
        args.screencast,
    )
    .context("failed to build capture set")?;
    let capture_set = capture_manager.shared_set();

    let (outbound_tx, outbound_rx) = mpsc::channel(64);
    let (resize_tx, mut resize_rx) = mpsc::channel(4);

    let registry = Arc::new(PeerRegistry::new(
        &config.ice,
        config.abr.tick_ms,
        outbound_tx,
        Arc::clone(&desktop),
        resize_tx,
    ));

    // Owns `capture_manager` exclusively, so a resize's destroy-all /
    // recreate-all sweep (spec.md §4.D) never races a concurrent one.
    let max_width = config.display.max_width;
    let max_height = config.display.max_height;
    let resize_task = tokio::spawn(async move {
        while let Some((w, h)) = resize_rx.recv().await {
            let Some((w, h)) = clamp_resize_dimensions(w, h, max_width, max_height) else {
                warn!(w, h, "rejecting out-of-range resize request");
                continue;
            };
            info!(w, h, "handling resize request");
            if let Err(e) = capture_manager.handle_resize(w, h) {
                warn!("resize failed: {e:#}");
            }
        }
    });

    // Cursor position/shape is per-display, not per-peer: one watcher feeds
    // every connected browser's data channel (spec.md §4.G).
    let cursor_task = {
        let registry = Arc::clone(&registry);
        let desktop = Arc::clone(&desktop);
        tokio::spawn(async move {
            let mut rx = match desktop.watch_cursor() {
                Ok(rx) => rx,
                Err(e) => {
                    warn!("cursor watch unavailable: {e:#}");
                    return;
                }
            };
            while let Some(update) = rx.recv().await {
                let frame = match update {
                    CursorUpdate::Position { x, y } => DataChannelFrame::CursorPosition { x, y },
                    CursorUpdate::Image { width, height, xhot, yhot, pixels } => {
                        DataChannelFrame::CursorImage { width, height, xhot, yhot, pixels }
                    }
                };
                registry.broadcast_frame(&frame).await;
            }
        })
    };

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("failed to install SIGTERM handler")?;

    tokio::select! {
        _ = signaling::run_signaling(&args.server_url, Arc::clone(&registry), Arc::clone(&capture_set), outbound_rx) => {}
        _ = tokio::signal::ctrl_c() => {
            info!("received SIGINT, shutting down");
        }
        _ = sigterm.recv() => {
            info!("received SIGTERM, shutting down");
        }
    }

    resize_task.abort();
    cursor_task.abort();
    info!(sessions = registry.session_count(), "beam-agent shutdown complete");
    Ok(())
}
