//! Structured error taxonomy per failing subsystem (spec.md §7), mirroring
//! the teacher's `beam_protocol::FrameError` shape: one `thiserror` enum per
//! library boundary, `anyhow::Result` at operation/task boundaries.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("pipeline construction failed for sink '{sink_id}': {source}")]
    PipelineConstruction {
        sink_id: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("create_pipeline called on sink '{0}' while a pipeline is already live")]
    PipelineAlreadyExists(String),
}

#[derive(Debug, Error)]
pub enum SelectorError {
    #[error("no stream matches the given selector")]
    StreamNotFound,
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("sink error: {0}")]
    Sink(#[from] SinkError),
    #[error("screen size change recreate failed: {0}")]
    Recreate(anyhow::Error),
}

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("webrtc peer connection not found or already closed")]
    ConnectionNotFound,
    #[error("data channel not open")]
    DataChannelNotFound,
    #[error("selector: {0}")]
    Selector(#[from] SelectorError),
    #[error("webrtc error: {0}")]
    WebRtc(#[from] webrtc::Error),
    #[error("sink error: {0}")]
    Sink(#[from] SinkError),
}
