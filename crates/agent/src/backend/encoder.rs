//! Generic encoder backend (spec.md §6): `create → play → sample-stream →
//! destroy`, exposing `delta_unit` straight off GStreamer's own
//! `GST_BUFFER_FLAG_DELTA_UNIT` rather than parsing H.264 NAL units.
//!
//! Grounded in the teacher's `encoder.rs` (appsink callback wiring, bus
//! error watch, force-keyframe via `UpstreamForceKeyUnitEvent`), generalized
//! from a hardcoded NVIDIA/VA-API/software element chain to a pipeline
//! *description string* per sink, following the original's
//! `VideoConfig.GetPipeline` (`pkg/types/capture.go`) and
//! `gst.CreatePipeline` (`internal/capture/streamsink.go`).

use std::sync::mpsc;
use std::time::Duration;

use anyhow::{Context, anyhow};
use bytes::Bytes;
use gstreamer::{self as gst, prelude::*};
use gstreamer_app::{AppSink, AppSinkCallbacks};
use tracing::{error, warn};

use crate::sample::Sample;

/// A small capability set standing in for the encoder integration (spec.md
/// §9: "expose ... as a small capability set ... avoid deep class
/// hierarchies").
pub trait EncoderBackend: Send + Sync {
    fn create_pipeline(&self, description: &str) -> anyhow::Result<Box<dyn Pipeline>>;
}

pub trait Pipeline: Send {
    /// Starts the pipeline and returns the (finite) sample stream; ends when
    /// `destroy` is called or the pipeline errors out.
    fn play(&mut self) -> anyhow::Result<mpsc::Receiver<Sample>>;
    fn emit_video_keyframe(&self);
    fn destroy(self: Box<Self>);
}

/// Production backend: builds the pipeline from a `gst-launch`-style
/// description string, e.g.
/// `"ximagesrc ! videoconvert ! x264enc ! h264parse ! appsink name=sink"`.
/// The description must name its terminal sink element `sink`.
pub struct GstBackend;

impl GstBackend {
    pub fn new() -> anyhow::Result<Self> {
        gst::init().context("failed to initialize GStreamer")?;
        Ok(Self)
    }
}

impl EncoderBackend for GstBackend {
    fn create_pipeline(&self, description: &str) -> anyhow::Result<Box<dyn Pipeline>> {
        let element = gst::parse::launch(description)
            .with_context(|| format!("failed to parse pipeline description: {description}"))?;
        let pipeline = element
            .downcast::<gst::Pipeline>()
            .map_err(|_| anyhow!("pipeline description did not produce a top-level gst::Pipeline"))?;
        Ok(Box::new(GstPipeline {
            pipeline,
            bus_watch: None,
        }))
    }
}

struct GstPipeline {
    pipeline: gst::Pipeline,
    bus_watch: Option<gst::bus::BusWatchGuard>,
}

impl Pipeline for GstPipeline {
    fn play(&mut self) -> anyhow::Result<mpsc::Receiver<Sample>> {
        let sink_elem = self
            .pipeline
            .by_name("sink")
            .context("pipeline description must name its terminal sink 'sink'")?;
        let appsink = sink_elem
            .dynamic_cast::<AppSink>()
            .map_err(|_| anyhow!("element named 'sink' is not an appsink"))?;

        let (tx, rx) = mpsc::channel();
        appsink.set_callbacks(
            AppSinkCallbacks::builder()
                .new_sample(move |sink| {
                    let sample = sink.pull_sample().map_err(|_| gst::FlowError::Eos)?;
                    let buffer = sample.buffer().ok_or(gst::FlowError::Error)?;
                    let delta_unit = buffer.flags().contains(gst::BufferFlags::DELTA_UNIT);
                    let duration = buffer
                        .duration()
                        .map(|d| Duration::from_nanos(d.nseconds()))
                        .unwrap_or_default();
                    let map = buffer.map_readable().map_err(|_| gst::FlowError::Error)?;
                    let data = Bytes::copy_from_slice(&map);
                    let out = if delta_unit {
                        Sample::delta(data, duration)
                    } else {
                        Sample::keyframe(data, duration)
                    };
                    // A full channel (consumer gone) just drops the sample.
                    let _ = tx.send(out);
                    Ok(gst::FlowSuccess::Ok)
                })
                .build(),
        );

        let bus = self.pipeline.bus().context("pipeline has no bus")?;
        let watch = bus
            .add_watch(move |_, msg| {
                use gst::MessageView;
                match msg.view() {
                    MessageView::Error(err) => {
                        error!(
                            source = ?err.src().map(|s| s.name().to_string()),
                            error = %err.error(),
                            debug = ?err.debug(),
                            "pipeline error"
                        );
                    }
                    MessageView::Warning(w) => {
                        warn!(
                            source = ?w.src().map(|s| s.name().to_string()),
                            warning = %w.error(),
                            "pipeline warning"
                        );
                    }
                    _ => {}
                }
                gst::glib::ControlFlow::Continue
            })
            .context("failed to add bus watch")?;
        self.bus_watch = Some(watch);

        self.pipeline
            .set_state(gst::State::Playing)
            .context("failed to set pipeline to Playing")?;
        Ok(rx)
    }

    fn emit_video_keyframe(&self) {
        let event = gstreamer_video::UpstreamForceKeyUnitEvent::builder()
            .all_headers(true)
            .build();
        self.pipeline.send_event(event);
    }

    fn destroy(self: Box<Self>) {
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}
