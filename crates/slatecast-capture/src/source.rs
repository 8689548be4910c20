//! Shared GStreamer plumbing for the screen-capture backends.
//!
//! Both backends boil down to a pipeline that ends in
//! `videoconvert ! video/x-raw,format=BGRx ! appsink`; they differ only
//! in the source element. The appsink keeps at most two buffers and
//! drops the oldest, so a slow consumer sees fresh frames instead of a
//! growing queue.

use std::time::{Duration, Instant};

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app::AppSink;
use gstreamer_video as gst_video;
use tracing::debug;

use slatecast_core::{Error, RawFrame, Result};

use crate::change::ChangeDetector;

/// How long to wait for the first frame while discovering dimensions.
const PREROLL_TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) struct GstFrameSource {
    pipeline: gst::Pipeline,
    appsink: AppSink,
    width: u32,
    height: u32,
    stride: u32,
    detector: ChangeDetector,
    pending_changes: i64,
    started: Instant,
}

impl GstFrameSource {
    /// Launch `description` (which must contain an appsink named `sink`),
    /// wait for preroll and read the negotiated frame geometry.
    pub(crate) fn open(description: &str) -> Result<Self> {
        gst::init().map_err(|e| Error::capture(format!("gstreamer init: {e}")))?;
        debug!("capture pipeline: {description}");

        let pipeline = gst::parse::launch(description)
            .map_err(|e| Error::capture(format!("pipeline parse: {e}")))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| Error::capture("expected a pipeline"))?;

        let appsink = pipeline
            .by_name("sink")
            .ok_or_else(|| Error::capture("appsink 'sink' missing from pipeline"))?
            .downcast::<AppSink>()
            .map_err(|_| Error::capture("'sink' is not an appsink"))?;

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| Error::capture(format!("pipeline start: {e}")))?;

        let sample = appsink
            .try_pull_preroll(gst::ClockTime::from_mseconds(PREROLL_TIMEOUT.as_millis() as u64))
            .ok_or_else(|| {
                let _ = pipeline.set_state(gst::State::Null);
                Error::capture("no frames from capture source (preroll timeout)")
            })?;

        let caps = sample.caps().ok_or_else(|| Error::capture("preroll sample without caps"))?;
        let info = gst_video::VideoInfo::from_caps(caps)
            .map_err(|e| Error::capture(format!("capture caps: {e}")))?;
        let width = info.width();
        let height = info.height();
        let stride = info.stride()[0] as u32;

        Ok(Self {
            pipeline,
            appsink,
            width,
            height,
            stride,
            detector: ChangeDetector::new(),
            pending_changes: 0,
            started: Instant::now(),
        })
    }

    pub(crate) fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Pull the next frame, waiting at most `deadline`. `Ok(None)` means
    /// nothing arrived in time.
    pub(crate) fn capture_frame(&mut self, deadline: Duration) -> Result<Option<RawFrame>> {
        let timeout = gst::ClockTime::from_useconds(deadline.as_micros().max(1) as u64);
        let Some(sample) = self.appsink.try_pull_sample(timeout) else {
            if self.appsink.is_eos() {
                return Err(Error::capture("capture source reached end of stream"));
            }
            return Ok(None);
        };

        let buffer = sample.buffer().ok_or_else(|| Error::capture("sample without buffer"))?;
        let map = buffer
            .map_readable()
            .map_err(|_| Error::capture("cannot map capture buffer"))?;

        let timestamp_us = buffer
            .pts()
            .map(|t| t.useconds())
            .unwrap_or_else(|| self.started.elapsed().as_micros() as u64);

        let data = map.as_slice().to_vec();
        if self.detector.observe(&data, self.width, self.height, self.stride) {
            self.pending_changes += 1;
        }

        Ok(Some(RawFrame {
            data,
            width: self.width,
            height: self.height,
            stride: self.stride,
            timestamp_us,
        }))
    }

    pub(crate) fn pending_change_count(&self) -> i64 {
        self.pending_changes
    }

    pub(crate) fn acknowledge_frame(&mut self) {
        self.pending_changes = 0;
    }

    pub(crate) fn shutdown(&mut self) {
        let _ = self.pipeline.set_state(gst::State::Null);
        self.detector.reset();
    }
}

impl Drop for GstFrameSource {
    fn drop(&mut self) {
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}
