//! X11 screen capture via `ximagesrc`.
//!
//! Works on native X11 sessions and on Xwayland. The source honours the
//! negotiated framerate caps, so frames arrive no faster than the
//! configured capture rate.

use std::time::Duration;

use tracing::info;

use slatecast_core::{RawFrame, Result};

use crate::source::GstFrameSource;
use crate::VideoCapture;

pub struct X11Capture {
    source: GstFrameSource,
}

impl X11Capture {
    /// Open the display named by `display` (e.g. `":0"`).
    pub fn open(display: &str, fps: u32) -> Result<Self> {
        let description = format!(
            "ximagesrc display-name={display} use-damage=false \
             ! video/x-raw,framerate={fps}/1 \
             ! videoconvert \
             ! video/x-raw,format=BGRx \
             ! appsink name=sink max-buffers=2 drop=true sync=false"
        );
        let source = GstFrameSource::open(&description)?;
        let (width, height) = source.dimensions();
        info!("X11 capture on {display}: {width}x{height} @ {fps} fps");
        Ok(Self { source })
    }
}

impl VideoCapture for X11Capture {
    fn dimensions(&self) -> (u32, u32) {
        self.source.dimensions()
    }

    fn capture_frame(&mut self, deadline: Duration) -> Result<Option<RawFrame>> {
        self.source.capture_frame(deadline)
    }

    fn pending_change_count(&mut self) -> i64 {
        self.source.pending_change_count()
    }

    fn acknowledge_frame(&mut self) {
        self.source.acknowledge_frame();
    }

    fn shutdown(&mut self) {
        self.source.shutdown();
    }

    fn name(&self) -> &'static str {
        "x11"
    }
}
