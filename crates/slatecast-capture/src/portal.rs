//! Wayland screen capture through the desktop portal.
//!
//! The xdg-desktop-portal ScreenCast interface hands us a PipeWire file
//! descriptor and stream node; the frames themselves flow through a
//! `pipewiresrc` pipeline. The portal request usually pops up a
//! compositor dialog, so opening this backend can take as long as the
//! user takes to click it.

use std::os::fd::{AsRawFd, RawFd};
use std::time::Duration;

use ashpd::desktop::screencast::{CursorMode, Screencast, SourceType};
use ashpd::desktop::PersistMode;
use tracing::{debug, info};

use slatecast_core::{Error, RawFrame, Result};

use crate::source::GstFrameSource;
use crate::VideoCapture;

pub struct PortalCapture {
    source: GstFrameSource,
}

impl PortalCapture {
    /// Run the portal handshake and start the PipeWire pipeline.
    pub async fn open(fps: u32) -> Result<Self> {
        let (raw_fd, node_id) = portal_session().await?;
        debug!("portal screencast ready: fd={raw_fd} node={node_id}");

        let description = format!(
            "pipewiresrc fd={raw_fd} path={node_id} do-timestamp=true \
             ! video/x-raw,framerate={fps}/1 \
             ! videoconvert \
             ! video/x-raw,format=BGRx \
             ! appsink name=sink max-buffers=2 drop=true sync=false"
        );
        let source = GstFrameSource::open(&description)?;
        let (width, height) = source.dimensions();
        info!("portal capture: {width}x{height} @ {fps} fps (node {node_id})");

        Ok(Self { source })
    }
}

/// Create a screencast session for one monitor and return the PipeWire
/// remote fd plus the stream node id.
async fn portal_session() -> Result<(RawFd, u32)> {
    let portal_err = |e: ashpd::Error| Error::capture(format!("screencast portal: {e}"));

    let proxy = Screencast::new().await.map_err(portal_err)?;
    let session = proxy.create_session().await.map_err(portal_err)?;

    proxy
        .select_sources(
            &session,
            CursorMode::Embedded,
            SourceType::Monitor.into(),
            false,
            None,
            PersistMode::DoNot,
        )
        .await
        .map_err(portal_err)?;

    let streams = proxy
        .start(&session, None)
        .await
        .map_err(portal_err)?
        .response()
        .map_err(portal_err)?;

    let stream = streams
        .streams()
        .first()
        .ok_or_else(|| Error::capture("portal returned no screencast streams"))?;
    let node_id = stream.pipe_wire_node_id();

    let fd = proxy.open_pipe_wire_remote(&session).await.map_err(portal_err)?;
    let raw_fd = fd.as_raw_fd();
    // The fd must outlive the portal call; pipewiresrc adopts it.
    std::mem::forget(fd);
    Ok((raw_fd, node_id))
}

impl VideoCapture for PortalCapture {
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
        "portal"
    }
}
