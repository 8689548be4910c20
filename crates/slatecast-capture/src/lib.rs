//! slatecast-capture — screen and system-audio capture.
//!
//! # Video backends
//!
//! | Backend | Protocol | Selected when |
//! |---------|----------|---------------|
//! | [`X11Capture`] | `ximagesrc` (X11 / Xwayland) | `DISPLAY` set, no Wayland |
//! | [`PortalCapture`] | xdg-desktop-portal + PipeWire | `WAYLAND_DISPLAY` set |
//!
//! Both yield BGRA frames with monotonic microsecond timestamps and feed
//! a change detector that drives the server's adaptive frame rate.
//!
//! # Audio
//!
//! [`audio::AudioCapture`] runs a cpal input stream on its own thread
//! (point it at a PulseAudio/PipeWire monitor source to capture system
//! output) and copies interleaved f32 blocks into a bounded channel.

pub mod audio;
pub mod change;
pub mod portal;
pub mod x11;

mod source;

use std::time::Duration;

use tracing::info;

use slatecast_core::config::CaptureBackendKind;
use slatecast_core::{RawFrame, Result};

pub use audio::{AudioCapture, AudioCaptureConfig};
pub use portal::PortalCapture;
pub use x11::X11Capture;

// ── VideoCapture ──────────────────────────────────────────────────────────────

/// A running screen-capture source.
///
/// `capture_frame` returns `Ok(None)` when no frame arrived within the
/// deadline (the scheduler skips the tick). The change counter is the
/// number of captured frames since the last acknowledgement whose
/// content differed from their predecessor; `-1` would mean the backend
/// cannot tell, but both built-in backends support it.
pub trait VideoCapture: Send {
    /// Screen size in pixels, fixed for the lifetime of the source.
    fn dimensions(&self) -> (u32, u32);

    fn capture_frame(&mut self, deadline: Duration) -> Result<Option<RawFrame>>;

    fn pending_change_count(&mut self) -> i64;

    fn acknowledge_frame(&mut self);

    fn shutdown(&mut self);

    fn name(&self) -> &'static str;
}

// ── Backend selection ─────────────────────────────────────────────────────────

/// Resolve AUTO to a concrete backend from the session environment:
/// a Wayland session uses the portal, anything else X11.
pub fn resolve_backend(kind: CaptureBackendKind) -> CaptureBackendKind {
    match kind {
        CaptureBackendKind::Auto => {
            if std::env::var_os("WAYLAND_DISPLAY").is_some() {
                CaptureBackendKind::Portal
            } else {
                CaptureBackendKind::X11
            }
        }
        other => other,
    }
}

/// Open the configured capture backend.
pub async fn create_capture(
    kind: CaptureBackendKind,
    display: &str,
    fps: u32,
) -> Result<Box<dyn VideoCapture>> {
    let resolved = resolve_backend(kind);
    info!("capture backend: {resolved:?}");
    match resolved {
        CaptureBackendKind::X11 => Ok(Box::new(X11Capture::open(display, fps)?)),
        CaptureBackendKind::Portal => Ok(Box::new(PortalCapture::open(fps).await?)),
        CaptureBackendKind::Auto => unreachable!("resolve_backend returns a concrete kind"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_backends_pass_through() {
        assert_eq!(resolve_backend(CaptureBackendKind::X11), CaptureBackendKind::X11);
        assert_eq!(resolve_backend(CaptureBackendKind::Portal), CaptureBackendKind::Portal);
    }
}
