//! Session controller and frame scheduler.
//!
//! One client at a time:
//!
//! ```text
//! Idle ──► Listening ──► Negotiating ──► Streaming ──► Disconnecting ─┐
//!            ▲                                                        │
//!            └────────────────────────────────────────────────────────┘
//! ```
//!
//! The streaming loop is a soft-real-time driver: each tick polls the
//! control channel once, drains pending input events, then runs
//! capture → encode → send when the frame deadline is reached. Overruns
//! drop frames rather than burning through the backlog, and the sleep
//! ladder trades CPU for timing accuracy as the deadline approaches.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use slatecast_capture::{create_capture, AudioCapture, AudioCaptureConfig, VideoCapture};
use slatecast_core::protocol::SessionProfile;
use slatecast_core::{Error, InputEvent, Result, ServerConfig};
use slatecast_transport::control::build_tls_acceptor;
use slatecast_transport::{
    AudioSender, ControlEvent, ControlServer, ControlSession, InputReceiver, InputReceiverHandle,
    VideoSender,
};

use crate::adaptive::AdaptiveFps;
use crate::audio::{spawn_audio_pipeline, OpusAudioEncoder};
use crate::coords::{CoordTransform, FitMode};
use crate::encoder::VideoEncoder;
use crate::input_inject::InputSink;

/// Quiet window before the adaptive controller drops to the idle rate.
const RAMP_DOWN: Duration = Duration::from_millis(1000);
/// Consecutive encode failures tolerated before the session dies.
const MAX_ENCODE_ERRORS: u32 = 30;

// ── SessionState ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    Listening,
    Negotiating,
    Streaming,
    Disconnecting,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "Idle",
            Self::Listening => "Listening",
            Self::Negotiating => "Negotiating",
            Self::Streaming => "Streaming",
            Self::Disconnecting => "Disconnecting",
        };
        f.write_str(name)
    }
}

// ── Server ────────────────────────────────────────────────────────────────────

pub struct Server {
    config: ServerConfig,
    capture: Box<dyn VideoCapture>,
    encoder: VideoEncoder,
    control: ControlServer,
    video: VideoSender,
    audio: Option<AudioSender>,
    input_events: mpsc::Receiver<InputEvent>,
    input_handle: InputReceiverHandle,
    sink: Option<InputSink>,
    running: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
    state: SessionState,
    frame_count: u32,
}

impl Server {
    /// Bring up capture, encoder, sockets and virtual input devices.
    /// Everything here is fatal except the input sink, which degrades
    /// to streaming-only.
    pub async fn init(
        config: ServerConfig,
        running: Arc<AtomicBool>,
        shutdown: Arc<Notify>,
    ) -> Result<Self> {
        let capture =
            create_capture(config.capture_backend, &config.display, config.capture_fps).await?;
        let (width, height) = capture.dimensions();

        let encoder = VideoEncoder::probe(&config.encoder_config(width, height))?;

        let acceptor =
            match build_tls_acceptor(&config.cert_file, &config.key_file, config.ca_file.as_deref())
            {
                Ok(acceptor) => Some(acceptor),
                Err(e) => {
                    warn!("TLS unavailable ({e}), control channel falls back to plain TCP");
                    None
                }
            };
        let control = ControlServer::bind(config.control_port, acceptor).await?;
        let video = VideoSender::bind(config.video_port()).await?;
        let audio = if config.audio_enabled {
            Some(AudioSender::bind(config.audio_port(), config.audio_sample_rate).await?)
        } else {
            None
        };

        let receiver = InputReceiver::bind(config.input_port()).await?;
        let (input_events, input_handle) = receiver.start();

        let sink = match InputSink::new(width, height) {
            Ok(sink) => Some(sink),
            Err(e) => {
                warn!("input injection disabled: {e}");
                None
            }
        };

        info!(
            "server initialized: {width}x{height} @ {} fps, codec {}",
            config.capture_fps,
            encoder.actual_codec()
        );

        Ok(Self {
            config,
            capture,
            encoder,
            control,
            video,
            audio,
            input_events,
            input_handle,
            sink,
            running,
            shutdown,
            state: SessionState::Idle,
            frame_count: 0,
        })
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            debug!("session state: {} -> {}", self.state, state);
            self.state = state;
        }
    }

    /// Accept clients until a shutdown is requested. A client dropping
    /// out returns the server to listening; only fatal errors escape.
    pub async fn run(&mut self) -> Result<()> {
        while self.running.load(Ordering::SeqCst) {
            self.set_state(SessionState::Listening);
            info!("waiting for client connection...");

            let pending = tokio::select! {
                accepted = self.control.accept() => accepted,
                _ = self.shutdown.notified() => break,
            };
            let pending = match pending {
                Ok(pending) => pending,
                Err(Error::Protocol { reason }) => {
                    warn!("client rejected: {reason}");
                    continue;
                }
                Err(Error::PeerGone) => {
                    debug!("client vanished during handshake");
                    continue;
                }
                Err(Error::Transport(e)) => {
                    warn!("accept failed: {e}");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
                Err(e) => return Err(e),
            };

            self.set_state(SessionState::Negotiating);
            let request = pending.request;
            let peer = pending.peer;

            let (width, height) = self.capture.dimensions();
            let profile = SessionProfile {
                server_width: width as u16,
                server_height: height as u16,
                video_port: self.config.video_port(),
                input_port: self.config.input_port(),
                audio_port: if self.audio.is_some() { self.config.audio_port() } else { 0 },
                audio_sample_rate: self.config.audio_sample_rate as u16,
                audio_channels: self.config.audio_channels,
                audio_frame_ms: self.config.audio_frame_ms,
                codec_type: self.encoder.actual_codec().wire_id(),
            };

            let mut session = match pending.send_profile(&profile).await {
                Ok(session) => session,
                Err(e) => {
                    warn!("handshake with {peer} failed: {e}");
                    continue;
                }
            };

            // Bind the media endpoints to the address learned from TCP
            // plus the ports the client advertised.
            self.video
                .set_client(SocketAddr::new(peer.ip(), request.video_port), self.config.pacing);
            if let Some(audio) = &self.audio {
                audio.set_client(SocketAddr::new(peer.ip(), self.config.audio_port()));
            }

            let transform = CoordTransform::new(
                width,
                height,
                request.client_width as u32,
                request.client_height as u32,
                FitMode::Letterbox,
                false,
            );
            debug!("tablet visible area: {:?}", transform.visible_area());

            let audio_session = self.start_audio();

            self.frame_count = 0;
            self.encoder.request_keyframe();
            self.set_state(SessionState::Streaming);
            info!("client {peer} connected, streaming");

            let outcome = self.stream_loop(&mut session, &transform).await;

            self.set_state(SessionState::Disconnecting);
            if let Some(sink) = &mut self.sink {
                sink.reset();
            }
            self.input_handle.reset();
            self.video.clear_client();
            if let Some(audio) = &self.audio {
                audio.clear_client();
            }
            if let Some((capture, task)) = audio_session {
                capture.stop();
                let _ = task.await;
            }
            session.close();
            // Events that raced the teardown belong to the dead session.
            while self.input_events.try_recv().is_ok() {}
            self.set_state(SessionState::Idle);

            match outcome {
                Ok(()) => {}
                Err(Error::PeerGone) => info!("client disconnected, waiting for new connection..."),
                Err(e @ Error::Fatal { .. }) => {
                    self.teardown();
                    return Err(e);
                }
                Err(e) => warn!("session ended: {e}"),
            }
        }

        self.teardown();
        info!("server stopped");
        Ok(())
    }

    /// Per-session audio plumbing: capture thread → Opus task → UDP.
    /// Any failure just disables audio for this session.
    fn start_audio(&self) -> Option<(AudioCapture, JoinHandle<()>)> {
        let sender = self.audio.clone()?;

        let encoder = match OpusAudioEncoder::new(
            self.config.audio_sample_rate,
            self.config.audio_channels,
            self.config.audio_bitrate_bps,
            self.config.audio_frame_ms,
            self.config.audio_inband_fec,
        ) {
            Ok(encoder) => encoder,
            Err(e) => {
                warn!("audio disabled for this session: {e}");
                return None;
            }
        };

        let (blocks_tx, blocks_rx) = mpsc::channel(128);
        let capture = match AudioCapture::start(
            AudioCaptureConfig {
                sample_rate: self.config.audio_sample_rate,
                channels: self.config.audio_channels,
                device: self.config.audio_device.clone(),
            },
            blocks_tx,
        ) {
            Ok(capture) => capture,
            Err(e) => {
                warn!("audio disabled for this session: {e}");
                return None;
            }
        };

        Some((capture, spawn_audio_pipeline(encoder, blocks_rx, sender)))
    }

    /// The soft-real-time driver loop. Returns `Err(PeerGone)` when the
    /// client goes away, `Ok(())` on requested shutdown.
    async fn stream_loop(
        &mut self,
        session: &mut ControlSession,
        transform: &CoordTransform,
    ) -> Result<()> {
        let max_fps = self.config.capture_fps;
        let min_fps = (max_fps / 6).max(1);
        let mut adaptive = AdaptiveFps::new(min_fps, max_fps, RAMP_DOWN);
        let mut interval = Duration::from_micros(self.config.frame_interval_us());
        let mut next = Instant::now();
        let mut encode_errors = 0u32;

        while self.running.load(Ordering::SeqCst) {
            // One control poll per tick.
            match session.poll_event() {
                Some(ControlEvent::KeyframeRequest) => {
                    info!("keyframe requested by client");
                    self.encoder.request_keyframe();
                }
                Some(ControlEvent::Disconnected) => return Err(Error::PeerGone),
                None => {}
            }

            // Drain all pending input events.
            while let Ok(event) = self.input_events.try_recv() {
                if let Some(sink) = &mut self.sink {
                    if let Err(e) = sink.handle_event(&event, transform) {
                        debug!("input inject: {e}");
                    }
                }
            }

            let now = Instant::now();
            if now >= next {
                // Feed the adaptive controller one observation per tick.
                let pending = self.capture.pending_change_count();
                if pending >= 0 {
                    let update = adaptive.observe(pending > 0, std::time::Instant::now());
                    self.capture.acknowledge_frame();
                    if update.request_keyframe {
                        debug!("ramping back to {} fps, forcing keyframe", update.fps);
                        self.encoder.request_keyframe();
                    }
                    interval = adaptive.interval();
                }

                self.tick(&mut encode_errors, interval).await?;

                next += interval;
                if next < now {
                    // Behind schedule: drop, don't burn.
                    next = now + interval;
                }
            }

            // Sleep ladder: coarse half-sleeps far out, a short nap when
            // close, busy-yield for the last stretch.
            let now = Instant::now();
            if next > now {
                let remaining = next - now;
                let coarse = if adaptive.current_fps() > 90 {
                    Duration::from_millis(2)
                } else {
                    Duration::from_millis(1)
                };
                if remaining > coarse {
                    tokio::time::sleep(remaining / 2).await;
                } else if remaining > Duration::from_micros(100) {
                    tokio::time::sleep(Duration::from_micros(50)).await;
                } else {
                    tokio::task::yield_now().await;
                }
            }
        }

        Ok(())
    }

    /// One frame: capture → encode → fragment-and-send.
    async fn tick(&mut self, encode_errors: &mut u32, interval: Duration) -> Result<()> {
        let deadline = (interval / 4).min(Duration::from_millis(5));
        let frame = match self.capture.capture_frame(deadline) {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(()),
            Err(e) => {
                warn!("capture: {e}");
                return Ok(());
            }
        };

        let encoded = match self.encoder.encode(&frame) {
            Ok(Some(encoded)) => {
                *encode_errors = 0;
                encoded
            }
            Ok(None) => return Ok(()),
            Err(e) => {
                *encode_errors += 1;
                warn!("encode: {e} ({} consecutive)", *encode_errors);
                if *encode_errors >= MAX_ENCODE_ERRORS {
                    return Err(Error::Fatal {
                        reason: format!("encoder failed {MAX_ENCODE_ERRORS} frames in a row"),
                    });
                }
                return Ok(());
            }
        };

        match self.video.send_frame(&encoded, self.frame_count).await {
            Ok(fragments) => {
                if self.frame_count % 60 == 0 || encoded.is_keyframe {
                    debug!(
                        "frame {}: {} bytes, {} fragments, keyframe={}",
                        self.frame_count,
                        encoded.data.len(),
                        fragments,
                        encoded.is_keyframe
                    );
                }
            }
            // UDP is best-effort; the client recovers at a keyframe.
            Err(e) => warn!("video send: {e}"),
        }
        self.frame_count = self.frame_count.wrapping_add(1);

        Ok(())
    }

    fn teardown(&mut self) {
        if let Some(sink) = &mut self.sink {
            sink.reset();
        }
        self.input_handle.reset();
        self.input_handle.shutdown();
        self.encoder.shutdown();
        self.capture.shutdown();
    }
}
