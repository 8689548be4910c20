//! SlateCast server binary.
//!
//! Captures a Linux desktop, hardware-encodes it and streams video and
//! audio over UDP to a single tablet client while injecting the
//! client's stylus / touch input through virtual devices. A TLS control
//! channel negotiates the session.

mod adaptive;
mod audio;
mod coords;
mod encoder;
mod input_inject;
mod nv12;
mod server;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, ValueEnum};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Notify;
use tracing::info;
use tracing_subscriber::EnvFilter;

use slatecast_core::config::{CaptureBackendKind, CodecPreference, PacingMode, RateControl};
use slatecast_core::ServerConfig;

use crate::server::Server;

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum CaptureArg {
    Auto,
    X11,
    Pipewire,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum CodecArg {
    Auto,
    Av1,
    Hevc,
    H264,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum QualityArg {
    /// Adaptive CQP: sharp text and smooth motion.
    Auto,
    /// CBR tuned for minimal delay.
    Low,
    /// CBR with balanced quality and latency.
    Balanced,
    /// CQP tuned for maximum quality.
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum PacingArg {
    Auto,
    None,
    Light,
    Aggressive,
    Keyframe,
}

#[derive(Parser, Debug)]
#[command(
    name = "slatecast-server",
    version,
    about = "Stream a Linux desktop to a tablet and inject its stylus/touch input"
)]
struct Cli {
    /// X11 display to capture.
    #[arg(short, long, default_value = ":0")]
    display: String,

    /// Screen capture backend.
    #[arg(short, long, value_enum, default_value_t = CaptureArg::Auto)]
    capture: CaptureArg,

    /// Video codec (auto tries AV1, then HEVC, then H.264).
    #[arg(short = 'e', long = "encoder", value_enum, default_value_t = CodecArg::Auto)]
    codec: CodecArg,

    /// Capture frame rate, clamped to 1..=120.
    #[arg(short, long, default_value_t = 60)]
    fps: u32,

    /// Video bitrate in bits/s (derived from fps and quality when omitted).
    #[arg(short, long)]
    bitrate: Option<u64>,

    /// GOP size / keyframe interval in frames (default fps/2).
    #[arg(short, long)]
    gop: Option<u32>,

    /// Quality mode.
    #[arg(short, long, value_enum, default_value_t = QualityArg::Auto)]
    quality: QualityArg,

    /// CQP quantiser for auto/high quality, clamped to 1..=51.
    #[arg(short = 'Q', long, default_value_t = 24)]
    cqp: u8,

    /// Fragment pacing mode (auto picks from the client address).
    #[arg(short = 'P', long, value_enum, default_value_t = PacingArg::Auto)]
    pacing: PacingArg,

    /// Control port; video, input and audio use port+1, +2 and +3.
    #[arg(short, long, default_value_t = 9500)]
    port: u16,

    /// Disable audio streaming.
    #[arg(short = 'A', long)]
    no_audio: bool,

    /// Opus bitrate in bits/s.
    #[arg(short = 'a', long, default_value_t = 128_000)]
    audio_bitrate: u32,

    /// Enable Opus in-band forward error correction.
    #[arg(long)]
    fec: bool,

    /// Audio capture device (substring of a monitor source name).
    #[arg(long)]
    audio_device: Option<String>,

    /// TLS certificate (PEM). Missing files fall back to plain TCP.
    #[arg(long, default_value = "server.crt")]
    cert: String,

    /// TLS private key (PEM).
    #[arg(long, default_value = "server.key")]
    key: String,

    /// CA bundle (PEM); enables client-certificate verification.
    #[arg(long)]
    ca: Option<String>,

    /// Increase log verbosity (-v info, -vv debug).
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

impl Cli {
    fn into_config(self) -> ServerConfig {
        ServerConfig {
            display: self.display,
            capture_backend: match self.capture {
                CaptureArg::Auto => CaptureBackendKind::Auto,
                CaptureArg::X11 => CaptureBackendKind::X11,
                CaptureArg::Pipewire => CaptureBackendKind::Portal,
            },
            capture_fps: self.fps.clamp(1, 120),
            bitrate_bps: self.bitrate,
            gop_size: self.gop,
            rate_control: match self.quality {
                QualityArg::Auto => RateControl::AdaptiveCqp,
                QualityArg::Low => RateControl::CbrLowLatency,
                QualityArg::Balanced => RateControl::CbrBalanced,
                QualityArg::High => RateControl::CqpHighQuality,
            },
            cqp: self.cqp.clamp(1, 51),
            codec: match self.codec {
                CodecArg::Auto => CodecPreference::Auto,
                CodecArg::Av1 => CodecPreference::Av1,
                CodecArg::Hevc => CodecPreference::Hevc,
                CodecArg::H264 => CodecPreference::H264,
            },
            control_port: self.port,
            pacing: match self.pacing {
                PacingArg::Auto => PacingMode::Auto,
                PacingArg::None => PacingMode::None,
                PacingArg::Light => PacingMode::Light,
                PacingArg::Aggressive => PacingMode::Aggressive,
                PacingArg::Keyframe => PacingMode::Keyframe,
            },
            audio_enabled: !self.no_audio,
            audio_bitrate_bps: self.audio_bitrate,
            audio_inband_fec: self.fec,
            audio_device: self.audio_device,
            cert_file: self.cert,
            key_file: self.key,
            ca_file: self.ca,
            ..ServerConfig::default()
        }
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = cli.into_config().finalize()?;
    banner(&config);

    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    runtime.block_on(run(config))
}

async fn run(config: ServerConfig) -> Result<()> {
    let running = Arc::new(AtomicBool::new(true));
    let shutdown = Arc::new(Notify::new());

    let mut interrupt = signal(SignalKind::interrupt()).context("SIGINT handler")?;
    let mut terminate = signal(SignalKind::terminate()).context("SIGTERM handler")?;
    {
        let running = Arc::clone(&running);
        let shutdown = Arc::clone(&shutdown);
        tokio::spawn(async move {
            let mut signals_seen = 0u32;
            loop {
                tokio::select! {
                    _ = interrupt.recv() => {}
                    _ = terminate.recv() => {}
                }
                signals_seen += 1;
                if signals_seen == 1 {
                    info!("signal received, shutting down...");
                    running.store(false, Ordering::SeqCst);
                    shutdown.notify_waiters();
                } else {
                    info!("second signal, forcing exit");
                    // The kernel releases the uinput devices with our fds.
                    std::process::exit(0);
                }
            }
        });
    }

    let mut server = Server::init(config, running, shutdown)
        .await
        .context("initialization failed")?;
    server.run().await.context("server failed")?;
    Ok(())
}

fn init_logging(verbosity: u8) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(match verbosity {
            0 => "warn",
            1 => "info",
            _ => "debug",
        })
    });
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

/// Startup summary, printed regardless of verbosity.
fn banner(config: &ServerConfig) {
    println!("SlateCast Server v{}", env!("CARGO_PKG_VERSION"));

    let codec = match config.codec {
        CodecPreference::Auto => "auto",
        CodecPreference::Av1 => "AV1",
        CodecPreference::Hevc => "HEVC",
        CodecPreference::H264 => "H.264",
    };
    let quality = match config.rate_control {
        RateControl::AdaptiveCqp => "auto",
        RateControl::CbrLowLatency => "low",
        RateControl::CbrBalanced => "balanced",
        RateControl::CqpHighQuality => "high",
    };
    print!("Codec: {codec} | Quality: {quality}");
    if config.rate_control.is_cqp() {
        print!(" (CQP: {})", config.cqp);
    }
    print!(" | {} FPS | Port: {}", config.capture_fps, config.control_port);
    if config.audio_enabled {
        println!(" | Audio: {}kbps", config.audio_bitrate_bps / 1000);
    } else {
        println!(" | Audio: off");
    }
    println!("Waiting for connection... (use -v for detailed logs)");
}
