//! slatecast-transport — network plumbing for the SlateCast server.
//!
//! ```text
//! SlateCast Server                         Tablet Client
//! ─────────────────────────────            ─────────────────────────────
//! VideoSender   ── UDP:ctl+1 ─────────►    frame reassembler
//! AudioSender   ── UDP:ctl+3 ─────────►    audio jitter buffer
//! ControlServer ◄─ TCP/TLS:ctl ───────►    session control
//! InputReceiver ◄─ TCP:ctl+2 ──────────    stylus / touch events
//! ```
//!
//! All four endpoints serve exactly one client at a time; the session
//! controller binds them to the address learned from the control-channel
//! handshake and resets them when the peer goes away.

pub mod audio_sender;
pub mod control;
pub mod input_receiver;
pub mod video_sender;

pub use audio_sender::AudioSender;
pub use control::{ControlEvent, ControlServer, ControlSession, PendingSession};
pub use input_receiver::{InputReceiver, InputReceiverHandle};
pub use video_sender::VideoSender;
