pub mod config;
pub mod error;
pub mod input;
pub mod protocol;
pub mod types;

pub use config::{
    CaptureBackendKind, CodecPreference, EncoderConfig, PacingMode, RateControl, ServerConfig,
};
pub use error::{Error, Result};
pub use input::{InputEvent, InputEventType};
pub use protocol::{
    AudioPacketHeader, ConfigRequest, ControlMessageType, SessionProfile, VideoPacketHeader,
};
pub use types::{AudioBlock, CodecKind, EncodedAudio, EncodedFrame, RawFrame};
