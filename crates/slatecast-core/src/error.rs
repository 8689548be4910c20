use thiserror::Error;

/// Error taxonomy shared by every SlateCast crate.
///
/// Transport failures wrap the underlying `std::io::Error`; the remaining
/// variants carry a human-readable reason. `PeerGone` is the only variant
/// the session controller treats as routine (it returns the server to the
/// listening state instead of propagating).
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid configuration: {reason}")]
    Config { reason: String },

    #[error("resource unavailable: {reason}")]
    ResourceUnavailable { reason: String },

    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("protocol violation: {reason}")]
    Protocol { reason: String },

    #[error("capture error: {reason}")]
    Capture { reason: String },

    #[error("encode error: {reason}")]
    Encode { reason: String },

    #[error("decode error: {reason}")]
    Decode { reason: String },

    #[error("peer disconnected")]
    PeerGone,

    #[error("fatal: {reason}")]
    Fatal { reason: String },
}

impl Error {
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config { reason: reason.into() }
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::ResourceUnavailable { reason: reason.into() }
    }

    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::Protocol { reason: reason.into() }
    }

    pub fn capture(reason: impl Into<String>) -> Self {
        Self::Capture { reason: reason.into() }
    }

    pub fn encode(reason: impl Into<String>) -> Self {
        Self::Encode { reason: reason.into() }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
