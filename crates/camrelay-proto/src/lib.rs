use thiserror::Error;

pub mod frame;
pub mod message;

pub use frame::{BinaryFrame, DepthBlock, decode_binary_frame, encode_binary_frame};
pub use message::{
    FrameFanout, FrameJob, FrameUpload, Hello, Inbound, LinkStatus, Outbound,
    ProcessedFrame, ServoControl, ServoState, StatusBody, decode_text,
};

/// Reason strings carried in close frames. Codes: 1001 for
/// `SHUTTING_DOWN`, 1011 for `INTERNAL_ERROR`, 1008 for the rest.
pub mod close {
    pub const SHUTTING_DOWN: &str = "Server shutting down";
    pub const DUPLICATE_PRODUCER: &str = "Another Pi is already connected";
    pub const DUPLICATE_WORKER: &str = "Another WSL processor is already connected";
    pub const UNSUPPORTED_ENDPOINT: &str = "Unsupported endpoint";
    pub const RATE_LIMITED: &str = "Rate limit exceeded";
    pub const INTERNAL_ERROR: &str = "Internal server error";
}

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("binary frame too short: {0} bytes")]
    FrameTooShort(usize),
    #[error("binary frame truncated at {0}")]
    FrameTruncated(&'static str),
    #[error("message decode error: {0}")]
    Decode(String),
    #[error("message encode error: {0}")]
    Encode(String),
}
