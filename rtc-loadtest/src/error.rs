use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    // tester lifecycle
    #[error("join failed after {attempts} attempts: {reason}")]
    ErrJoinRetryExhausted { attempts: u32, reason: String },
    #[error("publish failed: {0}")]
    ErrPublishFailed(String),
    #[error("subscription failed: {0}")]
    ErrSubscriptionFailed(String),
    #[error("rtp read terminated: {0}")]
    ErrRtpReadTerminated(String),
    #[error("cancellation requested")]
    ErrCancelled,
    #[error("tester is not running")]
    ErrTesterNotRunning,

    // configuration
    #[error("invalid configuration: {0}")]
    ErrInvalidConfig(String),

    // media source library
    #[error("unsupported codec: {0}")]
    ErrUnsupportedCodec(String),
    #[error("resource not found: {0}")]
    ErrNotFound(String),
    #[error("data is not a H264 bitstream")]
    ErrDataIsNotH264Stream,
    #[error("data is not a H265 bitstream")]
    ErrDataIsNotH265Stream,
    #[error("IVF signature mismatch")]
    ErrIvfSignatureMismatch,
    #[error("IVF version unknown, parser may not parse correctly")]
    ErrIvfUnknownVersion,
    #[error("incomplete IVF frame")]
    ErrIvfIncompleteFrame,
    #[error("bad header signature")]
    ErrOggBadIdPageSignature,
    #[error("wrong header, expected beginning of stream")]
    ErrOggBadIdPageType,
    #[error("payload for id page must be 19 bytes")]
    ErrOggBadIdPageLength,
    #[error("expected and actual checksum do not match")]
    ErrOggChecksumMismatch,
    #[error("packet is not large enough")]
    ErrShortPacket,

    // sfu client
    #[error("room is closed")]
    ErrRoomClosed,
    #[error("track not found: {0}")]
    ErrTrackNotFound(String),
    #[error("participant not found: {0}")]
    ErrParticipantNotFound(String),
    #[error("invalid access token: {0}")]
    ErrInvalidToken(String),

    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("rtp: {0}")]
    Rtp(#[from] webrtc::rtp::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether the error ends a media read loop rather than a single packet.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Error::ErrRtpReadTerminated(_) | Error::ErrRoomClosed | Error::ErrCancelled
        )
    }
}
