use thiserror::Error;

/// Errors raised by the wire codec, compression layer and handshake parser.
///
/// Mirrors the taxonomy a session-level `Error` wraps: these are all `Protocol`-
/// or `Transport`-kind failures from the codec's point of view; the session
/// layer (`gnutella_session`) is the one that assigns a `Kind` and a bye code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("header too short: got {got} bytes, need {HEADER_SIZE}", HEADER_SIZE = crate::constants::HEADER_SIZE)]
    HeaderTooShort { got: usize },

    #[error("payload size {size} exceeds the {max} byte ceiling")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("bye payload {size} exceeds the {max} byte ceiling")]
    ByePayloadTooLarge { size: usize, max: usize },

    #[error("unknown function code 0x{0:02x}")]
    UnknownFunction(u8),

    #[error("sflag framing used but peer did not negotiate sflag support")]
    SflagNotNegotiated,

    #[error("malformed handshake status line: {0}")]
    BadStatusLine(String),

    #[error("malformed handshake header: {0}")]
    BadHeader(String),

    #[error("handshake headers exceeded {0} bytes without a terminating blank line")]
    HeadersTooLong(usize),

    #[error("deflate/inflate stream error: {0}")]
    Compression(String),
}

pub type Result<T> = std::result::Result<T, Error>;
