use thiserror::Error;

/// The taxonomy from spec §7 / §9's redesign note: a typed `Error` sum
/// replacing the original variadic char-buffer error formatting, with an
/// optional detail string carried per-variant instead of formatted ad hoc
/// at the call site.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Kind {
    /// Bad header, bad size, unknown function, malformed handshake header,
    /// bad status line.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Admission refused: slots, vendor ban, monopoly, reserved, peermode
    /// mismatch.
    #[error("refused: {0}")]
    Refused(String),

    /// MQ full of non-droppable traffic.
    #[error("overflow: {0}")]
    Overflow(String),

    /// No alive-ping reply, sustained flow-control, activity timeout.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Write error, read error, EOF without bye, compression stream error.
    #[error("transport error: {0}")]
    Transport(String),

    /// Invariant violation. The original servent aborted the process; a
    /// library cannot do that to its embedder, so this kind tears down only
    /// the offending session (see SPEC_FULL.md §2).
    #[error("internal invariant violation: {0}")]
    Internal(String),
}

/// Session-level error: a [`Kind`] plus, for protocol/transport failures
/// that originated in the wire codec, the underlying codec error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}")]
pub struct Error {
    pub kind: Kind,
    #[source]
    pub source: Option<gnutella_proto::Error>,
}

impl Error {
    pub fn new(kind: Kind) -> Self {
        Self { kind, source: None }
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::new(Kind::Protocol(msg.into()))
    }

    pub fn refused(msg: impl Into<String>) -> Self {
        Self::new(Kind::Refused(msg.into()))
    }

    pub fn overflow(msg: impl Into<String>) -> Self {
        Self::new(Kind::Overflow(msg.into()))
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::new(Kind::Timeout(msg.into()))
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::new(Kind::Transport(msg.into()))
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(Kind::Internal(msg.into()))
    }
}

impl From<gnutella_proto::Error> for Error {
    fn from(e: gnutella_proto::Error) -> Self {
        Self {
            kind: Kind::Protocol(e.to_string()),
            source: Some(e),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
