//! Codes carried in a Bye message's payload (spec §3 "Bye-packet payload",
//! §7's error-to-bye mapping). Distinct from the handshake's HTTP-style
//! status line in `gnutella_proto::handshake::Status`.

/// A Gnutella Bye-packet code plus its human-readable reason, rendered as
/// `code` (16-bit LE) followed by the reason text (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByeCode {
    Shutdown,
    EvictedWorstPeer,
    Unauthorized,
    Refused,
    PingTimeout,
    NoActivity,
    HopsTtlViolation,
    QueueFull,
}

impl ByeCode {
    pub fn code(self) -> u16 {
        match self {
            ByeCode::Shutdown => 200,
            ByeCode::EvictedWorstPeer => 202,
            ByeCode::Unauthorized => 401,
            ByeCode::Refused => 403,
            ByeCode::PingTimeout => 405,
            ByeCode::NoActivity => 406,
            ByeCode::HopsTtlViolation => 414,
            ByeCode::QueueFull => 502,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            ByeCode::Shutdown => "shutdown",
            ByeCode::EvictedWorstPeer => "evicted",
            ByeCode::Unauthorized => "unauthorized",
            ByeCode::Refused => "refused",
            ByeCode::PingTimeout => "ping timeout",
            ByeCode::NoActivity => "no activity",
            ByeCode::HopsTtlViolation => "hops/ttl violation",
            ByeCode::QueueFull => "queue full",
        }
    }

    /// Encode as a Bye message payload: 16-bit little-endian code, then the
    /// reason text (spec §3).
    pub fn payload(self) -> Vec<u8> {
        let mut out = self.code().to_le_bytes().to_vec();
        out.extend_from_slice(self.reason().as_bytes());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_starts_with_little_endian_code() {
        let p = ByeCode::HopsTtlViolation.payload();
        assert_eq!(u16::from_le_bytes([p[0], p[1]]), 414);
        assert_eq!(&p[2..], b"hops/ttl violation");
    }
}
