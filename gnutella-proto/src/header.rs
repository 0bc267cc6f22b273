//! The fixed 23-byte Gnutella message header and the wire codec that
//! encodes/decodes it.

use crate::constants::{HEADER_SIZE, MAX_PAYLOAD_SIZE, MESSAGE_ID_SIZE, SFLAG_MARKER_BIT};
use crate::error::{Error, Result};

/// Function codes, numbered exactly as the deployed wire format requires
/// (retained for compatibility with existing peers, per spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Function {
    Ping = 0x00,
    Pong = 0x01,
    Bye = 0x02,
    Qrt = 0x30,
    Vendor = 0x31,
    StandardVendor = 0x32,
    Push = 0x40,
    Rudp = 0x41,
    Dht = 0x44,
    Query = 0x80,
    QueryHit = 0x81,
    Hsep = 0x99,
}

impl Function {
    pub fn from_byte(b: u8) -> Result<Self> {
        Ok(match b {
            0x00 => Function::Ping,
            0x01 => Function::Pong,
            0x02 => Function::Bye,
            0x30 => Function::Qrt,
            0x31 => Function::Vendor,
            0x32 => Function::StandardVendor,
            0x40 => Function::Push,
            0x41 => Function::Rudp,
            0x44 => Function::Dht,
            0x80 => Function::Query,
            0x81 => Function::QueryHit,
            0x99 => Function::Hsep,
            other => return Err(Error::UnknownFunction(other)),
        })
    }

    pub fn to_byte(self) -> u8 {
        self as u8
    }

    /// A message whose function makes it safe to evict under backpressure
    /// (spec §4.3: "queries and query-hits are [droppable]; pongs and pushes
    /// are not").
    pub fn is_droppable(self) -> bool {
        matches!(self, Function::Query | Function::QueryHit)
    }

    /// ping/pong/bye/vendor/qrt/hsep must carry hops=0, ttl<=1 (spec §4.6 step 2).
    pub fn requires_hop_zero_ttl_one(self) -> bool {
        matches!(
            self,
            Function::Ping
                | Function::Pong
                | Function::Bye
                | Function::Vendor
                | Function::StandardVendor
                | Function::Qrt
                | Function::Hsep
        )
    }

    /// Dispatched directly without routing-table consultation (spec §4.6 step 3).
    pub fn dispatches_without_routing(self) -> bool {
        matches!(
            self,
            Function::Ping
                | Function::Pong
                | Function::Bye
                | Function::Vendor
                | Function::StandardVendor
                | Function::Qrt
                | Function::Hsep
                | Function::Rudp
                | Function::Dht
        )
    }
}

pub type MessageId = [u8; MESSAGE_ID_SIZE];

/// The 23-byte fixed header, decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub message_id: MessageId,
    pub function: Function,
    pub ttl: u8,
    pub hops: u8,
    /// Payload size in bytes. Under sflag framing this is the 16-bit size
    /// subfield; otherwise the full 32-bit field.
    pub size: u32,
    /// Present only when sflag framing was used to decode this header.
    pub flags: Option<u16>,
}

/// Outcome of validating a header's size field against the negotiated framing
/// mode and the payload ceiling (spec §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeValidation {
    Valid,
    ValidWithFlags(u16),
    Invalid,
}

impl Header {
    /// Decode a 23-byte header. `sflag_negotiated` reflects whether both
    /// peers advertised `sflag` support during the handshake (spec §4.1: "a
    /// session accepts the flag interpretation only if the peer advertised
    /// `sflag` support").
    pub fn decode(bytes: &[u8], sflag_negotiated: bool) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(Error::HeaderTooShort { got: bytes.len() });
        }
        let mut message_id = [0u8; MESSAGE_ID_SIZE];
        message_id.copy_from_slice(&bytes[0..MESSAGE_ID_SIZE]);
        let function = Function::from_byte(bytes[16])?;
        let ttl = bytes[17];
        let hops = bytes[18];
        let size_bytes = [bytes[19], bytes[20], bytes[21], bytes[22]];

        let (size, flags) = if sflag_negotiated && (size_bytes[3] & SFLAG_MARKER_BIT) != 0 {
            let size = u16::from_le_bytes([size_bytes[0], size_bytes[1]]) as u32;
            let flags = u16::from_le_bytes([size_bytes[2], size_bytes[3] & !SFLAG_MARKER_BIT]);
            (size, Some(flags))
        } else {
            (u32::from_le_bytes(size_bytes), None)
        };

        Ok(Header {
            message_id,
            function,
            ttl,
            hops,
            size,
            flags,
        })
    }

    /// Encode this header back to 23 bytes. If `flags` is `Some`, the sflag
    /// marker bit is set and the size field is written as 16-bit size +
    /// 16-bit flags.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..MESSAGE_ID_SIZE].copy_from_slice(&self.message_id);
        out[16] = self.function.to_byte();
        out[17] = self.ttl;
        out[18] = self.hops;
        match self.flags {
            Some(flags) => {
                let size = self.size as u16;
                out[19..21].copy_from_slice(&size.to_le_bytes());
                let flag_bytes = flags.to_le_bytes();
                out[21] = flag_bytes[0];
                out[22] = flag_bytes[1] | SFLAG_MARKER_BIT;
            }
            None => {
                out[19..23].copy_from_slice(&self.size.to_le_bytes());
            }
        }
        out
    }

    /// Validate the size field per spec §4.1: sizes over 64 KiB are
    /// `Invalid`; otherwise distinguish plain vs sflag-marked framing.
    pub fn validate_size(&self) -> SizeValidation {
        if self.size as usize > MAX_PAYLOAD_SIZE {
            return SizeValidation::Invalid;
        }
        match self.flags {
            Some(flags) => SizeValidation::ValidWithFlags(flags),
            None => SizeValidation::Valid,
        }
    }
}

/// A fully framed message: header plus payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub header: Header,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn encode(&self, sflag_negotiated: bool) -> Result<Vec<u8>> {
        if self.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(Error::PayloadTooLarge {
                size: self.payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }
        if matches!(self.header.function, Function::Bye)
            && self.payload.len() > crate::constants::MAX_BYE_PAYLOAD_SIZE
        {
            return Err(Error::ByePayloadTooLarge {
                size: self.payload.len(),
                max: crate::constants::MAX_BYE_PAYLOAD_SIZE,
            });
        }
        let mut header = self.header;
        header.size = self.payload.len() as u32;
        if !sflag_negotiated {
            header.flags = None;
        }
        let mut out = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        out.extend_from_slice(&header.encode());
        out.extend_from_slice(&self.payload);
        Ok(out)
    }

    /// Decode a header plus its trailing payload from `bytes`. Returns the
    /// message and the number of bytes consumed, so callers can slice a
    /// streaming read buffer.
    pub fn decode(bytes: &[u8], sflag_negotiated: bool) -> Result<(Self, usize)> {
        let header = Header::decode(bytes, sflag_negotiated)?;
        if !matches!(header.validate_size(), SizeValidation::Invalid) {
            let size = header.size as usize;
            let total = HEADER_SIZE + size;
            if bytes.len() < total {
                return Err(Error::HeaderTooShort { got: bytes.len() });
            }
            let payload = bytes[HEADER_SIZE..total].to_vec();
            Ok((Message { header, payload }, total))
        } else {
            Err(Error::PayloadTooLarge {
                size: header.size as usize,
                max: MAX_PAYLOAD_SIZE,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mid(b: u8) -> MessageId {
        [b; MESSAGE_ID_SIZE]
    }

    #[test]
    fn round_trip_plain_framing() {
        let msg = Message {
            header: Header {
                message_id: mid(7),
                function: Function::Query,
                ttl: 4,
                hops: 0,
                size: 0,
                flags: None,
            },
            payload: b"hello world".to_vec(),
        };
        let encoded = msg.encode(false).unwrap();
        let (decoded, consumed) = Message::decode(&encoded, false).unwrap();
        assert_eq!(consumed, encoded.len());
        assert_eq!(decoded, msg);
    }

    #[test]
    fn round_trip_sflag_framing_preserves_flags() {
        let msg = Message {
            header: Header {
                message_id: mid(1),
                function: Function::Ping,
                ttl: 1,
                hops: 0,
                size: 0,
                flags: Some(0x00AB),
            },
            payload: vec![1, 2, 3, 4],
        };
        let encoded = msg.encode(true).unwrap();
        let (decoded, _) = Message::decode(&encoded, true).unwrap();
        assert_eq!(decoded.header.flags, Some(0x00AB));
        assert_eq!(decoded.payload, msg.payload);
    }

    #[test]
    fn oversized_payload_rejected() {
        let msg = Message {
            header: Header {
                message_id: mid(2),
                function: Function::Query,
                ttl: 1,
                hops: 0,
                size: 0,
                flags: None,
            },
            payload: vec![0u8; MAX_PAYLOAD_SIZE + 1],
        };
        assert!(matches!(msg.encode(false), Err(Error::PayloadTooLarge { .. })));
    }

    #[test]
    fn bye_payload_over_4kib_rejected() {
        let msg = Message {
            header: Header {
                message_id: mid(3),
                function: Function::Bye,
                ttl: 1,
                hops: 0,
                size: 0,
                flags: None,
            },
            payload: vec![0u8; crate::constants::MAX_BYE_PAYLOAD_SIZE + 1],
        };
        assert!(matches!(
            msg.encode(false),
            Err(Error::ByePayloadTooLarge { .. })
        ));
    }

    #[test]
    fn unknown_function_byte_rejected() {
        let mut raw = [0u8; HEADER_SIZE];
        raw[16] = 0xEE;
        assert!(matches!(
            Header::decode(&raw, false),
            Err(Error::UnknownFunction(0xEE))
        ));
    }

    #[test]
    fn droppable_classification_matches_spec() {
        assert!(Function::Query.is_droppable());
        assert!(Function::QueryHit.is_droppable());
        assert!(!Function::Push.is_droppable());
        assert!(!Function::Pong.is_droppable());
        assert!(!Function::Bye.is_droppable());
    }
}
