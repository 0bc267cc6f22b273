//! Wire-format constants for the Gnutella 0.6 overlay protocol.

/// Size of the fixed message header: 16-byte message-id, function, TTL, hops, 4-byte size.
pub const HEADER_SIZE: usize = 23;

/// Size of a message-id (muid) in bytes.
pub const MESSAGE_ID_SIZE: usize = 16;

/// Architectural ceiling on any single message payload.
pub const MAX_PAYLOAD_SIZE: usize = 64 * 1024;

/// Maximum size of a bye-packet payload (16-bit code + text).
pub const MAX_BYE_PAYLOAD_SIZE: usize = 4 * 1024;

/// High bit of the first size byte (little-endian byte 3, i.e. the most significant
/// byte of the 32-bit size field) marks "flags follow" (sflag) framing: the size
/// field becomes 16-bit size + 16-bit flags instead of a plain 32-bit length.
pub const SFLAG_MARKER_BIT: u8 = 0x80;

/// UDP TTL-byte overlay bit: payload is deflated.
pub const UDP_TTL_DEFLATED_BIT: u8 = 0x01;
/// UDP TTL-byte overlay bit: sender can inflate a deflated reply.
pub const UDP_TTL_CAN_INFLATE_BIT: u8 = 0x02;

/// Per-stream compression buffer size (TX side).
pub const COMPRESS_BUFFER_SIZE: usize = 1024;
/// Periodic flush watermark for the TX compression stage.
pub const COMPRESS_FLUSH_WATERMARK: usize = 16 * 1024;

/// Handshake greeting/reply line prefix.
pub const GNUTELLA_CONNECT_LINE: &str = "GNUTELLA CONNECT/0.6";
pub const GNUTELLA_REPLY_PREFIX: &str = "GNUTELLA/0.6";

/// Maximum size of a single handshake header block (headers + blank line), used to
/// bound read buffers and trigger the 413 status.
pub const MAX_HANDSHAKE_HEADERS_SIZE: usize = 16 * 1024;
