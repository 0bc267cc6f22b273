//! Optional deflate-on-TX, inflate-on-RX layer negotiated during the
//! handshake (spec §4.2), plus the UDP-side single-shot inflate used when
//! the TTL byte's `deflated` bit is set.

use std::io::{self, Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::constants::{COMPRESS_BUFFER_SIZE, COMPRESS_FLUSH_WATERMARK, MAX_PAYLOAD_SIZE};
use crate::error::{Error, Result};

/// Wraps an underlying TCP link writer with a deflate stage. Buffers up to
/// `COMPRESS_BUFFER_SIZE` bytes and flushes once more than
/// `COMPRESS_FLUSH_WATERMARK` bytes have accumulated since the last flush,
/// matching the periodic-flush behaviour spec §4.2 describes.
pub struct DeflateWriter<W: Write> {
    encoder: ZlibEncoder<W>,
    since_flush: usize,
}

impl<W: Write> DeflateWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            encoder: ZlibEncoder::new(inner, Compression::default()),
            since_flush: 0,
        }
    }

    pub fn write_frame(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.encoder.write_all(bytes)?;
        self.since_flush += bytes.len();
        if self.since_flush >= COMPRESS_FLUSH_WATERMARK {
            self.encoder.flush()?;
            self.since_flush = 0;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.encoder.flush()?;
        self.since_flush = 0;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.encoder.finish().expect("flush before drop")
    }
}

/// Symmetric inflate stage above a TCP link reader.
pub struct InflateReader<R: Read> {
    decoder: ZlibDecoder<R>,
}

impl<R: Read> InflateReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            decoder: ZlibDecoder::new(inner),
        }
    }

    /// Read exactly `buf.len()` inflated bytes, or a `Compression` error if
    /// the stream is malformed. Per spec §4.2, on TCP an inflate error is
    /// not the caller's to ignore: it must escalate to a bye with a
    /// compression error code, which is the session layer's job; this just
    /// surfaces the error.
    pub fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        self.decoder
            .read_exact(buf)
            .map_err(|e| Error::Compression(e.to_string()))
    }
}

/// One-shot inflate of a UDP payload into a buffer sized to the maximum
/// Gnutella payload (spec §4.2: "inflates into a pre-allocated buffer sized
/// to the maximum Gnutella payload (64 KiB)"). Malformed streams return an
/// error; per spec the caller drops the datagram, not the session.
pub fn inflate_udp_payload(deflated: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(deflated);
    let mut out = Vec::with_capacity(COMPRESS_BUFFER_SIZE);
    let mut limited = (&mut decoder).take(MAX_PAYLOAD_SIZE as u64 + 1);
    limited
        .read_to_end(&mut out)
        .map_err(|e| Error::Compression(e.to_string()))?;
    if out.len() > MAX_PAYLOAD_SIZE {
        return Err(Error::Compression(
            "inflated UDP payload exceeds 64 KiB ceiling".into(),
        ));
    }
    Ok(out)
}

/// One-shot deflate of a UDP payload (used for the symmetric send side).
pub fn deflate_udp_payload(plain: &[u8]) -> Vec<u8> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(plain)
        .expect("writing to an in-memory encoder cannot fail");
    encoder.finish().expect("finishing an in-memory encoder cannot fail")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn udp_round_trip() {
        let original = b"a search query payload".to_vec();
        let deflated = deflate_udp_payload(&original);
        let inflated = inflate_udp_payload(&deflated).unwrap();
        assert_eq!(inflated, original);
    }

    #[test]
    fn malformed_udp_stream_is_rejected_not_panicking() {
        let garbage = vec![0xffu8; 64];
        assert!(inflate_udp_payload(&garbage).is_err());
    }

    #[test]
    fn tcp_writer_reader_round_trip() {
        let mut buf = Vec::new();
        {
            let mut w = DeflateWriter::new(&mut buf);
            w.write_frame(b"first frame").unwrap();
            w.write_frame(b"second frame").unwrap();
            w.flush().unwrap();
        }
        let mut r = InflateReader::new(&buf[..]);
        let mut out = vec![0u8; b"first framesecond frame".len()];
        r.read_exact(&mut out).unwrap();
        assert_eq!(&out, b"first framesecond frame");
    }
}
