//! The textual, CRLF-delimited 0.6 handshake protocol (spec §6).

use std::collections::BTreeMap;

use crate::constants::{
    GNUTELLA_CONNECT_LINE, GNUTELLA_REPLY_PREFIX, MAX_HANDSHAKE_HEADERS_SIZE,
};
use crate::error::{Error, Result};

/// Handshake status codes (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Status {
    Ok = 200,
    MakingRoom = 202,
    PeermodeChange = 203,
    Shielded = 204,
    Unauthorized = 401,
    Refused = 403,
    NotAcceptable = 406,
    MonopolyOrReserved = 409,
    HeaderTooLong = 413,
    Busy = 503,
    UnsupportedVersion = 505,
    Banned = 550,
}

impl Status {
    pub fn code(self) -> u16 {
        self as u16
    }

    pub fn reason(self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::MakingRoom => "Making room",
            Status::PeermodeChange => "Peermode change",
            Status::Shielded => "Shielded",
            Status::Unauthorized => "Unauthorized",
            Status::Refused => "Refused",
            Status::NotAcceptable => "Not acceptable",
            Status::MonopolyOrReserved => "Monopoly or reserved slot",
            Status::HeaderTooLong => "Header too long",
            Status::Busy => "Busy",
            Status::UnsupportedVersion => "Unsupported version",
            Status::Banned => "Banned",
        }
    }
}

/// A parsed set of handshake headers, case-sensitive keys exactly as sent
/// (deployed servents are inconsistent about case; callers that need
/// case-insensitive lookup should normalize before inserting).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(pub BTreeMap<String, String>);

impl Headers {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn wants_deflate(&self) -> bool {
        self.get("Accept-Encoding")
            .map(|v| v.split(',').any(|tok| tok.trim() == "deflate"))
            .unwrap_or(false)
    }

    pub fn uses_deflate(&self) -> bool {
        self.get("Content-Encoding")
            .map(|v| v.split(',').any(|tok| tok.trim() == "deflate"))
            .unwrap_or(false)
    }

    pub fn is_ultrapeer(&self) -> bool {
        self.get("X-Ultrapeer")
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    }
}

/// Render headers as the CRLF-delimited block (without the greeting/status
/// line), terminated by the blank line.
pub fn render_headers(headers: &Headers) -> String {
    let mut out = String::new();
    for (k, v) in &headers.0 {
        out.push_str(k);
        out.push_str(": ");
        out.push_str(v);
        out.push_str("\r\n");
    }
    out.push_str("\r\n");
    out
}

/// Render the first handshake leg: `GNUTELLA CONNECT/0.6\r\n<headers>\r\n`.
pub fn render_connect(headers: &Headers) -> String {
    format!("{GNUTELLA_CONNECT_LINE}\r\n{}", render_headers(headers))
}

/// Render a status reply leg: `GNUTELLA/0.6 <code> <reason>\r\n<headers>\r\n`.
pub fn render_reply(status: Status, headers: &Headers) -> String {
    format!(
        "{GNUTELLA_REPLY_PREFIX} {} {}\r\n{}",
        status.code(),
        status.reason(),
        render_headers(headers)
    )
}

/// Parse a full handshake leg (greeting-or-status line, headers, blank
/// line). Returns the parsed status code (`None` for the `GNUTELLA
/// CONNECT/0.6` greeting line) and the headers.
pub fn parse_leg(text: &str) -> Result<(Option<u16>, Headers)> {
    if text.len() > MAX_HANDSHAKE_HEADERS_SIZE {
        return Err(Error::HeadersTooLong(MAX_HANDSHAKE_HEADERS_SIZE));
    }
    let mut lines = text.split("\r\n");
    let first = lines
        .next()
        .ok_or_else(|| Error::BadStatusLine("empty handshake leg".into()))?;

    let status = if first == GNUTELLA_CONNECT_LINE {
        None
    } else if let Some(rest) = first.strip_prefix(GNUTELLA_REPLY_PREFIX) {
        let rest = rest.trim_start();
        let code_str = rest.split_whitespace().next().ok_or_else(|| {
            Error::BadStatusLine(format!("missing status code in {first:?}"))
        })?;
        let code = code_str
            .parse::<u16>()
            .map_err(|_| Error::BadStatusLine(format!("non-numeric status code in {first:?}")))?;
        Some(code)
    } else {
        return Err(Error::BadStatusLine(first.to_string()));
    };

    let mut headers = Headers::default();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let (key, value) = line
            .split_once(':')
            .ok_or_else(|| Error::BadHeader(line.to_string()))?;
        headers.set(key.trim(), value.trim());
    }
    Ok((status, headers))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s1_handshake_accept_compressed() {
        // spec §8 S1 fixture.
        let text = "GNUTELLA CONNECT/0.6\r\n\
                     User-Agent: test/1.0\r\n\
                     X-Ultrapeer: True\r\n\
                     Accept-Encoding: deflate\r\n\
                     Listen-IP: 1.2.3.4:6346\r\n\r\n";
        let (status, headers) = parse_leg(text).unwrap();
        assert_eq!(status, None);
        assert!(headers.is_ultrapeer());
        assert!(headers.wants_deflate());

        let mut reply_headers = Headers::default();
        reply_headers.set("X-Ultrapeer", "True");
        reply_headers.set("Content-Encoding", "deflate");
        let reply = render_reply(Status::Ok, &reply_headers);
        assert!(reply.starts_with("GNUTELLA/0.6 200 OK\r\n"));
        assert!(reply.contains("Content-Encoding: deflate"));
    }

    #[test]
    fn unknown_greeting_line_is_bad_status_line() {
        assert!(matches!(
            parse_leg("NOT A GREETING\r\n\r\n"),
            Err(Error::BadStatusLine(_))
        ));
    }

    #[test]
    fn malformed_header_line_rejected() {
        let text = "GNUTELLA CONNECT/0.6\r\nNotAHeaderLine\r\n\r\n";
        assert!(matches!(parse_leg(text), Err(Error::BadHeader(_))));
    }

    #[test]
    fn oversized_headers_rejected() {
        let long_value = "x".repeat(MAX_HANDSHAKE_HEADERS_SIZE + 1);
        let text = format!("GNUTELLA CONNECT/0.6\r\nUser-Agent: {long_value}\r\n\r\n");
        assert!(matches!(
            parse_leg(&text),
            Err(Error::HeadersTooLong(_))
        ));
    }
}
