//! Wire codec, compression layer and handshake protocol for a Gnutella-style
//! servent.
//!
//! This crate is the leaf layer: it knows how to turn bytes on the wire into
//! framed [`Message`]s and back, how to negotiate and apply deflate
//! compression, and how to parse/render the textual 0.6 handshake. It has
//! no notion of sessions, queues or peer policy; `gnutella-session` builds
//! on top of it.

pub mod compression;
pub mod constants;
pub mod error;
pub mod handshake;
pub mod header;
pub mod time;

pub use error::{Error, Result};
pub use handshake::{Headers, Status};
pub use header::{Function, Header, Message, MessageId, SizeValidation};
pub use time::{Clock, ManualClock, SystemClock};
