//! Length-prefixed frame transport over TCP.
//!
//! A frame is `msg_len : u64 LE | metadata : u64 (opaque) | payload`. The
//! reactor side ([`tcp::TcpConnector`]) is non-blocking, `mio`-driven, and
//! accumulates partial reads/writes across poll cycles; it never blocks a
//! thread on a single connection. [`frame::Metadata`] carries the
//! negotiation/data-type tags defined by the layer above (`dataserv-core`);
//! this crate never inspects payload bytes nor the meaning of a tag.

pub mod error;
pub mod frame;
pub mod tcp;

pub use error::TransportError;
pub use frame::{HEADER_LEN, Metadata};
