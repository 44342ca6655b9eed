//! Server-side core of the data server: negotiation, the dataset registry,
//! fan-out, per-sink diffing, and the reactor that ties them together.
//!
//! `dataserv-transport` owns framing; this crate owns what the bytes in a
//! frame *mean* - the negotiation handshake (§4.2), the bounded squash queue
//! (§4.3), the dataset registry (§4.4), and the source/sink pipes (§4.5,
//! §4.6) that move payloads from a source socket to every sink socket,
//! diffing against each sink's own baseline along the way.

pub mod dataset;
pub mod diff;
pub mod error;
pub mod proto;
pub mod queue;
pub mod registry;
pub mod server;

pub use dataset::Dataset;
pub use diff::DiffWorker;
pub use error::{DiffError, SessionError};
pub use proto::{DEFAULT_PORT, DataMode, NegotiationTag};
pub use registry::Registry;
pub use server::Server;
