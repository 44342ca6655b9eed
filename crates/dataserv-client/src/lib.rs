//! Client-side workers for the data server (§4.8): `DataSource` publishes
//! snapshots into a named dataset, `DataSink` subscribes to one. Both run a
//! dedicated background reactor thread of their own - built on the same
//! non-blocking `dataserv_transport::tcp::TcpConnector` the server uses,
//! configured for outbound auto-reconnect - and expose a synchronous
//! `push`/`pop` API to user code via a thread-safe squash queue.

mod encoding;
mod error;
mod queue;
mod sink;
mod source;
mod worker;

pub use encoding::{Encoder, JsonEncoder, MappingLike};
pub use error::ClientError;
pub use sink::DataSink;
pub use source::DataSource;
