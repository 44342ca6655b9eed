use thiserror::Error;

/// Client-side failures (§10.2), surfaced either as a `Result` from
/// `start()`/`push`/`pop`, or via the pending-exception slot for errors
/// raised asynchronously in the background worker and only observable on
/// the next API call.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("failed to connect to the data server")]
    ConnectFailure,

    #[error("client was not started")]
    NotStarted,

    #[error("client was already stopped")]
    AlreadyStopped,

    #[error("disconnected from the data server")]
    Disconnected,

    #[error("timed out waiting for new data")]
    Timeout,

    #[error("failed to encode or decode a payload: {0}")]
    Encoding(String),
}
