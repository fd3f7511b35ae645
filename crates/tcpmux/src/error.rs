use thiserror::Error;

/// Errors that can propagate out of the public API.
///
/// Most failure modes in this crate are handled internally (a transient
/// accept error is logged and retried, a full buffer rejects the peer with
/// the apology banner). Only the variants below ever reach a caller.
#[derive(Debug, Error)]
pub enum Error {
    /// The platform refused to bind a listening socket on the requested port.
    #[error("failed to bind port {port}: {source}")]
    BindFailed {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    /// An internal invariant was violated: a lock was observed out of the
    /// documented order, a background task could not be joined, or a
    /// connection was observed to have more than one owner. This indicates a
    /// bug in the runtime itself rather than a misuse by the embedder.
    #[error("internal invariant violated: {0}")]
    InvariantViolation(String),
}

pub type Result<T> = std::result::Result<T, Error>;
