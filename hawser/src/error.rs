//! The error surface of the client.
//!
//! Four families: timeouts, network failures, protocol violations (split
//! by which side broke the rules), and proxy/configuration failures.
//! Predicates on [`Error`] drive pool policy — only connect-phase network
//! failures are ever retried.

use hawser_h2::FrameLayerError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Timed out waiting for a pool slot.
    #[error("pool timeout")]
    PoolTimeout,

    /// Timed out establishing TCP or completing the TLS handshake.
    #[error("connect timeout")]
    ConnectTimeout,

    /// An individual read exceeded its deadline.
    #[error("read timeout")]
    ReadTimeout,

    /// An individual write exceeded its deadline.
    #[error("write timeout")]
    WriteTimeout,

    /// TCP connect or TLS handshake failed.
    #[error("connect error: {0}")]
    Connect(String),

    /// A read on an established stream failed.
    #[error("read error: {0}")]
    Read(String),

    /// A write on an established stream failed.
    #[error("write error: {0}")]
    Write(String),

    /// We attempted something the protocol does not allow.
    #[error("local protocol violation: {0}")]
    LocalProtocol(String),

    /// The peer sent something the protocol does not allow.
    #[error("remote protocol violation: {0}")]
    RemoteProtocol(String),

    /// Any failure in the proxy negotiation layer.
    #[error("proxy error: {0}")]
    Proxy(String),

    /// A scheme other than http/https, or a capability that was not
    /// enabled (e.g. an h2 request on an http1-only pool).
    #[error("unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    /// The pool (or connection) was closed before or during the request.
    #[error("the pool is closed")]
    PoolClosed,

    /// The selected connection cannot take this request; the pool reacts
    /// by scheduling the ticket onto another connection.
    #[error("connection not available")]
    ConnectionNotAvailable,
}

impl Error {
    /// Any of the four timeout variants.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Error::PoolTimeout | Error::ConnectTimeout | Error::ReadTimeout | Error::WriteTimeout
        )
    }

    /// Establishment failures that the pool's retry budget applies to.
    /// Mid-request failures are never retried.
    pub fn is_retriable_connect(&self) -> bool {
        matches!(self, Error::Connect(_) | Error::ConnectTimeout)
    }

    /// A server that closed a kept-alive connection just as we reused it.
    /// Detected before any request bytes were written, this is recovered
    /// transparently with a fresh connection.
    pub(crate) fn is_idle_close(&self) -> bool {
        matches!(self, Error::RemoteProtocol(msg) if msg == crate::http11::IDLE_CLOSE_MSG)
    }
}

impl From<FrameLayerError> for Error {
    fn from(e: FrameLayerError) -> Self {
        match e {
            // These arise from our own misuse of the framing layer.
            FrameLayerError::StreamIdsExhausted => Error::LocalProtocol(e.to_string()),
            other => Error::RemoteProtocol(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_predicate() {
        assert!(Error::PoolTimeout.is_timeout());
        assert!(Error::ReadTimeout.is_timeout());
        assert!(!Error::Connect("refused".into()).is_timeout());
    }

    #[test]
    fn retry_predicate_only_covers_establishment() {
        assert!(Error::Connect("refused".into()).is_retriable_connect());
        assert!(Error::ConnectTimeout.is_retriable_connect());
        assert!(!Error::Read("reset".into()).is_retriable_connect());
        assert!(!Error::ReadTimeout.is_retriable_connect());
    }
}
