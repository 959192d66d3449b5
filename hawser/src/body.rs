//! Request and response body streaming.
//!
//! Bodies are pull-based chunk streams: finite, not restartable. On the
//! request side [`Body`] covers the common in-memory shapes plus a
//! caller-supplied [`ChunkSource`]; on the response side [`ResponseBody`]
//! wraps the engine's reader and owns the connection-release hook — the
//! pooled connection stays busy until the body is drained or closed.

use std::collections::VecDeque;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Error;

/// A caller-supplied lazy request body.
#[async_trait]
pub trait ChunkSource: Send + Sync {
    /// The next chunk, or `None` at the end of the body.
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, Error>;

    /// Total length when known up front; drives `Content-Length` framing.
    fn len_hint(&self) -> Option<u64> {
        None
    }
}

/// A request body.
#[derive(Default)]
pub enum Body {
    /// No body.
    #[default]
    Empty,
    /// Complete body with a known length.
    Full(Bytes),
    /// A finite sequence of chunks with no declared total length;
    /// HTTP/1.1 frames these with chunked transfer encoding.
    Chunks(VecDeque<Bytes>),
    /// A lazy source pulled during the send.
    Source(Box<dyn ChunkSource>),
}

impl Body {
    pub fn is_empty(&self) -> bool {
        match self {
            Body::Empty => true,
            Body::Full(b) => b.is_empty(),
            Body::Chunks(c) => c.is_empty(),
            Body::Source(_) => false,
        }
    }

    /// Length for framing purposes, when known.
    pub fn known_len(&self) -> Option<u64> {
        match self {
            Body::Empty => Some(0),
            Body::Full(b) => Some(b.len() as u64),
            Body::Chunks(_) => None,
            Body::Source(s) => s.len_hint(),
        }
    }

    /// Whether the body can be sent again after a failed attempt.
    pub(crate) fn is_replayable(&self) -> bool {
        !matches!(self, Body::Source(_))
    }

    pub(crate) fn replay_copy(&self) -> Option<Body> {
        match self {
            Body::Empty => Some(Body::Empty),
            Body::Full(b) => Some(Body::Full(b.clone())),
            Body::Chunks(c) => Some(Body::Chunks(c.clone())),
            Body::Source(_) => None,
        }
    }

    /// Pull the next chunk, consuming the body as it goes.
    pub(crate) async fn next_chunk(&mut self) -> Result<Option<Bytes>, Error> {
        match self {
            Body::Empty => Ok(None),
            Body::Full(_) => {
                let Body::Full(bytes) = std::mem::take(self) else {
                    unreachable!()
                };
                Ok(Some(bytes))
            }
            Body::Chunks(chunks) => Ok(chunks.pop_front()),
            Body::Source(source) => source.next_chunk().await,
        }
    }
}

impl From<Bytes> for Body {
    fn from(b: Bytes) -> Self {
        if b.is_empty() {
            Body::Empty
        } else {
            Body::Full(b)
        }
    }
}

impl From<Vec<u8>> for Body {
    fn from(v: Vec<u8>) -> Self {
        Body::from(Bytes::from(v))
    }
}

impl From<&[u8]> for Body {
    fn from(s: &[u8]) -> Self {
        Body::from(Bytes::copy_from_slice(s))
    }
}

impl From<&str> for Body {
    fn from(s: &str) -> Self {
        Body::from(s.as_bytes())
    }
}

impl std::fmt::Debug for Body {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Body::Empty => f.write_str("Body::Empty"),
            Body::Full(b) => write!(f, "Body::Full({} bytes)", b.len()),
            Body::Chunks(c) => write!(f, "Body::Chunks({} chunks)", c.len()),
            Body::Source(_) => f.write_str("Body::Source"),
        }
    }
}

/// Engine-side response body reader.
#[async_trait]
pub(crate) trait ResponseBodySource: Send {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, Error>;

    /// Early termination: the body was closed before its natural end, so
    /// the connection must not be reused. Implementations also handle the
    /// dropped-without-close case in their own `Drop`.
    async fn abort(&mut self);
}

type ReleaseHook = Box<dyn FnOnce() + Send>;

/// The streaming body of a [`Response`](crate::response::Response).
///
/// The connection that produced the response is held busy until the body
/// reports its final chunk or is closed. Dropping the body without
/// closing it closes the connection defensively.
pub struct ResponseBody {
    source: Option<Box<dyn ResponseBodySource>>,
    release: Option<ReleaseHook>,
    finished: bool,
    closed: bool,
}

impl ResponseBody {
    /// A body with no content; completes immediately.
    pub(crate) fn empty() -> Self {
        Self {
            source: None,
            release: None,
            finished: true,
            closed: false,
        }
    }

    pub(crate) fn from_source(source: Box<dyn ResponseBodySource>) -> Self {
        Self {
            source: Some(source),
            release: None,
            finished: false,
            closed: false,
        }
    }

    /// Attach the pool's slot-release callback.
    pub(crate) fn on_release(&mut self, hook: ReleaseHook) {
        if self.finished {
            // Nothing will ever pull this body; release straight away.
            hook();
        } else {
            self.release = Some(hook);
        }
    }

    fn fire_release(&mut self) {
        if let Some(hook) = self.release.take() {
            hook();
        }
    }

    /// Pull the next chunk, or `None` once the body is complete.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>, Error> {
        if self.closed || self.finished {
            return Ok(None);
        }
        let Some(source) = self.source.as_mut() else {
            self.finished = true;
            return Ok(None);
        };
        match source.next_chunk().await {
            Ok(Some(chunk)) => Ok(Some(chunk)),
            Ok(None) => {
                self.finished = true;
                self.fire_release();
                Ok(None)
            }
            Err(e) => {
                self.closed = true;
                source.abort().await;
                self.fire_release();
                Err(e)
            }
        }
    }

    /// Release the body. Closing before the final chunk makes the
    /// connection non-reusable; closing twice is a no-op.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if !self.finished {
            if let Some(source) = self.source.as_mut() {
                source.abort().await;
            }
        }
        self.fire_release();
    }

    /// Drain the remaining chunks into one buffer and release the body.
    pub async fn read_to_end(&mut self) -> Result<Bytes, Error> {
        let mut out = Vec::new();
        while let Some(chunk) = self.next_chunk().await? {
            out.extend_from_slice(&chunk);
        }
        self.close().await;
        Ok(Bytes::from(out))
    }
}

impl Drop for ResponseBody {
    fn drop(&mut self) {
        // The engine reader's own Drop marks the connection closed when
        // the body was abandoned mid-stream.
        self.fire_release();
    }
}

impl std::fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseBody")
            .field("finished", &self.finished)
            .field("closed", &self.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_conversions() {
        assert!(Body::from("").is_empty());
        assert!(matches!(Body::from("x"), Body::Full(_)));
        assert_eq!(Body::from("hello").known_len(), Some(5));
        assert_eq!(
            Body::Chunks(VecDeque::from([Bytes::from_static(b"a")])).known_len(),
            None
        );
    }

    #[tokio::test]
    async fn full_body_yields_once() {
        let mut body = Body::from("payload");
        assert_eq!(body.next_chunk().await.unwrap().unwrap(), "payload");
        assert!(body.next_chunk().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn chunks_drain_in_order() {
        let mut body = Body::Chunks(VecDeque::from([
            Bytes::from_static(b"a"),
            Bytes::from_static(b"b"),
        ]));
        assert_eq!(body.next_chunk().await.unwrap().unwrap(), "a");
        assert_eq!(body.next_chunk().await.unwrap().unwrap(), "b");
        assert!(body.next_chunk().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn empty_response_body_releases_immediately() {
        let mut body = ResponseBody::empty();
        let released = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = released.clone();
        body.on_release(Box::new(move || {
            flag.store(true, std::sync::atomic::Ordering::SeqCst)
        }));
        assert!(released.load(std::sync::atomic::Ordering::SeqCst));
        assert!(body.next_chunk().await.unwrap().is_none());
        // Closing twice is fine.
        body.close().await;
        body.close().await;
    }
}
