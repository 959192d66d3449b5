//! Request and response body streaming for the blocking surface.
//!
//! The same pull-based model as the async surface, with a plain iterator
//! as the lazy request-body source.

use std::collections::VecDeque;

use bytes::Bytes;

use crate::error::Error;

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
    Iter(Box<dyn Iterator<Item = Result<Bytes, Error>> + Send>),
}

impl Body {
    pub fn is_empty(&self) -> bool {
        match self {
            Body::Empty => true,
            Body::Full(b) => b.is_empty(),
            Body::Chunks(c) => c.is_empty(),
            Body::Iter(_) => false,
        }
    }

    pub fn known_len(&self) -> Option<u64> {
        match self {
            Body::Empty => Some(0),
            Body::Full(b) => Some(b.len() as u64),
            Body::Chunks(_) | Body::Iter(_) => None,
        }
    }

    pub(crate) fn is_replayable(&self) -> bool {
        !matches!(self, Body::Iter(_))
    }

    pub(crate) fn replay_copy(&self) -> Option<Body> {
        match self {
            Body::Empty => Some(Body::Empty),
            Body::Full(b) => Some(Body::Full(b.clone())),
            Body::Chunks(c) => Some(Body::Chunks(c.clone())),
            Body::Iter(_) => None,
        }
    }

    pub(crate) fn next_chunk(&mut self) -> Result<Option<Bytes>, Error> {
        match self {
            Body::Empty => Ok(None),
            Body::Full(_) => {
                let Body::Full(bytes) = std::mem::take(self) else {
                    unreachable!()
                };
                Ok(Some(bytes))
            }
            Body::Chunks(chunks) => Ok(chunks.pop_front()),
            Body::Iter(iter) => iter.next().transpose(),
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
            Body::Iter(_) => f.write_str("Body::Iter"),
        }
    }
}

/// Engine-side response body reader.
pub(crate) trait ResponseBodySource: Send {
    fn next_chunk(&mut self) -> Result<Option<Bytes>, Error>;

    /// Early termination: the body was closed before its natural end, so
    /// the connection must not be reused.
    fn abort(&mut self);
}

type ReleaseHook = Box<dyn FnOnce() + Send>;

/// The streaming body of a blocking [`Response`](super::Response).
pub struct ResponseBody {
    source: Option<Box<dyn ResponseBodySource>>,
    release: Option<ReleaseHook>,
    finished: bool,
    closed: bool,
}

impl ResponseBody {
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

    pub(crate) fn on_release(&mut self, hook: ReleaseHook) {
        if self.finished {
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
    pub fn next_chunk(&mut self) -> Result<Option<Bytes>, Error> {
        if self.closed || self.finished {
            return Ok(None);
        }
        let Some(source) = self.source.as_mut() else {
            self.finished = true;
            return Ok(None);
        };
        match source.next_chunk() {
            Ok(Some(chunk)) => Ok(Some(chunk)),
            Ok(None) => {
                self.finished = true;
                self.fire_release();
                Ok(None)
            }
            Err(e) => {
                self.closed = true;
                source.abort();
                self.fire_release();
                Err(e)
            }
        }
    }

    /// Release the body. Closing before the final chunk makes the
    /// connection non-reusable; closing twice is a no-op.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if !self.finished {
            if let Some(source) = self.source.as_mut() {
                source.abort();
            }
        }
        self.fire_release();
    }

    /// Drain the remaining chunks into one buffer and release the body.
    pub fn read_to_end(&mut self) -> Result<Bytes, Error> {
        let mut out = Vec::new();
        while let Some(chunk) = self.next_chunk()? {
            out.extend_from_slice(&chunk);
        }
        self.close();
        Ok(Bytes::from(out))
    }
}

impl Drop for ResponseBody {
    fn drop(&mut self) {
        if !self.closed && !self.finished {
            if let Some(source) = self.source.as_mut() {
                source.abort();
            }
        }
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
