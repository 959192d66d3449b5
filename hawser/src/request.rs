//! The request type accepted by pools and connections.

use bytes::Bytes;

use crate::body::Body;
use crate::model::{Headers, RequestOptions, Url};

/// An HTTP request. Headers go on the wire in insertion order, case and
/// duplicates preserved; a `Host` header is synthesized from the URL when
/// absent.
pub struct Request {
    pub method: Bytes,
    pub url: Url,
    pub headers: Headers,
    pub body: Body,
    pub options: RequestOptions,
}

impl Request {
    pub fn new(method: impl Into<Bytes>, url: Url) -> Self {
        Self {
            method: method.into(),
            url,
            headers: Headers::new(),
            body: Body::Empty,
            options: RequestOptions::default(),
        }
    }

    pub fn header(mut self, name: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<Body>) -> Self {
        self.body = body.into();
        self
    }

    pub fn options(mut self, options: RequestOptions) -> Self {
        self.options = options;
        self
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Request({} {})",
            String::from_utf8_lossy(&self.method),
            String::from_utf8_lossy(&self.url.absolute_form()),
        )
    }
}
