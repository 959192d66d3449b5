//! The blocking surface.
//!
//! A mirror of the async crate root for plain-thread callers: the same
//! pool scheduling, connection lifecycle, protocol engines and proxy
//! behaviour, with condition variables and blocking sockets in place of
//! tasks and notifications. The sans-IO protocol cores are shared.

pub mod backend;
pub mod body;
pub mod connection;
pub mod http11;
pub mod http2;
pub mod mock;
pub mod pool;
pub mod proxy;
pub mod socks;

use bytes::Bytes;

use crate::model::{header_value, Headers, HttpVersion, RequestOptions, Url};

pub use backend::{NetworkBackend, NetworkStream, StdBackend};
pub use body::{Body, ResponseBody};
pub use pool::{ConnectionInfo, ConnectionPool, PoolConfig};
pub use proxy::{HttpProxy, HttpProxyConfig};
pub use socks::{SocksProxy, SocksProxyConfig};

/// An HTTP request for the blocking surface.
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

/// An HTTP response with a lazily streamed body.
pub struct Response {
    pub status: u16,
    pub headers: Headers,
    pub body: ResponseBody,
    pub version: HttpVersion,
    /// HTTP/1.x only.
    pub reason_phrase: Option<Bytes>,
    /// HTTP/2 only.
    pub stream_id: Option<u32>,
    /// The raw stream, present only for 101 upgrades and 2xx CONNECT
    /// responses.
    pub network_stream: Option<Box<dyn NetworkStream>>,
}

impl Response {
    pub(crate) fn new(
        status: u16,
        headers: Headers,
        body: ResponseBody,
        version: HttpVersion,
    ) -> Self {
        Self {
            status,
            headers,
            body,
            version,
            reason_phrase: None,
            stream_id: None,
            network_stream: None,
        }
    }

    /// First value of `name`, case-insensitive.
    pub fn header(&self, name: &[u8]) -> Option<&Bytes> {
        header_value(&self.headers, name)
    }
}

impl std::fmt::Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Response({}, {})",
            self.status,
            String::from_utf8_lossy(self.version.as_bytes())
        )
    }
}
