//! The response type returned by pools and connections.

use bytes::Bytes;

use crate::backend::NetworkStream;
use crate::body::ResponseBody;
use crate::model::{header_value, Headers, HttpVersion};

/// An HTTP response with a lazily streamed body.
///
/// The metadata fields replace the dynamic extensions mapping of looser
/// clients: the negotiated version is always present, the reason phrase
/// only for HTTP/1.x, the stream id only for HTTP/2, and `network_stream`
/// only when an upgrade or CONNECT surrendered the raw connection.
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
    /// responses. The connection is no longer pooled once surrendered.
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
