//! Shared request/response data model.
//!
//! Headers are ordered `(Bytes, Bytes)` pairs: case is preserved,
//! duplicates are allowed, and insertion order is what goes on the wire.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::error::Error;
use crate::trace::TraceHook;

/// URL scheme understood by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_bytes(&self) -> &'static [u8] {
        match self {
            Scheme::Http => b"http",
            Scheme::Https => b"https",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }

    pub fn parse(raw: &[u8]) -> Result<Self, Error> {
        match raw {
            b"http" => Ok(Scheme::Http),
            b"https" => Ok(Scheme::Https),
            other => Err(Error::UnsupportedProtocol(format!(
                "scheme {:?} is not supported",
                String::from_utf8_lossy(other)
            ))),
        }
    }
}

impl std::fmt::Display for Scheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        })
    }
}

/// The connection pooling key: scheme, host and resolved port.
///
/// Host comparison is case-insensitive ASCII; two origins are equal iff
/// all three components match.
#[derive(Debug, Clone)]
pub struct Origin {
    pub scheme: Scheme,
    pub host: Bytes,
    pub port: u16,
}

impl Origin {
    pub fn new(scheme: Scheme, host: impl Into<Bytes>, port: u16) -> Self {
        Self {
            scheme,
            host: host.into(),
            port,
        }
    }

    /// `host` or `host:port`, omitting the scheme-default port.
    pub fn authority(&self) -> Vec<u8> {
        let mut out = self.host.to_vec();
        if self.port != self.scheme.default_port() {
            out.extend_from_slice(format!(":{}", self.port).as_bytes());
        }
        out
    }
}

impl PartialEq for Origin {
    fn eq(&self, other: &Self) -> bool {
        self.scheme == other.scheme
            && self.port == other.port
            && self.host.eq_ignore_ascii_case(&other.host)
    }
}

impl Eq for Origin {}

impl std::fmt::Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}://{}:{}",
            self.scheme,
            String::from_utf8_lossy(&self.host),
            self.port
        )
    }
}

/// A request URL, decomposed: scheme, host, optional port, and the raw
/// request-target (path plus optional query).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Url {
    pub scheme: Scheme,
    pub host: Bytes,
    pub port: Option<u16>,
    pub target: Bytes,
}

impl Url {
    pub fn new(scheme: Scheme, host: impl Into<Bytes>, port: Option<u16>, target: impl Into<Bytes>) -> Self {
        Self {
            scheme,
            host: host.into(),
            port,
            target: target.into(),
        }
    }

    pub fn port_or_default(&self) -> u16 {
        self.port.unwrap_or_else(|| self.scheme.default_port())
    }

    pub fn origin(&self) -> Origin {
        Origin::new(self.scheme, self.host.clone(), self.port_or_default())
    }

    /// `host` or `host:port`, omitting the scheme-default port.
    pub fn authority(&self) -> Vec<u8> {
        self.origin().authority()
    }

    /// Absolute-form for forward-proxy request lines:
    /// `scheme://host[:port]{target}`.
    pub fn absolute_form(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.host.len() + self.target.len() + 16);
        out.extend_from_slice(self.scheme.as_bytes());
        out.extend_from_slice(b"://");
        out.extend_from_slice(&self.authority());
        out.extend_from_slice(&self.target);
        out
    }
}

/// Per-phase deadlines. `None` means wait indefinitely.
#[derive(Debug, Clone, Copy, Default)]
pub struct Timeouts {
    /// TCP connect plus TLS handshake.
    pub connect: Option<Duration>,
    /// Each individual read.
    pub read: Option<Duration>,
    /// Each individual write.
    pub write: Option<Duration>,
    /// Waiting for pool capacity.
    pub pool: Option<Duration>,
}

/// Optional per-request knobs; the explicit replacement for a dynamic
/// extensions mapping.
#[derive(Clone, Default)]
pub struct RequestOptions {
    pub timeouts: Timeouts,
    pub trace: Option<Arc<dyn TraceHook>>,
    /// Override the TLS SNI hostname (defaults to the URL host).
    pub sni_hostname: Option<String>,
}

impl std::fmt::Debug for RequestOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestOptions")
            .field("timeouts", &self.timeouts)
            .field("trace", &self.trace.is_some())
            .field("sni_hostname", &self.sni_hostname)
            .finish()
    }
}

/// Negotiated protocol version, reported on every response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpVersion {
    Http10,
    Http11,
    H2,
}

impl HttpVersion {
    pub fn as_bytes(&self) -> &'static [u8] {
        match self {
            HttpVersion::Http10 => b"HTTP/1.0",
            HttpVersion::Http11 => b"HTTP/1.1",
            HttpVersion::H2 => b"HTTP/2",
        }
    }
}

/// Ordered header pairs as they go on the wire.
pub type Headers = Vec<(Bytes, Bytes)>;

/// First value for `name`, case-insensitive.
pub fn header_value<'h>(headers: &'h Headers, name: &[u8]) -> Option<&'h Bytes> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v)
}

pub fn has_header(headers: &Headers, name: &[u8]) -> bool {
    header_value(headers, name).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_host_comparison_is_case_insensitive() {
        let a = Origin::new(Scheme::Https, &b"Example.COM"[..], 443);
        let b = Origin::new(Scheme::Https, &b"example.com"[..], 443);
        assert_eq!(a, b);
        assert_ne!(a, Origin::new(Scheme::Http, &b"example.com"[..], 443));
        assert_ne!(a, Origin::new(Scheme::Https, &b"example.com"[..], 8443));
    }

    #[test]
    fn authority_omits_default_port() {
        let url = Url::new(Scheme::Https, &b"example.com"[..], None, &b"/"[..]);
        assert_eq!(url.authority(), b"example.com");
        let url = Url::new(Scheme::Https, &b"example.com"[..], Some(8443), &b"/"[..]);
        assert_eq!(url.authority(), b"example.com:8443");
    }

    #[test]
    fn absolute_form_includes_scheme_and_target() {
        let url = Url::new(Scheme::Http, &b"example.com"[..], None, &b"/x?q=1"[..]);
        assert_eq!(url.absolute_form(), b"http://example.com/x?q=1");
    }

    #[test]
    fn header_lookup_is_case_insensitive_and_ordered() {
        let headers: Headers = vec![
            (Bytes::from_static(b"Accept"), Bytes::from_static(b"*/*")),
            (Bytes::from_static(b"accept"), Bytes::from_static(b"text/html")),
        ];
        assert_eq!(header_value(&headers, b"ACCEPT").unwrap(), &"*/*");
        assert!(has_header(&headers, b"accept"));
        assert!(!has_header(&headers, b"host"));
    }
}
