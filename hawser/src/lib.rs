//! Minimal low-level HTTP client transport.
//!
//! `hawser` dispatches HTTP/1.1 and HTTP/2 requests to remote origins
//! over reusable, pooled connections, optionally via HTTP forwarding or
//! tunneling proxies or a SOCKS5 proxy. It deliberately stops there: no
//! redirects, no cookies, no content decoding — just the transport.
//!
//! # Architecture
//!
//! ```text
//!   ConnectionPool            FIFO tickets, capacity, keep-alive
//!        |
//!   HttpConnection            lazy connect, ALPN, proxy negotiation
//!        |
//!   Http11Engine / Http2Engine
//!        |                    hawser-h2 sans-IO framing for HTTP/2
//!   NetworkBackend            tokio sockets + rustls (or a mock)
//! ```
//!
//! Two parallel surfaces share the sans-IO protocol cores: the async one
//! at the crate root (tokio), and [`blocking`] for plain threads, with
//! identical pooling and protocol semantics.
//!
//! # Example
//!
//! ```rust,no_run
//! use hawser::{ConnectionPool, PoolConfig, Request, Scheme, Url};
//!
//! # async fn example() -> Result<(), hawser::Error> {
//! let pool = ConnectionPool::new(PoolConfig::default());
//!
//! let request = Request::new(
//!     &b"GET"[..],
//!     Url::new(Scheme::Https, &b"example.com"[..], None, &b"/"[..]),
//! );
//! let mut response = pool.handle_request(request).await?;
//! assert_eq!(response.status, 200);
//! let body = response.body.read_to_end().await?;
//! # let _ = body;
//! pool.close().await;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod blocking;
pub mod body;
pub mod connection;
pub mod error;
pub mod h1_wire;
pub mod http11;
pub mod http2;
pub mod mock;
pub mod model;
pub mod pool;
pub mod proxy;
pub mod request;
pub mod response;
pub mod socks;
pub mod socks5_wire;
pub mod trace;

pub use backend::{NetworkBackend, NetworkStream};
pub use body::{Body, ChunkSource, ResponseBody};
pub use error::Error;
pub use model::{Headers, HttpVersion, Origin, RequestOptions, Scheme, Timeouts, Url};
pub use pool::{ConnectionInfo, ConnectionPool, PoolConfig, ProxyMode};
pub use proxy::{HttpProxy, HttpProxyConfig};
pub use request::Request;
pub use response::Response;
pub use socks::{SocksProxy, SocksProxyConfig};
pub use trace::TraceHook;
