//! Pools that route requests through an HTTP proxy.
//!
//! `http://` destinations are forwarded with absolute-form request lines
//! on a connection keyed to the proxy; `https://` destinations get a
//! CONNECT tunnel through the proxy and then behave like direct
//! connections keyed to their own origin. [`ProxyMode`] can force either
//! behaviour.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;

use crate::backend::{NetworkBackend, TokioBackend};
use crate::error::Error;
use crate::model::{Headers, Origin};
use crate::pool::{ConnectionInfo, ConnectionPool, PoolConfig, PoolKind, ProxyMode};
use crate::request::Request;
use crate::response::Response;

/// Where and how to reach the proxy.
pub struct HttpProxyConfig {
    pub proxy_origin: Origin,
    /// Username/password for `Proxy-Authorization: Basic`.
    pub proxy_auth: Option<(Vec<u8>, Vec<u8>)>,
    /// Extra headers for the CONNECT request or each forwarded request.
    pub proxy_headers: Headers,
    pub mode: ProxyMode,
}

impl HttpProxyConfig {
    pub fn new(proxy_origin: Origin) -> Self {
        Self {
            proxy_origin,
            proxy_auth: None,
            proxy_headers: Headers::new(),
            mode: ProxyMode::ByScheme,
        }
    }

    pub(crate) fn wire_headers(&self) -> Headers {
        let mut headers = Headers::new();
        if let Some((username, password)) = &self.proxy_auth {
            let mut credentials = username.clone();
            credentials.push(b':');
            credentials.extend_from_slice(password);
            let value = format!("Basic {}", BASE64.encode(&credentials));
            headers.push((
                Bytes::from_static(b"Proxy-Authorization"),
                Bytes::from(value.into_bytes()),
            ));
        }
        headers.extend(self.proxy_headers.iter().cloned());
        headers
    }
}

/// A connection pool sending every request via an HTTP proxy.
pub struct HttpProxy {
    pool: ConnectionPool,
}

impl HttpProxy {
    pub fn new(proxy: HttpProxyConfig, config: PoolConfig) -> Self {
        Self::with_backend(proxy, config, Arc::new(TokioBackend))
    }

    pub fn with_backend(
        proxy: HttpProxyConfig,
        config: PoolConfig,
        backend: Arc<dyn NetworkBackend>,
    ) -> Self {
        let kind = PoolKind::HttpProxy {
            proxy_headers: proxy.wire_headers(),
            proxy_origin: proxy.proxy_origin,
            mode: proxy.mode,
        };
        Self {
            pool: ConnectionPool::build(config, backend, kind),
        }
    }

    pub async fn handle_request(&self, request: Request) -> Result<Response, Error> {
        self.pool.handle_request(request).await
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.pool.connections()
    }
}
