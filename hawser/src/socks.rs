//! A pool that routes requests through a SOCKS5 proxy.
//!
//! Each destination origin gets its own connection: SOCKS5 negotiation
//! (no-auth or username/password), a CONNECT command for the destination,
//! then TLS and HTTP exactly as for a direct connection.

use std::sync::Arc;

use crate::backend::{NetworkBackend, TokioBackend};
use crate::error::Error;
use crate::model::Origin;
use crate::pool::{ConnectionInfo, ConnectionPool, PoolConfig, PoolKind};
use crate::request::Request;
use crate::response::Response;

pub struct SocksProxyConfig {
    pub proxy_origin: Origin,
    /// Username/password negotiation per RFC 1929; no-auth when absent.
    pub proxy_auth: Option<(Vec<u8>, Vec<u8>)>,
}

impl SocksProxyConfig {
    pub fn new(proxy_origin: Origin) -> Self {
        Self {
            proxy_origin,
            proxy_auth: None,
        }
    }
}

/// A connection pool sending every request via a SOCKS5 proxy.
pub struct SocksProxy {
    pool: ConnectionPool,
}

impl SocksProxy {
    pub fn new(proxy: SocksProxyConfig, config: PoolConfig) -> Self {
        Self::with_backend(proxy, config, Arc::new(TokioBackend))
    }

    pub fn with_backend(
        proxy: SocksProxyConfig,
        config: PoolConfig,
        backend: Arc<dyn NetworkBackend>,
    ) -> Self {
        let kind = PoolKind::Socks {
            proxy_origin: proxy.proxy_origin,
            auth: proxy.proxy_auth,
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
