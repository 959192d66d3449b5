//! A blocking pool that routes requests through a SOCKS5 proxy.

use std::sync::Arc;

use crate::blocking::backend::{NetworkBackend, StdBackend};
use crate::blocking::pool::{ConnectionInfo, ConnectionPool, PoolConfig, PoolKind};
use crate::blocking::{Request, Response};
use crate::error::Error;

pub use crate::socks::SocksProxyConfig;

/// A blocking connection pool sending every request via a SOCKS5 proxy.
pub struct SocksProxy {
    pool: ConnectionPool,
}

impl SocksProxy {
    pub fn new(proxy: SocksProxyConfig, config: PoolConfig) -> Self {
        Self::with_backend(proxy, config, Arc::new(StdBackend))
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

    pub fn handle_request(&self, request: Request) -> Result<Response, Error> {
        self.pool.handle_request(request)
    }

    pub fn close(&self) {
        self.pool.close();
    }

    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.pool.connections()
    }
}
