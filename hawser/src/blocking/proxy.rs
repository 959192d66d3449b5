//! Blocking pools that route requests through an HTTP proxy.

use std::sync::Arc;

use crate::blocking::backend::{NetworkBackend, StdBackend};
use crate::blocking::pool::{ConnectionInfo, ConnectionPool, PoolConfig, PoolKind};
use crate::blocking::{Request, Response};
use crate::error::Error;

pub use crate::pool::ProxyMode;
pub use crate::proxy::HttpProxyConfig;

/// A blocking connection pool sending every request via an HTTP proxy.
pub struct HttpProxy {
    pool: ConnectionPool,
}

impl HttpProxy {
    pub fn new(proxy: HttpProxyConfig, config: PoolConfig) -> Self {
        Self::with_backend(proxy, config, Arc::new(StdBackend))
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
