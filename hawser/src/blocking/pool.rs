//! The blocking connection pool.
//!
//! The same scheduler as the async pool: FIFO tickets matched to
//! connections under capacity and keep-alive rules, with a condition
//! variable as the blocking primitive instead of task notification. No
//! I/O happens while the pool mutex is held.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Instant;

use crate::blocking::backend::{NetworkBackend, StdBackend};
use crate::blocking::connection::{ConnectConfig, HttpConnection};
use crate::blocking::{Request, Response};
use crate::error::Error;
use crate::model::{Origin, Scheme};

pub use crate::pool::{PoolConfig, ProxyMode};

pub(crate) enum PoolKind {
    Direct,
    HttpProxy {
        proxy_origin: Origin,
        proxy_headers: crate::model::Headers,
        mode: ProxyMode,
    },
    Socks {
        proxy_origin: Origin,
        auth: Option<(Vec<u8>, Vec<u8>)>,
    },
}

enum TicketState {
    Queued,
    Assigned(Arc<HttpConnection>),
    Cancelled,
}

struct Ticket {
    origin: Origin,
    state: Mutex<TicketState>,
    ready: Condvar,
}

impl Ticket {
    fn new(origin: Origin) -> Self {
        Self {
            origin,
            state: Mutex::new(TicketState::Queued),
            ready: Condvar::new(),
        }
    }

    fn assign(&self, conn: Arc<HttpConnection>) {
        *self.state.lock().unwrap() = TicketState::Assigned(conn);
        self.ready.notify_all();
    }

    fn cancel(&self) {
        *self.state.lock().unwrap() = TicketState::Cancelled;
        self.ready.notify_all();
    }

    fn wait(&self, deadline: Option<Instant>) -> Result<Arc<HttpConnection>, Error> {
        let mut state = self.state.lock().unwrap();
        loop {
            match &*state {
                TicketState::Assigned(conn) => return Ok(conn.clone()),
                TicketState::Cancelled => return Err(Error::PoolClosed),
                TicketState::Queued => {}
            }
            state = match deadline {
                None => self.ready.wait(state).unwrap(),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Error::PoolTimeout);
                    }
                    let (state, timeout) =
                        self.ready.wait_timeout(state, deadline - now).unwrap();
                    let _ = timeout;
                    state
                }
            };
        }
    }
}

struct PoolState {
    connections: Vec<Arc<HttpConnection>>,
    queue: VecDeque<Arc<Ticket>>,
    closed: bool,
}

pub(crate) struct PoolInner {
    state: Mutex<PoolState>,
    kind: PoolKind,
    connect: ConnectConfig,
    max_connections: usize,
    max_keepalive: usize,
    backend: Arc<dyn NetworkBackend>,
}

/// A thread-safe pool of HTTP/1.1 and HTTP/2 connections.
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        Self::with_backend(config, Arc::new(StdBackend))
    }

    pub fn with_backend(config: PoolConfig, backend: Arc<dyn NetworkBackend>) -> Self {
        Self::build(config, backend, PoolKind::Direct)
    }

    pub(crate) fn build(
        config: PoolConfig,
        backend: Arc<dyn NetworkBackend>,
        kind: PoolKind,
    ) -> Self {
        let tls = config
            .tls
            .clone()
            .unwrap_or_else(|| backend.default_tls_config());
        let connect = ConnectConfig {
            http1: config.http1,
            http2: config.http2,
            keepalive_expiry: config.keepalive_expiry,
            retries: config.retries,
            local_address: config.local_address,
            uds: config.uds.clone(),
            tls,
        };
        Self {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState {
                    connections: Vec::new(),
                    queue: VecDeque::new(),
                    closed: false,
                }),
                kind,
                connect,
                max_connections: config.max_connections.max(1),
                max_keepalive: config
                    .max_keepalive_connections
                    .min(config.max_connections.max(1)),
                backend,
            }),
        }
    }

    /// Send a request, blocking for pool capacity when necessary.
    pub fn handle_request(&self, mut request: Request) -> Result<Response, Error> {
        if !self.inner.connect.http1 && !self.inner.connect.http2 {
            return Err(Error::UnsupportedProtocol(
                "neither http1 nor http2 is enabled".into(),
            ));
        }

        let origin = self.inner.origin_for(&request);
        self.inner.prepare_for_proxy(&mut request, &origin);
        let deadline = request.options.timeouts.pool.map(|d| Instant::now() + d);
        let mut recovered_idle_close = false;

        loop {
            let ticket = Arc::new(Ticket::new(origin.clone()));
            let evicted = {
                let mut state = self.inner.state.lock().unwrap();
                if state.closed {
                    return Err(Error::PoolClosed);
                }
                state.queue.push_back(ticket.clone());
                self.inner.schedule(&mut state)
            };
            close_all(evicted);

            let conn = match ticket.wait(deadline) {
                Ok(conn) => conn,
                Err(e) => {
                    // The scheduler may assign concurrently with the
                    // deadline firing; an assigned connection must be
                    // used, or it would sit in the pool unusable.
                    let mut state = self.inner.state.lock().unwrap();
                    let raced = match &*ticket.state.lock().unwrap() {
                        TicketState::Assigned(conn) => Some(conn.clone()),
                        _ => None,
                    };
                    match raced {
                        Some(conn) => conn,
                        None => {
                            state.queue.retain(|t| !Arc::ptr_eq(t, &ticket));
                            ticket.cancel();
                            return Err(e);
                        }
                    }
                }
            };

            let reused = conn.request_count() > 0;
            let replay = if reused && !recovered_idle_close {
                request.body.replay_copy()
            } else {
                None
            };

            match conn.handle_request(&mut request) {
                Ok(mut response) => {
                    let inner = self.inner.clone();
                    response.body.on_release(Box::new(move || {
                        inner.reschedule();
                    }));
                    return Ok(response);
                }
                Err(Error::ConnectionNotAvailable) => {
                    self.inner.discard_if_unusable(&conn);
                    continue;
                }
                Err(e) if e.is_idle_close() && reused && replay.is_some() => {
                    recovered_idle_close = true;
                    request.body = replay.unwrap();
                    self.inner.remove_connection(&conn);
                    conn.close();
                    continue;
                }
                Err(e) => {
                    self.inner.remove_connection(&conn);
                    conn.close();
                    return Err(e);
                }
            }
        }
    }

    /// Close every connection. Idempotent.
    pub fn close(&self) {
        let (connections, tickets) = {
            let mut state = self.inner.state.lock().unwrap();
            state.closed = true;
            (
                std::mem::take(&mut state.connections),
                std::mem::take(&mut state.queue),
            )
        };
        for ticket in tickets {
            ticket.cancel();
        }
        for conn in connections {
            conn.close();
        }
    }

    /// Diagnostic snapshot of the pool's connections.
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        let state = self.inner.state.lock().unwrap();
        state
            .connections
            .iter()
            .map(|c| ConnectionInfo {
                origin: c.origin().clone(),
                description: c.info(),
                is_idle: c.is_idle(),
                is_available: c.is_available(),
                in_flight: c.in_flight(),
            })
            .collect()
    }

    pub fn queued_requests(&self) -> usize {
        self.inner.state.lock().unwrap().queue.len()
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        self.close();
    }
}

/// One row of the [`ConnectionPool::connections`] snapshot.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub origin: Origin,
    pub description: String,
    pub is_idle: bool,
    pub is_available: bool,
    pub in_flight: usize,
}

impl PoolInner {
    fn origin_for(&self, request: &Request) -> Origin {
        match &self.kind {
            PoolKind::Direct | PoolKind::Socks { .. } => request.url.origin(),
            PoolKind::HttpProxy {
                proxy_origin, mode, ..
            } => {
                let forward = match mode {
                    ProxyMode::ByScheme => request.url.scheme == Scheme::Http,
                    ProxyMode::ForwardOnly => true,
                    ProxyMode::TunnelOnly => false,
                };
                if forward {
                    proxy_origin.clone()
                } else {
                    request.url.origin()
                }
            }
        }
    }

    /// Forwarded proxy requests carry the absolute URL as their target
    /// and the proxy's own headers up front. Applied once per request.
    fn prepare_for_proxy(&self, request: &mut Request, origin: &Origin) {
        let PoolKind::HttpProxy {
            proxy_origin,
            proxy_headers,
            ..
        } = &self.kind
        else {
            return;
        };
        if origin != proxy_origin {
            return;
        }
        request.url.target = request.url.absolute_form().into();
        if !proxy_headers.is_empty() {
            let mut headers = proxy_headers.clone();
            headers.append(&mut request.headers);
            request.headers = headers;
        }
    }

    fn build_connection(&self, origin: &Origin) -> Arc<HttpConnection> {
        let conn = match &self.kind {
            PoolKind::Direct => {
                HttpConnection::direct(origin.clone(), self.connect.clone(), self.backend.clone())
            }
            PoolKind::HttpProxy {
                proxy_origin,
                proxy_headers,
                ..
            } => {
                if origin == proxy_origin {
                    HttpConnection::forward(
                        proxy_origin.clone(),
                        self.connect.clone(),
                        self.backend.clone(),
                    )
                } else {
                    HttpConnection::tunnel(
                        proxy_origin.clone(),
                        origin.clone(),
                        proxy_headers.clone(),
                        self.connect.clone(),
                        self.backend.clone(),
                    )
                }
            }
            PoolKind::Socks { proxy_origin, auth } => HttpConnection::socks(
                proxy_origin.clone(),
                origin.clone(),
                auth.clone(),
                self.connect.clone(),
                self.backend.clone(),
            ),
        };
        Arc::new(conn)
    }

    /// One scheduling pass, identical to the async pool's.
    fn schedule(&self, state: &mut PoolState) -> Vec<Arc<HttpConnection>> {
        let mut to_close = Vec::new();

        state.connections.retain(|conn| {
            if conn.is_closed() {
                return false;
            }
            if conn.is_idle() && conn.has_expired() {
                to_close.push(conn.clone());
                return false;
            }
            true
        });

        let mut still_queued = VecDeque::new();
        while let Some(ticket) = state.queue.pop_front() {
            if matches!(*ticket.state.lock().unwrap(), TicketState::Cancelled) {
                continue;
            }

            // Prefer the busiest available matching connection. On an
            // http2-enabled pool a still-connecting connection for the
            // same origin may be shared: extra tickets multiplex if it
            // negotiates h2, or bounce back to the scheduler if not.
            let mut best = state
                .connections
                .iter()
                .filter(|c| c.can_handle(&ticket.origin) && c.is_available())
                .max_by_key(|c| c.in_flight())
                .cloned();
            if best.is_none() && self.connect.http2 {
                best = state
                    .connections
                    .iter()
                    .find(|c| c.is_connecting() && c.can_handle(&ticket.origin))
                    .cloned();
            }
            if let Some(conn) = best {
                ticket.assign(conn);
                continue;
            }

            if state.connections.len() < self.max_connections {
                let conn = self.build_connection(&ticket.origin);
                state.connections.push(conn.clone());
                ticket.assign(conn);
                continue;
            }

            // At capacity: evict the least-recently-used idle connection
            // on some other origin to make room.
            let victim = state
                .connections
                .iter()
                .enumerate()
                .filter(|(_, c)| c.is_idle() && !c.can_handle(&ticket.origin))
                .min_by_key(|(_, c)| c.last_used())
                .map(|(at, _)| at);
            if let Some(at) = victim {
                let evicted = state.connections.remove(at);
                to_close.push(evicted);
                let conn = self.build_connection(&ticket.origin);
                state.connections.push(conn.clone());
                ticket.assign(conn);
                continue;
            }

            still_queued.push_back(ticket);
        }
        state.queue = still_queued;

        // Keep-alive cap: close the least-recently-used idle connections
        // over the limit.
        loop {
            let idle: Vec<usize> = state
                .connections
                .iter()
                .enumerate()
                .filter(|(_, c)| c.is_idle())
                .map(|(i, _)| i)
                .collect();
            if idle.len() <= self.max_keepalive {
                break;
            }
            let Some(&at) = idle
                .iter()
                .min_by_key(|&&i| state.connections[i].last_used())
            else {
                break;
            };
            to_close.push(state.connections.remove(at));
        }

        to_close
    }

    /// A connection freed up (or went away): run a scheduling pass so
    /// the change in capacity is put to use.
    fn reschedule(&self) {
        let evicted = {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return;
            }
            self.schedule(&mut state)
        };
        close_all(evicted);
    }

    fn remove_connection(&self, conn: &Arc<HttpConnection>) {
        let evicted = {
            let mut state = self.state.lock().unwrap();
            state.connections.retain(|c| !Arc::ptr_eq(c, conn));
            if state.closed {
                return;
            }
            self.schedule(&mut state)
        };
        close_all(evicted);
    }

    fn discard_if_unusable(&self, conn: &Arc<HttpConnection>) {
        if conn.is_closed() {
            self.remove_connection(conn);
        } else {
            self.reschedule();
        }
    }
}

fn close_all(connections: Vec<Arc<HttpConnection>>) {
    for conn in connections {
        conn.close();
    }
}
