//! The connection pool and its scheduler.
//!
//! Requests become tickets in a FIFO queue. A scheduling pass runs under
//! the pool mutex whenever a ticket arrives, a connection frees up, a
//! response body is released, or a connection closes — it matches tickets
//! to connections under the capacity rules and never performs I/O while
//! holding the lock. Assigned tickets leave the scheduler and drive their
//! connection from their own task.

use std::collections::VecDeque;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::backend::{with_deadline, NetworkBackend, TokioBackend};
use crate::connection::{ConnectConfig, HttpConnection};
use crate::error::Error;
use crate::model::{Headers, Origin, Scheme};
use crate::request::Request;
use crate::response::Response;

/// Pool construction parameters.
#[derive(Clone)]
pub struct PoolConfig {
    /// Hard cap on concurrent connections.
    pub max_connections: usize,
    /// Cap on idle keep-alive connections; clamped to `max_connections`.
    pub max_keepalive_connections: usize,
    /// How long an idle connection may linger before it is closed.
    pub keepalive_expiry: Option<Duration>,
    pub http1: bool,
    pub http2: bool,
    /// Connect-phase retry budget.
    pub retries: u32,
    pub local_address: Option<IpAddr>,
    /// Route connections over a Unix domain socket instead of TCP.
    pub uds: Option<PathBuf>,
    /// TLS configuration; the backend default when absent.
    pub tls: Option<Arc<rustls::ClientConfig>>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            max_keepalive_connections: 10,
            keepalive_expiry: Some(Duration::from_secs(5)),
            http1: true,
            http2: false,
            retries: 0,
            local_address: None,
            uds: None,
            tls: None,
        }
    }
}

/// Forward-vs-tunnel decision for an HTTP proxy pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyMode {
    /// Forward `http://`, tunnel `https://`.
    ByScheme,
    ForwardOnly,
    TunnelOnly,
}

pub(crate) enum PoolKind {
    Direct,
    HttpProxy {
        proxy_origin: Origin,
        proxy_headers: Headers,
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
    ready: tokio::sync::Notify,
}

impl Ticket {
    fn new(origin: Origin) -> Self {
        Self {
            origin,
            state: Mutex::new(TicketState::Queued),
            ready: tokio::sync::Notify::new(),
        }
    }

    fn assign(&self, conn: Arc<HttpConnection>) {
        *self.state.lock().unwrap() = TicketState::Assigned(conn);
        self.ready.notify_one();
    }

    fn cancel(&self) {
        *self.state.lock().unwrap() = TicketState::Cancelled;
        self.ready.notify_one();
    }

    async fn wait(&self) -> Result<Arc<HttpConnection>, Error> {
        loop {
            let ready = self.ready.notified();
            {
                match &*self.state.lock().unwrap() {
                    TicketState::Assigned(conn) => return Ok(conn.clone()),
                    TicketState::Cancelled => return Err(Error::PoolClosed),
                    TicketState::Queued => {}
                }
            }
            ready.await;
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

/// A concurrent pool of HTTP/1.1 and HTTP/2 connections.
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// A pool that connects straight to request origins.
    pub fn new(config: PoolConfig) -> Self {
        Self::with_backend(config, Arc::new(TokioBackend))
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

    /// Send a request, waiting for pool capacity when necessary. Returns
    /// once response headers are in; the body streams lazily and holds
    /// the connection until it is drained or closed.
    pub async fn handle_request(&self, mut request: Request) -> Result<Response, Error> {
        if !self.inner.connect.http1 && !self.inner.connect.http2 {
            return Err(Error::UnsupportedProtocol(
                "neither http1 nor http2 is enabled".into(),
            ));
        }

        let origin = self.inner.origin_for(&request);
        self.inner.prepare_for_proxy(&mut request, &origin);
        let pool_timeout = request.options.timeouts.pool;
        let mut recovered_idle_close = false;

        loop {
            let ticket = Arc::new(Ticket::new(origin.clone()));
            {
                let mut state = self.inner.state.lock().unwrap();
                if state.closed {
                    return Err(Error::PoolClosed);
                }
                state.queue.push_back(ticket.clone());
                let evicted = self.inner.schedule(&mut state);
                spawn_closes(evicted);
            }

            // Cancellation while queued must not strand the ticket (or a
            // connection the scheduler already dedicated to it).
            let guard = TicketCancelGuard {
                inner: &self.inner,
                ticket: &ticket,
            };
            let waited = with_deadline(pool_timeout, ticket.wait(), || Error::PoolTimeout).await;
            std::mem::forget(guard);

            let conn = match waited {
                Ok(Ok(conn)) => conn,
                Ok(Err(e)) => return Err(e),
                Err(timeout) => {
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
                            return Err(timeout);
                        }
                    }
                }
            };

            // A reused keep-alive connection may have been closed by the
            // server in the race window; keep a replayable copy so that
            // case can be retried on a fresh connection.
            let reused = conn.request_count() > 0;
            let replay = if reused && !recovered_idle_close {
                request.body.replay_copy()
            } else {
                None
            };

            match conn.handle_request(&mut request).await {
                Ok(mut response) => {
                    let inner = self.inner.clone();
                    response.body.on_release(Box::new(move || {
                        inner.reschedule();
                    }));
                    return Ok(response);
                }
                Err(Error::ConnectionNotAvailable) => {
                    // The connection could not admit the request (it went
                    // busy, filled up, or failed to establish for a
                    // ticket that was racing it). Schedule again.
                    self.inner.discard_if_unusable(&conn);
                    continue;
                }
                Err(e) if e.is_idle_close() && reused && replay.is_some() => {
                    recovered_idle_close = true;
                    request.body = replay.unwrap();
                    self.inner.remove_connection(&conn);
                    conn.close().await;
                    continue;
                }
                Err(e) => {
                    self.inner.remove_connection(&conn);
                    conn.close().await;
                    return Err(e);
                }
            }
        }
    }

    /// Close every connection. Idempotent; all queued and future requests
    /// fail with a closed-pool error. In-flight reads surface errors as
    /// their sockets close.
    pub async fn close(&self) {
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
            conn.close().await;
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

    /// Number of tickets still waiting for a connection.
    pub fn queued_requests(&self) -> usize {
        self.inner.state.lock().unwrap().queue.len()
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock().unwrap();
        state.closed = true;
        for ticket in state.queue.drain(..) {
            ticket.cancel();
        }
        for conn in state.connections.drain(..) {
            conn.close_nowait();
        }
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
    /// The pooling key for a request: its own origin, or the proxy's in
    /// forwarding mode.
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
    /// and the proxy's own headers up front. Applied once, before the
    /// ticket is ever scheduled, so rescheduling cannot double-rewrite.
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
            PoolKind::Direct => HttpConnection::direct(
                origin.clone(),
                self.connect.clone(),
                self.backend.clone(),
            ),
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

    /// One scheduling pass. Runs under the pool mutex; returns the
    /// connections that must be closed once the lock is released.
    fn schedule(&self, state: &mut PoolState) -> Vec<Arc<HttpConnection>> {
        let mut to_close = Vec::new();

        // Expiry sweep: closed connections leave, idle expired ones close.
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

            // Prefer the busiest available matching connection, which
            // concentrates HTTP/2 streams and keeps others closable. On
            // an http2-enabled pool a still-connecting connection for the
            // same origin may be shared too: if it negotiates h2 the
            // extra tickets multiplex, and if it comes up as HTTP/1.1
            // they bounce back to the scheduler.
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

    /// A connection freed up (or went away): run a scheduling pass so the
    /// change in capacity is put to use.
    fn reschedule(&self) {
        let evicted = {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return;
            }
            self.schedule(&mut state)
        };
        spawn_closes(evicted);
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
        spawn_closes(evicted);
    }

    fn discard_if_unusable(&self, conn: &Arc<HttpConnection>) {
        if conn.is_closed() {
            self.remove_connection(conn);
        } else {
            // Just rerun the scheduler; the connection stays for other
            // tickets it can still serve.
            self.reschedule();
        }
    }
}

struct TicketCancelGuard<'p> {
    inner: &'p Arc<PoolInner>,
    ticket: &'p Arc<Ticket>,
}

impl Drop for TicketCancelGuard<'_> {
    fn drop(&mut self) {
        let assigned = match &*self.ticket.state.lock().unwrap() {
            TicketState::Assigned(conn) => Some(conn.clone()),
            _ => None,
        };
        self.ticket.cancel();
        let evicted = {
            let mut state = self.inner.state.lock().unwrap();
            state.queue.retain(|t| !Arc::ptr_eq(t, self.ticket));
            if let Some(conn) = &assigned {
                // A connection created for this ticket and never used
                // would otherwise occupy its slot forever.
                if conn.is_connecting() {
                    state.connections.retain(|c| !Arc::ptr_eq(c, conn));
                }
            }
            if state.closed {
                return;
            }
            self.inner.schedule(&mut state)
        };
        spawn_closes(evicted);
    }
}

/// Close connections without blocking the caller. Used where the
/// scheduler cannot await; the sockets are released either way.
fn spawn_closes(connections: Vec<Arc<HttpConnection>>) {
    for conn in connections {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { conn.close().await });
            }
            Err(_) => conn.close_nowait(),
        }
    }
}
