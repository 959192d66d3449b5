//! A pooled blocking connection: one network stream, one protocol engine.
//!
//! The same lazy-connect lifecycle as the async surface: TCP (or a Unix
//! socket), optional proxy negotiation, optional TLS with ALPN, then
//! engine selection.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::blocking::backend::{tls_config_with_alpn, NetworkBackend, NetworkStream};
use crate::blocking::http11::Http11Engine;
use crate::blocking::http2::Http2Engine;
use crate::blocking::{Request, Response};
use crate::error::Error;
use crate::model::{Headers, Origin, Scheme, Url};
use crate::trace::TraceSpan;

pub(crate) use crate::connection::RETRY_BACKOFF_FACTOR;

/// Connection-establishment knobs shared by every connection of a pool.
#[derive(Clone)]
pub(crate) struct ConnectConfig {
    pub http1: bool,
    pub http2: bool,
    pub keepalive_expiry: Option<Duration>,
    pub retries: u32,
    pub local_address: Option<std::net::IpAddr>,
    pub uds: Option<std::path::PathBuf>,
    pub tls: Arc<rustls::ClientConfig>,
}

impl ConnectConfig {
    fn alpn_offer(&self) -> Option<Vec<&'static [u8]>> {
        match (self.http1, self.http2) {
            (true, true) => Some(vec![b"http/1.1".as_slice(), b"h2".as_slice()]),
            (false, true) => Some(vec![b"h2".as_slice()]),
            _ => None,
        }
    }

    fn prior_knowledge_h2(&self) -> bool {
        self.http2 && !self.http1
    }
}

pub(crate) enum ConnMode {
    Direct,
    /// The pool rewrites forwarded requests before dispatch.
    Forward,
    Tunnel {
        destination: Origin,
        proxy_headers: Headers,
    },
    Socks {
        destination: Origin,
        auth: Option<(Vec<u8>, Vec<u8>)>,
    },
}

#[derive(Clone)]
enum EngineKind {
    H1(Arc<Http11Engine>),
    H2(Arc<Http2Engine>),
}

enum Slot {
    Pending,
    Ready(EngineKind),
    Unusable,
}

pub(crate) struct HttpConnection {
    pool_key: Origin,
    connect_to: Origin,
    mode: ConnMode,
    config: ConnectConfig,
    backend: Arc<dyn NetworkBackend>,
    /// Serializes the lazy connect; engines handle their own admission.
    connect_lock: Mutex<()>,
    slot: Mutex<Slot>,
    /// When a request last went out here; the pool evicts by this.
    last_used: Mutex<Instant>,
}

impl HttpConnection {
    fn build(
        pool_key: Origin,
        connect_to: Origin,
        mode: ConnMode,
        config: ConnectConfig,
        backend: Arc<dyn NetworkBackend>,
    ) -> Self {
        Self {
            pool_key,
            connect_to,
            mode,
            config,
            backend,
            connect_lock: Mutex::new(()),
            slot: Mutex::new(Slot::Pending),
            last_used: Mutex::new(Instant::now()),
        }
    }

    pub fn direct(origin: Origin, config: ConnectConfig, backend: Arc<dyn NetworkBackend>) -> Self {
        Self::build(origin.clone(), origin, ConnMode::Direct, config, backend)
    }

    pub fn forward(
        proxy_origin: Origin,
        config: ConnectConfig,
        backend: Arc<dyn NetworkBackend>,
    ) -> Self {
        Self::build(
            proxy_origin.clone(),
            proxy_origin,
            ConnMode::Forward,
            config,
            backend,
        )
    }

    pub fn tunnel(
        proxy_origin: Origin,
        destination: Origin,
        proxy_headers: Headers,
        config: ConnectConfig,
        backend: Arc<dyn NetworkBackend>,
    ) -> Self {
        Self::build(
            destination.clone(),
            proxy_origin,
            ConnMode::Tunnel {
                destination,
                proxy_headers,
            },
            config,
            backend,
        )
    }

    pub fn socks(
        proxy_origin: Origin,
        destination: Origin,
        auth: Option<(Vec<u8>, Vec<u8>)>,
        config: ConnectConfig,
        backend: Arc<dyn NetworkBackend>,
    ) -> Self {
        Self::build(
            destination.clone(),
            proxy_origin,
            ConnMode::Socks { destination, auth },
            config,
            backend,
        )
    }

    pub fn handle_request(&self, request: &mut Request) -> Result<Response, Error> {
        *self.last_used.lock().unwrap() = Instant::now();
        let engine = {
            let _connecting = self.connect_lock.lock().unwrap();
            let existing = {
                match &*self.slot.lock().unwrap() {
                    Slot::Ready(engine) => Some(engine.clone()),
                    Slot::Unusable => return Err(Error::ConnectionNotAvailable),
                    Slot::Pending => None,
                }
            };
            match existing {
                Some(engine) => engine,
                None => match self.establish(request) {
                    Ok(engine) => {
                        *self.slot.lock().unwrap() = Slot::Ready(engine.clone());
                        engine
                    }
                    Err(e) => {
                        *self.slot.lock().unwrap() = Slot::Unusable;
                        return Err(e);
                    }
                },
            }
        };

        match engine {
            EngineKind::H1(engine) => engine.handle_request(request),
            EngineKind::H2(engine) => engine.handle_request(request),
        }
    }

    fn establish(&self, request: &Request) -> Result<EngineKind, Error> {
        let mut retries_left = self.config.retries;
        let mut attempt = 0u32;
        loop {
            match self.attempt(request) {
                Ok(engine) => return Ok(engine),
                Err(e) if e.is_retriable_connect() && retries_left > 0 => {
                    retries_left -= 1;
                    let delay = if attempt == 0 {
                        Duration::ZERO
                    } else {
                        Duration::from_secs_f64(
                            RETRY_BACKOFF_FACTOR * f64::from(1u32 << (attempt - 1)),
                        )
                    };
                    tracing::debug!(target: "hawser", ?delay, error = %e, "retrying connect");
                    attempt += 1;
                    std::thread::sleep(delay);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn attempt(&self, request: &Request) -> Result<EngineKind, Error> {
        let trace = request.options.trace.clone();
        let timeouts = request.options.timeouts;

        let mut stream = {
            let span = TraceSpan::start(
                trace.as_ref(),
                if self.config.uds.is_some() {
                    "connection.connect_unix_socket"
                } else {
                    "connection.connect_tcp"
                },
                Some(&self.connect_to),
            );
            let opened = match &self.config.uds {
                Some(path) => self.backend.connect_unix(path, timeouts.connect),
                None => {
                    let host = String::from_utf8_lossy(&self.connect_to.host).into_owned();
                    self.backend.connect_tcp(
                        &host,
                        self.connect_to.port,
                        timeouts.connect,
                        self.config.local_address,
                    )
                }
            };
            match opened {
                Ok(stream) => {
                    span.complete(None);
                    stream
                }
                Err(e) => {
                    span.failed(&e);
                    return Err(e);
                }
            }
        };

        let (tls_target, h2_allowed): (Option<&Origin>, bool) = match &self.mode {
            ConnMode::Direct => (
                (self.pool_key.scheme == Scheme::Https).then_some(&self.pool_key),
                true,
            ),
            ConnMode::Forward => (
                (self.connect_to.scheme == Scheme::Https).then_some(&self.connect_to),
                false,
            ),
            ConnMode::Tunnel {
                destination,
                proxy_headers,
            } => {
                stream = self.open_tunnel(stream, destination, proxy_headers, request)?;
                (
                    (destination.scheme == Scheme::Https).then_some(destination),
                    true,
                )
            }
            ConnMode::Socks { destination, auth } => {
                socks_handshake(&mut stream, destination, auth.as_ref(), timeouts.connect)?;
                (
                    (destination.scheme == Scheme::Https).then_some(destination),
                    true,
                )
            }
        };

        let mut negotiated_h2 = false;
        if let Some(target) = tls_target {
            let offer = if h2_allowed {
                self.config.alpn_offer()
            } else {
                None
            };
            let tls_config = match &offer {
                Some(protocols) => tls_config_with_alpn(&self.config.tls, protocols),
                None => self.config.tls.clone(),
            };
            let sni = request
                .options
                .sni_hostname
                .clone()
                .unwrap_or_else(|| String::from_utf8_lossy(&target.host).into_owned());

            let span = TraceSpan::start(trace.as_ref(), "connection.start_tls", Some(&sni));
            stream = match stream.start_tls(tls_config, &sni, timeouts.connect) {
                Ok(stream) => {
                    span.complete(None);
                    stream
                }
                Err(e) => {
                    span.failed(&e);
                    return Err(e);
                }
            };
            negotiated_h2 = stream.negotiated_alpn().as_deref() == Some(b"h2");
        } else if h2_allowed && self.config.prior_knowledge_h2() {
            negotiated_h2 = true;
        }

        if negotiated_h2 {
            let engine = Http2Engine::new(
                self.pool_key.clone(),
                stream,
                self.config.keepalive_expiry,
                request,
            )?;
            tracing::debug!(target: "hawser", origin = %self.pool_key, "connected (HTTP/2)");
            Ok(EngineKind::H2(Arc::new(engine)))
        } else {
            tracing::debug!(target: "hawser", origin = %self.pool_key, "connected (HTTP/1.1)");
            Ok(EngineKind::H1(Arc::new(Http11Engine::new(
                self.pool_key.clone(),
                stream,
                self.config.keepalive_expiry,
            ))))
        }
    }

    fn open_tunnel(
        &self,
        stream: Box<dyn NetworkStream>,
        destination: &Origin,
        proxy_headers: &Headers,
        request: &Request,
    ) -> Result<Box<dyn NetworkStream>, Error> {
        let mut authority = destination.host.to_vec();
        authority.extend_from_slice(format!(":{}", destination.port).as_bytes());

        let engine = Arc::new(Http11Engine::new(self.connect_to.clone(), stream, None));
        let mut connect = Request::new(
            &b"CONNECT"[..],
            Url::new(
                Scheme::Http,
                destination.host.clone(),
                Some(destination.port),
                authority.clone(),
            ),
        );
        connect.headers.push((
            bytes::Bytes::from_static(b"Host"),
            bytes::Bytes::from(authority),
        ));
        connect.headers.extend(proxy_headers.iter().cloned());
        connect.options = request.options.clone();

        let mut response = engine.handle_request(&mut connect)?;
        if !(200..300).contains(&response.status) {
            let reason = response
                .reason_phrase
                .as_ref()
                .map(|r| String::from_utf8_lossy(r).into_owned())
                .unwrap_or_default();
            return Err(Error::Proxy(format!(
                "{} {}",
                response.status,
                reason.trim()
            )));
        }
        response
            .network_stream
            .take()
            .ok_or_else(|| Error::Proxy("proxy CONNECT returned no tunnel stream".into()))
    }

    pub fn close(&self) {
        let engine = {
            let mut slot = self.slot.lock().unwrap();
            match std::mem::replace(&mut *slot, Slot::Unusable) {
                Slot::Ready(engine) => Some(engine),
                _ => None,
            }
        };
        match engine {
            Some(EngineKind::H1(engine)) => engine.close(),
            Some(EngineKind::H2(engine)) => engine.close(),
            None => {}
        }
    }

    // ── Pool-facing predicates ─────────────────────────────────────────

    pub fn origin(&self) -> &Origin {
        &self.pool_key
    }

    /// Not yet connected: no protocol has been negotiated.
    pub fn is_connecting(&self) -> bool {
        matches!(&*self.slot.lock().unwrap(), Slot::Pending)
    }

    /// Last-activity instant, for least-recently-used eviction.
    pub fn last_used(&self) -> Instant {
        *self.last_used.lock().unwrap()
    }

    pub fn can_handle(&self, origin: &Origin) -> bool {
        match &*self.slot.lock().unwrap() {
            Slot::Pending => *origin == self.pool_key,
            Slot::Unusable => false,
            Slot::Ready(EngineKind::H1(e)) => e.can_handle(origin),
            Slot::Ready(EngineKind::H2(e)) => e.can_handle(origin),
        }
    }

    pub fn is_available(&self) -> bool {
        match &*self.slot.lock().unwrap() {
            Slot::Pending | Slot::Unusable => false,
            Slot::Ready(EngineKind::H1(e)) => e.is_available(),
            Slot::Ready(EngineKind::H2(e)) => e.is_available(),
        }
    }

    pub fn is_idle(&self) -> bool {
        match &*self.slot.lock().unwrap() {
            Slot::Pending | Slot::Unusable => false,
            Slot::Ready(EngineKind::H1(e)) => e.is_idle(),
            Slot::Ready(EngineKind::H2(e)) => e.is_idle(),
        }
    }

    pub fn is_closed(&self) -> bool {
        match &*self.slot.lock().unwrap() {
            Slot::Pending => false,
            Slot::Unusable => true,
            Slot::Ready(EngineKind::H1(e)) => e.is_closed(),
            Slot::Ready(EngineKind::H2(e)) => e.is_closed(),
        }
    }

    pub fn has_expired(&self) -> bool {
        match &*self.slot.lock().unwrap() {
            Slot::Pending | Slot::Unusable => false,
            Slot::Ready(EngineKind::H1(e)) => e.has_expired(),
            Slot::Ready(EngineKind::H2(e)) => e.has_expired(),
        }
    }

    pub fn in_flight(&self) -> usize {
        match &*self.slot.lock().unwrap() {
            Slot::Pending | Slot::Unusable => 0,
            Slot::Ready(EngineKind::H1(e)) => e.in_flight(),
            Slot::Ready(EngineKind::H2(e)) => e.in_flight(),
        }
    }

    pub fn request_count(&self) -> usize {
        match &*self.slot.lock().unwrap() {
            Slot::Pending | Slot::Unusable => 0,
            Slot::Ready(EngineKind::H1(e)) => e.request_count(),
            Slot::Ready(EngineKind::H2(e)) => e.request_count(),
        }
    }

    pub fn info(&self) -> String {
        match &*self.slot.lock().unwrap() {
            Slot::Pending => format!("{}, CONNECTING", self.pool_key),
            Slot::Unusable => format!("{}, CLOSED", self.pool_key),
            Slot::Ready(EngineKind::H1(e)) => e.info(),
            Slot::Ready(EngineKind::H2(e)) => e.info(),
        }
    }
}

fn socks_handshake(
    stream: &mut Box<dyn NetworkStream>,
    destination: &Origin,
    auth: Option<&(Vec<u8>, Vec<u8>)>,
    timeout: Option<Duration>,
) -> Result<(), Error> {
    use crate::socks5_wire as socks5;

    let method = match auth {
        Some(_) => socks5::AuthMethod::UsernamePassword,
        None => socks5::AuthMethod::None,
    };

    let mut out = Vec::new();
    socks5::write_greeting(&mut out, method);
    stream.write(&out, timeout)?;
    read_reply(stream, timeout, |buf| {
        socks5::parse_greeting_reply(buf, method)
    })?;

    if let Some((username, password)) = auth {
        let mut out = Vec::new();
        socks5::write_auth(&mut out, username, password)?;
        stream.write(&out, timeout)?;
        read_reply(stream, timeout, socks5::parse_auth_reply)?;
    }

    let mut out = Vec::new();
    socks5::write_connect(&mut out, &destination.host, destination.port)?;
    stream.write(&out, timeout)?;
    read_reply(stream, timeout, socks5::parse_connect_reply)?;
    Ok(())
}

fn read_reply(
    stream: &mut Box<dyn NetworkStream>,
    timeout: Option<Duration>,
    mut parse: impl FnMut(&[u8]) -> Result<Option<usize>, Error>,
) -> Result<(), Error> {
    let mut buf = Vec::new();
    loop {
        if parse(&buf)?.is_some() {
            return Ok(());
        }
        let chunk = stream.read(4096, timeout)?;
        if chunk.is_empty() {
            return Err(Error::Proxy(
                "SOCKS5 proxy closed the connection mid negotiation".into(),
            ));
        }
        buf.extend_from_slice(&chunk);
    }
}
