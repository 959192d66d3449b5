//! HTTP/1.1 request engine.
//!
//! One request in flight per connection: send the head, stream the body,
//! then parse the response head and hand back a lazily streamed body.
//! The connection returns to idle only when that body is fully consumed,
//! and closes instead whenever either side asked for `Connection: close`,
//! the body was close-delimited, or anything went wrong mid-request.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};

use crate::backend::{NetworkStream, ReadStream, WriteStream, READ_CHUNK};
use crate::body::{Body, ResponseBody, ResponseBodySource};
use crate::error::Error;
use crate::h1_wire::{
    self, ChunkDecoder, ChunkStep, RecvBodyMode, SendFraming,
};
use crate::model::{Origin, Timeouts};
use crate::request::Request;
use crate::response::Response;
use crate::trace::{TraceHook, TraceSpan};

pub(crate) const IDLE_CLOSE_MSG: &str = "server disconnected without sending a response";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Created for one specific ticket; not yet advertised as available.
    New,
    Active,
    Idle,
    Closed,
}

struct State {
    phase: Phase,
    request_count: usize,
    expire_at: Option<Instant>,
}

struct IoState {
    /// Taken on close or when the stream is surrendered to an upgrade.
    stream: Option<Box<dyn NetworkStream>>,
    buf: BytesMut,
}

/// An HTTP/1.1 connection engine over one network stream.
pub struct Http11Engine {
    origin: Origin,
    keepalive_expiry: Option<Duration>,
    state: Mutex<State>,
    io: tokio::sync::Mutex<IoState>,
}

impl Http11Engine {
    pub fn new(
        origin: Origin,
        stream: Box<dyn NetworkStream>,
        keepalive_expiry: Option<Duration>,
    ) -> Self {
        Self {
            origin,
            keepalive_expiry,
            state: Mutex::new(State {
                phase: Phase::New,
                request_count: 0,
                expire_at: None,
            }),
            io: tokio::sync::Mutex::new(IoState {
                stream: Some(stream),
                buf: BytesMut::new(),
            }),
        }
    }

    pub async fn handle_request(self: &Arc<Self>, request: &mut Request) -> Result<Response, Error> {
        {
            let mut state = self.state.lock().unwrap();
            match state.phase {
                Phase::New | Phase::Idle => {
                    state.phase = Phase::Active;
                    state.request_count += 1;
                    state.expire_at = None;
                }
                Phase::Active | Phase::Closed => return Err(Error::ConnectionNotAvailable),
            }
        }
        // Cancellation mid-exchange leaves half-written protocol state;
        // dropping this future closes the connection.
        let guard = CancelGuard {
            engine: self.as_ref(),
        };
        let result = self.drive(request).await;
        std::mem::forget(guard);
        match result {
            Ok(response) => Ok(response),
            Err(e) => {
                // Anything that failed before the response body completed
                // leaves the protocol state indeterminate.
                self.close().await;
                Err(e)
            }
        }
    }

    async fn drive(self: &Arc<Self>, request: &mut Request) -> Result<Response, Error> {
        let trace = request.options.trace.clone();
        let timeouts = request.options.timeouts;
        let method = request.method.clone();
        let url = request.url.clone();
        let headers = request.headers.clone();
        let body = &mut request.body;

        let framing = h1_wire::plan_framing(&headers, body.known_len(), !body.is_empty());
        let mut head = Vec::with_capacity(256);
        h1_wire::write_request_head(
            &mut head,
            &method,
            &url.target,
            &headers,
            &url.authority(),
            framing,
        );

        // A server may reject the request early and respond while we are
        // still writing; suppress plain write errors and try to read the
        // response anyway, surfacing the original error only if no
        // response materializes.
        let mut write_failed = false;
        {
            let span = TraceSpan::start(trace.as_ref(), "http11.send_request_headers", None);
            match self.write_all(&head, timeouts).await {
                Ok(()) => span.complete(None),
                Err(e @ Error::Write(_)) => {
                    write_failed = true;
                    span.failed(&e);
                }
                Err(e) => {
                    span.failed(&e);
                    return Err(e);
                }
            }
        }

        if !write_failed && !matches!(framing, SendFraming::None) {
            let span = TraceSpan::start(trace.as_ref(), "http11.send_request_body", None);
            match self.send_body(body, framing, timeouts).await {
                Ok(()) => span.complete(None),
                Err(e @ Error::Write(_)) => {
                    write_failed = true;
                    span.failed(&e);
                }
                Err(e) => {
                    span.failed(&e);
                    return Err(e);
                }
            }
        }

        let span = TraceSpan::start(trace.as_ref(), "http11.receive_response_headers", None);
        let parsed = self.receive_head(timeouts).await;
        let head = match parsed {
            Ok(head) => {
                span.complete(Some(&(head.status, head.version)));
                head
            }
            Err(e) => {
                span.failed(&e);
                return Err(e);
            }
        };

        // CONNECT and Upgrade surrender the raw stream; the connection
        // leaves the pool.
        let is_connect = method.eq_ignore_ascii_case(b"CONNECT");
        if head.status == 101 || (is_connect && (200..300).contains(&head.status)) {
            let (stream, leftover) = {
                let mut io = self.io.lock().await;
                let stream = io
                    .stream
                    .take()
                    .ok_or_else(|| Error::LocalProtocol("stream already surrendered".into()))?;
                (stream, io.buf.split().freeze())
            };
            self.state.lock().unwrap().phase = Phase::Closed;
            let mut response = Response::new(
                head.status,
                head.headers,
                ResponseBody::empty(),
                head.version,
            );
            response.reason_phrase = Some(head.reason);
            response.network_stream = Some(Box::new(UpgradeStream {
                stream,
                leading: leftover,
            }));
            return Ok(response);
        }

        let mode = h1_wire::recv_body_mode(&method, head.status, &head.headers)?;
        let must_close = h1_wire::connection_must_close(head.version, &headers, &head.headers)
            || mode == RecvBodyMode::CloseDelimited;

        let body = match mode {
            RecvBodyMode::None => {
                self.response_complete(must_close).await;
                emit_response_closed(trace.as_ref());
                ResponseBody::empty()
            }
            _ => {
                // A suppressed write error means the request was never
                // fully sent; stream the response but never reuse.
                ResponseBody::from_source(Box::new(H1BodyReader {
                    engine: self.clone(),
                    mode: ReaderMode::from(mode),
                    read_timeout: timeouts.read,
                    must_close: must_close || write_failed,
                    trace: trace.clone(),
                    lifecycle: ReaderLifecycle::Streaming,
                    started: false,
                }))
            }
        };

        let mut response = Response::new(head.status, head.headers, body, head.version);
        response.reason_phrase = Some(head.reason);
        Ok(response)
    }

    async fn write_all(&self, data: &[u8], timeouts: Timeouts) -> Result<(), Error> {
        let mut io = self.io.lock().await;
        let stream = io
            .stream
            .as_mut()
            .ok_or_else(|| Error::Write("stream closed".into()))?;
        stream.write(data, timeouts.write).await
    }

    async fn send_body(
        &self,
        body: &mut Body,
        framing: SendFraming,
        timeouts: Timeouts,
    ) -> Result<(), Error> {
        let chunked = framing == SendFraming::Chunked;
        while let Some(chunk) = body.next_chunk().await? {
            if chunk.is_empty() {
                continue;
            }
            if chunked {
                let mut framed = Vec::with_capacity(chunk.len() + 16);
                h1_wire::write_chunk(&mut framed, &chunk);
                self.write_all(&framed, timeouts).await?;
            } else {
                self.write_all(&chunk, timeouts).await?;
            }
        }
        if chunked {
            self.write_all(h1_wire::CHUNKED_END, timeouts).await?;
        }
        Ok(())
    }

    async fn receive_head(&self, timeouts: Timeouts) -> Result<h1_wire::ResponseHead, Error> {
        let mut io = self.io.lock().await;
        loop {
            let head_end = loop {
                if let Some(end) = h1_wire::find_head_end(&io.buf) {
                    break end;
                }
                if !read_more(&mut io, timeouts.read).await? {
                    if io.buf.is_empty() {
                        return Err(Error::RemoteProtocol(IDLE_CLOSE_MSG.into()));
                    }
                    return Err(Error::RemoteProtocol(
                        "connection closed mid response head".into(),
                    ));
                }
            };
            let head = h1_wire::parse_response_head(&io.buf[..head_end - 4])?;
            let _ = io.buf.split_to(head_end);
            // Interim responses other than 101 are consumed and skipped.
            if (100..200).contains(&head.status) && head.status != 101 {
                continue;
            }
            return Ok(head);
        }
    }

    /// Move the connection out of ACTIVE once the response cycle ends.
    async fn response_complete(&self, must_close: bool) {
        let close_now = {
            let mut state = self.state.lock().unwrap();
            if must_close || state.phase != Phase::Active {
                state.phase = Phase::Closed;
                true
            } else {
                state.phase = Phase::Idle;
                state.expire_at = self
                    .keepalive_expiry
                    .map(|keepalive| Instant::now() + keepalive);
                false
            }
        };
        if close_now {
            self.close_stream().await;
        }
    }

    pub async fn close(&self) {
        self.state.lock().unwrap().phase = Phase::Closed;
        self.close_stream().await;
    }

    async fn close_stream(&self) {
        let mut io = self.io.lock().await;
        if let Some(mut stream) = io.stream.take() {
            stream.close().await;
        }
    }

    /// Synchronous best-effort close for drop paths.
    pub(crate) fn close_on_drop(&self) {
        self.state.lock().unwrap().phase = Phase::Closed;
        if let Ok(mut io) = self.io.try_lock() {
            // Dropping the stream releases the socket.
            io.stream.take();
        }
    }

    // ── Pool-facing predicates ─────────────────────────────────────────

    pub fn can_handle(&self, origin: &Origin) -> bool {
        *origin == self.origin && !self.is_closed()
    }

    pub fn is_available(&self) -> bool {
        self.state.lock().unwrap().phase == Phase::Idle
    }

    pub fn is_idle(&self) -> bool {
        self.state.lock().unwrap().phase == Phase::Idle
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().phase == Phase::Closed
    }

    pub fn has_expired(&self) -> bool {
        let state = self.state.lock().unwrap();
        let keepalive_expired = state
            .expire_at
            .is_some_and(|at| Instant::now() > at);
        drop(state);
        if keepalive_expired {
            return true;
        }
        // An idle connection whose socket is readable can only be about
        // to report a server-initiated close.
        if self.is_idle() {
            if let Ok(io) = self.io.try_lock() {
                if io.stream.as_ref().is_some_and(|s| s.is_readable()) {
                    return true;
                }
            }
        }
        false
    }

    pub fn in_flight(&self) -> usize {
        usize::from(self.state.lock().unwrap().phase == Phase::Active)
    }

    pub fn request_count(&self) -> usize {
        self.state.lock().unwrap().request_count
    }

    pub fn info(&self) -> String {
        let state = self.state.lock().unwrap();
        format!(
            "{}, HTTP/1.1, {:?}, Request Count: {}",
            self.origin, state.phase, state.request_count
        )
    }
}

struct CancelGuard<'e> {
    engine: &'e Http11Engine,
}

impl Drop for CancelGuard<'_> {
    fn drop(&mut self) {
        self.engine.close_on_drop();
    }
}

async fn read_more(io: &mut IoState, timeout: Option<Duration>) -> Result<bool, Error> {
    let Some(stream) = io.stream.as_mut() else {
        return Ok(false);
    };
    let chunk = stream.read(READ_CHUNK, timeout).await?;
    if chunk.is_empty() {
        return Ok(false);
    }
    io.buf.extend_from_slice(&chunk);
    Ok(true)
}

fn emit_response_closed(trace: Option<&Arc<dyn TraceHook>>) {
    TraceSpan::start(trace, "http11.response_closed", None).complete(None);
}

// ── Response body streaming ────────────────────────────────────────────

enum ReaderMode {
    Sized { remaining: u64 },
    Chunked { decoder: ChunkDecoder },
    UntilClose,
}

impl From<RecvBodyMode> for ReaderMode {
    fn from(mode: RecvBodyMode) -> Self {
        match mode {
            RecvBodyMode::ContentLength(n) => ReaderMode::Sized { remaining: n },
            RecvBodyMode::Chunked => ReaderMode::Chunked {
                decoder: ChunkDecoder::new(),
            },
            RecvBodyMode::CloseDelimited | RecvBodyMode::None => ReaderMode::UntilClose,
        }
    }
}

#[derive(PartialEq)]
enum ReaderLifecycle {
    Streaming,
    Finished,
    Aborted,
}

struct H1BodyReader {
    engine: Arc<Http11Engine>,
    mode: ReaderMode,
    read_timeout: Option<Duration>,
    must_close: bool,
    trace: Option<Arc<dyn TraceHook>>,
    lifecycle: ReaderLifecycle,
    started: bool,
}

impl H1BodyReader {
    async fn finish(&mut self) {
        self.lifecycle = ReaderLifecycle::Finished;
        self.engine.response_complete(self.must_close).await;
        if self.started {
            TraceSpan::start(self.trace.as_ref(), "http11.receive_response_body", None)
                .complete(None);
        }
        emit_response_closed(self.trace.as_ref());
    }
}

#[async_trait]
impl ResponseBodySource for H1BodyReader {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, Error> {
        if self.lifecycle != ReaderLifecycle::Streaming {
            return Ok(None);
        }
        self.started = true;
        let mut io = self.engine.io.lock().await;
        loop {
            match &mut self.mode {
                ReaderMode::Sized { remaining } => {
                    if *remaining == 0 {
                        drop(io);
                        self.finish().await;
                        return Ok(None);
                    }
                    if io.buf.is_empty() && !read_more(&mut io, self.read_timeout).await? {
                        return Err(Error::RemoteProtocol(
                            "connection closed before the declared content length".into(),
                        ));
                    }
                    let take = (io.buf.len() as u64).min(*remaining) as usize;
                    let chunk = io.buf.split_to(take).freeze();
                    *remaining -= chunk.len() as u64;
                    if *remaining == 0 {
                        drop(io);
                        self.finish().await;
                    }
                    return Ok(Some(chunk));
                }
                ReaderMode::Chunked { decoder } => {
                    let (chunk, consumed, finished) = match decoder.step(&io.buf)? {
                        ChunkStep::NeedMore => {
                            if !read_more(&mut io, self.read_timeout).await? {
                                return Err(Error::RemoteProtocol(
                                    "connection closed mid chunked body".into(),
                                ));
                            }
                            continue;
                        }
                        ChunkStep::Payload { payload, consumed } => {
                            (Bytes::copy_from_slice(payload), consumed, false)
                        }
                        ChunkStep::Finished { consumed } => (Bytes::new(), consumed, true),
                    };
                    let _ = io.buf.split_to(consumed);
                    if finished {
                        drop(io);
                        self.finish().await;
                        return Ok(None);
                    }
                    if !chunk.is_empty() {
                        return Ok(Some(chunk));
                    }
                }
                ReaderMode::UntilClose => {
                    if !io.buf.is_empty() {
                        let chunk = io.buf.split().freeze();
                        return Ok(Some(chunk));
                    }
                    if !read_more(&mut io, self.read_timeout).await? {
                        drop(io);
                        // Close-delimited bodies end at EOF; the engine
                        // closes rather than returning to idle.
                        self.finish().await;
                        return Ok(None);
                    }
                }
            }
        }
    }

    async fn abort(&mut self) {
        if self.lifecycle == ReaderLifecycle::Streaming {
            self.lifecycle = ReaderLifecycle::Aborted;
            self.engine.close().await;
            emit_response_closed(self.trace.as_ref());
        }
    }
}

impl Drop for H1BodyReader {
    fn drop(&mut self) {
        if self.lifecycle == ReaderLifecycle::Streaming {
            self.engine.close_on_drop();
        }
    }
}

// ── Upgraded / tunnelled streams ───────────────────────────────────────

/// The raw stream surrendered by a 101 upgrade or a CONNECT response,
/// with any bytes over-read past the response head replayed first.
pub struct UpgradeStream {
    stream: Box<dyn NetworkStream>,
    leading: Bytes,
}

#[async_trait]
impl NetworkStream for UpgradeStream {
    async fn read(&mut self, max_bytes: usize, timeout: Option<Duration>) -> Result<Bytes, Error> {
        if !self.leading.is_empty() {
            let take = self.leading.len().min(max_bytes);
            return Ok(self.leading.split_to(take));
        }
        self.stream.read(max_bytes, timeout).await
    }

    async fn write(&mut self, data: &[u8], timeout: Option<Duration>) -> Result<(), Error> {
        self.stream.write(data, timeout).await
    }

    async fn close(&mut self) {
        self.stream.close().await;
    }

    async fn start_tls(
        self: Box<Self>,
        config: Arc<rustls::ClientConfig>,
        server_name: &str,
        timeout: Option<Duration>,
    ) -> Result<Box<dyn NetworkStream>, Error> {
        if !self.leading.is_empty() {
            return Err(Error::LocalProtocol(
                "cannot start TLS with unread bytes buffered".into(),
            ));
        }
        self.stream.start_tls(config, server_name, timeout).await
    }

    fn into_halves(self: Box<Self>) -> (Box<dyn ReadStream>, Box<dyn WriteStream>) {
        // The leading bytes must survive the split.
        let (read, write) = self.stream.into_halves();
        (
            Box::new(LeadingReadStream {
                leading: self.leading,
                read,
            }),
            write,
        )
    }

    fn negotiated_alpn(&self) -> Option<Vec<u8>> {
        self.stream.negotiated_alpn()
    }

    fn peer_addr(&self) -> Option<std::net::SocketAddr> {
        self.stream.peer_addr()
    }

    fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.stream.local_addr()
    }

    fn is_readable(&self) -> bool {
        !self.leading.is_empty() || self.stream.is_readable()
    }
}

struct LeadingReadStream {
    leading: Bytes,
    read: Box<dyn ReadStream>,
}

#[async_trait]
impl ReadStream for LeadingReadStream {
    async fn read(&mut self, max_bytes: usize, timeout: Option<Duration>) -> Result<Bytes, Error> {
        if !self.leading.is_empty() {
            let take = self.leading.len().min(max_bytes);
            return Ok(self.leading.split_to(take));
        }
        self.read.read(max_bytes, timeout).await
    }
}
