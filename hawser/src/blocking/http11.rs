//! Blocking HTTP/1.1 request engine.
//!
//! The same state machine and framing rules as the async engine; socket
//! calls block the requesting thread instead of suspending a task.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};

use crate::backend::READ_CHUNK;
use crate::blocking::backend::{NetworkStream, ReadStream, WriteStream};
use crate::blocking::body::{Body, ResponseBody, ResponseBodySource};
use crate::blocking::{Request, Response};
use crate::error::Error;
use crate::h1_wire::{self, ChunkDecoder, ChunkStep, RecvBodyMode, SendFraming};
use crate::http11::IDLE_CLOSE_MSG;
use crate::model::{Origin, Timeouts};
use crate::trace::{TraceHook, TraceSpan};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
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
    stream: Option<Box<dyn NetworkStream>>,
    buf: BytesMut,
}

/// An HTTP/1.1 connection engine over one network stream.
pub struct Http11Engine {
    origin: Origin,
    keepalive_expiry: Option<Duration>,
    state: Mutex<State>,
    io: Mutex<IoState>,
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
            io: Mutex::new(IoState {
                stream: Some(stream),
                buf: BytesMut::new(),
            }),
        }
    }

    pub fn handle_request(self: &Arc<Self>, request: &mut Request) -> Result<Response, Error> {
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
        match self.drive(request) {
            Ok(response) => Ok(response),
            Err(e) => {
                self.close();
                Err(e)
            }
        }
    }

    fn drive(self: &Arc<Self>, request: &mut Request) -> Result<Response, Error> {
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

        // Suppress plain write errors and try to read the response: the
        // server may have rejected the request with a well-formed error.
        let mut write_failed = false;
        {
            let span = TraceSpan::start(trace.as_ref(), "http11.send_request_headers", None);
            match self.write_all(&head, timeouts) {
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
            match self.send_body(body, framing, timeouts) {
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
        let head = match self.receive_head(timeouts) {
            Ok(head) => {
                span.complete(Some(&(head.status, head.version)));
                head
            }
            Err(e) => {
                span.failed(&e);
                return Err(e);
            }
        };

        let is_connect = method.eq_ignore_ascii_case(b"CONNECT");
        if head.status == 101 || (is_connect && (200..300).contains(&head.status)) {
            let (stream, leftover) = {
                let mut io = self.io.lock().unwrap();
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
                self.response_complete(must_close);
                emit_response_closed(trace.as_ref());
                ResponseBody::empty()
            }
            _ => ResponseBody::from_source(Box::new(H1BodyReader {
                engine: self.clone(),
                mode: ReaderMode::from(mode),
                read_timeout: timeouts.read,
                must_close: must_close || write_failed,
                trace: trace.clone(),
                lifecycle: ReaderLifecycle::Streaming,
                started: false,
            })),
        };

        let mut response = Response::new(head.status, head.headers, body, head.version);
        response.reason_phrase = Some(head.reason);
        Ok(response)
    }

    fn write_all(&self, data: &[u8], timeouts: Timeouts) -> Result<(), Error> {
        let mut io = self.io.lock().unwrap();
        let stream = io
            .stream
            .as_mut()
            .ok_or_else(|| Error::Write("stream closed".into()))?;
        stream.write(data, timeouts.write)
    }

    fn send_body(&self, body: &mut Body, framing: SendFraming, timeouts: Timeouts) -> Result<(), Error> {
        let chunked = framing == SendFraming::Chunked;
        while let Some(chunk) = body.next_chunk()? {
            if chunk.is_empty() {
                continue;
            }
            if chunked {
                let mut framed = Vec::with_capacity(chunk.len() + 16);
                h1_wire::write_chunk(&mut framed, &chunk);
                self.write_all(&framed, timeouts)?;
            } else {
                self.write_all(&chunk, timeouts)?;
            }
        }
        if chunked {
            self.write_all(h1_wire::CHUNKED_END, timeouts)?;
        }
        Ok(())
    }

    fn receive_head(&self, timeouts: Timeouts) -> Result<h1_wire::ResponseHead, Error> {
        let mut io = self.io.lock().unwrap();
        loop {
            let head_end = loop {
                if let Some(end) = h1_wire::find_head_end(&io.buf) {
                    break end;
                }
                if !read_more(&mut io, timeouts.read)? {
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
            if (100..200).contains(&head.status) && head.status != 101 {
                continue;
            }
            return Ok(head);
        }
    }

    fn response_complete(&self, must_close: bool) {
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
            self.close_stream();
        }
    }

    pub fn close(&self) {
        self.state.lock().unwrap().phase = Phase::Closed;
        self.close_stream();
    }

    fn close_stream(&self) {
        let mut io = self.io.lock().unwrap();
        if let Some(mut stream) = io.stream.take() {
            stream.close();
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
        let keepalive_expired = {
            let state = self.state.lock().unwrap();
            state.expire_at.is_some_and(|at| Instant::now() > at)
        };
        if keepalive_expired {
            return true;
        }
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

fn read_more(io: &mut IoState, timeout: Option<Duration>) -> Result<bool, Error> {
    let Some(stream) = io.stream.as_mut() else {
        return Ok(false);
    };
    let chunk = stream.read(READ_CHUNK, timeout)?;
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
    fn finish(&mut self) {
        self.lifecycle = ReaderLifecycle::Finished;
        self.engine.response_complete(self.must_close);
        if self.started {
            TraceSpan::start(self.trace.as_ref(), "http11.receive_response_body", None)
                .complete(None);
        }
        emit_response_closed(self.trace.as_ref());
    }
}

impl ResponseBodySource for H1BodyReader {
    fn next_chunk(&mut self) -> Result<Option<Bytes>, Error> {
        if self.lifecycle != ReaderLifecycle::Streaming {
            return Ok(None);
        }
        self.started = true;
        let mut io = self.engine.io.lock().unwrap();
        loop {
            match &mut self.mode {
                ReaderMode::Sized { remaining } => {
                    if *remaining == 0 {
                        drop(io);
                        self.finish();
                        return Ok(None);
                    }
                    if io.buf.is_empty() && !read_more(&mut io, self.read_timeout)? {
                        return Err(Error::RemoteProtocol(
                            "connection closed before the declared content length".into(),
                        ));
                    }
                    let take = (io.buf.len() as u64).min(*remaining) as usize;
                    let chunk = io.buf.split_to(take).freeze();
                    *remaining -= chunk.len() as u64;
                    if *remaining == 0 {
                        drop(io);
                        self.finish();
                    }
                    return Ok(Some(chunk));
                }
                ReaderMode::Chunked { decoder } => {
                    let (chunk, consumed, finished) = match decoder.step(&io.buf)? {
                        ChunkStep::NeedMore => {
                            if !read_more(&mut io, self.read_timeout)? {
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
                        self.finish();
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
                    if !read_more(&mut io, self.read_timeout)? {
                        drop(io);
                        self.finish();
                        return Ok(None);
                    }
                }
            }
        }
    }

    fn abort(&mut self) {
        if self.lifecycle == ReaderLifecycle::Streaming {
            self.lifecycle = ReaderLifecycle::Aborted;
            self.engine.close();
            emit_response_closed(self.trace.as_ref());
        }
    }
}

impl Drop for H1BodyReader {
    fn drop(&mut self) {
        if self.lifecycle == ReaderLifecycle::Streaming {
            self.engine.close();
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

impl NetworkStream for UpgradeStream {
    fn read(&mut self, max_bytes: usize, timeout: Option<Duration>) -> Result<Bytes, Error> {
        if !self.leading.is_empty() {
            let take = self.leading.len().min(max_bytes);
            return Ok(self.leading.split_to(take));
        }
        self.stream.read(max_bytes, timeout)
    }

    fn write(&mut self, data: &[u8], timeout: Option<Duration>) -> Result<(), Error> {
        self.stream.write(data, timeout)
    }

    fn close(&mut self) {
        self.stream.close();
    }

    fn start_tls(
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
        self.stream.start_tls(config, server_name, timeout)
    }

    fn into_halves(self: Box<Self>) -> (Box<dyn ReadStream>, Box<dyn WriteStream>) {
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

impl ReadStream for LeadingReadStream {
    fn read(&mut self, max_bytes: usize, timeout: Option<Duration>) -> Result<Bytes, Error> {
        if !self.leading.is_empty() {
            let take = self.leading.len().min(max_bytes);
            return Ok(self.leading.split_to(take));
        }
        self.read.read(max_bytes, timeout)
    }
}
