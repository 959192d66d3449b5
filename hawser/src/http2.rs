//! HTTP/2 request engine.
//!
//! One engine multiplexes many request streams over a single network
//! stream. The sans-IO [`ClientConnection`] holds all protocol state
//! behind a plain mutex; socket work is split between a writer lock and a
//! read gate. Whichever stream is waiting takes the read gate, pulls
//! bytes, feeds the state machine, and routes the resulting events into
//! per-stream inboxes before waking every other waiter — at any instant
//! there is exactly one demultiplexer.
//!
//! Lock order is `read gate → writer → connection state`; the state
//! mutex is a leaf and is never held across I/O.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use hawser_h2::{ClientConnection, ConnEvent, ErrorCode, Field, SettingsMap};

use crate::backend::{NetworkStream, ReadStream, WriteStream, READ_CHUNK};
use crate::body::{Body, ResponseBody, ResponseBodySource};
use crate::error::Error;
use crate::model::{header_value, Headers, HttpVersion, Origin, Timeouts, Url};
use crate::request::Request;
use crate::response::Response;
use crate::trace::{TraceHook, TraceSpan};

/// Headers that must not cross from HTTP/1.1 style into HTTP/2.
const HOP_BY_HOP: &[&[u8]] = &[
    b"host",
    b"connection",
    b"transfer-encoding",
    b"keep-alive",
    b"proxy-connection",
    b"upgrade",
];

enum StreamEvent {
    Headers {
        fields: Vec<Field>,
        end_stream: bool,
    },
    Data {
        data: Vec<u8>,
        end_stream: bool,
    },
    Trailers,
    Reset(ErrorCode),
    /// Connection-level failure fanned out to every open stream.
    Failed(String),
}

struct Meta {
    closed: bool,
    failed: Option<String>,
    request_count: usize,
    expire_at: Option<Instant>,
}

struct Shared {
    conn: Mutex<ClientConnection>,
    inboxes: Mutex<HashMap<u32, VecDeque<StreamEvent>>>,
    meta: Mutex<Meta>,
    writer: tokio::sync::Mutex<Box<dyn WriteStream>>,
    read_gate: tokio::sync::Mutex<Box<dyn ReadStream>>,
    wake: tokio::sync::Notify,
    keepalive_expiry: Option<Duration>,
}

impl Shared {
    /// Drain the connection's outbound buffer to the socket. Serialized
    /// by the writer lock so frame order matches queue order.
    async fn flush(&self, timeout: Option<Duration>) -> Result<(), Error> {
        let mut writer = self.writer.lock().await;
        let out = self.conn.lock().unwrap().take_outbound();
        if out.is_empty() {
            return Ok(());
        }
        writer.write(&out, timeout).await
    }

    /// One round of waiting: either become the demultiplexer and read, or
    /// sleep until the current one routes something and wakes us.
    ///
    /// `ready` is re-checked after acquiring the gate: the previous
    /// demultiplexer may have routed this caller's event already, and a
    /// read now could block on a socket with nothing more to say.
    async fn pump(
        &self,
        read_timeout: Option<Duration>,
        ready: impl Fn() -> bool,
    ) -> Result<(), Error> {
        let wake = self.wake.notified();
        tokio::pin!(wake);
        tokio::select! {
            mut read_half = self.read_gate.lock() => {
                if ready() || self.meta.lock().unwrap().failed.is_some() {
                    return Ok(());
                }
                match read_half.read(READ_CHUNK, read_timeout).await {
                    Ok(data) if data.is_empty() => {
                        self.fail("server closed the connection");
                        Ok(())
                    }
                    Ok(data) => self.route(&data, read_timeout).await,
                    Err(e) => {
                        self.fail(&e.to_string());
                        Err(e)
                    }
                }
            }
            _ = &mut wake => Ok(()),
        }
    }

    /// Feed received bytes and dispatch the resulting events.
    async fn route(&self, data: &[u8], timeout: Option<Duration>) -> Result<(), Error> {
        let events = {
            let mut conn = self.conn.lock().unwrap();
            if let Err(e) = conn.feed(data) {
                drop(conn);
                let e = Error::from(e);
                self.fail(&e.to_string());
                return Err(e);
            }
            let mut events = Vec::new();
            while let Some(event) = conn.next_event() {
                events.push(event);
            }
            events
        };

        {
            let mut inboxes = self.inboxes.lock().unwrap();
            for event in events {
                match event {
                    ConnEvent::ResponseHeaders {
                        stream_id,
                        fields,
                        end_stream,
                    } => {
                        if let Some(inbox) = inboxes.get_mut(&stream_id) {
                            inbox.push_back(StreamEvent::Headers { fields, end_stream });
                        }
                    }
                    ConnEvent::Data {
                        stream_id,
                        data,
                        end_stream,
                    } => {
                        if let Some(inbox) = inboxes.get_mut(&stream_id) {
                            inbox.push_back(StreamEvent::Data { data, end_stream });
                        }
                    }
                    ConnEvent::Trailers { stream_id, .. } => {
                        if let Some(inbox) = inboxes.get_mut(&stream_id) {
                            inbox.push_back(StreamEvent::Trailers);
                        }
                    }
                    ConnEvent::StreamReset { stream_id, code } => {
                        if let Some(inbox) = inboxes.get_mut(&stream_id) {
                            inbox.push_back(StreamEvent::Reset(code));
                        }
                    }
                    ConnEvent::GoAway { last_stream_id, .. } => {
                        tracing::debug!(target: "hawser", last_stream_id, "received GOAWAY");
                        // Streams the server never processed fail here;
                        // lower ones drain normally.
                        for (&sid, inbox) in inboxes.iter_mut() {
                            if sid > last_stream_id {
                                inbox.push_back(StreamEvent::Failed(
                                    "connection closing before stream was processed".into(),
                                ));
                            }
                        }
                    }
                    ConnEvent::RemoteSettings(_)
                    | ConnEvent::SettingsAcked
                    | ConnEvent::WindowAvailable { .. } => {}
                }
            }
        }

        // SETTINGS acks, PING acks and WINDOW_UPDATEs queued during feed.
        self.flush(timeout).await?;
        self.wake.notify_waiters();
        Ok(())
    }

    fn pop_event(&self, stream_id: u32) -> Option<StreamEvent> {
        if let Some(msg) = self.meta.lock().unwrap().failed.clone() {
            return Some(StreamEvent::Failed(msg));
        }
        self.inboxes
            .lock()
            .unwrap()
            .get_mut(&stream_id)
            .and_then(|inbox| inbox.pop_front())
    }

    fn has_event(&self, stream_id: u32) -> bool {
        self.inboxes
            .lock()
            .unwrap()
            .get(&stream_id)
            .is_some_and(|inbox| !inbox.is_empty())
    }

    /// Surface a reset or failure queued while the caller was sending.
    fn check_stream_alive(&self, stream_id: u32) -> Result<(), Error> {
        let mut inboxes = self.inboxes.lock().unwrap();
        let Some(inbox) = inboxes.get_mut(&stream_id) else {
            return Ok(());
        };
        let Some(at) = inbox
            .iter()
            .position(|e| matches!(e, StreamEvent::Reset(_) | StreamEvent::Failed(_)))
        else {
            return Ok(());
        };
        match inbox.remove(at) {
            Some(StreamEvent::Reset(code)) => Err(Error::RemoteProtocol(format!(
                "stream reset by peer: {code:?}"
            ))),
            Some(StreamEvent::Failed(msg)) => Err(Error::RemoteProtocol(msg)),
            _ => Ok(()),
        }
    }

    fn fail(&self, msg: &str) {
        {
            let mut meta = self.meta.lock().unwrap();
            if meta.failed.is_none() {
                meta.failed = Some(msg.to_string());
            }
        }
        self.wake.notify_waiters();
    }

    fn release_stream(&self, stream_id: u32) {
        {
            let mut conn = self.conn.lock().unwrap();
            conn.release_stream(stream_id);
        }
        let remaining = {
            let mut inboxes = self.inboxes.lock().unwrap();
            inboxes.remove(&stream_id);
            inboxes.len()
        };
        if remaining == 0 {
            let mut meta = self.meta.lock().unwrap();
            meta.expire_at = self
                .keepalive_expiry
                .map(|keepalive| Instant::now() + keepalive);
        }
        self.wake.notify_waiters();
    }

    async fn abort_stream(&self, stream_id: u32) {
        {
            let mut conn = self.conn.lock().unwrap();
            conn.reset_stream(stream_id, ErrorCode::Cancel);
        }
        let _ = self.flush(None).await;
        self.release_stream(stream_id);
    }
}

/// An HTTP/2 connection engine over one network stream.
pub struct Http2Engine {
    origin: Origin,
    shared: Arc<Shared>,
}

impl Http2Engine {
    /// Wrap an established stream: sends the connection preface and our
    /// SETTINGS immediately. Does not wait for the server's SETTINGS —
    /// requests may be sent straight away (RFC 7540 Section 3.5).
    pub async fn new(
        origin: Origin,
        stream: Box<dyn NetworkStream>,
        keepalive_expiry: Option<Duration>,
        request: &Request,
    ) -> Result<Self, Error> {
        let (read, write) = stream.into_halves();
        let shared = Arc::new(Shared {
            conn: Mutex::new(ClientConnection::new(SettingsMap::client())),
            inboxes: Mutex::new(HashMap::new()),
            meta: Mutex::new(Meta {
                closed: false,
                failed: None,
                request_count: 0,
                expire_at: None,
            }),
            writer: tokio::sync::Mutex::new(write),
            read_gate: tokio::sync::Mutex::new(read),
            wake: tokio::sync::Notify::new(),
            keepalive_expiry,
        });

        let span = TraceSpan::start(
            request.options.trace.as_ref(),
            "http2.send_connection_init",
            None,
        );
        match shared.flush(request.options.timeouts.write).await {
            Ok(()) => span.complete(None),
            Err(e) => {
                span.failed(&e);
                return Err(e);
            }
        }
        Ok(Self { origin, shared })
    }

    pub async fn handle_request(&self, request: &mut Request) -> Result<Response, Error> {
        {
            let mut meta = self.shared.meta.lock().unwrap();
            if meta.closed || meta.failed.is_some() {
                return Err(Error::ConnectionNotAvailable);
            }
            meta.request_count += 1;
            meta.expire_at = None;
        }

        let trace = request.options.trace.clone();
        let timeouts = request.options.timeouts;
        let end_on_headers = request.body.is_empty();
        let fields = request_fields(&request.method, &request.url, &request.headers);

        let stream_id = {
            let span = TraceSpan::start(trace.as_ref(), "http2.send_request_headers", None);
            let opened = self
                .shared
                .conn
                .lock()
                .unwrap()
                .open_stream(&fields, end_on_headers);
            let stream_id = match opened {
                Ok(id) => id,
                Err(e) => {
                    span.failed(&Error::from(e));
                    // The connection is merely exhausted or draining; the
                    // pool reschedules the ticket onto another one.
                    return Err(Error::ConnectionNotAvailable);
                }
            };
            self.shared
                .inboxes
                .lock()
                .unwrap()
                .insert(stream_id, VecDeque::new());
            match self.shared.flush(timeouts.write).await {
                Ok(()) => span.complete(Some(&stream_id)),
                Err(e) => {
                    span.failed(&e);
                    self.shared.fail(&e.to_string());
                    return Err(e);
                }
            }
            stream_id
        };

        // Cancellation before the body reader exists would strand the
        // stream's bookkeeping; dropping this future resets the stream
        // and lets the connection keep serving its other streams.
        let guard = StreamCancelGuard {
            shared: &self.shared,
            stream_id,
        };

        if !end_on_headers {
            let span = TraceSpan::start(trace.as_ref(), "http2.send_request_body", None);
            match self.send_body(stream_id, &mut request.body, timeouts).await {
                Ok(()) => span.complete(None),
                Err(e) => {
                    span.failed(&e);
                    std::mem::forget(guard);
                    self.shared.abort_stream(stream_id).await;
                    return Err(e);
                }
            }
        }

        let span = TraceSpan::start(trace.as_ref(), "http2.receive_response_headers", None);
        let (status, resp_headers, ended) = match self.receive_headers(stream_id, timeouts).await {
            Ok(parts) => {
                span.complete(Some(&parts.0));
                parts
            }
            Err(e) => {
                span.failed(&e);
                std::mem::forget(guard);
                self.shared.abort_stream(stream_id).await;
                return Err(e);
            }
        };
        std::mem::forget(guard);

        let body = if ended {
            self.shared.release_stream(stream_id);
            emit_response_closed(trace.as_ref());
            ResponseBody::empty()
        } else {
            ResponseBody::from_source(Box::new(H2BodyReader {
                shared: self.shared.clone(),
                stream_id,
                read_timeout: timeouts.read,
                trace: trace.clone(),
                lifecycle: ReaderLifecycle::Streaming,
            }))
        };

        let mut response = Response::new(status, resp_headers, body, HttpVersion::H2);
        response.stream_id = Some(stream_id);
        Ok(response)
    }

    async fn send_body(
        &self,
        stream_id: u32,
        body: &mut Body,
        timeouts: Timeouts,
    ) -> Result<(), Error> {
        while let Some(chunk) = body.next_chunk().await? {
            let mut rest: &[u8] = &chunk;
            while !rest.is_empty() {
                let capacity = self.wait_for_capacity(stream_id, timeouts).await?;
                let take = rest.len().min(capacity);
                {
                    let mut conn = self.shared.conn.lock().unwrap();
                    conn.send_data(stream_id, &rest[..take], false)?;
                }
                self.shared.flush(timeouts.write).await?;
                rest = &rest[take..];
            }
        }
        {
            let mut conn = self.shared.conn.lock().unwrap();
            conn.send_data(stream_id, &[], true)?;
        }
        self.shared.flush(timeouts.write).await
    }

    /// Block until the stream has outgoing window, pumping the connection
    /// while it waits for WINDOW_UPDATE.
    async fn wait_for_capacity(&self, stream_id: u32, timeouts: Timeouts) -> Result<usize, Error> {
        loop {
            self.shared.check_stream_alive(stream_id)?;
            let capacity = self.shared.conn.lock().unwrap().send_capacity(stream_id);
            if capacity > 0 {
                return Ok(capacity);
            }
            let shared = &self.shared;
            shared
                .pump(timeouts.read, || {
                    shared.has_event(stream_id)
                        || shared.conn.lock().unwrap().send_capacity(stream_id) > 0
                })
                .await?;
        }
    }

    async fn receive_headers(
        &self,
        stream_id: u32,
        timeouts: Timeouts,
    ) -> Result<(u16, Headers, bool), Error> {
        loop {
            let Some(event) = self.shared.pop_event(stream_id) else {
                let shared = &self.shared;
                shared
                    .pump(timeouts.read, || shared.has_event(stream_id))
                    .await?;
                continue;
            };
            match event {
                StreamEvent::Headers { fields, end_stream } => {
                    let mut status = 0u16;
                    let mut headers = Headers::new();
                    for field in fields {
                        if field.name == b":status" {
                            status = std::str::from_utf8(&field.value)
                                .ok()
                                .and_then(|s| s.parse().ok())
                                .ok_or_else(|| {
                                    Error::RemoteProtocol("malformed :status".into())
                                })?;
                        } else if !field.name.starts_with(b":") {
                            headers.push((Bytes::from(field.name), Bytes::from(field.value)));
                        }
                    }
                    if status == 0 {
                        return Err(Error::RemoteProtocol(
                            "response headers missing :status".into(),
                        ));
                    }
                    // Interim responses are skipped on HTTP/2 as well.
                    if (100..200).contains(&status) {
                        continue;
                    }
                    return Ok((status, headers, end_stream));
                }
                StreamEvent::Data { .. } | StreamEvent::Trailers => {
                    return Err(Error::RemoteProtocol("DATA before response headers".into()));
                }
                StreamEvent::Reset(code) => {
                    return Err(Error::RemoteProtocol(format!(
                        "stream reset by peer: {code:?}"
                    )));
                }
                StreamEvent::Failed(msg) => return Err(Error::RemoteProtocol(msg)),
            }
        }
    }

    pub async fn close(&self) {
        {
            let mut meta = self.shared.meta.lock().unwrap();
            if meta.closed {
                return;
            }
            meta.closed = true;
        }
        {
            let mut conn = self.shared.conn.lock().unwrap();
            conn.go_away(ErrorCode::NoError);
        }
        let _ = self.shared.flush(None).await;
        self.shared.writer.lock().await.close().await;
        self.shared.fail("connection closed");
    }

    pub(crate) fn close_on_drop(&self) {
        self.shared.meta.lock().unwrap().closed = true;
        self.shared.fail("connection closed");
    }

    // ── Pool-facing predicates ─────────────────────────────────────────

    pub fn can_handle(&self, origin: &Origin) -> bool {
        *origin == self.origin && !self.is_closed() && !self.is_exhausted()
    }

    pub fn is_available(&self) -> bool {
        if self.is_closed() {
            return false;
        }
        let conn = self.shared.conn.lock().unwrap();
        !conn.is_draining() && !conn.is_closed() && conn.remaining_streams() > 0
    }

    /// No more streams can ever be opened here.
    fn is_exhausted(&self) -> bool {
        let conn = self.shared.conn.lock().unwrap();
        conn.is_draining() || conn.is_closed()
    }

    pub fn is_idle(&self) -> bool {
        !self.is_closed() && self.in_flight() == 0
    }

    pub fn is_closed(&self) -> bool {
        let meta = self.shared.meta.lock().unwrap();
        meta.closed || meta.failed.is_some()
    }

    pub fn has_expired(&self) -> bool {
        let expired = {
            let meta = self.shared.meta.lock().unwrap();
            meta.expire_at.is_some_and(|at| Instant::now() > at)
        };
        expired && self.in_flight() == 0
    }

    pub fn in_flight(&self) -> usize {
        self.shared.inboxes.lock().unwrap().len()
    }

    pub fn request_count(&self) -> usize {
        self.shared.meta.lock().unwrap().request_count
    }

    pub fn info(&self) -> String {
        let phase = if self.is_closed() {
            "CLOSED"
        } else if self.in_flight() > 0 {
            "ACTIVE"
        } else {
            "IDLE"
        };
        format!(
            "{}, HTTP/2, {}, Request Count: {}, Streams: {}",
            self.origin,
            phase,
            self.request_count(),
            self.in_flight()
        )
    }
}

/// Pseudo-headers first, then the caller's headers lowercased with the
/// hop-by-hop set stripped.
pub(crate) fn request_fields(method: &[u8], url: &Url, headers: &Headers) -> Vec<Field> {
    let authority = match header_value(headers, b"host") {
        // An explicit Host header wins over the URL-derived authority.
        Some(host) => host.to_vec(),
        None => url.authority(),
    };
    let mut fields = Vec::with_capacity(headers.len() + 4);
    fields.push(Field::new(b":method".as_slice(), method.to_vec()));
    fields.push(Field::new(b":authority".as_slice(), authority));
    fields.push(Field::new(b":scheme".as_slice(), url.scheme.as_bytes()));
    fields.push(Field::new(b":path".as_slice(), url.target.to_vec()));
    for (name, value) in headers {
        let lower = name.to_ascii_lowercase();
        if HOP_BY_HOP.contains(&lower.as_slice()) {
            continue;
        }
        fields.push(Field::new(lower, value.to_vec()));
    }
    fields
}

fn emit_response_closed(trace: Option<&Arc<dyn TraceHook>>) {
    TraceSpan::start(trace, "http2.response_closed", None).complete(None);
}

struct StreamCancelGuard<'s> {
    shared: &'s Arc<Shared>,
    stream_id: u32,
}

impl Drop for StreamCancelGuard<'_> {
    fn drop(&mut self) {
        {
            let mut conn = self.shared.conn.lock().unwrap();
            conn.reset_stream(self.stream_id, ErrorCode::Cancel);
        }
        // The queued RST_STREAM goes out with the next flush.
        self.shared.release_stream(self.stream_id);
    }
}

// ── Response body streaming ────────────────────────────────────────────

#[derive(PartialEq)]
enum ReaderLifecycle {
    Streaming,
    Finished,
    Aborted,
}

struct H2BodyReader {
    shared: Arc<Shared>,
    stream_id: u32,
    read_timeout: Option<Duration>,
    trace: Option<Arc<dyn TraceHook>>,
    lifecycle: ReaderLifecycle,
}

impl H2BodyReader {
    fn finish(&mut self) {
        self.lifecycle = ReaderLifecycle::Finished;
        self.shared.release_stream(self.stream_id);
        emit_response_closed(self.trace.as_ref());
    }
}

#[async_trait]
impl ResponseBodySource for H2BodyReader {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, Error> {
        if self.lifecycle != ReaderLifecycle::Streaming {
            return Ok(None);
        }
        loop {
            let Some(event) = self.shared.pop_event(self.stream_id) else {
                let shared = &self.shared;
                let stream_id = self.stream_id;
                shared
                    .pump(self.read_timeout, || shared.has_event(stream_id))
                    .await?;
                continue;
            };
            match event {
                StreamEvent::Data { data, end_stream } => {
                    // Return window credit as the caller consumes.
                    {
                        let mut conn = self.shared.conn.lock().unwrap();
                        conn.acknowledge_read(self.stream_id, data.len() as u32);
                    }
                    self.shared.flush(self.read_timeout).await?;
                    if end_stream {
                        self.finish();
                    }
                    if data.is_empty() {
                        if end_stream {
                            return Ok(None);
                        }
                        continue;
                    }
                    return Ok(Some(Bytes::from(data)));
                }
                StreamEvent::Trailers => {
                    self.finish();
                    return Ok(None);
                }
                StreamEvent::Reset(code) => {
                    self.lifecycle = ReaderLifecycle::Aborted;
                    self.shared.release_stream(self.stream_id);
                    return Err(Error::RemoteProtocol(format!(
                        "stream reset by peer: {code:?}"
                    )));
                }
                StreamEvent::Failed(msg) => {
                    self.lifecycle = ReaderLifecycle::Aborted;
                    self.shared.release_stream(self.stream_id);
                    return Err(Error::RemoteProtocol(msg));
                }
                StreamEvent::Headers { end_stream, .. } => {
                    // Unexpected mid-body headers; tolerate, and end the
                    // stream if flagged.
                    if end_stream {
                        self.finish();
                        return Ok(None);
                    }
                }
            }
        }
    }

    async fn abort(&mut self) {
        if self.lifecycle == ReaderLifecycle::Streaming {
            self.lifecycle = ReaderLifecycle::Aborted;
            self.shared.abort_stream(self.stream_id).await;
            emit_response_closed(self.trace.as_ref());
        }
    }
}

impl Drop for H2BodyReader {
    fn drop(&mut self) {
        if self.lifecycle == ReaderLifecycle::Streaming {
            // No async teardown here; reset the bookkeeping so the
            // connection can keep serving its other streams.
            {
                let mut conn = self.shared.conn.lock().unwrap();
                conn.reset_stream(self.stream_id, ErrorCode::Cancel);
            }
            self.shared.release_stream(self.stream_id);
        }
    }
}
