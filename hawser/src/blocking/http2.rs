//! Blocking HTTP/2 request engine.
//!
//! The same multiplexing design as the async engine. Waiting threads
//! block on the read-gate mutex itself: whoever acquires it first is the
//! demultiplexer, and every thread re-checks its stream's inbox after
//! the gate changes hands. The sans-IO [`ClientConnection`] behind a
//! plain mutex is shared with the async surface.
//!
//! Lock order is `read gate → writer → connection state`.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use hawser_h2::{ClientConnection, ConnEvent, ErrorCode, SettingsMap};

use crate::backend::READ_CHUNK;
use crate::blocking::backend::{NetworkStream, ReadStream, WriteStream};
use crate::blocking::body::{Body, ResponseBody, ResponseBodySource};
use crate::blocking::{Request, Response};
use crate::error::Error;
use crate::http2::request_fields;
use crate::model::{Headers, HttpVersion, Origin, Timeouts};
use crate::trace::{TraceHook, TraceSpan};

enum StreamEvent {
    Headers {
        fields: Vec<hawser_h2::Field>,
        end_stream: bool,
    },
    Data {
        data: Vec<u8>,
        end_stream: bool,
    },
    Trailers,
    Reset(ErrorCode),
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
    writer: Mutex<Box<dyn WriteStream>>,
    read_gate: Mutex<Box<dyn ReadStream>>,
    keepalive_expiry: Option<Duration>,
}

impl Shared {
    fn flush(&self, timeout: Option<Duration>) -> Result<(), Error> {
        let mut writer = self.writer.lock().unwrap();
        let out = self.conn.lock().unwrap().take_outbound();
        if out.is_empty() {
            return Ok(());
        }
        writer.write(&out, timeout)
    }

    /// One round of waiting: take the read gate and demultiplex. The
    /// mutex itself is the queue — a thread blocked on `lock()` resumes
    /// when the current demultiplexer finishes, re-checks `ready`, and
    /// either returns or reads next.
    fn pump(&self, read_timeout: Option<Duration>, ready: impl Fn() -> bool) -> Result<(), Error> {
        let mut read_half = self.read_gate.lock().unwrap();
        if ready() || self.meta.lock().unwrap().failed.is_some() {
            return Ok(());
        }
        match read_half.read(READ_CHUNK, read_timeout) {
            Ok(data) if data.is_empty() => {
                self.fail("server closed the connection");
                Ok(())
            }
            Ok(data) => self.route(&data, read_timeout),
            Err(e) => {
                self.fail(&e.to_string());
                Err(e)
            }
        }
    }

    fn route(&self, data: &[u8], timeout: Option<Duration>) -> Result<(), Error> {
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

        self.flush(timeout)?;
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
    }

    fn abort_stream(&self, stream_id: u32) {
        {
            let mut conn = self.conn.lock().unwrap();
            conn.reset_stream(stream_id, ErrorCode::Cancel);
        }
        let _ = self.flush(None);
        self.release_stream(stream_id);
    }
}

/// An HTTP/2 connection engine over one network stream.
pub struct Http2Engine {
    origin: Origin,
    shared: Arc<Shared>,
}

impl Http2Engine {
    /// Wrap an established stream, sending the connection preface and
    /// our SETTINGS immediately.
    pub fn new(
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
            writer: Mutex::new(write),
            read_gate: Mutex::new(read),
            keepalive_expiry,
        });

        let span = TraceSpan::start(
            request.options.trace.as_ref(),
            "http2.send_connection_init",
            None,
        );
        match shared.flush(request.options.timeouts.write) {
            Ok(()) => span.complete(None),
            Err(e) => {
                span.failed(&e);
                return Err(e);
            }
        }
        Ok(Self { origin, shared })
    }

    pub fn handle_request(&self, request: &mut Request) -> Result<Response, Error> {
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
                    return Err(Error::ConnectionNotAvailable);
                }
            };
            self.shared
                .inboxes
                .lock()
                .unwrap()
                .insert(stream_id, VecDeque::new());
            match self.shared.flush(timeouts.write) {
                Ok(()) => span.complete(Some(&stream_id)),
                Err(e) => {
                    span.failed(&e);
                    self.shared.fail(&e.to_string());
                    return Err(e);
                }
            }
            stream_id
        };

        if !end_on_headers {
            let span = TraceSpan::start(trace.as_ref(), "http2.send_request_body", None);
            match self.send_body(stream_id, &mut request.body, timeouts) {
                Ok(()) => span.complete(None),
                Err(e) => {
                    span.failed(&e);
                    self.shared.abort_stream(stream_id);
                    return Err(e);
                }
            }
        }

        let span = TraceSpan::start(trace.as_ref(), "http2.receive_response_headers", None);
        let (status, resp_headers, ended) = match self.receive_headers(stream_id, timeouts) {
            Ok(parts) => {
                span.complete(Some(&parts.0));
                parts
            }
            Err(e) => {
                span.failed(&e);
                self.shared.abort_stream(stream_id);
                return Err(e);
            }
        };

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

    fn send_body(&self, stream_id: u32, body: &mut Body, timeouts: Timeouts) -> Result<(), Error> {
        while let Some(chunk) = body.next_chunk()? {
            let mut rest: &[u8] = &chunk;
            while !rest.is_empty() {
                let capacity = self.wait_for_capacity(stream_id, timeouts)?;
                let take = rest.len().min(capacity);
                {
                    let mut conn = self.shared.conn.lock().unwrap();
                    conn.send_data(stream_id, &rest[..take], false)?;
                }
                self.shared.flush(timeouts.write)?;
                rest = &rest[take..];
            }
        }
        {
            let mut conn = self.shared.conn.lock().unwrap();
            conn.send_data(stream_id, &[], true)?;
        }
        self.shared.flush(timeouts.write)
    }

    fn wait_for_capacity(&self, stream_id: u32, timeouts: Timeouts) -> Result<usize, Error> {
        loop {
            self.shared.check_stream_alive(stream_id)?;
            let capacity = self.shared.conn.lock().unwrap().send_capacity(stream_id);
            if capacity > 0 {
                return Ok(capacity);
            }
            let shared = &self.shared;
            shared.pump(timeouts.read, || {
                shared.has_event(stream_id)
                    || shared.conn.lock().unwrap().send_capacity(stream_id) > 0
            })?;
        }
    }

    fn receive_headers(
        &self,
        stream_id: u32,
        timeouts: Timeouts,
    ) -> Result<(u16, Headers, bool), Error> {
        loop {
            let Some(event) = self.shared.pop_event(stream_id) else {
                let shared = &self.shared;
                shared.pump(timeouts.read, || shared.has_event(stream_id))?;
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

    pub fn close(&self) {
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
        let _ = self.shared.flush(None);
        self.shared.writer.lock().unwrap().close();
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

fn emit_response_closed(trace: Option<&Arc<dyn TraceHook>>) {
    TraceSpan::start(trace, "http2.response_closed", None).complete(None);
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

impl ResponseBodySource for H2BodyReader {
    fn next_chunk(&mut self) -> Result<Option<Bytes>, Error> {
        if self.lifecycle != ReaderLifecycle::Streaming {
            return Ok(None);
        }
        loop {
            let Some(event) = self.shared.pop_event(self.stream_id) else {
                let shared = &self.shared;
                let stream_id = self.stream_id;
                shared.pump(self.read_timeout, || shared.has_event(stream_id))?;
                continue;
            };
            match event {
                StreamEvent::Data { data, end_stream } => {
                    {
                        let mut conn = self.shared.conn.lock().unwrap();
                        conn.acknowledge_read(self.stream_id, data.len() as u32);
                    }
                    self.shared.flush(self.read_timeout)?;
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
                    if end_stream {
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
            self.shared.abort_stream(self.stream_id);
            emit_response_closed(self.trace.as_ref());
        }
    }
}

impl Drop for H2BodyReader {
    fn drop(&mut self) {
        if self.lifecycle == ReaderLifecycle::Streaming {
            {
                let mut conn = self.shared.conn.lock().unwrap();
                conn.reset_stream(self.stream_id, ErrorCode::Cancel);
            }
            self.shared.release_stream(self.stream_id);
        }
    }
}
