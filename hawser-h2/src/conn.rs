//! Client connection state machine.
//!
//! `ClientConnection` is pure sans-IO: the transport feeds received bytes
//! in with [`ClientConnection::feed`], drains queued protocol output with
//! [`ClientConnection::take_outbound`], and collects decoded activity with
//! [`ClientConnection::next_event`]. All waiting, locking and socket work
//! belongs to the caller.

use std::collections::{HashMap, VecDeque};

use crate::error::{ErrorCode, FrameLayerError};
use crate::flow::{Window, INITIAL_WINDOW};
use crate::frame::Frame;
use crate::hpack::{Decoder, Encoder, Field};
use crate::settings::SettingsMap;
use crate::stream::{StreamPhase, StreamRecord};

/// The fixed client preface (RFC 7540 Section 3.5).
pub const PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Decoded activity surfaced to the driving engine.
#[derive(Debug)]
pub enum ConnEvent {
    /// The peer's initial or updated SETTINGS were applied.
    RemoteSettings(SettingsMap),
    /// The peer acknowledged our SETTINGS; the connection is usable.
    SettingsAcked,
    /// Response HEADERS for a stream.
    ResponseHeaders {
        stream_id: u32,
        fields: Vec<Field>,
        end_stream: bool,
    },
    /// Response body bytes for a stream.
    Data {
        stream_id: u32,
        data: Vec<u8>,
        end_stream: bool,
    },
    /// Trailing headers for a stream.
    Trailers { stream_id: u32, fields: Vec<Field> },
    /// The peer reset a stream.
    StreamReset { stream_id: u32, code: ErrorCode },
    /// The peer is shutting the connection down; streams above
    /// `last_stream_id` were never processed.
    GoAway {
        last_stream_id: u32,
        code: ErrorCode,
        debug_data: Vec<u8>,
    },
    /// More send window became available for a stream (or for all, when
    /// the connection-level window grew).
    WindowAvailable { stream_id: Option<u32> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Preface sent, waiting for the server SETTINGS.
    Handshaking,
    Active,
    /// GOAWAY seen or sent; existing streams drain, new ones are refused.
    Draining,
    Closed,
}

pub struct ClientConnection {
    phase: Phase,
    local: SettingsMap,
    remote: SettingsMap,
    streams: HashMap<u32, StreamRecord>,
    next_stream_id: u32,

    conn_recv: Window,
    conn_send: Window,
    /// Connection-level bytes consumed by the caller but not yet returned
    /// to the peer via WINDOW_UPDATE.
    unacked_conn: u32,

    encoder: Encoder,
    decoder: Decoder,

    /// Stream currently mid header block; until END_HEADERS only
    /// CONTINUATION frames for it are legal.
    open_block: Option<u32>,
    /// Header fragments for streams we no longer track. The block still
    /// has to run through the decoder to keep its dynamic table in sync.
    orphan_fragments: Vec<u8>,

    inbound: Vec<u8>,
    outbound: Vec<u8>,
    events: VecDeque<ConnEvent>,
}

impl ClientConnection {
    /// Build a connection and queue the preface, our SETTINGS, and any
    /// initial connection-window enlargement into the outbound buffer.
    pub fn new(local: SettingsMap) -> Self {
        let mut outbound = Vec::with_capacity(PREFACE.len() + 64);
        outbound.extend_from_slice(PREFACE);
        Frame::Settings {
            ack: false,
            map: local.clone(),
        }
        .write(&mut outbound);

        let recv_target = i64::from(local.initial_window_size);
        if recv_target > INITIAL_WINDOW {
            Frame::WindowUpdate {
                stream_id: 0,
                increment: (recv_target - INITIAL_WINDOW) as u32,
            }
            .write(&mut outbound);
        }

        let decoder_capacity = local.header_table_size as usize;
        Self {
            phase: Phase::Handshaking,
            decoder: Decoder::new(decoder_capacity),
            encoder: Encoder::new(4096),
            local,
            remote: SettingsMap::default(),
            streams: HashMap::new(),
            next_stream_id: 1,
            conn_recv: Window::new(recv_target),
            conn_send: Window::default(),
            unacked_conn: 0,
            open_block: None,
            orphan_fragments: Vec::new(),
            inbound: Vec::new(),
            outbound,
            events: VecDeque::new(),
        }
    }

    // ── Transport-facing surface ───────────────────────────────────────

    /// Feed bytes received from the transport.
    ///
    /// A returned error is connection-fatal: the caller must stop using
    /// the connection and close the transport.
    pub fn feed(&mut self, data: &[u8]) -> Result<(), FrameLayerError> {
        self.inbound.extend_from_slice(data);
        loop {
            match Frame::split(&self.inbound, self.local.max_frame_size) {
                Ok(Some((frame, used))) => {
                    self.inbound.drain(..used);
                    self.apply(frame)?;
                }
                Ok(None) => return Ok(()),
                Err(e) => {
                    self.phase = Phase::Closed;
                    return Err(e);
                }
            }
        }
    }

    /// Drain bytes queued for the transport.
    pub fn take_outbound(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.outbound)
    }

    pub fn has_outbound(&self) -> bool {
        !self.outbound.is_empty()
    }

    pub fn next_event(&mut self) -> Option<ConnEvent> {
        self.events.pop_front()
    }

    // ── Request-facing surface ─────────────────────────────────────────

    /// Whether the SETTINGS exchange completed and new streams are admitted.
    pub fn is_ready(&self) -> bool {
        self.phase == Phase::Active
    }

    pub fn is_closed(&self) -> bool {
        self.phase == Phase::Closed
    }

    /// Draining means GOAWAY was seen: existing streams finish, new
    /// streams are refused.
    pub fn is_draining(&self) -> bool {
        self.phase == Phase::Draining
    }

    pub fn remote_settings(&self) -> &SettingsMap {
        &self.remote
    }

    /// Streams currently tracked (open in any non-terminal phase).
    pub fn active_streams(&self) -> usize {
        self.streams.values().filter(|s| !s.is_closed()).count()
    }

    /// How many more streams the peer permits us to open right now.
    pub fn remaining_streams(&self) -> u32 {
        let limit = self.remote.max_concurrent_streams.unwrap_or(u32::MAX);
        limit.saturating_sub(self.active_streams() as u32)
    }

    /// Open a stream by sending its HEADERS frame. Returns the stream id.
    pub fn open_stream(
        &mut self,
        fields: &[Field],
        end_stream: bool,
    ) -> Result<u32, FrameLayerError> {
        match self.phase {
            Phase::Active | Phase::Handshaking => {}
            Phase::Draining | Phase::Closed => {
                return Err(FrameLayerError::Connection(ErrorCode::RefusedStream))
            }
        }
        if self.remaining_streams() == 0 {
            return Err(FrameLayerError::Connection(ErrorCode::RefusedStream));
        }
        if self.next_stream_id > 0x7fff_ffff {
            return Err(FrameLayerError::StreamIdsExhausted);
        }
        let stream_id = self.next_stream_id;
        self.next_stream_id += 2;

        let mut block = Vec::new();
        self.encoder.encode_block(fields, &mut block);
        Frame::Headers {
            stream_id,
            block,
            end_stream,
            end_headers: true,
            dependency: None,
        }
        .write(&mut self.outbound);

        self.streams.insert(
            stream_id,
            StreamRecord::open(
                i64::from(self.local.initial_window_size),
                i64::from(self.remote.initial_window_size),
                end_stream,
            ),
        );
        Ok(stream_id)
    }

    /// Bytes of DATA that may be sent on `stream_id` without violating
    /// flow control, bounded by the peer's maximum frame size.
    pub fn send_capacity(&self, stream_id: u32) -> usize {
        let Some(stream) = self.streams.get(&stream_id) else {
            return 0;
        };
        let window = self
            .conn_send
            .available()
            .min(stream.send_window.available())
            .max(0);
        (window as u64).min(u64::from(self.remote.max_frame_size)) as usize
    }

    /// Send a DATA frame. `data` must fit within [`Self::send_capacity`].
    pub fn send_data(
        &mut self,
        stream_id: u32,
        data: &[u8],
        end_stream: bool,
    ) -> Result<(), FrameLayerError> {
        let stream = self
            .streams
            .get_mut(&stream_id)
            .ok_or(FrameLayerError::Stream(stream_id, ErrorCode::StreamClosed))?;
        match stream.phase {
            StreamPhase::Open | StreamPhase::HalfClosedRemote => {}
            _ => return Err(FrameLayerError::Stream(stream_id, ErrorCode::StreamClosed)),
        }
        if !data.is_empty() {
            stream.send_window.debit(data.len() as u32)?;
            self.conn_send.debit(data.len() as u32)?;
        }
        if end_stream {
            stream.local_closed();
        }
        Frame::Data {
            stream_id,
            payload: data.to_vec(),
            end_stream,
            flow_len: data.len() as u32,
        }
        .write(&mut self.outbound);
        Ok(())
    }

    /// Report that the caller consumed `n` body bytes on `stream_id`.
    ///
    /// Window credit is returned to the peer once half the configured
    /// window has been consumed, so WINDOW_UPDATE tracks the rate at which
    /// the application drains the body rather than the rate of arrival.
    pub fn acknowledge_read(&mut self, stream_id: u32, n: u32) {
        if n == 0 {
            return;
        }
        let target = self.local.initial_window_size;

        self.unacked_conn = self.unacked_conn.saturating_add(n);
        if self.unacked_conn >= target / 2 {
            let increment = self.unacked_conn;
            if self.conn_recv.credit(increment).is_ok() {
                Frame::WindowUpdate {
                    stream_id: 0,
                    increment,
                }
                .write(&mut self.outbound);
            }
            self.unacked_conn = 0;
        }

        if let Some(stream) = self.streams.get_mut(&stream_id) {
            stream.unacked_recv = stream.unacked_recv.saturating_add(n);
            let suspended = matches!(
                stream.phase,
                StreamPhase::HalfClosedRemote | StreamPhase::Closed
            );
            if !suspended && stream.unacked_recv >= target / 2 {
                let increment = stream.unacked_recv;
                if stream.recv_window.credit(increment).is_ok() {
                    Frame::WindowUpdate {
                        stream_id,
                        increment,
                    }
                    .write(&mut self.outbound);
                }
                stream.unacked_recv = 0;
            }
        }
    }

    /// Abort a stream with RST_STREAM.
    pub fn reset_stream(&mut self, stream_id: u32, code: ErrorCode) {
        Frame::RstStream { stream_id, code }.write(&mut self.outbound);
        if let Some(stream) = self.streams.get_mut(&stream_id) {
            stream.phase = StreamPhase::Closed;
        }
    }

    /// Send GOAWAY and stop admitting new streams.
    pub fn go_away(&mut self, code: ErrorCode) {
        Frame::GoAway {
            last_stream_id: 0,
            code,
            debug_data: Vec::new(),
        }
        .write(&mut self.outbound);
        if self.phase != Phase::Closed {
            self.phase = Phase::Draining;
        }
    }

    /// Drop bookkeeping for a finished stream.
    pub fn release_stream(&mut self, stream_id: u32) {
        self.streams.remove(&stream_id);
    }

    // ── Frame handling ─────────────────────────────────────────────────

    fn apply(&mut self, frame: Frame) -> Result<(), FrameLayerError> {
        if let Some(expected) = self.open_block {
            match &frame {
                Frame::Continuation { stream_id, .. } if *stream_id == expected => {}
                _ => {
                    self.phase = Phase::Closed;
                    return Err(FrameLayerError::Protocol(
                        "header block interrupted by another frame".into(),
                    ));
                }
            }
        }

        match frame {
            Frame::Settings { ack, map } => self.on_settings(ack, map),
            Frame::Headers {
                stream_id,
                block,
                end_stream,
                end_headers,
                ..
            } => self.on_headers(stream_id, block, end_stream, end_headers),
            Frame::Continuation {
                stream_id,
                block,
                end_headers,
            } => self.on_continuation(stream_id, block, end_headers),
            Frame::Data {
                stream_id,
                payload,
                end_stream,
                flow_len,
            } => self.on_data(stream_id, payload, end_stream, flow_len),
            Frame::WindowUpdate {
                stream_id,
                increment,
            } => self.on_window_update(stream_id, increment),
            Frame::RstStream { stream_id, code } => {
                if let Some(stream) = self.streams.get_mut(&stream_id) {
                    stream.phase = StreamPhase::Closed;
                }
                self.events
                    .push_back(ConnEvent::StreamReset { stream_id, code });
                Ok(())
            }
            Frame::Ping { ack, payload } => {
                if !ack {
                    Frame::Ping { ack: true, payload }.write(&mut self.outbound);
                }
                Ok(())
            }
            Frame::GoAway {
                last_stream_id,
                code,
                debug_data,
            } => {
                if self.phase != Phase::Closed {
                    self.phase = Phase::Draining;
                }
                self.events.push_back(ConnEvent::GoAway {
                    last_stream_id,
                    code,
                    debug_data,
                });
                Ok(())
            }
            Frame::PushPromise {
                promised_id, ..
            } => {
                // Push is disabled in our SETTINGS; refuse anything the
                // peer promises anyway.
                Frame::RstStream {
                    stream_id: promised_id,
                    code: ErrorCode::RefusedStream,
                }
                .write(&mut self.outbound);
                Ok(())
            }
            Frame::Priority { .. } | Frame::Unknown { .. } => Ok(()),
        }
    }

    fn on_settings(&mut self, ack: bool, map: SettingsMap) -> Result<(), FrameLayerError> {
        if ack {
            self.events.push_back(ConnEvent::SettingsAcked);
            return Ok(());
        }

        let delta =
            i64::from(map.initial_window_size) - i64::from(self.remote.initial_window_size);
        self.remote = map;

        // The peer's header-table setting caps our encoder's table.
        self.encoder
            .set_capacity((self.remote.header_table_size as usize).min(4096));

        if delta != 0 {
            for stream in self.streams.values_mut() {
                if !stream.is_closed() {
                    stream.send_window.shift(delta)?;
                }
            }
            if delta > 0 {
                self.events
                    .push_back(ConnEvent::WindowAvailable { stream_id: None });
            }
        }

        Frame::Settings {
            ack: true,
            map: SettingsMap::default(),
        }
        .write(&mut self.outbound);

        if self.phase == Phase::Handshaking {
            self.phase = Phase::Active;
        }
        self.events
            .push_back(ConnEvent::RemoteSettings(self.remote.clone()));
        Ok(())
    }

    fn on_headers(
        &mut self,
        stream_id: u32,
        block: Vec<u8>,
        end_stream: bool,
        end_headers: bool,
    ) -> Result<(), FrameLayerError> {
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            if end_headers {
                self.decoder.decode_block(&block)?;
            } else {
                self.orphan_fragments = block;
                self.open_block = Some(stream_id);
            }
            return Ok(());
        };

        if end_headers {
            let mut full = std::mem::take(&mut stream.header_fragments);
            full.extend_from_slice(&block);
            self.finish_block(stream_id, &full, end_stream)
        } else {
            stream.header_fragments.extend_from_slice(&block);
            stream.block_ends_stream = end_stream;
            self.open_block = Some(stream_id);
            Ok(())
        }
    }

    fn on_continuation(
        &mut self,
        stream_id: u32,
        block: Vec<u8>,
        end_headers: bool,
    ) -> Result<(), FrameLayerError> {
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            self.orphan_fragments.extend_from_slice(&block);
            if end_headers {
                self.open_block = None;
                let full = std::mem::take(&mut self.orphan_fragments);
                self.decoder.decode_block(&full)?;
            }
            return Ok(());
        };
        stream.header_fragments.extend_from_slice(&block);
        if end_headers {
            self.open_block = None;
            let full = std::mem::take(&mut stream.header_fragments);
            let end_stream = stream.block_ends_stream;
            self.finish_block(stream_id, &full, end_stream)?;
        }
        Ok(())
    }

    fn finish_block(
        &mut self,
        stream_id: u32,
        block: &[u8],
        end_stream: bool,
    ) -> Result<(), FrameLayerError> {
        self.open_block = None;
        let fields = self.decoder.decode_block(block)?;

        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return Ok(());
        };
        let initial = matches!(
            stream.phase,
            StreamPhase::Open | StreamPhase::HalfClosedLocal
        );
        if end_stream {
            stream.remote_closed();
        }

        let has_status = fields.iter().any(|f| f.name == b":status");
        if has_status && initial {
            self.events.push_back(ConnEvent::ResponseHeaders {
                stream_id,
                fields,
                end_stream,
            });
        } else {
            self.events
                .push_back(ConnEvent::Trailers { stream_id, fields });
        }
        Ok(())
    }

    fn on_data(
        &mut self,
        stream_id: u32,
        payload: Vec<u8>,
        end_stream: bool,
        flow_len: u32,
    ) -> Result<(), FrameLayerError> {
        // Padding counts against both windows even though it never reaches
        // the application; account for it as consumed immediately.
        let padding = flow_len - payload.len() as u32;

        self.conn_recv.debit(flow_len)?;
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            // DATA for a stream we already reset: return the credit.
            self.acknowledge_read(stream_id, flow_len);
            return Ok(());
        };
        stream.recv_window.debit(flow_len)?;
        if end_stream {
            stream.remote_closed();
        }
        self.events.push_back(ConnEvent::Data {
            stream_id,
            data: payload,
            end_stream,
        });
        if padding > 0 {
            self.acknowledge_read(stream_id, padding);
        }
        Ok(())
    }

    fn on_window_update(
        &mut self,
        stream_id: u32,
        increment: u32,
    ) -> Result<(), FrameLayerError> {
        if stream_id == 0 {
            self.conn_send.credit(increment)?;
            self.events
                .push_back(ConnEvent::WindowAvailable { stream_id: None });
        } else if let Some(stream) = self.streams.get_mut(&stream_id) {
            stream.send_window.credit(increment)?;
            self.events.push_back(ConnEvent::WindowAvailable {
                stream_id: Some(stream_id),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{flags, kind, FrameHead};

    fn server_settings() -> Vec<u8> {
        let mut buf = Vec::new();
        Frame::Settings {
            ack: false,
            map: SettingsMap::default(),
        }
        .write(&mut buf);
        buf
    }

    fn ready_connection() -> ClientConnection {
        let mut conn = ClientConnection::new(SettingsMap::client());
        let _ = conn.take_outbound();
        conn.feed(&server_settings()).unwrap();
        let _ = conn.take_outbound();
        while conn.next_event().is_some() {}
        conn
    }

    fn response_headers_frame(stream_id: u32, end_stream: bool) -> Vec<u8> {
        let mut enc = Encoder::new(4096);
        let mut block = Vec::new();
        enc.encode_block(
            &[Field::new(b":status".as_slice(), b"200".as_slice())],
            &mut block,
        );
        let mut buf = Vec::new();
        Frame::Headers {
            stream_id,
            block,
            end_stream,
            end_headers: true,
            dependency: None,
        }
        .write(&mut buf);
        buf
    }

    #[test]
    fn preface_and_settings_queued_on_construction() {
        let mut conn = ClientConnection::new(SettingsMap::client());
        let out = conn.take_outbound();
        assert!(out.starts_with(PREFACE));
        let head = FrameHead::parse(&out[PREFACE.len()..]).unwrap();
        assert_eq!(head.kind, kind::SETTINGS);
        assert_eq!(head.flags, 0);
    }

    #[test]
    fn settings_exchange_reaches_ready() {
        let mut conn = ClientConnection::new(SettingsMap::client());
        let _ = conn.take_outbound();
        assert!(!conn.is_ready());
        conn.feed(&server_settings()).unwrap();
        assert!(conn.is_ready());
        // We must have queued a SETTINGS ACK.
        let out = conn.take_outbound();
        let head = FrameHead::parse(&out).unwrap();
        assert_eq!(head.kind, kind::SETTINGS);
        assert_eq!(head.flags, flags::ACK);
        assert!(matches!(
            conn.next_event(),
            Some(ConnEvent::RemoteSettings(_))
        ));
    }

    #[test]
    fn stream_ids_are_odd_and_increasing() {
        let mut conn = ready_connection();
        let fields = [Field::new(b":method".as_slice(), b"GET".as_slice())];
        assert_eq!(conn.open_stream(&fields, true).unwrap(), 1);
        assert_eq!(conn.open_stream(&fields, true).unwrap(), 3);
        assert_eq!(conn.open_stream(&fields, true).unwrap(), 5);
    }

    #[test]
    fn response_and_body_events() {
        let mut conn = ready_connection();
        let sid = conn
            .open_stream(&[Field::new(b":method".as_slice(), b"GET".as_slice())], true)
            .unwrap();
        let _ = conn.take_outbound();

        conn.feed(&response_headers_frame(sid, false)).unwrap();
        match conn.next_event().unwrap() {
            ConnEvent::ResponseHeaders {
                stream_id,
                fields,
                end_stream,
            } => {
                assert_eq!(stream_id, sid);
                assert!(!end_stream);
                assert_eq!(fields[0].value, b"200");
            }
            other => panic!("unexpected {other:?}"),
        }

        let mut buf = Vec::new();
        Frame::Data {
            stream_id: sid,
            payload: b"hi".to_vec(),
            end_stream: true,
            flow_len: 2,
        }
        .write(&mut buf);
        conn.feed(&buf).unwrap();
        match conn.next_event().unwrap() {
            ConnEvent::Data {
                data, end_stream, ..
            } => {
                assert_eq!(data, b"hi");
                assert!(end_stream);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn ping_is_acknowledged() {
        let mut conn = ready_connection();
        let mut buf = Vec::new();
        Frame::Ping {
            ack: false,
            payload: [9; 8],
        }
        .write(&mut buf);
        conn.feed(&buf).unwrap();
        let out = conn.take_outbound();
        match Frame::split(&out, 16_384).unwrap().unwrap().0 {
            Frame::Ping { ack, payload } => {
                assert!(ack);
                assert_eq!(payload, [9; 8]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn goaway_refuses_new_streams() {
        let mut conn = ready_connection();
        let mut buf = Vec::new();
        Frame::GoAway {
            last_stream_id: 0,
            code: ErrorCode::NoError,
            debug_data: Vec::new(),
        }
        .write(&mut buf);
        conn.feed(&buf).unwrap();
        assert!(conn.is_draining());
        assert!(conn
            .open_stream(&[Field::new(b":method".as_slice(), b"GET".as_slice())], true)
            .is_err());
    }

    #[test]
    fn push_promise_is_refused() {
        let mut conn = ready_connection();
        let sid = conn
            .open_stream(&[Field::new(b":method".as_slice(), b"GET".as_slice())], true)
            .unwrap();
        let _ = conn.take_outbound();

        let mut buf = Vec::new();
        Frame::PushPromise {
            stream_id: sid,
            promised_id: 2,
            block: Vec::new(),
            end_headers: true,
        }
        .write(&mut buf);
        conn.feed(&buf).unwrap();

        let out = conn.take_outbound();
        match Frame::split(&out, 16_384).unwrap().unwrap().0 {
            Frame::RstStream { stream_id, code } => {
                assert_eq!(stream_id, 2);
                assert_eq!(code, ErrorCode::RefusedStream);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn max_concurrent_streams_enforced() {
        let mut conn = ClientConnection::new(SettingsMap::client());
        let _ = conn.take_outbound();
        let mut restrictive = SettingsMap::default();
        restrictive.max_concurrent_streams = Some(1);
        let mut buf = Vec::new();
        Frame::Settings {
            ack: false,
            map: restrictive,
        }
        .write(&mut buf);
        conn.feed(&buf).unwrap();

        let fields = [Field::new(b":method".as_slice(), b"GET".as_slice())];
        assert_eq!(conn.remaining_streams(), 1);
        let sid = conn.open_stream(&fields, true).unwrap();
        assert_eq!(conn.remaining_streams(), 0);
        assert!(conn.open_stream(&fields, true).is_err());

        // Finishing the stream restores capacity.
        conn.feed(&response_headers_frame(sid, true)).unwrap();
        conn.release_stream(sid);
        assert_eq!(conn.remaining_streams(), 1);
    }

    #[test]
    fn send_capacity_respects_both_windows() {
        let mut conn = ready_connection();
        let sid = conn
            .open_stream(
                &[Field::new(b":method".as_slice(), b"POST".as_slice())],
                false,
            )
            .unwrap();
        // Default windows are 65535; the frame-size cap is 16384.
        assert_eq!(conn.send_capacity(sid), 16_384);
        conn.send_data(sid, &vec![0u8; 16_384], false).unwrap();
        conn.send_data(sid, &vec![0u8; 16_384], false).unwrap();
        conn.send_data(sid, &vec![0u8; 16_384], false).unwrap();
        // The window has one partial frame left.
        assert_eq!(conn.send_capacity(sid), 65_535 - 3 * 16_384);
        // A full frame no longer fits.
        assert!(conn.send_data(sid, &vec![0u8; 16_384], false).is_err());
    }

    #[test]
    fn window_update_grows_send_capacity() {
        let mut conn = ready_connection();
        let sid = conn
            .open_stream(
                &[Field::new(b":method".as_slice(), b"POST".as_slice())],
                false,
            )
            .unwrap();
        conn.send_data(sid, &vec![0u8; 16_384], false).unwrap();
        let before = conn.send_capacity(sid);

        let mut buf = Vec::new();
        Frame::WindowUpdate {
            stream_id: sid,
            increment: 16_384,
        }
        .write(&mut buf);
        Frame::WindowUpdate {
            stream_id: 0,
            increment: 16_384,
        }
        .write(&mut buf);
        conn.feed(&buf).unwrap();
        assert!(conn.send_capacity(sid) > before);
        assert!(matches!(
            conn.next_event(),
            Some(ConnEvent::WindowAvailable { .. })
        ));
    }

    #[test]
    fn acknowledge_read_emits_window_updates() {
        let mut conn = ready_connection();
        let sid = conn
            .open_stream(&[Field::new(b":method".as_slice(), b"GET".as_slice())], true)
            .unwrap();
        conn.feed(&response_headers_frame(sid, false)).unwrap();
        let _ = conn.take_outbound();

        // Deliver 48k of DATA in legal frame sizes, then acknowledge it.
        let mut buf = Vec::new();
        for _ in 0..3 {
            Frame::Data {
                stream_id: sid,
                payload: vec![0u8; 16_000],
                end_stream: false,
                flow_len: 16_000,
            }
            .write(&mut buf);
        }
        conn.feed(&buf).unwrap();
        assert!(!conn.has_outbound());

        conn.acknowledge_read(sid, 48_000);
        let out = conn.take_outbound();
        // Both the connection-level and stream-level updates are due.
        let (first, used) = Frame::split(&out, 16_384).unwrap().unwrap();
        let (second, _) = Frame::split(&out[used..], 16_384).unwrap().unwrap();
        let ids: Vec<u32> = [first, second]
            .iter()
            .map(|f| match f {
                Frame::WindowUpdate { stream_id, .. } => *stream_id,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert!(ids.contains(&0));
        assert!(ids.contains(&sid));
    }

    #[test]
    fn interleaved_continuation_is_fatal() {
        let mut conn = ready_connection();
        let sid = conn
            .open_stream(&[Field::new(b":method".as_slice(), b"GET".as_slice())], true)
            .unwrap();
        let _ = conn.take_outbound();

        // HEADERS without END_HEADERS, then a PING before CONTINUATION.
        let mut buf = Vec::new();
        Frame::Headers {
            stream_id: sid,
            block: Vec::new(),
            end_stream: false,
            end_headers: false,
            dependency: None,
        }
        .write(&mut buf);
        Frame::Ping {
            ack: false,
            payload: [0; 8],
        }
        .write(&mut buf);
        assert!(conn.feed(&buf).is_err());
        assert!(conn.is_closed());
    }
}
