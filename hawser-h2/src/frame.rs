//! HTTP/2 frame codec (RFC 7540 Section 4).
//!
//! Every frame starts with the fixed 9-byte head: a 24-bit payload length,
//! an 8-bit type, an 8-bit flag set, and a 31-bit stream identifier with a
//! reserved top bit that is ignored on read and cleared on write.

use crate::error::{ErrorCode, FrameLayerError};
use crate::settings::SettingsMap;

pub const FRAME_HEAD_LEN: usize = 9;

pub mod kind {
    pub const DATA: u8 = 0x0;
    pub const HEADERS: u8 = 0x1;
    pub const PRIORITY: u8 = 0x2;
    pub const RST_STREAM: u8 = 0x3;
    pub const SETTINGS: u8 = 0x4;
    pub const PUSH_PROMISE: u8 = 0x5;
    pub const PING: u8 = 0x6;
    pub const GOAWAY: u8 = 0x7;
    pub const WINDOW_UPDATE: u8 = 0x8;
    pub const CONTINUATION: u8 = 0x9;
}

pub mod flags {
    pub const END_STREAM: u8 = 0x1;
    pub const ACK: u8 = 0x1;
    pub const END_HEADERS: u8 = 0x4;
    pub const PADDED: u8 = 0x8;
    pub const PRIORITY: u8 = 0x20;
}

/// The fixed 9-byte frame head.
#[derive(Debug, Clone, Copy)]
pub struct FrameHead {
    pub length: u32,
    pub kind: u8,
    pub flags: u8,
    pub stream_id: u32,
}

impl FrameHead {
    pub fn parse(buf: &[u8]) -> Option<Self> {
        let head: &[u8; FRAME_HEAD_LEN] = buf.get(..FRAME_HEAD_LEN)?.try_into().ok()?;
        Some(Self {
            length: u32::from_be_bytes([0, head[0], head[1], head[2]]),
            kind: head[3],
            flags: head[4],
            stream_id: u32::from_be_bytes([head[5], head[6], head[7], head[8]]) & 0x7fff_ffff,
        })
    }

    pub fn write(&self, buf: &mut Vec<u8>) {
        let len = self.length.to_be_bytes();
        buf.extend_from_slice(&[len[1], len[2], len[3], self.kind, self.flags]);
        buf.extend_from_slice(&(self.stream_id & 0x7fff_ffff).to_be_bytes());
    }

    pub fn has(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }
}

/// Stream dependency carried by PRIORITY or a HEADERS PRIORITY flag.
#[derive(Debug, Clone, Copy)]
pub struct Dependency {
    pub exclusive: bool,
    pub stream_id: u32,
    pub weight: u8,
}

/// A decoded HTTP/2 frame.
#[derive(Debug, Clone)]
pub enum Frame {
    Data {
        stream_id: u32,
        payload: Vec<u8>,
        end_stream: bool,
        /// Length on the wire including any padding; this is the amount
        /// charged against flow-control windows.
        flow_len: u32,
    },
    Headers {
        stream_id: u32,
        block: Vec<u8>,
        end_stream: bool,
        end_headers: bool,
        dependency: Option<Dependency>,
    },
    Priority {
        stream_id: u32,
        dependency: Dependency,
    },
    RstStream {
        stream_id: u32,
        code: ErrorCode,
    },
    Settings {
        ack: bool,
        map: SettingsMap,
    },
    PushPromise {
        stream_id: u32,
        promised_id: u32,
        block: Vec<u8>,
        end_headers: bool,
    },
    Ping {
        ack: bool,
        payload: [u8; 8],
    },
    GoAway {
        last_stream_id: u32,
        code: ErrorCode,
        debug_data: Vec<u8>,
    },
    WindowUpdate {
        stream_id: u32,
        increment: u32,
    },
    Continuation {
        stream_id: u32,
        block: Vec<u8>,
        end_headers: bool,
    },
    /// Unrecognised frame types must be ignored (RFC 7540 Section 4.1).
    Unknown { kind: u8, stream_id: u32 },
}

impl Frame {
    /// Append this frame (head + payload) to `buf`.
    pub fn write(&self, buf: &mut Vec<u8>) {
        match self {
            Frame::Data {
                stream_id,
                payload,
                end_stream,
                ..
            } => {
                FrameHead {
                    length: payload.len() as u32,
                    kind: kind::DATA,
                    flags: if *end_stream { flags::END_STREAM } else { 0 },
                    stream_id: *stream_id,
                }
                .write(buf);
                buf.extend_from_slice(payload);
            }
            Frame::Headers {
                stream_id,
                block,
                end_stream,
                end_headers,
                dependency,
            } => {
                let mut f = 0u8;
                if *end_stream {
                    f |= flags::END_STREAM;
                }
                if *end_headers {
                    f |= flags::END_HEADERS;
                }
                let extra = if dependency.is_some() { 5 } else { 0 };
                if dependency.is_some() {
                    f |= flags::PRIORITY;
                }
                FrameHead {
                    length: (block.len() + extra) as u32,
                    kind: kind::HEADERS,
                    flags: f,
                    stream_id: *stream_id,
                }
                .write(buf);
                if let Some(dep) = dependency {
                    write_dependency(buf, dep);
                }
                buf.extend_from_slice(block);
            }
            Frame::Priority {
                stream_id,
                dependency,
            } => {
                FrameHead {
                    length: 5,
                    kind: kind::PRIORITY,
                    flags: 0,
                    stream_id: *stream_id,
                }
                .write(buf);
                write_dependency(buf, dependency);
            }
            Frame::RstStream { stream_id, code } => {
                FrameHead {
                    length: 4,
                    kind: kind::RST_STREAM,
                    flags: 0,
                    stream_id: *stream_id,
                }
                .write(buf);
                buf.extend_from_slice(&(*code as u32).to_be_bytes());
            }
            Frame::Settings { ack, map } => {
                if *ack {
                    FrameHead {
                        length: 0,
                        kind: kind::SETTINGS,
                        flags: flags::ACK,
                        stream_id: 0,
                    }
                    .write(buf);
                } else {
                    let mut payload = Vec::new();
                    map.write_payload(&mut payload);
                    FrameHead {
                        length: payload.len() as u32,
                        kind: kind::SETTINGS,
                        flags: 0,
                        stream_id: 0,
                    }
                    .write(buf);
                    buf.extend_from_slice(&payload);
                }
            }
            Frame::PushPromise {
                stream_id,
                promised_id,
                block,
                end_headers,
            } => {
                FrameHead {
                    length: (block.len() + 4) as u32,
                    kind: kind::PUSH_PROMISE,
                    flags: if *end_headers { flags::END_HEADERS } else { 0 },
                    stream_id: *stream_id,
                }
                .write(buf);
                buf.extend_from_slice(&(promised_id & 0x7fff_ffff).to_be_bytes());
                buf.extend_from_slice(block);
            }
            Frame::Ping { ack, payload } => {
                FrameHead {
                    length: 8,
                    kind: kind::PING,
                    flags: if *ack { flags::ACK } else { 0 },
                    stream_id: 0,
                }
                .write(buf);
                buf.extend_from_slice(payload);
            }
            Frame::GoAway {
                last_stream_id,
                code,
                debug_data,
            } => {
                FrameHead {
                    length: (8 + debug_data.len()) as u32,
                    kind: kind::GOAWAY,
                    flags: 0,
                    stream_id: 0,
                }
                .write(buf);
                buf.extend_from_slice(&(last_stream_id & 0x7fff_ffff).to_be_bytes());
                buf.extend_from_slice(&(*code as u32).to_be_bytes());
                buf.extend_from_slice(debug_data);
            }
            Frame::WindowUpdate {
                stream_id,
                increment,
            } => {
                FrameHead {
                    length: 4,
                    kind: kind::WINDOW_UPDATE,
                    flags: 0,
                    stream_id: *stream_id,
                }
                .write(buf);
                buf.extend_from_slice(&(increment & 0x7fff_ffff).to_be_bytes());
            }
            Frame::Continuation {
                stream_id,
                block,
                end_headers,
            } => {
                FrameHead {
                    length: block.len() as u32,
                    kind: kind::CONTINUATION,
                    flags: if *end_headers { flags::END_HEADERS } else { 0 },
                    stream_id: *stream_id,
                }
                .write(buf);
                buf.extend_from_slice(block);
            }
            Frame::Unknown { .. } => {}
        }
    }

    /// Split one frame off the front of `buf`.
    ///
    /// Returns `Ok(None)` when the buffer does not yet hold a whole frame,
    /// otherwise the frame and the number of bytes consumed.
    pub fn split(
        buf: &[u8],
        max_frame_size: u32,
    ) -> Result<Option<(Frame, usize)>, FrameLayerError> {
        let Some(head) = FrameHead::parse(buf) else {
            return Ok(None);
        };
        if head.length > max_frame_size {
            return Err(FrameLayerError::FrameSize);
        }
        let total = FRAME_HEAD_LEN + head.length as usize;
        let Some(payload) = buf.get(FRAME_HEAD_LEN..total) else {
            return Ok(None);
        };
        let frame = decode_payload(&head, payload)?;
        Ok(Some((frame, total)))
    }
}

fn write_dependency(buf: &mut Vec<u8>, dep: &Dependency) {
    let mut word = dep.stream_id & 0x7fff_ffff;
    if dep.exclusive {
        word |= 0x8000_0000;
    }
    buf.extend_from_slice(&word.to_be_bytes());
    buf.push(dep.weight);
}

fn read_dependency(payload: &[u8]) -> Result<Dependency, FrameLayerError> {
    let word = read_u32(payload)?;
    let weight = *payload.get(4).ok_or(FrameLayerError::Malformed("priority"))?;
    Ok(Dependency {
        exclusive: word & 0x8000_0000 != 0,
        stream_id: word & 0x7fff_ffff,
        weight,
    })
}

fn read_u32(payload: &[u8]) -> Result<u32, FrameLayerError> {
    let bytes: [u8; 4] = payload
        .get(..4)
        .and_then(|s| s.try_into().ok())
        .ok_or(FrameLayerError::Malformed("truncated u32"))?;
    Ok(u32::from_be_bytes(bytes))
}

/// Strip the PADDED prologue: one pad-length byte up front, that many
/// bytes of padding at the end.
fn unpad<'p>(head: &FrameHead, payload: &'p [u8]) -> Result<&'p [u8], FrameLayerError> {
    if !head.has(flags::PADDED) {
        return Ok(payload);
    }
    let (&pad_len, rest) = payload
        .split_first()
        .ok_or(FrameLayerError::Malformed("padded frame too short"))?;
    rest.len()
        .checked_sub(usize::from(pad_len))
        .map(|keep| &rest[..keep])
        .ok_or(FrameLayerError::Protocol(
            "padding exceeds frame payload".into(),
        ))
}

fn decode_payload(head: &FrameHead, payload: &[u8]) -> Result<Frame, FrameLayerError> {
    match head.kind {
        kind::DATA => {
            if head.stream_id == 0 {
                return Err(FrameLayerError::Protocol("DATA on stream 0".into()));
            }
            let data = unpad(head, payload)?;
            Ok(Frame::Data {
                stream_id: head.stream_id,
                payload: data.to_vec(),
                end_stream: head.has(flags::END_STREAM),
                flow_len: head.length,
            })
        }
        kind::HEADERS => {
            if head.stream_id == 0 {
                return Err(FrameLayerError::Protocol("HEADERS on stream 0".into()));
            }
            let mut body = unpad(head, payload)?;
            let dependency = if head.has(flags::PRIORITY) {
                let dep = read_dependency(body)?;
                body = &body[5..];
                Some(dep)
            } else {
                None
            };
            Ok(Frame::Headers {
                stream_id: head.stream_id,
                block: body.to_vec(),
                end_stream: head.has(flags::END_STREAM),
                end_headers: head.has(flags::END_HEADERS),
                dependency,
            })
        }
        kind::PRIORITY => Ok(Frame::Priority {
            stream_id: head.stream_id,
            dependency: read_dependency(payload)?,
        }),
        kind::RST_STREAM => {
            if payload.len() != 4 {
                return Err(FrameLayerError::FrameSize);
            }
            Ok(Frame::RstStream {
                stream_id: head.stream_id,
                code: ErrorCode::from_u32(read_u32(payload)?),
            })
        }
        kind::SETTINGS => {
            if head.stream_id != 0 {
                return Err(FrameLayerError::Protocol(
                    "SETTINGS on a non-zero stream".into(),
                ));
            }
            if head.has(flags::ACK) {
                if !payload.is_empty() {
                    return Err(FrameLayerError::FrameSize);
                }
                return Ok(Frame::Settings {
                    ack: true,
                    map: SettingsMap::default(),
                });
            }
            Ok(Frame::Settings {
                ack: false,
                map: SettingsMap::parse_payload(payload)?,
            })
        }
        kind::PUSH_PROMISE => {
            let body = unpad(head, payload)?;
            let promised_id = read_u32(body)? & 0x7fff_ffff;
            Ok(Frame::PushPromise {
                stream_id: head.stream_id,
                promised_id,
                block: body[4..].to_vec(),
                end_headers: head.has(flags::END_HEADERS),
            })
        }
        kind::PING => {
            let payload: [u8; 8] = payload
                .try_into()
                .map_err(|_| FrameLayerError::FrameSize)?;
            Ok(Frame::Ping {
                ack: head.has(flags::ACK),
                payload,
            })
        }
        kind::GOAWAY => {
            if payload.len() < 8 {
                return Err(FrameLayerError::FrameSize);
            }
            Ok(Frame::GoAway {
                last_stream_id: read_u32(payload)? & 0x7fff_ffff,
                code: ErrorCode::from_u32(read_u32(&payload[4..])?),
                debug_data: payload[8..].to_vec(),
            })
        }
        kind::WINDOW_UPDATE => {
            if payload.len() != 4 {
                return Err(FrameLayerError::FrameSize);
            }
            let increment = read_u32(payload)? & 0x7fff_ffff;
            if increment == 0 {
                return Err(FrameLayerError::Protocol(
                    "WINDOW_UPDATE with zero increment".into(),
                ));
            }
            Ok(Frame::WindowUpdate {
                stream_id: head.stream_id,
                increment,
            })
        }
        kind::CONTINUATION => Ok(Frame::Continuation {
            stream_id: head.stream_id,
            block: payload.to_vec(),
            end_headers: head.has(flags::END_HEADERS),
        }),
        other => Ok(Frame::Unknown {
            kind: other,
            stream_id: head.stream_id,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one(frame: &Frame) -> Frame {
        let mut buf = Vec::new();
        frame.write(&mut buf);
        let (decoded, used) = Frame::split(&buf, 16_384).unwrap().unwrap();
        assert_eq!(used, buf.len());
        decoded
    }

    #[test]
    fn data_round_trip() {
        match one(&Frame::Data {
            stream_id: 5,
            payload: b"hello".to_vec(),
            end_stream: true,
            flow_len: 5,
        }) {
            Frame::Data {
                stream_id,
                payload,
                end_stream,
                flow_len,
            } => {
                assert_eq!(stream_id, 5);
                assert_eq!(payload, b"hello");
                assert!(end_stream);
                assert_eq!(flow_len, 5);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn headers_with_dependency() {
        match one(&Frame::Headers {
            stream_id: 1,
            block: vec![0x82],
            end_stream: false,
            end_headers: true,
            dependency: Some(Dependency {
                exclusive: true,
                stream_id: 3,
                weight: 42,
            }),
        }) {
            Frame::Headers {
                block, dependency, ..
            } => {
                assert_eq!(block, [0x82]);
                let dep = dependency.unwrap();
                assert!(dep.exclusive);
                assert_eq!(dep.stream_id, 3);
                assert_eq!(dep.weight, 42);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn padded_data_stripped() {
        // Hand-build a padded DATA frame: pad_len 3, "ab", 3 pad bytes.
        let mut buf = Vec::new();
        FrameHead {
            length: 6,
            kind: kind::DATA,
            flags: flags::PADDED,
            stream_id: 1,
        }
        .write(&mut buf);
        buf.extend_from_slice(&[3, b'a', b'b', 0, 0, 0]);
        match Frame::split(&buf, 16_384).unwrap().unwrap().0 {
            Frame::Data {
                payload, flow_len, ..
            } => {
                assert_eq!(payload, b"ab");
                assert_eq!(flow_len, 6);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn padding_overrun_rejected() {
        let mut buf = Vec::new();
        FrameHead {
            length: 2,
            kind: kind::DATA,
            flags: flags::PADDED,
            stream_id: 1,
        }
        .write(&mut buf);
        buf.extend_from_slice(&[9, b'a']);
        assert!(Frame::split(&buf, 16_384).is_err());
    }

    #[test]
    fn partial_buffer_yields_none() {
        let mut buf = Vec::new();
        Frame::Ping {
            ack: false,
            payload: [7; 8],
        }
        .write(&mut buf);
        for cut in 0..buf.len() {
            assert!(Frame::split(&buf[..cut], 16_384).unwrap().is_none());
        }
    }

    #[test]
    fn oversized_frame_rejected() {
        let mut buf = Vec::new();
        FrameHead {
            length: 20_000,
            kind: kind::DATA,
            flags: 0,
            stream_id: 1,
        }
        .write(&mut buf);
        assert!(matches!(
            Frame::split(&buf, 16_384),
            Err(FrameLayerError::FrameSize)
        ));
    }

    #[test]
    fn goaway_round_trip() {
        match one(&Frame::GoAway {
            last_stream_id: 9,
            code: ErrorCode::EnhanceYourCalm,
            debug_data: b"slow down".to_vec(),
        }) {
            Frame::GoAway {
                last_stream_id,
                code,
                debug_data,
            } => {
                assert_eq!(last_stream_id, 9);
                assert_eq!(code, ErrorCode::EnhanceYourCalm);
                assert_eq!(debug_data, b"slow down");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn zero_window_increment_rejected() {
        let mut buf = Vec::new();
        FrameHead {
            length: 4,
            kind: kind::WINDOW_UPDATE,
            flags: 0,
            stream_id: 1,
        }
        .write(&mut buf);
        buf.extend_from_slice(&0u32.to_be_bytes());
        assert!(Frame::split(&buf, 16_384).is_err());
    }

    #[test]
    fn unknown_kind_ignored() {
        let mut buf = Vec::new();
        FrameHead {
            length: 3,
            kind: 0xfa,
            flags: 0,
            stream_id: 1,
        }
        .write(&mut buf);
        buf.extend_from_slice(&[1, 2, 3]);
        assert!(matches!(
            Frame::split(&buf, 16_384).unwrap().unwrap().0,
            Frame::Unknown { kind: 0xfa, .. }
        ));
    }
}
