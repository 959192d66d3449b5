//! Sans-IO HTTP/1.1 wire handling.
//!
//! Serialization of request heads (origin-form and absolute-form),
//! request body framing, response head parsing, the RFC 7230 Section
//! 3.3.3 body-length rules, and an incremental chunked-transfer decoder.
//! The engines own the socket; everything here works on byte slices.

use bytes::Bytes;

use crate::error::Error;
use crate::model::{header_value, Headers, HttpVersion};

/// How the request body will be framed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendFraming {
    /// The caller supplied explicit `Content-Length` or
    /// `Transfer-Encoding`; emit the body as-is.
    CallerDeclared,
    /// Emit `Content-Length: n` and the body verbatim.
    ContentLength(u64),
    /// Emit `Transfer-Encoding: chunked` and frame each chunk.
    Chunked,
    /// No body and no framing headers.
    None,
}

/// Pick the body framing: explicit caller headers always win.
pub fn plan_framing(headers: &Headers, body_len: Option<u64>, has_body: bool) -> SendFraming {
    if header_value(headers, b"content-length").is_some()
        || header_value(headers, b"transfer-encoding").is_some()
    {
        return SendFraming::CallerDeclared;
    }
    if !has_body {
        return SendFraming::None;
    }
    match body_len {
        Some(n) => SendFraming::ContentLength(n),
        None => SendFraming::Chunked,
    }
}

/// Serialize the request line and header block, terminated by the blank
/// line. Headers are written verbatim in order; a `Host` header is
/// prepended when the caller did not supply one.
pub fn write_request_head(
    out: &mut Vec<u8>,
    method: &[u8],
    target: &[u8],
    headers: &Headers,
    authority: &[u8],
    framing: SendFraming,
) {
    out.extend_from_slice(method);
    out.push(b' ');
    out.extend_from_slice(target);
    out.extend_from_slice(b" HTTP/1.1\r\n");

    if header_value(headers, b"host").is_none() {
        out.extend_from_slice(b"Host: ");
        out.extend_from_slice(authority);
        out.extend_from_slice(b"\r\n");
    }
    for (name, value) in headers {
        out.extend_from_slice(name);
        out.extend_from_slice(b": ");
        out.extend_from_slice(value);
        out.extend_from_slice(b"\r\n");
    }
    match framing {
        SendFraming::ContentLength(n) => {
            out.extend_from_slice(b"Content-Length: ");
            out.extend_from_slice(n.to_string().as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        SendFraming::Chunked => {
            out.extend_from_slice(b"Transfer-Encoding: chunked\r\n");
        }
        SendFraming::CallerDeclared | SendFraming::None => {}
    }
    out.extend_from_slice(b"\r\n");
}

/// Frame one body chunk for chunked transfer encoding.
pub fn write_chunk(out: &mut Vec<u8>, data: &[u8]) {
    out.extend_from_slice(format!("{:x}\r\n", data.len()).as_bytes());
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
}

/// The last-chunk marker ending a chunked body.
pub const CHUNKED_END: &[u8] = b"0\r\n\r\n";

/// Offset just past the `\r\n\r\n` ending the head, if present.
pub fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

/// A parsed response head.
#[derive(Debug)]
pub struct ResponseHead {
    pub version: HttpVersion,
    pub status: u16,
    pub reason: Bytes,
    pub headers: Headers,
}

/// Parse a complete head (everything before the blank line, exclusive).
pub fn parse_response_head(raw: &[u8]) -> Result<ResponseHead, Error> {
    let mut lines = raw.split(|&b| b == b'\n').map(|l| l.strip_suffix(b"\r").unwrap_or(l));

    let status_line = lines
        .next()
        .ok_or_else(|| Error::RemoteProtocol("empty response head".into()))?;
    let (version, rest) = split_once(status_line, b' ')
        .ok_or_else(|| Error::RemoteProtocol("malformed status line".into()))?;
    let version = match version {
        b"HTTP/1.1" => HttpVersion::Http11,
        b"HTTP/1.0" => HttpVersion::Http10,
        other => {
            return Err(Error::RemoteProtocol(format!(
                "unsupported http version {:?}",
                String::from_utf8_lossy(other)
            )))
        }
    };
    let (code, reason) = match split_once(rest, b' ') {
        Some((code, reason)) => (code, reason),
        None => (rest, &b""[..]),
    };
    let status: u16 = std::str::from_utf8(code)
        .ok()
        .and_then(|s| s.parse().ok())
        .filter(|s| (100..=599).contains(s))
        .ok_or_else(|| Error::RemoteProtocol("malformed status code".into()))?;

    let mut headers = Headers::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let (name, value) = split_once(line, b':')
            .ok_or_else(|| Error::RemoteProtocol("malformed header line".into()))?;
        let name = trim_ows(name);
        let value = trim_ows(value);
        if name.is_empty() {
            return Err(Error::RemoteProtocol("empty header name".into()));
        }
        headers.push((
            Bytes::copy_from_slice(name),
            Bytes::copy_from_slice(value),
        ));
    }

    Ok(ResponseHead {
        version,
        status,
        reason: Bytes::copy_from_slice(reason),
        headers,
    })
}

fn split_once(buf: &[u8], sep: u8) -> Option<(&[u8], &[u8])> {
    let at = buf.iter().position(|&b| b == sep)?;
    Some((&buf[..at], &buf[at + 1..]))
}

fn trim_ows(mut buf: &[u8]) -> &[u8] {
    while let Some((b' ' | b'\t', rest)) = buf.split_first().map(|(f, r)| (*f, r)) {
        buf = rest;
    }
    while let Some((rest, b' ' | b'\t')) = buf.split_last().map(|(l, r)| (r, *l)) {
        buf = rest;
    }
    buf
}

/// How the response body is delimited (RFC 7230 Section 3.3.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvBodyMode {
    /// HEAD response, 1xx, 204 or 304: the message ends at the head.
    None,
    ContentLength(u64),
    Chunked,
    /// Read until the peer closes; the connection is then not reusable.
    CloseDelimited,
}

pub fn recv_body_mode(method: &[u8], status: u16, headers: &Headers) -> Result<RecvBodyMode, Error> {
    if method.eq_ignore_ascii_case(b"HEAD")
        || (100..200).contains(&status)
        || status == 204
        || status == 304
    {
        return Ok(RecvBodyMode::None);
    }
    if let Some(te) = header_value(headers, b"transfer-encoding") {
        let chunked = te
            .split(|&b| b == b',')
            .any(|tok| trim_ows(tok).eq_ignore_ascii_case(b"chunked"));
        if chunked {
            return Ok(RecvBodyMode::Chunked);
        }
    }
    if let Some(cl) = header_value(headers, b"content-length") {
        let n = std::str::from_utf8(cl)
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .ok_or_else(|| Error::RemoteProtocol("invalid content-length".into()))?;
        return Ok(RecvBodyMode::ContentLength(n));
    }
    Ok(RecvBodyMode::CloseDelimited)
}

/// Whether either side asked for the connection to close after this
/// exchange (RFC 7230 Section 6.3).
pub fn connection_must_close(
    version: HttpVersion,
    request_headers: &Headers,
    response_headers: &Headers,
) -> bool {
    let wants_close = |headers: &Headers| {
        header_value(headers, b"connection").is_some_and(|v| {
            v.split(|&b| b == b',')
                .any(|tok| trim_ows(tok).eq_ignore_ascii_case(b"close"))
        })
    };
    let keep_alive = |headers: &Headers| {
        header_value(headers, b"connection").is_some_and(|v| {
            v.split(|&b| b == b',')
                .any(|tok| trim_ows(tok).eq_ignore_ascii_case(b"keep-alive"))
        })
    };
    if wants_close(request_headers) || wants_close(response_headers) {
        return true;
    }
    version == HttpVersion::Http10 && !keep_alive(response_headers)
}

// ── Chunked decoding ───────────────────────────────────────────────────

/// Incremental chunked-transfer decoder.
///
/// The caller buffers input and feeds it repeatedly; each step either
/// consumes framing, yields a payload slice, asks for more input, or
/// reports the terminating chunk (with trailers consumed and dropped).
pub struct ChunkDecoder {
    state: ChunkState,
}

enum ChunkState {
    SizeLine,
    Payload { remaining: u64 },
    PayloadEnd,
    Trailers,
}

/// Outcome of one decode step.
#[derive(Debug, PartialEq, Eq)]
pub enum ChunkStep<'b> {
    /// Input exhausted mid-element; feed more bytes and retry.
    NeedMore,
    /// Part of a chunk payload; `consumed` covers `payload` plus any
    /// framing bytes that preceded it.
    Payload { payload: &'b [u8], consumed: usize },
    /// The terminating chunk (and trailer section) was consumed.
    Finished { consumed: usize },
}

impl ChunkDecoder {
    pub fn new() -> Self {
        Self {
            state: ChunkState::SizeLine,
        }
    }

    pub fn step<'b>(&mut self, input: &'b [u8]) -> Result<ChunkStep<'b>, Error> {
        match self.state {
            ChunkState::SizeLine => {
                let Some(line_end) = input.windows(2).position(|w| w == b"\r\n") else {
                    return Ok(ChunkStep::NeedMore);
                };
                let size_text = &input[..line_end];
                // Chunk extensions are permitted and ignored.
                let size_text = split_once(size_text, b';').map_or(size_text, |(s, _)| s);
                let size = std::str::from_utf8(trim_ows(size_text))
                    .ok()
                    .and_then(|s| u64::from_str_radix(s, 16).ok())
                    .ok_or_else(|| Error::RemoteProtocol("invalid chunk size".into()))?;
                let consumed = line_end + 2;
                if size == 0 {
                    self.state = ChunkState::Trailers;
                    match self.step(&input[consumed..])? {
                        ChunkStep::Finished { consumed: more } => Ok(ChunkStep::Finished {
                            consumed: consumed + more,
                        }),
                        _ => {
                            // Not enough input for the trailer section yet;
                            // re-parse the size line next round.
                            self.state = ChunkState::SizeLine;
                            Ok(ChunkStep::NeedMore)
                        }
                    }
                } else {
                    self.state = ChunkState::Payload { remaining: size };
                    match self.step(&input[consumed..])? {
                        ChunkStep::Payload {
                            payload,
                            consumed: more,
                        } => Ok(ChunkStep::Payload {
                            payload,
                            consumed: consumed + more,
                        }),
                        _ => {
                            // Record that the size line is already consumed.
                            Ok(ChunkStep::Payload {
                                payload: &[],
                                consumed,
                            })
                        }
                    }
                }
            }
            ChunkState::Payload { remaining } => {
                if input.is_empty() {
                    return Ok(ChunkStep::NeedMore);
                }
                let take = (remaining.min(input.len() as u64)) as usize;
                let left = remaining - take as u64;
                self.state = if left == 0 {
                    ChunkState::PayloadEnd
                } else {
                    ChunkState::Payload { remaining: left }
                };
                Ok(ChunkStep::Payload {
                    payload: &input[..take],
                    consumed: take,
                })
            }
            ChunkState::PayloadEnd => {
                let Some(crlf) = input.get(..2) else {
                    return Ok(ChunkStep::NeedMore);
                };
                if crlf != b"\r\n" {
                    return Err(Error::RemoteProtocol("missing chunk terminator".into()));
                }
                self.state = ChunkState::SizeLine;
                match self.step(&input[2..])? {
                    ChunkStep::Payload { payload, consumed } => Ok(ChunkStep::Payload {
                        payload,
                        consumed: consumed + 2,
                    }),
                    ChunkStep::Finished { consumed } => Ok(ChunkStep::Finished {
                        consumed: consumed + 2,
                    }),
                    ChunkStep::NeedMore => Ok(ChunkStep::Payload {
                        payload: &[],
                        consumed: 2,
                    }),
                }
            }
            ChunkState::Trailers => {
                // The body ends with a blank line, optionally preceded by
                // trailer fields, which this client drops.
                if input.starts_with(b"\r\n") {
                    return Ok(ChunkStep::Finished { consumed: 2 });
                }
                match find_head_end(input) {
                    Some(end) => Ok(ChunkStep::Finished { consumed: end }),
                    None => Ok(ChunkStep::NeedMore),
                }
            }
        }
    }
}

impl Default for ChunkDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(mut input: &[u8]) -> (Vec<u8>, bool) {
        let mut dec = ChunkDecoder::new();
        let mut out = Vec::new();
        loop {
            match dec.step(input).unwrap() {
                ChunkStep::NeedMore => return (out, false),
                ChunkStep::Payload { payload, consumed } => {
                    out.extend_from_slice(payload);
                    input = &input[consumed..];
                }
                ChunkStep::Finished { .. } => return (out, true),
            }
        }
    }

    #[test]
    fn head_serialization_with_synthesized_host() {
        let mut out = Vec::new();
        write_request_head(
            &mut out,
            b"GET",
            b"/",
            &vec![(Bytes::from_static(b"Accept"), Bytes::from_static(b"*/*"))],
            b"example.com",
            SendFraming::None,
        );
        assert_eq!(
            out,
            b"GET / HTTP/1.1\r\nHost: example.com\r\nAccept: */*\r\n\r\n"
        );
    }

    #[test]
    fn caller_host_is_not_duplicated() {
        let mut out = Vec::new();
        write_request_head(
            &mut out,
            b"GET",
            b"/",
            &vec![(Bytes::from_static(b"host"), Bytes::from_static(b"other"))],
            b"example.com",
            SendFraming::None,
        );
        assert_eq!(out, b"GET / HTTP/1.1\r\nhost: other\r\n\r\n");
    }

    #[test]
    fn framing_prefers_caller_headers() {
        let headers = vec![(
            Bytes::from_static(b"Content-Length"),
            Bytes::from_static(b"11"),
        )];
        assert_eq!(
            plan_framing(&headers, Some(4), true),
            SendFraming::CallerDeclared
        );
        assert_eq!(plan_framing(&Headers::new(), Some(4), true), SendFraming::ContentLength(4));
        assert_eq!(plan_framing(&Headers::new(), None, true), SendFraming::Chunked);
        assert_eq!(plan_framing(&Headers::new(), None, false), SendFraming::None);
    }

    #[test]
    fn chunk_framing() {
        let mut out = Vec::new();
        write_chunk(&mut out, b"Hello, ");
        write_chunk(&mut out, b"world!");
        out.extend_from_slice(CHUNKED_END);
        assert_eq!(out, b"7\r\nHello, \r\n6\r\nworld!\r\n0\r\n\r\n");
    }

    #[test]
    fn parse_minimal_head() {
        let head = parse_response_head(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n").unwrap();
        assert_eq!(head.version, HttpVersion::Http11);
        assert_eq!(head.status, 200);
        assert_eq!(head.reason, "OK");
        assert_eq!(head.headers.len(), 1);
        assert_eq!(head.headers[0].0, "Content-Length");
    }

    #[test]
    fn parse_preserves_case_and_duplicates() {
        let head = parse_response_head(
            b"HTTP/1.1 200 OK\r\nSet-Cookie: a=1\r\nSET-COOKIE: b=2\r\n",
        )
        .unwrap();
        assert_eq!(head.headers[0].0, "Set-Cookie");
        assert_eq!(head.headers[1].0, "SET-COOKIE");
    }

    #[test]
    fn parse_empty_reason() {
        let head = parse_response_head(b"HTTP/1.1 404\r\n").unwrap();
        assert_eq!(head.status, 404);
        assert_eq!(head.reason, "");
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(parse_response_head(b"HTTP/3 200 OK\r\n").is_err());
        assert!(parse_response_head(b"HTTP/1.1 abc OK\r\n").is_err());
        assert!(parse_response_head(b"HTTP/1.1 999 OK\r\n").is_err());
        assert!(parse_response_head(b"HTTP/1.1 200 OK\r\nbroken line\r\n").is_err());
    }

    #[test]
    fn body_mode_resolution() {
        let none = recv_body_mode(b"HEAD", 200, &Headers::new()).unwrap();
        assert_eq!(none, RecvBodyMode::None);
        assert_eq!(recv_body_mode(b"GET", 204, &Headers::new()).unwrap(), RecvBodyMode::None);
        assert_eq!(recv_body_mode(b"GET", 101, &Headers::new()).unwrap(), RecvBodyMode::None);

        let chunked = vec![(
            Bytes::from_static(b"Transfer-Encoding"),
            Bytes::from_static(b"gzip, chunked"),
        )];
        assert_eq!(recv_body_mode(b"GET", 200, &chunked).unwrap(), RecvBodyMode::Chunked);

        let sized = vec![(
            Bytes::from_static(b"Content-Length"),
            Bytes::from_static(b"13"),
        )];
        assert_eq!(
            recv_body_mode(b"GET", 200, &sized).unwrap(),
            RecvBodyMode::ContentLength(13)
        );

        assert_eq!(
            recv_body_mode(b"GET", 200, &Headers::new()).unwrap(),
            RecvBodyMode::CloseDelimited
        );

        let bad = vec![(
            Bytes::from_static(b"Content-Length"),
            Bytes::from_static(b"13x"),
        )];
        assert!(recv_body_mode(b"GET", 200, &bad).is_err());
    }

    #[test]
    fn close_semantics() {
        let close = vec![(
            Bytes::from_static(b"Connection"),
            Bytes::from_static(b"close"),
        )];
        let keep = vec![(
            Bytes::from_static(b"Connection"),
            Bytes::from_static(b"keep-alive"),
        )];
        assert!(connection_must_close(HttpVersion::Http11, &close, &Headers::new()));
        assert!(connection_must_close(HttpVersion::Http11, &Headers::new(), &close));
        assert!(!connection_must_close(HttpVersion::Http11, &Headers::new(), &Headers::new()));
        assert!(connection_must_close(HttpVersion::Http10, &Headers::new(), &Headers::new()));
        assert!(!connection_must_close(HttpVersion::Http10, &Headers::new(), &keep));
    }

    #[test]
    fn chunked_whole_body() {
        let (out, done) = decode_all(b"7\r\nHello, \r\n6\r\nworld!\r\n0\r\n\r\n");
        assert!(done);
        assert_eq!(out, b"Hello, world!");
    }

    #[test]
    fn chunked_with_extension_and_trailers() {
        let (out, done) =
            decode_all(b"5\r\nhello\r\n0;last\r\nExpires: never\r\n\r\n");
        assert!(done);
        assert_eq!(out, b"hello");
    }

    #[test]
    fn chunked_split_across_reads() {
        let full = b"7\r\nHello, \r\n6\r\nworld!\r\n0\r\n\r\n";
        // Feed byte by byte through a persistent decoder and buffer.
        let mut dec = ChunkDecoder::new();
        let mut pending: Vec<u8> = Vec::new();
        let mut out = Vec::new();
        let mut finished = false;
        for &b in full.iter() {
            pending.push(b);
            loop {
                match dec.step(&pending).unwrap() {
                    ChunkStep::NeedMore => break,
                    ChunkStep::Payload { payload, consumed } => {
                        out.extend_from_slice(payload);
                        pending.drain(..consumed);
                    }
                    ChunkStep::Finished { consumed } => {
                        pending.drain(..consumed);
                        finished = true;
                        break;
                    }
                }
            }
        }
        assert!(finished);
        assert_eq!(out, b"Hello, world!");
    }

    #[test]
    fn invalid_chunk_size_rejected() {
        let mut dec = ChunkDecoder::new();
        assert!(dec.step(b"zz\r\n").is_err());
    }
}
