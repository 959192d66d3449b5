//! HTTP/1.1 wire behaviour: header round-trips, body framing in both
//! directions, upgrades, and trace events.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use hawser::mock::MockBackend;
use hawser::{
    Body, ConnectionPool, NetworkStream as _, PoolConfig, Request, RequestOptions, Scheme,
    TraceHook, Url,
};

fn url(target: &str) -> Url {
    Url::new(
        Scheme::Https,
        &b"example.com"[..],
        None,
        target.as_bytes().to_vec(),
    )
}

#[tokio::test]
async fn request_head_round_trips_headers_with_synthesized_host() {
    let backend = MockBackend::new();
    backend.push_script(vec![Bytes::from_static(
        b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n",
    )]);
    let pool = ConnectionPool::with_backend(PoolConfig::default(), Arc::new(backend.clone()));

    let request = Request::new(&b"GET"[..], url("/"))
        .header(&b"Accept"[..], &b"*/*"[..])
        .header(&b"X-Custom"[..], &b"one"[..])
        .header(&b"x-custom"[..], &b"two"[..]);
    let mut response = pool.handle_request(request).await.unwrap();
    response.body.read_to_end().await.unwrap();

    let written = backend.records()[0].written();
    assert_eq!(
        written,
        b"GET / HTTP/1.1\r\n\
          Host: example.com\r\n\
          Accept: */*\r\n\
          X-Custom: one\r\n\
          x-custom: two\r\n\r\n"
    );
    pool.close().await;
}

#[tokio::test]
async fn streaming_request_body_is_chunked() {
    let backend = MockBackend::new();
    backend.push_script(vec![Bytes::from_static(
        b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n",
    )]);
    let pool = ConnectionPool::with_backend(PoolConfig::default(), Arc::new(backend.clone()));

    let chunks = [Bytes::from_static(b"Hello, "), Bytes::from_static(b"world!")];
    let request = Request::new(&b"POST"[..], url("/upload"))
        .body(Body::Chunks(chunks.into_iter().collect()));
    let mut response = pool.handle_request(request).await.unwrap();
    response.body.read_to_end().await.unwrap();

    let written = backend.records()[0].written();
    let text = String::from_utf8_lossy(&written);
    assert!(text.contains("Transfer-Encoding: chunked\r\n"));
    assert!(text.ends_with("7\r\nHello, \r\n6\r\nworld!\r\n0\r\n\r\n"));
    pool.close().await;
}

#[tokio::test]
async fn full_request_body_gets_content_length() {
    let backend = MockBackend::new();
    backend.push_script(vec![Bytes::from_static(
        b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n",
    )]);
    let pool = ConnectionPool::with_backend(PoolConfig::default(), Arc::new(backend.clone()));

    let request = Request::new(&b"POST"[..], url("/upload")).body("payload");
    let mut response = pool.handle_request(request).await.unwrap();
    response.body.read_to_end().await.unwrap();

    let text = String::from_utf8_lossy(&backend.records()[0].written()).into_owned();
    assert!(text.contains("Content-Length: 7\r\n"));
    assert!(!text.contains("Transfer-Encoding"));
    assert!(text.ends_with("\r\n\r\npayload"));
    pool.close().await;
}

#[tokio::test]
async fn response_body_shapes_assemble_identically() {
    // Content-Length, chunked, and close-delimited responses must all
    // yield the same payload; the last leaves the connection unusable.
    let scripts: [&[u8]; 3] = [
        b"HTTP/1.1 200 OK\r\nContent-Length: 13\r\n\r\nHello, world!",
        b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n7\r\nHello, \r\n6\r\nworld!\r\n0\r\n\r\n",
        b"HTTP/1.1 200 OK\r\n\r\nHello, world!",
    ];
    for (case, script) in scripts.iter().enumerate() {
        let backend = MockBackend::new();
        backend.push_script(vec![Bytes::copy_from_slice(script)]);
        let pool =
            ConnectionPool::with_backend(PoolConfig::default(), Arc::new(backend.clone()));

        let mut response = pool
            .handle_request(Request::new(&b"GET"[..], url("/")))
            .await
            .unwrap();
        let body = response.body.read_to_end().await.unwrap();
        assert_eq!(body, &b"Hello, world!"[..], "case {case}");

        if case == 2 {
            // Close-delimited: no reusable connection remains.
            assert!(pool.connections().is_empty());
        } else {
            assert_eq!(pool.connections().len(), 1);
            assert!(pool.connections()[0].is_idle);
        }
        pool.close().await;
    }
}

#[tokio::test]
async fn connection_close_response_is_not_reused() {
    let backend = MockBackend::new();
    backend.push_script(vec![Bytes::from_static(
        b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok",
    )]);
    let pool = ConnectionPool::with_backend(PoolConfig::default(), Arc::new(backend.clone()));

    let mut response = pool
        .handle_request(Request::new(&b"GET"[..], url("/")))
        .await
        .unwrap();
    response.body.read_to_end().await.unwrap();
    assert!(pool.connections().is_empty());
    pool.close().await;
}

#[tokio::test]
async fn reason_phrase_and_version_are_reported() {
    let backend = MockBackend::new();
    backend.push_script(vec![Bytes::from_static(
        b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n",
    )]);
    let pool = ConnectionPool::with_backend(PoolConfig::default(), Arc::new(backend));

    let mut response = pool
        .handle_request(Request::new(&b"GET"[..], url("/missing")))
        .await
        .unwrap();
    assert_eq!(response.status, 404);
    assert_eq!(response.version, hawser::HttpVersion::Http11);
    assert_eq!(response.reason_phrase.as_deref(), Some(&b"Not Found"[..]));
    assert!(response.stream_id.is_none());
    response.body.read_to_end().await.unwrap();
    pool.close().await;
}

#[tokio::test]
async fn interim_responses_are_skipped() {
    let backend = MockBackend::new();
    backend.push_script(vec![
        Bytes::from_static(b"HTTP/1.1 103 Early Hints\r\n\r\n"),
        Bytes::from_static(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok"),
    ]);
    let pool = ConnectionPool::with_backend(PoolConfig::default(), Arc::new(backend));

    let mut response = pool
        .handle_request(Request::new(&b"GET"[..], url("/")))
        .await
        .unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.body.read_to_end().await.unwrap(), &b"ok"[..]);
    pool.close().await;
}

#[tokio::test]
async fn upgrade_response_surrenders_the_stream() {
    let backend = MockBackend::new();
    backend.push_script(vec![Bytes::from_static(
        b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: raw\r\nConnection: Upgrade\r\n\r\nserver-first",
    )]);
    let pool = ConnectionPool::with_backend(PoolConfig::default(), Arc::new(backend));

    let request = Request::new(&b"GET"[..], url("/"))
        .header(&b"Upgrade"[..], &b"raw"[..])
        .header(&b"Connection"[..], &b"Upgrade"[..]);
    let mut response = pool.handle_request(request).await.unwrap();
    assert_eq!(response.status, 101);

    // Bytes over-read past the head replay out of the raw stream.
    let mut stream = response.network_stream.take().expect("upgrade stream");
    let first = stream.read(64 * 1024, None).await.unwrap();
    assert_eq!(first, &b"server-first"[..]);

    // The surrendered connection is no longer pooled.
    assert!(pool.connections().is_empty());
    pool.close().await;
}

#[derive(Default)]
struct RecordingHook(Mutex<Vec<String>>);

impl TraceHook for RecordingHook {
    fn on_event(&self, name: &str, _info: Option<&dyn std::fmt::Debug>) {
        self.0.lock().unwrap().push(name.to_string());
    }
}

#[tokio::test]
async fn trace_hook_sees_paired_events_per_step() {
    let backend = MockBackend::new();
    backend.push_script(vec![Bytes::from_static(
        b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok",
    )]);
    let pool = ConnectionPool::with_backend(PoolConfig::default(), Arc::new(backend));

    let hook = Arc::new(RecordingHook::default());
    let mut request = Request::new(&b"GET"[..], url("/"));
    request.options = RequestOptions {
        trace: Some(hook.clone()),
        ..RequestOptions::default()
    };
    let mut response = pool.handle_request(request).await.unwrap();
    response.body.read_to_end().await.unwrap();

    let events = hook.0.lock().unwrap().clone();
    for expected in [
        "connection.connect_tcp.started",
        "connection.connect_tcp.complete",
        "connection.start_tls.started",
        "connection.start_tls.complete",
        "http11.send_request_headers.started",
        "http11.send_request_headers.complete",
        "http11.receive_response_headers.started",
        "http11.receive_response_headers.complete",
        "http11.response_closed.started",
        "http11.response_closed.complete",
    ] {
        assert!(
            events.contains(&expected.to_string()),
            "missing {expected} in {events:?}"
        );
    }
    // Started always precedes its completion.
    let started = events
        .iter()
        .position(|e| e == "http11.receive_response_headers.started")
        .unwrap();
    let complete = events
        .iter()
        .position(|e| e == "http11.receive_response_headers.complete")
        .unwrap();
    assert!(started < complete);
    pool.close().await;
}

#[tokio::test]
async fn closing_a_body_twice_is_a_noop() {
    let backend = MockBackend::new();
    backend.push_script(vec![Bytes::from_static(
        b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok",
    )]);
    let pool = ConnectionPool::with_backend(PoolConfig::default(), Arc::new(backend));

    let mut response = pool
        .handle_request(Request::new(&b"GET"[..], url("/")))
        .await
        .unwrap();
    response.body.close().await;
    response.body.close().await;
    // The partially-read body made the connection unusable, but the pool
    // itself carries on.
    pool.close().await;
}
