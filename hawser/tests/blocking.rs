//! The blocking surface mirrors the async semantics: reuse, queuing,
//! chunked framing, proxying.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use hawser::blocking::mock::MockBackend;
use hawser::blocking::{
    Body, ConnectionPool, HttpProxy, HttpProxyConfig, PoolConfig, Request,
};
use hawser::{Error, HttpVersion, Origin, Scheme, Timeouts, Url};

fn get(host: &str) -> Request {
    Request::new(
        &b"GET"[..],
        Url::new(Scheme::Https, host.as_bytes().to_vec(), None, &b"/"[..]),
    )
}

fn plain_response(body: &str) -> Bytes {
    Bytes::from(format!(
        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}",
        body.len(),
        body
    ))
}

#[test]
fn sequential_requests_reuse_one_connection() {
    let backend = MockBackend::new();
    backend.push_script(vec![plain_response("one"), plain_response("two")]);
    let pool = ConnectionPool::with_backend(PoolConfig::default(), Arc::new(backend.clone()));

    for expected in ["one", "two"] {
        let mut response = pool.handle_request(get("example.com")).unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.version, HttpVersion::Http11);
        assert_eq!(response.body.read_to_end().unwrap(), expected.as_bytes());
    }
    assert_eq!(backend.connect_count(), 1);
    assert_eq!(backend.tls_count(), 1);
    assert_eq!(pool.connections().len(), 1);
    pool.close();
}

#[test]
fn queued_request_runs_after_the_body_is_released() {
    let backend = MockBackend::new();
    backend.push_script(vec![plain_response("first"), plain_response("second")]);
    let config = PoolConfig {
        max_connections: 1,
        ..PoolConfig::default()
    };
    let pool = Arc::new(ConnectionPool::with_backend(
        config,
        Arc::new(backend.clone()),
    ));

    let mut first = pool.handle_request(get("example.com")).unwrap();

    let thread_pool = pool.clone();
    let second = std::thread::spawn(move || {
        let mut response = thread_pool.handle_request(get("example.com")).unwrap();
        response.body.read_to_end().unwrap()
    });

    let mut waited = 0;
    while pool.queued_requests() == 0 && waited < 200 {
        std::thread::sleep(Duration::from_millis(5));
        waited += 1;
    }
    assert_eq!(pool.queued_requests(), 1);
    assert_eq!(backend.connect_count(), 1);

    first.body.read_to_end().unwrap();
    assert_eq!(second.join().unwrap(), &b"second"[..]);
    assert_eq!(backend.connect_count(), 1);
    pool.close();
}

#[test]
fn pool_timeout_surfaces_while_queued() {
    let backend = MockBackend::new();
    backend.push_script(vec![plain_response("held")]);
    let config = PoolConfig {
        max_connections: 1,
        ..PoolConfig::default()
    };
    let pool = ConnectionPool::with_backend(config, Arc::new(backend));

    let _held = pool.handle_request(get("example.com")).unwrap();

    let mut request = get("example.com");
    request.options.timeouts = Timeouts {
        pool: Some(Duration::from_millis(50)),
        ..Timeouts::default()
    };
    let err = pool.handle_request(request).unwrap_err();
    assert!(matches!(err, Error::PoolTimeout));
    pool.close();
}

#[test]
fn streaming_request_body_is_chunked() {
    let backend = MockBackend::new();
    backend.push_script(vec![Bytes::from_static(
        b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n",
    )]);
    let pool = ConnectionPool::with_backend(PoolConfig::default(), Arc::new(backend.clone()));

    let chunks = [Bytes::from_static(b"Hello, "), Bytes::from_static(b"world!")];
    let request = Request::new(
        &b"POST"[..],
        Url::new(Scheme::Https, &b"example.com"[..], None, &b"/upload"[..]),
    )
    .body(Body::Chunks(chunks.into_iter().collect()));
    let mut response = pool.handle_request(request).unwrap();
    response.body.read_to_end().unwrap();

    let text = String::from_utf8_lossy(&backend.records()[0].written()).into_owned();
    assert!(text.contains("Transfer-Encoding: chunked\r\n"));
    assert!(text.ends_with("7\r\nHello, \r\n6\r\nworld!\r\n0\r\n\r\n"));
    pool.close();
}

#[test]
fn lazy_iterator_bodies_stream_out() {
    let backend = MockBackend::new();
    backend.push_script(vec![Bytes::from_static(
        b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n",
    )]);
    let pool = ConnectionPool::with_backend(PoolConfig::default(), Arc::new(backend.clone()));

    let chunks = vec![Ok(Bytes::from_static(b"ab")), Ok(Bytes::from_static(b"cd"))];
    let request = Request::new(
        &b"POST"[..],
        Url::new(Scheme::Https, &b"example.com"[..], None, &b"/upload"[..]),
    )
    .body(Body::Iter(Box::new(chunks.into_iter())));
    let mut response = pool.handle_request(request).unwrap();
    response.body.read_to_end().unwrap();

    let text = String::from_utf8_lossy(&backend.records()[0].written()).into_owned();
    assert!(text.ends_with("2\r\nab\r\n2\r\ncd\r\n0\r\n\r\n"));
    pool.close();
}

#[test]
fn tunnel_proxy_connects_then_requests() {
    let backend = MockBackend::new();
    backend.push_script(vec![
        Bytes::from_static(b"HTTP/1.1 200 Connection established\r\n\r\n"),
        Bytes::from_static(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok"),
    ]);
    let proxy = HttpProxy::with_backend(
        HttpProxyConfig::new(Origin::new(Scheme::Http, &b"127.0.0.1"[..], 8080)),
        PoolConfig::default(),
        Arc::new(backend.clone()),
    );

    let mut response = proxy.handle_request(get("example.com")).unwrap();
    assert_eq!(response.body.read_to_end().unwrap(), &b"ok"[..]);

    let record = &backend.records()[0];
    assert_eq!(
        record.writes()[0],
        b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n"
    );
    assert!(record.tls_started());
    proxy.close();
}

#[test]
fn dropping_an_unread_body_closes_the_connection() {
    let backend = MockBackend::new();
    backend.push_script(vec![plain_response("never read")]);
    let pool = ConnectionPool::with_backend(PoolConfig::default(), Arc::new(backend.clone()));

    {
        let _response = pool.handle_request(get("example.com")).unwrap();
        // Dropped without close(): the pool must not reuse this one.
    }
    assert!(pool.connections().is_empty());
    pool.close();
}
