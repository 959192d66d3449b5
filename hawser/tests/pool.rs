//! Pool scheduling behaviour against a scripted backend.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use hawser::mock::MockBackend;
use hawser::{ConnectionPool, Error, HttpVersion, PoolConfig, Request, Scheme, Timeouts, Url};

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

#[tokio::test]
async fn sequential_requests_reuse_one_connection() {
    let backend = MockBackend::new();
    backend.push_script(vec![
        plain_response("Hello, world!"),
        plain_response("Hello, world!"),
    ]);
    let pool = ConnectionPool::with_backend(PoolConfig::default(), Arc::new(backend.clone()));

    for _ in 0..2 {
        let mut response = pool.handle_request(get("example.com")).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.version, HttpVersion::Http11);
        let body = response.body.read_to_end().await.unwrap();
        assert_eq!(body, &b"Hello, world!"[..]);
    }

    // One TCP connect, one TLS handshake, one pooled connection.
    assert_eq!(backend.connect_count(), 1);
    assert_eq!(backend.tls_count(), 1);
    assert_eq!(pool.connections().len(), 1);
    pool.close().await;
}

#[tokio::test]
async fn expired_keepalive_reconnects() {
    let backend = MockBackend::new();
    backend.push_script(vec![plain_response("one")]);
    backend.push_script(vec![plain_response("two")]);
    let config = PoolConfig {
        keepalive_expiry: Some(Duration::from_millis(100)),
        ..PoolConfig::default()
    };
    let pool = ConnectionPool::with_backend(config, Arc::new(backend.clone()));

    let mut response = pool.handle_request(get("example.com")).await.unwrap();
    response.body.read_to_end().await.unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut response = pool.handle_request(get("example.com")).await.unwrap();
    response.body.read_to_end().await.unwrap();

    assert_eq!(backend.connect_count(), 2);
    pool.close().await;
}

#[tokio::test]
async fn requests_queue_when_at_capacity() {
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

    // Hold the only connection by not consuming the first body.
    let mut first = pool.handle_request(get("example.com")).await.unwrap();

    let second_pool = pool.clone();
    let second = tokio::spawn(async move {
        let mut response = second_pool.handle_request(get("example.com")).await.unwrap();
        response.body.read_to_end().await.unwrap()
    });

    // The second request cannot start while the first body is unread.
    let mut waited = 0;
    while pool.queued_requests() == 0 && waited < 100 {
        tokio::time::sleep(Duration::from_millis(5)).await;
        waited += 1;
    }
    assert_eq!(pool.queued_requests(), 1);
    assert_eq!(backend.connect_count(), 1);

    // Releasing the first body unblocks the queue.
    first.body.read_to_end().await.unwrap();
    let body = second.await.unwrap();
    assert_eq!(body, &b"second"[..]);
    assert_eq!(backend.connect_count(), 1);
    pool.close().await;
}

#[tokio::test]
async fn pool_timeout_surfaces_while_queued() {
    let backend = MockBackend::new();
    backend.push_script(vec![plain_response("held")]);
    let config = PoolConfig {
        max_connections: 1,
        ..PoolConfig::default()
    };
    let pool = ConnectionPool::with_backend(config, Arc::new(backend.clone()));

    let _held = pool.handle_request(get("example.com")).await.unwrap();

    let mut request = get("example.com");
    request.options.timeouts = Timeouts {
        pool: Some(Duration::from_millis(50)),
        ..Timeouts::default()
    };
    let err = pool.handle_request(request).await.unwrap_err();
    assert!(matches!(err, Error::PoolTimeout));
    pool.close().await;
}

#[tokio::test]
async fn capacity_is_reclaimed_from_idle_connections_of_other_origins() {
    let backend = MockBackend::new();
    backend.push_script(vec![plain_response("a")]);
    backend.push_script(vec![plain_response("b")]);
    let config = PoolConfig {
        max_connections: 1,
        ..PoolConfig::default()
    };
    let pool = ConnectionPool::with_backend(config, Arc::new(backend.clone()));

    let mut response = pool.handle_request(get("a.example")).await.unwrap();
    response.body.read_to_end().await.unwrap();
    assert_eq!(pool.connections().len(), 1);

    // The idle connection to a.example is evicted to make room.
    let mut response = pool.handle_request(get("b.example")).await.unwrap();
    response.body.read_to_end().await.unwrap();

    let connections = pool.connections();
    assert_eq!(connections.len(), 1);
    assert_eq!(
        connections[0].origin,
        hawser::Origin::new(Scheme::Https, &b"b.example"[..], 443)
    );
    // The evicted connection closes on a background task.
    let mut tries = 0;
    while !backend.records()[0].is_closed() && tries < 200 {
        tokio::time::sleep(Duration::from_millis(1)).await;
        tries += 1;
    }
    assert!(backend.records()[0].is_closed());
    pool.close().await;
}

#[tokio::test]
async fn eviction_picks_the_least_recently_used_idle_connection() {
    let backend = MockBackend::new();
    // First connection (a.example) serves two requests; the others one.
    backend.push_script(vec![plain_response("a1"), plain_response("a2")]);
    backend.push_script(vec![plain_response("b")]);
    backend.push_script(vec![plain_response("c")]);
    let config = PoolConfig {
        max_connections: 2,
        ..PoolConfig::default()
    };
    let pool = ConnectionPool::with_backend(config, Arc::new(backend.clone()));

    let mut response = pool.handle_request(get("a.example")).await.unwrap();
    response.body.read_to_end().await.unwrap();
    let mut response = pool.handle_request(get("b.example")).await.unwrap();
    response.body.read_to_end().await.unwrap();
    // Reusing a.example leaves b.example as the least recently used,
    // even though its connection was created later.
    let mut response = pool.handle_request(get("a.example")).await.unwrap();
    response.body.read_to_end().await.unwrap();

    let mut response = pool.handle_request(get("c.example")).await.unwrap();
    response.body.read_to_end().await.unwrap();

    let origins: Vec<_> = pool.connections().iter().map(|c| c.origin.clone()).collect();
    assert!(origins.contains(&hawser::Origin::new(Scheme::Https, &b"a.example"[..], 443)));
    assert!(origins.contains(&hawser::Origin::new(Scheme::Https, &b"c.example"[..], 443)));
    assert!(!origins.contains(&hawser::Origin::new(Scheme::Https, &b"b.example"[..], 443)));
    pool.close().await;
}

#[tokio::test]
async fn connect_failures_respect_the_retry_budget() {
    let backend = MockBackend::new();
    backend.fail_next_connects(2);
    backend.push_script(vec![plain_response("ok")]);
    let config = PoolConfig {
        retries: 2,
        ..PoolConfig::default()
    };
    let pool = ConnectionPool::with_backend(config, Arc::new(backend.clone()));

    let mut response = pool.handle_request(get("example.com")).await.unwrap();
    assert_eq!(response.body.read_to_end().await.unwrap(), &b"ok"[..]);
    assert_eq!(backend.connect_count(), 1);
    pool.close().await;
}

#[tokio::test]
async fn connect_failures_surface_without_retries() {
    let backend = MockBackend::new();
    backend.fail_next_connects(1);
    let pool = ConnectionPool::with_backend(PoolConfig::default(), Arc::new(backend));

    let err = pool.handle_request(get("example.com")).await.unwrap_err();
    assert!(matches!(err, Error::Connect(_)));
    pool.close().await;
}

#[tokio::test]
async fn server_closed_keepalive_connection_is_retried_transparently() {
    let backend = MockBackend::new();
    // The first connection serves one response, then reports EOF when the
    // pool tries to reuse it; the second connection serves the retry.
    backend.push_script(vec![plain_response("first")]);
    backend.push_script(vec![plain_response("second")]);
    let pool = ConnectionPool::with_backend(PoolConfig::default(), Arc::new(backend.clone()));

    let mut response = pool.handle_request(get("example.com")).await.unwrap();
    response.body.read_to_end().await.unwrap();

    let mut response = pool.handle_request(get("example.com")).await.unwrap();
    assert_eq!(response.body.read_to_end().await.unwrap(), &b"second"[..]);
    assert_eq!(backend.connect_count(), 2);
    pool.close().await;
}

#[tokio::test]
async fn closed_pool_rejects_requests_and_close_is_idempotent() {
    let backend = MockBackend::new();
    let pool = ConnectionPool::with_backend(PoolConfig::default(), Arc::new(backend));

    pool.close().await;
    pool.close().await;

    let err = pool.handle_request(get("example.com")).await.unwrap_err();
    assert!(matches!(err, Error::PoolClosed));
}

#[tokio::test]
async fn read_timeout_applies_to_each_read() {
    let backend = MockBackend::new();
    backend.set_blocking_reads(true);
    backend.push_script(vec![]);
    let pool = ConnectionPool::with_backend(PoolConfig::default(), Arc::new(backend));

    let mut request = get("example.com");
    request.options.timeouts = Timeouts {
        read: Some(Duration::from_millis(50)),
        ..Timeouts::default()
    };
    let err = pool.handle_request(request).await.unwrap_err();
    assert!(matches!(err, Error::ReadTimeout));
    pool.close().await;
}

#[tokio::test]
async fn idle_keepalive_cap_closes_excess_connections() {
    let backend = MockBackend::new();
    for _ in 0..3 {
        backend.push_script(vec![plain_response("x")]);
    }
    let config = PoolConfig {
        max_connections: 3,
        max_keepalive_connections: 1,
        ..PoolConfig::default()
    };
    let pool = Arc::new(ConnectionPool::with_backend(
        config,
        Arc::new(backend.clone()),
    ));

    // Three concurrent requests to distinct origins, held open together.
    let mut held = Vec::new();
    for host in ["a.example", "b.example", "c.example"] {
        held.push(pool.handle_request(get(host)).await.unwrap());
    }
    assert_eq!(pool.connections().len(), 3);
    for mut response in held {
        response.body.read_to_end().await.unwrap();
    }

    // As bodies were released the idle cap kicked in.
    assert!(pool.connections().len() <= 1);
    pool.close().await;
}
