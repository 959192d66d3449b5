//! Proxy behaviour: CONNECT tunnelling, absolute-form forwarding, proxy
//! authorization, and SOCKS5 negotiation.

use std::sync::Arc;

use bytes::Bytes;
use hawser::mock::MockBackend;
use hawser::{
    Error, HttpProxy, HttpProxyConfig, Origin, PoolConfig, Request, Scheme, SocksProxy,
    SocksProxyConfig, Url,
};

fn proxy_origin() -> Origin {
    Origin::new(Scheme::Http, &b"127.0.0.1"[..], 8080)
}

fn https_request(target: &str) -> Request {
    Request::new(
        &b"GET"[..],
        Url::new(
            Scheme::Https,
            &b"example.com"[..],
            None,
            target.as_bytes().to_vec(),
        ),
    )
}

fn http_request(target: &str) -> Request {
    Request::new(
        &b"GET"[..],
        Url::new(
            Scheme::Http,
            &b"example.com"[..],
            None,
            target.as_bytes().to_vec(),
        ),
    )
}

#[tokio::test]
async fn https_requests_tunnel_through_connect() {
    let backend = MockBackend::new();
    backend.push_script(vec![
        Bytes::from_static(b"HTTP/1.1 200 Connection established\r\n\r\n"),
        Bytes::from_static(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok"),
    ]);
    let proxy = HttpProxy::with_backend(
        HttpProxyConfig::new(proxy_origin()),
        PoolConfig::default(),
        Arc::new(backend.clone()),
    );

    let mut response = proxy.handle_request(https_request("/")).await.unwrap();
    assert_eq!(response.body.read_to_end().await.unwrap(), &b"ok"[..]);

    let record = &backend.records()[0];
    let writes = record.writes();
    // The CONNECT goes out first, in full, before anything else.
    assert_eq!(
        writes[0],
        b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n"
    );
    // Only after its 2xx does the TLS handshake to the origin happen,
    // followed by the real request inside the tunnel.
    assert!(record.tls_started());
    assert!(writes[1].starts_with(b"GET / HTTP/1.1\r\n"));
    proxy.close().await;
}

#[tokio::test]
async fn http_requests_are_forwarded_in_absolute_form() {
    let backend = MockBackend::new();
    backend.push_script(vec![Bytes::from_static(
        b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok",
    )]);
    let proxy = HttpProxy::with_backend(
        HttpProxyConfig::new(proxy_origin()),
        PoolConfig::default(),
        Arc::new(backend.clone()),
    );

    let mut response = proxy.handle_request(http_request("/x")).await.unwrap();
    assert_eq!(response.body.read_to_end().await.unwrap(), &b"ok"[..]);

    let record = &backend.records()[0];
    let writes = record.writes();
    assert!(writes[0].starts_with(b"GET http://example.com/x HTTP/1.1\r\n"));
    // Forwarded plaintext requests never TLS to the proxy.
    assert!(!record.tls_started());
    proxy.close().await;
}

#[tokio::test]
async fn proxy_auth_is_sent_on_the_connect() {
    let backend = MockBackend::new();
    backend.push_script(vec![
        Bytes::from_static(b"HTTP/1.1 200 Connection established\r\n\r\n"),
        Bytes::from_static(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n"),
    ]);
    let mut config = HttpProxyConfig::new(proxy_origin());
    config.proxy_auth = Some((b"user".to_vec(), b"pass".to_vec()));
    let proxy = HttpProxy::with_backend(
        config,
        PoolConfig::default(),
        Arc::new(backend.clone()),
    );

    let mut response = proxy.handle_request(https_request("/")).await.unwrap();
    response.body.read_to_end().await.unwrap();

    let connect = backend.records()[0].writes()[0].clone();
    let text = String::from_utf8_lossy(&connect).into_owned();
    assert!(text.starts_with("CONNECT example.com:443 HTTP/1.1\r\n"));
    assert!(text.contains("Proxy-Authorization: Basic dXNlcjpwYXNz\r\n"));
    proxy.close().await;
}

#[tokio::test]
async fn rejected_connect_is_a_proxy_error() {
    let backend = MockBackend::new();
    backend.push_script(vec![Bytes::from_static(
        b"HTTP/1.1 403 Forbidden\r\nContent-Length: 0\r\n\r\n",
    )]);
    let proxy = HttpProxy::with_backend(
        HttpProxyConfig::new(proxy_origin()),
        PoolConfig::default(),
        Arc::new(backend),
    );

    let err = proxy.handle_request(https_request("/")).await.unwrap_err();
    match err {
        Error::Proxy(msg) => assert!(msg.contains("403"), "got {msg}"),
        other => panic!("expected proxy error, got {other:?}"),
    }
    proxy.close().await;
}

#[tokio::test]
async fn socks5_negotiates_then_sends_the_request() {
    let backend = MockBackend::new();
    backend.push_script(vec![
        // Method selection: no auth.
        Bytes::from_static(b"\x05\x00"),
        // CONNECT reply: succeeded, bound to 0.0.0.0:0.
        Bytes::from_static(b"\x05\x00\x00\x01\x00\x00\x00\x00\x00\x00"),
        Bytes::from_static(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok"),
    ]);
    let proxy = SocksProxy::with_backend(
        SocksProxyConfig::new(Origin::new(Scheme::Http, &b"127.0.0.1"[..], 1080)),
        PoolConfig::default(),
        Arc::new(backend.clone()),
    );

    let mut response = proxy.handle_request(http_request("/")).await.unwrap();
    assert_eq!(response.body.read_to_end().await.unwrap(), &b"ok"[..]);

    let writes = backend.records()[0].writes();
    assert_eq!(writes[0], b"\x05\x01\x00");
    // CONNECT example.com:80 as a domain address.
    assert_eq!(writes[1][..5], [0x05, 0x01, 0x00, 0x03, 11]);
    assert_eq!(&writes[1][5..16], b"example.com");
    assert_eq!(&writes[1][16..], &80u16.to_be_bytes());
    assert!(writes[2].starts_with(b"GET / HTTP/1.1\r\n"));
    proxy.close().await;
}

#[tokio::test]
async fn socks5_auth_failure_is_a_proxy_error() {
    let backend = MockBackend::new();
    backend.push_script(vec![
        // Server selects username/password, then rejects it.
        Bytes::from_static(b"\x05\x02"),
        Bytes::from_static(b"\x01\x01"),
    ]);
    let mut config = SocksProxyConfig::new(Origin::new(Scheme::Http, &b"127.0.0.1"[..], 1080));
    config.proxy_auth = Some((b"user".to_vec(), b"wrong".to_vec()));
    let proxy = SocksProxy::with_backend(config, PoolConfig::default(), Arc::new(backend));

    let err = proxy.handle_request(http_request("/")).await.unwrap_err();
    assert!(matches!(err, Error::Proxy(_)));
    proxy.close().await;
}

#[tokio::test]
async fn tunnelled_connections_pool_by_destination() {
    let backend = MockBackend::new();
    backend.push_script(vec![
        Bytes::from_static(b"HTTP/1.1 200 Connection established\r\n\r\n"),
        Bytes::from_static(b"HTTP/1.1 200 OK\r\nContent-Length: 1\r\n\r\na"),
        Bytes::from_static(b"HTTP/1.1 200 OK\r\nContent-Length: 1\r\n\r\nb"),
    ]);
    let proxy = HttpProxy::with_backend(
        HttpProxyConfig::new(proxy_origin()),
        PoolConfig::default(),
        Arc::new(backend.clone()),
    );

    for expected in [&b"a"[..], &b"b"[..]] {
        let mut response = proxy.handle_request(https_request("/")).await.unwrap();
        assert_eq!(response.body.read_to_end().await.unwrap(), expected);
    }
    // The second request reused the established tunnel: one TCP connect,
    // one CONNECT handshake.
    assert_eq!(backend.connect_count(), 1);
    let connects = backend.records()[0]
        .writes()
        .iter()
        .filter(|w| w.starts_with(b"CONNECT "))
        .count();
    assert_eq!(connects, 1);
    proxy.close().await;
}
