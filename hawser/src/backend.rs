//! The async network backend abstraction.
//!
//! The pool only ever touches the network through [`NetworkBackend`] and
//! the streams it hands out, which is what makes the whole stack testable
//! against [`mock::MockBackend`](crate::mock::MockBackend). The default
//! implementation is [`TokioBackend`]: TCP and Unix-domain sockets with a
//! rustls TLS upgrade.

use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream};
#[cfg(unix)]
use tokio::net::UnixStream;

use crate::error::Error;

/// Read buffer granularity used by the engines.
pub const READ_CHUNK: usize = 64 * 1024;

/// One bidirectional byte stream: a TCP connection, a Unix socket, or a
/// TLS session running over either.
#[async_trait]
pub trait NetworkStream: Send {
    /// Read up to `max_bytes`. An empty buffer signals EOF.
    async fn read(&mut self, max_bytes: usize, timeout: Option<Duration>) -> Result<Bytes, Error>;

    /// Write the whole buffer.
    async fn write(&mut self, data: &[u8], timeout: Option<Duration>) -> Result<(), Error>;

    /// Close the stream. Idempotent; errors are swallowed.
    async fn close(&mut self);

    /// Upgrade to TLS. The old stream must not be used afterwards.
    async fn start_tls(
        self: Box<Self>,
        config: Arc<rustls::ClientConfig>,
        server_name: &str,
        timeout: Option<Duration>,
    ) -> Result<Box<dyn NetworkStream>, Error>;

    /// Split into independently usable halves, so one task can sit in a
    /// read while others write. Used by the HTTP/2 engine.
    fn into_halves(self: Box<Self>) -> (Box<dyn ReadStream>, Box<dyn WriteStream>);

    /// The ALPN protocol negotiated by TLS, if any.
    fn negotiated_alpn(&self) -> Option<Vec<u8>> {
        None
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    /// Whether a read would return immediately. On an idle connection the
    /// only thing it could return is EOF, which the pool uses to detect
    /// server-initiated disconnects.
    fn is_readable(&self) -> bool {
        false
    }
}

/// The read side of a split stream.
#[async_trait]
pub trait ReadStream: Send {
    async fn read(&mut self, max_bytes: usize, timeout: Option<Duration>) -> Result<Bytes, Error>;
}

/// The write side of a split stream.
#[async_trait]
pub trait WriteStream: Send {
    async fn write(&mut self, data: &[u8], timeout: Option<Duration>) -> Result<(), Error>;
    async fn close(&mut self);
}

/// Opens streams. Implementations must be cheap to share.
#[async_trait]
pub trait NetworkBackend: Send + Sync {
    async fn connect_tcp(
        &self,
        host: &str,
        port: u16,
        timeout: Option<Duration>,
        local_address: Option<IpAddr>,
    ) -> Result<Box<dyn NetworkStream>, Error>;

    async fn connect_unix(
        &self,
        path: &Path,
        timeout: Option<Duration>,
    ) -> Result<Box<dyn NetworkStream>, Error>;

    /// TLS configuration used when the pool was not given one.
    fn default_tls_config(&self) -> Arc<rustls::ClientConfig> {
        default_tls_config()
    }
}

/// A rustls client config trusting the bundled webpki roots.
pub fn default_tls_config() -> Arc<rustls::ClientConfig> {
    let roots = rustls::RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };
    Arc::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    )
}

/// Clone `config` with the given ALPN protocol list.
pub fn tls_config_with_alpn(
    config: &Arc<rustls::ClientConfig>,
    protocols: &[&[u8]],
) -> Arc<rustls::ClientConfig> {
    let mut cloned = (**config).clone();
    cloned.alpn_protocols = protocols.iter().map(|p| p.to_vec()).collect();
    Arc::new(cloned)
}

// ── Tokio implementation ───────────────────────────────────────────────

/// Erased I/O object the TLS layer can wrap. The readability probe
/// travels through the erasure so server-disconnect detection keeps
/// working under any number of TLS layers.
trait Io: AsyncRead + AsyncWrite + Unpin + Send {
    /// Whether a read on the underlying socket would return immediately.
    fn is_readable(&self) -> bool;
}

impl Io for TcpStream {
    fn is_readable(&self) -> bool {
        // One poll of peek() without a real waker. Ready means a byte or
        // EOF is waiting; Pending performs the actual syscall, which also
        // corrects any stale cached readiness left by earlier reads.
        let mut probe = [0u8; 1];
        let mut cx = std::task::Context::from_waker(std::task::Waker::noop());
        let peek = self.peek(&mut probe);
        let mut peek = std::pin::pin!(peek);
        matches!(
            std::future::Future::poll(peek.as_mut(), &mut cx),
            std::task::Poll::Ready(_)
        )
    }
}

#[cfg(unix)]
impl Io for UnixStream {
    fn is_readable(&self) -> bool {
        // No non-destructive peek exists for Unix sockets here; report
        // not-readable rather than risk false positives.
        false
    }
}

impl Io for tokio_rustls::client::TlsStream<BoxedIo> {
    fn is_readable(&self) -> bool {
        // Ciphertext waiting on the inner socket. On an idle connection
        // that is a close, or at best pending TLS control data; either
        // way the connection must not be handed out again.
        self.get_ref().0.is_readable()
    }
}

impl Io for BoxedIo {
    fn is_readable(&self) -> bool {
        (**self).is_readable()
    }
}

type BoxedIo = Box<dyn Io>;

enum Transport {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
    Tls(tokio_rustls::client::TlsStream<BoxedIo>),
}

impl Transport {
    fn into_io(self) -> BoxedIo {
        match self {
            Transport::Tcp(t) => Box::new(t),
            #[cfg(unix)]
            Transport::Unix(u) => Box::new(u),
            Transport::Tls(t) => Box::new(t),
        }
    }

    async fn read_some(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Transport::Tcp(t) => t.read(buf).await,
            #[cfg(unix)]
            Transport::Unix(u) => u.read(buf).await,
            Transport::Tls(t) => t.read(buf).await,
        }
    }

    async fn write_all_flush(&mut self, data: &[u8]) -> std::io::Result<()> {
        match self {
            Transport::Tcp(t) => {
                t.write_all(data).await?;
                t.flush().await
            }
            #[cfg(unix)]
            Transport::Unix(u) => {
                u.write_all(data).await?;
                u.flush().await
            }
            Transport::Tls(t) => {
                t.write_all(data).await?;
                t.flush().await
            }
        }
    }

    async fn shutdown(&mut self) {
        let _ = match self {
            Transport::Tcp(t) => t.shutdown().await,
            #[cfg(unix)]
            Transport::Unix(u) => u.shutdown().await,
            Transport::Tls(t) => t.shutdown().await,
        };
    }

    fn is_readable(&self) -> bool {
        match self {
            Transport::Tcp(t) => Io::is_readable(t),
            #[cfg(unix)]
            Transport::Unix(u) => Io::is_readable(u),
            Transport::Tls(t) => Io::is_readable(t),
        }
    }
}

/// Stream type produced by [`TokioBackend`].
pub struct TokioStream {
    transport: Transport,
    peer: Option<SocketAddr>,
    local: Option<SocketAddr>,
}

#[async_trait]
impl NetworkStream for TokioStream {
    async fn read(&mut self, max_bytes: usize, timeout: Option<Duration>) -> Result<Bytes, Error> {
        let mut buf = vec![0u8; max_bytes];
        let n = with_deadline(timeout, self.transport.read_some(&mut buf), || {
            Error::ReadTimeout
        })
        .await?
        .map_err(|e| Error::Read(e.to_string()))?;
        buf.truncate(n);
        Ok(Bytes::from(buf))
    }

    async fn write(&mut self, data: &[u8], timeout: Option<Duration>) -> Result<(), Error> {
        with_deadline(timeout, self.transport.write_all_flush(data), || {
            Error::WriteTimeout
        })
        .await?
        .map_err(|e| Error::Write(e.to_string()))
    }

    async fn close(&mut self) {
        self.transport.shutdown().await;
    }

    async fn start_tls(
        self: Box<Self>,
        config: Arc<rustls::ClientConfig>,
        server_name: &str,
        timeout: Option<Duration>,
    ) -> Result<Box<dyn NetworkStream>, Error> {
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|_| Error::Connect(format!("invalid TLS server name {server_name:?}")))?;
        let connector = tokio_rustls::TlsConnector::from(config);
        let io = self.transport.into_io();
        let tls = with_deadline(timeout, connector.connect(name, io), || {
            Error::ConnectTimeout
        })
        .await?
        .map_err(|e| Error::Connect(format!("TLS handshake failed: {e}")))?;
        Ok(Box::new(TokioStream {
            transport: Transport::Tls(tls),
            peer: self.peer,
            local: self.local,
        }))
    }

    fn into_halves(self: Box<Self>) -> (Box<dyn ReadStream>, Box<dyn WriteStream>) {
        let (rd, wr) = tokio::io::split(self.transport.into_io());
        (Box::new(TokioReadStream(rd)), Box::new(TokioWriteStream(wr)))
    }

    fn negotiated_alpn(&self) -> Option<Vec<u8>> {
        match &self.transport {
            Transport::Tls(t) => t.get_ref().1.alpn_protocol().map(|p| p.to_vec()),
            _ => None,
        }
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }

    fn is_readable(&self) -> bool {
        self.transport.is_readable()
    }
}

struct TokioReadStream(tokio::io::ReadHalf<BoxedIo>);

#[async_trait]
impl ReadStream for TokioReadStream {
    async fn read(&mut self, max_bytes: usize, timeout: Option<Duration>) -> Result<Bytes, Error> {
        let mut buf = vec![0u8; max_bytes];
        let n = with_deadline(timeout, self.0.read(&mut buf), || Error::ReadTimeout)
            .await?
            .map_err(|e| Error::Read(e.to_string()))?;
        buf.truncate(n);
        Ok(Bytes::from(buf))
    }
}

struct TokioWriteStream(tokio::io::WriteHalf<BoxedIo>);

#[async_trait]
impl WriteStream for TokioWriteStream {
    async fn write(&mut self, data: &[u8], timeout: Option<Duration>) -> Result<(), Error> {
        with_deadline(
            timeout,
            async {
                self.0.write_all(data).await?;
                self.0.flush().await
            },
            || Error::WriteTimeout,
        )
        .await?
        .map_err(|e| Error::Write(e.to_string()))
    }

    async fn close(&mut self) {
        let _ = self.0.shutdown().await;
    }
}

/// The default backend: tokio sockets, rustls TLS.
#[derive(Clone, Default)]
pub struct TokioBackend;

#[async_trait]
impl NetworkBackend for TokioBackend {
    async fn connect_tcp(
        &self,
        host: &str,
        port: u16,
        timeout: Option<Duration>,
        local_address: Option<IpAddr>,
    ) -> Result<Box<dyn NetworkStream>, Error> {
        let stream = with_deadline(timeout, open_tcp(host, port, local_address), || {
            Error::ConnectTimeout
        })
        .await??;
        let peer = stream.peer_addr().ok();
        let local = stream.local_addr().ok();
        let _ = stream.set_nodelay(true);
        Ok(Box::new(TokioStream {
            transport: Transport::Tcp(stream),
            peer,
            local,
        }))
    }

    #[cfg(unix)]
    async fn connect_unix(
        &self,
        path: &Path,
        timeout: Option<Duration>,
    ) -> Result<Box<dyn NetworkStream>, Error> {
        let stream = with_deadline(timeout, UnixStream::connect(path), || Error::ConnectTimeout)
            .await?
            .map_err(|e| Error::Connect(format!("unix connect failed: {e}")))?;
        Ok(Box::new(TokioStream {
            transport: Transport::Unix(stream),
            peer: None,
            local: None,
        }))
    }

    #[cfg(not(unix))]
    async fn connect_unix(
        &self,
        _path: &Path,
        _timeout: Option<Duration>,
    ) -> Result<Box<dyn NetworkStream>, Error> {
        Err(Error::Connect(
            "unix domain sockets are not supported on this platform".into(),
        ))
    }
}

async fn open_tcp(
    host: &str,
    port: u16,
    local_address: Option<IpAddr>,
) -> Result<TcpStream, Error> {
    let connect_err = |e: std::io::Error| Error::Connect(format!("tcp connect failed: {e}"));
    match local_address {
        None => TcpStream::connect((host, port)).await.map_err(connect_err),
        Some(local) => {
            let mut last = None;
            let addrs = tokio::net::lookup_host((host, port))
                .await
                .map_err(connect_err)?;
            for addr in addrs {
                let socket = match addr {
                    SocketAddr::V4(_) => TcpSocket::new_v4(),
                    SocketAddr::V6(_) => TcpSocket::new_v6(),
                }
                .map_err(connect_err)?;
                if let Err(e) = socket.bind(SocketAddr::new(local, 0)) {
                    last = Some(e);
                    continue;
                }
                match socket.connect(addr).await {
                    Ok(stream) => return Ok(stream),
                    Err(e) => last = Some(e),
                }
            }
            Err(match last {
                Some(e) => connect_err(e),
                None => Error::Connect(format!("no addresses resolved for {host}:{port}")),
            })
        }
    }
}

/// Run `fut` under an optional deadline, mapping expiry with `expired`.
pub(crate) async fn with_deadline<T>(
    timeout: Option<Duration>,
    fut: impl std::future::Future<Output = T>,
    expired: impl FnOnce() -> Error,
) -> Result<T, Error> {
    match timeout {
        Some(d) => tokio::time::timeout(d, fut).await.map_err(|_| expired()),
        None => Ok(fut.await),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn connected_pair() -> (Box<dyn NetworkStream>, TcpStream) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        let (stream, accepted) = tokio::join!(
            async {
                TokioBackend
                    .connect_tcp("127.0.0.1", addr.port(), None, None)
                    .await
                    .unwrap()
            },
            async { listener.accept().await.unwrap().0 },
        );
        (stream, accepted)
    }

    async fn wait_readable(stream: &dyn NetworkStream) -> bool {
        for _ in 0..500 {
            if stream.is_readable() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        false
    }

    #[tokio::test]
    async fn idle_tcp_stream_is_not_readable() {
        let (stream, _server) = connected_pair().await;
        assert!(!stream.is_readable());
    }

    #[tokio::test]
    async fn server_close_makes_an_idle_stream_readable() {
        let (stream, server) = connected_pair().await;
        assert!(!stream.is_readable());
        drop(server);
        assert!(wait_readable(stream.as_ref()).await);
    }

    #[tokio::test]
    async fn pending_bytes_make_a_stream_readable() {
        let (mut stream, mut server) = connected_pair().await;
        server.write_all(b"x").await.unwrap();
        assert!(wait_readable(stream.as_ref()).await);
        // Consuming the byte drains the readiness again.
        let read = stream.read(16, None).await.unwrap();
        assert_eq!(read, &b"x"[..]);
        assert!(!stream.is_readable());
    }
}
