//! The blocking network backend abstraction.
//!
//! The same contract as the async surface, on plain threads: std sockets,
//! rustls driven by hand so a TLS stream can be split into independently
//! usable read and write halves for HTTP/2.

use std::io::{self, Read as _, Write as _};
use std::net::{IpAddr, SocketAddr, TcpStream, ToSocketAddrs};
#[cfg(unix)]
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use rustls::pki_types::ServerName;

use crate::backend::{default_tls_config, READ_CHUNK};
use crate::error::Error;

pub use crate::backend::tls_config_with_alpn;

/// One bidirectional byte stream.
pub trait NetworkStream: Send {
    /// Read up to `max_bytes`. An empty buffer signals EOF.
    fn read(&mut self, max_bytes: usize, timeout: Option<Duration>) -> Result<Bytes, Error>;

    /// Write the whole buffer.
    fn write(&mut self, data: &[u8], timeout: Option<Duration>) -> Result<(), Error>;

    /// Close the stream. Idempotent; errors are swallowed.
    fn close(&mut self);

    /// Upgrade to TLS. The old stream must not be used afterwards.
    fn start_tls(
        self: Box<Self>,
        config: Arc<rustls::ClientConfig>,
        server_name: &str,
        timeout: Option<Duration>,
    ) -> Result<Box<dyn NetworkStream>, Error>;

    /// Split into independently usable halves, so one thread can sit in
    /// a read while others write. Used by the HTTP/2 engine.
    fn into_halves(self: Box<Self>) -> (Box<dyn ReadStream>, Box<dyn WriteStream>);

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
    /// only thing it could return is EOF.
    fn is_readable(&self) -> bool {
        false
    }
}

pub trait ReadStream: Send {
    fn read(&mut self, max_bytes: usize, timeout: Option<Duration>) -> Result<Bytes, Error>;

    /// Whether a read on the underlying socket would return immediately.
    /// Lets a TLS layer keep probing the raw transport beneath it.
    fn is_readable(&self) -> bool {
        false
    }
}

pub trait WriteStream: Send {
    fn write(&mut self, data: &[u8], timeout: Option<Duration>) -> Result<(), Error>;
    fn close(&mut self);
}

pub trait NetworkBackend: Send + Sync {
    fn connect_tcp(
        &self,
        host: &str,
        port: u16,
        timeout: Option<Duration>,
        local_address: Option<IpAddr>,
    ) -> Result<Box<dyn NetworkStream>, Error>;

    fn connect_unix(
        &self,
        path: &Path,
        timeout: Option<Duration>,
    ) -> Result<Box<dyn NetworkStream>, Error>;

    fn default_tls_config(&self) -> Arc<rustls::ClientConfig> {
        default_tls_config()
    }
}

// ── Std implementation ─────────────────────────────────────────────────

/// The default blocking backend: std sockets, rustls TLS.
#[derive(Clone, Default)]
pub struct StdBackend;

impl NetworkBackend for StdBackend {
    fn connect_tcp(
        &self,
        host: &str,
        port: u16,
        timeout: Option<Duration>,
        local_address: Option<IpAddr>,
    ) -> Result<Box<dyn NetworkStream>, Error> {
        if local_address.is_some() {
            // Binding a source address needs raw socket construction,
            // which std alone does not expose.
            return Err(Error::Connect(
                "local_address is not supported by the blocking backend".into(),
            ));
        }
        let addrs: Vec<SocketAddr> = (host, port)
            .to_socket_addrs()
            .map_err(|e| Error::Connect(format!("dns resolution failed: {e}")))?
            .collect();
        let mut last = None;
        for addr in addrs {
            let attempt = match timeout {
                Some(t) => TcpStream::connect_timeout(&addr, t),
                None => TcpStream::connect(addr),
            };
            match attempt {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    return Ok(Box::new(StdStream::tcp(stream)));
                }
                Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                    return Err(Error::ConnectTimeout)
                }
                Err(e) => last = Some(e),
            }
        }
        Err(match last {
            Some(e) => Error::Connect(format!("tcp connect failed: {e}")),
            None => Error::Connect(format!("no addresses resolved for {host}:{port}")),
        })
    }

    #[cfg(unix)]
    fn connect_unix(
        &self,
        path: &Path,
        _timeout: Option<Duration>,
    ) -> Result<Box<dyn NetworkStream>, Error> {
        let stream = UnixStream::connect(path)
            .map_err(|e| Error::Connect(format!("unix connect failed: {e}")))?;
        Ok(Box::new(StdStream::unix(stream)))
    }

    #[cfg(not(unix))]
    fn connect_unix(
        &self,
        _path: &Path,
        _timeout: Option<Duration>,
    ) -> Result<Box<dyn NetworkStream>, Error> {
        Err(Error::Connect(
            "unix domain sockets are not supported on this platform".into(),
        ))
    }
}

enum Socket {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl Socket {
    fn try_clone(&self) -> io::Result<Socket> {
        match self {
            Socket::Tcp(s) => s.try_clone().map(Socket::Tcp),
            #[cfg(unix)]
            Socket::Unix(s) => s.try_clone().map(Socket::Unix),
        }
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            Socket::Tcp(s) => s.set_read_timeout(timeout),
            #[cfg(unix)]
            Socket::Unix(s) => s.set_read_timeout(timeout),
        }
    }

    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            Socket::Tcp(s) => s.set_write_timeout(timeout),
            #[cfg(unix)]
            Socket::Unix(s) => s.set_write_timeout(timeout),
        }
    }

    fn read_some(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Socket::Tcp(s) => s.read(buf),
            #[cfg(unix)]
            Socket::Unix(s) => s.read(buf),
        }
    }

    fn write_all_bytes(&mut self, data: &[u8]) -> io::Result<()> {
        match self {
            Socket::Tcp(s) => s.write_all(data),
            #[cfg(unix)]
            Socket::Unix(s) => s.write_all(data),
        }
    }

    fn shutdown(&self) {
        let _ = match self {
            Socket::Tcp(s) => s.shutdown(std::net::Shutdown::Both),
            #[cfg(unix)]
            Socket::Unix(s) => s.shutdown(std::net::Shutdown::Both),
        };
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        match self {
            Socket::Tcp(s) => s.peer_addr().ok(),
            #[cfg(unix)]
            Socket::Unix(_) => None,
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Socket::Tcp(s) => s.local_addr().ok(),
            #[cfg(unix)]
            Socket::Unix(_) => None,
        }
    }

    /// Peek without consuming; a readable idle socket means EOF is due.
    fn is_readable(&self) -> bool {
        match self {
            Socket::Tcp(s) => {
                let mut probe = [0u8; 1];
                let _ = s.set_nonblocking(true);
                let readable = !matches!(
                    s.peek(&mut probe),
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock
                );
                let _ = s.set_nonblocking(false);
                readable
            }
            #[cfg(unix)]
            Socket::Unix(_) => false,
        }
    }
}

fn map_read_err(e: io::Error) -> Error {
    match e.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => Error::ReadTimeout,
        _ => Error::Read(e.to_string()),
    }
}

fn map_write_err(e: io::Error) -> Error {
    match e.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => Error::WriteTimeout,
        _ => Error::Write(e.to_string()),
    }
}

/// A plaintext std socket stream.
pub struct StdStream {
    socket: Socket,
}

impl StdStream {
    fn tcp(stream: TcpStream) -> Self {
        Self {
            socket: Socket::Tcp(stream),
        }
    }

    #[cfg(unix)]
    fn unix(stream: UnixStream) -> Self {
        Self {
            socket: Socket::Unix(stream),
        }
    }
}

impl NetworkStream for StdStream {
    fn read(&mut self, max_bytes: usize, timeout: Option<Duration>) -> Result<Bytes, Error> {
        self.socket
            .set_read_timeout(timeout)
            .map_err(|e| Error::Read(e.to_string()))?;
        let mut buf = vec![0u8; max_bytes];
        let n = self.socket.read_some(&mut buf).map_err(map_read_err)?;
        buf.truncate(n);
        Ok(Bytes::from(buf))
    }

    fn write(&mut self, data: &[u8], timeout: Option<Duration>) -> Result<(), Error> {
        self.socket
            .set_write_timeout(timeout)
            .map_err(|e| Error::Write(e.to_string()))?;
        self.socket.write_all_bytes(data).map_err(map_write_err)
    }

    fn close(&mut self) {
        self.socket.shutdown();
    }

    fn start_tls(
        self: Box<Self>,
        config: Arc<rustls::ClientConfig>,
        server_name: &str,
        timeout: Option<Duration>,
    ) -> Result<Box<dyn NetworkStream>, Error> {
        let (read, write) = self.into_halves();
        TlsStream::handshake(read, write, config, server_name, timeout)
            .map(|tls| Box::new(tls) as Box<dyn NetworkStream>)
    }

    fn into_halves(self: Box<Self>) -> (Box<dyn ReadStream>, Box<dyn WriteStream>) {
        let clone = self
            .socket
            .try_clone()
            .expect("socket clone for split failed");
        (
            Box::new(StdStream { socket: clone }),
            Box::new(StdStream {
                socket: self.socket,
            }),
        )
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.socket.peer_addr()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr()
    }

    fn is_readable(&self) -> bool {
        self.socket.is_readable()
    }
}

impl ReadStream for StdStream {
    fn read(&mut self, max_bytes: usize, timeout: Option<Duration>) -> Result<Bytes, Error> {
        NetworkStream::read(self, max_bytes, timeout)
    }

    fn is_readable(&self) -> bool {
        self.socket.is_readable()
    }
}

impl WriteStream for StdStream {
    fn write(&mut self, data: &[u8], timeout: Option<Duration>) -> Result<(), Error> {
        NetworkStream::write(self, data, timeout)
    }

    fn close(&mut self) {
        NetworkStream::close(self);
    }
}

// ── TLS over split halves ──────────────────────────────────────────────

/// A rustls session driven by hand over any transport halves.
///
/// Ciphertext is read from the transport without the session lock held,
/// then fed in under the lock; writers hold the lock across the encrypt
/// and transport write. That keeps a blocked reader from starving
/// writers, which the HTTP/2 engine depends on.
pub struct TlsStream {
    session: Arc<Mutex<rustls::ClientConnection>>,
    read: Box<dyn ReadStream>,
    write: TlsWriteHalf,
}

struct TlsWriteHalf {
    session: Arc<Mutex<rustls::ClientConnection>>,
    transport: Box<dyn WriteStream>,
}

struct TlsReadHalf {
    session: Arc<Mutex<rustls::ClientConnection>>,
    transport: Box<dyn ReadStream>,
}

impl TlsStream {
    fn handshake(
        mut read: Box<dyn ReadStream>,
        mut write: Box<dyn WriteStream>,
        config: Arc<rustls::ClientConfig>,
        server_name: &str,
        timeout: Option<Duration>,
    ) -> Result<TlsStream, Error> {
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|_| Error::Connect(format!("invalid TLS server name {server_name:?}")))?;
        let mut session = rustls::ClientConnection::new(config, name)
            .map_err(|e| Error::Connect(format!("TLS setup failed: {e}")))?;

        while session.is_handshaking() {
            while session.wants_write() {
                let mut out = Vec::new();
                session
                    .write_tls(&mut out)
                    .map_err(|e| Error::Connect(format!("TLS handshake failed: {e}")))?;
                write.write(&out, timeout).map_err(connect_phase_err)?;
            }
            if !session.is_handshaking() {
                break;
            }
            let chunk = read.read(READ_CHUNK, timeout).map_err(connect_phase_err)?;
            if chunk.is_empty() {
                return Err(Error::Connect(
                    "connection closed during TLS handshake".into(),
                ));
            }
            feed_ciphertext(&mut session, &chunk)
                .map_err(|e| Error::Connect(format!("TLS handshake failed: {e}")))?;
        }
        // Flush any handshake tail (e.g. the client Finished message).
        while session.wants_write() {
            let mut out = Vec::new();
            session
                .write_tls(&mut out)
                .map_err(|e| Error::Connect(format!("TLS handshake failed: {e}")))?;
            write.write(&out, timeout).map_err(connect_phase_err)?;
        }

        let session = Arc::new(Mutex::new(session));
        Ok(TlsStream {
            write: TlsWriteHalf {
                session: session.clone(),
                transport: write,
            },
            read,
            session,
        })
    }
}

/// TLS establishment failures count as connect-phase errors.
fn connect_phase_err(e: Error) -> Error {
    match e {
        Error::ReadTimeout | Error::WriteTimeout => Error::ConnectTimeout,
        Error::Read(msg) | Error::Write(msg) => Error::Connect(msg),
        other => other,
    }
}

fn feed_ciphertext(
    session: &mut rustls::ClientConnection,
    mut chunk: &[u8],
) -> Result<(), rustls::Error> {
    while !chunk.is_empty() {
        let n = session.read_tls(&mut chunk).map_err(|e| {
            rustls::Error::General(format!("tls transport feed failed: {e}"))
        })?;
        session.process_new_packets()?;
        if n == 0 {
            // Dropping ciphertext would corrupt the session.
            return Err(rustls::Error::General("tls deframer stalled".into()));
        }
    }
    Ok(())
}

fn tls_read(
    session: &Arc<Mutex<rustls::ClientConnection>>,
    transport: &mut Box<dyn ReadStream>,
    max_bytes: usize,
    timeout: Option<Duration>,
) -> Result<Bytes, Error> {
    let mut buf = vec![0u8; max_bytes];
    loop {
        {
            let mut session = session.lock().unwrap();
            match session.reader().read(&mut buf) {
                Ok(n) => {
                    buf.truncate(n);
                    return Ok(Bytes::from(buf));
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(Error::Read(format!("tls read failed: {e}"))),
            }
        }
        // Need more ciphertext; fetch it without the session locked.
        let chunk = transport.read(READ_CHUNK, timeout)?;
        if chunk.is_empty() {
            return Ok(Bytes::new());
        }
        let mut session = session.lock().unwrap();
        feed_ciphertext(&mut session, &chunk)
            .map_err(|e| Error::Read(format!("tls processing failed: {e}")))?;
    }
}

impl TlsWriteHalf {
    fn write_plaintext(&mut self, data: &[u8], timeout: Option<Duration>) -> Result<(), Error> {
        let mut session = self.session.lock().unwrap();
        session
            .writer()
            .write_all(data)
            .map_err(|e| Error::Write(format!("tls write failed: {e}")))?;
        while session.wants_write() {
            let mut out = Vec::new();
            session
                .write_tls(&mut out)
                .map_err(|e| Error::Write(format!("tls encode failed: {e}")))?;
            self.transport.write(&out, timeout)?;
        }
        Ok(())
    }

    fn send_close_notify(&mut self) {
        let mut session = self.session.lock().unwrap();
        session.send_close_notify();
        let mut out = Vec::new();
        if session.write_tls(&mut out).is_ok() {
            let _ = self.transport.write(&out, Some(Duration::from_millis(100)));
        }
        self.transport.close();
    }
}

impl NetworkStream for TlsStream {
    fn read(&mut self, max_bytes: usize, timeout: Option<Duration>) -> Result<Bytes, Error> {
        tls_read(&self.session, &mut self.read, max_bytes, timeout)
    }

    fn write(&mut self, data: &[u8], timeout: Option<Duration>) -> Result<(), Error> {
        self.write.write_plaintext(data, timeout)
    }

    fn close(&mut self) {
        self.write.send_close_notify();
    }

    fn start_tls(
        self: Box<Self>,
        config: Arc<rustls::ClientConfig>,
        server_name: &str,
        timeout: Option<Duration>,
    ) -> Result<Box<dyn NetworkStream>, Error> {
        // TLS inside TLS (an https proxy tunnelling an https origin):
        // the outer session becomes the transport for the inner one.
        let (read, write) = self.into_halves();
        TlsStream::handshake(read, write, config, server_name, timeout)
            .map(|tls| Box::new(tls) as Box<dyn NetworkStream>)
    }

    fn into_halves(self: Box<Self>) -> (Box<dyn ReadStream>, Box<dyn WriteStream>) {
        (
            Box::new(TlsReadHalf {
                session: self.session,
                transport: self.read,
            }),
            Box::new(self.write),
        )
    }

    fn negotiated_alpn(&self) -> Option<Vec<u8>> {
        self.session
            .lock()
            .unwrap()
            .alpn_protocol()
            .map(|p| p.to_vec())
    }

    fn is_readable(&self) -> bool {
        // Readable ciphertext on the raw transport. On an idle connection
        // that is a close, or at best pending TLS control data; either
        // way the connection must not be handed out again.
        self.read.is_readable()
    }
}

impl ReadStream for TlsReadHalf {
    fn read(&mut self, max_bytes: usize, timeout: Option<Duration>) -> Result<Bytes, Error> {
        tls_read(&self.session, &mut self.transport, max_bytes, timeout)
    }

    fn is_readable(&self) -> bool {
        self.transport.is_readable()
    }
}

impl WriteStream for TlsWriteHalf {
    fn write(&mut self, data: &[u8], timeout: Option<Duration>) -> Result<(), Error> {
        self.write_plaintext(data, timeout)
    }

    fn close(&mut self) {
        self.send_close_notify();
    }
}
