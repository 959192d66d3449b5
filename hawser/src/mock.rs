//! An in-memory backend for tests.
//!
//! Each connect pops the next read script off the queue and opens a
//! [`MockStream`] that serves those reads, records every write, and
//! performs a pretend TLS upgrade negotiating whatever ALPN protocol the
//! backend was configured with. Reads normally report EOF once the script
//! runs dry; with [`MockBackend::set_blocking_reads`] they wait instead,
//! and tests drip further bytes in with [`MockBackend::feed`].

use std::collections::VecDeque;
use std::net::IpAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Notify;

use crate::backend::{NetworkBackend, NetworkStream, ReadStream, WriteStream};
use crate::error::Error;

/// Everything observed on one mock connection.
#[derive(Default)]
pub struct ConnRecord {
    writes: Mutex<Vec<Vec<u8>>>,
    tls_started: AtomicBool,
    closed: AtomicBool,
}

impl ConnRecord {
    /// All bytes written on this connection, concatenated.
    pub fn written(&self) -> Vec<u8> {
        self.writes.lock().unwrap().concat()
    }

    /// Individual write calls, in order.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.writes.lock().unwrap().clone()
    }

    pub fn tls_started(&self) -> bool {
        self.tls_started.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn push_write(&self, data: &[u8]) {
        self.writes.lock().unwrap().push(data.to_vec());
    }

    pub(crate) fn mark_tls(&self) {
        self.tls_started.store(true, Ordering::SeqCst);
    }

    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

struct ReadQueue {
    chunks: Mutex<VecDeque<Bytes>>,
    fed: Notify,
}

impl ReadQueue {
    fn new(chunks: VecDeque<Bytes>) -> Self {
        Self {
            chunks: Mutex::new(chunks),
            fed: Notify::new(),
        }
    }

    async fn pop(&self, max_bytes: usize, block_on_empty: bool) -> Bytes {
        loop {
            let fed = self.fed.notified();
            {
                let mut chunks = self.chunks.lock().unwrap();
                match chunks.pop_front() {
                    Some(mut chunk) => {
                        if chunk.len() > max_bytes {
                            let rest = chunk.split_off(max_bytes);
                            chunks.push_front(rest);
                        }
                        return chunk;
                    }
                    None if !block_on_empty => return Bytes::new(),
                    None => {}
                }
            }
            fed.await;
        }
    }

    fn push(&self, data: Bytes) {
        self.chunks.lock().unwrap().push_back(data);
        self.fed.notify_waiters();
    }
}

struct Shared {
    scripts: Mutex<VecDeque<Vec<Bytes>>>,
    records: Mutex<Vec<Arc<ConnRecord>>>,
    queues: Mutex<Vec<Arc<ReadQueue>>>,
    connect_count: AtomicUsize,
    tls_count: AtomicUsize,
    alpn: Mutex<Option<Vec<u8>>>,
    /// Fail this many connects before succeeding again.
    connect_failures: AtomicUsize,
    /// Report idle streams as readable (a server-side disconnect).
    idle_readable: AtomicBool,
    /// Exhausted read queues wait for `feed` instead of reporting EOF.
    blocking_reads: AtomicBool,
}

/// Scripted in-memory [`NetworkBackend`].
#[derive(Clone)]
pub struct MockBackend {
    shared: Arc<Shared>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                scripts: Mutex::new(VecDeque::new()),
                records: Mutex::new(Vec::new()),
                queues: Mutex::new(Vec::new()),
                connect_count: AtomicUsize::new(0),
                tls_count: AtomicUsize::new(0),
                alpn: Mutex::new(None),
                connect_failures: AtomicUsize::new(0),
                idle_readable: AtomicBool::new(false),
                blocking_reads: AtomicBool::new(false),
            }),
        }
    }

    /// Queue the reads served by the next connection.
    pub fn push_script(&self, reads: Vec<Bytes>) {
        self.shared.scripts.lock().unwrap().push_back(reads);
    }

    /// Append bytes to an already-open connection's read queue.
    pub fn feed(&self, conn_index: usize, data: Bytes) {
        let queues = self.shared.queues.lock().unwrap();
        if let Some(queue) = queues.get(conn_index) {
            queue.push(data);
        }
    }

    /// ALPN protocol that pretend TLS upgrades will negotiate.
    pub fn set_alpn(&self, protocol: &[u8]) {
        *self.shared.alpn.lock().unwrap() = Some(protocol.to_vec());
    }

    /// Make the next `n` connects fail with a connect error.
    pub fn fail_next_connects(&self, n: usize) {
        self.shared.connect_failures.store(n, Ordering::SeqCst);
    }

    /// Report idle streams as readable, as a closing server socket would.
    pub fn set_idle_readable(&self, yes: bool) {
        self.shared.idle_readable.store(yes, Ordering::SeqCst);
    }

    /// Have exhausted read queues wait for [`MockBackend::feed`] rather
    /// than reporting EOF.
    pub fn set_blocking_reads(&self, yes: bool) {
        self.shared.blocking_reads.store(yes, Ordering::SeqCst);
    }

    pub fn connect_count(&self) -> usize {
        self.shared.connect_count.load(Ordering::SeqCst)
    }

    pub fn tls_count(&self) -> usize {
        self.shared.tls_count.load(Ordering::SeqCst)
    }

    /// Connection records in connect order.
    pub fn records(&self) -> Vec<Arc<ConnRecord>> {
        self.shared.records.lock().unwrap().clone()
    }

    fn open_stream(&self) -> Result<MockStream, Error> {
        if self
            .shared
            .connect_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::Connect("mock connect refused".into()));
        }
        self.shared.connect_count.fetch_add(1, Ordering::SeqCst);
        let reads = self
            .shared
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_default();
        let queue = Arc::new(ReadQueue::new(reads.into()));
        let record = Arc::new(ConnRecord::default());
        self.shared.records.lock().unwrap().push(record.clone());
        self.shared.queues.lock().unwrap().push(queue.clone());
        Ok(MockStream {
            queue,
            record,
            shared: self.shared.clone(),
            alpn: None,
        })
    }
}

#[async_trait]
impl NetworkBackend for MockBackend {
    async fn connect_tcp(
        &self,
        _host: &str,
        _port: u16,
        _timeout: Option<Duration>,
        _local_address: Option<IpAddr>,
    ) -> Result<Box<dyn NetworkStream>, Error> {
        Ok(Box::new(self.open_stream()?))
    }

    async fn connect_unix(
        &self,
        _path: &Path,
        _timeout: Option<Duration>,
    ) -> Result<Box<dyn NetworkStream>, Error> {
        Ok(Box::new(self.open_stream()?))
    }
}

/// Stream served by [`MockBackend`].
pub struct MockStream {
    queue: Arc<ReadQueue>,
    record: Arc<ConnRecord>,
    shared: Arc<Shared>,
    alpn: Option<Vec<u8>>,
}

impl MockStream {
    async fn pop_read(&self, max_bytes: usize, timeout: Option<Duration>) -> Result<Bytes, Error> {
        let block = self.shared.blocking_reads.load(Ordering::SeqCst);
        if block {
            if let Some(deadline) = timeout {
                return tokio::time::timeout(deadline, self.queue.pop(max_bytes, true))
                    .await
                    .map_err(|_| Error::ReadTimeout);
            }
        }
        Ok(self.queue.pop(max_bytes, block).await)
    }
}

#[async_trait]
impl NetworkStream for MockStream {
    async fn read(&mut self, max_bytes: usize, timeout: Option<Duration>) -> Result<Bytes, Error> {
        self.pop_read(max_bytes, timeout).await
    }

    async fn write(&mut self, data: &[u8], _timeout: Option<Duration>) -> Result<(), Error> {
        self.record.writes.lock().unwrap().push(data.to_vec());
        Ok(())
    }

    async fn close(&mut self) {
        self.record.closed.store(true, Ordering::SeqCst);
    }

    async fn start_tls(
        self: Box<Self>,
        _config: Arc<rustls::ClientConfig>,
        _server_name: &str,
        _timeout: Option<Duration>,
    ) -> Result<Box<dyn NetworkStream>, Error> {
        self.shared.tls_count.fetch_add(1, Ordering::SeqCst);
        self.record.tls_started.store(true, Ordering::SeqCst);
        let alpn = self.shared.alpn.lock().unwrap().clone();
        Ok(Box::new(MockStream {
            queue: self.queue.clone(),
            record: self.record.clone(),
            shared: self.shared.clone(),
            alpn,
        }))
    }

    fn into_halves(self: Box<Self>) -> (Box<dyn ReadStream>, Box<dyn WriteStream>) {
        let reader = MockStream {
            queue: self.queue.clone(),
            record: self.record.clone(),
            shared: self.shared.clone(),
            alpn: self.alpn.clone(),
        };
        (Box::new(reader), Box::new(*self))
    }

    fn negotiated_alpn(&self) -> Option<Vec<u8>> {
        self.alpn.clone()
    }

    fn is_readable(&self) -> bool {
        self.shared.idle_readable.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReadStream for MockStream {
    async fn read(&mut self, max_bytes: usize, timeout: Option<Duration>) -> Result<Bytes, Error> {
        self.pop_read(max_bytes, timeout).await
    }
}

#[async_trait]
impl WriteStream for MockStream {
    async fn write(&mut self, data: &[u8], _timeout: Option<Duration>) -> Result<(), Error> {
        self.record.writes.lock().unwrap().push(data.to_vec());
        Ok(())
    }

    async fn close(&mut self) {
        self.record.closed.store(true, Ordering::SeqCst);
    }
}
