//! An in-memory backend for tests against the blocking surface.
//!
//! The same scripted model as the async mock: each connect pops the next
//! read script, writes are recorded per connection, and a pretend TLS
//! upgrade negotiates the configured ALPN protocol.

use std::collections::VecDeque;
use std::net::IpAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use bytes::Bytes;

use crate::blocking::backend::{NetworkBackend, NetworkStream, ReadStream, WriteStream};
use crate::error::Error;

pub use crate::mock::ConnRecord;

struct ReadQueue {
    chunks: Mutex<VecDeque<Bytes>>,
    fed: Condvar,
}

impl ReadQueue {
    fn new(chunks: VecDeque<Bytes>) -> Self {
        Self {
            chunks: Mutex::new(chunks),
            fed: Condvar::new(),
        }
    }

    fn pop(
        &self,
        max_bytes: usize,
        block_on_empty: bool,
        timeout: Option<Duration>,
    ) -> Result<Bytes, Error> {
        let deadline = timeout.map(|d| std::time::Instant::now() + d);
        let mut chunks = self.chunks.lock().unwrap();
        loop {
            match chunks.pop_front() {
                Some(mut chunk) => {
                    if chunk.len() > max_bytes {
                        let rest = chunk.split_off(max_bytes);
                        chunks.push_front(rest);
                    }
                    return Ok(chunk);
                }
                None if !block_on_empty => return Ok(Bytes::new()),
                None => match deadline {
                    None => chunks = self.fed.wait(chunks).unwrap(),
                    Some(deadline) => {
                        let now = std::time::Instant::now();
                        if now >= deadline {
                            return Err(Error::ReadTimeout);
                        }
                        chunks = self.fed.wait_timeout(chunks, deadline - now).unwrap().0;
                    }
                },
            }
        }
    }

    fn push(&self, data: Bytes) {
        self.chunks.lock().unwrap().push_back(data);
        self.fed.notify_all();
    }
}

struct Shared {
    scripts: Mutex<VecDeque<Vec<Bytes>>>,
    records: Mutex<Vec<Arc<ConnRecord>>>,
    queues: Mutex<Vec<Arc<ReadQueue>>>,
    connect_count: AtomicUsize,
    tls_count: AtomicUsize,
    alpn: Mutex<Option<Vec<u8>>>,
    connect_failures: AtomicUsize,
    idle_readable: AtomicBool,
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

    pub fn set_alpn(&self, protocol: &[u8]) {
        *self.shared.alpn.lock().unwrap() = Some(protocol.to_vec());
    }

    pub fn fail_next_connects(&self, n: usize) {
        self.shared.connect_failures.store(n, Ordering::SeqCst);
    }

    pub fn set_idle_readable(&self, yes: bool) {
        self.shared.idle_readable.store(yes, Ordering::SeqCst);
    }

    pub fn set_blocking_reads(&self, yes: bool) {
        self.shared.blocking_reads.store(yes, Ordering::SeqCst);
    }

    pub fn connect_count(&self) -> usize {
        self.shared.connect_count.load(Ordering::SeqCst)
    }

    pub fn tls_count(&self) -> usize {
        self.shared.tls_count.load(Ordering::SeqCst)
    }

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

impl NetworkBackend for MockBackend {
    fn connect_tcp(
        &self,
        _host: &str,
        _port: u16,
        _timeout: Option<Duration>,
        _local_address: Option<IpAddr>,
    ) -> Result<Box<dyn NetworkStream>, Error> {
        Ok(Box::new(self.open_stream()?))
    }

    fn connect_unix(
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
    fn pop_read(&self, max_bytes: usize, timeout: Option<Duration>) -> Result<Bytes, Error> {
        let block = self.shared.blocking_reads.load(Ordering::SeqCst);
        self.queue.pop(max_bytes, block, timeout)
    }

    fn record_write(&self, data: &[u8]) {
        self.record.push_write(data);
    }
}

impl NetworkStream for MockStream {
    fn read(&mut self, max_bytes: usize, timeout: Option<Duration>) -> Result<Bytes, Error> {
        self.pop_read(max_bytes, timeout)
    }

    fn write(&mut self, data: &[u8], _timeout: Option<Duration>) -> Result<(), Error> {
        self.record_write(data);
        Ok(())
    }

    fn close(&mut self) {
        self.record.mark_closed();
    }

    fn start_tls(
        self: Box<Self>,
        _config: Arc<rustls::ClientConfig>,
        _server_name: &str,
        _timeout: Option<Duration>,
    ) -> Result<Box<dyn NetworkStream>, Error> {
        self.shared.tls_count.fetch_add(1, Ordering::SeqCst);
        self.record.mark_tls();
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

impl ReadStream for MockStream {
    fn read(&mut self, max_bytes: usize, timeout: Option<Duration>) -> Result<Bytes, Error> {
        self.pop_read(max_bytes, timeout)
    }
}

impl WriteStream for MockStream {
    fn write(&mut self, data: &[u8], _timeout: Option<Duration>) -> Result<(), Error> {
        self.record_write(data);
        Ok(())
    }

    fn close(&mut self) {
        self.record.mark_closed();
    }
}
