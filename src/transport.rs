//! # Framed Message Transport
//!
//! The network layer does not care how bytes move, only that it can send and
//! receive whole frames. This module provides that capability over
//! arbitrary async byte streams.
//!
//! ## Wire Format
//!
//! ```text
//! +-------------------+---------------------+
//! | length (u32, BE)  | frame (length bytes) |
//! +-------------------+---------------------+
//! ```
//!
//! ## Implementations
//!
//! | Type | Backing | Use |
//! |------|---------|-----|
//! | [`TcpDialer`] / [`TcpListener`] | `tokio::net` | Production |
//! | [`MemoryTransport`] | `tokio::io::duplex` | Tests; lets a test choose a tiny buffer to stall a writer |
//!
//! A [`Connection`] is split into a [`MessageSource`] and a [`MessageSink`]
//! so that a peer's read and write loops own their halves independently.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::protocol::{MAX_MESSAGE_SIZE, dial_target};

/// Default capacity of an in-memory duplex pipe.
pub const DEFAULT_MEMORY_PIPE_CAPACITY: usize = 64 * 1024;

/// Pending connections a memory listener buffers before dials block.
const MEMORY_ACCEPT_BACKLOG: usize = 64;

#[async_trait]
pub trait MessageSource: Send {
    /// Next frame, or `None` on clean end-of-stream.
    async fn recv_message(&mut self) -> Result<Option<Vec<u8>>>;
}

#[async_trait]
pub trait MessageSink: Send {
    async fn send_message(&mut self, frame: &[u8]) -> Result<()>;
    async fn close(&mut self) -> Result<()>;
}

/// Length-prefixed reader over any async byte stream.
pub struct FramedReader<R> {
    inner: R,
    max_frame_size: usize,
}

impl<R> FramedReader<R> {
    pub fn new(inner: R, max_frame_size: usize) -> Self {
        Self {
            inner,
            max_frame_size,
        }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> MessageSource for FramedReader<R> {
    async fn recv_message(&mut self) -> Result<Option<Vec<u8>>> {
        let mut len_buf = [0u8; 4];
        match self.inner.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e).context("failed to read frame length"),
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        // SECURITY: never allocate more than the configured maximum.
        if len > self.max_frame_size {
            bail!("frame too large: {} bytes (max {})", len, self.max_frame_size);
        }
        let mut frame = vec![0u8; len];
        self.inner
            .read_exact(&mut frame)
            .await
            .context("failed to read frame body")?;
        Ok(Some(frame))
    }
}

/// Length-prefixed writer over any async byte stream.
pub struct FramedWriter<W> {
    inner: W,
    max_frame_size: usize,
}

impl<W> FramedWriter<W> {
    pub fn new(inner: W, max_frame_size: usize) -> Self {
        Self {
            inner,
            max_frame_size,
        }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> MessageSink for FramedWriter<W> {
    async fn send_message(&mut self, frame: &[u8]) -> Result<()> {
        if frame.len() > self.max_frame_size {
            bail!("frame too large: {} bytes (max {})", frame.len(), self.max_frame_size);
        }
        let len = frame.len() as u32;
        self.inner.write_all(&len.to_be_bytes()).await?;
        self.inner.write_all(frame).await?;
        self.inner.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

/// A bidirectional framed connection to one remote endpoint.
pub struct Connection {
    reader: Box<dyn MessageSource>,
    writer: Box<dyn MessageSink>,
    remote_addr: String,
}

impl Connection {
    pub fn new(
        reader: Box<dyn MessageSource>,
        writer: Box<dyn MessageSink>,
        remote_addr: impl Into<String>,
    ) -> Self {
        Self {
            reader,
            writer,
            remote_addr: remote_addr.into(),
        }
    }

    pub fn from_tcp(stream: TcpStream, max_frame_size: usize) -> Result<Self> {
        let remote = stream.peer_addr().context("tcp stream has no peer address")?;
        let _ = stream.set_nodelay(true);
        let (read, write) = stream.into_split();
        Ok(Self::new(
            Box::new(FramedReader::new(read, max_frame_size)),
            Box::new(FramedWriter::new(write, max_frame_size)),
            remote.to_string(),
        ))
    }

    /// Two connected in-memory endpoints. `capacity` bounds the bytes in
    /// flight in each direction; a writer blocks once it is reached.
    pub fn memory_pair(
        capacity: usize,
        max_frame_size: usize,
        a_addr: impl Into<String>,
        b_addr: impl Into<String>,
    ) -> (Self, Self) {
        let (a, b) = tokio::io::duplex(capacity);
        let (a_read, a_write) = tokio::io::split(a);
        let (b_read, b_write) = tokio::io::split(b);
        let a_conn = Self::new(
            Box::new(FramedReader::new(a_read, max_frame_size)),
            Box::new(FramedWriter::new(a_write, max_frame_size)),
            b_addr,
        );
        let b_conn = Self::new(
            Box::new(FramedReader::new(b_read, max_frame_size)),
            Box::new(FramedWriter::new(b_write, max_frame_size)),
            a_addr,
        );
        (a_conn, b_conn)
    }

    #[inline]
    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    pub async fn send_message(&mut self, frame: &[u8]) -> Result<()> {
        self.writer.send_message(frame).await
    }

    pub async fn recv_message(&mut self) -> Result<Option<Vec<u8>>> {
        self.reader.recv_message().await
    }

    pub async fn close(&mut self) -> Result<()> {
        self.writer.close().await
    }

    pub fn into_split(self) -> (Box<dyn MessageSource>, Box<dyn MessageSink>, String) {
        (self.reader, self.writer, self.remote_addr)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("remote_addr", &self.remote_addr)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Dialing and Listening
// ============================================================================

#[async_trait]
pub trait Dialer: Send + Sync {
    /// Open a connection to a phonebook or gossip address.
    async fn dial(&self, addr: &str) -> Result<Connection>;
}

#[async_trait]
pub trait Listener: Send {
    async fn accept(&mut self) -> Result<Connection>;
    fn local_addr(&self) -> Result<String>;
}

#[derive(Debug, Clone)]
pub struct TcpDialer {
    max_frame_size: usize,
}

impl TcpDialer {
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

impl Default for TcpDialer {
    fn default() -> Self {
        Self::new(MAX_MESSAGE_SIZE)
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, addr: &str) -> Result<Connection> {
        let target = dial_target(addr).with_context(|| format!("invalid address {addr}"))?;
        trace!(target = %target, "dialing");
        let stream = TcpStream::connect(&target)
            .await
            .with_context(|| format!("failed to connect to {target}"))?;
        Connection::from_tcp(stream, self.max_frame_size)
    }
}

pub struct TcpListener {
    inner: tokio::net::TcpListener,
    max_frame_size: usize,
}

impl TcpListener {
    pub async fn bind(addr: &str, max_frame_size: usize) -> Result<Self> {
        let inner = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        Ok(Self {
            inner,
            max_frame_size,
        })
    }
}

#[async_trait]
impl Listener for TcpListener {
    async fn accept(&mut self) -> Result<Connection> {
        let (stream, remote) = self.inner.accept().await.context("accept failed")?;
        debug!(remote = %remote, "accepted tcp connection");
        Connection::from_tcp(stream, self.max_frame_size)
    }

    fn local_addr(&self) -> Result<String> {
        Ok(self.inner.local_addr()?.to_string())
    }
}

// ============================================================================
// In-Memory Transport
// ============================================================================

/// A process-local switchboard of listeners reachable by name. Addresses
/// look like `memN:N` so that they survive gossip URL conversion.
#[derive(Clone)]
pub struct MemoryTransport {
    listeners: Arc<Mutex<HashMap<String, mpsc::Sender<Connection>>>>,
    next_id: Arc<AtomicU32>,
    pipe_capacity: usize,
    max_frame_size: usize,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::with_pipe_capacity(DEFAULT_MEMORY_PIPE_CAPACITY)
    }

    pub fn with_pipe_capacity(pipe_capacity: usize) -> Self {
        Self {
            listeners: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU32::new(1)),
            pipe_capacity,
            max_frame_size: MAX_MESSAGE_SIZE,
        }
    }

    fn allocate_addr(&self) -> String {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        format!("mem{id}:{id}")
    }

    pub fn listen(&self) -> MemoryListener {
        let addr = self.allocate_addr();
        let (tx, rx) = mpsc::channel(MEMORY_ACCEPT_BACKLOG);
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(addr.clone(), tx);
        MemoryListener {
            addr,
            incoming: rx,
            listeners: self.listeners.clone(),
        }
    }

    /// Connect with an explicit pipe capacity, overriding the default.
    pub async fn dial_with_capacity(&self, addr: &str, capacity: usize) -> Result<Connection> {
        let target = dial_target(addr).with_context(|| format!("invalid address {addr}"))?;
        let tx = self
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&target)
            .cloned()
            .ok_or_else(|| anyhow!("connection refused: {target}"))?;
        let local = self.allocate_addr();
        let (ours, theirs) =
            Connection::memory_pair(capacity, self.max_frame_size, local, target.clone());
        tx.send(theirs)
            .await
            .map_err(|_| anyhow!("connection refused: {target}"))?;
        Ok(ours)
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Dialer for MemoryTransport {
    async fn dial(&self, addr: &str) -> Result<Connection> {
        self.dial_with_capacity(addr, self.pipe_capacity).await
    }
}

pub struct MemoryListener {
    addr: String,
    incoming: mpsc::Receiver<Connection>,
    listeners: Arc<Mutex<HashMap<String, mpsc::Sender<Connection>>>>,
}

#[async_trait]
impl Listener for MemoryListener {
    async fn accept(&mut self) -> Result<Connection> {
        self.incoming
            .recv()
            .await
            .ok_or_else(|| anyhow!("memory listener closed"))
    }

    fn local_addr(&self) -> Result<String> {
        Ok(self.addr.clone())
    }
}

impl Drop for MemoryListener {
    fn drop(&mut self) {
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn memory_pair_exchanges_frames() {
        let (mut a, mut b) = Connection::memory_pair(1024, 1024, "a:1", "b:1");
        assert_eq!(a.remote_addr(), "b:1");
        assert_eq!(b.remote_addr(), "a:1");

        a.send_message(b"hello").await.unwrap();
        a.send_message(b"").await.unwrap();
        assert_eq!(b.recv_message().await.unwrap().unwrap(), b"hello");
        assert_eq!(b.recv_message().await.unwrap().unwrap(), b"");

        a.close().await.unwrap();
        assert!(b.recv_message().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversized_frames_are_rejected() {
        let (mut a, mut b) = Connection::memory_pair(1024, 8, "a:1", "b:1");
        assert!(a.send_message(&[0u8; 9]).await.is_err());

        // Bypass the writer check by writing a raw length prefix.
        let (a_raw, b_raw) = tokio::io::duplex(64);
        let mut reader = FramedReader::new(b_raw, 8);
        let mut a_raw = a_raw;
        a_raw.write_all(&100u32.to_be_bytes()).await.unwrap();
        assert!(reader.recv_message().await.is_err());

        a.send_message(b"ok").await.unwrap();
        assert_eq!(b.recv_message().await.unwrap().unwrap(), b"ok");
    }

    #[tokio::test]
    async fn writer_blocks_when_pipe_is_full() {
        let (mut a, _b) = Connection::memory_pair(16, 1024, "a:1", "b:1");
        let result = tokio::time::timeout(Duration::from_millis(100), a.send_message(&[7u8; 64])).await;
        assert!(result.is_err(), "write should stall on a full pipe");
    }

    #[tokio::test]
    async fn memory_transport_dial_and_accept() {
        let transport = MemoryTransport::new();
        let mut listener = transport.listen();
        let addr = listener.local_addr().unwrap();

        let mut client = transport.dial(&format!("ws://{addr}/v1/g/gossip")).await.unwrap();
        let mut server = listener.accept().await.unwrap();

        client.send_message(b"ping").await.unwrap();
        assert_eq!(server.recv_message().await.unwrap().unwrap(), b"ping");
        assert_eq!(client.remote_addr(), addr);

        drop(listener);
        assert!(transport.dial(&addr).await.is_err());
    }

    #[tokio::test]
    async fn tcp_dial_and_accept() {
        let mut listener = TcpListener::bind("127.0.0.1:0", 1024).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let dialer = TcpDialer::new(1024);

        let (client, server) = tokio::join!(dialer.dial(&addr), listener.accept());
        let mut client = client.unwrap();
        let mut server = server.unwrap();

        server.send_message(b"pong").await.unwrap();
        assert_eq!(client.recv_message().await.unwrap().unwrap(), b"pong");
    }
}
