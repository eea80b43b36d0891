//! Transport-agnostic multipart send/recv.
//!
//! [`Endpoint`] is the seam every Listener, Dispatcher and Executor talks
//! through. Byte-stream transports (`ipc`, `tcp`) frame a `Vec<Bytes>` as a
//! `u32` LE part count followed by, for each part, a `u32` LE length and the
//! part's bytes — a direct generalization of the teacher's single-part
//! length-prefixed `FrameDecoder` (`socket/framing.rs`) to N parts.
//! `inproc` needs no wire encoding at all: both ends live in the same
//! process and exchange `Vec<Bytes>` straight through a channel.

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::{broadcast, mpsc};

use crate::error::BrokerError;

/// Ceiling on a single part's length, guarding against a corrupt length
/// prefix turning into an unbounded allocation.
const MAX_PART_SIZE: u32 = 64 * 1024 * 1024;

/// An endpoint capable of exchanging multipart messages.
///
/// Implementors are not required to be bidirectional: [`EventEndpoint`] is
/// publish-only and fails [`Endpoint::recv_multipart`] unconditionally.
#[async_trait]
pub trait Endpoint: Send {
    /// Send one multipart message.
    async fn send_multipart(&mut self, parts: Vec<Bytes>) -> Result<(), BrokerError>;
    /// Receive one multipart message, waiting for one to arrive.
    async fn recv_multipart(&mut self) -> Result<Vec<Bytes>, BrokerError>;
    /// Release any underlying resource (socket, channel half).
    fn close(&mut self);
}

/// Encode `parts` as `[u32 LE count][u32 LE len][bytes]...`.
pub fn encode_multipart(parts: &[Bytes]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + parts.iter().map(|p| 4 + p.len()).sum::<usize>());
    buf.extend_from_slice(&(parts.len() as u32).to_le_bytes());
    for part in parts {
        buf.extend_from_slice(&(part.len() as u32).to_le_bytes());
        buf.extend_from_slice(part);
    }
    buf
}

/// Incremental decoder for the length-prefixed multipart wire format.
///
/// Feed bytes as they arrive from a byte-stream transport and extract
/// complete multipart messages; partial messages remain buffered across
/// calls, mirroring `FrameDecoder::feed` in the teacher's socket framing.
#[derive(Debug, Default)]
pub struct MultipartDecoder {
    buf: BytesMut,
}

impl MultipartDecoder {
    /// Create an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the decoder has buffered but incomplete data.
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty()
    }

    /// Feed bytes and extract every complete multipart message now
    /// available.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<Vec<Bytes>>, BrokerError> {
        self.buf.extend_from_slice(bytes);
        let mut messages = Vec::new();

        loop {
            let mut cursor = &self.buf[..];
            if cursor.len() < 4 {
                break;
            }
            let part_count = cursor.get_u32_le() as usize;
            if part_count == 0 {
                return Err(BrokerError::Malformed("multipart message with zero parts".into()));
            }

            let mut offset = 4;
            let mut lengths = Vec::with_capacity(part_count);
            let mut complete = true;
            for _ in 0..part_count {
                if self.buf.len() < offset + 4 {
                    complete = false;
                    break;
                }
                let len = u32::from_le_bytes(self.buf[offset..offset + 4].try_into().unwrap());
                if len > MAX_PART_SIZE {
                    return Err(BrokerError::Malformed(format!(
                        "multipart part too large: {len} bytes (max {MAX_PART_SIZE})"
                    )));
                }
                offset += 4 + len as usize;
                lengths.push(len as usize);
                if self.buf.len() < offset {
                    complete = false;
                    break;
                }
            }
            if !complete || self.buf.len() < offset {
                break;
            }

            let mut parts = Vec::with_capacity(part_count);
            let mut pos = 4;
            for len in lengths {
                parts.push(Bytes::copy_from_slice(&self.buf[pos + 4..pos + 4 + len]));
                pos += 4 + len;
            }
            messages.push(parts);
            self.buf.advance(offset);
        }

        Ok(messages)
    }
}

/// Endpoint over an in-process channel pair. No wire encoding.
#[derive(Debug)]
pub struct InprocEndpoint {
    tx: mpsc::UnboundedSender<Vec<Bytes>>,
    rx: mpsc::UnboundedReceiver<Vec<Bytes>>,
}

impl InprocEndpoint {
    /// Build a connected pair of in-process endpoints.
    pub fn pair() -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        (Self { tx: tx_a, rx: rx_b }, Self { tx: tx_b, rx: rx_a })
    }
}

#[async_trait]
impl Endpoint for InprocEndpoint {
    async fn send_multipart(&mut self, parts: Vec<Bytes>) -> Result<(), BrokerError> {
        self.tx
            .send(parts)
            .map_err(|_| BrokerError::Transport("inproc peer dropped".into()))
    }

    async fn recv_multipart(&mut self) -> Result<Vec<Bytes>, BrokerError> {
        self.rx
            .recv()
            .await
            .ok_or_else(|| BrokerError::Transport("inproc peer dropped".into()))
    }

    fn close(&mut self) {
        self.rx.close();
    }
}

/// Endpoint over a byte-stream transport (Unix domain socket or TCP).
struct ByteStreamEndpoint<S> {
    stream: S,
    decoder: MultipartDecoder,
    read_buf: [u8; 64 * 1024],
}

impl<S> ByteStreamEndpoint<S>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send,
{
    fn new(stream: S) -> Self {
        Self {
            stream,
            decoder: MultipartDecoder::new(),
            read_buf: [0u8; 64 * 1024],
        }
    }

    async fn send_multipart(&mut self, parts: Vec<Bytes>) -> Result<(), BrokerError> {
        let wire = encode_multipart(&parts);
        self.stream
            .write_all(&wire)
            .await
            .map_err(|e| BrokerError::Transport(format!("write failed: {e}")))
    }

    async fn recv_multipart(&mut self) -> Result<Vec<Bytes>, BrokerError> {
        loop {
            let pending = self.decoder.feed(&[])?;
            if let Some(message) = pending.into_iter().next() {
                return Ok(message);
            }
            let n = self
                .stream
                .read(&mut self.read_buf)
                .await
                .map_err(|e| BrokerError::Transport(format!("read failed: {e}")))?;
            if n == 0 {
                return Err(BrokerError::Transport("connection closed".into()));
            }
            let mut messages = self.decoder.feed(&self.read_buf[..n])?;
            if !messages.is_empty() {
                return Ok(messages.remove(0));
            }
        }
    }
}

/// Endpoint over a Unix domain socket.
pub struct IpcEndpoint {
    inner: ByteStreamEndpoint<UnixStream>,
}

impl IpcEndpoint {
    /// Wrap an already-connected Unix stream.
    pub fn new(stream: UnixStream) -> Self {
        Self {
            inner: ByteStreamEndpoint::new(stream),
        }
    }
}

#[async_trait]
impl Endpoint for IpcEndpoint {
    async fn send_multipart(&mut self, parts: Vec<Bytes>) -> Result<(), BrokerError> {
        self.inner.send_multipart(parts).await
    }

    async fn recv_multipart(&mut self) -> Result<Vec<Bytes>, BrokerError> {
        self.inner.recv_multipart().await
    }

    fn close(&mut self) {
        let _ = self.inner.stream.shutdown();
    }
}

/// Endpoint over a TCP connection.
pub struct TcpEndpoint {
    inner: ByteStreamEndpoint<TcpStream>,
}

impl TcpEndpoint {
    /// Wrap an already-connected TCP stream.
    pub fn new(stream: TcpStream) -> Self {
        Self {
            inner: ByteStreamEndpoint::new(stream),
        }
    }
}

#[async_trait]
impl Endpoint for TcpEndpoint {
    async fn send_multipart(&mut self, parts: Vec<Bytes>) -> Result<(), BrokerError> {
        self.inner.send_multipart(parts).await
    }

    async fn recv_multipart(&mut self) -> Result<Vec<Bytes>, BrokerError> {
        self.inner.recv_multipart().await
    }

    fn close(&mut self) {
        let _ = self.inner.stream.shutdown();
    }
}

/// Publish-only endpoint backing [`crate::publisher::EventPublisher`].
///
/// `recv_multipart` always fails: this endpoint exists to push events out,
/// not to receive requests.
pub struct EventEndpoint {
    tx: broadcast::Sender<Vec<Bytes>>,
}

impl EventEndpoint {
    /// Build an event endpoint with the given broadcast channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to published events.
    pub fn subscribe(&self) -> broadcast::Receiver<Vec<Bytes>> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl Endpoint for EventEndpoint {
    async fn send_multipart(&mut self, parts: Vec<Bytes>) -> Result<(), BrokerError> {
        // A lagging or absent subscriber is not an error: events are
        // best-effort and unordered per spec.
        let _ = self.tx.send(parts);
        Ok(())
    }

    async fn recv_multipart(&mut self) -> Result<Vec<Bytes>, BrokerError> {
        Err(BrokerError::Unsupported("EventEndpoint is publish-only".into()))
    }

    fn close(&mut self) {}
}
