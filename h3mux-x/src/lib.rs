//! h3mux-x: Collaborator Interfaces for the h3mux Session Layer
//!
//! This crate defines the contract between the HTTP/3 session layer and its
//! three external collaborators:
//!
//! - **Transport** ([`QuicConnection`] / [`QuicStreamIo`]): an established QUIC
//!   connection exposing independently flow-controlled byte streams with
//!   non-blocking read/write, stream open/accept, an event-advance primitive
//!   and readiness polling.
//! - **Protocol engine** ([`H3Engine`]): the HTTP/3 state machine translating
//!   between QUIC stream bytes and HTTP/3 framing. Engine activity is reported
//!   as [`H3Event`] values returned from the ingest and close entrypoints;
//!   outbound body bytes are pulled through the [`BodySource`] trait.
//! - **Bodies and headers** ([`DataProvider`] / [`DataConsumer`] /
//!   [`ResponseSink`]): incremental sources and sinks for request and response
//!   bodies, and the sink receiving decoded response headers.
//!
//! # Threading Model
//!
//! The session layer is single-threaded and cooperatively scheduled: all
//! trait methods here are invoked from the one thread that drives the session.
//! Implementations need not be `Send` or `Sync`.
//!
//! # Zero-Copy Data Transfer
//!
//! All payload movement uses `bytes::Bytes` (reference-counted buffers), so a
//! provider with persistent backing storage can hand out views without copies.

#![forbid(unsafe_code)]

use bytes::Bytes;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// Identifiers
// ============================================================================

/// Unique identifier for a stream within a connection.
///
/// QUIC stream ids are unsigned 62-bit integers assigned by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u64);

impl StreamId {
    /// Check if this is a client-initiated stream.
    pub fn is_client_initiated(&self) -> bool {
        (self.0 & 0x1) == 0
    }

    /// Check if this is a server-initiated stream.
    pub fn is_server_initiated(&self) -> bool {
        !self.is_client_initiated()
    }

    /// Check if this is a bidirectional stream.
    pub fn is_bidirectional(&self) -> bool {
        (self.0 & 0x2) == 0
    }

    /// Check if this is a unidirectional stream.
    pub fn is_unidirectional(&self) -> bool {
        !self.is_bidirectional()
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Direction of a stream requested from the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamDirection {
    /// Carries data in both directions (request/response exchange).
    Bidirectional,
    /// Carries data from the opener to the peer only (management streams).
    Unidirectional,
}

// ============================================================================
// Transport Collaborator
// ============================================================================

/// Error reported by the transport collaborator.
///
/// Transient conditions (would-block, clean end-of-stream, peer reset) are
/// *not* errors; they are distinguishable [`ReadOutcome`] / [`WriteOutcome`]
/// variants. This type covers terminal transport failures only.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct TransportError {
    pub message: String,
}

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

/// Outcome of a non-blocking stream read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// `n` bytes were read into the supplied buffer.
    Read(usize),
    /// No data available right now; retry after the next readiness event.
    WouldBlock,
    /// The peer concluded the stream normally (FIN).
    Finished,
    /// The peer reset the stream with the given application error code.
    Reset(u64),
}

/// Outcome of a non-blocking stream write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// `n` bytes were accepted by the transport send buffer.
    Written(usize),
    /// The send buffer is full; retry after the stream becomes writable.
    WouldBlock,
}

/// One QUIC stream as seen by the session layer.
///
/// Handles are single-owner values; dropping the handle releases the
/// transport-side stream object.
pub trait QuicStreamIo {
    /// The transport-assigned stream id. Immutable for the handle's lifetime.
    fn id(&self) -> StreamId;

    /// Non-blocking read into `buf`.
    fn read(&mut self, buf: &mut [u8]) -> Result<ReadOutcome, TransportError>;

    /// Non-blocking write of `data`. When `fin` is set the transport concludes
    /// the stream once all buffered data has been sent.
    fn write(&mut self, data: &[u8], fin: bool) -> Result<WriteOutcome, TransportError>;

    /// Poll (without blocking) whether the stream can currently accept writes.
    fn poll_writable(&mut self) -> bool;

    /// Reset the stream towards the peer with an application error code.
    fn reset(&mut self, error_code: u64) -> Result<(), TransportError>;
}

/// One established QUIC connection as seen by the session layer.
pub trait QuicConnection {
    /// Switch the connection between blocking and non-blocking mode.
    ///
    /// The session layer requires non-blocking mode; it verifies the switch
    /// via [`QuicConnection::is_non_blocking`] and treats a transport stuck in
    /// blocking mode as a fatal configuration error.
    fn set_non_blocking(&mut self, enabled: bool) -> Result<(), TransportError>;

    /// Query the current blocking mode.
    fn is_non_blocking(&self) -> bool;

    /// Open a new locally-initiated stream.
    ///
    /// `advance` requests that the transport assign the stream id immediately
    /// rather than deferring until the first write.
    fn open_stream(
        &mut self,
        direction: StreamDirection,
        advance: bool,
    ) -> Result<Box<dyn QuicStreamIo>, TransportError>;

    /// Accept one peer-initiated stream, if any is pending. Never blocks.
    fn accept_stream(&mut self) -> Option<Box<dyn QuicStreamIo>>;

    /// Let the transport advance internal timers and process queued events.
    fn handle_events(&mut self);

    /// Time until the transport next needs [`QuicConnection::handle_events`]
    /// called, or `None` if no internal timer is armed.
    fn next_timeout(&mut self) -> Option<Duration>;

    /// Wait until the connection is readable.
    ///
    /// With `Some(timeout)` this blocks up to the given duration; with `None`
    /// it polls and returns immediately. Returns `true` if readable.
    fn poll_readable(&mut self, timeout: Option<Duration>) -> bool;
}

// ============================================================================
// Protocol Engine Collaborator
// ============================================================================

/// Error reported by the protocol engine collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct EngineError {
    pub message: String,
}

impl EngineError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

/// One HTTP header as submitted to the engine (wire form, lowercase names).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: Bytes,
    pub value: Bytes,
}

impl Header {
    pub fn new(name: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self { name: name.into(), value: value.into() }
    }
}

/// Protocol activity reported by the engine.
///
/// Events are returned from [`H3Engine::read_stream`] and
/// [`H3Engine::close_stream`] in the order the engine produced them; the
/// session dispatches each to the stream it names. An event naming a stream
/// the session no longer tracks is a benign no-op (the engine's bookkeeping
/// can briefly outlive a purged stream).
#[derive(Debug, Clone)]
pub enum H3Event {
    /// One decoded response header field.
    Header {
        stream_id: StreamId,
        name: Bytes,
        value: Bytes,
    },
    /// All headers for the current field section were delivered.
    EndHeaders { stream_id: StreamId, fin: bool },
    /// Decoded body bytes. These count towards application-consumed data.
    Data { stream_id: StreamId, data: Bytes },
    /// The peer finished the stream at the HTTP/3 level.
    EndStream { stream_id: StreamId },
    /// The stream was closed (normally or abnormally).
    StreamClosed { stream_id: StreamId, error_code: u64 },
    /// The peer asked us to stop sending on this stream.
    StopSending { stream_id: StreamId, error_code: u64 },
    /// The peer reset the stream.
    ResetStream { stream_id: StreamId, error_code: u64 },
    /// Application data consumed outside a `Data` delivery.
    /// Counts towards application-consumed data.
    DeferredConsume { stream_id: StreamId, consumed: usize },
    /// The engine acknowledged outbound body data up to a cumulative total.
    AckedStreamData { stream_id: StreamId, total_acked: u64 },
}

impl H3Event {
    /// The stream this event refers to.
    pub fn stream_id(&self) -> StreamId {
        match self {
            H3Event::Header { stream_id, .. }
            | H3Event::EndHeaders { stream_id, .. }
            | H3Event::Data { stream_id, .. }
            | H3Event::EndStream { stream_id }
            | H3Event::StreamClosed { stream_id, .. }
            | H3Event::StopSending { stream_id, .. }
            | H3Event::ResetStream { stream_id, .. }
            | H3Event::DeferredConsume { stream_id, .. }
            | H3Event::AckedStreamData { stream_id, .. } => *stream_id,
        }
    }
}

/// A batch of send vectors the engine wants written to one stream.
#[derive(Debug, Clone)]
pub struct OutboundBatch {
    pub stream_id: StreamId,
    pub vecs: Vec<Bytes>,
    /// Conclude the stream after all vectors have been written.
    pub fin: bool,
}

/// One chunk of outbound body data pulled from a [`BodySource`].
#[derive(Debug, Clone)]
pub struct BodyChunk {
    /// Body bytes, or `None` when no data is available.
    pub data: Option<Bytes>,
    /// Set once the body is exhausted; the engine must not ask again.
    pub eof: bool,
}

impl BodyChunk {
    /// A chunk signalling end of the body.
    pub fn end() -> Self {
        Self { data: None, eof: true }
    }

    /// A chunk carrying body bytes.
    pub fn data(data: Bytes) -> Self {
        Self { data: Some(data), eof: false }
    }
}

/// Pull interface the engine uses to obtain outbound body bytes while
/// generating DATA frames in [`H3Engine::writev_stream`].
pub trait BodySource {
    fn pull_body(&mut self, stream_id: StreamId) -> BodyChunk;
}

/// The HTTP/3 protocol engine.
///
/// The engine is opaque to the session beyond this trait: it owns QPACK state,
/// frame parsing and generation, and per-stream HTTP/3 bookkeeping. The
/// session owns exactly one engine instance for the connection's lifetime.
pub trait H3Engine {
    /// Bind the locally-created control stream id.
    fn bind_control_stream(&mut self, stream_id: StreamId) -> Result<(), EngineError>;

    /// Bind the locally-created QPACK encoder and decoder stream ids.
    ///
    /// Incoming management streams need no binding; the engine infers their
    /// ids from the stream-type byte that starts every unidirectional stream.
    fn bind_qpack_streams(
        &mut self,
        encoder: StreamId,
        decoder: StreamId,
    ) -> Result<(), EngineError>;

    /// Submit a client request on `stream_id`.
    ///
    /// `headers` is the complete wire-form field list including pseudo-headers.
    /// When `has_body` is set the engine will pull body bytes through the
    /// [`BodySource`] passed to [`H3Engine::writev_stream`].
    fn submit_request(
        &mut self,
        stream_id: StreamId,
        headers: &[Header],
        has_body: bool,
    ) -> Result<(), EngineError>;

    /// Feed bytes received from the transport into the engine.
    ///
    /// Returns the number of non-application bytes consumed directly, plus the
    /// protocol events produced while parsing. Application bytes consumed are
    /// reported through `Data` / `DeferredConsume` events; the caller sums the
    /// two to learn the total consumed from `data`.
    fn read_stream(
        &mut self,
        stream_id: StreamId,
        data: &[u8],
        fin: bool,
    ) -> Result<(usize, Vec<H3Event>), EngineError>;

    /// Ask the engine for the next batch of send vectors.
    ///
    /// Returns at most `max_vecs` vectors for a single stream, or `None` when
    /// the engine has nothing to send right now.
    fn writev_stream(
        &mut self,
        source: &mut dyn BodySource,
        max_vecs: usize,
    ) -> Result<Option<OutboundBatch>, EngineError>;

    /// Stop generating send data for a stream (transport cannot accept more).
    fn block_stream(&mut self, stream_id: StreamId);

    /// Resume generating send data for a previously blocked stream.
    fn unblock_stream(&mut self, stream_id: StreamId);

    /// Record that `n` bytes offered by `writev_stream` were written.
    fn add_write_offset(&mut self, stream_id: StreamId, n: usize) -> Result<(), EngineError>;

    /// Record that `n` bytes no longer need to be retained for retransmission.
    fn add_ack_offset(&mut self, stream_id: StreamId, n: usize) -> Result<(), EngineError>;

    /// Notify the engine that the transport closed or reset a stream.
    ///
    /// Returns the protocol events produced by the closure.
    fn close_stream(
        &mut self,
        stream_id: StreamId,
        app_error_code: u64,
    ) -> Result<Vec<H3Event>, EngineError>;
}

// ============================================================================
// Body Collaborators
// ============================================================================

/// Incremental source of request body bytes.
pub trait DataProvider {
    /// Copy up to `buf.len()` bytes into `buf`, returning the count copied.
    /// Used when the provider's storage is not directly referenceable.
    fn read(&mut self, buf: &mut [u8]) -> usize;

    /// Zero-copy path: hand out a view of persistent backing storage.
    ///
    /// Returns `None` when the provider has no persistent storage (the caller
    /// must fall back to [`DataProvider::read`] and buffer the bytes itself
    /// until they are acknowledged).
    fn read_view(&mut self) -> Option<Bytes>;

    /// True once the provider has no more data to give.
    fn is_eof(&self) -> bool;
}

/// Incremental sink for response body bytes.
pub trait DataConsumer {
    /// Accept body bytes, returning the count written.
    fn write(&mut self, data: &[u8]) -> usize;

    /// Called exactly once when the response body is complete (or the stream
    /// was reset).
    fn set_finished(&mut self);
}

/// A [`DataProvider`] over an in-memory byte buffer (zero-copy).
pub struct BytesProvider {
    data: Bytes,
    chunk_size: usize,
}

impl BytesProvider {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into(), chunk_size: usize::MAX }
    }

    /// Limit the size of individual chunks handed out by `read_view`.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }
}

impl DataProvider for BytesProvider {
    fn read(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.data.len());
        buf[..n].copy_from_slice(&self.data[..n]);
        self.data = self.data.slice(n..);
        n
    }

    fn read_view(&mut self) -> Option<Bytes> {
        let n = self.chunk_size.min(self.data.len());
        Some(self.data.split_to(n))
    }

    fn is_eof(&self) -> bool {
        self.data.is_empty()
    }
}

/// A [`DataConsumer`] collecting the response body into memory.
///
/// The consumer half is owned by the stream; [`BufferConsumer::handle`] gives
/// the caller a shared view for reading the collected bytes afterwards. The
/// session layer is single-threaded, so the handle uses `Rc`.
pub struct BufferConsumer {
    inner: std::rc::Rc<std::cell::RefCell<BufferConsumerState>>,
}

/// Observable state of a [`BufferConsumer`].
#[derive(Default)]
pub struct BufferConsumerState {
    pub data: Vec<u8>,
    pub finished: bool,
}

impl BufferConsumer {
    pub fn new() -> Self {
        Self { inner: Default::default() }
    }

    /// A shared handle to the collected body and completion flag.
    pub fn handle(&self) -> std::rc::Rc<std::cell::RefCell<BufferConsumerState>> {
        self.inner.clone()
    }
}

impl Default for BufferConsumer {
    fn default() -> Self {
        Self::new()
    }
}

impl DataConsumer for BufferConsumer {
    fn write(&mut self, data: &[u8]) -> usize {
        self.inner.borrow_mut().data.extend_from_slice(data);
        data.len()
    }

    fn set_finished(&mut self) {
        self.inner.borrow_mut().finished = true;
    }
}

// ============================================================================
// Response Header Sink
// ============================================================================

/// Sink receiving decoded response headers for one exchange.
pub trait ResponseSink {
    /// The `:status` pseudo-header value.
    fn set_status(&mut self, status: u16);

    /// One regular header field (names are lowercase on the wire).
    fn add_header(&mut self, name: Bytes, value: Bytes);
}

/// A plain response-header container implementing [`ResponseSink`].
#[derive(Debug, Default, Clone)]
pub struct ResponseHeaders {
    pub status: Option<u16>,
    pub fields: Vec<Header>,
}

impl ResponseHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the first header with the given (case-insensitive) name.
    pub fn get(&self, name: &str) -> Option<&Bytes> {
        self.fields
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name.as_bytes()))
            .map(|h| &h.value)
    }
}

impl ResponseSink for ResponseHeaders {
    fn set_status(&mut self, status: u16) {
        self.status = Some(status);
    }

    fn add_header(&mut self, name: Bytes, value: Bytes) {
        self.fields.push(Header { name, value });
    }
}

/// Shared-handle sink so the caller can keep reading the headers after the
/// sink itself moves into the session.
impl ResponseSink for std::rc::Rc<std::cell::RefCell<ResponseHeaders>> {
    fn set_status(&mut self, status: u16) {
        self.borrow_mut().set_status(status);
    }

    fn add_header(&mut self, name: Bytes, value: Bytes) {
        self.borrow_mut().add_header(name, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_id_classification() {
        assert!(StreamId(0).is_client_initiated());
        assert!(StreamId(0).is_bidirectional());
        assert!(StreamId(2).is_unidirectional());
        assert!(StreamId(3).is_server_initiated());
        assert!(StreamId(3).is_unidirectional());
    }

    #[test]
    fn test_bytes_provider_zero_copy_chunks() {
        let mut p = BytesProvider::new(&b"hello world"[..]).with_chunk_size(5);
        assert!(!p.is_eof());
        assert_eq!(p.read_view().unwrap(), Bytes::from_static(b"hello"));
        assert_eq!(p.read_view().unwrap(), Bytes::from_static(b" worl"));
        assert_eq!(p.read_view().unwrap(), Bytes::from_static(b"d"));
        assert!(p.is_eof());
        assert!(p.read_view().unwrap().is_empty());
    }

    #[test]
    fn test_bytes_provider_copy_path() {
        let mut p = BytesProvider::new(&b"abcdef"[..]);
        let mut buf = [0u8; 4];
        assert_eq!(p.read(&mut buf), 4);
        assert_eq!(&buf, b"abcd");
        assert_eq!(p.read(&mut buf), 2);
        assert_eq!(&buf[..2], b"ef");
        assert!(p.is_eof());
    }

    #[test]
    fn test_buffer_consumer_collects_and_finishes() {
        let mut c = BufferConsumer::new();
        let handle = c.handle();
        assert_eq!(c.write(b"abc"), 3);
        assert_eq!(c.write(b"def"), 3);
        c.set_finished();
        assert_eq!(handle.borrow().data, b"abcdef");
        assert!(handle.borrow().finished);
    }

    #[test]
    fn test_response_headers_lookup_is_caseless() {
        let mut r = ResponseHeaders::new();
        r.set_status(200);
        r.add_header(Bytes::from_static(b"content-type"), Bytes::from_static(b"text/plain"));
        assert_eq!(r.status, Some(200));
        assert_eq!(r.get("Content-Type").unwrap(), &Bytes::from_static(b"text/plain"));
        assert!(r.get("etag").is_none());
    }
}
