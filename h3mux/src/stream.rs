//! Per-stream state: buffering, header bindings, and the bridge between one
//! transport stream and the body provider/consumer collaborators.
//!
//! A [`Stream`] owns its transport handle exclusively. Outbound body chunks
//! copied from a non-persistent provider are retained in FIFO order until the
//! engine acknowledges them, then recycled. Inbound body bytes go to the
//! registered consumer, or into a bounded receive buffer with an unbounded
//! spill buffer behind it so nothing is ever dropped.

use bytes::{Bytes, BytesMut};
use http::{Method, Uri};
use std::collections::VecDeque;
use tracing::{debug, warn};

use crate::config::SessionConfig;
use crate::error::{Error, Result};
use h3mux_x::{
    BodyChunk, DataConsumer, DataProvider, QuicConnection, QuicStreamIo, ReadOutcome,
    ResponseSink, StreamDirection, StreamId, TransportError, WriteOutcome,
};

/// The role of a stream within the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamType {
    /// Outgoing HTTP/3 control stream.
    Control,
    /// Outgoing QPACK encoder stream.
    QPackEncode,
    /// Outgoing QPACK decoder stream.
    QPackDecode,
    /// Locally-initiated request/response exchange.
    Request,
    /// Peer-initiated stream accepted from the transport.
    Incoming,
}

impl StreamType {
    /// Outgoing management streams are write-only; there is nothing to pump.
    pub(crate) fn is_readable(&self) -> bool {
        matches!(self, StreamType::Request | StreamType::Incoming)
    }
}

/// Which readiness events the stream is currently waiting on.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct WaitFor {
    pub reads: bool,
    pub writes: bool,
}

/// One in-flight transmit chunk, retained until acknowledged.
///
/// `end_offset` is the cumulative body offset at which this chunk ends; a
/// chunk is retired once the engine's acknowledged total reaches it.
#[derive(Debug)]
struct BufferedData {
    data: Bytes,
    end_offset: u64,
}

/// A bounded receive buffer supplied by the caller of
/// [`crate::SingleStreamSession::read_data`].
#[derive(Debug, Default)]
pub struct ReceiveBuffer {
    data: Vec<u8>,
    capacity: usize,
}

impl ReceiveBuffer {
    pub fn new(capacity: usize) -> Self {
        Self { data: Vec::with_capacity(capacity), capacity }
    }

    /// Append as much of `data` as fits, returning the count accepted.
    pub fn append(&mut self, data: &[u8]) -> usize {
        let room = self.capacity.saturating_sub(self.data.len());
        let n = room.min(data.len());
        self.data.extend_from_slice(&data[..n]);
        n
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn remaining(&self) -> usize {
        self.capacity.saturating_sub(self.data.len())
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }
}

/// Scratch buffer between the transport and the engine's ingest entrypoint.
#[derive(Debug, Default)]
pub(crate) struct Scratch {
    buf: Vec<u8>,
    pos: usize,
    len: usize,
}

impl Scratch {
    fn new(capacity: usize) -> Self {
        Self { buf: vec![0; capacity], pos: 0, len: 0 }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pos >= self.len
    }

    fn reset(&mut self) {
        self.pos = 0;
        self.len = 0;
    }

    fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    fn set_filled(&mut self, n: usize) {
        self.pos = 0;
        self.len = n.min(self.buf.len());
    }

    /// The bytes not yet consumed by the engine.
    pub(crate) fn filled(&self) -> &[u8] {
        &self.buf[self.pos..self.len]
    }

    /// Advance past `n` consumed bytes, returning the count actually advanced.
    pub(crate) fn consume(&mut self, n: usize) -> usize {
        let take = n.min(self.len - self.pos);
        self.pos += take;
        take
    }
}

/// Result of one attempt to refill the ingest scratch buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ScratchFill {
    /// Bytes were read into the scratch buffer.
    Data,
    /// Nothing available; read interest has been registered.
    WouldBlock,
    /// The peer concluded the stream normally.
    Finished,
    /// The peer reset the stream with this application error code.
    Reset(u64),
}

/// One HTTP/3-level exchange multiplexed over one QUIC stream.
pub struct Stream {
    io: Box<dyn QuicStreamIo>,
    id: StreamId,
    stream_type: StreamType,
    method: Method,
    uri: Uri,
    authority: String,
    path: String,
    response: Option<Box<dyn ResponseSink>>,
    provider: Option<Box<dyn DataProvider>>,
    consumer: Option<Box<dyn DataConsumer>>,

    // transmit chunks retained until acknowledged, oldest first
    inflight: VecDeque<BufferedData>,
    recycle: Vec<BytesMut>,
    tx_offset: u64,
    tx_acked: u64,
    body_chunk_size: usize,

    rx_buffer: ReceiveBuffer,
    rx_spill: Vec<u8>,
    pub(crate) scratch: Scratch,

    headers_complete: bool,
    received_fin: bool,
    closed: bool,
    pub(crate) was_blocked: bool,
    pub(crate) wait_for: WaitFor,
}

impl Stream {
    fn from_io(io: Box<dyn QuicStreamIo>, stream_type: StreamType, config: &SessionConfig) -> Self {
        let id = io.id();
        Self {
            io,
            id,
            stream_type,
            method: Method::GET,
            uri: Uri::default(),
            authority: String::new(),
            path: String::new(),
            response: None,
            provider: None,
            consumer: None,
            inflight: VecDeque::new(),
            recycle: Vec::new(),
            tx_offset: 0,
            tx_acked: 0,
            body_chunk_size: config.body_chunk_size,
            rx_buffer: ReceiveBuffer::default(),
            rx_spill: Vec::new(),
            scratch: Scratch::new(config.ingest_buffer_size),
            headers_complete: false,
            received_fin: false,
            closed: false,
            was_blocked: false,
            wait_for: WaitFor::default(),
        }
    }

    /// Open a locally-initiated stream of the given type.
    pub(crate) fn open(
        conn: &mut dyn QuicConnection,
        stream_type: StreamType,
        config: &SessionConfig,
    ) -> Result<Self> {
        let direction = if stream_type == StreamType::Request {
            StreamDirection::Bidirectional
        } else {
            StreamDirection::Unidirectional
        };
        let io = conn.open_stream(direction, true)?;
        let stream = Self::from_io(io, stream_type, config);
        debug!("[stream {}] created ({:?})", stream.id, stream_type);
        Ok(stream)
    }

    /// Open a request stream bound to a URL, method and response sink.
    pub(crate) fn open_request(
        conn: &mut dyn QuicConnection,
        uri: Uri,
        method: Method,
        response: Box<dyn ResponseSink>,
        config: &SessionConfig,
    ) -> Result<Self> {
        let mut stream = Self::open(conn, StreamType::Request, config)?;
        stream.uri = uri;
        stream.method = method;
        stream.response = Some(response);
        Ok(stream)
    }

    /// Adopt a peer-initiated stream handed out by the transport.
    pub(crate) fn accept(io: Box<dyn QuicStreamIo>, config: &SessionConfig) -> Self {
        let stream = Self::from_io(io, StreamType::Incoming, config);
        debug!("[stream {}] accepted", stream.id);
        stream
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn stream_type(&self) -> StreamType {
        self.stream_type
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The URI's scheme component.
    pub fn scheme(&self) -> &str {
        crate::message::scheme(&self.uri)
    }

    /// The domain name, plus the port when one is given explicitly.
    pub fn authority(&mut self) -> &str {
        if self.authority.is_empty() {
            if let Some(host) = self.uri.host() {
                self.authority = match self.uri.port_u16() {
                    Some(port) => format!("{}:{}", host, port),
                    None => host.to_string(),
                };
            }
        }
        &self.authority
    }

    /// Path and query, `/` when otherwise empty.
    pub fn path(&mut self) -> &str {
        if self.path.is_empty() {
            self.path = crate::message::request_path(&self.uri);
        }
        &self.path
    }

    pub(crate) fn set_data_provider(&mut self, provider: Box<dyn DataProvider>) {
        self.provider = Some(provider);
    }

    pub(crate) fn set_data_consumer(&mut self, consumer: Box<dyn DataConsumer>) {
        self.consumer = Some(consumer);
    }

    /// True when a provider is set and has bytes left to give.
    pub(crate) fn provider_has_data(&self) -> bool {
        self.provider.as_ref().map_or(false, |p| !p.is_eof())
    }

    pub fn is_headers_complete(&self) -> bool {
        self.headers_complete
    }

    pub(crate) fn set_headers_complete(&mut self) {
        self.headers_complete = true;
    }

    pub fn is_closed(&self) -> bool {
        self.received_fin || self.closed
    }

    /// True once this stream can produce no further protocol activity and
    /// holds no bytes the caller could still drain.
    pub fn can_delete(&self) -> bool {
        self.is_closed() && self.rx_spill.is_empty()
    }

    pub(crate) fn set_received_fin(&mut self) {
        self.received_fin = true;
    }

    /// True when the last pump pass left the stream waiting for more data
    /// to arrive from the transport.
    pub fn wants_read(&self) -> bool {
        self.wait_for.reads
    }

    /// True when the last pump pass left the stream blocked on transport
    /// send capacity.
    pub fn wants_write(&self) -> bool {
        self.wait_for.writes
    }

    pub fn receive_buffer(&self) -> &ReceiveBuffer {
        &self.rx_buffer
    }

    /// Mark the stream closed and notify the body consumer exactly once.
    pub(crate) fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(consumer) = self.consumer.as_mut() {
            consumer.set_finished();
        }
    }

    /// Reset the stream towards the peer.
    pub(crate) fn reset(&mut self, error_code: u64) -> Result<()> {
        self.io.reset(error_code)?;
        Ok(())
    }

    /// Record one decoded response header. Headers arriving after the field
    /// section completed are ignored.
    pub(crate) fn add_response_header(&mut self, name: Bytes, value: Bytes) -> Result<()> {
        if self.headers_complete {
            return Ok(());
        }
        let id = self.id;
        let Some(sink) = self.response.as_mut() else {
            return Err(Error::NoResponseSink(id));
        };
        if name == &b":status"[..] {
            let status = std::str::from_utf8(&value)
                .ok()
                .and_then(|s| s.parse::<u16>().ok())
                .ok_or(Error::MalformedPseudoHeader(":status"))?;
            debug!("[stream {}] setting response status to {}", id, status);
            sink.set_status(status);
        } else {
            debug!(
                "[stream {}] {}: {}",
                id,
                String::from_utf8_lossy(&name),
                String::from_utf8_lossy(&value)
            );
            sink.add_header(name, value);
        }
        Ok(())
    }

    /// Deliver decoded body bytes: straight to the consumer when one is
    /// registered, otherwise into the receive buffer with overflow going to
    /// the spill buffer so nothing is lost.
    pub(crate) fn add_data(&mut self, data: &[u8]) {
        debug!("[stream {}] received {} bytes", self.id, data.len());
        if let Some(consumer) = self.consumer.as_mut() {
            consumer.write(data);
        } else {
            let consumed = self.rx_buffer.append(data);
            if consumed < data.len() {
                self.rx_spill.extend_from_slice(&data[consumed..]);
            }
        }
    }

    /// Install the buffer for subsequent deliveries, draining spilled bytes
    /// into it first so byte order is preserved.
    pub(crate) fn set_receive_buffer(&mut self, mut buffer: ReceiveBuffer) {
        if !self.rx_spill.is_empty() {
            let copied = buffer.append(&self.rx_spill);
            self.rx_spill.drain(..copied);
        }
        self.rx_buffer = buffer;
    }

    /// Move the receive buffer's contents into `out`, detaching the buffer.
    pub(crate) fn take_received(&mut self, out: &mut [u8]) -> usize {
        let buffer = std::mem::take(&mut self.rx_buffer);
        let n = buffer.len().min(out.len());
        out[..n].copy_from_slice(&buffer.as_slice()[..n]);
        n
    }

    /// Produce the next outbound body chunk for the engine.
    ///
    /// A provider with persistent storage hands out a zero-copy view. For
    /// non-persistent providers the bytes are copied into a buffer recycled
    /// from previously acknowledged chunks and retained until acknowledged,
    /// so the engine can retransmit without re-querying the source.
    pub(crate) fn read_from_data_provider(&mut self) -> BodyChunk {
        let Some(provider) = self.provider.as_mut() else {
            return BodyChunk::end();
        };
        if provider.is_eof() {
            return BodyChunk::end();
        }

        if let Some(view) = provider.read_view() {
            if view.is_empty() {
                return BodyChunk::end();
            }
            self.tx_offset += view.len() as u64;
            return BodyChunk::data(view);
        }

        let mut buf = self
            .recycle
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(self.body_chunk_size));
        buf.resize(self.body_chunk_size, 0);
        let n = provider.read(&mut buf);
        buf.truncate(n);
        if n == 0 {
            self.recycle.push(buf);
            return BodyChunk::end();
        }

        self.tx_offset += n as u64;
        let data = buf.freeze();
        self.inflight.push_back(BufferedData {
            data: data.clone(),
            end_offset: self.tx_offset,
        });
        BodyChunk::data(data)
    }

    /// The engine acknowledged outbound body data up to `total_acked`
    /// cumulative bytes. Retire retained chunks strictly from the front;
    /// stop at the first chunk not yet fully covered.
    pub(crate) fn acked_stream_data(&mut self, total_acked: u64) {
        debug!("[stream {}] acked {} bytes", self.id, total_acked);
        let total_acked = if total_acked > self.tx_offset {
            warn!(
                "[stream {}] ack total {} exceeds {} bytes handed out",
                self.id, total_acked, self.tx_offset
            );
            self.tx_offset
        } else {
            total_acked
        };
        self.tx_acked = self.tx_acked.max(total_acked);

        while self
            .inflight
            .front()
            .map_or(false, |chunk| chunk.end_offset <= self.tx_acked)
        {
            if let Some(chunk) = self.inflight.pop_front() {
                // reclaim the buffer if the engine dropped its reference
                if let Ok(mut buf) = chunk.data.try_into_mut() {
                    buf.clear();
                    self.recycle.push(buf);
                }
            }
        }
    }

    /// Attempt to refill the ingest scratch buffer from the transport.
    ///
    /// Must only be called with an empty scratch buffer. Classifies the three
    /// recoverable outcomes distinctly; terminal transport failures surface
    /// as errors.
    pub(crate) fn fill_scratch(&mut self) -> Result<ScratchFill> {
        self.scratch.reset();
        match self.io.read(self.scratch.spare_mut())? {
            ReadOutcome::Read(n) => {
                self.scratch.set_filled(n);
                Ok(ScratchFill::Data)
            }
            ReadOutcome::WouldBlock => {
                self.wait_for.reads = true;
                Ok(ScratchFill::WouldBlock)
            }
            ReadOutcome::Finished => Ok(ScratchFill::Finished),
            ReadOutcome::Reset(code) => Ok(ScratchFill::Reset(code)),
        }
    }

    pub(crate) fn transport_write(
        &mut self,
        data: &[u8],
        fin: bool,
    ) -> std::result::Result<WriteOutcome, TransportError> {
        self.io.write(data, fin)
    }

    pub(crate) fn poll_writable(&mut self) -> bool {
        self.io.poll_writable()
    }

    #[cfg(test)]
    fn buffered_unacked_bytes(&self) -> usize {
        self.inflight.iter().map(|c| c.data.len()).sum()
    }
}
