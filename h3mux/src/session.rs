//! The session: one HTTP/3 connection multiplexing many exchanges.
//!
//! A [`Session`] owns the transport connection, the protocol engine and the
//! stream table, and drives all three from a single-threaded event pump. Each
//! pass of [`Session::handle_events`] lets the transport advance, accepts
//! peer-initiated streams, pumps engine output to the transport, pumps
//! transport input into the engine, purges finished streams and re-polls
//! flow-blocked ones.
//!
//! Engine activity comes back as [`H3Event`] values which the session
//! dispatches to the streams they name. Events for streams no longer tracked
//! are benign; the engine's bookkeeping can briefly outlive a purged stream.

use http::{HeaderMap, Method, Uri};
use std::collections::HashMap;
use tracing::{debug, Level};

use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::message;
use crate::stream::{ScratchFill, Stream, StreamType};
use h3mux_x::{
    BodyChunk, BodySource, DataConsumer, DataProvider, H3Engine, H3Event, QuicConnection,
    QuicStreamIo, ResponseSink, StreamId, WriteOutcome,
};

// ============================================================================
// Stream Table
// ============================================================================

/// All live streams of a session, keyed by transport stream id.
///
/// Doubles as the engine's [`BodySource`]: when the engine generates DATA
/// frames it pulls body bytes from the stream that owns the request body.
#[derive(Default)]
pub(crate) struct StreamTable {
    map: HashMap<StreamId, Stream>,
}

impl StreamTable {
    pub(crate) fn get(&self, id: &StreamId) -> Option<&Stream> {
        self.map.get(id)
    }

    pub(crate) fn get_mut(&mut self, id: &StreamId) -> Option<&mut Stream> {
        self.map.get_mut(id)
    }

    fn contains(&self, id: &StreamId) -> bool {
        self.map.contains_key(id)
    }

    fn insert(&mut self, stream: Stream) {
        self.map.insert(stream.id(), stream);
    }

    fn iter(&self) -> impl Iterator<Item = (&StreamId, &Stream)> {
        self.map.iter()
    }

    fn iter_mut(&mut self) -> impl Iterator<Item = (&StreamId, &mut Stream)> {
        self.map.iter_mut()
    }

    fn retain(&mut self, f: impl FnMut(&StreamId, &mut Stream) -> bool) {
        self.map.retain(f);
    }

    pub(crate) fn len(&self) -> usize {
        self.map.len()
    }
}

impl BodySource for StreamTable {
    fn pull_body(&mut self, stream_id: StreamId) -> BodyChunk {
        match self.get_mut(&stream_id) {
            Some(stream) => stream.read_from_data_provider(),
            None => {
                debug!("cannot find stream id {} for body pull", stream_id);
                BodyChunk::end()
            }
        }
    }
}

// ============================================================================
// Session
// ============================================================================

/// One HTTP/3 session over an established QUIC connection.
pub struct Session {
    pub(crate) conn: Box<dyn QuicConnection>,
    engine: Box<dyn H3Engine>,
    pub(crate) streams: StreamTable,
    pub(crate) config: SessionConfig,
    /// The authority shared by every request on this session; fixed by the
    /// first successfully submitted request.
    authority: Option<String>,
    /// Application bytes consumed via engine events during one ingest call.
    consumed_app_data: usize,
    is_client: bool,
}

impl Session {
    /// Establish the HTTP/3 layer on top of an established QUIC connection.
    ///
    /// Switches the transport to non-blocking mode, opens the three outgoing
    /// management streams (control, QPACK encoder, QPACK decoder, in that
    /// order) and binds them to the engine.
    pub fn new(
        mut conn: Box<dyn QuicConnection>,
        engine: Box<dyn H3Engine>,
        is_client: bool,
        config: SessionConfig,
    ) -> Result<Self> {
        config.validate().map_err(Error::Config)?;

        // the event pump reacts to whichever streams have activity; a
        // transport stuck in blocking mode cannot be multiplexed that way
        conn.set_non_blocking(true)?;
        if !conn.is_non_blocking() {
            return Err(Error::BlockingTransport);
        }

        let mut session = Session {
            conn,
            engine,
            streams: StreamTable::default(),
            config,
            authority: None,
            consumed_app_data: 0,
            is_client,
        };

        let control = session.create_stream(StreamType::Control)?;
        let qpack_encode = session.create_stream(StreamType::QPackEncode)?;
        let qpack_decode = session.create_stream(StreamType::QPackDecode)?;
        session.engine.bind_control_stream(control)?;
        session.engine.bind_qpack_streams(qpack_encode, qpack_decode)?;

        debug!(
            "session established, control stream {}, qpack streams {}/{}",
            control, qpack_encode, qpack_decode
        );
        Ok(session)
    }

    /// Look up a stream by id.
    pub fn stream(&self, id: StreamId) -> Option<&Stream> {
        self.streams.get(&id)
    }

    /// The authority every request on this session is bound to, once fixed.
    pub fn authority(&self) -> Option<&str> {
        self.authority.as_deref()
    }

    /// Number of live streams, management streams included.
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Submit a new request on its own stream.
    ///
    /// The authority is resolved (and checked against the session's) before
    /// any session state changes, so a mismatching request leaves the session
    /// untouched. Returns the id of the newly opened request stream.
    pub fn new_stream(
        &mut self,
        url: Uri,
        method: Method,
        request_headers: &HeaderMap,
        body: Option<Box<dyn DataProvider>>,
        response: Box<dyn ResponseSink>,
        consumer: Option<Box<dyn DataConsumer>>,
    ) -> Result<StreamId> {
        if !self.is_client {
            return Err(Error::NotClient);
        }

        let authority = message::derive_authority(&url, request_headers)?;
        if let Some(existing) = self.authority.as_ref() {
            if *existing != authority {
                return Err(Error::AuthorityMismatch {
                    session: existing.clone(),
                    request: authority,
                });
            }
        }

        let headers = message::build_request_headers(&method, &url, &authority, request_headers);

        let mut stream = Stream::open_request(self.conn.as_mut(), url, method, response, &self.config)?;
        if let Some(provider) = body {
            stream.set_data_provider(provider);
        }
        if let Some(consumer) = consumer {
            stream.set_data_consumer(consumer);
        }
        let has_body = stream.provider_has_data();
        let id = self.add_stream(stream)?;
        self.authority.get_or_insert(authority);

        if tracing::enabled!(Level::DEBUG) {
            for header in &headers {
                debug!(
                    "[stream {}] {}: {}",
                    id,
                    String::from_utf8_lossy(&header.name),
                    String::from_utf8_lossy(&header.value)
                );
            }
            if has_body {
                debug!("[stream {}] request has body data to send", id);
            }
        }

        // the stream is registered first; submission can trigger engine
        // activity that refers back to it
        self.engine.submit_request(id, &headers, has_body)?;
        Ok(id)
    }

    /// Open a locally-initiated stream of the given type and register it.
    fn create_stream(&mut self, stream_type: StreamType) -> Result<StreamId> {
        let stream = Stream::open(self.conn.as_mut(), stream_type, &self.config)?;
        self.add_stream(stream)
    }

    /// Adopt a peer-initiated stream handed out by the transport.
    fn accept_stream(&mut self, io: Box<dyn QuicStreamIo>) -> Result<StreamId> {
        let stream = Stream::accept(io, &self.config);
        self.add_stream(stream)
    }

    fn add_stream(&mut self, stream: Stream) -> Result<StreamId> {
        let id = stream.id();
        if self.streams.contains(&id) {
            return Err(Error::DuplicateStream(id));
        }
        self.streams.insert(stream);
        Ok(id)
    }

    /// True while any request stream still has work the caller is waiting on.
    ///
    /// With `with_responses` every live request stream counts; without it only
    /// streams whose response headers are still outstanding do.
    pub fn has_open_request_streams(&self, with_responses: bool) -> bool {
        self.streams.iter().any(|(_, s)| {
            s.stream_type() == StreamType::Request && (with_responses || !s.is_headers_complete())
        })
    }

    /// Drive the session until no request stream has outstanding work.
    ///
    /// Waits for transport readability between passes, bounded by the
    /// configured I/O timeout. The transport's own timers firing earlier than
    /// that bound is normal operation, not a timeout.
    pub fn run(&mut self) -> Result<()> {
        self.run_until(true)
    }

    pub(crate) fn run_until(&mut self, with_responses: bool) -> Result<()> {
        loop {
            self.handle_events(with_responses)?;
            if !self.has_open_request_streams(with_responses) {
                return Ok(());
            }

            let bound = self.config.io_timeout;
            let (wait, internal_timer) = match self.conn.next_timeout() {
                Some(t) if t < bound => (t, true),
                _ => (bound, false),
            };
            if !self.conn.poll_readable(Some(wait)) && !internal_timer {
                debug!("connection timed out after {:?}", bound);
                return Err(Error::Timeout);
            }
            self.conn.handle_events();
        }
    }

    /// One full pass of the event pump. Never waits.
    ///
    /// With `with_responses` unset, request streams whose response headers
    /// have already arrived are skipped during ingest; their remaining body
    /// bytes stay queued in the transport for a later targeted pull.
    pub fn handle_events(&mut self, with_responses: bool) -> Result<()> {
        loop {
            // let the transport advance timers and queued events
            self.conn.handle_events();

            // adopt newly arrived peer-initiated streams
            while let Some(io) = self.conn.accept_stream() {
                self.accept_stream(io)?;
            }

            // pump engine output to the transport
            while let Some(batch) = self
                .engine
                .writev_stream(&mut self.streams, self.config.egress_batch)?
            {
                self.send_to_quic(batch)?;
            }

            // pump transport input into the engine
            let ids: Vec<StreamId> = self
                .streams
                .iter()
                .filter(|(_, s)| {
                    with_responses
                        || s.stream_type() != StreamType::Request
                        || !s.is_headers_complete()
                })
                .map(|(id, _)| *id)
                .collect();
            for id in ids {
                self.receive_from_quic(id, false)?;
            }

            // purge streams with no further protocol activity or drainable data
            self.streams.retain(|id, stream| {
                if stream.can_delete() {
                    debug!("[stream {}] purging", id);
                    false
                } else {
                    true
                }
            });

            // re-poll flow-blocked streams; an unblock means the engine may
            // have fresh output, so run another full pass
            let mut unblocked = false;
            for (id, stream) in self.streams.iter_mut() {
                if stream.was_blocked && stream.poll_writable() {
                    debug!("[stream {}] transport writable again", id);
                    stream.was_blocked = false;
                    stream.wait_for.writes = false;
                    self.engine.unblock_stream(*id);
                    unblocked = true;
                }
            }
            if !unblocked {
                return Ok(());
            }
        }
    }

    /// Write one engine batch to its transport stream.
    ///
    /// Vectors are written in order; a short write stops the batch so stream
    /// bytes are never reordered. A full transport send buffer blocks the
    /// stream in the engine until writability returns.
    fn send_to_quic(&mut self, batch: h3mux_x::OutboundBatch) -> Result<()> {
        let id = batch.stream_id;
        let total: usize = batch.vecs.iter().map(|v| v.len()).sum();
        let Some(stream) = self.streams.get_mut(&id) else {
            return Err(Error::UnknownStream(id));
        };
        stream.wait_for.writes = false;
        debug!("[stream {}] writing {} bytes", id, total);

        let mut total_written = 0usize;
        let mut blocked = false;
        let last = batch.vecs.len();

        for (i, vec) in batch.vecs.iter().enumerate() {
            let fin = batch.fin && i + 1 == last;
            if vec.is_empty() && !fin {
                continue;
            }

            let written = if stream.is_closed() {
                // locally closed already, drain the engine's queue
                debug!("[stream {}] already closed, dropping {} bytes", id, vec.len());
                vec.len()
            } else {
                let mut outcome = stream.transport_write(vec, fin)?;
                if outcome == WriteOutcome::WouldBlock && stream.poll_writable() {
                    // send capacity often frees up between the attempt and
                    // the poll; retry once before blocking the stream
                    outcome = stream.transport_write(vec, fin)?;
                }
                match outcome {
                    WriteOutcome::WouldBlock => {
                        if !stream.was_blocked {
                            debug!("[stream {}] setting stream to block", id);
                        }
                        stream.was_blocked = true;
                        stream.wait_for.writes = true;
                        self.engine.block_stream(id);
                        blocked = true;
                        break;
                    }
                    WriteOutcome::Written(n) => {
                        if stream.was_blocked {
                            debug!("[stream {}] setting stream to unblock", id);
                        }
                        stream.was_blocked = false;
                        self.engine.unblock_stream(id);
                        n
                    }
                }
            };

            total_written += written;
            if written > 0 {
                self.engine.add_write_offset(id, written)?;
                // acknowledge immediately: the transport copied the bytes
                // into its own send buffer, so the engine never needs to
                // re-supply them. Transport-level acknowledgement would give
                // stricter backpressure at the cost of plumbing it through.
                self.engine.add_ack_offset(id, written)?;
            }
            if written < vec.len() {
                // short write; later vectors must wait for the next batch
                break;
            }
        }

        if batch.fin && !blocked && total_written == total && total == 0 {
            if batch.vecs.is_empty() {
                let Some(stream) = self.streams.get_mut(&id) else {
                    return Err(Error::UnknownStream(id));
                };
                if !stream.is_closed() {
                    // the engine concluded the stream without any payload
                    stream.transport_write(&[], true)?;
                }
            }
            // a zero-length conclusion still advances the engine's offset
            self.engine.add_write_offset(id, 0)?;
        }
        Ok(())
    }

    /// Pump bytes from one transport stream into the engine.
    ///
    /// Loops until the transport has nothing more and the scratch buffer is
    /// drained. With `once` set, returns after the first ingest pass that
    /// consumed bytes directly, leaving any remainder buffered for the next
    /// call. Returns the direct-consumed count of the last ingest pass.
    pub(crate) fn receive_from_quic(&mut self, id: StreamId, once: bool) -> Result<usize> {
        if let Some(stream) = self.streams.get_mut(&id) {
            stream.wait_for.reads = false;
        }

        loop {
            // refill the scratch buffer when it is empty
            let fill = {
                let Some(stream) = self.streams.get_mut(&id) else {
                    return Ok(0);
                };
                if stream.is_closed() || !stream.stream_type().is_readable() {
                    return Ok(0);
                }
                if stream.scratch.is_empty() {
                    Some(stream.fill_scratch()?)
                } else {
                    None
                }
            };

            match fill {
                Some(ScratchFill::WouldBlock) => return Ok(0),
                Some(ScratchFill::Finished) => {
                    debug!("[stream {}] stream finished", id);
                    let (_, events) = self.engine.read_stream(id, &[], true)?;
                    self.dispatch_all(events)?;
                    self.consumed_app_data = 0;
                    if let Some(stream) = self.streams.get_mut(&id) {
                        stream.set_received_fin();
                    }
                    return Ok(0);
                }
                Some(ScratchFill::Reset(code)) => {
                    debug!("[stream {}] stream was reset by peer: {}", id, code);
                    let events = self.engine.close_stream(id, code)?;
                    self.dispatch_all(events)?;
                    self.consumed_app_data = 0;
                    if let Some(stream) = self.streams.get_mut(&id) {
                        stream.set_received_fin();
                        stream.close();
                    }
                    return Ok(0);
                }
                Some(ScratchFill::Data) | None => {}
            }

            // feed the scratch buffer to the engine
            debug_assert_eq!(self.consumed_app_data, 0);
            let mut scratch = {
                let Some(stream) = self.streams.get_mut(&id) else {
                    return Ok(0);
                };
                if stream.scratch.is_empty() {
                    return Ok(0);
                }
                std::mem::take(&mut stream.scratch)
            };

            let available = scratch.filled().len();
            let (consumed_direct, events) = match self.engine.read_stream(id, scratch.filled(), false)
            {
                Ok(result) => result,
                Err(e) => {
                    if let Some(stream) = self.streams.get_mut(&id) {
                        stream.scratch = scratch;
                    }
                    return Err(Error::Engine(e));
                }
            };
            self.dispatch_all(events)?;

            // total consumption is direct bytes plus application bytes
            // reported through Data / DeferredConsume events
            let consumed = consumed_direct + std::mem::take(&mut self.consumed_app_data);
            if consumed > available {
                return Err(Error::ConsumeOverflow { consumed, available });
            }
            scratch.consume(consumed);
            if let Some(stream) = self.streams.get_mut(&id) {
                stream.scratch = scratch;
            }

            if consumed == 0 {
                // the engine is waiting on something else (a blocked field
                // section, say); re-offering the same bytes now would spin
                return Ok(0);
            }
            if once && consumed_direct > 0 {
                debug!(
                    "[stream {}] returning after single ingest pass, {} bytes direct",
                    id, consumed_direct
                );
                return Ok(consumed_direct);
            }
        }
    }

    // ========================================================================
    // Engine Event Dispatch
    // ========================================================================

    fn dispatch_all(&mut self, events: Vec<H3Event>) -> Result<()> {
        for event in events {
            self.dispatch(event)?;
        }
        Ok(())
    }

    fn dispatch(&mut self, event: H3Event) -> Result<()> {
        match event {
            H3Event::Header { stream_id, name, value } => {
                self.on_receive_header(stream_id, name, value)
            }
            H3Event::EndHeaders { stream_id, .. } => self.on_end_headers(stream_id),
            H3Event::Data { stream_id, data } => self.on_receive_data(stream_id, &data),
            H3Event::EndStream { stream_id } => self.on_end_stream(stream_id),
            H3Event::StreamClosed { stream_id, error_code } => {
                self.on_stream_close(stream_id, error_code)
            }
            H3Event::StopSending { stream_id, error_code } => {
                self.on_stop_sending(stream_id, error_code)
            }
            H3Event::ResetStream { stream_id, error_code } => {
                self.on_reset_stream(stream_id, error_code)
            }
            H3Event::DeferredConsume { stream_id, consumed } => {
                self.on_deferred_consume(stream_id, consumed)
            }
            H3Event::AckedStreamData { stream_id, total_acked } => {
                self.on_acked_stream_data(stream_id, total_acked)
            }
        }
    }

    fn on_receive_header(
        &mut self,
        id: StreamId,
        name: bytes::Bytes,
        value: bytes::Bytes,
    ) -> Result<()> {
        let Some(stream) = self.streams.get_mut(&id) else {
            debug!("[stream {}] header for unknown stream", id);
            return Ok(());
        };
        stream.add_response_header(name, value)
    }

    fn on_end_headers(&mut self, id: StreamId) -> Result<()> {
        debug!("[stream {}] headers complete", id);
        if let Some(stream) = self.streams.get_mut(&id) {
            stream.set_headers_complete();
        }
        Ok(())
    }

    fn on_receive_data(&mut self, id: StreamId, data: &[u8]) -> Result<()> {
        self.consumed_app_data += data.len();
        if let Some(stream) = self.streams.get_mut(&id) {
            stream.add_data(data);
        } else {
            debug!("[stream {}] dropping {} bytes for unknown stream", id, data.len());
        }
        Ok(())
    }

    fn on_end_stream(&mut self, id: StreamId) -> Result<()> {
        debug!("[stream {}] end of stream", id);
        if let Some(stream) = self.streams.get_mut(&id) {
            stream.close();
        }
        Ok(())
    }

    fn on_stream_close(&mut self, id: StreamId, error_code: u64) -> Result<()> {
        debug!("[stream {}] closed with code {}", id, error_code);
        if let Some(stream) = self.streams.get_mut(&id) {
            stream.close();
        }
        Ok(())
    }

    fn on_stop_sending(&mut self, id: StreamId, error_code: u64) -> Result<()> {
        debug!("[stream {}] peer sent stop_sending with code {}", id, error_code);
        Ok(())
    }

    fn on_reset_stream(&mut self, id: StreamId, error_code: u64) -> Result<()> {
        debug!("[stream {}] resetting with code {}", id, error_code);
        if let Some(stream) = self.streams.get_mut(&id) {
            stream.reset(error_code)?;
        }
        Ok(())
    }

    fn on_deferred_consume(&mut self, id: StreamId, consumed: usize) -> Result<()> {
        debug!("[stream {}] deferred consume of {} bytes", id, consumed);
        self.consumed_app_data += consumed;
        Ok(())
    }

    fn on_acked_stream_data(&mut self, id: StreamId, total_acked: u64) -> Result<()> {
        if let Some(stream) = self.streams.get_mut(&id) {
            stream.acked_stream_data(total_acked);
        }
        Ok(())
    }
}
