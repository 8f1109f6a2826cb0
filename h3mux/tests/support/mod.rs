//! Scriptable transport and engine doubles for session tests.
//!
//! `MockConnection` hands out `ScriptedStream`s whose reads follow a
//! per-stream script and whose writes are captured for inspection.
//! `MockEngine` replays scripted ingest events and outbound batches while
//! recording every call the session makes.

#![allow(dead_code)]

use bytes::Bytes;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::rc::Rc;
use std::time::Duration;

use h3mux_x::{
    BodySource, EngineError, H3Engine, H3Event, Header, OutboundBatch, QuicConnection,
    QuicStreamIo, ReadOutcome, StreamDirection, StreamId, TransportError, WriteOutcome,
};

// ============================================================================
// Scripted Transport
// ============================================================================

/// One scripted action for a stream read.
pub enum ReadAction {
    Data(Vec<u8>),
    WouldBlock,
    Finished,
    Reset(u64),
}

/// Shared, inspectable state of one scripted stream.
pub struct StreamState {
    pub read_script: VecDeque<ReadAction>,
    pub written: Vec<u8>,
    pub fin_sent: bool,
    pub writable: bool,
    /// Cap on bytes accepted per write call, to force short writes.
    pub write_limit: Option<usize>,
    pub reset_code: Option<u64>,
}

impl StreamState {
    fn new() -> Self {
        Self {
            read_script: VecDeque::new(),
            written: Vec::new(),
            fin_sent: false,
            writable: true,
            write_limit: None,
            reset_code: None,
        }
    }
}

pub struct ScriptedStream {
    id: StreamId,
    state: Rc<RefCell<StreamState>>,
}

impl QuicStreamIo for ScriptedStream {
    fn id(&self) -> StreamId {
        self.id
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<ReadOutcome, TransportError> {
        let mut state = self.state.borrow_mut();
        match state.read_script.pop_front() {
            None | Some(ReadAction::WouldBlock) => Ok(ReadOutcome::WouldBlock),
            Some(ReadAction::Data(bytes)) => {
                let n = bytes.len().min(buf.len());
                buf[..n].copy_from_slice(&bytes[..n]);
                Ok(ReadOutcome::Read(n))
            }
            Some(ReadAction::Finished) => Ok(ReadOutcome::Finished),
            Some(ReadAction::Reset(code)) => Ok(ReadOutcome::Reset(code)),
        }
    }

    fn write(&mut self, data: &[u8], fin: bool) -> Result<WriteOutcome, TransportError> {
        let mut state = self.state.borrow_mut();
        if !state.writable {
            return Ok(WriteOutcome::WouldBlock);
        }
        let n = match state.write_limit {
            Some(limit) => limit.min(data.len()),
            None => data.len(),
        };
        state.written.extend_from_slice(&data[..n]);
        if fin && n == data.len() {
            state.fin_sent = true;
        }
        Ok(WriteOutcome::Written(n))
    }

    fn poll_writable(&mut self) -> bool {
        self.state.borrow().writable
    }

    fn reset(&mut self, error_code: u64) -> Result<(), TransportError> {
        self.state.borrow_mut().reset_code = Some(error_code);
        Ok(())
    }
}

type Registry = Rc<RefCell<HashMap<u64, Rc<RefCell<StreamState>>>>>;

/// Test-side handle into a [`MockConnection`]'s streams.
pub struct ConnHandle {
    registry: Registry,
    accepts: Rc<RefCell<VecDeque<u64>>>,
}

impl ConnHandle {
    /// Shared state of a stream the session has opened or accepted.
    pub fn state(&self, id: u64) -> Rc<RefCell<StreamState>> {
        self.registry
            .borrow()
            .get(&id)
            .cloned()
            .expect("stream was never opened")
    }

    /// Register scripted state for a stream id the session has not opened
    /// yet, so reads can be staged before the stream exists.
    pub fn preload(&self, id: u64) -> Rc<RefCell<StreamState>> {
        let state = Rc::new(RefCell::new(StreamState::new()));
        self.registry.borrow_mut().insert(id, state.clone());
        state
    }

    /// Queue a peer-initiated stream for the next accept pass.
    pub fn push_incoming(&self, id: u64) -> Rc<RefCell<StreamState>> {
        let state = Rc::new(RefCell::new(StreamState::new()));
        self.registry.borrow_mut().insert(id, state.clone());
        self.accepts.borrow_mut().push_back(id);
        state
    }
}

/// A transport double allocating client-side stream ids.
pub struct MockConnection {
    non_blocking: bool,
    refuse_non_blocking: bool,
    next_bidi: u64,
    next_uni: u64,
    registry: Registry,
    accepts: Rc<RefCell<VecDeque<u64>>>,
    timeout: Option<Duration>,
}

impl MockConnection {
    pub fn new() -> (Self, ConnHandle) {
        let registry: Registry = Default::default();
        let accepts: Rc<RefCell<VecDeque<u64>>> = Default::default();
        let handle = ConnHandle { registry: registry.clone(), accepts: accepts.clone() };
        let conn = Self {
            non_blocking: false,
            refuse_non_blocking: false,
            next_bidi: 0,
            next_uni: 2,
            registry,
            accepts,
            timeout: None,
        };
        (conn, handle)
    }

    /// A transport stuck in blocking mode.
    pub fn blocking() -> Self {
        let (mut conn, _) = Self::new();
        conn.refuse_non_blocking = true;
        conn
    }
}

impl QuicConnection for MockConnection {
    fn set_non_blocking(&mut self, enabled: bool) -> Result<(), TransportError> {
        if !self.refuse_non_blocking {
            self.non_blocking = enabled;
        }
        Ok(())
    }

    fn is_non_blocking(&self) -> bool {
        self.non_blocking
    }

    fn open_stream(
        &mut self,
        direction: StreamDirection,
        _advance: bool,
    ) -> Result<Box<dyn QuicStreamIo>, TransportError> {
        let id = match direction {
            StreamDirection::Bidirectional => {
                let id = self.next_bidi;
                self.next_bidi += 4;
                id
            }
            StreamDirection::Unidirectional => {
                let id = self.next_uni;
                self.next_uni += 4;
                id
            }
        };
        let state = self
            .registry
            .borrow_mut()
            .entry(id)
            .or_insert_with(|| Rc::new(RefCell::new(StreamState::new())))
            .clone();
        Ok(Box::new(ScriptedStream { id: StreamId(id), state }))
    }

    fn accept_stream(&mut self) -> Option<Box<dyn QuicStreamIo>> {
        let id = self.accepts.borrow_mut().pop_front()?;
        let state = self.registry.borrow().get(&id).cloned()?;
        Some(Box::new(ScriptedStream { id: StreamId(id), state }))
    }

    fn handle_events(&mut self) {}

    fn next_timeout(&mut self) -> Option<Duration> {
        self.timeout
    }

    fn poll_readable(&mut self, _timeout: Option<Duration>) -> bool {
        false
    }
}

// ============================================================================
// Scripted Engine
// ============================================================================

/// One scripted step of engine output.
pub enum WritevAction {
    /// Offer this batch until its bytes are fully written.
    Batch(OutboundBatch),
    /// Pull body chunks for this stream until the source reports end of
    /// body, then conclude the stream with an empty fin batch.
    PullBody(StreamId),
}

/// Everything the session asked of the engine, for assertions.
#[derive(Default)]
pub struct EngineCalls {
    pub control: Option<StreamId>,
    pub qpack: Option<(StreamId, StreamId)>,
    pub submits: Vec<(StreamId, Vec<Header>, bool)>,
    pub write_offsets: Vec<(StreamId, usize)>,
    pub ack_offsets: Vec<(StreamId, usize)>,
    pub blocked: Vec<StreamId>,
    pub unblocked: Vec<StreamId>,
    pub closed: Vec<(StreamId, u64)>,
}

/// The engine's scripted behavior, mutable from the test between calls.
#[derive(Default)]
pub struct EngineScript {
    pub writev: VecDeque<WritevAction>,
    /// Events returned by successive `read_stream` calls, per stream. The
    /// direct-consumed count is derived as the raw byte count minus the
    /// application bytes carried in the returned events.
    pub ingest: HashMap<u64, VecDeque<Vec<H3Event>>>,
    blocked_now: HashSet<u64>,
}

impl EngineScript {
    pub fn push_ingest(&mut self, stream_id: u64, events: Vec<H3Event>) {
        self.ingest.entry(stream_id).or_default().push_back(events);
    }
}

pub struct MockEngine {
    calls: Rc<RefCell<EngineCalls>>,
    script: Rc<RefCell<EngineScript>>,
}

impl MockEngine {
    pub fn new() -> (Self, Rc<RefCell<EngineCalls>>, Rc<RefCell<EngineScript>>) {
        let calls: Rc<RefCell<EngineCalls>> = Default::default();
        let script: Rc<RefCell<EngineScript>> = Default::default();
        (Self { calls: calls.clone(), script: script.clone() }, calls, script)
    }
}

fn application_bytes(events: &[H3Event]) -> usize {
    events
        .iter()
        .map(|event| match event {
            H3Event::Data { data, .. } => data.len(),
            H3Event::DeferredConsume { consumed, .. } => *consumed,
            _ => 0,
        })
        .sum()
}

impl H3Engine for MockEngine {
    fn bind_control_stream(&mut self, stream_id: StreamId) -> Result<(), EngineError> {
        self.calls.borrow_mut().control = Some(stream_id);
        Ok(())
    }

    fn bind_qpack_streams(
        &mut self,
        encoder: StreamId,
        decoder: StreamId,
    ) -> Result<(), EngineError> {
        self.calls.borrow_mut().qpack = Some((encoder, decoder));
        Ok(())
    }

    fn submit_request(
        &mut self,
        stream_id: StreamId,
        headers: &[Header],
        has_body: bool,
    ) -> Result<(), EngineError> {
        self.calls
            .borrow_mut()
            .submits
            .push((stream_id, headers.to_vec(), has_body));
        Ok(())
    }

    fn read_stream(
        &mut self,
        stream_id: StreamId,
        data: &[u8],
        fin: bool,
    ) -> Result<(usize, Vec<H3Event>), EngineError> {
        let events = self
            .script
            .borrow_mut()
            .ingest
            .get_mut(&stream_id.0)
            .and_then(|queue| queue.pop_front())
            .unwrap_or_default();
        let direct = if fin {
            0
        } else {
            data.len().saturating_sub(application_bytes(&events))
        };
        Ok((direct, events))
    }

    fn writev_stream(
        &mut self,
        source: &mut dyn BodySource,
        _max_vecs: usize,
    ) -> Result<Option<OutboundBatch>, EngineError> {
        let mut script = self.script.borrow_mut();
        let Some(front) = script.writev.front() else {
            return Ok(None);
        };
        match front {
            WritevAction::Batch(batch) => {
                if script.blocked_now.contains(&batch.stream_id.0) {
                    return Ok(None);
                }
                Ok(Some(batch.clone()))
            }
            WritevAction::PullBody(stream_id) => {
                let stream_id = *stream_id;
                if script.blocked_now.contains(&stream_id.0) {
                    return Ok(None);
                }
                let chunk = source.pull_body(stream_id);
                if let Some(data) = chunk.data {
                    return Ok(Some(OutboundBatch { stream_id, vecs: vec![data], fin: false }));
                }
                if chunk.eof {
                    script.writev.pop_front();
                    return Ok(Some(OutboundBatch { stream_id, vecs: Vec::new(), fin: true }));
                }
                Ok(None)
            }
        }
    }

    fn block_stream(&mut self, stream_id: StreamId) {
        self.calls.borrow_mut().blocked.push(stream_id);
        self.script.borrow_mut().blocked_now.insert(stream_id.0);
    }

    fn unblock_stream(&mut self, stream_id: StreamId) {
        self.calls.borrow_mut().unblocked.push(stream_id);
        self.script.borrow_mut().blocked_now.remove(&stream_id.0);
    }

    fn add_write_offset(&mut self, stream_id: StreamId, n: usize) -> Result<(), EngineError> {
        self.calls.borrow_mut().write_offsets.push((stream_id, n));
        // advance the head batch past the written bytes; a fully written
        // batch is retired, a partially written one is re-offered
        let mut script = self.script.borrow_mut();
        let retire = match script.writev.front_mut() {
            Some(WritevAction::Batch(batch)) if batch.stream_id == stream_id => {
                let mut remaining = n;
                while remaining > 0 {
                    let Some(front) = batch.vecs.first_mut() else { break };
                    let take = remaining.min(front.len());
                    *front = front.slice(take..);
                    remaining -= take;
                    if front.is_empty() {
                        batch.vecs.remove(0);
                    }
                }
                batch.vecs.is_empty()
            }
            _ => false,
        };
        if retire {
            script.writev.pop_front();
        }
        Ok(())
    }

    fn add_ack_offset(&mut self, stream_id: StreamId, n: usize) -> Result<(), EngineError> {
        self.calls.borrow_mut().ack_offsets.push((stream_id, n));
        Ok(())
    }

    fn close_stream(
        &mut self,
        stream_id: StreamId,
        app_error_code: u64,
    ) -> Result<Vec<H3Event>, EngineError> {
        self.calls.borrow_mut().closed.push((stream_id, app_error_code));
        Ok(vec![H3Event::StreamClosed { stream_id, error_code: app_error_code }])
    }
}

// ============================================================================
// Event Builders
// ============================================================================

pub fn header_event(stream_id: u64, name: &'static [u8], value: &'static [u8]) -> H3Event {
    H3Event::Header {
        stream_id: StreamId(stream_id),
        name: Bytes::from_static(name),
        value: Bytes::from_static(value),
    }
}

pub fn end_headers(stream_id: u64) -> H3Event {
    H3Event::EndHeaders { stream_id: StreamId(stream_id), fin: false }
}

pub fn data_event(stream_id: u64, data: &'static [u8]) -> H3Event {
    H3Event::Data { stream_id: StreamId(stream_id), data: Bytes::from_static(data) }
}

pub fn end_stream(stream_id: u64) -> H3Event {
    H3Event::EndStream { stream_id: StreamId(stream_id) }
}
