//! A synchronous pull-style facade over one request at a time.
//!
//! [`SingleStreamSession`] submits a request, drives the session until the
//! response headers are in, and then lets the caller drain the body in
//! caller-sized chunks instead of registering a consumer. Body bytes that
//! arrive between reads land in the stream's spill buffer and are handed out
//! on the next read, so nothing is lost.

use http::{HeaderMap, Method, Uri};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::session::Session;
use crate::stream::ReceiveBuffer;
use h3mux_x::{DataProvider, H3Engine, QuicConnection, ResponseSink, StreamId};

/// Upper bound on one readiness wait inside the read loop, so the loop
/// re-checks stream state at a reasonable cadence.
const POLL_SLICE: Duration = Duration::from_millis(50);

/// One-request-at-a-time facade over a [`Session`].
pub struct SingleStreamSession {
    session: Session,
}

impl SingleStreamSession {
    /// Establish a client session on an established QUIC connection.
    pub fn new(
        conn: Box<dyn QuicConnection>,
        engine: Box<dyn H3Engine>,
        config: SessionConfig,
    ) -> Result<Self> {
        Ok(Self { session: Session::new(conn, engine, true, config)? })
    }

    /// The underlying session, for inspection.
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Submit a request and drive the session until its response headers have
    /// been received. The response body stays queued for [`Self::read_data`].
    pub fn submit_request(
        &mut self,
        url: Uri,
        method: Method,
        request_headers: &HeaderMap,
        body: Option<Box<dyn DataProvider>>,
        response: Box<dyn ResponseSink>,
    ) -> Result<StreamId> {
        let id = self.session.new_stream(url, method, request_headers, body, response, None)?;
        self.session.run_until(false)?;
        Ok(id)
    }

    /// Read response body bytes into `buf`, waiting until the buffer is full,
    /// the stream ends, or the configured I/O timeout elapses.
    ///
    /// Returns the byte count placed in `buf`; zero once the body is done.
    /// Requires the response headers to be complete, which
    /// [`Self::submit_request`] guarantees on success.
    pub fn read_data(&mut self, id: StreamId, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        {
            let stream = self
                .session
                .streams
                .get_mut(&id)
                .ok_or(Error::UnknownStream(id))?;
            if !stream.is_headers_complete() {
                return Err(Error::HeadersNotComplete(id));
            }
            // spilled bytes from earlier passes drain into the fresh buffer
            stream.set_receive_buffer(ReceiveBuffer::new(buf.len()));
        }

        let deadline = Instant::now() + self.session.config.io_timeout;
        loop {
            let (filled, closed) = match self.session.streams.get(&id) {
                Some(stream) => (stream.receive_buffer().len(), stream.is_closed()),
                None => break,
            };
            if filled >= buf.len() || closed {
                break;
            }

            let now = Instant::now();
            if now >= deadline {
                debug!("[stream {}] read timed out with {} bytes buffered", id, filled);
                break;
            }
            let wait = (deadline - now).min(POLL_SLICE);
            self.session.conn.poll_readable(Some(wait));
            self.session.conn.handle_events();
            self.session.receive_from_quic(id, true)?;
        }

        match self.session.streams.get_mut(&id) {
            Some(stream) => {
                let n = stream.take_received(buf);
                if n < buf.len() {
                    debug!("[stream {}] requested {} bytes, got {}", id, buf.len(), n);
                }
                Ok(n)
            }
            None => Ok(0),
        }
    }
}
