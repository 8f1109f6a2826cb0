//! Session-layer error types.
//!
//! The error taxonomy separates fatal configuration errors (session
//! construction), per-request protocol violations (the session stays usable),
//! and terminal transport/engine failures surfaced from the event pump.
//! Transient transport conditions (would-block) never appear here; they are
//! absorbed at the stream layer and retried on the next event-loop pass.

use h3mux_x::{EngineError, StreamId, TransportError};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// The transport refused to switch to (or report) non-blocking mode.
    /// Fatal to session construction; the event pump requires it.
    #[error("cannot switch transport to non-blocking mode")]
    BlockingTransport,

    #[error("invalid session configuration: {0}")]
    Config(String),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("protocol engine error: {0}")]
    Engine(#[from] EngineError),

    /// All requests on one session must share one `:authority`.
    #[error("registered authority '{session}' does not match new request: '{request}'")]
    AuthorityMismatch { session: String, request: String },

    /// The request URL has no host and no `Host` header was supplied.
    #[error("no authority resolvable for request")]
    NoAuthority,

    /// Request submission is a client-side operation.
    #[error("cannot submit a request on a server session")]
    NotClient,

    #[error("no stream for id {0}")]
    UnknownStream(StreamId),

    #[error("cannot add stream {0} to session: id already registered")]
    DuplicateStream(StreamId),

    /// A response header arrived for a stream without a response sink.
    #[error("stream {0} has no response sink set")]
    NoResponseSink(StreamId),

    /// Body reads require the response headers to have been received first.
    #[error("response headers not complete on stream {0}")]
    HeadersNotComplete(StreamId),

    /// The engine reported consuming more ingest bytes than were supplied.
    /// Guards against an engine under- or over-reporting via its callbacks.
    #[error("engine consumed {consumed} bytes but only {available} were available")]
    ConsumeOverflow { consumed: usize, available: usize },

    #[error("malformed {0} pseudo-header value")]
    MalformedPseudoHeader(&'static str),

    /// The caller-configured I/O timeout elapsed while waiting for the
    /// transport to become readable.
    #[error("connection timed out")]
    Timeout,
}
