//! h3mux: HTTP/3 Session and Stream Multiplexing
//!
//! This crate maps HTTP/3 semantics onto an established QUIC connection: it
//! owns the per-connection stream table, pumps bytes between the transport
//! and the HTTP/3 protocol engine, and exposes request/response exchanges
//! with incremental body transfer in both directions.
//!
//! The transport and the protocol engine are collaborators behind the traits
//! in [`h3mux_x`]; this crate contains no QUIC implementation and no HTTP/3
//! frame or QPACK logic of its own.
//!
//! # Architecture
//!
//! - [`Session`]: one HTTP/3 connection. Owns the transport handle, the
//!   engine, and all streams; drives everything from a single-threaded
//!   event pump ([`Session::handle_events`] / [`Session::run`]).
//! - [`Stream`]: one exchange over one QUIC stream. Buffers outbound body
//!   chunks until acknowledged and inbound body bytes until drained.
//! - [`SingleStreamSession`]: a synchronous facade for the common
//!   one-request case, with pull-style body reads.
//!
//! # Usage
//!
//! ```no_run
//! # use h3mux::{Session, SessionConfig};
//! # use h3mux_x::{BufferConsumer, ResponseHeaders};
//! # use http::{HeaderMap, Method, Uri};
//! # use std::cell::RefCell;
//! # use std::rc::Rc;
//! # fn connect() -> (Box<dyn h3mux_x::QuicConnection>, Box<dyn h3mux_x::H3Engine>) {
//! #     unimplemented!()
//! # }
//! let (conn, engine) = connect();
//! let mut session = Session::new(conn, engine, true, SessionConfig::default())?;
//!
//! let response = Rc::new(RefCell::new(ResponseHeaders::new()));
//! let body = BufferConsumer::new();
//! let body_handle = body.handle();
//! let url: Uri = "https://example.com/".parse()?;
//! session.new_stream(
//!     url,
//!     Method::GET,
//!     &HeaderMap::new(),
//!     None,
//!     Box::new(response.clone()),
//!     Some(Box::new(body)),
//! )?;
//! session.run()?;
//!
//! assert!(body_handle.borrow().finished);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

#![forbid(unsafe_code)]

pub mod config;
pub mod error;
mod message;
pub mod session;
pub mod single;
pub mod stream;

pub use config::SessionConfig;
pub use error::{Error, Result};
pub use session::Session;
pub use single::SingleStreamSession;
pub use stream::{ReceiveBuffer, Stream, StreamType};
