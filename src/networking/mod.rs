#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! The BEP session layer: a framed [`connection`] over any
//! `AsyncRead + AsyncWrite` stream, the per-peer [`session`] state machine
//! built on top of it, and the glue that turns an accepted, mutually
//! authenticated stream into a running session.

pub mod connection;
pub mod listener;
pub mod session;

pub use connection::{connection, ConnectionError, ConnectionReader, ConnectionWriter};
pub use listener::{accept_peer, PeerCertSource, PeerConnection};
pub use session::{new_handle, run_session, HeartbeatConfig, SessionError, SessionHandle, SessionState};
