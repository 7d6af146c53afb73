//! Upstream dial listeners
//!
//! Routing never opens upstream connections itself; it asks one of two
//! listener-shaped collaborators for a ready byte stream. Host legs dial
//! the server-local in-process SSHD; client legs dial the reverse tunnel
//! the session's host established. Keeping both behind traits lets tests
//! substitute counting stubs and in-process pipes.

pub mod unix;

pub use unix::{UnixSessionDialListener, UnixSshdDialListener};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::Result;

/// Byte stream suitable for running an SSH handshake over.
pub trait DialStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> DialStream for T {}

/// Boxed stream handed back by a dial listener.
pub type BoxedStream = Box<dyn DialStream>;

/// Dials the local in-process SSHD. Host legs go here: the host
/// authenticates directly against the server's SSHD with the keys listed
/// at registration.
#[async_trait]
pub trait SshdDialListener: Send + Sync {
    async fn dial(&self) -> Result<BoxedStream>;
}

/// Dials the reverse tunnel belonging to a session. Client legs go here.
#[async_trait]
pub trait SessionDialListener: Send + Sync {
    async fn dial(&self, session_id: &str) -> Result<BoxedStream>;
}
