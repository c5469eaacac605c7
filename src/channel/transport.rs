//! Transport seam for the event channel

use async_trait::async_trait;
use thiserror::Error;

use crate::auth::Credential;

#[derive(Debug, Error)]
pub enum ChannelError {
    /// The server refused the credential.
    #[error("authentication rejected: {0}")]
    Unauthenticated(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("connection closed")]
    Closed,
    #[error("not connected")]
    NotConnected,
}

/// A duplex text-frame connection to the event endpoint.
///
/// `recv` returns `Ok(None)` when the peer closes cleanly.
#[async_trait]
pub trait Transport: Send {
    async fn connect(&mut self, credential: &Credential) -> Result<(), ChannelError>;
    async fn recv(&mut self) -> Result<Option<String>, ChannelError>;
    async fn send(&mut self, frame: String) -> Result<(), ChannelError>;
    async fn disconnect(&mut self);
}
