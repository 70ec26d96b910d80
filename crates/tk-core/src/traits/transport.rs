//! Secure transport traits

use async_trait::async_trait;

use super::network::Network;
use crate::error::TransportError;

/// One live, authenticated session to the remote host
///
/// Shared by every tunnel worker of a connection cycle, so all methods take
/// `&self` and must be safe to call concurrently.
#[async_trait]
pub trait SecureConnection: Network {
    /// Block until the session ends.
    ///
    /// Returns `Ok(())` on a clean close and the terminating error otherwise.
    async fn wait_for_termination(&self) -> Result<(), TransportError>;

    /// Close the session
    async fn close(&self);
}

/// Establishes secure sessions; holds the address and credentials
#[async_trait]
pub trait SecureTransport: Send + Sync {
    /// Connection type produced by this transport
    type Conn: SecureConnection + 'static;

    /// Make a single connection attempt
    async fn connect(&self) -> Result<Self::Conn, TransportError>;

    /// Human-readable address of the remote host
    fn address(&self) -> &str;
}
