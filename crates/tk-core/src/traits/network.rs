//! Stream, listener and network traits
//!
//! Both the local socket layer and the secure session expose the same
//! dial/listen capability so tunnel workers can bind on one side and dial
//! on the other without caring which is which.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::TransportError;
use crate::types::Endpoint;

/// A connected, bidirectional byte stream
pub trait StreamIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> StreamIo for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// Type-erased stream
pub type BoxedStream = Box<dyn StreamIo>;

/// Type-erased listener
pub type BoxedListener = Box<dyn Listener>;

/// A bound endpoint that yields inbound streams
#[async_trait]
pub trait Listener: Send {
    /// Wait for the next inbound connection.
    ///
    /// Returns the stream and a description of the peer. An error means the
    /// listener is closed or dead.
    async fn accept(&mut self) -> Result<(BoxedStream, String), TransportError>;

    /// Address the listener is bound to
    fn local_addr(&self) -> String;

    /// Release the bound endpoint
    async fn close(&mut self);
}

/// Something that can dial out and bind listeners
#[async_trait]
pub trait Network: Send + Sync {
    /// Open a stream to `address`
    async fn dial(&self, address: &Endpoint) -> Result<BoxedStream, TransportError>;

    /// Start accepting connections on `address`
    async fn listen(&self, address: &Endpoint) -> Result<BoxedListener, TransportError>;
}
