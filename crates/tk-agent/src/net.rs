//! Plain TCP network
//!
//! The local half of every tunnel: Local tunnels bind here, Remote tunnels
//! dial here.

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};

use tk_core::traits::{BoxedListener, BoxedStream, Listener, Network};
use tk_core::{Endpoint, TransportError};

/// Dials and binds ordinary TCP sockets on this machine
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalNetwork;

impl LocalNetwork {
    /// Create the local network
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Network for LocalNetwork {
    async fn dial(&self, address: &Endpoint) -> Result<BoxedStream, TransportError> {
        let target = address.to_string();
        let stream = TcpStream::connect((address.host.as_str(), address.port))
            .await
            .map_err(|e| TransportError::io(&target, e))?;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("Failed to set TCP_NODELAY on {}: {}", target, e);
        }
        Ok(Box::new(stream))
    }

    async fn listen(&self, address: &Endpoint) -> Result<BoxedListener, TransportError> {
        let listener = TcpListener::bind((address.host.as_str(), address.port))
            .await
            .map_err(|e| TransportError::io(address.to_string(), e))?;
        let local_addr = listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| address.to_string());
        Ok(Box::new(LocalListener {
            listener: Some(listener),
            local_addr,
        }))
    }
}

/// A bound TCP listener; `close` drops the socket
struct LocalListener {
    listener: Option<TcpListener>,
    local_addr: String,
}

#[async_trait]
impl Listener for LocalListener {
    async fn accept(&mut self) -> Result<(BoxedStream, String), TransportError> {
        let listener = self.listener.as_ref().ok_or_else(|| {
            TransportError::io(
                &self.local_addr,
                std::io::Error::from(std::io::ErrorKind::NotConnected),
            )
        })?;
        let (stream, peer) = listener
            .accept()
            .await
            .map_err(|e| TransportError::io(&self.local_addr, e))?;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
        }
        Ok((Box::new(stream), peer.to_string()))
    }

    fn local_addr(&self) -> String {
        self.local_addr.clone()
    }

    async fn close(&mut self) {
        if self.listener.take().is_some() {
            tracing::debug!("Closed listener on {}", self.local_addr);
        }
    }
}
