//! Server-side listener backed by an SSH remote forward

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use tk_core::traits::{BoxedStream, Listener};
use tk_core::{Endpoint, TransportError};

use super::connector::SessionShared;
use super::handler::ForwardedChannel;
use super::stream::bridge;

/// Accepts connections the server forwards for one `tcpip-forward` request
pub(crate) struct ForwardedListener {
    shared: Arc<SessionShared>,
    address: Endpoint,
    rx: mpsc::Receiver<ForwardedChannel>,
    closed: bool,
}

impl ForwardedListener {
    pub fn new(
        shared: Arc<SessionShared>,
        address: Endpoint,
        rx: mpsc::Receiver<ForwardedChannel>,
    ) -> Self {
        Self {
            shared,
            address,
            rx,
            closed: false,
        }
    }
}

#[async_trait]
impl Listener for ForwardedListener {
    async fn accept(&mut self) -> Result<(BoxedStream, String), TransportError> {
        if self.closed {
            return Err(TransportError::SessionClosed);
        }

        tokio::select! {
            forwarded = self.rx.recv() => match forwarded {
                Some(ForwardedChannel { channel, peer }) => {
                    let stream: BoxedStream = Box::new(bridge(channel));
                    Ok((stream, peer))
                }
                None => Err(TransportError::SessionClosed),
            },
            _ = self.shared.terminated.cancelled() => Err(TransportError::SessionClosed),
        }
    }

    fn local_addr(&self) -> String {
        format!("remote {}", self.address)
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.rx.close();
        self.shared.routes.remove(&u32::from(self.address.port));

        if self.shared.terminated.is_cancelled() {
            return;
        }
        let handle = self.shared.handle.read().await;
        if let Err(e) = handle
            .cancel_tcpip_forward(self.address.host.clone(), u32::from(self.address.port))
            .await
        {
            tracing::debug!("Failed to cancel remote forward {}: {}", self.address, e);
        }
    }
}

impl Drop for ForwardedListener {
    fn drop(&mut self) {
        if !self.closed {
            self.shared.routes.remove(&u32::from(self.address.port));
        }
    }
}
