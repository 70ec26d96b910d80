//! Per-tunnel accept/dial/relay loop

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use tk_core::traits::{Listener, Network};
use tk_core::{TunnelDirection, TunnelSpec};

use super::listener::ListenerSupervisor;
use super::relay::RelaySession;

/// Why a tunnel worker stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// The listener could not be opened (fatal bind error or connection loss)
    BindFailed,
    /// The connection-lost signal fired
    ConnectionLost,
    /// The listener stopped accepting
    ListenerClosed,
}

/// Runs one tunnel for the lifetime of one secure session
pub struct TunnelWorker {
    spec: TunnelSpec,
    bind_side: Arc<dyn Network>,
    dial_side: Arc<dyn Network>,
    listeners: ListenerSupervisor,
    lost: CancellationToken,
}

impl TunnelWorker {
    /// Create a worker for `spec`.
    ///
    /// Local tunnels bind on `local` and dial through `secure`; remote
    /// tunnels do the opposite.
    pub fn new(
        spec: TunnelSpec,
        secure: Arc<dyn Network>,
        local: Arc<dyn Network>,
        listeners: ListenerSupervisor,
        lost: CancellationToken,
    ) -> Self {
        let (bind_side, dial_side) = match spec.direction {
            TunnelDirection::Local => (local, secure),
            TunnelDirection::Remote => (secure, local),
        };
        Self {
            spec,
            bind_side,
            dial_side,
            listeners,
            lost,
        }
    }

    /// Bind, then accept and relay until the listener dies or the session is lost
    pub async fn run(self) -> WorkerExit {
        let mut listener = match self
            .listeners
            .ensure_listening(self.bind_side.as_ref(), &self.spec.bind, &self.lost)
            .await
        {
            Ok(listener) => listener,
            Err(e) => {
                tracing::error!(
                    "Tunnel '{}' stopped until the next session: {}",
                    self.spec,
                    e
                );
                return WorkerExit::BindFailed;
            }
        };

        tracing::info!(
            "Tunnel '{}' listening on {} ({})",
            self.spec,
            listener.local_addr(),
            self.spec.direction
        );

        let exit = self.accept_loop(listener.as_mut()).await;
        listener.close().await;

        tracing::info!("Tunnel '{}' stopped ({:?})", self.spec, exit);
        exit
    }

    async fn accept_loop(&self, listener: &mut dyn Listener) -> WorkerExit {
        loop {
            if self.lost.is_cancelled() {
                return WorkerExit::ConnectionLost;
            }

            let accepted = tokio::select! {
                biased;
                _ = self.lost.cancelled() => return WorkerExit::ConnectionLost,
                result = listener.accept() => result,
            };

            let (inbound, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!("Tunnel '{}' accept failed: {}", self.spec, e);
                    return WorkerExit::ListenerClosed;
                }
            };
            tracing::debug!("Tunnel '{}' accepted connection from {}", self.spec, peer);

            // Dial the target on the opposite side
            let dialed = tokio::select! {
                biased;
                _ = self.lost.cancelled() => return WorkerExit::ConnectionLost,
                result = self.dial_side.dial(&self.spec.target) => result,
            };

            let outbound = match dialed {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::warn!(
                        "Tunnel '{}' could not reach {}: {}",
                        self.spec,
                        self.spec.target,
                        e
                    );
                    drop(inbound);
                    continue;
                }
            };

            // Relays run detached and end with the session
            let label = format!("{} {} -> {}", self.spec.direction, peer, self.spec.target);
            let relay = RelaySession::new(label, inbound, outbound);
            tokio::spawn(relay.run(self.lost.clone()));
        }
    }
}
