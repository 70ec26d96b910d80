//! Listener supervision
//!
//! Binds a tunnel's listening endpoint, retrying transient failures at the
//! configured interval and giving up immediately on fatal ones.

use tokio_util::sync::CancellationToken;

use tk_core::config::{BackoffConfig, ListenErrorPolicy};
use tk_core::traits::{BoxedListener, Network};
use tk_core::{Endpoint, ErrorClass, TransportError};

use super::reconnect::ExponentialBackoff;

/// Opens listeners with retry and fatal-error classification
#[derive(Debug, Clone)]
pub struct ListenerSupervisor {
    retry: BackoffConfig,
    policy: ListenErrorPolicy,
}

impl ListenerSupervisor {
    /// Create a supervisor with the given retry interval and policy
    pub fn new(retry: BackoffConfig, policy: ListenErrorPolicy) -> Self {
        Self { retry, policy }
    }

    /// Bind `address` on `network`, retrying until success or a fatal error.
    ///
    /// `network` is either the local socket layer or the secure session,
    /// depending on the tunnel direction. If `lost` fires while waiting, the
    /// call returns [`TransportError::SessionClosed`].
    pub async fn ensure_listening(
        &self,
        network: &dyn Network,
        address: &Endpoint,
        lost: &CancellationToken,
    ) -> Result<BoxedListener, TransportError> {
        let mut backoff = ExponentialBackoff::from_config(&self.retry);

        loop {
            let attempt = tokio::select! {
                biased;
                _ = lost.cancelled() => return Err(TransportError::SessionClosed),
                result = network.listen(address) => result,
            };

            let err = match attempt {
                Ok(listener) => return Ok(listener),
                Err(e) => e,
            };

            if self.policy.classify(&err) == ErrorClass::Fatal {
                tracing::error!("Listening on {} failed permanently: {}", address, err);
                return Err(err);
            }

            let delay = backoff.next_delay();
            tracing::warn!(
                "Failed to listen on {}: {}. Retrying in {:?}",
                address,
                err,
                delay
            );
            tokio::select! {
                biased;
                _ = lost.cancelled() => return Err(TransportError::SessionClosed),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
