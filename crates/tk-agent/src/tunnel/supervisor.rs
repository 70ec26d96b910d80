//! Secure connection supervision
//!
//! Keeps trying to establish the secure session and, once it is up, watches
//! it so every tunnel worker learns when it goes away.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use tk_core::config::BackoffConfig;
use tk_core::traits::{SecureConnection, SecureTransport};
use tk_core::TransportError;

use super::reconnect::ExponentialBackoff;

/// Establishes the secure session with unbounded retry
pub struct ConnectionSupervisor<T> {
    transport: T,
    retry: BackoffConfig,
}

impl<T: SecureTransport> ConnectionSupervisor<T> {
    /// Create a supervisor for `transport`
    pub fn new(transport: T, retry: BackoffConfig) -> Self {
        Self { transport, retry }
    }

    /// The underlying transport
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Connect, retrying every failure until a session is up.
    ///
    /// Never returns an error: authentication and host key rejections are
    /// logged loudly but retried like any other failure.
    pub async fn connect(&self) -> T::Conn {
        let mut backoff = ExponentialBackoff::from_config(&self.retry);

        loop {
            match self.transport.connect().await {
                Ok(conn) => {
                    tracing::info!("Connected to {}", self.transport.address());
                    return conn;
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    match e {
                        TransportError::AuthRejected(_) | TransportError::HostKeyRejected(_) => {
                            tracing::error!(
                                "Connection to {} refused: {}. Retrying in {:?}",
                                self.transport.address(),
                                e,
                                delay
                            );
                        }
                        _ => {
                            tracing::warn!(
                                "Connection to {} failed: {}. Retrying in {:?}",
                                self.transport.address(),
                                e,
                                delay
                            );
                        }
                    }
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

/// Spawn the watcher that fires `lost` when `conn` terminates.
///
/// `lost` is the connection-lost signal shared by every tunnel worker of
/// this cycle. The watcher also exits quietly if `lost` is cancelled by
/// someone else first.
pub fn watch_connection<C>(conn: Arc<C>, lost: CancellationToken) -> JoinHandle<()>
where
    C: SecureConnection + 'static,
{
    tokio::spawn(async move {
        tokio::select! {
            result = conn.wait_for_termination() => {
                match result {
                    Ok(()) => tracing::warn!("Secure session closed"),
                    Err(e) => tracing::warn!("Secure session lost: {}", e),
                }
                lost.cancel();
            }
            _ = lost.cancelled() => {}
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tk_core::traits::{BoxedListener, BoxedStream, Network};
    use tk_core::Endpoint;
    use tokio::time::Instant;

    struct StubConnection {
        ended: CancellationToken,
    }

    #[async_trait]
    impl Network for StubConnection {
        async fn dial(&self, _address: &Endpoint) -> Result<BoxedStream, TransportError> {
            Err(TransportError::SessionClosed)
        }

        async fn listen(&self, _address: &Endpoint) -> Result<BoxedListener, TransportError> {
            Err(TransportError::SessionClosed)
        }
    }

    #[async_trait]
    impl SecureConnection for StubConnection {
        async fn wait_for_termination(&self) -> Result<(), TransportError> {
            self.ended.cancelled().await;
            Err(TransportError::Protocol("connection reset".into()))
        }

        async fn close(&self) {
            self.ended.cancel();
        }
    }

    /// Fails the first `failures` attempts
    struct FlakyTransport {
        failures: usize,
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl SecureTransport for FlakyTransport {
        type Conn = StubConnection;

        async fn connect(&self) -> Result<StubConnection, TransportError> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.failures {
                if attempt % 2 == 0 {
                    return Err(TransportError::Timeout(Duration::from_secs(30)));
                }
                return Err(TransportError::AuthRejected("ops".into()));
            }
            Ok(StubConnection {
                ended: CancellationToken::new(),
            })
        }

        fn address(&self) -> &str {
            "gateway:22"
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_retries_until_success() {
        let supervisor = ConnectionSupervisor::new(
            FlakyTransport {
                failures: 4,
                attempts: AtomicUsize::new(0),
            },
            BackoffConfig::default(),
        );
        let start = Instant::now();

        let _conn = supervisor.connect().await;

        assert_eq!(supervisor.transport().attempts.load(Ordering::SeqCst), 5);
        assert_eq!(start.elapsed(), Duration::from_secs(20));
    }

    #[tokio::test]
    async fn test_watcher_broadcasts_loss_to_every_consumer() {
        let conn = Arc::new(StubConnection {
            ended: CancellationToken::new(),
        });
        let lost = CancellationToken::new();
        let watcher = watch_connection(Arc::clone(&conn), lost.clone());

        let consumers: Vec<_> = (0..3)
            .map(|_| {
                let lost = lost.clone();
                tokio::spawn(async move { lost.cancelled().await })
            })
            .collect();

        conn.close().await;
        watcher.await.unwrap();
        for consumer in consumers {
            consumer.await.unwrap();
        }
        assert!(lost.is_cancelled());
    }

    #[tokio::test]
    async fn test_watcher_exits_when_cycle_ends_first() {
        let conn = Arc::new(StubConnection {
            ended: CancellationToken::new(),
        });
        let lost = CancellationToken::new();
        let watcher = watch_connection(conn, lost.clone());

        lost.cancel();
        watcher.await.unwrap();
    }
}
