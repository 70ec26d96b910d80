//! Reconnect loop
//!
//! Each cycle acquires one secure session, runs a worker per tunnel over it,
//! and waits for every worker to finish before tearing the session down and
//! starting over.

use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use tk_core::config::{BackoffConfig, ForwarderConfig};
use tk_core::traits::{Network, SecureConnection, SecureTransport};
use tk_core::TunnelRegistry;

use crate::tunnel::{watch_connection, ConnectionSupervisor, ListenerSupervisor, TunnelWorker};

/// Drives all tunnels through successive secure sessions
pub struct Orchestrator<T> {
    supervisor: ConnectionSupervisor<T>,
    local: Arc<dyn Network>,
    registry: TunnelRegistry,
    listeners: ListenerSupervisor,
    retry: BackoffConfig,
}

impl<T: SecureTransport> Orchestrator<T> {
    /// Create an orchestrator for `registry` over `transport` and `local`
    pub fn new(
        transport: T,
        local: Arc<dyn Network>,
        registry: TunnelRegistry,
        listeners: ListenerSupervisor,
        retry: BackoffConfig,
    ) -> Self {
        Self {
            supervisor: ConnectionSupervisor::new(transport, retry.clone()),
            local,
            registry,
            listeners,
            retry,
        }
    }

    /// Build an orchestrator from the forwarder configuration
    pub fn from_config(transport: T, local: Arc<dyn Network>, config: &ForwarderConfig) -> Self {
        Self::new(
            transport,
            local,
            config.registry(),
            ListenerSupervisor::new(config.retry.clone(), config.listen_errors),
            config.retry.clone(),
        )
    }

    /// Run connect/forward cycles until `shutdown` fires
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut cycle: u64 = 0;

        loop {
            let conn = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                conn = self.supervisor.connect() => Arc::new(conn),
            };
            cycle += 1;

            self.run_cycle(cycle, conn, &shutdown).await;

            if shutdown.is_cancelled() {
                break;
            }
            tracing::info!("Reconnecting to {}", self.supervisor.transport().address());
        }

        tracing::info!("Orchestrator stopped");
    }

    /// One session: start every worker, wait for all of them, close the session
    async fn run_cycle(&self, cycle: u64, conn: Arc<T::Conn>, shutdown: &CancellationToken) {
        // Fires on session loss and on process shutdown
        let lost = shutdown.child_token();
        let watcher = watch_connection(Arc::clone(&conn), lost.clone());
        let secure: Arc<dyn Network> = conn.clone();

        let mut workers = JoinSet::new();
        for spec in self.registry.iter() {
            let worker = TunnelWorker::new(
                spec.clone(),
                Arc::clone(&secure),
                Arc::clone(&self.local),
                self.listeners.clone(),
                lost.clone(),
            );
            workers.spawn(worker.run());
        }
        tracing::info!("Cycle {}: started {} tunnel(s)", cycle, workers.len());

        // Wait for every tunnel of this session
        while let Some(result) = workers.join_next().await {
            match result {
                Ok(exit) => tracing::debug!("Cycle {}: worker exited ({:?})", cycle, exit),
                Err(e) => tracing::error!("Cycle {}: worker task failed: {}", cycle, e),
            }
        }

        if !lost.is_cancelled() {
            let delay = self.retry.initial;
            tracing::warn!(
                "Cycle {}: every tunnel stopped while the session is up, restarting in {:?}",
                cycle,
                delay
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = lost.cancelled() => {}
            }
        }

        // Stop relays still running, then drop the session
        lost.cancel();
        watcher.abort();
        drop(secure);
        conn.close().await;
        tracing::info!("Cycle {}: session closed", cycle);
    }
}
