//! SSH client handler
//!
//! Verifies the server identity and hands channels opened by the server for
//! remote forwards to the listener that requested them.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dashmap::DashMap;
use russh::client::{self, Msg};
use russh::Channel;
use russh_keys::key::PublicKey;
use tokio::sync::mpsc;
use tokio_util::sync::DropGuard;

/// A channel the server opened for one of our remote forwards
pub(crate) struct ForwardedChannel {
    pub channel: Channel<Msg>,
    pub peer: String,
}

/// Remote forward port -> queue of the listener waiting on it
pub(crate) type ForwardRoutes = Arc<DashMap<u32, mpsc::Sender<ForwardedChannel>>>;

/// Host key rejection reason recorded during the handshake
pub(crate) type HostKeyVerdict = Arc<Mutex<Option<String>>>;

/// How the server's host key is checked
#[derive(Debug, Clone)]
pub(crate) struct HostKeyPolicy {
    pub host: String,
    pub port: u16,
    pub known_hosts: Option<PathBuf>,
    pub strict: bool,
}

/// SSH client handler for one session
///
/// russh owns the handler for as long as the session runs, so dropping it
/// releases `_session_alive` and marks the session as terminated.
pub(crate) struct ClientHandler {
    host_keys: HostKeyPolicy,
    verdict: HostKeyVerdict,
    routes: ForwardRoutes,
    _session_alive: DropGuard,
}

impl ClientHandler {
    pub fn new(
        host_keys: HostKeyPolicy,
        verdict: HostKeyVerdict,
        routes: ForwardRoutes,
        session_alive: DropGuard,
    ) -> Self {
        Self {
            host_keys,
            verdict,
            routes,
            _session_alive: session_alive,
        }
    }

    fn reject(&self, reason: String) -> bool {
        tracing::error!("{}", reason);
        if let Ok(mut verdict) = self.verdict.lock() {
            *verdict = Some(reason);
        }
        false
    }
}

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = anyhow::Error;

    /// Verify the server's host key against known_hosts
    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let fingerprint = server_public_key.fingerprint();
        tracing::debug!("Server host key: {}", fingerprint);

        let Some(path) = self.host_keys.known_hosts.clone() else {
            if self.host_keys.strict {
                return Ok(self.reject(
                    "No known_hosts file configured and strict host key checking is on"
                        .to_string(),
                ));
            }
            tracing::warn!("Accepting unverified host key {}", fingerprint);
            return Ok(true);
        };

        match russh_keys::check_known_hosts_path(
            &self.host_keys.host,
            self.host_keys.port,
            server_public_key,
            &path,
        ) {
            Ok(true) => {
                tracing::debug!("Host key verified against {:?}", path);
                Ok(true)
            }
            Ok(false) if !self.host_keys.strict => {
                tracing::warn!(
                    "Host {} not in {:?}, accepting key {}",
                    self.host_keys.host,
                    path,
                    fingerprint
                );
                Ok(true)
            }
            Ok(false) => Ok(self.reject(format!(
                "Host {} is not in {:?} (key {})",
                self.host_keys.host, path, fingerprint
            ))),
            Err(e) => Ok(self.reject(format!(
                "Host key for {} does not match {:?}: {}",
                self.host_keys.host, path, e
            ))),
        }
    }

    /// Route a connection arriving on one of our remote forwards
    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        let route = self
            .routes
            .get(&connected_port)
            .map(|entry| entry.value().clone());

        let Some(route) = route else {
            tracing::warn!(
                "Server opened a forward for {}:{} which was never requested",
                connected_address,
                connected_port
            );
            let _ = channel.close().await;
            return Ok(());
        };

        let forwarded = ForwardedChannel {
            channel,
            peer: format!("{}:{}", originator_address, originator_port),
        };
        if let Err(e) = route.try_send(forwarded) {
            tracing::warn!(
                "Dropping forwarded connection on {}:{}: listener not accepting",
                connected_address,
                connected_port
            );
            let rejected = match e {
                mpsc::error::TrySendError::Full(f) | mpsc::error::TrySendError::Closed(f) => f,
            };
            let _ = rejected.channel.close().await;
        }
        Ok(())
    }
}
