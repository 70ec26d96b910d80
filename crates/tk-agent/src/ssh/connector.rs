//! Outbound SSH session
//!
//! Establishes the authenticated session the tunnels run over and exposes
//! it as a [`SecureConnection`]: `direct-tcpip` channels for dialing and
//! `tcpip-forward` requests for listening on the server side.

use std::borrow::Cow;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use russh::client::{self, Config, Handle};
use russh::{Disconnect, Preferred};
use russh_keys::key::{self, KeyPair};
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

use tk_core::config::ForwarderConfig;
use tk_core::traits::{BoxedListener, BoxedStream, Network, SecureConnection, SecureTransport};
use tk_core::{Endpoint, TransportError};

use super::handler::{ClientHandler, ForwardRoutes, HostKeyPolicy, HostKeyVerdict};
use super::listener::ForwardedListener;
use super::stream::bridge;

/// Default SSH port when `remote_server` has none
const DEFAULT_SSH_PORT: u16 = 22;

/// Host key algorithms offered to the server
const HOST_KEY_ALGORITHMS: &[key::Name] = &[key::ECDSA_SHA2_NISTP256, key::ED25519];

/// Forwarded connections that may queue for one remote listener before
/// further ones are refused.
const FORWARD_BACKLOG: usize = 64;

/// Errors preparing the SSH transport
#[derive(Debug, Error)]
pub enum SetupError {
    /// Private key file not found
    #[error("Private key not found at {path}")]
    KeyNotFound { path: String },

    /// Private key could not be decoded
    #[error("Failed to load private key {path}: {message}")]
    KeyUnreadable { path: String, message: String },
}

/// Everything needed to open the SSH session
#[derive(Debug, Clone)]
pub struct SshSettings {
    /// Server host name or address
    pub host: String,
    /// Server port
    pub port: u16,
    /// Login user
    pub user: String,
    /// Private key for public key authentication
    pub key_path: PathBuf,
    /// known_hosts file for server verification
    pub known_hosts: Option<PathBuf>,
    /// Refuse unknown hosts
    pub strict_host_key_checking: bool,
    /// Limit for connect plus authentication
    pub connect_timeout: Duration,
    /// Keepalive interval (zero disables)
    pub keepalive_interval: Duration,
    /// Unanswered keepalives before the session is dropped
    pub keepalive_max: usize,
}

impl SshSettings {
    /// Derive the SSH settings from the forwarder configuration
    pub fn from_config(config: &ForwarderConfig) -> Self {
        let (host, port) = split_host_port(config.remote_server.trim());
        Self {
            host,
            port,
            user: config.user.clone(),
            key_path: config.key_path(),
            known_hosts: config.known_hosts.clone(),
            strict_host_key_checking: config.strict_host_key_checking,
            connect_timeout: config.connect_timeout,
            keepalive_interval: config.keepalive_interval,
            keepalive_max: config.keepalive_max,
        }
    }

    /// `host:port` of the server
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Split `host[:port]`, defaulting the port to 22
fn split_host_port(address: &str) -> (String, u16) {
    match address.rsplit_once(':') {
        Some((host, port)) => match port.parse() {
            Ok(port) => (host.to_string(), port),
            Err(_) => (address.to_string(), DEFAULT_SSH_PORT),
        },
        None => (address.to_string(), DEFAULT_SSH_PORT),
    }
}

/// Opens SSH sessions to one server with one identity
pub struct SshTransport {
    settings: SshSettings,
    address: String,
    key: Arc<KeyPair>,
    ssh_config: Arc<Config>,
}

impl SshTransport {
    /// Load the private key and prepare the client configuration
    pub fn new(settings: SshSettings) -> Result<Self, SetupError> {
        let path = settings.key_path.display().to_string();
        if !settings.key_path.exists() {
            return Err(SetupError::KeyNotFound { path });
        }

        let key = russh_keys::load_secret_key(&settings.key_path, None).map_err(|e| {
            SetupError::KeyUnreadable {
                path,
                message: e.to_string(),
            }
        })?;

        let keepalive_interval =
            (!settings.keepalive_interval.is_zero()).then_some(settings.keepalive_interval);
        let ssh_config = Config {
            keepalive_interval,
            keepalive_max: settings.keepalive_max,
            preferred: Preferred {
                key: Cow::Borrowed(HOST_KEY_ALGORITHMS),
                ..Preferred::default()
            },
            ..Default::default()
        };

        Ok(Self {
            address: settings.address(),
            settings,
            key: Arc::new(key),
            ssh_config: Arc::new(ssh_config),
        })
    }

    /// Connect and authenticate once, without a timeout
    async fn establish(&self) -> Result<SshConnection, TransportError> {
        let terminated = CancellationToken::new();
        let routes: ForwardRoutes = Arc::new(DashMap::new());
        let verdict: HostKeyVerdict = Arc::new(Mutex::new(None));

        let handler = ClientHandler::new(
            HostKeyPolicy {
                host: self.settings.host.clone(),
                port: self.settings.port,
                known_hosts: self.settings.known_hosts.clone(),
                strict: self.settings.strict_host_key_checking,
            },
            Arc::clone(&verdict),
            Arc::clone(&routes),
            terminated.clone().drop_guard(),
        );

        tracing::debug!("Connecting to {}", self.address);
        let mut session = client::connect(
            Arc::clone(&self.ssh_config),
            (self.settings.host.as_str(), self.settings.port),
            handler,
        )
        .await
        .map_err(|e| {
            let rejected = verdict.lock().ok().and_then(|mut v| v.take());
            match rejected {
                Some(reason) => TransportError::HostKeyRejected(reason),
                None => TransportError::Protocol(format!(
                    "Failed to connect to {}: {}",
                    self.address, e
                )),
            }
        })?;

        tracing::debug!("Authenticating as user '{}'", self.settings.user);
        let authenticated = session
            .authenticate_publickey(&self.settings.user, Arc::clone(&self.key))
            .await
            .map_err(|e| TransportError::Protocol(format!("Authentication error: {}", e)))?;

        if !authenticated {
            return Err(TransportError::AuthRejected(self.settings.user.clone()));
        }

        Ok(SshConnection {
            shared: Arc::new(SessionShared {
                handle: RwLock::new(session),
                routes,
                terminated,
            }),
        })
    }
}

#[async_trait]
impl SecureTransport for SshTransport {
    type Conn = SshConnection;

    async fn connect(&self) -> Result<SshConnection, TransportError> {
        let timeout = self.settings.connect_timeout;
        tokio::time::timeout(timeout, self.establish())
            .await
            .map_err(|_| TransportError::Timeout(timeout))?
    }

    fn address(&self) -> &str {
        &self.address
    }
}

/// State shared by the connection and the listeners it created
pub(crate) struct SessionShared {
    /// `tcpip_forward` needs exclusive access; dials only read
    pub handle: RwLock<Handle<ClientHandler>>,
    pub routes: ForwardRoutes,
    /// Cancelled once russh drops the handler, i.e. when the session ends
    pub terminated: CancellationToken,
}

impl SessionShared {
    /// Map a russh failure, preferring "session closed" once the session is gone
    pub fn map_error(&self, what: &str, err: russh::Error) -> TransportError {
        map_request_error(what, err, self.terminated.is_cancelled())
    }
}

/// A refused request is a rejection; anything else on a live session is a
/// protocol failure
fn map_request_error(what: &str, err: russh::Error, session_ended: bool) -> TransportError {
    if session_ended {
        return TransportError::SessionClosed;
    }
    match err {
        russh::Error::RequestDenied => TransportError::Rejected(what.to_string()),
        err => TransportError::Protocol(format!("{}: {}", what, err)),
    }
}

/// A live SSH session
pub struct SshConnection {
    shared: Arc<SessionShared>,
}

#[async_trait]
impl Network for SshConnection {
    async fn dial(&self, address: &Endpoint) -> Result<BoxedStream, TransportError> {
        if self.shared.terminated.is_cancelled() {
            return Err(TransportError::SessionClosed);
        }

        let handle = self.shared.handle.read().await;
        let port = u32::from(address.port);
        let channel = handle
            .channel_open_direct_tcpip(address.host.clone(), port, "127.0.0.1", 0)
            .await
            .map_err(|e| self.shared.map_error("direct-tcpip", e))?;
        Ok(Box::new(bridge(channel)))
    }

    async fn listen(&self, address: &Endpoint) -> Result<BoxedListener, TransportError> {
        if self.shared.terminated.is_cancelled() {
            return Err(TransportError::SessionClosed);
        }

        let port = u32::from(address.port);
        let (tx, rx) = mpsc::channel(FORWARD_BACKLOG);
        // Registered before the request so early connections are not lost
        self.shared.routes.insert(port, tx);

        let result = {
            let mut handle = self.shared.handle.write().await;
            handle.tcpip_forward(address.host.clone(), port).await
        };

        if let Err(e) = result {
            self.shared.routes.remove(&port);
            return Err(self.shared.map_error("tcpip-forward", e));
        }

        Ok(Box::new(ForwardedListener::new(
            Arc::clone(&self.shared),
            address.clone(),
            rx,
        )))
    }
}

#[async_trait]
impl SecureConnection for SshConnection {
    async fn wait_for_termination(&self) -> Result<(), TransportError> {
        self.shared.terminated.cancelled().await;
        Ok(())
    }

    async fn close(&self) {
        if self.shared.terminated.is_cancelled() {
            return;
        }
        let handle = self.shared.handle.read().await;
        if let Err(e) = handle
            .disconnect(Disconnect::ByApplication, "closing", "en")
            .await
        {
            tracing::debug!("Disconnect failed: {}", e);
        }
    }
}
