//! In-memory secure transport for integration tests
//!
//! The "remote" side of the session is a [`MemoryNetwork`]: targets of Local
//! tunnels listen on it, and outside clients of Remote tunnels dial it.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{duplex, DuplexStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use tk_core::traits::{
    BoxedListener, BoxedStream, Listener, Network, SecureConnection, SecureTransport,
};
use tk_core::{Endpoint, TransportError};

static PORT_COUNTER: AtomicU16 = AtomicU16::new(0);

/// Get a unique local port for this test
pub fn test_port() -> u16 {
    41000 + PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
}

/// Address -> accept queue, in memory
#[derive(Default)]
pub struct MemoryNetwork {
    listeners: Mutex<HashMap<String, (u64, mpsc::Sender<DuplexStream>)>>,
    next_id: AtomicU64,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn is_listening(&self, address: &str) -> bool {
        self.listeners.lock().unwrap().contains_key(address)
    }

    /// Connect to `address`, returning our end of the stream
    pub async fn connect(&self, address: &str) -> Result<DuplexStream, TransportError> {
        let sender = self
            .listeners
            .lock()
            .unwrap()
            .get(address)
            .map(|(_, tx)| tx.clone())
            .ok_or_else(|| TransportError::Rejected(format!("nothing listening on {}", address)))?;

        let (ours, theirs) = duplex(64 * 1024);
        sender
            .send(theirs)
            .await
            .map_err(|_| TransportError::Rejected(format!("{} stopped listening", address)))?;
        Ok(ours)
    }

    /// Listen on `address` directly, as a test server
    pub fn bind(self: &Arc<Self>, address: &str) -> MemoryListener {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(16);
        self.listeners
            .lock()
            .unwrap()
            .insert(address.to_string(), (id, tx));
        MemoryListener {
            network: Arc::clone(self),
            address: address.to_string(),
            id,
            rx,
            ended: None,
        }
    }

    fn unbind(&self, address: &str, id: u64) {
        let mut listeners = self.listeners.lock().unwrap();
        if listeners.get(address).map(|(owner, _)| *owner) == Some(id) {
            listeners.remove(address);
        }
    }
}

pub struct MemoryListener {
    network: Arc<MemoryNetwork>,
    address: String,
    id: u64,
    rx: mpsc::Receiver<DuplexStream>,
    ended: Option<CancellationToken>,
}

impl MemoryListener {
    /// Accept the next stream (test server side)
    pub async fn next(&mut self) -> DuplexStream {
        self.rx.recv().await.unwrap()
    }
}

impl Drop for MemoryListener {
    fn drop(&mut self) {
        self.network.unbind(&self.address, self.id);
    }
}

#[async_trait]
impl Listener for MemoryListener {
    async fn accept(&mut self) -> Result<(BoxedStream, String), TransportError> {
        let ended = self.ended.clone().unwrap_or_else(CancellationToken::new);
        tokio::select! {
            stream = self.rx.recv() => match stream {
                Some(stream) => {
                    let stream: BoxedStream = Box::new(stream);
                    Ok((stream, "remote-client".to_string()))
                }
                None => Err(TransportError::SessionClosed),
            },
            _ = ended.cancelled() => Err(TransportError::SessionClosed),
        }
    }

    fn local_addr(&self) -> String {
        format!("memory {}", self.address)
    }

    async fn close(&mut self) {
        self.rx.close();
        self.network.unbind(&self.address, self.id);
    }
}

/// One in-memory session; ends when the test kills it or it is closed
pub struct MemorySession {
    remote: Arc<MemoryNetwork>,
    ended: CancellationToken,
    closed: Arc<AtomicUsize>,
}

impl MemorySession {
    fn check(&self) -> Result<(), TransportError> {
        if self.ended.is_cancelled() {
            return Err(TransportError::SessionClosed);
        }
        Ok(())
    }
}

#[async_trait]
impl Network for MemorySession {
    async fn dial(&self, address: &Endpoint) -> Result<BoxedStream, TransportError> {
        self.check()?;
        let stream = self.remote.connect(&address.to_string()).await?;
        Ok(Box::new(stream))
    }

    async fn listen(&self, address: &Endpoint) -> Result<BoxedListener, TransportError> {
        self.check()?;
        let mut listener = self.remote.bind(&address.to_string());
        listener.ended = Some(self.ended.clone());
        Ok(Box::new(listener))
    }
}

#[async_trait]
impl SecureConnection for MemorySession {
    async fn wait_for_termination(&self) -> Result<(), TransportError> {
        self.ended.cancelled().await;
        Err(TransportError::Protocol("connection reset by peer".into()))
    }

    async fn close(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
        self.ended.cancel();
    }
}

/// Hands out [`MemorySession`]s over a shared remote network
pub struct MemoryTransport {
    remote: Arc<MemoryNetwork>,
    sessions: Arc<Mutex<Vec<CancellationToken>>>,
    closed: Arc<AtomicUsize>,
}

/// Test-side view of a [`MemoryTransport`]
#[derive(Clone)]
pub struct TransportStats {
    sessions: Arc<Mutex<Vec<CancellationToken>>>,
    closed: Arc<AtomicUsize>,
}

impl MemoryTransport {
    pub fn new(remote: Arc<MemoryNetwork>) -> (Self, TransportStats) {
        let sessions = Arc::new(Mutex::new(Vec::new()));
        let closed = Arc::new(AtomicUsize::new(0));
        let stats = TransportStats {
            sessions: Arc::clone(&sessions),
            closed: Arc::clone(&closed),
        };
        (
            Self {
                remote,
                sessions,
                closed,
            },
            stats,
        )
    }
}

#[async_trait]
impl SecureTransport for MemoryTransport {
    type Conn = MemorySession;

    async fn connect(&self) -> Result<MemorySession, TransportError> {
        let ended = CancellationToken::new();
        self.sessions.lock().unwrap().push(ended.clone());
        Ok(MemorySession {
            remote: Arc::clone(&self.remote),
            ended,
            closed: Arc::clone(&self.closed),
        })
    }

    fn address(&self) -> &str {
        "memory:22"
    }
}

impl TransportStats {
    pub fn connects(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn closes(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    /// Drop the current session as if the network went away
    pub fn kill_current(&self) {
        if let Some(session) = self.sessions.lock().unwrap().last() {
            session.cancel();
        }
    }

    /// Wait until at least `n` sessions were opened
    pub async fn wait_for_connects(&self, n: usize) {
        eventually(|| self.connects() >= n).await;
    }
}

/// Poll `condition` until it holds, failing the test after five seconds
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "condition not reached in time");
}
