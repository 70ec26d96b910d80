//! Tunnel core: connection supervision, listener retry, workers and relays

mod listener;
mod reconnect;
mod relay;
mod supervisor;
mod worker;

pub use listener::ListenerSupervisor;
pub use reconnect::ExponentialBackoff;
pub use relay::{RelayEnd, RelaySession};
pub use supervisor::{watch_connection, ConnectionSupervisor};
pub use worker::{TunnelWorker, WorkerExit};
