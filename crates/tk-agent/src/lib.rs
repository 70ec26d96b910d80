//! tk-agent: keeps SSH port forwards alive
//!
//! The agent holds one SSH session to a remote server and runs every
//! configured tunnel over it. When the session drops, all tunnels are torn
//! down together and rebuilt on a fresh session.

pub mod net;
pub mod orchestrator;
pub mod ssh;
pub mod tunnel;

pub use net::LocalNetwork;
pub use orchestrator::Orchestrator;
