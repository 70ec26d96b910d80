//! Core trait definitions

mod network;
mod transport;

pub use network::{BoxedListener, BoxedStream, Listener, Network, StreamIo};
pub use transport::{SecureConnection, SecureTransport};
