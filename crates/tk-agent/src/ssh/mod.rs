//! SSH implementation of the secure transport

mod connector;
mod handler;
mod listener;
mod stream;

pub use connector::{SetupError, SshConnection, SshSettings, SshTransport};
