//! tk-core: Core abstractions and configuration for tunnelkeeper
//!
//! This crate provides the tunnel description types, error taxonomy,
//! configuration structures, and the transport traits that the agent's
//! supervision loop is written against.

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use error::{ConfigError, ErrorClass, SpecError, TransportError};
pub use types::{Endpoint, TunnelDirection, TunnelRegistry, TunnelSpec};
