//! # MCP Relay Core Library
//!
//! Domain logic and collaborator contracts for the relay gateway.
//!
//! ## Modules
//!
//! - `domain` - Core entities (ServerSpec, Configuration, DomainEvent)
//! - `configurator` - Configuration reading and file watching
//! - `credential` - Credential store contract and backends
//! - `event_bus` - Central event distribution system

pub mod configurator;
pub mod credential;
pub mod domain;
pub mod error;
pub mod event_bus;

// Re-export commonly used types
pub use configurator::{load_configuration, ConfigHandle, Configurator, FileConfigurator, StopFn};
pub use credential::{
    decode_blob, encode_blob, CredentialStore, KeyringCredentialStore, MemoryCredentialStore,
};
pub use domain::*;
pub use error::CoreError;
pub use event_bus::{EventBus, EventReceiver, EventSender};
