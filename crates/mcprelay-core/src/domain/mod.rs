//! Core domain entities

pub mod config;
pub mod event;
pub mod server;

pub use config::{Configuration, GlobalOptions, SecretMap, SharedConfiguration, ToolNamePolicy};
pub use event::DomainEvent;
pub use server::{CapabilityKind, CapabilitySet, SecretRef, ServerRuntime, ServerSpec};
