//! Provis Core - Directory Provisioning Engine
//!
//! This crate provides the identity and policy engine of the Provis
//! groupware server: entity resolution and caching over a directory store,
//! transitive group membership, multi-step rename workflows,
//! authentication with password policy enforcement, and federated address
//! book search.

pub mod cache;
pub mod config;
pub mod crypto;
pub mod directory;
pub mod domain;
pub mod error;
pub mod service;
pub mod telemetry;

// Re-export commonly used types
pub use config::Config;
pub use error::{AppError, Result};
pub use service::Provisioning;
