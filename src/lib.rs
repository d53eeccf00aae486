//! Credential lifecycle and locking core.
//!
//! Hands out integration credentials to workflow executions one holder at a
//! time, refreshing OAuth tokens before they expire, with mutual exclusion
//! across processes through a Redis-backed keyed mutex.

// Typed errors for every component
pub mod errors;

// Credential model and persistence
pub mod credentials;

// Distributed keyed mutex
pub mod locks;

// OAuth handlers, provider table, login state
pub mod oauth;

// Credentials manager (locking + refresh protocol)
pub mod manager;

// Service configuration
pub mod config;

pub use errors::{CredentialsError, Result};
pub use manager::IntegrationCredentialsManager;
