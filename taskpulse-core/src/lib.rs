//! Shared foundation for the taskpulse realtime server
//!
//! Identifiers, configuration, logging, the error type, data-layer traits
//! with their Postgres and in-memory implementations, and token verification.

pub mod auth;
pub mod bootstrap;
pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod repository;

pub use auth::{IdentityVerifier, JwtVerifier};
pub use config::Config;
pub use error::{Error, Result};
