//! Bootstrap helpers for the taskpulse server
//!
//! Configuration loading and database pool setup. The binary wires the
//! realtime layer on top of these.

pub mod config;
pub mod database;

pub use config::load_config;
pub use database::init_database;
