//! Data layer module
//!
//! Handles all data persistence:
//! - Local and cached remote actors, with their public keys
//! - Follow relations and blocks
//! - Notes and mentions

mod database;
mod models;

pub use database::Database;
pub use models::*;

#[cfg(test)]
mod database_test;
