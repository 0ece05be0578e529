//! Data layer module
//!
//! Handles all data persistence:
//! - SQLite database operations
//! - Row models shared by the federation services

mod database;
mod models;

pub use database::{Database, stale_before};
pub use models::*;
