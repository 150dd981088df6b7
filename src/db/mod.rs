//! SQLite persistence for settlement and order lifecycle data.
//!
//! This module provides:
//! - Database initialization, pragmas and schema
//! - The repository implementing the tracker store traits and settlement queries

pub mod migrations;
pub mod repo;

pub use migrations::init_db;
pub use repo::{Repository, StatusCounts};
