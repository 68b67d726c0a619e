//! Testing utilities for the MySQL records source
//!
//! Docker container management for integration tests that need a live server.

pub mod container;

pub use container::MySQLContainer;
