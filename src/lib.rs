//! Store gateway library
//!
//! Exposes modules for integration testing and the developer binaries.

pub mod domain;
pub mod infra;
pub mod io;
pub mod services;
