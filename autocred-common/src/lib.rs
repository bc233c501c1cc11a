//! # AutoCred Common Library
//!
//! Shared code for AutoCred CRM services:
//! - Error types
//! - Configuration loading (TOML file + environment overrides)

pub mod config;
pub mod error;

pub use error::{Error, Result};
