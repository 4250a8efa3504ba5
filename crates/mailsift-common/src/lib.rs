//! mailsift Common - Shared types and utilities
//!
//! This crate provides the configuration model, error taxonomy and the
//! small value types shared by the storage, core and server crates.

pub mod config;
pub mod error;
pub mod types;

pub use config::{Config, ConfigHandle};
pub use error::{Error, Result};
pub use types::{Action, EmailAddress, SessionId};
