//! FlashKV Common - Shared types and utilities
//!
//! This crate provides the error type, checksum helpers, configuration and
//! identifier types shared by the FlashKV storage engine and its tools.

pub mod checksum;
pub mod config;
pub mod error;
pub mod types;

pub use checksum::{block_checksum, seal_block, verify_block_checksum};
pub use config::EngineConfig;
pub use error::{Error, Result};
pub use types::*;
