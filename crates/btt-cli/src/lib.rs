//! Build time trend CLI library.
//!
//! This crate provides the CLI interface for parsing Travis CI job logs.

mod cli;
pub mod commands;
mod config;

pub use cli::{Cli, Commands};
pub use config::Config;
