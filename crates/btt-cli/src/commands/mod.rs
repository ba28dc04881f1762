//! CLI subcommand implementations.

pub mod build;
pub mod fetch;
pub mod parse;
pub mod report;
