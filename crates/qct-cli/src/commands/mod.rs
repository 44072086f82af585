//! Subcommand implementations.

pub mod fit;
pub mod info;
