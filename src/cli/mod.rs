//! CLI module for wavecrowd - command-line interface and subcommands.
//!
//! Every subcommand is one short-lived pass over the state store.

pub mod commands;

pub use commands::Cli;
