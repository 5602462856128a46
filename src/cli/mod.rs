//! CLI module for the berth deployment tool.
//!
//! This module provides the command-line interface: argument parsing and
//! output formatting. The binary wires them to the library.

mod commands;
mod output;

pub use commands::{
    Cli, Commands, CredentialCommands, LogFormat, OutputFormat, RemoteCommands, RunArgs,
};
pub use output::OutputFormatter;
