//! CLI module for termshare
//!
//! Command-line interface using clap derive macros.

pub mod args;
pub mod commands;
pub mod exit_code;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use args::{ServeArgs, SessionCurrentArgs, SessionInfoArgs, SessionListArgs};

/// Share a terminal session over SSH
#[derive(Parser, Debug)]
#[command(name = "termshare")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Configuration file path
    #[arg(long, global = true, env = "TERMSHARE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(long, global = true, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Suppress non-essential output
    #[arg(long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the rendezvous server
    Serve(ServeArgs),

    /// Display sessions
    #[command(subcommand, visible_alias = "se")]
    Session(SessionCommand),
}

/// Session inspection commands
#[derive(Subcommand, Debug)]
pub enum SessionCommand {
    /// List shared sessions
    #[command(visible_aliases = ["ls", "l"])]
    List(SessionListArgs),

    /// Display a session by name
    #[command(visible_alias = "i")]
    Info(SessionInfoArgs),

    /// Display the current session
    #[command(visible_alias = "c")]
    Current(SessionCurrentArgs),
}
