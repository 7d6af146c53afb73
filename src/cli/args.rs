//! Argument structures for CLI commands

use clap::Args;
use std::path::PathBuf;

use crate::admin::ADMIN_SOCKET_ENV_VAR;

/// Arguments for the `serve` command
#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Address to listen on
    #[arg(long)]
    pub listen: Option<String>,

    /// Unix socket of the local in-process SSHD
    #[arg(long)]
    pub sshd_socket: Option<PathBuf>,

    /// Directory holding per-session tunnel sockets
    #[arg(long)]
    pub sessions_dir: Option<PathBuf>,

    /// Host key file (repeatable). An ephemeral key is generated when
    /// none is given
    #[arg(long = "host-key", value_name = "PATH")]
    pub host_keys: Vec<PathBuf>,

    /// Route upstream legs to peer server nodes instead of host SSHDs
    #[arg(long)]
    pub upstream_node: bool,
}

/// Arguments for `session list`
#[derive(Args, Debug, Clone)]
pub struct SessionListArgs {
    /// Directory holding session admin sockets
    #[arg(long, default_value = "~/.termshare")]
    pub base_dir: String,
}

/// Arguments for `session info`
#[derive(Args, Debug, Clone)]
pub struct SessionInfoArgs {
    /// Session name
    pub name: String,

    /// Directory holding session admin sockets
    #[arg(long, default_value = "~/.termshare")]
    pub base_dir: String,
}

/// Arguments for `session current`
#[derive(Args, Debug, Clone)]
pub struct SessionCurrentArgs {
    /// Admin unix domain socket (required)
    ///
    /// Defaults to the socket of the session shared by the current host
    /// process
    #[arg(long, env = ADMIN_SOCKET_ENV_VAR)]
    pub admin_socket: Option<PathBuf>,
}
