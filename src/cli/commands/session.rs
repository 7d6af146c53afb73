//! Session commands - list and display shared sessions
//!
//! Sessions are discovered by scanning the base directory for admin
//! sockets; each one is queried for its descriptor. The host agent owns
//! those sockets, so unreadable ones simply drop out of the listing.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

use crate::admin::{ADMIN_SOCKET_ENV_VAR, AdminClient, SessionPayload, admin_socket_file};
use crate::cli::args::{SessionCurrentArgs, SessionInfoArgs, SessionListArgs};
use crate::identifier::encode_identifier_session;
use crate::utils::path::expand_to_pathbuf;

/// Execute `session list`
pub async fn list(args: SessionListArgs) -> Result<()> {
    let base_dir = expand_to_pathbuf(&args.base_dir)?;
    let sessions = list_sessions(&base_dir).await?;

    if sessions.is_empty() {
        println!("No session is found. Create one with `termshare host`.");
        return Ok(());
    }

    let rows: Vec<[String; 5]> = sessions
        .into_iter()
        .map(|(current, session)| {
            [
                if current { "*".to_string() } else { String::new() },
                session.session_id,
                session.command.join(" "),
                na_if_empty(session.force_command.join(" ")),
                session.host,
            ]
        })
        .collect();
    render_table(
        &["CURRENT", "SESSION", "COMMAND", "FORCE COMMAND", "HOST"],
        &rows,
    );
    Ok(())
}

/// Execute `session info`
pub async fn info(args: SessionInfoArgs) -> Result<()> {
    let base_dir = expand_to_pathbuf(&args.base_dir)?;
    display_session(&admin_socket_file(&base_dir, &args.name)).await
}

/// Execute `session current`
pub async fn current(args: SessionCurrentArgs) -> Result<()> {
    let socket = match args.admin_socket {
        Some(path) if !path.as_os_str().is_empty() => path,
        _ => bail!(
            "required flag \"admin-socket\" not set and {} is empty",
            ADMIN_SOCKET_ENV_VAR
        ),
    };
    display_session(&socket).await
}

/// Scan `base_dir` for session directories and fetch each descriptor,
/// marking the one the current host process shares.
async fn list_sessions(base_dir: &Path) -> Result<Vec<(bool, SessionPayload)>> {
    let mut result = Vec::new();

    let entries = match std::fs::read_dir(base_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(result),
        Err(e) => {
            return Err(e).with_context(|| format!("failed to read {}", base_dir.display()));
        }
    };

    let current_socket = current_admin_socket();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        let socket = admin_socket_file(base_dir, &name);
        let Ok(session) = AdminClient::new(&socket).get_session().await else {
            continue;
        };
        let current = current_socket.as_deref() == Some(socket.as_path());
        result.push((current, session));
    }

    Ok(result)
}

async fn display_session(socket: &Path) -> Result<()> {
    let session = AdminClient::new(socket).get_session().await?;
    let user = encode_identifier_session(&session)?;

    let (host, port) = session
        .host
        .rsplit_once(':')
        .with_context(|| format!("malformed session host {:?}", session.host))?;

    let mut ssh_cmd = format!("ssh {}@{}", user, host);
    if port != "22" {
        ssh_cmd = format!("{} -p {}", ssh_cmd, port);
    }

    println!("=== {}", session.session_id);
    let rows = [
        ["Command:".to_string(), session.command.join(" ")],
        [
            "Force Command:".to_string(),
            na_if_empty(session.force_command.join(" ")),
        ],
        ["Host:".to_string(), session.host.clone()],
        ["SSH Session:".to_string(), ssh_cmd],
    ];
    render_table::<2>(&[], &rows);

    Ok(())
}

fn current_admin_socket() -> Option<PathBuf> {
    std::env::var_os(ADMIN_SOCKET_ENV_VAR)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

fn na_if_empty(s: String) -> String {
    if s.is_empty() { "n/a".to_string() } else { s }
}

/// Space-padded column rendering; headers are optional.
fn render_table<const N: usize>(headers: &[&str], rows: &[[String; N]]) {
    let mut widths = [0usize; N];
    for (i, header) in headers.iter().enumerate() {
        widths[i] = header.len();
    }
    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            widths[i] = widths[i].max(cell.len());
        }
    }

    let print_row = |cells: &[String]| {
        let line = cells
            .iter()
            .enumerate()
            .map(|(i, cell)| format!("{:<width$}", cell, width = widths[i]))
            .collect::<Vec<_>>()
            .join("  ");
        println!("{}", line.trim_end());
    };

    if !headers.is_empty() {
        print_row(&headers.iter().map(|h| h.to_string()).collect::<Vec<_>>());
    }
    for row in rows {
        print_row(row);
    }
}
