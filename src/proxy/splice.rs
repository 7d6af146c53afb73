//! Channel splicing between the two SSH legs
//!
//! Once both handshakes are up, every downstream channel gets a paired
//! upstream channel and a bridge task. Downstream channel requests and
//! data arrive through the server handler and are relayed as commands;
//! upstream traffic is pumped back through the server-side handle. The
//! bridge owns the upstream channel, so either side closing tears the
//! pair down and ends the task.

use russh::server::Handle as ServerHandle;
use russh::{Channel, ChannelId, ChannelMsg, CryptoVec, Pty, client, server};
use tokio::io::copy_bidirectional;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Downstream activity relayed to the upstream channel.
pub enum UpstreamCmd {
    Data(Vec<u8>),
    ExtendedData(u32, Vec<u8>),
    Pty {
        term: String,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        modes: Vec<(Pty, u32)>,
    },
    Shell,
    Exec(Vec<u8>),
    Env(String, String),
    Subsystem(String),
    WindowChange {
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
    },
    Eof,
    Close,
}

/// Handle the server-side connection handler uses to feed one bridge.
pub struct SessionBridge {
    tx: mpsc::UnboundedSender<UpstreamCmd>,
}

impl SessionBridge {
    /// Relay a command. Errors mean the bridge already tore down, which
    /// the downstream will observe as a channel close.
    pub fn send(&self, cmd: UpstreamCmd) {
        let _ = self.tx.send(cmd);
    }
}

/// Bridge one downstream `session` channel to one upstream channel.
///
/// Byte order is preserved per direction; exit status, EOF and close are
/// relayed so the downstream sees the upstream shell end exactly as a
/// direct connection would.
pub fn spawn_session_bridge(
    upstream: Channel<client::Msg>,
    downstream: ServerHandle,
    downstream_id: ChannelId,
) -> SessionBridge {
    let (tx, mut rx) = mpsc::unbounded_channel::<UpstreamCmd>();

    tokio::spawn(async move {
        let mut upstream = upstream;
        loop {
            tokio::select! {
                msg = upstream.wait() => {
                    match msg {
                        Some(ChannelMsg::Data { data }) => {
                            if downstream
                                .data(downstream_id, CryptoVec::from(data.to_vec()))
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                        Some(ChannelMsg::ExtendedData { data, ext }) => {
                            if downstream
                                .extended_data(downstream_id, ext, CryptoVec::from(data.to_vec()))
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                        Some(ChannelMsg::ExitStatus { exit_status }) => {
                            let _ = downstream
                                .exit_status_request(downstream_id, exit_status)
                                .await;
                        }
                        Some(ChannelMsg::Eof) => {
                            let _ = downstream.eof(downstream_id).await;
                        }
                        Some(ChannelMsg::Close) | None => {
                            let _ = downstream.close(downstream_id).await;
                            break;
                        }
                        // Replies to forwarded requests and window
                        // accounting stay local to each leg.
                        Some(_) => {}
                    }
                }
                cmd = rx.recv() => {
                    let Some(cmd) = cmd else {
                        // Downstream side went away.
                        let _ = upstream.close().await;
                        break;
                    };
                    if relay_cmd(&upstream, cmd).await.is_err() {
                        let _ = downstream.close(downstream_id).await;
                        break;
                    }
                }
            }
        }
        trace!(channel = ?downstream_id, "session bridge finished");
    });

    SessionBridge { tx }
}

async fn relay_cmd(
    upstream: &Channel<client::Msg>,
    cmd: UpstreamCmd,
) -> Result<(), russh::Error> {
    match cmd {
        UpstreamCmd::Data(data) => upstream.data(&data[..]).await.map_err(Into::into),
        UpstreamCmd::ExtendedData(ext, data) => upstream
            .extended_data(ext, &data[..])
            .await
            .map_err(Into::into),
        UpstreamCmd::Pty {
            term,
            col_width,
            row_height,
            pix_width,
            pix_height,
            modes,
        } => {
            upstream
                .request_pty(
                    true, &term, col_width, row_height, pix_width, pix_height, &modes,
                )
                .await
        }
        UpstreamCmd::Shell => upstream.request_shell(true).await,
        UpstreamCmd::Exec(command) => upstream.exec(true, &command[..]).await,
        UpstreamCmd::Env(name, value) => upstream.set_env(true, &name[..], &value[..]).await,
        UpstreamCmd::Subsystem(name) => upstream.request_subsystem(true, &name[..]).await,
        UpstreamCmd::WindowChange {
            col_width,
            row_height,
            pix_width,
            pix_height,
        } => {
            upstream
                .window_change(col_width, row_height, pix_width, pix_height)
                .await
        }
        UpstreamCmd::Eof => upstream.eof().await,
        UpstreamCmd::Close => {
            upstream.close().await?;
            Err(russh::Error::Disconnect)
        }
    }
}

/// Splice a downstream channel and an upstream channel as raw byte
/// streams. Used for `direct-tcpip` (downstream-opened) and
/// `forwarded-tcpip` (upstream-opened) channels, which carry no further
/// requests once open.
pub fn spawn_stream_splice(
    down: Channel<server::Msg>,
    up: Channel<client::Msg>,
    label: &'static str,
) {
    tokio::spawn(async move {
        let mut down = down.into_stream();
        let mut up = up.into_stream();
        match copy_bidirectional(&mut down, &mut up).await {
            Ok((to_up, to_down)) => {
                trace!(label, to_up, to_down, "stream splice finished");
            }
            Err(e) => {
                debug!(label, error = %e, "stream splice ended with error");
            }
        }
    });
}
