//! Connection identifier codec
//!
//! Every connection to the rendezvous server declares who it is before any
//! authentication happens: the SSH `user` field and the client's version
//! banner together carry a `{kind, session id, node address}` triple.
//!
//! The split between the two fields matters. The host agent controls its
//! own banner, so host identities put the node affinity there and keep the
//! user field short. End-user clients are plain `ssh`, whose banner cannot
//! be changed, so client identities pack everything into the user field:
//! `<session-id>` or `<session-id>:<base64url(node-addr)>` — the string
//! the admin CLI prints as `ssh <user>@<server>`.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD as B64;

use crate::error::{Error, Result};
use crate::admin::SessionPayload;

/// Version banner prefix sent by the host agent when dialing the server.
pub const HOST_CLIENT_VERSION: &str = "SSH-2.0-termshare-host-client";

/// Version banner sent by the bundled client driver. Informational only;
/// arbitrary SSH clients are accepted on the client leg.
pub const CLIENT_SSH_VERSION: &str = "SSH-2.0-termshare-client";

/// Longest accepted session id, in bytes.
const MAX_ID_LEN: usize = 64;

/// Longest accepted SSH user field, in bytes.
const MAX_USER_LEN: usize = 255;

/// Which side of a session a connection claims to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentifierKind {
    /// The host agent dialing out to register or serve its session.
    Host,
    /// An end-user client joining a session.
    Client,
}

/// Decoded connection identity: who is dialing, for which session, and
/// which server node should take the connection. A single-node deployment
/// leaves `node_addr` empty and ignores it on decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identifier {
    pub kind: IdentifierKind,
    pub id: String,
    pub node_addr: String,
}

impl Identifier {
    /// Encode into the `(user, client_version)` pair carried by the SSH
    /// handshake. Deterministic and printable-ASCII.
    pub fn encode(&self) -> Result<(String, String)> {
        validate_id(&self.id)?;

        match self.kind {
            IdentifierKind::Host => {
                let version = if self.node_addr.is_empty() {
                    HOST_CLIENT_VERSION.to_string()
                } else {
                    format!("{}/{}", HOST_CLIENT_VERSION, B64.encode(&self.node_addr))
                };
                Ok((self.id.clone(), version))
            }
            IdentifierKind::Client => {
                let user = if self.node_addr.is_empty() {
                    self.id.clone()
                } else {
                    format!("{}:{}", self.id, B64.encode(&self.node_addr))
                };
                if user.len() > MAX_USER_LEN {
                    return Err(Error::BadIdentifier(format!(
                        "encoded user field exceeds {} bytes",
                        MAX_USER_LEN
                    )));
                }
                Ok((user, CLIENT_SSH_VERSION.to_string()))
            }
        }
    }

    /// Decode the identity from the SSH user field and the client's
    /// version banner. Fails closed: anything that does not parse exactly
    /// is a `BadIdentifier`.
    pub fn decode(user: &str, client_version: &str) -> Result<Identifier> {
        if user.is_empty() || user.len() > MAX_USER_LEN {
            return Err(Error::BadIdentifier(format!(
                "user field length {} out of range",
                user.len()
            )));
        }
        if !user.chars().all(|c| c.is_ascii_graphic()) {
            return Err(Error::BadIdentifier(
                "user field contains non-printable bytes".to_string(),
            ));
        }

        if let Some(rest) = client_version.strip_prefix(HOST_CLIENT_VERSION) {
            let node_addr = match rest.strip_prefix('/') {
                Some(encoded) => decode_node_addr(encoded)?,
                None if rest.is_empty() => String::new(),
                None => {
                    return Err(Error::BadIdentifier(format!(
                        "malformed host banner {:?}",
                        client_version
                    )));
                }
            };
            validate_id(user)?;
            return Ok(Identifier {
                kind: IdentifierKind::Host,
                id: user.to_string(),
                node_addr,
            });
        }

        // Any other banner is an ordinary SSH client joining a session.
        let (id, node_addr) = match user.rsplit_once(':') {
            Some((id, encoded)) => (id, decode_node_addr(encoded)?),
            None => (user, String::new()),
        };
        validate_id(id)?;
        Ok(Identifier {
            kind: IdentifierKind::Client,
            id: id.to_string(),
            node_addr,
        })
    }
}

/// The `user` half of the `ssh user@host` command line the admin CLI
/// prints for a session. A view over [`Identifier::encode`]; round-trips
/// with [`Identifier::decode`] under any client banner.
pub fn encode_identifier_session(session: &SessionPayload) -> Result<String> {
    let (user, _) = Identifier {
        kind: IdentifierKind::Client,
        id: session.session_id.clone(),
        node_addr: session.node_addr.clone(),
    }
    .encode()?;
    Ok(user)
}

fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() || id.len() > MAX_ID_LEN {
        return Err(Error::BadIdentifier(format!(
            "session id length {} out of range",
            id.len()
        )));
    }
    // ':' is the user-field separator and '@' would split the ssh command
    // line; both are excluded from ids.
    if !id
        .chars()
        .all(|c| c.is_ascii_graphic() && c != ':' && c != '@')
    {
        return Err(Error::BadIdentifier(format!("invalid session id {:?}", id)));
    }
    Ok(())
}

fn decode_node_addr(encoded: &str) -> Result<String> {
    let bytes = B64
        .decode(encoded)
        .map_err(|e| Error::BadIdentifier(format!("invalid node address encoding: {}", e)))?;
    String::from_utf8(bytes)
        .map_err(|_| Error::BadIdentifier("node address is not UTF-8".to_string()))
}
