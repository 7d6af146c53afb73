//! Per-connection authentication bridging policy
//!
//! The server terminates two SSH handshakes per connection and cannot
//! simply replay credentials between them: it holds no client private
//! key, so a public-key challenge can never be re-signed upstream.
//! Instead each downstream auth attempt is mapped through a verdict.
//!
//! For host upstreams, public-key auth is demoted to password auth
//! carrying the key's authorized-keys line; the host agent authorizes by
//! string match. This contract is load-bearing: changing the password
//! form breaks every deployed host agent.

use russh::keys::ssh_key;

use crate::error::{Error, Result};

/// What to do upstream with a downstream auth attempt.
pub enum AuthVerdict {
    /// Attempt `none` auth upstream.
    None,
    /// Forward the same credential bytes unchanged.
    PassThrough,
    /// Replace with a synthesized credential.
    Map(MappedAuth),
    /// Do not attempt this method upstream; the downstream may try the
    /// next method.
    Discard,
}

/// Synthesized upstream credential for [`AuthVerdict::Map`].
pub enum MappedAuth {
    Password(String),
}

type NoneCallback = Box<dyn Fn() -> AuthVerdict + Send + Sync>;
type PasswordCallback = Box<dyn Fn(&str) -> AuthVerdict + Send + Sync>;
type PublicKeyCallback = Box<dyn Fn(&ssh_key::PublicKey) -> Result<AuthVerdict> + Send + Sync>;
type HostKeyCallback = Box<dyn Fn(&ssh_key::PublicKey) -> bool + Send + Sync>;

/// Policy object installed on one downstream connection, answering for
/// each auth method whether to forward, rewrite, discard, or accept it
/// against the upstream. Destroyed with the connection.
pub struct AuthPipe {
    user: String,
    none_auth: NoneCallback,
    password_auth: PasswordCallback,
    public_key_auth: PublicKeyCallback,
    upstream_host_key: HostKeyCallback,
}

impl AuthPipe {
    /// Variant for upstreams that are peer server nodes: passwords pass
    /// through (the peer applies its own pipe), public keys are dropped.
    pub fn upstream_node(user: impl Into<String>) -> Self {
        Self {
            // TODO: look up the client user by public key instead of
            // trusting the downstream-asserted one.
            user: user.into(),
            none_auth: Box::new(|| AuthVerdict::None),
            password_auth: Box::new(|_| AuthVerdict::PassThrough),
            public_key_auth: Box::new(|_| Ok(AuthVerdict::Discard)),
            // Hosts rotate keys freely and nothing pins them at
            // registration, so the upstream host key is accepted as-is.
            upstream_host_key: Box::new(|_| true),
        }
    }

    /// Variant for the ultimate host's own SSHD: public-key attempts are
    /// demoted to passwords carrying the authorized-keys line, so the
    /// host can still check the client's identity.
    pub fn host(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            none_auth: Box::new(|| AuthVerdict::None),
            password_auth: Box::new(|_| AuthVerdict::Discard),
            public_key_auth: Box::new(|key| {
                Ok(AuthVerdict::Map(MappedAuth::Password(authorized_key_line(
                    key,
                )?)))
            }),
            upstream_host_key: Box::new(|_| true),
        }
    }

    /// The user name forwarded upstream.
    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn none_verdict(&self) -> AuthVerdict {
        (self.none_auth)()
    }

    pub fn password_verdict(&self, password: &str) -> AuthVerdict {
        (self.password_auth)(password)
    }

    pub fn public_key_verdict(&self, key: &ssh_key::PublicKey) -> Result<AuthVerdict> {
        (self.public_key_auth)(key)
    }

    pub fn verify_upstream_host_key(&self, key: &ssh_key::PublicKey) -> bool {
        (self.upstream_host_key)(key)
    }
}

/// Canonical authorized-keys representation of a public key, trailing
/// newline included — the exact string the host agent compares against
/// its permitted client keys.
pub fn authorized_key_line(key: &ssh_key::PublicKey) -> Result<String> {
    let line = key
        .to_openssh()
        .map_err(|e| Error::Internal(format!("cannot marshal public key: {}", e)))?;
    Ok(format!("{}\n", line))
}
