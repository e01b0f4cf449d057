//! Server fingerprint trust store and trust decisions
//!
//! Fingerprints live in the trust file keyed by server `ip:port` and a role
//! sentinel standing in for the user name. A NORMAL entry is the accepted key;
//! a REPLACEMENT entry pre-approves the key the server will rotate to.

use std::fmt;

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::auth_file::AuthStore;
use super::error::{StoreResult, TrustError, TrustKind, TrustResult};

/// Which trust slot a fingerprint occupies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FingerprintRole {
    /// The accepted key
    Normal,
    /// A pre-approved future key
    Replacement,
}

impl FingerprintRole {
    /// User-name sentinel used in the trust file
    pub fn sentinel(self) -> &'static str {
        match self {
            FingerprintRole::Normal => "**++**",
            FingerprintRole::Replacement => "++++++",
        }
    }

    fn from_sentinel(user: &str) -> Option<Self> {
        match user {
            "**++**" => Some(FingerprintRole::Normal),
            "++++++" => Some(FingerprintRole::Replacement),
            _ => None,
        }
    }
}

/// A stored fingerprint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    /// Server `ip:port`
    pub server_ip_port: String,
    /// Slot
    pub role: FingerprintRole,
    /// Colon-separated hex digest
    pub value: String,
}

/// Whether `value` is a non-empty sequence of colon-separated hex byte pairs.
pub fn is_valid_fingerprint(value: &str) -> bool {
    !value.is_empty()
        && value
            .split(':')
            .all(|pair| pair.len() == 2 && pair.bytes().all(|b| b.is_ascii_hexdigit()))
}

/// Fingerprint of a DER-encoded certificate: SHA-256 as `AB:CD:...`.
///
/// This hashes the whole certificate, not its public key, so it never equals
/// the SHA-1 public-key fingerprints the `p4` command-line client writes to
/// `P4TRUST`. A server trusted only through `p4 trust` reports a changed key
/// here and has to be trusted again through this client.
pub fn fingerprint_from_der(der: &[u8]) -> String {
    Sha256::digest(der)
        .iter()
        .map(|byte| hex::encode_upper([*byte]))
        .collect::<Vec<_>>()
        .join(":")
}

/// Options for an explicit trust request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrustOptions {
    /// Accept a new connection without asking
    pub auto_accept: bool,
    /// Refuse anything not already trusted
    pub auto_refuse: bool,
    /// Allow replacing a mismatched key
    pub force: bool,
    /// Operate on the REPLACEMENT slot
    pub replacement: bool,
}

/// Outcome of the per-connection trust check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustDecision {
    /// The observed key is the accepted one
    Trusted,
    /// The observed key matched the replacement and has been promoted
    Rotated,
    /// The observed key was installed under the auto-accept policy
    Installed(TrustKind),
    /// A caller decision is required
    NeedsDecision {
        /// Classification
        kind: TrustKind,
        /// Fingerprint observed on the wire
        fingerprint: String,
    },
}

impl TrustDecision {
    /// Whether the connection may proceed
    pub fn is_trusted(&self) -> bool {
        !matches!(self, TrustDecision::NeedsDecision { .. })
    }
}

/// Outcome of an explicit trust request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustOutcome {
    /// Nothing changed; the key was already trusted
    AlreadyEstablished,
    /// The replacement key was promoted
    Rotated,
    /// The fingerprint was installed
    Added {
        /// Warning that preceded the install, if any
        warning: Option<TrustKind>,
        /// Server `ip:port`
        server: String,
    },
    /// Auto-refuse was requested and the key is not trusted
    Refused {
        /// Why the key is not trusted
        kind: TrustKind,
        /// Server `ip:port`
        server: String,
        /// Fingerprint observed on the wire
        fingerprint: String,
    },
}

impl fmt::Display for TrustOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrustOutcome::AlreadyEstablished | TrustOutcome::Rotated => {
                f.write_str("Trust already established.")
            }
            TrustOutcome::Added { warning, server } => {
                if let Some(kind) = warning {
                    write!(f, "{kind}: ")?;
                }
                write!(f, "Added trust for P4PORT '{server}'")
            }
            TrustOutcome::Refused {
                kind,
                server,
                fingerprint,
            } => write!(
                f,
                "{kind}: the authenticity of '{server}' can't be established, fingerprint {fingerprint}"
            ),
        }
    }
}

/// Fingerprint store over a trust file or memory.
#[derive(Debug)]
pub struct TrustStore {
    store: AuthStore,
}

impl TrustStore {
    /// Wrap a credential store
    pub fn new(store: AuthStore) -> Self {
        Self { store }
    }

    /// Underlying credential store
    pub fn store(&self) -> &AuthStore {
        &self.store
    }

    /// Stored fingerprint for (`server_ip_port`, `role`)
    pub fn get_fingerprint(
        &self,
        server_ip_port: &str,
        role: FingerprintRole,
    ) -> StoreResult<Option<Fingerprint>> {
        Ok(self
            .store
            .entry(role.sentinel(), server_ip_port)?
            .map(|entry| Fingerprint {
                server_ip_port: entry.server_address,
                role,
                value: entry.value,
            }))
    }

    /// Whether a fingerprint is stored for (`server_ip_port`, `role`)
    pub fn fingerprint_exists(&self, server_ip_port: &str, role: FingerprintRole) -> StoreResult<bool> {
        Ok(self.get_fingerprint(server_ip_port, role)?.is_some())
    }

    /// Whether the stored fingerprint equals `candidate` (hex case ignored)
    pub fn fingerprint_matches(
        &self,
        server_ip_port: &str,
        role: FingerprintRole,
        candidate: &str,
    ) -> StoreResult<bool> {
        Ok(self
            .get_fingerprint(server_ip_port, role)?
            .is_some_and(|fp| fp.value.eq_ignore_ascii_case(candidate)))
    }

    /// Insert or overwrite a fingerprint
    pub fn install_fingerprint(
        &self,
        server_ip_port: &str,
        role: FingerprintRole,
        value: &str,
    ) -> TrustResult<()> {
        if !is_valid_fingerprint(value) {
            return Err(TrustError::MalformedFingerprint(value.to_string()));
        }
        self.store.save(role.sentinel(), server_ip_port, Some(value))?;
        info!(server = server_ip_port, ?role, "fingerprint installed");
        Ok(())
    }

    /// Delete a fingerprint; absent entries are not an error
    pub fn remove_fingerprint(&self, server_ip_port: &str, role: FingerprintRole) -> StoreResult<()> {
        self.store.save(role.sentinel(), server_ip_port, None)
    }

    /// All fingerprints, optionally restricted to one role
    pub fn list_fingerprints(&self, role: Option<FingerprintRole>) -> StoreResult<Vec<Fingerprint>> {
        Ok(self
            .store
            .entries()?
            .into_iter()
            .filter_map(|entry| {
                let entry_role = FingerprintRole::from_sentinel(&entry.user_name)?;
                if role.is_some_and(|wanted| wanted != entry_role) {
                    return None;
                }
                Some(Fingerprint {
                    server_ip_port: entry.server_address,
                    role: entry_role,
                    value: entry.value,
                })
            })
            .collect())
    }

    /// Decide whether a freshly secured connection may proceed.
    ///
    /// Installs happen only for auto-accept policies and key rotation; every
    /// other path is read-only.
    pub fn evaluate(
        &self,
        server_ip_port: &str,
        observed: &str,
        policy: TrustOptions,
    ) -> TrustResult<TrustDecision> {
        use FingerprintRole::{Normal, Replacement};

        let exists = self.fingerprint_exists(server_ip_port, Normal)?;
        let matches = self.fingerprint_matches(server_ip_port, Normal, observed)?;
        let repl_exists = self.fingerprint_exists(server_ip_port, Replacement)?;
        let repl_matches = self.fingerprint_matches(server_ip_port, Replacement, observed)?;

        let not_established = (!exists && !repl_exists) || (!exists && !repl_matches);
        let new_key = !matches && !repl_matches;

        let decision = if not_established {
            if policy.auto_accept {
                self.install_fingerprint(server_ip_port, Normal, observed)?;
                TrustDecision::Installed(TrustKind::NewConnection)
            } else {
                TrustDecision::NeedsDecision {
                    kind: TrustKind::NewConnection,
                    fingerprint: observed.to_string(),
                }
            }
        } else if new_key {
            if policy.auto_accept && policy.force {
                self.install_fingerprint(server_ip_port, Normal, observed)?;
                TrustDecision::Installed(TrustKind::NewKey)
            } else {
                warn!(server = server_ip_port, "server fingerprint changed");
                TrustDecision::NeedsDecision {
                    kind: TrustKind::NewKey,
                    fingerprint: observed.to_string(),
                }
            }
        } else if (!exists || !matches) && repl_exists && repl_matches {
            self.install_fingerprint(server_ip_port, Normal, observed)?;
            self.remove_fingerprint(server_ip_port, Replacement)?;
            info!(server = server_ip_port, "replacement fingerprint promoted");
            TrustDecision::Rotated
        } else {
            TrustDecision::Trusted
        };
        debug!(server = server_ip_port, ?decision, "trust decision");
        Ok(decision)
    }

    /// Explicitly trust a server whose key is `observed`.
    ///
    /// A supplied `value` implies auto-accept and force, and is what gets
    /// installed; otherwise the observed key is installed.
    pub fn add_trust(
        &self,
        server_ip_port: &str,
        observed: &str,
        value: Option<&str>,
        mut opts: TrustOptions,
    ) -> TrustResult<TrustOutcome> {
        use FingerprintRole::{Normal, Replacement};

        if value.is_some() {
            opts.auto_accept = true;
            opts.force = true;
        }
        let role = if opts.replacement { Replacement } else { Normal };
        let install_value = value.unwrap_or(observed);

        let exists = self.fingerprint_exists(server_ip_port, Normal)?;
        let matches = self.fingerprint_matches(server_ip_port, Normal, observed)?;
        let repl_exists = self.fingerprint_exists(server_ip_port, Replacement)?;
        let repl_matches = self.fingerprint_matches(server_ip_port, Replacement, observed)?;

        let refuse = |kind| TrustOutcome::Refused {
            kind,
            server: server_ip_port.to_string(),
            fingerprint: observed.to_string(),
        };
        let not_established = |kind| TrustError::NotEstablished {
            kind,
            server: server_ip_port.to_string(),
            fingerprint: observed.to_string(),
        };

        if opts.auto_refuse {
            if !exists {
                return Ok(refuse(TrustKind::NewConnection));
            }
            if !matches {
                return Ok(refuse(TrustKind::NewKey));
            }
        }

        if (!exists || !matches) && repl_exists && repl_matches {
            self.install_fingerprint(server_ip_port, Normal, observed)?;
            self.remove_fingerprint(server_ip_port, Replacement)?;
            return Ok(TrustOutcome::Rotated);
        }

        if !exists {
            if opts.auto_accept {
                self.install_fingerprint(server_ip_port, role, install_value)?;
                return Ok(TrustOutcome::Added {
                    warning: Some(TrustKind::NewConnection),
                    server: server_ip_port.to_string(),
                });
            }
            return Err(not_established(TrustKind::NewConnection));
        }

        if !matches {
            if opts.force && opts.auto_accept {
                self.install_fingerprint(server_ip_port, role, install_value)?;
                return Ok(TrustOutcome::Added {
                    warning: Some(TrustKind::NewKey),
                    server: server_ip_port.to_string(),
                });
            }
            return Err(not_established(TrustKind::NewKey));
        }

        if value.is_some() {
            self.install_fingerprint(server_ip_port, role, install_value)?;
            return Ok(TrustOutcome::Added {
                warning: None,
                server: server_ip_port.to_string(),
            });
        }

        Ok(TrustOutcome::AlreadyEstablished)
    }

    /// Remove trust for a server. Returns whether an entry existed.
    pub fn remove_trust(&self, server_ip_port: &str, replacement: bool) -> StoreResult<bool> {
        let role = if replacement {
            FingerprintRole::Replacement
        } else {
            FingerprintRole::Normal
        };
        let existed = self.fingerprint_exists(server_ip_port, role)?;
        if existed {
            self.remove_fingerprint(server_ip_port, role)?;
        }
        Ok(existed)
    }
}
