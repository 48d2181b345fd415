//! The bunker document: shape, TOML bridge, and validation.
//!
//! The plaintext is a UTF-8 TOML document:
//!
//! ```toml
//! version = 1
//!
//! [operators]
//! recipients = ["age1..."]
//!
//! [agents.corvus]
//! ed25519_pubkey_b64 = "..."
//!
//! [repeaters.rep-1]
//! ed25519_pubkey_b64 = "..."
//!
//! [actions]
//! echo = "rep-1"
//!
//! [permissions.corvus]
//! allow = ["echo"]
//!
//! [secrets]
//! API_TOKEN = "..."
//! ```
//!
//! Unknown keys are rejected. Validation enforces the referential
//! invariants: every permission references a known agent and a known
//! action, every action maps to a known repeater, recipients are
//! non-empty, ids are non-empty, and no id appears in both the agent and
//! repeater tables.

use std::collections::{BTreeMap, BTreeSet};

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::crypto::PUBLIC_KEY_LEN;

/// A named secret value.
///
/// The backing string zeroizes on drop, and `Debug` never prints the
/// content.
#[derive(Clone)]
pub struct SecretValue(Zeroizing<String>);

impl PartialEq for SecretValue {
    fn eq(&self, other: &Self) -> bool {
        self.0.as_str() == other.0.as_str()
    }
}

impl Eq for SecretValue {}

impl SecretValue {
    /// Wraps a plaintext secret.
    #[must_use]
    pub fn new(value: String) -> Self {
        Self(Zeroizing::new(value))
    }

    /// Exposes the secret content.
    ///
    /// Callers must not route the returned bytes toward any agent-facing
    /// path.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretValue(<redacted>)")
    }
}

/// Named secrets held in memory for the duration of an engagement.
pub type SecretMap = BTreeMap<String, SecretValue>;

/// The decrypted bunker state root.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct Bunker {
    /// Operator recipient strings (opaque to the core).
    pub operators: BTreeSet<String>,
    /// Agent id → Ed25519 public key.
    pub agents: BTreeMap<String, [u8; PUBLIC_KEY_LEN]>,
    /// Repeater id → Ed25519 public key.
    pub repeaters: BTreeMap<String, [u8; PUBLIC_KEY_LEN]>,
    /// Action name → owning repeater id.
    pub actions: BTreeMap<String, String>,
    /// Agent id → allowed action names (exact match only).
    pub permissions: BTreeMap<String, BTreeSet<String>>,
    /// Named secrets; never egress toward agents.
    pub secrets: SecretMap,
}

/// Bunker parse and validation failures.
///
/// Every variant renders a human-readable reason; fire-up surfaces these
/// verbatim and refuses to open any socket.
#[derive(Debug, thiserror::Error)]
pub enum BunkerError {
    /// Plaintext was not UTF-8.
    #[error("bunker plaintext is not UTF-8")]
    NotUtf8,

    /// TOML syntax or unknown-key failure.
    #[error("bunker parse failed: {0}")]
    Toml(#[from] toml::de::Error),

    /// TOML serialization failure.
    #[error("bunker serialize failed: {0}")]
    TomlSer(#[from] toml::ser::Error),

    /// Version field did not match the supported version.
    #[error("unsupported bunker version {version}, expected 1")]
    UnsupportedVersion {
        /// Version found in the document.
        version: u32,
    },

    /// `operators.recipients` was empty.
    #[error("bunker has no operator recipients")]
    NoOperators,

    /// An id string was empty.
    #[error("empty id in {table} table")]
    EmptyId {
        /// Table containing the empty id.
        table: &'static str,
    },

    /// An id appeared in both the agent and repeater tables.
    #[error("id '{id}' is declared as both agent and repeater")]
    AmbiguousPrincipal {
        /// The conflicting id.
        id: String,
    },

    /// An action mapped to a repeater that does not exist.
    #[error("action '{action}' references unknown repeater '{repeater}'")]
    UnknownRepeater {
        /// Action name.
        action: String,
        /// Missing repeater id.
        repeater: String,
    },

    /// A permission entry referenced an agent that does not exist.
    #[error("permissions reference unknown agent '{agent}'")]
    UnknownAgent {
        /// Missing agent id.
        agent: String,
    },

    /// A permission entry referenced an action that does not exist.
    #[error("permission for '{agent}' references unknown action '{action}'")]
    UnknownAction {
        /// Agent holding the permission.
        agent: String,
        /// Missing action name.
        action: String,
    },

    /// A public key failed base64 or length validation.
    #[error("bad Ed25519 public key for '{id}': {reason}")]
    BadKey {
        /// Principal id carrying the bad key.
        id: String,
        /// What was wrong.
        reason: &'static str,
    },
}

impl Bunker {
    /// Parses and validates a decrypted plaintext.
    pub fn decode(plaintext: &[u8]) -> Result<Self, BunkerError> {
        let text = std::str::from_utf8(plaintext).map_err(|_| BunkerError::NotUtf8)?;
        let raw: RawBunker = toml::from_str(text)?;
        raw.try_into()
    }

    /// Serializes the document back to TOML plaintext.
    pub fn to_toml(&self) -> Result<Vec<u8>, BunkerError> {
        let raw = RawBunker::from(self);
        let text = toml::to_string_pretty(&raw)?;
        Ok(text.into_bytes())
    }

    /// Checks the referential invariants.
    pub fn validate(&self) -> Result<(), BunkerError> {
        if self.operators.is_empty() {
            return Err(BunkerError::NoOperators);
        }

        for (table, ids) in [
            ("agents", self.agents.keys()),
            ("repeaters", self.repeaters.keys()),
        ] {
            for id in ids {
                if id.is_empty() {
                    return Err(BunkerError::EmptyId { table });
                }
            }
        }
        if self.actions.keys().any(String::is_empty) {
            return Err(BunkerError::EmptyId { table: "actions" });
        }

        if let Some(id) = self.agents.keys().find(|id| self.repeaters.contains_key(*id)) {
            return Err(BunkerError::AmbiguousPrincipal { id: id.clone() });
        }

        for (action, repeater) in &self.actions {
            if !self.repeaters.contains_key(repeater) {
                return Err(BunkerError::UnknownRepeater {
                    action: action.clone(),
                    repeater: repeater.clone(),
                });
            }
        }

        for (agent, allowed) in &self.permissions {
            if !self.agents.contains_key(agent) {
                return Err(BunkerError::UnknownAgent {
                    agent: agent.clone(),
                });
            }
            for action in allowed {
                if !self.actions.contains_key(action) {
                    return Err(BunkerError::UnknownAction {
                        agent: agent.clone(),
                        action: action.clone(),
                    });
                }
            }
        }

        Ok(())
    }
}

// ============================================================================
// TOML bridge
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawBunker {
    version: u32,
    operators: RawOperators,

    #[serde(default)]
    agents: BTreeMap<String, RawKeyEntry>,
    #[serde(default)]
    repeaters: BTreeMap<String, RawKeyEntry>,
    #[serde(default)]
    actions: BTreeMap<String, String>,
    #[serde(default)]
    permissions: BTreeMap<String, RawPermissionEntry>,
    #[serde(default)]
    secrets: BTreeMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawOperators {
    recipients: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawKeyEntry {
    ed25519_pubkey_b64: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPermissionEntry {
    allow: Vec<String>,
}

impl TryFrom<RawBunker> for Bunker {
    type Error = BunkerError;

    fn try_from(raw: RawBunker) -> Result<Self, Self::Error> {
        if raw.version != 1 {
            return Err(BunkerError::UnsupportedVersion {
                version: raw.version,
            });
        }

        let bunker = Self {
            operators: raw.operators.recipients.into_iter().collect(),
            agents: decode_keys(raw.agents)?,
            repeaters: decode_keys(raw.repeaters)?,
            actions: raw.actions,
            permissions: raw
                .permissions
                .into_iter()
                .map(|(agent, entry)| (agent, entry.allow.into_iter().collect()))
                .collect(),
            secrets: raw
                .secrets
                .into_iter()
                .map(|(name, value)| (name, SecretValue::new(value)))
                .collect(),
        };
        bunker.validate()?;
        Ok(bunker)
    }
}

impl From<&Bunker> for RawBunker {
    fn from(bunker: &Bunker) -> Self {
        Self {
            version: 1,
            operators: RawOperators {
                recipients: bunker.operators.iter().cloned().collect(),
            },
            agents: encode_keys(&bunker.agents),
            repeaters: encode_keys(&bunker.repeaters),
            actions: bunker.actions.clone(),
            permissions: bunker
                .permissions
                .iter()
                .map(|(agent, allowed)| {
                    (
                        agent.clone(),
                        RawPermissionEntry {
                            allow: allowed.iter().cloned().collect(),
                        },
                    )
                })
                .collect(),
            secrets: bunker
                .secrets
                .iter()
                .map(|(name, value)| (name.clone(), value.expose().to_string()))
                .collect(),
        }
    }
}

fn decode_keys(
    entries: BTreeMap<String, RawKeyEntry>,
) -> Result<BTreeMap<String, [u8; PUBLIC_KEY_LEN]>, BunkerError> {
    let mut out = BTreeMap::new();
    for (id, entry) in entries {
        let bytes = B64
            .decode(entry.ed25519_pubkey_b64.as_bytes())
            .map_err(|_| BunkerError::BadKey {
                id: id.clone(),
                reason: "invalid base64",
            })?;
        let key: [u8; PUBLIC_KEY_LEN] =
            bytes.as_slice().try_into().map_err(|_| BunkerError::BadKey {
                id: id.clone(),
                reason: "must decode to 32 bytes",
            })?;
        out.insert(id, key);
    }
    Ok(out)
}

fn encode_keys(keys: &BTreeMap<String, [u8; PUBLIC_KEY_LEN]>) -> BTreeMap<String, RawKeyEntry> {
    keys.iter()
        .map(|(id, key)| {
            (
                id.clone(),
                RawKeyEntry {
                    ed25519_pubkey_b64: B64.encode(key),
                },
            )
        })
        .collect()
}
