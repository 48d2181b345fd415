//! In-memory policy index: principal registry and permission oracle.
//!
//! Built once from a validated [`Bunker`] at fire-up and immutable for the
//! lifetime of the engagement, so every lookup is a plain O(1) map read.
//! The model is **default-deny**: an unknown principal does not
//! authenticate, and an absent permission entry denies.

use std::collections::{HashMap, HashSet};

use ed25519_dalek::VerifyingKey;

use crate::bunker::{Bunker, SecretMap};
use crate::crypto::{decode_verifying_key, SignatureError};

/// Classification of a principal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrincipalClass {
    /// Untrusted automation client.
    Agent,
    /// Trusted action implementer.
    Repeater,
}

impl std::fmt::Display for PrincipalClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Agent => f.write_str("agent"),
            Self::Repeater => f.write_str("repeater"),
        }
    }
}

/// A registered principal: classification plus verifying key.
#[derive(Debug, Clone)]
pub struct Principal {
    /// Agent or repeater.
    pub class: PrincipalClass,
    /// Ed25519 verifying key from the bunker.
    pub key: VerifyingKey,
}

/// Policy construction failures.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    /// A stored public key is not a valid Ed25519 point.
    #[error("public key for '{id}' is not a valid Ed25519 key")]
    BadKey {
        /// Principal id carrying the bad key.
        id: String,
        /// Decode failure.
        #[source]
        source: SignatureError,
    },
}

/// Indexed, immutable view of the bunker policy.
pub struct PolicyIndex {
    principals: HashMap<String, Principal>,
    actions: HashMap<String, String>,
    permissions: HashMap<String, HashSet<String>>,
    secrets: SecretMap,
}

impl PolicyIndex {
    /// Builds the index from a validated bunker.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::BadKey`] when a stored key fails point
    /// decompression; fire-up treats this as a validation failure.
    pub fn from_bunker(bunker: &Bunker) -> Result<Self, PolicyError> {
        let mut principals = HashMap::with_capacity(bunker.agents.len() + bunker.repeaters.len());

        for (id, raw) in &bunker.agents {
            principals.insert(
                id.clone(),
                Principal {
                    class: PrincipalClass::Agent,
                    key: decode_key(id, raw)?,
                },
            );
        }
        for (id, raw) in &bunker.repeaters {
            principals.insert(
                id.clone(),
                Principal {
                    class: PrincipalClass::Repeater,
                    key: decode_key(id, raw)?,
                },
            );
        }

        Ok(Self {
            principals,
            actions: bunker
                .actions
                .iter()
                .map(|(action, repeater)| (action.clone(), repeater.clone()))
                .collect(),
            permissions: bunker
                .permissions
                .iter()
                .map(|(agent, allowed)| (agent.clone(), allowed.iter().cloned().collect()))
                .collect(),
            secrets: bunker.secrets.clone(),
        })
    }

    /// Resolves a principal id.
    #[must_use]
    pub fn principal(&self, id: &str) -> Option<&Principal> {
        self.principals.get(id)
    }

    /// Returns the repeater id that owns `action`, if the action exists.
    #[must_use]
    pub fn action_owner(&self, action: &str) -> Option<&str> {
        self.actions.get(action).map(String::as_str)
    }

    /// Permission oracle: exact-match lookup, absence is a deny.
    #[must_use]
    pub fn allows(&self, agent: &str, action: &str) -> bool {
        self.permissions
            .get(agent)
            .is_some_and(|allowed| allowed.contains(action))
    }

    /// Iterates the static action table.
    pub fn actions(&self) -> impl Iterator<Item = (&str, &str)> {
        self.actions
            .iter()
            .map(|(action, repeater)| (action.as_str(), repeater.as_str()))
    }

    /// Named secrets loaded from the bunker.
    ///
    /// Only the authenticated repeater-bound path may ever read these;
    /// nothing reachable from an agent connection does.
    #[must_use]
    pub fn secrets(&self) -> &SecretMap {
        &self.secrets
    }
}

impl std::fmt::Debug for PolicyIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyIndex")
            .field("principals", &self.principals.len())
            .field("actions", &self.actions.len())
            .field("permissions", &self.permissions.len())
            .field("secrets", &self.secrets.len())
            .finish()
    }
}

fn decode_key(id: &str, raw: &[u8; 32]) -> Result<VerifyingKey, PolicyError> {
    decode_verifying_key(raw).map_err(|source| PolicyError::BadKey {
        id: id.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;

    use super::*;

    fn sample_policy() -> PolicyIndex {
        let agent_key = SigningKey::generate(&mut OsRng);
        let repeater_key = SigningKey::generate(&mut OsRng);

        let mut bunker = Bunker {
            operators: BTreeSet::from(["age1qqq".to_string()]),
            ..Bunker::default()
        };
        bunker
            .agents
            .insert("corvus".to_string(), agent_key.verifying_key().to_bytes());
        bunker.repeaters.insert(
            "rep-1".to_string(),
            repeater_key.verifying_key().to_bytes(),
        );
        bunker
            .actions
            .insert("echo".to_string(), "rep-1".to_string());
        bunker
            .actions
            .insert("deploy".to_string(), "rep-1".to_string());
        bunker.permissions.insert(
            "corvus".to_string(),
            BTreeSet::from(["echo".to_string()]),
        );
        bunker.validate().unwrap();
        PolicyIndex::from_bunker(&bunker).unwrap()
    }

    #[test]
    fn resolves_principals_with_class() {
        let policy = sample_policy();
        assert_eq!(
            policy.principal("corvus").unwrap().class,
            PrincipalClass::Agent
        );
        assert_eq!(
            policy.principal("rep-1").unwrap().class,
            PrincipalClass::Repeater
        );
        assert!(policy.principal("ghost").is_none());
    }

    #[test]
    fn permission_oracle_is_exact_match_default_deny() {
        let policy = sample_policy();
        assert!(policy.allows("corvus", "echo"));
        // Present in the bunker but not granted.
        assert!(!policy.allows("corvus", "deploy"));
        // Unknown action and unknown agent both deny.
        assert!(!policy.allows("corvus", "ech"));
        assert!(!policy.allows("corvus", "echo2"));
        assert!(!policy.allows("ghost", "echo"));
    }

    #[test]
    fn action_owner_lookup() {
        let policy = sample_policy();
        assert_eq!(policy.action_owner("echo"), Some("rep-1"));
        assert_eq!(policy.action_owner("ghost"), None);
    }

    #[test]
    fn rejects_invalid_curve_point() {
        let mut bunker = Bunker {
            operators: BTreeSet::from(["age1qqq".to_string()]),
            ..Bunker::default()
        };
        // All-0xFF is not a valid compressed Edwards point.
        bunker.agents.insert("corvus".to_string(), [0xFF; 32]);
        assert!(matches!(
            PolicyIndex::from_bunker(&bunker),
            Err(PolicyError::BadKey { .. })
        ));
    }

    #[test]
    fn debug_does_not_leak_secrets() {
        use crate::bunker::SecretValue;

        let agent_key = SigningKey::generate(&mut OsRng);
        let mut bunker = Bunker {
            operators: BTreeSet::from(["age1qqq".to_string()]),
            ..Bunker::default()
        };
        bunker
            .agents
            .insert("corvus".to_string(), agent_key.verifying_key().to_bytes());
        bunker
            .secrets
            .insert("TOKEN".to_string(), SecretValue::new("hunter2".into()));

        let policy = PolicyIndex::from_bunker(&bunker).unwrap();
        let rendered = format!("{policy:?}");
        assert!(!rendered.contains("hunter2"));
    }
}
