//! The bunker load path: read, decrypt, parse, validate.
//!
//! Fire-up tries the configured host identity first; when that is absent or
//! fails, it asks the operator-unlock collaborator for material and retries.
//! Any failure aborts fire-up with a human-readable reason; no socket is
//! ever opened over an unvalidated policy.

use std::path::{Path, PathBuf};

use tracing::{info, warn};
use zeroize::Zeroizing;

use super::cipher::{looks_like_age_file, BunkerCipher, CipherError, UnlockMaterial};
use super::document::{Bunker, BunkerError};

/// Failure reported by the operator-unlock collaborator.
#[derive(Debug, thiserror::Error)]
pub enum UnlockError {
    /// The operator declined or the console was unavailable.
    #[error("operator unlock unavailable: {reason}")]
    Unavailable {
        /// Human-readable reason.
        reason: String,
    },
}

/// Console collaborator that obtains unlock material from an operator.
///
/// The core only sees the resulting material; prompting and input handling
/// live with the caller.
pub trait OperatorUnlock: Send + Sync {
    /// Requests unlock material, explaining why it is needed.
    fn request_material(&self, reason: &str) -> Result<UnlockMaterial, UnlockError>;
}

/// Bunker load failures.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Could not read the bunker file.
    #[error("failed to read bunker {path}: {source}")]
    Read {
        /// Path that failed.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The file did not carry the age header the cipher requires.
    #[error("bunker {path} is not an age-encrypted file")]
    NotAgeFile {
        /// Path that failed the sniff.
        path: PathBuf,
    },

    /// Neither the host identity nor an operator could decrypt.
    #[error("could not unlock bunker: {reason}")]
    Locked {
        /// Human-readable reason from the last attempt.
        reason: String,
    },

    /// The operator collaborator failed.
    #[error(transparent)]
    Unlock(#[from] UnlockError),

    /// The decrypted document failed to parse or validate.
    #[error(transparent)]
    Document(#[from] BunkerError),
}

/// Loads and decrypts the bunker document.
pub struct BunkerStore {
    cipher: Box<dyn BunkerCipher>,
    host_identity: Option<PathBuf>,
}

impl BunkerStore {
    /// Creates a store over the given cipher.
    #[must_use]
    pub fn new(cipher: Box<dyn BunkerCipher>, host_identity: Option<PathBuf>) -> Self {
        Self {
            cipher,
            host_identity,
        }
    }

    /// Loads, decrypts, parses, and validates the bunker at `path`.
    ///
    /// Decryption order: configured host identity first, then operator
    /// unlock material obtained through `operator`. The plaintext only ever
    /// lives in a zeroizing buffer.
    pub fn load(
        &self,
        path: &Path,
        operator: Option<&dyn OperatorUnlock>,
    ) -> Result<Bunker, StoreError> {
        let ciphertext = std::fs::read(path).map_err(|source| StoreError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        if self.cipher.expects_age_header() && !looks_like_age_file(&ciphertext) {
            return Err(StoreError::NotAgeFile {
                path: path.to_path_buf(),
            });
        }

        let plaintext = self.decrypt(path, &ciphertext, operator)?;
        let bunker = Bunker::decode(&plaintext)?;
        info!(
            path = %path.display(),
            agents = bunker.agents.len(),
            repeaters = bunker.repeaters.len(),
            actions = bunker.actions.len(),
            "bunker unlocked and validated"
        );
        Ok(bunker)
    }

    fn decrypt(
        &self,
        path: &Path,
        ciphertext: &[u8],
        operator: Option<&dyn OperatorUnlock>,
    ) -> Result<Zeroizing<Vec<u8>>, StoreError> {
        let host_failure = match &self.host_identity {
            Some(identity) => {
                let material = UnlockMaterial::IdentityFile(identity.clone());
                match self.cipher.decrypt(ciphertext, &material) {
                    Ok(plaintext) => return Ok(plaintext),
                    Err(error) => {
                        warn!(
                            path = %path.display(),
                            identity = %identity.display(),
                            %error,
                            "host identity could not unlock bunker"
                        );
                        Some(error)
                    }
                }
            }
            None => None,
        };

        let Some(operator) = operator else {
            let reason = host_failure.map_or_else(
                || "no host identity configured and no operator available".to_string(),
                |error| format!("host identity failed ({error}) and no operator available"),
            );
            return Err(StoreError::Locked { reason });
        };

        let material = operator.request_material("bunker requires operator unlock")?;
        self.cipher
            .decrypt(ciphertext, &material)
            .map_err(|error| StoreError::Locked {
                reason: operator_failure_reason(&error),
            })
    }
}

fn operator_failure_reason(error: &CipherError) -> String {
    match error {
        CipherError::DecryptFailed { .. } => {
            "this operator is not permitted to open this bunker".to_string()
        }
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::super::cipher::PlaintextCipher;
    use super::*;

    struct FixedUnlock(PathBuf);

    impl OperatorUnlock for FixedUnlock {
        fn request_material(&self, _reason: &str) -> Result<UnlockMaterial, UnlockError> {
            Ok(UnlockMaterial::IdentityFile(self.0.clone()))
        }
    }

    struct RefusingUnlock;

    impl OperatorUnlock for RefusingUnlock {
        fn request_material(&self, _reason: &str) -> Result<UnlockMaterial, UnlockError> {
            Err(UnlockError::Unavailable {
                reason: "no console".to_string(),
            })
        }
    }

    fn sample_bunker() -> Bunker {
        Bunker {
            operators: BTreeSet::from(["age1qqqexample".to_string()]),
            ..Bunker::default()
        }
    }

    fn write_plaintext_bunker(dir: &tempfile::TempDir) -> PathBuf {
        let path = dir.path().join("test.bnkr");
        std::fs::write(&path, sample_bunker().to_toml().unwrap()).unwrap();
        path
    }

    #[test]
    fn loads_with_host_identity() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = write_plaintext_bunker(&dir);

        let store = BunkerStore::new(
            Box::new(PlaintextCipher),
            Some(PathBuf::from("/dev/null")),
        );
        let bunker = store.load(&path, None).unwrap();
        assert_eq!(bunker, sample_bunker());
    }

    #[test]
    fn falls_back_to_operator_when_no_host_identity() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = write_plaintext_bunker(&dir);

        let store = BunkerStore::new(Box::new(PlaintextCipher), None);
        let unlock = FixedUnlock(PathBuf::from("/dev/null"));
        let bunker = store.load(&path, Some(&unlock)).unwrap();
        assert_eq!(bunker, sample_bunker());
    }

    #[test]
    fn fails_locked_without_any_unlock_path() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = write_plaintext_bunker(&dir);

        // A cipher that requires an identity, none configured, no operator.
        struct RefuseAll;
        impl BunkerCipher for RefuseAll {
            fn decrypt(
                &self,
                _ciphertext: &[u8],
                _material: &UnlockMaterial,
            ) -> Result<Zeroizing<Vec<u8>>, CipherError> {
                Err(CipherError::DecryptFailed {
                    reason: "no identity matched".to_string(),
                })
            }
            fn expects_age_header(&self) -> bool {
                false
            }
        }

        let store = BunkerStore::new(Box::new(RefuseAll), None);
        assert!(matches!(
            store.load(&path, None),
            Err(StoreError::Locked { .. })
        ));
    }

    #[test]
    fn surfaces_operator_refusal() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = write_plaintext_bunker(&dir);

        struct RefuseAll;
        impl BunkerCipher for RefuseAll {
            fn decrypt(
                &self,
                _ciphertext: &[u8],
                _material: &UnlockMaterial,
            ) -> Result<Zeroizing<Vec<u8>>, CipherError> {
                Err(CipherError::DecryptFailed {
                    reason: "nope".to_string(),
                })
            }
            fn expects_age_header(&self) -> bool {
                false
            }
        }

        let store = BunkerStore::new(Box::new(RefuseAll), None);
        assert!(matches!(
            store.load(&path, Some(&RefusingUnlock)),
            Err(StoreError::Unlock(_))
        ));
    }

    #[test]
    fn rejects_missing_age_header_for_age_cipher() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = write_plaintext_bunker(&dir);

        struct AgeOnly;
        impl BunkerCipher for AgeOnly {
            fn decrypt(
                &self,
                _ciphertext: &[u8],
                _material: &UnlockMaterial,
            ) -> Result<Zeroizing<Vec<u8>>, CipherError> {
                unreachable!("sniff rejects before decrypt")
            }
        }

        let store = BunkerStore::new(Box::new(AgeOnly), Some(PathBuf::from("/dev/null")));
        assert!(matches!(
            store.load(&path, None),
            Err(StoreError::NotAgeFile { .. })
        ));
    }

    #[test]
    fn rejects_invalid_document() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("bad.bnkr");
        std::fs::write(&path, b"version = 1\n[operators]\nrecipients = []\n").unwrap();

        let store = BunkerStore::new(Box::new(PlaintextCipher), None);
        let unlock = FixedUnlock(PathBuf::from("/dev/null"));
        assert!(matches!(
            store.load(&path, Some(&unlock)),
            Err(StoreError::Document(_))
        ));
    }
}
