//! Decryption seam for the bunker file.
//!
//! The age/rage implementation is an external collaborator: production
//! decryption shells out to the `rage` binary with an identity file, and
//! tests substitute [`PlaintextCipher`] so no external tooling is needed.
//! Encryption lives with the operator CLI, not here; an engagement only
//! ever decrypts.

use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use zeroize::Zeroizing;

/// Prefix of an ASCII-armored or binary age file.
const AGE_HEADER: &[u8] = b"age-encryption.org/";

/// Returns whether the bytes look like an age-encrypted file.
#[must_use]
pub fn looks_like_age_file(bytes: &[u8]) -> bool {
    bytes.starts_with(AGE_HEADER)
}

/// Unlock material supplied by the host configuration or an operator.
pub enum UnlockMaterial {
    /// Path to an age or SSH identity file.
    IdentityFile(PathBuf),
    /// An interactive passphrase.
    Passphrase(Zeroizing<String>),
}

impl std::fmt::Debug for UnlockMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IdentityFile(path) => f.debug_tuple("IdentityFile").field(path).finish(),
            Self::Passphrase(_) => f.write_str("Passphrase(<redacted>)"),
        }
    }
}

/// Cipher failures.
#[derive(Debug, thiserror::Error)]
pub enum CipherError {
    /// Failed to spawn or talk to the cipher subprocess.
    #[error("cipher subprocess: {0}")]
    Io(#[from] std::io::Error),

    /// The cipher rejected the ciphertext or the identity.
    #[error("decrypt failed: {reason}")]
    DecryptFailed {
        /// Trimmed stderr of the cipher process.
        reason: String,
    },

    /// The cipher implementation cannot use this kind of material.
    #[error("unlock material not supported by this cipher: {material}")]
    UnsupportedMaterial {
        /// Which material kind was offered.
        material: &'static str,
    },
}

/// Decrypts bunker ciphertext with a given unlock material.
pub trait BunkerCipher: Send + Sync {
    /// Decrypts `ciphertext` into a zeroizing plaintext buffer.
    fn decrypt(
        &self,
        ciphertext: &[u8],
        material: &UnlockMaterial,
    ) -> Result<Zeroizing<Vec<u8>>, CipherError>;

    /// Whether ciphertext handed to this cipher must carry the age header.
    fn expects_age_header(&self) -> bool {
        true
    }
}

/// Production cipher: shells out to the `rage` binary.
pub struct RageCliCipher {
    binary: PathBuf,
}

impl RageCliCipher {
    /// Uses `rage` from `PATH`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            binary: PathBuf::from("rage"),
        }
    }

    /// Uses a specific `rage` binary.
    #[must_use]
    pub fn with_binary(binary: PathBuf) -> Self {
        Self { binary }
    }
}

impl Default for RageCliCipher {
    fn default() -> Self {
        Self::new()
    }
}

impl BunkerCipher for RageCliCipher {
    fn decrypt(
        &self,
        ciphertext: &[u8],
        material: &UnlockMaterial,
    ) -> Result<Zeroizing<Vec<u8>>, CipherError> {
        let identity = match material {
            UnlockMaterial::IdentityFile(path) => path,
            // `rage` only takes passphrases interactively on a tty.
            UnlockMaterial::Passphrase(_) => {
                return Err(CipherError::UnsupportedMaterial {
                    material: "passphrase",
                })
            }
        };

        let mut child = Command::new(&self.binary)
            .arg("--decrypt")
            .arg("-i")
            .arg(identity)
            .arg("-")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        {
            let mut stdin = child
                .stdin
                .take()
                .ok_or_else(|| std::io::Error::other("rage stdin unavailable"))?;
            stdin.write_all(ciphertext)?;
        }

        let output = child.wait_with_output()?;
        if !output.status.success() {
            let reason = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(CipherError::DecryptFailed { reason });
        }
        Ok(Zeroizing::new(output.stdout))
    }
}

/// Pass-through cipher for tests and pre-decrypted deployments.
///
/// Returns the input verbatim regardless of the offered material.
#[derive(Debug, Default)]
pub struct PlaintextCipher;

impl BunkerCipher for PlaintextCipher {
    fn decrypt(
        &self,
        ciphertext: &[u8],
        _material: &UnlockMaterial,
    ) -> Result<Zeroizing<Vec<u8>>, CipherError> {
        Ok(Zeroizing::new(ciphertext.to_vec()))
    }

    fn expects_age_header(&self) -> bool {
        false
    }
}
