//! Canonical signing bytes and Ed25519 sign/verify.
//!
//! The signing input is a raw byte concatenation, not a serializer:
//!
//! ```text
//! <principal> 0x0A <ts_ms as ASCII decimal> 0x0A <nonce> 0x0A <body>
//! ```
//!
//! `principal`, `nonce`, and `body` are the exact decoded envelope bytes
//! (no base64, no escaping), and the timestamp is rendered as an unsigned
//! decimal with no leading zeros. There is no trailing newline.

use ed25519_dalek::ed25519::signature::Signer;
use ed25519_dalek::{Signature, SigningKey, VerifyingKey};

/// Ed25519 public key length in bytes.
pub const PUBLIC_KEY_LEN: usize = 32;

/// Ed25519 signature length in bytes.
pub const SIGNATURE_LEN: usize = 64;

/// Signature and key-material errors.
#[derive(Debug, thiserror::Error)]
pub enum SignatureError {
    /// The signature did not verify over the canonical bytes.
    #[error("signature verification failed")]
    Invalid,

    /// Key bytes did not decode as a valid Ed25519 public key.
    #[error("malformed Ed25519 public key")]
    MalformedKey,
}

/// Builds the canonical signing bytes for an envelope.
#[must_use]
pub fn canonical_signing_bytes(principal: &[u8], ts_ms: u64, nonce: &[u8], body: &[u8]) -> Vec<u8> {
    let ts = ts_ms.to_string();
    let mut out =
        Vec::with_capacity(principal.len() + ts.len() + nonce.len() + body.len() + 3);
    out.extend_from_slice(principal);
    out.push(b'\n');
    out.extend_from_slice(ts.as_bytes());
    out.push(b'\n');
    out.extend_from_slice(nonce);
    out.push(b'\n');
    out.extend_from_slice(body);
    out
}

/// Signs an envelope's canonical bytes.
#[must_use]
pub fn sign(key: &SigningKey, principal: &[u8], ts_ms: u64, nonce: &[u8], body: &[u8]) -> Signature {
    key.sign(&canonical_signing_bytes(principal, ts_ms, nonce, body))
}

/// Verifies an envelope signature over the canonical bytes.
///
/// Uses `verify_strict` to reject malleable and mixed-order signatures.
pub fn verify(
    key: &VerifyingKey,
    principal: &[u8],
    ts_ms: u64,
    nonce: &[u8],
    body: &[u8],
    sig: &Signature,
) -> Result<(), SignatureError> {
    key.verify_strict(&canonical_signing_bytes(principal, ts_ms, nonce, body), sig)
        .map_err(|_| SignatureError::Invalid)
}

/// Decodes a 32-byte slice as an Ed25519 verifying key.
pub fn decode_verifying_key(bytes: &[u8]) -> Result<VerifyingKey, SignatureError> {
    let raw: &[u8; PUBLIC_KEY_LEN] = bytes
        .try_into()
        .map_err(|_| SignatureError::MalformedKey)?;
    VerifyingKey::from_bytes(raw).map_err(|_| SignatureError::MalformedKey)
}

#[cfg(test)]
mod tests {
    use rand::rngs::OsRng;

    use super::*;

    #[test]
    fn canonical_bytes_layout() {
        let bytes = canonical_signing_bytes(b"corvus", 123, b"nonce", b"body");
        assert_eq!(bytes, b"corvus\n123\nnonce\nbody".to_vec());
    }

    #[test]
    fn canonical_bytes_do_not_reencode_fields() {
        // Binary principal/nonce/body pass through untouched.
        let bytes = canonical_signing_bytes(&[0xFF, 0x0A], 0, &[0x00], &[0x0A]);
        assert_eq!(bytes, vec![0xFF, 0x0A, b'\n', b'0', b'\n', 0x00, b'\n', 0x0A]);
    }

    #[test]
    fn sign_verify_roundtrip() {
        let key = SigningKey::generate(&mut OsRng);
        let sig = sign(&key, b"corvus", 123, b"nonce", b"body");
        verify(&key.verifying_key(), b"corvus", 123, b"nonce", b"body", &sig).unwrap();
    }

    #[test]
    fn verify_rejects_field_changes() {
        let key = SigningKey::generate(&mut OsRng);
        let vk = key.verifying_key();
        let sig = sign(&key, b"corvus", 123, b"nonce", b"body");

        assert!(verify(&vk, b"corvux", 123, b"nonce", b"body", &sig).is_err());
        assert!(verify(&vk, b"corvus", 124, b"nonce", b"body", &sig).is_err());
        assert!(verify(&vk, b"corvus", 123, b"nonc_", b"body", &sig).is_err());
        assert!(verify(&vk, b"corvus", 123, b"nonce", b"bod_", &sig).is_err());
    }

    #[test]
    fn verify_rejects_wrong_key() {
        let key = SigningKey::generate(&mut OsRng);
        let other = SigningKey::generate(&mut OsRng);
        let sig = sign(&key, b"corvus", 123, b"nonce", b"body");
        assert!(verify(&other.verifying_key(), b"corvus", 123, b"nonce", b"body", &sig).is_err());
    }

    #[test]
    fn decode_verifying_key_rejects_bad_lengths() {
        assert!(decode_verifying_key(&[0u8; 31]).is_err());
        assert!(decode_verifying_key(&[0u8; 33]).is_err());
    }

    // ========================================================================
    // Proptest Fuzz Tests
    // ========================================================================

    mod fuzz {
        use proptest::collection::vec;
        use proptest::prelude::*;

        use super::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(64))]

            /// Property: a signature verifies over its own inputs and fails
            /// after flipping any byte of the signature.
            #[test]
            fn prop_sign_verify_sound(
                seed in vec(any::<u8>(), 32),
                principal in vec(any::<u8>(), 1..32),
                ts_ms in any::<u64>(),
                nonce in vec(any::<u8>(), 0..32),
                body in vec(any::<u8>(), 0..128),
                flip in 0usize..64,
            ) {
                let mut raw = [0u8; 32];
                raw.copy_from_slice(&seed);
                let key = SigningKey::from_bytes(&raw);
                let vk = key.verifying_key();

                let sig = sign(&key, &principal, ts_ms, &nonce, &body);
                prop_assert!(verify(&vk, &principal, ts_ms, &nonce, &body, &sig).is_ok());

                let mut mangled = sig.to_bytes();
                mangled[flip] ^= 0x01;
                let mangled = Signature::from_bytes(&mangled);
                prop_assert!(verify(&vk, &principal, ts_ms, &nonce, &body, &mangled).is_err());
            }

            /// Property: flipping any byte of the signed content fails
            /// verification.
            #[test]
            fn prop_content_tamper_detected(
                seed in vec(any::<u8>(), 32),
                principal in vec(any::<u8>(), 1..16),
                ts_ms in any::<u64>(),
                nonce in vec(any::<u8>(), 1..16),
                body in vec(any::<u8>(), 1..64),
                flip in any::<u16>(),
            ) {
                let mut raw = [0u8; 32];
                raw.copy_from_slice(&seed);
                let key = SigningKey::from_bytes(&raw);
                let vk = key.verifying_key();
                let sig = sign(&key, &principal, ts_ms, &nonce, &body);

                let mut tampered = body.clone();
                let at = (flip as usize) % tampered.len();
                tampered[at] ^= 0x01;
                prop_assert!(verify(&vk, &principal, ts_ms, &nonce, &tampered, &sig).is_err());
            }
        }
    }
}
