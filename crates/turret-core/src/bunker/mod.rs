//! The encrypted persisted-state document ("bunker") and its lifecycle.
//!
//! The bunker holds everything the gate must know to arbitrate requests:
//! operator recipients, agent and repeater public keys, the action table,
//! the permission table, and named secrets. It lives on disk age-encrypted
//! and is decrypted exactly once per engagement; the plaintext exists only
//! in memory, in zeroizing buffers.
//!
//! - [`document`]: the parsed TOML document and its validation invariants
//! - [`cipher`]: the decryption seam (`rage` subprocess in production,
//!   plaintext pass-through in tests)
//! - [`store`]: the load path (host identity first, operator unlock second)

pub mod cipher;
pub mod document;
pub mod store;

pub use cipher::{
    looks_like_age_file, BunkerCipher, CipherError, PlaintextCipher, RageCliCipher, UnlockMaterial,
};
pub use document::{Bunker, BunkerError, SecretMap, SecretValue};
pub use store::{BunkerStore, OperatorUnlock, StoreError, UnlockError};
