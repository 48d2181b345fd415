//! Protocol kernel for the turret capability gate.
//!
//! Turret mediates every action an untrusted automation client ("agent")
//! performs against downstream services, so raw credentials never leave the
//! gate. This crate holds the pieces that do not touch a socket:
//!
//! - [`protocol`]: length-prefixed framing and the signed envelope codec
//! - [`crypto`]: canonical signing bytes and Ed25519 sign/verify
//! - [`replay`]: the sliding anti-replay window
//! - [`bunker`]: the encrypted persisted-state document, its cipher seam,
//!   and the load/unlock path
//! - [`policy`]: the in-memory principal registry and permission oracle
//!   built from a validated bunker
//!
//! The daemon crate (`turret-daemon`) owns the listeners, the dispatcher,
//! and the lifecycle controller on top of this kernel.

pub mod bunker;
pub mod crypto;
pub mod policy;
pub mod protocol;
pub mod replay;
