//! The turret capability gate daemon.
//!
//! Two Unix stream sockets front the gate: agents invoke actions on one,
//! repeaters register and answer on the other. A single dispatcher task
//! owns all mutable dispatch state (the action directory, the pending
//! request table, and the replay window), and every connection talks to it
//! exclusively through message passing, so observable ordering is the
//! dispatcher's arrival order.
//!
//! - [`connection`]: per-connection read loop and serialized writer
//! - [`listener`]: the dual-socket accept loops
//! - [`dispatch`]: the dispatcher state machine and its tables
//! - [`lifecycle`]: fire-up / engage / disengage controller
//! - [`client`]: thin async peer helpers for repeaters and tests

pub mod client;
pub mod connection;
pub mod dispatch;
pub mod lifecycle;
pub mod listener;
