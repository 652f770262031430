#![warn(unused_extern_crates, rust_2018_idioms, clippy::print_stdout, clippy::dbg_macro)]
#![forbid(unsafe_code)]

//! Core of a non-custodial cross-chain atomic swap engine.
//!
//! The engine negotiates, constructs, signs, broadcasts and recovers
//! Hash-Time-Locked-Contract (HTLC) exchanges between two parties trading
//! different currencies. Blockchain access, durable storage, key material
//! and the message transport are consumed through the capability traits in
//! [`api`]; the crate owns the protocol state machine, the Bitcoin-family
//! HTLC implementation and the orchestration around both.

pub mod api;
pub mod bitcoin;
pub mod config;
pub mod currency;
pub mod error;
pub mod event;
pub mod lock;
pub mod manager;
mod secret;
mod secret_hash;
pub mod supervisor;
pub mod swap;
mod timestamp;

#[cfg(test)]
pub(crate) mod test_support;

pub use self::{
    secret::Secret,
    secret_hash::SecretHash,
    swap::{Swap, SwapId},
    timestamp::Timestamp,
};
