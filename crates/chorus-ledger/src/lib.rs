//! Relational store for pods, pod members and the activity ledger.
//!
//! The ledger holds one [`PodActivity`] row per (post, eligible member) per
//! amplification request. Status only moves forward:
//! `queued -> processing -> completed | failed`, with `failed -> processing`
//! allowed so that a queue retry can overwrite an earlier failure.

mod error;
mod sqlite;
mod store;
mod types;

pub use error::LedgerError;
pub use sqlite::SqliteStore;
pub use store::PodStore;
pub use types::*;
