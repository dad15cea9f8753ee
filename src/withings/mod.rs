//! Withings health API integration.

mod client;
mod parse;
mod sync;

pub use client::WithingsClient;
pub use sync::{ConnectionStatus, SyncCounts, SyncOutcome, SyncRunner};
