#![recursion_limit = "1024"]

#[macro_use]
extern crate slog;
#[macro_use]
extern crate slog_scope;

pub mod clock;
pub mod errors;
pub mod logging;
pub mod metric_name;
pub mod metrics;
pub mod phone;
pub mod store;

const ONE_DAY_IN_SECONDS: u64 = 24 * 60 * 60;

/// Default retention horizon for sharded stores, 30 days in seconds.
///
/// Redial shards are keyed by month and webhook logs by day; both are swept
/// once the shard key ages past this horizon. Leads whose lifetime exceeds it
/// are no longer reopened by the daily reset and are simply left for the
/// sweep, so nothing needs a tombstone.
pub const DEFAULT_RETENTION_SECONDS: u64 = 30 * ONE_DAY_IN_SECONDS;
