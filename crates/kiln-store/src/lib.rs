//! kiln-store: durability layer.
//!
//! The single shared store that serializes every coordination write in a
//! kiln cluster: node membership rows, peer observations, named lock
//! leases, and compensation frames. Backed by SQLite; timestamps come from
//! the store clock so nodes never compare their own wall clocks.

pub mod error;
pub mod schema;
pub mod store;
pub mod time;

pub use error::StoreError;
pub use store::{run_blocking, Store};
pub use time::{duration_ms, Clock, ManualClock, SystemClock};

/// Re-exported so downstream crates build queries against the same version.
pub use rusqlite;
