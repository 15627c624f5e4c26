#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod batch;
mod config;
mod errors;
mod lock;
mod queue;
mod registry;
/// Database schema definitions and installer.
pub mod schema;
mod storage;
mod sweeper;
mod util;

/// The atomic multi-mutation write batch.
pub use self::batch::{JobState, WriteBatch};
/// Immutable configuration shared by all primitives.
pub use self::config::StorageOptions;
/// Error taxonomy for the storage primitives.
pub use self::errors::{Error, Result};
/// The cross-process mutual-exclusion lock.
pub use self::lock::DistributedLock;
/// The persistent queue and its claimed-entry handle.
pub use self::queue::{FetchedJob, JobQueue};
/// Queue-name to implementation mapping.
pub use self::registry::{QueueProvider, QueueRegistry};
/// One-time schema bootstrap.
pub use self::schema::setup_database;
/// The storage entry point.
pub use self::storage::Storage;
/// The expired-row garbage collector.
pub use self::sweeper::ExpirationSweeper;
