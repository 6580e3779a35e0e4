//! Storage and coordination core for distributed background-job
//! processing, persisting all state in a MongoDB-compatible database.
//!
//! Multiple independent processes enqueue jobs, dequeue them for
//! execution, record state transitions, and maintain auxiliary structures
//! (sets, hashes, lists, counters). The core guarantees at-least-once
//! delivery with invisibility-based recovery, coordinates exclusive work
//! through distributed locks, and expires stale data via TTL indexes.
//!
//! # Overview
//!
//! - [`Storage`] wires a database context and hands out the other handles.
//! - [`Connection`] is the read/write API over jobs, parameters, states,
//!   servers, sets, hashes, lists, and counters.
//! - [`WriteTransaction`] batches mutations; queues touched by enqueues
//!   are pulsed only after the whole batch commits.
//! - [`JobQueue`] delivers each enqueued job to exactly one worker at a
//!   time; abandoned jobs become visible again after the invisibility
//!   timeout.
//! - [`lock::acquire`] coordinates exclusive work across processes with
//!   heartbeats, reentrancy, and expiry-based recovery.
//! - [`CountersAggregator`] folds raw ±1 counter rows into aggregates.
//! - [`MonitoringApi`] serves read-only dashboard projections.
//!
//! ```no_run
//! use std::collections::HashMap;
//! use stoker::{Storage, StorageOptions};
//!
//! # async fn example() -> stoker::Result<()> {
//! let storage = Storage::connect(
//!     "mongodb://localhost:27017",
//!     "jobs",
//!     StorageOptions::default(),
//! )
//! .await?;
//!
//! let connection = storage.connection();
//! let job_id = connection
//!     .create_expired_job(
//!         r#"{"type":"Sample","method":"Run"}"#,
//!         "[]",
//!         &HashMap::new(),
//!         chrono::Utc::now(),
//!         std::time::Duration::from_secs(24 * 60 * 60),
//!     )
//!     .await?;
//!
//! let mut transaction = connection.create_write_transaction();
//! transaction.add_to_queue("default", &job_id)?;
//! transaction.commit().await?;
//! # Ok(())
//! # }
//! ```

pub mod aggregator;
pub mod config;
pub mod connection;
pub mod db;
pub mod documents;
pub mod error;
pub mod lock;
pub mod monitoring;
pub mod queue;
pub mod storage;
pub mod transaction;

pub use aggregator::CountersAggregator;
pub use config::StorageOptions;
pub use connection::{Connection, JobData, StateData};
pub use error::{Error, Result};
pub use lock::{DistributedLockGuard, LockContext};
pub use monitoring::MonitoringApi;
pub use queue::{FetchedJob, JobQueue};
pub use storage::Storage;
pub use transaction::{StateRecord, WriteTransaction};
