//! Persistent job queue with invisibility-based delivery.

mod fetched_job;
mod job_queue;
mod providers;

pub use fetched_job::FetchedJob;
pub use job_queue::JobQueue;
pub use providers::{DefaultQueueProvider, QueueProvider, QueueProviders};
