//! Atomic fetch-and-mark dequeue with long-poll notification.

use bson::{doc, Bson};
use chrono::Duration as ChronoDuration;
use mongodb::options::{FindOneAndUpdateOptions, ReturnDocument};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::db::DbContext;
use crate::error::{Error, Result};
use crate::queue::FetchedJob;

/// A persistent job queue over the job collection.
///
/// Delivery uniqueness comes from a single atomic find-and-update: a job is
/// a candidate while its `fetchedAt` is null or older than the invisibility
/// timeout, and fetching stamps `fetchedAt` with the server clock in the
/// same operation. A worker that crashes without reporting back simply
/// leaves the stamp in place; the job becomes visible again once the
/// timeout passes.
pub struct JobQueue {
    context: Arc<DbContext>,
    notifier: Notify,
    disposed: CancellationToken,
}

impl JobQueue {
    pub fn new(context: Arc<DbContext>) -> Self {
        Self {
            context,
            notifier: Notify::new(),
            disposed: CancellationToken::new(),
        }
    }

    /// Fetch the next job from any of `queues`, blocking until one is
    /// available, the token is canceled, or the queue is disposed.
    ///
    /// Multi-queue calls carry no priority: some matching job is returned,
    /// and repeated calls eventually drain every queue.
    pub async fn dequeue(&self, queues: &[String], token: &CancellationToken) -> Result<FetchedJob> {
        if queues.is_empty() {
            return Err(Error::invalid_argument("queues must not be empty"));
        }
        if queues.iter().any(|queue| queue.is_empty()) {
            return Err(Error::invalid_argument("queue names must not be empty"));
        }

        let invisibility = ChronoDuration::from_std(self.context.options().invisibility_timeout)
            .map_err(|_| Error::invalid_argument("invisibility_timeout out of range"))?;
        let poll_interval = self.context.options().queue_poll_interval;

        loop {
            if token.is_cancelled() {
                return Err(Error::Canceled);
            }
            if self.disposed.is_cancelled() {
                return Err(Error::Disposed);
            }

            let now = self.context.server_time().await?;
            let visibility_floor = bson::DateTime::from_chrono(now - invisibility);
            let filter = doc! {
                "queue": { "$in": queues },
                "$or": [
                    { "fetchedAt": Bson::Null },
                    { "fetchedAt": { "$lt": visibility_floor } },
                ],
            };
            let update = doc! { "$set": { "fetchedAt": bson::DateTime::from_chrono(now) } };
            let options = FindOneAndUpdateOptions::builder()
                .return_document(ReturnDocument::After)
                .build();

            if let Some(job) = self
                .context
                .jobs()
                .find_one_and_update(filter, update, options)
                .await?
            {
                let queue = job.queue.clone().unwrap_or_default();
                debug!(job_id = %job.id, queue, "job fetched");
                return Ok(FetchedJob::new(self.context.jobs(), job.id, queue));
            }

            trace!("no candidate job, waiting");
            tokio::select! {
                _ = token.cancelled() => return Err(Error::Canceled),
                _ = self.disposed.cancelled() => return Err(Error::Disposed),
                _ = self.notifier.notified() => {},
                _ = tokio::time::sleep(poll_interval) => {},
            }
        }
    }

    /// Mark `job_id` as belonging to `queue` and immediately visible.
    ///
    /// This does *not* pulse the queue-changed handle. Enqueues happen
    /// inside transactions, and a dequeuer woken before the rest of the
    /// batch commits would find nothing; the transaction notifies after a
    /// full commit instead.
    pub(crate) async fn enqueue(&self, queue: &str, job_id: &bson::oid::ObjectId) -> Result<()> {
        self.context
            .jobs()
            .update_one(
                doc! { "_id": job_id },
                doc! { "$set": { "queue": queue, "fetchedAt": Bson::Null } },
                None,
            )
            .await?;
        Ok(())
    }

    /// Wake every dequeuer currently blocked in this process. The pulse is
    /// not sticky: a dequeuer arriving afterwards waits for the next pulse
    /// or its poll interval.
    pub fn notify_queue_changed(&self, queue: &str) {
        trace!(queue, "queue changed");
        self.notifier.notify_waiters();
    }

    /// Fail all current and future dequeuers with a disposed error.
    pub fn dispose(&self) {
        self.disposed.cancel();
    }
}
