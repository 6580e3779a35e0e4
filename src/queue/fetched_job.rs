//! Handle to a dequeued job awaiting its disposition.

use bson::oid::ObjectId;
use bson::{doc, Bson};
use mongodb::Collection;
use tracing::warn;

use crate::documents::JobDocument;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Disposition {
    Pending,
    Removed,
    Requeued,
}

/// A fetched job owned by this worker until it reports an outcome.
///
/// Exactly one of [`remove_from_queue`] or [`requeue`] should be called.
/// Dropping the handle without either spawns a best-effort requeue; if that
/// cannot run (no runtime, storage failure), the invisibility timeout
/// returns the job to the queue anyway.
///
/// [`remove_from_queue`]: FetchedJob::remove_from_queue
/// [`requeue`]: FetchedJob::requeue
pub struct FetchedJob {
    jobs: Collection<JobDocument>,
    job_id: ObjectId,
    queue: String,
    disposition: Disposition,
}

impl FetchedJob {
    pub(crate) fn new(jobs: Collection<JobDocument>, job_id: ObjectId, queue: String) -> Self {
        Self {
            jobs,
            job_id,
            queue,
            disposition: Disposition::Pending,
        }
    }

    /// The fetched job's id.
    pub fn job_id(&self) -> String {
        self.job_id.to_hex()
    }

    /// The queue the job was fetched from.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Acknowledge successful processing: clear both the queue name and the
    /// fetch stamp so the job never re-enters delivery.
    pub async fn remove_from_queue(&mut self) -> Result<()> {
        self.jobs
            .update_one(
                doc! { "_id": self.job_id },
                doc! { "$set": { "queue": Bson::Null, "fetchedAt": Bson::Null } },
                None,
            )
            .await?;
        self.disposition = Disposition::Removed;
        Ok(())
    }

    /// Return the job to its queue, immediately visible to other workers.
    pub async fn requeue(&mut self) -> Result<()> {
        self.jobs
            .update_one(
                doc! { "_id": self.job_id },
                doc! { "$set": { "fetchedAt": Bson::Null } },
                None,
            )
            .await?;
        self.disposition = Disposition::Requeued;
        Ok(())
    }
}

impl Drop for FetchedJob {
    fn drop(&mut self) {
        if self.disposition != Disposition::Pending {
            return;
        }
        let jobs = self.jobs.clone();
        let job_id = self.job_id;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let outcome = jobs
                        .update_one(
                            doc! { "_id": job_id },
                            doc! { "$set": { "fetchedAt": Bson::Null } },
                            None,
                        )
                        .await;
                    if let Err(error) = outcome {
                        warn!(job_id = %job_id, %error, "requeue on drop failed");
                    }
                });
            }
            Err(_) => {
                warn!(job_id = %job_id, "no runtime for requeue on drop; invisibility timeout will recover the job");
            }
        }
    }
}
