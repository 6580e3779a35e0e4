//! Periodic roll-up of raw counter rows.
//!
//! Transactions only ever *append* ±1 counter rows; this component folds
//! them into one aggregated row per key and deletes exactly the rows it
//! observed. Rows inserted concurrently are picked up on the next pass.

use bson::oid::ObjectId;
use bson::doc;
use futures::TryStreamExt;
use mongodb::options::{FindOptions, UpdateOptions};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::db::DbContext;
use crate::error::{Error, Result};

/// Delay before re-polling after a pass that drained a full batch; more
/// rows are probably waiting.
const FULL_BATCH_DELAY: Duration = Duration::from_millis(500);

/// Sums raw counter rows into aggregated rows.
pub struct CountersAggregator {
    context: Arc<DbContext>,
}

#[derive(Debug, Default)]
struct KeyGroup {
    sum: i64,
    max_expire_at: Option<bson::DateTime>,
    ids: Vec<ObjectId>,
}

impl CountersAggregator {
    pub fn new(context: Arc<DbContext>) -> Self {
        Self { context }
    }

    /// Run aggregation passes until the token cancels, at which point the
    /// loop surfaces [`Error::Canceled`].
    pub async fn run(&self, token: &CancellationToken) -> Result<()> {
        info!("counters aggregator started");
        loop {
            let merged = self.aggregate_once(token).await?;
            let delay = if merged >= self.context.options().counters_aggregate_batch {
                FULL_BATCH_DELAY
            } else {
                self.context.options().counters_aggregate_interval
            };
            tokio::select! {
                _ = token.cancelled() => return Err(Error::Canceled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// One aggregation pass: merge up to a batch of raw rows into their
    /// aggregated rows and delete them. Returns how many raw rows were
    /// consumed.
    #[tracing::instrument(skip_all)]
    pub async fn aggregate_once(&self, token: &CancellationToken) -> Result<usize> {
        if token.is_cancelled() {
            return Err(Error::Canceled);
        }

        let batch = self.context.options().counters_aggregate_batch;
        let cursor = self
            .context
            .counters()
            .find(
                doc! {},
                FindOptions::builder().limit(batch as i64).build(),
            )
            .await?;
        let rows: Vec<_> = cursor.try_collect().await?;
        if rows.is_empty() {
            return Ok(0);
        }

        let mut groups: HashMap<String, KeyGroup> = HashMap::new();
        for row in &rows {
            let group = groups.entry(row.key.clone()).or_default();
            group.sum += row.value;
            group.ids.push(row.id);
            // Aggregate expiry only ever grows; rows without an expiry
            // leave it untouched.
            if let Some(expire_at) = row.expire_at {
                group.max_expire_at = Some(match group.max_expire_at {
                    Some(current) => current.max(expire_at),
                    None => expire_at,
                });
            }
        }

        let consumed = rows.len();
        let keys = groups.len();
        for (key, group) in groups {
            if token.is_cancelled() {
                return Err(Error::Canceled);
            }

            let mut update = doc! { "$inc": { "value": group.sum } };
            if let Some(max_expire_at) = group.max_expire_at {
                update.insert("$max", doc! { "expireAt": max_expire_at });
            }
            self.context
                .aggregated_counters()
                .update_one(
                    doc! { "key": &key },
                    update,
                    UpdateOptions::builder().upsert(true).build(),
                )
                .await?;

            self.context
                .counters()
                .delete_many(doc! { "key": &key, "_id": { "$in": &group.ids } }, None)
                .await?;
        }

        debug!(rows = consumed, keys, "aggregated counters");
        Ok(consumed)
    }
}
