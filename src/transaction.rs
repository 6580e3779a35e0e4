//! Write-only transactional mutation layer.
//!
//! A transaction accumulates mutations and applies them on commit, in
//! insertion order, as individual storage operations. This is a *batch*,
//! not an atomic commit: a crash mid-way leaves a prefix applied. Every
//! mutation is idempotent at the application level and TTLs clean up
//! orphans, which is what makes the batch safe to repeat.
//!
//! Queues touched by [`add_to_queue`] are notified exactly once each, and
//! only after the whole batch succeeded.
//!
//! [`add_to_queue`]: WriteTransaction::add_to_queue

use bson::oid::ObjectId;
use bson::{doc, Bson, Document};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use mongodb::options::UpdateOptions;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::db::DbContext;
use crate::documents::{CounterDocument, ListDocument, StateDocument};
use crate::error::{Error, Result};
use crate::queue::QueueProviders;

/// A state submitted through a transaction.
#[derive(Debug, Clone, Default)]
pub struct StateRecord {
    pub name: String,
    pub reason: Option<String>,
    pub data: HashMap<String, String>,
}

#[derive(Debug)]
enum Mutation {
    ExpireJob { job_id: ObjectId, expire_in: Duration },
    PersistJob { job_id: ObjectId },
    SetJobState { job_id: ObjectId, state: StateRecord },
    AddJobState { job_id: ObjectId, state: StateRecord },
    AddToQueue { queue: String, job_id: ObjectId },
    IncrementCounter { key: String, expire_in: Option<Duration> },
    DecrementCounter { key: String, expire_in: Option<Duration> },
    AddToSet { key: String, value: String, score: f64 },
    RemoveFromSet { key: String, value: String },
    InsertToList { key: String, value: String },
    RemoveFromList { key: String, value: String },
    TrimList { key: String, keep_from: i64, keep_to: i64 },
    SetRangeInHash { key: String, pairs: Vec<(String, String)> },
    RemoveHash { key: String },
    ExpireSet { key: String, expire_in: Duration },
    ExpireList { key: String, expire_in: Duration },
    ExpireHash { key: String, expire_in: Duration },
    PersistSet { key: String },
    PersistList { key: String },
    PersistHash { key: String },
}

/// Ordered queue of pending storage mutations.
pub struct WriteTransaction {
    context: Arc<DbContext>,
    providers: Arc<QueueProviders>,
    mutations: Vec<Mutation>,
}

impl WriteTransaction {
    pub(crate) fn new(context: Arc<DbContext>, providers: Arc<QueueProviders>) -> Self {
        Self {
            context,
            providers,
            mutations: Vec::new(),
        }
    }

    /// Number of queued mutations.
    pub fn len(&self) -> usize {
        self.mutations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }

    /// Stamp the job and its parameters and states to expire after
    /// `expire_in`.
    pub fn expire_job(&mut self, job_id: &str, expire_in: Duration) -> Result<()> {
        let job_id = parse_job_id(job_id)?;
        self.mutations.push(Mutation::ExpireJob { job_id, expire_in });
        Ok(())
    }

    /// Clear the expiry from the job and its parameters and states.
    pub fn persist_job(&mut self, job_id: &str) -> Result<()> {
        let job_id = parse_job_id(job_id)?;
        self.mutations.push(Mutation::PersistJob { job_id });
        Ok(())
    }

    /// Append a state and point the job's current state at it.
    pub fn set_job_state(&mut self, job_id: &str, state: StateRecord) -> Result<()> {
        let job_id = parse_job_id(job_id)?;
        validate_state(&state)?;
        self.mutations.push(Mutation::SetJobState { job_id, state });
        Ok(())
    }

    /// Append a state without moving the job's current-state pointer.
    pub fn add_job_state(&mut self, job_id: &str, state: StateRecord) -> Result<()> {
        let job_id = parse_job_id(job_id)?;
        validate_state(&state)?;
        self.mutations.push(Mutation::AddJobState { job_id, state });
        Ok(())
    }

    /// Place the job on `queue`, immediately visible. The queue is pulsed
    /// after commit, not here.
    pub fn add_to_queue(&mut self, queue: &str, job_id: &str) -> Result<()> {
        let job_id = parse_job_id(job_id)?;
        let queue = non_empty(queue, "queue")?;
        self.mutations.push(Mutation::AddToQueue { queue, job_id });
        Ok(())
    }

    /// Append a `+1` counter row; the aggregator folds it in later.
    pub fn increment_counter(&mut self, key: &str, expire_in: Option<Duration>) -> Result<()> {
        let key = non_empty(key, "key")?;
        self.mutations.push(Mutation::IncrementCounter { key, expire_in });
        Ok(())
    }

    /// Append a `-1` counter row.
    pub fn decrement_counter(&mut self, key: &str, expire_in: Option<Duration>) -> Result<()> {
        let key = non_empty(key, "key")?;
        self.mutations.push(Mutation::DecrementCounter { key, expire_in });
        Ok(())
    }

    /// Upsert a scored set member.
    pub fn add_to_set(&mut self, key: &str, value: &str, score: f64) -> Result<()> {
        let key = non_empty(key, "key")?;
        self.mutations.push(Mutation::AddToSet {
            key,
            value: value.to_string(),
            score,
        });
        Ok(())
    }

    /// Upsert several members with score zero.
    pub fn add_range_to_set(&mut self, key: &str, values: &[String]) -> Result<()> {
        let key = non_empty(key, "key")?;
        for value in values {
            self.mutations.push(Mutation::AddToSet {
                key: key.clone(),
                value: value.clone(),
                score: 0.0,
            });
        }
        Ok(())
    }

    pub fn remove_from_set(&mut self, key: &str, value: &str) -> Result<()> {
        let key = non_empty(key, "key")?;
        self.mutations.push(Mutation::RemoveFromSet {
            key,
            value: value.to_string(),
        });
        Ok(())
    }

    /// Append a list element.
    pub fn insert_to_list(&mut self, key: &str, value: &str) -> Result<()> {
        let key = non_empty(key, "key")?;
        self.mutations.push(Mutation::InsertToList {
            key,
            value: value.to_string(),
        });
        Ok(())
    }

    /// Remove every list element equal to `value`.
    pub fn remove_from_list(&mut self, key: &str, value: &str) -> Result<()> {
        let key = non_empty(key, "key")?;
        self.mutations.push(Mutation::RemoveFromList {
            key,
            value: value.to_string(),
        });
        Ok(())
    }

    /// Keep only the elements whose index in the newest-first ordering lies
    /// within `[keep_from, keep_to]`; everything else is deleted. An
    /// inverted or out-of-range window deletes the whole list.
    pub fn trim_list(&mut self, key: &str, keep_from: i64, keep_to: i64) -> Result<()> {
        let key = non_empty(key, "key")?;
        self.mutations.push(Mutation::TrimList {
            key,
            keep_from,
            keep_to,
        });
        Ok(())
    }

    /// Bulk-upsert hash fields under `key`.
    pub fn set_range_in_hash(&mut self, key: &str, pairs: &[(String, String)]) -> Result<()> {
        let key = non_empty(key, "key")?;
        self.mutations.push(Mutation::SetRangeInHash {
            key,
            pairs: pairs.to_vec(),
        });
        Ok(())
    }

    /// Delete every field of the hash.
    pub fn remove_hash(&mut self, key: &str) -> Result<()> {
        let key = non_empty(key, "key")?;
        self.mutations.push(Mutation::RemoveHash { key });
        Ok(())
    }

    pub fn expire_set(&mut self, key: &str, expire_in: Duration) -> Result<()> {
        let key = non_empty(key, "key")?;
        self.mutations.push(Mutation::ExpireSet { key, expire_in });
        Ok(())
    }

    pub fn expire_list(&mut self, key: &str, expire_in: Duration) -> Result<()> {
        let key = non_empty(key, "key")?;
        self.mutations.push(Mutation::ExpireList { key, expire_in });
        Ok(())
    }

    pub fn expire_hash(&mut self, key: &str, expire_in: Duration) -> Result<()> {
        let key = non_empty(key, "key")?;
        self.mutations.push(Mutation::ExpireHash { key, expire_in });
        Ok(())
    }

    pub fn persist_set(&mut self, key: &str) -> Result<()> {
        let key = non_empty(key, "key")?;
        self.mutations.push(Mutation::PersistSet { key });
        Ok(())
    }

    pub fn persist_list(&mut self, key: &str) -> Result<()> {
        let key = non_empty(key, "key")?;
        self.mutations.push(Mutation::PersistList { key });
        Ok(())
    }

    pub fn persist_hash(&mut self, key: &str) -> Result<()> {
        let key = non_empty(key, "key")?;
        self.mutations.push(Mutation::PersistHash { key });
        Ok(())
    }

    /// Apply every queued mutation in order, then pulse each distinct queue
    /// touched by [`add_to_queue`]. Server time is sampled once and reused
    /// for every expiry derived in this commit. A failed mutation aborts
    /// the rest of the batch and no notification fires.
    ///
    /// [`add_to_queue`]: WriteTransaction::add_to_queue
    pub async fn commit(self) -> Result<()> {
        let now = self.context.server_time().await?;

        let mut touched_queues: Vec<String> = Vec::new();
        for mutation in &self.mutations {
            if let Mutation::AddToQueue { queue, .. } = mutation {
                if !touched_queues.contains(queue) {
                    touched_queues.push(queue.clone());
                }
            }
        }

        let count = self.mutations.len();
        for mutation in &self.mutations {
            self.apply(mutation, now).await?;
        }
        debug!(mutations = count, queues = touched_queues.len(), "transaction committed");

        for queue in &touched_queues {
            self.providers
                .provider_for(queue)
                .job_queue()
                .notify_queue_changed(queue);
        }
        Ok(())
    }

    async fn apply(&self, mutation: &Mutation, now: DateTime<Utc>) -> Result<()> {
        match mutation {
            Mutation::ExpireJob { job_id, expire_in } => {
                let stamp = expire_stamp(now, *expire_in)?;
                self.context
                    .jobs()
                    .update_one(
                        doc! { "_id": job_id },
                        doc! { "$set": { "expireAt": stamp } },
                        None,
                    )
                    .await?;
                self.context
                    .job_parameters()
                    .update_many(
                        doc! { "jobId": job_id },
                        doc! { "$set": { "expireAt": stamp } },
                        None,
                    )
                    .await?;
                self.context
                    .states()
                    .update_many(
                        doc! { "jobId": job_id },
                        doc! { "$set": { "expireAt": stamp } },
                        None,
                    )
                    .await?;
            }
            Mutation::PersistJob { job_id } => {
                self.context
                    .jobs()
                    .update_one(
                        doc! { "_id": job_id },
                        doc! { "$unset": { "expireAt": "" } },
                        None,
                    )
                    .await?;
                self.context
                    .job_parameters()
                    .update_many(
                        doc! { "jobId": job_id },
                        doc! { "$unset": { "expireAt": "" } },
                        None,
                    )
                    .await?;
                self.context
                    .states()
                    .update_many(
                        doc! { "jobId": job_id },
                        doc! { "$unset": { "expireAt": "" } },
                        None,
                    )
                    .await?;
            }
            Mutation::SetJobState { job_id, state } => {
                let state_id = self.insert_state(job_id, state, now).await?;
                self.context
                    .jobs()
                    .update_one(
                        doc! { "_id": job_id },
                        doc! { "$set": {
                            "stateId": state_id,
                            "stateName": &state.name,
                        } },
                        None,
                    )
                    .await?;
            }
            Mutation::AddJobState { job_id, state } => {
                self.insert_state(job_id, state, now).await?;
            }
            Mutation::AddToQueue { queue, job_id } => {
                self.providers
                    .provider_for(queue)
                    .job_queue()
                    .enqueue(queue, job_id)
                    .await?;
            }
            Mutation::IncrementCounter { key, expire_in } => {
                self.insert_counter(key, 1, *expire_in, now).await?;
            }
            Mutation::DecrementCounter { key, expire_in } => {
                self.insert_counter(key, -1, *expire_in, now).await?;
            }
            Mutation::AddToSet { key, value, score } => {
                self.context
                    .sets()
                    .update_one(
                        doc! { "key": key, "value": value },
                        doc! { "$set": { "score": score } },
                        UpdateOptions::builder().upsert(true).build(),
                    )
                    .await?;
            }
            Mutation::RemoveFromSet { key, value } => {
                self.context
                    .sets()
                    .delete_many(doc! { "key": key, "value": value }, None)
                    .await?;
            }
            Mutation::InsertToList { key, value } => {
                self.context
                    .lists()
                    .insert_one(
                        ListDocument {
                            id: ObjectId::new(),
                            key: key.clone(),
                            value: value.clone(),
                            expire_at: None,
                        },
                        None,
                    )
                    .await?;
            }
            Mutation::RemoveFromList { key, value } => {
                self.context
                    .lists()
                    .delete_many(doc! { "key": key, "value": value }, None)
                    .await?;
            }
            Mutation::TrimList {
                key,
                keep_from,
                keep_to,
            } => {
                self.trim_list_now(key, *keep_from, *keep_to).await?;
            }
            Mutation::SetRangeInHash { key, pairs } => {
                for (field, value) in pairs {
                    self.context
                        .hashes()
                        .update_one(
                            doc! { "key": key, "field": field },
                            doc! { "$set": { "value": value } },
                            UpdateOptions::builder().upsert(true).build(),
                        )
                        .await?;
                }
            }
            Mutation::RemoveHash { key } => {
                self.context
                    .hashes()
                    .delete_many(doc! { "key": key }, None)
                    .await?;
            }
            Mutation::ExpireSet { key, expire_in } => {
                let stamp = expire_stamp(now, *expire_in)?;
                self.context
                    .sets()
                    .update_many(doc! { "key": key }, doc! { "$set": { "expireAt": stamp } }, None)
                    .await?;
            }
            Mutation::ExpireList { key, expire_in } => {
                let stamp = expire_stamp(now, *expire_in)?;
                self.context
                    .lists()
                    .update_many(doc! { "key": key }, doc! { "$set": { "expireAt": stamp } }, None)
                    .await?;
            }
            Mutation::ExpireHash { key, expire_in } => {
                let stamp = expire_stamp(now, *expire_in)?;
                self.context
                    .hashes()
                    .update_many(doc! { "key": key }, doc! { "$set": { "expireAt": stamp } }, None)
                    .await?;
            }
            Mutation::PersistSet { key } => {
                self.context
                    .sets()
                    .update_many(doc! { "key": key }, doc! { "$unset": { "expireAt": "" } }, None)
                    .await?;
            }
            Mutation::PersistList { key } => {
                self.context
                    .lists()
                    .update_many(doc! { "key": key }, doc! { "$unset": { "expireAt": "" } }, None)
                    .await?;
            }
            Mutation::PersistHash { key } => {
                self.context
                    .hashes()
                    .update_many(doc! { "key": key }, doc! { "$unset": { "expireAt": "" } }, None)
                    .await?;
            }
        }
        Ok(())
    }

    async fn insert_state(
        &self,
        job_id: &ObjectId,
        state: &StateRecord,
        now: DateTime<Utc>,
    ) -> Result<ObjectId> {
        let state_id = ObjectId::new();
        let data = serde_json::to_string(&state.data)
            .map_err(|e| Error::invalid_argument(format!("state data not serializable: {e}")))?;
        self.context
            .states()
            .insert_one(
                StateDocument {
                    id: state_id,
                    job_id: *job_id,
                    name: state.name.clone(),
                    reason: state.reason.clone(),
                    created_at: bson::DateTime::from_chrono(now),
                    data,
                    expire_at: None,
                },
                None,
            )
            .await?;
        Ok(state_id)
    }

    async fn insert_counter(
        &self,
        key: &str,
        value: i64,
        expire_in: Option<Duration>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let expire_at = match expire_in {
            Some(expire_in) => Some(expire_stamp(now, expire_in)?),
            None => None,
        };
        self.context
            .counters()
            .insert_one(
                CounterDocument {
                    id: ObjectId::new(),
                    key: key.to_string(),
                    value,
                    expire_at,
                },
                None,
            )
            .await?;
        Ok(())
    }

    async fn trim_list_now(&self, key: &str, keep_from: i64, keep_to: i64) -> Result<()> {
        use futures::TryStreamExt;
        use mongodb::options::FindOptions;

        let ids_only = self.context.lists().clone_with_type::<Document>();
        let cursor = ids_only
            .find(
                doc! { "key": key },
                FindOptions::builder()
                    .sort(doc! { "_id": -1 })
                    .projection(doc! { "_id": 1 })
                    .build(),
            )
            .await?;
        let documents: Vec<Document> = cursor.try_collect().await?;

        let doomed: Vec<Bson> = documents
            .iter()
            .enumerate()
            .filter(|(index, _)| {
                let index = *index as i64;
                index < keep_from || index > keep_to
            })
            .filter_map(|(_, document)| document.get("_id").cloned())
            .collect();

        if !doomed.is_empty() {
            self.context
                .lists()
                .delete_many(doc! { "key": key, "_id": { "$in": doomed } }, None)
                .await?;
        }
        Ok(())
    }
}

fn parse_job_id(job_id: &str) -> Result<ObjectId> {
    if job_id.is_empty() {
        return Err(Error::invalid_argument("job_id must not be empty"));
    }
    ObjectId::parse_str(job_id)
        .map_err(|_| Error::invalid_argument(format!("job_id {job_id:?} is not a valid id")))
}

fn non_empty(value: &str, name: &str) -> Result<String> {
    if value.is_empty() {
        return Err(Error::invalid_argument(format!("{name} must not be empty")));
    }
    Ok(value.to_string())
}

fn validate_state(state: &StateRecord) -> Result<()> {
    if state.name.is_empty() {
        return Err(Error::invalid_argument("state name must not be empty"));
    }
    Ok(())
}

fn expire_stamp(now: DateTime<Utc>, expire_in: Duration) -> Result<bson::DateTime> {
    let expire_in = ChronoDuration::from_std(expire_in)
        .map_err(|_| Error::invalid_argument("expire_in out of range"))?;
    Ok(bson::DateTime::from_chrono(now + expire_in))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_id_parsing() {
        assert!(parse_job_id("").is_err());
        assert!(parse_job_id("not-an-id").is_err());
        let id = ObjectId::new();
        assert_eq!(parse_job_id(&id.to_hex()).unwrap(), id);
    }

    #[test]
    fn trim_window_selects_descending_indices() {
        // Four elements newest-first; keeping [1, 2] drops the newest and
        // the oldest.
        let newest_first = ["3", "2", "1", "0"];
        let kept: Vec<&str> = newest_first
            .iter()
            .enumerate()
            .filter(|(index, _)| {
                let index = *index as i64;
                (1..=2).contains(&index)
            })
            .map(|(_, value)| *value)
            .collect();
        assert_eq!(kept, vec!["2", "1"]);
    }
}
