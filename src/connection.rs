//! Read/write operations over the storage schema.
//!
//! A connection is a lightweight handle over the shared database context;
//! create one per logical flow. Different connections against the same
//! database are independent and safe to use concurrently.

use bson::oid::ObjectId;
use bson::{doc, Bson, Document};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::TryStreamExt;
use mongodb::options::{FindOneOptions, FindOptions, UpdateOptions};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::db::DbContext;
use crate::documents::{JobDocument, JobParameterDocument, ServerDocument};
use crate::error::{Error, Result};
use crate::lock::{self, DistributedLockGuard, LockContext};
use crate::queue::{FetchedJob, QueueProviders};
use crate::transaction::WriteTransaction;
use tokio_util::sync::CancellationToken;

/// Point-read projection of a job.
///
/// `load_exception` carries an invocation-payload deserialization failure
/// instead of failing the read, so monitoring keeps working on jobs whose
/// payload a newer (or older) host serialized differently.
#[derive(Debug, Clone)]
pub struct JobData {
    pub invocation_data: String,
    pub arguments: String,
    pub state_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub load_exception: Option<String>,
}

/// Point-read projection of a job's current state.
#[derive(Debug, Clone)]
pub struct StateData {
    pub name: String,
    pub reason: Option<String>,
    pub data: HashMap<String, String>,
    pub load_exception: Option<String>,
}

/// Read/write API over jobs, parameters, states, servers, sets, hashes,
/// lists, and counters; also the factory for transactions, locks, and
/// fetches.
pub struct Connection {
    context: Arc<DbContext>,
    providers: Arc<QueueProviders>,
}

impl Connection {
    pub(crate) fn new(context: Arc<DbContext>, providers: Arc<QueueProviders>) -> Self {
        Self { context, providers }
    }

    /// Start a write transaction against this storage.
    pub fn create_write_transaction(&self) -> WriteTransaction {
        WriteTransaction::new(Arc::clone(&self.context), Arc::clone(&self.providers))
    }

    /// Acquire the distributed lock named `resource`, waiting up to
    /// `timeout`. Reentrancy is scoped to `lock_context`.
    pub async fn acquire_distributed_lock(
        &self,
        resource: &str,
        timeout: Duration,
        lock_context: &LockContext,
    ) -> Result<DistributedLockGuard> {
        lock::acquire(Arc::clone(&self.context), resource, timeout, lock_context).await
    }

    // ── jobs ────────────────────────────────────────────────────────────

    /// Insert a job that expires `expire_in` after `created_at` unless a
    /// later transaction persists it, together with its parameters.
    pub async fn create_expired_job(
        &self,
        invocation_data: &str,
        arguments: &str,
        parameters: &HashMap<String, String>,
        created_at: DateTime<Utc>,
        expire_in: Duration,
    ) -> Result<String> {
        if invocation_data.is_empty() {
            return Err(Error::invalid_argument("invocation_data must not be empty"));
        }
        let expire_in = ChronoDuration::from_std(expire_in)
            .map_err(|_| Error::invalid_argument("expire_in out of range"))?;
        let expire_at = bson::DateTime::from_chrono(created_at + expire_in);

        let job_id = ObjectId::new();
        self.context
            .jobs()
            .insert_one(
                JobDocument {
                    id: job_id,
                    invocation_data: invocation_data.to_string(),
                    arguments: arguments.to_string(),
                    created_at: bson::DateTime::from_chrono(created_at),
                    expire_at: Some(expire_at),
                    state_id: None,
                    state_name: None,
                    queue: None,
                    fetched_at: None,
                },
                None,
            )
            .await?;

        if !parameters.is_empty() {
            let documents: Vec<JobParameterDocument> = parameters
                .iter()
                .map(|(name, value)| JobParameterDocument {
                    id: ObjectId::new(),
                    job_id,
                    name: name.clone(),
                    value: Some(value.clone()),
                    expire_at: Some(expire_at),
                })
                .collect();
            self.context
                .job_parameters()
                .insert_many(documents, None)
                .await?;
        }

        debug!(job_id = %job_id, "created job");
        Ok(job_id.to_hex())
    }

    /// Fetch the next job from `queues`, blocking until one arrives or the
    /// token cancels. All queues must resolve to the same provider.
    pub async fn fetch_next_job(
        &self,
        queues: &[String],
        token: &CancellationToken,
    ) -> Result<FetchedJob> {
        if queues.is_empty() {
            return Err(Error::invalid_argument("queues must not be empty"));
        }
        let provider = self.providers.resolve(queues)?;
        provider.job_queue().dequeue(queues, token).await
    }

    /// Upsert a job parameter; a `None` value is stored, not deleted.
    pub async fn set_job_parameter(
        &self,
        job_id: &str,
        name: &str,
        value: Option<&str>,
    ) -> Result<()> {
        let job_id = parse_object_id(job_id)?;
        if name.is_empty() {
            return Err(Error::invalid_argument("name must not be empty"));
        }
        let value = match value {
            Some(value) => Bson::String(value.to_string()),
            None => Bson::Null,
        };
        self.context
            .job_parameters()
            .update_one(
                doc! { "jobId": job_id, "name": name },
                doc! { "$set": { "value": value } },
                UpdateOptions::builder().upsert(true).build(),
            )
            .await?;
        Ok(())
    }

    /// Read one job parameter's value.
    pub async fn get_job_parameter(&self, job_id: &str, name: &str) -> Result<Option<String>> {
        if name.is_empty() {
            return Err(Error::invalid_argument("name must not be empty"));
        }
        let Some(job_id) = parse_object_id_lenient(job_id)? else {
            return Ok(None);
        };
        let parameter = self
            .context
            .job_parameters()
            .find_one(doc! { "jobId": job_id, "name": name }, None)
            .await?;
        Ok(parameter.and_then(|parameter| parameter.value))
    }

    /// Read a job's payload and current state name.
    pub async fn get_job_data(&self, job_id: &str) -> Result<Option<JobData>> {
        let Some(job_id) = parse_object_id_lenient(job_id)? else {
            return Ok(None);
        };
        let Some(job) = self
            .context
            .jobs()
            .find_one(doc! { "_id": job_id }, None)
            .await?
        else {
            return Ok(None);
        };

        let load_exception = serde_json::from_str::<serde_json::Value>(&job.invocation_data)
            .err()
            .map(|error| format!("invocation payload could not be parsed: {error}"));

        Ok(Some(JobData {
            invocation_data: job.invocation_data,
            arguments: job.arguments,
            state_name: job.state_name,
            created_at: job.created_at.to_chrono(),
            load_exception,
        }))
    }

    /// Read the job's current state, if it has one.
    pub async fn get_state_data(&self, job_id: &str) -> Result<Option<StateData>> {
        let Some(job_id) = parse_object_id_lenient(job_id)? else {
            return Ok(None);
        };
        let Some(job) = self
            .context
            .jobs()
            .find_one(doc! { "_id": job_id }, None)
            .await?
        else {
            return Ok(None);
        };
        let Some(state_id) = job.state_id else {
            return Ok(None);
        };
        let Some(state) = self
            .context
            .states()
            .find_one(doc! { "_id": state_id }, None)
            .await?
        else {
            return Ok(None);
        };

        let (data, load_exception) = match serde_json::from_str::<HashMap<String, String>>(&state.data)
        {
            Ok(data) => (data, None),
            Err(error) => (
                HashMap::new(),
                Some(format!("state data could not be parsed: {error}")),
            ),
        };

        Ok(Some(StateData {
            name: state.name,
            reason: state.reason,
            data,
            load_exception,
        }))
    }

    // ── server registry ─────────────────────────────────────────────────

    /// Register or refresh a processing server. Insertion records
    /// `started_at`; every call refreshes the heartbeat.
    pub async fn announce_server(
        &self,
        server_id: &str,
        worker_count: i32,
        queues: &[String],
    ) -> Result<()> {
        if server_id.is_empty() {
            return Err(Error::invalid_argument("server_id must not be empty"));
        }
        let now = bson::DateTime::from_chrono(self.context.server_time().await?);
        self.context
            .servers()
            .update_one(
                doc! { "_id": server_id },
                doc! {
                    "$set": {
                        "workerCount": worker_count,
                        "queues": queues,
                        "lastHeartbeat": now,
                    },
                    "$setOnInsert": { "startedAt": now },
                },
                UpdateOptions::builder().upsert(true).build(),
            )
            .await?;
        debug!(server_id, worker_count, "server announced");
        Ok(())
    }

    /// Refresh only the server's heartbeat timestamp.
    pub async fn server_heartbeat(&self, server_id: &str) -> Result<()> {
        if server_id.is_empty() {
            return Err(Error::invalid_argument("server_id must not be empty"));
        }
        let now = bson::DateTime::from_chrono(self.context.server_time().await?);
        self.context
            .servers()
            .update_one(
                doc! { "_id": server_id },
                doc! { "$set": { "lastHeartbeat": now } },
                None,
            )
            .await?;
        Ok(())
    }

    /// Remove one server registration.
    pub async fn remove_server(&self, server_id: &str) -> Result<()> {
        if server_id.is_empty() {
            return Err(Error::invalid_argument("server_id must not be empty"));
        }
        self.context
            .servers()
            .delete_one(doc! { "_id": server_id }, None)
            .await?;
        Ok(())
    }

    /// Delete servers whose heartbeat is older than `timeout` before
    /// server-now. Returns how many were removed.
    pub async fn remove_timed_out_servers(&self, timeout: ChronoDuration) -> Result<u64> {
        if timeout < ChronoDuration::zero() {
            return Err(Error::invalid_argument("timeout must not be negative"));
        }
        let cutoff = self.context.server_time().await? - timeout;
        let outcome = self
            .context
            .servers()
            .delete_many(
                doc! { "lastHeartbeat": { "$lt": bson::DateTime::from_chrono(cutoff) } },
                None,
            )
            .await?;
        if outcome.deleted_count > 0 {
            debug!(removed = outcome.deleted_count, "removed timed-out servers");
        }
        Ok(outcome.deleted_count)
    }

    /// All registered servers.
    pub async fn servers(&self) -> Result<Vec<ServerDocument>> {
        let cursor = self.context.servers().find(doc! {}, None).await?;
        Ok(cursor.try_collect().await?)
    }

    // ── sets ────────────────────────────────────────────────────────────

    /// Every member of the set, in insertion order.
    pub async fn get_all_items_from_set(&self, key: &str) -> Result<Vec<String>> {
        let key = required(key)?;
        let cursor = self
            .context
            .sets()
            .find(
                doc! { "key": key },
                FindOptions::builder().sort(doc! { "_id": 1 }).build(),
            )
            .await?;
        let documents: Vec<_> = cursor.try_collect().await?;
        Ok(documents.into_iter().map(|member| member.value).collect())
    }

    pub async fn get_set_count(&self, key: &str) -> Result<u64> {
        let key = required(key)?;
        Ok(self
            .context
            .sets()
            .count_documents(doc! { "key": key }, None)
            .await?)
    }

    /// Members at indices `[starting_from, ending_at]`, inclusive on both
    /// ends, in insertion order.
    pub async fn get_range_from_set(
        &self,
        key: &str,
        starting_from: i64,
        ending_at: i64,
    ) -> Result<Vec<String>> {
        let key = required(key)?;
        if ending_at < starting_from {
            return Err(Error::invalid_argument(
                "ending_at must not be less than starting_from",
            ));
        }
        let cursor = self
            .context
            .sets()
            .find(
                doc! { "key": key },
                FindOptions::builder()
                    .sort(doc! { "_id": 1 })
                    .skip(starting_from.max(0) as u64)
                    .limit(ending_at - starting_from + 1)
                    .build(),
            )
            .await?;
        let documents: Vec<_> = cursor.try_collect().await?;
        Ok(documents.into_iter().map(|member| member.value).collect())
    }

    /// The member with the lowest score within `[from_score, to_score]`.
    pub async fn get_first_by_lowest_score_from_set(
        &self,
        key: &str,
        from_score: f64,
        to_score: f64,
    ) -> Result<Option<String>> {
        let key = required(key)?;
        if to_score < from_score {
            return Err(Error::invalid_argument(
                "to_score must not be less than from_score",
            ));
        }
        let member = self
            .context
            .sets()
            .find_one(
                doc! { "key": key, "score": { "$gte": from_score, "$lte": to_score } },
                FindOneOptions::builder().sort(doc! { "score": 1 }).build(),
            )
            .await?;
        Ok(member.map(|member| member.value))
    }

    /// Remaining time to live of the set, or a negative duration when no
    /// member carries an expiry.
    pub async fn get_set_ttl(&self, key: &str) -> Result<ChronoDuration> {
        let key = required(key)?;
        self.ttl_of(self.context.sets().clone_with_type::<Document>(), key)
            .await
    }

    // ── hashes ──────────────────────────────────────────────────────────

    /// Bulk-upsert hash fields outside a transaction.
    pub async fn set_range_in_hash(&self, key: &str, pairs: &[(String, String)]) -> Result<()> {
        let key = required(key)?;
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
        Ok(())
    }

    /// Every field of the hash, or `None` when the hash does not exist.
    pub async fn get_all_entries_from_hash(
        &self,
        key: &str,
    ) -> Result<Option<HashMap<String, String>>> {
        let key = required(key)?;
        let cursor = self.context.hashes().find(doc! { "key": key }, None).await?;
        let documents: Vec<_> = cursor.try_collect().await?;
        if documents.is_empty() {
            return Ok(None);
        }
        Ok(Some(
            documents
                .into_iter()
                .map(|entry| (entry.field, entry.value))
                .collect(),
        ))
    }

    pub async fn get_hash_count(&self, key: &str) -> Result<u64> {
        let key = required(key)?;
        Ok(self
            .context
            .hashes()
            .count_documents(doc! { "key": key }, None)
            .await?)
    }

    pub async fn get_hash_ttl(&self, key: &str) -> Result<ChronoDuration> {
        let key = required(key)?;
        self.ttl_of(self.context.hashes().clone_with_type::<Document>(), key)
            .await
    }

    /// One field's value.
    pub async fn get_value_from_hash(&self, key: &str, field: &str) -> Result<Option<String>> {
        let key = required(key)?;
        if field.is_empty() {
            return Err(Error::invalid_argument("field must not be empty"));
        }
        let entry = self
            .context
            .hashes()
            .find_one(doc! { "key": key, "field": field }, None)
            .await?;
        Ok(entry.map(|entry| entry.value))
    }

    // ── lists ───────────────────────────────────────────────────────────

    pub async fn get_list_count(&self, key: &str) -> Result<u64> {
        let key = required(key)?;
        Ok(self
            .context
            .lists()
            .count_documents(doc! { "key": key }, None)
            .await?)
    }

    pub async fn get_list_ttl(&self, key: &str) -> Result<ChronoDuration> {
        let key = required(key)?;
        self.ttl_of(self.context.lists().clone_with_type::<Document>(), key)
            .await
    }

    /// Elements at indices `[starting_from, ending_at]` of the newest-first
    /// ordering, inclusive on both ends.
    pub async fn get_range_from_list(
        &self,
        key: &str,
        starting_from: i64,
        ending_at: i64,
    ) -> Result<Vec<String>> {
        let key = required(key)?;
        if ending_at < starting_from {
            return Ok(Vec::new());
        }
        let cursor = self
            .context
            .lists()
            .find(
                doc! { "key": key },
                FindOptions::builder()
                    .sort(doc! { "_id": -1 })
                    .skip(starting_from.max(0) as u64)
                    .limit(ending_at - starting_from + 1)
                    .build(),
            )
            .await?;
        let documents: Vec<_> = cursor.try_collect().await?;
        Ok(documents.into_iter().map(|element| element.value).collect())
    }

    /// Every element, newest first.
    pub async fn get_all_items_from_list(&self, key: &str) -> Result<Vec<String>> {
        let key = required(key)?;
        let cursor = self
            .context
            .lists()
            .find(
                doc! { "key": key },
                FindOptions::builder().sort(doc! { "_id": -1 }).build(),
            )
            .await?;
        let documents: Vec<_> = cursor.try_collect().await?;
        Ok(documents.into_iter().map(|element| element.value).collect())
    }

    // ── counters ────────────────────────────────────────────────────────

    /// Current value of a counter: raw rows plus the aggregated row.
    pub async fn get_counter(&self, key: &str) -> Result<i64> {
        let key = required(key)?;
        let pipeline = vec![
            doc! { "$match": { "key": key } },
            doc! { "$group": { "_id": Bson::Null, "total": { "$sum": "$value" } } },
        ];
        let mut cursor = self.context.counters().aggregate(pipeline, None).await?;
        let raw = match cursor.try_next().await? {
            Some(group) => bson_i64(group.get("total")),
            None => 0,
        };

        let aggregated = self
            .context
            .aggregated_counters()
            .find_one(doc! { "key": key }, None)
            .await?
            .map(|row| row.value)
            .unwrap_or(0);

        Ok(raw + aggregated)
    }

    /// Minimum `expireAt` across documents under `key`, as an offset from
    /// server-now; negative when nothing expires.
    async fn ttl_of(
        &self,
        collection: mongodb::Collection<Document>,
        key: &str,
    ) -> Result<ChronoDuration> {
        let earliest = collection
            .find_one(
                doc! { "key": key, "expireAt": { "$ne": Bson::Null } },
                FindOneOptions::builder()
                    .sort(doc! { "expireAt": 1 })
                    .projection(doc! { "expireAt": 1 })
                    .build(),
            )
            .await?;
        let Some(earliest) = earliest else {
            return Ok(ChronoDuration::milliseconds(-1));
        };
        let Ok(expire_at) = earliest.get_datetime("expireAt") else {
            return Ok(ChronoDuration::milliseconds(-1));
        };
        let now = self.context.server_time().await?;
        Ok(expire_at.to_chrono() - now)
    }
}

fn required(key: &str) -> Result<&str> {
    if key.is_empty() {
        return Err(Error::invalid_argument("key must not be empty"));
    }
    Ok(key)
}

fn parse_object_id(job_id: &str) -> Result<ObjectId> {
    if job_id.is_empty() {
        return Err(Error::invalid_argument("job_id must not be empty"));
    }
    ObjectId::parse_str(job_id)
        .map_err(|_| Error::invalid_argument(format!("job_id {job_id:?} is not a valid id")))
}

/// Empty ids are rejected; well-formed-but-unknown ids read as absent so
/// the dashboard can render stale links without failing.
fn parse_object_id_lenient(job_id: &str) -> Result<Option<ObjectId>> {
    if job_id.is_empty() {
        return Err(Error::invalid_argument("job_id must not be empty"));
    }
    Ok(ObjectId::parse_str(job_id).ok())
}

pub(crate) fn bson_i64(value: Option<&Bson>) -> i64 {
    match value {
        Some(Bson::Int64(value)) => *value,
        Some(Bson::Int32(value)) => i64::from(*value),
        Some(Bson::Double(value)) => *value as i64,
        _ => 0,
    }
}
