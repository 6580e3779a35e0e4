//! Read-only projections for dashboards.

use bson::{doc, Bson, Document};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::TryStreamExt;
use mongodb::options::FindOptions;
use std::collections::HashMap;
use std::sync::Arc;

use crate::connection::bson_i64;
use crate::db::DbContext;
use crate::documents::JobDocument;
use crate::error::{Error, Result};

/// Well-known state labels the dashboard groups by. The storage layer
/// otherwise treats state names as opaque strings.
pub mod states {
    pub const ENQUEUED: &str = "Enqueued";
    pub const SCHEDULED: &str = "Scheduled";
    pub const PROCESSING: &str = "Processing";
    pub const SUCCEEDED: &str = "Succeeded";
    pub const FAILED: &str = "Failed";
    pub const DELETED: &str = "Deleted";
}

/// How many jobs a queue overview carries along with its counts.
const FIRST_JOBS_PER_QUEUE: i64 = 5;

/// One row of a job page.
#[derive(Debug, Clone)]
pub struct JobOverview {
    pub id: String,
    pub invocation_data: String,
    pub arguments: String,
    pub state_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub fetched_at: Option<DateTime<Utc>>,
}

/// A queue with its counts and a peek at the head of the line.
#[derive(Debug, Clone)]
pub struct QueueOverview {
    pub name: String,
    pub enqueued_count: u64,
    pub fetched_count: u64,
    pub first_jobs: Vec<JobOverview>,
}

/// Full detail view of one job.
#[derive(Debug, Clone)]
pub struct JobDetails {
    pub id: String,
    pub invocation_data: String,
    pub arguments: String,
    pub created_at: DateTime<Utc>,
    pub expire_at: Option<DateTime<Utc>>,
    pub parameters: HashMap<String, Option<String>>,
    pub history: Vec<StateHistoryEntry>,
}

/// One entry of a job's state history, oldest first.
#[derive(Debug, Clone)]
pub struct StateHistoryEntry {
    pub name: String,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub data: HashMap<String, String>,
}

/// Snapshot of global storage statistics.
#[derive(Debug, Clone, Default)]
pub struct Statistics {
    pub enqueued: u64,
    pub scheduled: u64,
    pub processing: u64,
    pub failed: u64,
    pub succeeded: i64,
    pub deleted: i64,
    pub servers: u64,
    pub recurring_jobs: u64,
    pub queues: u64,
}

/// Read-only monitoring queries. Everything here tolerates concurrent
/// writers: pages may observe partially committed transactions.
pub struct MonitoringApi {
    context: Arc<DbContext>,
}

impl MonitoringApi {
    pub(crate) fn new(context: Arc<DbContext>) -> Self {
        Self { context }
    }

    // ── queues ──────────────────────────────────────────────────────────

    /// Every queue with jobs in it, with counts and the first few enqueued
    /// jobs.
    pub async fn queues(&self) -> Result<Vec<QueueOverview>> {
        let names = self
            .context
            .jobs()
            .distinct("queue", doc! { "queue": { "$ne": Bson::Null } }, None)
            .await?;

        let mut queues = Vec::with_capacity(names.len());
        for name in names {
            let Bson::String(name) = name else { continue };
            queues.push(QueueOverview {
                enqueued_count: self.enqueued_count(&name).await?,
                fetched_count: self.fetched_count(&name).await?,
                first_jobs: self.enqueued_jobs(&name, 0, FIRST_JOBS_PER_QUEUE).await?,
                name,
            });
        }
        Ok(queues)
    }

    /// Jobs waiting in `queue`, oldest first.
    pub async fn enqueued_jobs(&self, queue: &str, from: i64, count: i64) -> Result<Vec<JobOverview>> {
        self.job_page(
            doc! { "queue": queue, "fetchedAt": Bson::Null },
            doc! { "_id": 1 },
            from,
            count,
        )
        .await
    }

    /// Jobs currently fetched from `queue`, oldest fetch first.
    pub async fn fetched_jobs(&self, queue: &str, from: i64, count: i64) -> Result<Vec<JobOverview>> {
        self.job_page(
            doc! { "queue": queue, "fetchedAt": { "$ne": Bson::Null } },
            doc! { "_id": 1 },
            from,
            count,
        )
        .await
    }

    pub async fn enqueued_count(&self, queue: &str) -> Result<u64> {
        Ok(self
            .context
            .jobs()
            .count_documents(doc! { "queue": queue, "fetchedAt": Bson::Null }, None)
            .await?)
    }

    pub async fn fetched_count(&self, queue: &str) -> Result<u64> {
        Ok(self
            .context
            .jobs()
            .count_documents(
                doc! { "queue": queue, "fetchedAt": { "$ne": Bson::Null } },
                None,
            )
            .await?)
    }

    // ── jobs by state ───────────────────────────────────────────────────

    /// A page of jobs in `state_name`, most recently created first.
    pub async fn jobs_by_state(
        &self,
        state_name: &str,
        from: i64,
        count: i64,
    ) -> Result<Vec<JobOverview>> {
        self.job_page(doc! { "stateName": state_name }, doc! { "_id": -1 }, from, count)
            .await
    }

    /// Number of jobs currently in `state_name`.
    pub async fn state_count(&self, state_name: &str) -> Result<u64> {
        Ok(self
            .context
            .jobs()
            .count_documents(doc! { "stateName": state_name }, None)
            .await?)
    }

    /// Payload, parameters, and full state history for one job.
    pub async fn job_details(&self, job_id: &str) -> Result<Option<JobDetails>> {
        let Ok(job_id) = bson::oid::ObjectId::parse_str(job_id) else {
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

        let cursor = self
            .context
            .job_parameters()
            .find(doc! { "jobId": job_id }, None)
            .await?;
        let parameters: HashMap<String, Option<String>> = cursor
            .try_collect::<Vec<_>>()
            .await?
            .into_iter()
            .map(|parameter| (parameter.name, parameter.value))
            .collect();

        let cursor = self
            .context
            .states()
            .find(
                doc! { "jobId": job_id },
                FindOptions::builder().sort(doc! { "createdAt": 1 }).build(),
            )
            .await?;
        let history = cursor
            .try_collect::<Vec<_>>()
            .await?
            .into_iter()
            .map(|state| StateHistoryEntry {
                name: state.name,
                reason: state.reason,
                created_at: state.created_at.to_chrono(),
                data: serde_json::from_str(&state.data).unwrap_or_default(),
            })
            .collect();

        Ok(Some(JobDetails {
            id: job.id.to_hex(),
            invocation_data: job.invocation_data,
            arguments: job.arguments,
            created_at: job.created_at.to_chrono(),
            expire_at: job.expire_at.map(|stamp| stamp.to_chrono()),
            parameters,
            history,
        }))
    }

    // ── timelines ───────────────────────────────────────────────────────

    /// Succeeded-job counts per day over the trailing week.
    pub async fn succeeded_by_dates_count(&self) -> Result<HashMap<String, i64>> {
        self.daily_timeline("succeeded").await
    }

    /// Failed-job counts per day over the trailing week.
    pub async fn failed_by_dates_count(&self) -> Result<HashMap<String, i64>> {
        self.daily_timeline("failed").await
    }

    /// Succeeded-job counts per hour over the trailing day.
    pub async fn hourly_succeeded_jobs(&self) -> Result<HashMap<String, i64>> {
        self.hourly_timeline("succeeded").await
    }

    /// Failed-job counts per hour over the trailing day.
    pub async fn hourly_failed_jobs(&self) -> Result<HashMap<String, i64>> {
        self.hourly_timeline("failed").await
    }

    async fn daily_timeline(&self, counter_type: &str) -> Result<HashMap<String, i64>> {
        let now = self.context.server_time().await?;
        let keys: Vec<String> = (0..7)
            .map(|days_ago| daily_key(counter_type, now - ChronoDuration::days(days_ago)))
            .collect();
        self.sum_counters_by_key(&keys).await
    }

    async fn hourly_timeline(&self, counter_type: &str) -> Result<HashMap<String, i64>> {
        let now = self.context.server_time().await?;
        let keys: Vec<String> = (0..24)
            .map(|hours_ago| hourly_key(counter_type, now - ChronoDuration::hours(hours_ago)))
            .collect();
        self.sum_counters_by_key(&keys).await
    }

    /// Sum raw and aggregated counter values for each key; keys with no
    /// rows report zero.
    async fn sum_counters_by_key(&self, keys: &[String]) -> Result<HashMap<String, i64>> {
        let mut totals: HashMap<String, i64> = keys.iter().map(|key| (key.clone(), 0)).collect();

        let pipeline = vec![
            doc! { "$match": { "key": { "$in": keys } } },
            doc! { "$group": { "_id": "$key", "total": { "$sum": "$value" } } },
        ];
        for collection in [
            self.context.counters().clone_with_type::<Document>(),
            self.context.aggregated_counters().clone_with_type::<Document>(),
        ] {
            let mut cursor = collection.aggregate(pipeline.clone(), None).await?;
            while let Some(group) = cursor.try_next().await? {
                if let Ok(key) = group.get_str("_id") {
                    *totals.entry(key.to_string()).or_default() += bson_i64(group.get("total"));
                }
            }
        }
        Ok(totals)
    }

    // ── statistics ──────────────────────────────────────────────────────

    /// Global counts for the dashboard's front page.
    pub async fn get_statistics(&self) -> Result<Statistics> {
        let mut statistics = Statistics::default();

        let pipeline = vec![
            doc! { "$match": { "stateName": { "$ne": Bson::Null } } },
            doc! { "$group": { "_id": "$stateName", "count": { "$sum": 1 } } },
        ];
        let mut cursor = self
            .context
            .jobs()
            .clone_with_type::<Document>()
            .aggregate(pipeline, None)
            .await?;
        while let Some(group) = cursor.try_next().await? {
            let count = bson_i64(group.get("count")) as u64;
            match group.get_str("_id") {
                Ok(states::ENQUEUED) => statistics.enqueued = count,
                Ok(states::SCHEDULED) => statistics.scheduled = count,
                Ok(states::PROCESSING) => statistics.processing = count,
                Ok(states::FAILED) => statistics.failed = count,
                _ => {}
            }
        }

        statistics.succeeded = self.counter_total("stats:succeeded").await?;
        statistics.deleted = self.counter_total("stats:deleted").await?;
        statistics.servers = self.context.servers().count_documents(doc! {}, None).await?;
        statistics.recurring_jobs = self
            .context
            .sets()
            .count_documents(doc! { "key": "recurring-jobs" }, None)
            .await?;
        statistics.queues = self
            .context
            .jobs()
            .distinct("queue", doc! { "queue": { "$ne": Bson::Null } }, None)
            .await?
            .len() as u64;

        Ok(statistics)
    }

    async fn counter_total(&self, key: &str) -> Result<i64> {
        let totals = self.sum_counters_by_key(&[key.to_string()]).await?;
        Ok(totals.get(key).copied().unwrap_or(0))
    }

    async fn job_page(
        &self,
        filter: Document,
        sort: Document,
        from: i64,
        count: i64,
    ) -> Result<Vec<JobOverview>> {
        if from < 0 || count < 0 {
            return Err(Error::invalid_argument(
                "page offsets and counts must not be negative",
            ));
        }
        let cursor = self
            .context
            .jobs()
            .find(
                filter,
                FindOptions::builder()
                    .sort(sort)
                    .skip(from as u64)
                    .limit(count)
                    .build(),
            )
            .await?;
        let jobs: Vec<JobDocument> = cursor.try_collect().await?;
        Ok(jobs.into_iter().map(overview).collect())
    }
}

fn overview(job: JobDocument) -> JobOverview {
    JobOverview {
        id: job.id.to_hex(),
        invocation_data: job.invocation_data,
        arguments: job.arguments,
        state_name: job.state_name,
        created_at: job.created_at.to_chrono(),
        fetched_at: job.fetched_at.map(|stamp| stamp.to_chrono()),
    }
}

/// Counter key for one day's statistics, e.g. `stats:succeeded:2024-03-07`.
fn daily_key(counter_type: &str, day: DateTime<Utc>) -> String {
    format!("stats:{}:{}", counter_type, day.format("%Y-%m-%d"))
}

/// Counter key for one hour's statistics, e.g.
/// `stats:succeeded:2024-03-07-13`.
fn hourly_key(counter_type: &str, hour: DateTime<Utc>) -> String {
    format!("stats:{}:{}", counter_type, hour.format("%Y-%m-%d-%H"))
}
