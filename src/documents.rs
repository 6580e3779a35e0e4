//! BSON documents for every collection in the storage schema.
//!
//! Field names follow the wire format (camelCase). Timestamps are stored
//! as BSON datetimes; conversion to and from `chrono` happens at the API
//! edge. `expire_at` is the hook for the TTL indexes: application code
//! sets or clears it but never deletes expired rows itself.

use bson::oid::ObjectId;
use bson::DateTime;
use serde::{Deserialize, Serialize};

/// A background job. Queue membership lives directly on the document:
/// `queue` names the queue (if any) and `fetched_at` is set while a worker
/// owns the job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDocument {
    #[serde(rename = "_id")]
    pub id: ObjectId,
    pub invocation_data: String,
    pub arguments: String,
    pub created_at: DateTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expire_at: Option<DateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_id: Option<ObjectId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fetched_at: Option<DateTime>,
}

/// A named job parameter, unique per `(jobId, name)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobParameterDocument {
    #[serde(rename = "_id")]
    pub id: ObjectId,
    pub job_id: ObjectId,
    pub name: String,
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expire_at: Option<DateTime>,
}

/// One entry in a job's append-only state history. `data` holds a
/// string-to-string map serialized as JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateDocument {
    #[serde(rename = "_id")]
    pub id: ObjectId,
    pub job_id: ObjectId,
    pub name: String,
    #[serde(default)]
    pub reason: Option<String>,
    pub created_at: DateTime,
    pub data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expire_at: Option<DateTime>,
}

/// A scored set member, unique per `(key, value)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetDocument {
    #[serde(rename = "_id")]
    pub id: ObjectId,
    pub key: String,
    pub value: String,
    pub score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expire_at: Option<DateTime>,
}

/// A hash field, unique per `(key, field)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HashDocument {
    #[serde(rename = "_id")]
    pub id: ObjectId,
    pub key: String,
    pub field: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expire_at: Option<DateTime>,
}

/// A list element; insertion order is the `_id` order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListDocument {
    #[serde(rename = "_id")]
    pub id: ObjectId,
    pub key: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expire_at: Option<DateTime>,
}

/// A raw ±1 counter row. Rows are append-only; the aggregator rolls them
/// up and deletes them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CounterDocument {
    #[serde(rename = "_id")]
    pub id: ObjectId,
    pub key: String,
    pub value: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expire_at: Option<DateTime>,
}

/// The rolled-up sum for a counter key. `expire_at` only ever grows: the
/// aggregator merges with `$max`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedCounterDocument {
    #[serde(rename = "_id")]
    pub id: ObjectId,
    pub key: String,
    pub value: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expire_at: Option<DateTime>,
}

/// A processing server's registration, keyed by its self-assigned id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerDocument {
    #[serde(rename = "_id")]
    pub id: String,
    pub worker_count: i32,
    pub queues: Vec<String>,
    pub started_at: DateTime,
    pub last_heartbeat: DateTime,
}

/// A distributed lock document, keyed by resource name. Existence means
/// some process claims ownership; `expire_at` bounds how long a crashed
/// owner can hold the resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockDocument {
    #[serde(rename = "_id")]
    pub resource: String,
    pub owner: String,
    pub expire_at: DateTime,
}

/// The single schema-version marker document.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SchemaDocument {
    #[serde(rename = "_id")]
    pub id: ObjectId,
    pub version: i32,
}
