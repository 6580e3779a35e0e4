//! Schema version gate and index bootstrap.

use bson::{doc, Document};
use mongodb::error::ErrorKind;
use mongodb::options::{IndexOptions, UpdateOptions};
use mongodb::{Collection, IndexModel};
use std::time::Duration;
use tracing::{debug, info};

use crate::db::DbContext;
use crate::error::{Error, Result};

/// Schema version this build reads and writes.
pub const SCHEMA_VERSION: i32 = 6;

/// Upsert the schema marker, refusing to run against a newer database.
pub(crate) async fn ensure_schema(context: &DbContext) -> Result<()> {
    let schema = context.schema();

    if let Some(marker) = schema.find_one(doc! {}, None).await? {
        if marker.version > SCHEMA_VERSION {
            return Err(Error::UnsupportedSchema {
                found: marker.version,
                required: SCHEMA_VERSION,
            });
        }
        if marker.version == SCHEMA_VERSION {
            return Ok(());
        }
        info!(
            from = marker.version,
            to = SCHEMA_VERSION,
            "upgrading schema marker"
        );
    }

    schema
        .update_one(
            doc! {},
            doc! { "$set": { "version": SCHEMA_VERSION } },
            UpdateOptions::builder().upsert(true).build(),
        )
        .await?;
    Ok(())
}

/// Create every required index. Safe to call on every startup.
pub(crate) async fn ensure_indexes(context: &DbContext) -> Result<()> {
    // Jobs: queue polling, dashboard state pages, TTL.
    ensure_index(
        &context.jobs(),
        doc! { "queue": 1, "fetchedAt": 1 },
        IndexOptions::builder()
            .name("queue_fetched_at".to_string())
            .sparse(true)
            .build(),
    )
    .await?;
    ensure_index(
        &context.jobs(),
        doc! { "stateName": 1, "_id": 1 },
        named("state_name_id"),
    )
    .await?;
    ensure_ttl(&context.jobs()).await?;

    // Job parameters: point lookups by (jobId, name), TTL.
    ensure_index(
        &context.job_parameters(),
        doc! { "jobId": 1, "name": 1 },
        IndexOptions::builder()
            .name("job_id_name_unique".to_string())
            .unique(true)
            .build(),
    )
    .await?;
    ensure_ttl(&context.job_parameters()).await?;

    // States: history reads per job, TTL.
    ensure_index(
        &context.states(),
        doc! { "jobId": 1, "createdAt": 1 },
        named("job_id_created_at"),
    )
    .await?;
    ensure_ttl(&context.states()).await?;

    // Sets: key scans plus member uniqueness, TTL.
    ensure_index(&context.sets(), doc! { "key": 1 }, named("key")).await?;
    ensure_index(
        &context.sets(),
        doc! { "key": 1, "value": 1 },
        IndexOptions::builder()
            .name("key_value_unique".to_string())
            .unique(true)
            .build(),
    )
    .await?;
    ensure_ttl(&context.sets()).await?;

    // Hashes: field uniqueness per key, TTL.
    ensure_index(
        &context.hashes(),
        doc! { "key": 1, "field": 1 },
        IndexOptions::builder()
            .name("key_field_unique".to_string())
            .unique(true)
            .build(),
    )
    .await?;
    ensure_ttl(&context.hashes()).await?;

    // Lists and counters: key scans, TTL.
    ensure_index(&context.lists(), doc! { "key": 1 }, named("key")).await?;
    ensure_ttl(&context.lists()).await?;
    ensure_index(&context.counters(), doc! { "key": 1 }, named("key")).await?;
    ensure_ttl(&context.counters()).await?;
    ensure_index(
        &context.aggregated_counters(),
        doc! { "key": 1 },
        IndexOptions::builder()
            .name("key_unique".to_string())
            .unique(true)
            .build(),
    )
    .await?;
    ensure_ttl(&context.aggregated_counters()).await?;

    // Servers: timeout sweeps scan by heartbeat.
    ensure_index(
        &context.servers(),
        doc! { "lastHeartbeat": 1 },
        named("last_heartbeat"),
    )
    .await?;

    // Locks: TTL is the recovery path for crashed owners.
    ensure_ttl(&context.locks()).await?;

    Ok(())
}

fn named(name: &str) -> IndexOptions {
    IndexOptions::builder().name(name.to_string()).build()
}

/// TTL index on `expireAt`; the server evicts documents once the stamp
/// passes.
async fn ensure_ttl<T>(collection: &Collection<T>) -> Result<()> {
    ensure_index(
        collection,
        doc! { "expireAt": 1 },
        IndexOptions::builder()
            .name("ttl_expire_at".to_string())
            .expire_after(Duration::from_secs(0))
            .build(),
    )
    .await
}

/// Create one index, dropping and recreating it when an index of the same
/// name exists with different options (server codes 85/86).
async fn ensure_index<T>(
    collection: &Collection<T>,
    keys: Document,
    options: IndexOptions,
) -> Result<()> {
    let name = options.name.clone();
    let model = IndexModel::builder()
        .keys(keys.clone())
        .options(options.clone())
        .build();

    match collection.create_index(model, None).await {
        Ok(_) => Ok(()),
        Err(error) if is_index_conflict(&error) => {
            let name = name.unwrap_or_default();
            debug!(
                collection = collection.name(),
                index = %name,
                "index exists with different options, recreating"
            );
            collection.drop_index(name, None).await?;
            let model = IndexModel::builder().keys(keys).options(options).build();
            collection.create_index(model, None).await?;
            Ok(())
        }
        Err(error) => Err(error.into()),
    }
}

fn is_index_conflict(error: &mongodb::error::Error) -> bool {
    matches!(
        *error.kind,
        ErrorKind::Command(ref command) if command.code == 85 || command.code == 86
    )
}
