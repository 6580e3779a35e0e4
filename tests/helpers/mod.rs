use bson::oid::ObjectId;
use std::collections::HashMap;
use std::time::Duration;
use stoker::{Storage, StorageOptions};

/// Connection string for the test MongoDB instance.
///
/// Integration tests are `#[ignore]`d by default; run them with
/// `STOKER_TEST_URI=mongodb://localhost:27017 cargo test -- --ignored`.
pub fn test_uri() -> String {
    std::env::var("STOKER_TEST_URI").unwrap_or_else(|_| "mongodb://localhost:27017".to_string())
}

/// Options tuned for tests: short poll interval so blocked dequeues react
/// quickly, everything else at defaults.
pub fn test_options() -> StorageOptions {
    StorageOptions {
        queue_poll_interval: Duration::from_millis(200),
        ..StorageOptions::default()
    }
}

/// Connect a storage over a uniquely named database so tests never share
/// state.
pub async fn storage() -> Storage {
    storage_with(test_options()).await
}

pub async fn storage_with(options: StorageOptions) -> Storage {
    let database = format!("stoker_test_{}", ObjectId::new().to_hex());
    Storage::connect(&test_uri(), &database, options)
        .await
        .expect("storage should connect and initialize")
}

/// Create a job with a day-long expiry and no parameters, returning its id.
pub async fn create_job(connection: &stoker::Connection) -> String {
    connection
        .create_expired_job(
            r#"{"type":"Example","method":"Run"}"#,
            "[]",
            &HashMap::new(),
            chrono::Utc::now(),
            Duration::from_secs(24 * 60 * 60),
        )
        .await
        .expect("job should be created")
}

/// Create a job and place it on `queue` through a committed transaction.
pub async fn create_enqueued_job(connection: &stoker::Connection, queue: &str) -> String {
    let job_id = create_job(connection).await;
    let mut transaction = connection.create_write_transaction();
    transaction
        .add_to_queue(queue, &job_id)
        .expect("add_to_queue should queue the mutation");
    transaction.commit().await.expect("commit should succeed");
    job_id
}

/// Read a job document straight from the collection.
pub async fn read_job(storage: &Storage, job_id: &str) -> stoker::documents::JobDocument {
    let id = ObjectId::parse_str(job_id).expect("job id is an ObjectId");
    storage
        .context()
        .jobs()
        .find_one(bson::doc! { "_id": id }, None)
        .await
        .expect("job read should succeed")
        .expect("job should exist")
}

/// Backdate a job's fetch stamp, simulating a worker that grabbed it
/// `age` ago and crashed.
pub async fn backdate_fetch(storage: &Storage, job_id: &str, age: chrono::Duration) {
    let id = ObjectId::parse_str(job_id).expect("job id is an ObjectId");
    let stamp = bson::DateTime::from_chrono(chrono::Utc::now() - age);
    storage
        .context()
        .jobs()
        .update_one(
            bson::doc! { "_id": id },
            bson::doc! { "$set": { "fetchedAt": stamp } },
            None,
        )
        .await
        .expect("backdating should succeed");
}

/// Insert a raw counter row directly, bypassing the transaction layer.
pub async fn insert_counter(
    storage: &Storage,
    key: &str,
    value: i64,
    expire_at: Option<chrono::DateTime<chrono::Utc>>,
) {
    storage
        .context()
        .counters()
        .insert_one(
            stoker::documents::CounterDocument {
                id: ObjectId::new(),
                key: key.to_string(),
                value,
                expire_at: expire_at.map(bson::DateTime::from_chrono),
            },
            None,
        )
        .await
        .expect("counter insert should succeed");
}
