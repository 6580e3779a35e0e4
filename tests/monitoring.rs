#[allow(dead_code)]
mod helpers;

use std::collections::HashMap;
use std::time::Duration;
use stoker::StateRecord;
use tokio_util::sync::CancellationToken;

async fn job_in_state(connection: &stoker::Connection, state: &str) -> String {
    let job_id = helpers::create_job(connection).await;
    let mut transaction = connection.create_write_transaction();
    transaction
        .set_job_state(
            &job_id,
            StateRecord {
                name: state.to_string(),
                ..StateRecord::default()
            },
        )
        .unwrap();
    transaction.commit().await.unwrap();
    job_id
}

// ── queues ──────────────────────────────────────────────────────────

#[tokio::test]
#[ignore = "requires a running MongoDB (set STOKER_TEST_URI)"]
async fn queue_overview_separates_enqueued_from_fetched() {
    let storage = helpers::storage().await;
    let connection = storage.connection();
    let monitoring = storage.monitoring();

    helpers::create_enqueued_job(&connection, "default").await;
    helpers::create_enqueued_job(&connection, "default").await;
    let fetched = connection
        .fetch_next_job(&["default".to_string()], &CancellationToken::new())
        .await
        .expect("one job should be fetched");

    let queues = monitoring.queues().await.expect("queues read");
    assert_eq!(queues.len(), 1);
    let overview = &queues[0];
    assert_eq!(overview.name, "default");
    assert_eq!(overview.enqueued_count, 1);
    assert_eq!(overview.fetched_count, 1);
    assert_eq!(overview.first_jobs.len(), 1);

    let page = monitoring.fetched_jobs("default", 0, 10).await.unwrap();
    assert_eq!(page.len(), 1);
    assert_eq!(page[0].id, fetched.job_id());
}

// ── state pages ─────────────────────────────────────────────────────

#[tokio::test]
#[ignore = "requires a running MongoDB (set STOKER_TEST_URI)"]
async fn state_pages_are_newest_first_with_pagination() {
    let storage = helpers::storage().await;
    let connection = storage.connection();
    let monitoring = storage.monitoring();

    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.push(job_in_state(&connection, "Failed").await);
    }

    let page = monitoring.jobs_by_state("Failed", 0, 2).await.unwrap();
    assert_eq!(page.len(), 2);
    assert_eq!(page[0].id, ids[2], "most recently created job first");
    assert_eq!(page[1].id, ids[1]);

    let rest = monitoring.jobs_by_state("Failed", 2, 2).await.unwrap();
    assert_eq!(rest.len(), 1);
    assert_eq!(rest[0].id, ids[0]);

    assert_eq!(monitoring.state_count("Failed").await.unwrap(), 3);
    assert_eq!(monitoring.state_count("Succeeded").await.unwrap(), 0);
}

#[tokio::test]
#[ignore = "requires a running MongoDB (set STOKER_TEST_URI)"]
async fn job_details_carry_parameters_and_full_history() {
    let storage = helpers::storage().await;
    let connection = storage.connection();
    let monitoring = storage.monitoring();

    let job_id = connection
        .create_expired_job(
            r#"{"type":"Example","method":"Run"}"#,
            "[]",
            &HashMap::from([("culture".to_string(), "en-US".to_string())]),
            chrono::Utc::now(),
            Duration::from_secs(3600),
        )
        .await
        .unwrap();

    for state in ["Enqueued", "Processing", "Succeeded"] {
        let mut transaction = connection.create_write_transaction();
        transaction
            .set_job_state(
                &job_id,
                StateRecord {
                    name: state.to_string(),
                    ..StateRecord::default()
                },
            )
            .unwrap();
        transaction.commit().await.unwrap();
    }

    let details = monitoring
        .job_details(&job_id)
        .await
        .unwrap()
        .expect("details should exist");
    assert_eq!(
        details.parameters.get("culture"),
        Some(&Some("en-US".to_string()))
    );
    let names: Vec<&str> = details
        .history
        .iter()
        .map(|entry| entry.name.as_str())
        .collect();
    assert_eq!(
        names,
        vec!["Enqueued", "Processing", "Succeeded"],
        "history is append-only, oldest first"
    );

    assert!(monitoring.job_details("not-an-id").await.unwrap().is_none());
}

// ── statistics and timelines ────────────────────────────────────────

#[tokio::test]
#[ignore = "requires a running MongoDB (set STOKER_TEST_URI)"]
async fn statistics_snapshot_counts_states_servers_and_counters() {
    let storage = helpers::storage().await;
    let connection = storage.connection();
    let monitoring = storage.monitoring();

    job_in_state(&connection, "Enqueued").await;
    job_in_state(&connection, "Failed").await;
    job_in_state(&connection, "Processing").await;
    connection
        .announce_server("server-1", 4, &["default".to_string()])
        .await
        .unwrap();

    // Succeeded total comes from counters, raw plus aggregated.
    helpers::insert_counter(&storage, "stats:succeeded", 3, None).await;
    storage
        .context()
        .aggregated_counters()
        .insert_one(
            stoker::documents::AggregatedCounterDocument {
                id: bson::oid::ObjectId::new(),
                key: "stats:succeeded".to_string(),
                value: 7,
                expire_at: None,
            },
            None,
        )
        .await
        .unwrap();

    let statistics = monitoring.get_statistics().await.unwrap();
    assert_eq!(statistics.enqueued, 1);
    assert_eq!(statistics.failed, 1);
    assert_eq!(statistics.processing, 1);
    assert_eq!(statistics.servers, 1);
    assert_eq!(statistics.succeeded, 10);
}

#[tokio::test]
#[ignore = "requires a running MongoDB (set STOKER_TEST_URI)"]
async fn daily_timeline_buckets_span_a_week_and_sum_both_tables() {
    let storage = helpers::storage().await;
    let monitoring = storage.monitoring();

    let today = chrono::Utc::now().format("%Y-%m-%d");
    let key = format!("stats:succeeded:{today}");
    helpers::insert_counter(&storage, &key, 2, None).await;
    storage
        .context()
        .aggregated_counters()
        .insert_one(
            stoker::documents::AggregatedCounterDocument {
                id: bson::oid::ObjectId::new(),
                key: key.clone(),
                value: 5,
                expire_at: None,
            },
            None,
        )
        .await
        .unwrap();

    let timeline = monitoring.succeeded_by_dates_count().await.unwrap();
    assert_eq!(timeline.len(), 7, "one bucket per trailing day");
    assert_eq!(timeline.get(&key).copied(), Some(7));
    assert!(
        timeline.values().filter(|count| **count == 0).count() >= 6,
        "untouched days report zero"
    );
}

#[tokio::test]
#[ignore = "requires a running MongoDB (set STOKER_TEST_URI)"]
async fn hourly_timeline_spans_a_day() {
    let storage = helpers::storage().await;
    let monitoring = storage.monitoring();

    let hour = chrono::Utc::now().format("%Y-%m-%d-%H");
    let key = format!("stats:failed:{hour}");
    helpers::insert_counter(&storage, &key, 4, None).await;

    let timeline = monitoring.hourly_failed_jobs().await.unwrap();
    assert_eq!(timeline.len(), 24, "one bucket per trailing hour");
    assert_eq!(timeline.get(&key).copied(), Some(4));
}
