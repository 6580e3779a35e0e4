#[allow(dead_code)]
mod helpers;

use chrono::Duration as ChronoDuration;
use std::collections::HashMap;
use std::time::Duration;

// ── jobs and parameters ─────────────────────────────────────────────

#[tokio::test]
#[ignore = "requires a running MongoDB (set STOKER_TEST_URI)"]
async fn create_expired_job_stamps_job_and_parameters() {
    let storage = helpers::storage().await;
    let connection = storage.connection();

    let created_at = chrono::Utc::now();
    let job_id = connection
        .create_expired_job(
            r#"{"type":"Example","method":"Run"}"#,
            r#"["arg"]"#,
            &HashMap::from([
                ("culture".to_string(), "en-US".to_string()),
                ("retry".to_string(), "3".to_string()),
            ]),
            created_at,
            Duration::from_secs(3600),
        )
        .await
        .expect("job should be created");

    let job = helpers::read_job(&storage, &job_id).await;
    let expire_at = job.expire_at.expect("job must carry an expiry").to_chrono();
    let expected = created_at + ChronoDuration::seconds(3600);
    assert!(
        (expire_at - expected).num_seconds().abs() <= 1,
        "expiry is created_at + expire_in"
    );

    assert_eq!(
        connection
            .get_job_parameter(&job_id, "culture")
            .await
            .unwrap()
            .as_deref(),
        Some("en-US")
    );
}

#[tokio::test]
#[ignore = "requires a running MongoDB (set STOKER_TEST_URI)"]
async fn create_expired_job_rejects_empty_payload() {
    let storage = helpers::storage().await;
    let connection = storage.connection();
    let outcome = connection
        .create_expired_job(
            "",
            "[]",
            &HashMap::new(),
            chrono::Utc::now(),
            Duration::from_secs(60),
        )
        .await;
    assert!(matches!(outcome, Err(stoker::Error::InvalidArgument(_))));
}

#[tokio::test]
#[ignore = "requires a running MongoDB (set STOKER_TEST_URI)"]
async fn job_parameters_upsert_and_allow_null_values() {
    let storage = helpers::storage().await;
    let connection = storage.connection();
    let job_id = helpers::create_job(&connection).await;

    connection
        .set_job_parameter(&job_id, "current-culture", Some("en-GB"))
        .await
        .unwrap();
    connection
        .set_job_parameter(&job_id, "current-culture", None)
        .await
        .unwrap();

    assert_eq!(
        connection
            .get_job_parameter(&job_id, "current-culture")
            .await
            .unwrap(),
        None,
        "a null value is stored, not an error"
    );
    assert_eq!(
        connection
            .get_job_parameter(&job_id, "missing")
            .await
            .unwrap(),
        None
    );
}

#[tokio::test]
#[ignore = "requires a running MongoDB (set STOKER_TEST_URI)"]
async fn get_job_data_reports_malformed_payload_as_load_exception() {
    let storage = helpers::storage().await;
    let connection = storage.connection();
    let job_id = connection
        .create_expired_job(
            "{not json",
            "[]",
            &HashMap::new(),
            chrono::Utc::now(),
            Duration::from_secs(60),
        )
        .await
        .expect("payloads are opaque at write time");

    let data = connection
        .get_job_data(&job_id)
        .await
        .expect("read must not fail")
        .expect("job exists");
    assert!(
        data.load_exception.is_some(),
        "parse failure travels in the result"
    );
    assert_eq!(data.invocation_data, "{not json");
}

#[tokio::test]
#[ignore = "requires a running MongoDB (set STOKER_TEST_URI)"]
async fn point_reads_of_unknown_ids_are_absent_not_errors() {
    let storage = helpers::storage().await;
    let connection = storage.connection();

    assert!(connection
        .get_job_data(&bson::oid::ObjectId::new().to_hex())
        .await
        .unwrap()
        .is_none());
    assert!(connection.get_job_data("not-an-object-id").await.unwrap().is_none());
    assert!(connection
        .get_state_data("not-an-object-id")
        .await
        .unwrap()
        .is_none());
}

// ── server registry ─────────────────────────────────────────────────

#[tokio::test]
#[ignore = "requires a running MongoDB (set STOKER_TEST_URI)"]
async fn announce_server_upserts_and_heartbeat_updates_timestamp_only() {
    let storage = helpers::storage().await;
    let connection = storage.connection();

    connection
        .announce_server("server-1", 20, &["default".to_string()])
        .await
        .unwrap();
    let first = connection.servers().await.unwrap();
    assert_eq!(first.len(), 1);
    let started_at = first[0].started_at;

    connection
        .announce_server("server-1", 25, &["default".to_string(), "critical".to_string()])
        .await
        .unwrap();
    let second = connection.servers().await.unwrap();
    assert_eq!(second.len(), 1, "announce upserts by server id");
    assert_eq!(second[0].worker_count, 25);
    assert_eq!(
        second[0].started_at, started_at,
        "startedAt is set on insert only"
    );

    let before_heartbeat = second[0].last_heartbeat;
    tokio::time::sleep(Duration::from_millis(1100)).await;
    connection.server_heartbeat("server-1").await.unwrap();
    let third = connection.servers().await.unwrap();
    assert!(third[0].last_heartbeat > before_heartbeat);
    assert_eq!(third[0].worker_count, 25, "heartbeat leaves data untouched");
}

#[tokio::test]
#[ignore = "requires a running MongoDB (set STOKER_TEST_URI)"]
async fn remove_timed_out_servers_honors_the_cutoff() {
    let storage = helpers::storage().await;
    let connection = storage.connection();

    connection
        .announce_server("fresh", 1, &["default".to_string()])
        .await
        .unwrap();

    // A server whose heartbeat stopped an hour ago.
    storage
        .context()
        .servers()
        .insert_one(
            stoker::documents::ServerDocument {
                id: "stale".to_string(),
                worker_count: 1,
                queues: vec!["default".to_string()],
                started_at: bson::DateTime::from_chrono(
                    chrono::Utc::now() - chrono::Duration::hours(2),
                ),
                last_heartbeat: bson::DateTime::from_chrono(
                    chrono::Utc::now() - chrono::Duration::hours(1),
                ),
            },
            None,
        )
        .await
        .unwrap();

    let removed = connection
        .remove_timed_out_servers(ChronoDuration::minutes(30))
        .await
        .unwrap();
    assert_eq!(removed, 1);

    let remaining = connection.servers().await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, "fresh");
}

#[tokio::test]
#[ignore = "requires a running MongoDB (set STOKER_TEST_URI)"]
async fn remove_timed_out_servers_rejects_negative_timeout() {
    let storage = helpers::storage().await;
    let connection = storage.connection();
    let outcome = connection
        .remove_timed_out_servers(ChronoDuration::seconds(-1))
        .await;
    assert!(matches!(outcome, Err(stoker::Error::InvalidArgument(_))));
}

// ── sets ────────────────────────────────────────────────────────────

#[tokio::test]
#[ignore = "requires a running MongoDB (set STOKER_TEST_URI)"]
async fn set_range_is_inclusive_on_both_ends() {
    let storage = helpers::storage().await;
    let connection = storage.connection();

    let mut transaction = connection.create_write_transaction();
    for value in ["0", "1", "2", "3", "4", "5"] {
        transaction.add_to_set("range", value, 0.0).unwrap();
    }
    transaction.commit().await.unwrap();

    let range = connection.get_range_from_set("range", 2, 3).await.unwrap();
    assert_eq!(range, vec!["2".to_string(), "3".to_string()]);

    let inverted = connection.get_range_from_set("range", 3, 2).await;
    assert!(matches!(inverted, Err(stoker::Error::InvalidArgument(_))));
}

#[tokio::test]
#[ignore = "requires a running MongoDB (set STOKER_TEST_URI)"]
async fn lowest_score_read_rejects_inverted_bounds() {
    let storage = helpers::storage().await;
    let connection = storage.connection();
    let outcome = connection
        .get_first_by_lowest_score_from_set("any", 2.0, 1.0)
        .await;
    assert!(matches!(outcome, Err(stoker::Error::InvalidArgument(_))));
}

#[tokio::test]
#[ignore = "requires a running MongoDB (set STOKER_TEST_URI)"]
async fn ttl_reads_use_a_negative_sentinel_without_expiry() {
    let storage = helpers::storage().await;
    let connection = storage.connection();

    let mut transaction = connection.create_write_transaction();
    transaction.add_to_set("persistent", "member", 0.0).unwrap();
    transaction.commit().await.unwrap();

    let ttl = connection.get_set_ttl("persistent").await.unwrap();
    assert!(ttl < ChronoDuration::zero(), "no expiry reads negative");

    let mut transaction = connection.create_write_transaction();
    transaction
        .expire_set("persistent", Duration::from_secs(3600))
        .unwrap();
    transaction.commit().await.unwrap();

    let ttl = connection.get_set_ttl("persistent").await.unwrap();
    assert!(ttl > ChronoDuration::minutes(55));
    assert!(ttl <= ChronoDuration::hours(1));
}

// ── lists ───────────────────────────────────────────────────────────

#[tokio::test]
#[ignore = "requires a running MongoDB (set STOKER_TEST_URI)"]
async fn list_reads_are_newest_first_and_ranges_inclusive() {
    let storage = helpers::storage().await;
    let connection = storage.connection();

    let mut transaction = connection.create_write_transaction();
    for value in ["0", "1", "2", "3"] {
        transaction.insert_to_list("history", value).unwrap();
    }
    transaction.commit().await.unwrap();

    let all = connection.get_all_items_from_list("history").await.unwrap();
    assert_eq!(all, vec!["3", "2", "1", "0"]);

    let range = connection.get_range_from_list("history", 1, 2).await.unwrap();
    assert_eq!(range, vec!["2", "1"]);
}

// ── counters ────────────────────────────────────────────────────────

#[tokio::test]
#[ignore = "requires a running MongoDB (set STOKER_TEST_URI)"]
async fn get_counter_sums_raw_and_aggregated_rows() {
    let storage = helpers::storage().await;
    let connection = storage.connection();

    helpers::insert_counter(&storage, "stats:deleted", 2, None).await;
    helpers::insert_counter(&storage, "stats:deleted", 3, None).await;
    storage
        .context()
        .aggregated_counters()
        .insert_one(
            stoker::documents::AggregatedCounterDocument {
                id: bson::oid::ObjectId::new(),
                key: "stats:deleted".to_string(),
                value: 10,
                expire_at: None,
            },
            None,
        )
        .await
        .unwrap();

    assert_eq!(connection.get_counter("stats:deleted").await.unwrap(), 15);
}
