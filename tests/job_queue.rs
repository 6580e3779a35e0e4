#[allow(dead_code)]
mod helpers;

use std::collections::HashSet;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

// ── dequeue ─────────────────────────────────────────────────────────

#[tokio::test]
#[ignore = "requires a running MongoDB (set STOKER_TEST_URI)"]
async fn dequeue_returns_enqueued_job_and_stamps_fetched_at() {
    let storage = helpers::storage().await;
    let connection = storage.connection();
    let job_id = helpers::create_enqueued_job(&connection, "default").await;

    let fetched = connection
        .fetch_next_job(&["default".to_string()], &CancellationToken::new())
        .await
        .expect("a job should be fetched");
    assert_eq!(fetched.job_id(), job_id);
    assert_eq!(fetched.queue(), "default");

    let job = helpers::read_job(&storage, &job_id).await;
    assert_eq!(job.queue.as_deref(), Some("default"));
    assert!(job.fetched_at.is_some(), "fetchedAt should be stamped");
}

#[tokio::test]
#[ignore = "requires a running MongoDB (set STOKER_TEST_URI)"]
async fn dequeue_recovers_job_abandoned_past_invisibility_timeout() {
    let storage = helpers::storage().await;
    let connection = storage.connection();
    let job_id = helpers::create_enqueued_job(&connection, "default").await;

    // Fetched a day ago with a 30-minute invisibility timeout: abandoned.
    helpers::backdate_fetch(&storage, &job_id, chrono::Duration::days(1)).await;

    let fetched = connection
        .fetch_next_job(&["default".to_string()], &CancellationToken::new())
        .await
        .expect("abandoned job should be redelivered");
    assert_eq!(fetched.job_id(), job_id);
}

#[tokio::test]
#[ignore = "requires a running MongoDB (set STOKER_TEST_URI)"]
async fn dequeue_skips_recently_fetched_jobs() {
    let storage = helpers::storage().await;
    let connection = storage.connection();
    let job_id = helpers::create_enqueued_job(&connection, "default").await;
    helpers::backdate_fetch(&storage, &job_id, chrono::Duration::seconds(5)).await;

    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        canceller.cancel();
    });

    let outcome = connection
        .fetch_next_job(&["default".to_string()], &token)
        .await;
    assert!(
        matches!(outcome, Err(stoker::Error::Canceled)),
        "a freshly fetched job must stay invisible"
    );
}

#[tokio::test]
#[ignore = "requires a running MongoDB (set STOKER_TEST_URI)"]
async fn dequeue_multiple_queues_delivers_each_job_exactly_once() {
    let storage = helpers::storage().await;
    let connection = storage.connection();
    let critical = helpers::create_enqueued_job(&connection, "critical").await;
    let default = helpers::create_enqueued_job(&connection, "default").await;

    let queues = vec!["critical".to_string(), "default".to_string()];
    let token = CancellationToken::new();
    // Hold both handles so neither job is requeued mid-test.
    let mut handles = Vec::new();
    for _ in 0..2 {
        handles.push(
            connection
                .fetch_next_job(&queues, &token)
                .await
                .expect("both jobs should eventually be delivered"),
        );
    }

    // No priority promise across queues; each job exactly once.
    let seen: HashSet<String> = handles.iter().map(|handle| handle.job_id()).collect();
    assert_eq!(seen, HashSet::from([critical, default]));
}

#[tokio::test]
#[ignore = "requires a running MongoDB (set STOKER_TEST_URI)"]
async fn dequeue_with_precanceled_token_fails_immediately() {
    let storage = helpers::storage().await;
    let connection = storage.connection();

    let token = CancellationToken::new();
    token.cancel();
    let outcome = connection
        .fetch_next_job(&["default".to_string()], &token)
        .await;
    assert!(matches!(outcome, Err(stoker::Error::Canceled)));
}

#[tokio::test]
#[ignore = "requires a running MongoDB (set STOKER_TEST_URI)"]
async fn dequeue_on_disposed_queue_fails_current_and_future_callers() {
    let storage = helpers::storage().await;

    let job_queue = {
        use stoker::queue::QueueProvider;
        let provider = stoker::queue::DefaultQueueProvider::new(storage.context().clone());
        provider.job_queue()
    };

    // A caller blocked in the wait loop fails once the queue is disposed.
    let blocked = {
        let job_queue = job_queue.clone();
        tokio::spawn(async move {
            job_queue
                .dequeue(&["default".to_string()], &CancellationToken::new())
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(300)).await;
    job_queue.dispose();

    let outcome = blocked.await.expect("task should not panic");
    assert!(matches!(outcome, Err(stoker::Error::Disposed)));

    // And so does every later caller.
    let outcome = job_queue
        .dequeue(&["default".to_string()], &CancellationToken::new())
        .await;
    assert!(matches!(outcome, Err(stoker::Error::Disposed)));
}

#[tokio::test]
#[ignore = "requires a running MongoDB (set STOKER_TEST_URI)"]
async fn dequeue_rejects_empty_queue_list() {
    let storage = helpers::storage().await;
    let connection = storage.connection();
    let outcome = connection
        .fetch_next_job(&[], &CancellationToken::new())
        .await;
    assert!(matches!(outcome, Err(stoker::Error::InvalidArgument(_))));
}

// ── fetched job disposition ─────────────────────────────────────────

#[tokio::test]
#[ignore = "requires a running MongoDB (set STOKER_TEST_URI)"]
async fn remove_from_queue_clears_queue_and_fetch_stamp() {
    let storage = helpers::storage().await;
    let connection = storage.connection();
    let job_id = helpers::create_enqueued_job(&connection, "default").await;

    let mut fetched = connection
        .fetch_next_job(&["default".to_string()], &CancellationToken::new())
        .await
        .expect("job should be fetched");
    fetched
        .remove_from_queue()
        .await
        .expect("remove should succeed");

    let job = helpers::read_job(&storage, &job_id).await;
    assert!(job.queue.is_none(), "queue should be cleared");
    assert!(job.fetched_at.is_none(), "fetchedAt should be cleared");
}

#[tokio::test]
#[ignore = "requires a running MongoDB (set STOKER_TEST_URI)"]
async fn requeue_keeps_queue_and_clears_fetch_stamp() {
    let storage = helpers::storage().await;
    let connection = storage.connection();
    let job_id = helpers::create_enqueued_job(&connection, "default").await;

    let mut fetched = connection
        .fetch_next_job(&["default".to_string()], &CancellationToken::new())
        .await
        .expect("job should be fetched");
    fetched.requeue().await.expect("requeue should succeed");

    let job = helpers::read_job(&storage, &job_id).await;
    assert_eq!(job.queue.as_deref(), Some("default"));
    assert!(job.fetched_at.is_none(), "fetchedAt should be cleared");
}

#[tokio::test]
#[ignore = "requires a running MongoDB (set STOKER_TEST_URI)"]
async fn dropping_without_outcome_requeues_the_job() {
    let storage = helpers::storage().await;
    let connection = storage.connection();
    let job_id = helpers::create_enqueued_job(&connection, "default").await;

    let fetched = connection
        .fetch_next_job(&["default".to_string()], &CancellationToken::new())
        .await
        .expect("job should be fetched");
    drop(fetched);

    // The requeue runs on a spawned task; give it a moment to land.
    tokio::time::sleep(Duration::from_millis(500)).await;

    let job = helpers::read_job(&storage, &job_id).await;
    assert_eq!(job.queue.as_deref(), Some("default"));
    assert!(
        job.fetched_at.is_none(),
        "default disposition must return the job to its queue"
    );
}
