//! Lock acquisition, heartbeat, and release.

use bson::doc;
use chrono::Duration as ChronoDuration;
use mongodb::error::ErrorKind;
use mongodb::options::{FindOneAndUpdateOptions, ReturnDocument};
use mongodb::Collection;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::db::DbContext;
use crate::documents::LockDocument;
use crate::error::{Error, Result};
use crate::lock::awaiter;
use crate::lock::context::LockContext;
use crate::lock::fingerprint::{is_local_owner, next_owner_token};

/// Acquire an exclusive lock on `resource`, waiting up to `timeout`.
///
/// Re-entering a resource the given [`LockContext`] already holds returns a
/// no-op guard immediately without touching storage. Otherwise acquisition
/// loops over: delete the resource's row if it has expired, then upsert
/// with `$setOnInsert` and inspect the pre-image. A missing pre-image
/// means the insert was ours and the lock is held. While another owner
/// holds the row, contenders in the same process park on a shared awaiter;
/// remote contention falls back to polling.
pub async fn acquire(
    context: Arc<DbContext>,
    resource: &str,
    timeout: Duration,
    lock_context: &LockContext,
) -> Result<DistributedLockGuard> {
    if resource.is_empty() {
        return Err(Error::invalid_argument("resource must not be empty"));
    }

    if lock_context.holds(resource) {
        trace!(resource, "reentrant acquisition");
        return Ok(DistributedLockGuard::reentrant(resource));
    }

    let lifetime = context.options().distributed_lock_lifetime;
    let lifetime_chrono = ChronoDuration::from_std(lifetime)
        .map_err(|_| Error::invalid_argument("distributed_lock_lifetime out of range"))?;
    let owner = next_owner_token();
    let locks = context.locks();
    let started = Instant::now();

    loop {
        let now = context.server_time().await?;

        // Clear an abandoned row so the upsert below can take over.
        locks
            .delete_one(
                doc! {
                    "_id": resource,
                    "expireAt": { "$lt": bson::DateTime::from_chrono(now) },
                },
                None,
            )
            .await?;

        let options = FindOneAndUpdateOptions::builder()
            .upsert(true)
            .return_document(ReturnDocument::Before)
            .build();
        let before = locks
            .find_one_and_update(
                doc! { "_id": resource },
                doc! { "$setOnInsert": {
                    "owner": &owner,
                    "expireAt": bson::DateTime::from_chrono(now + lifetime_chrono),
                } },
                options,
            )
            .await;

        let holder = match before {
            Ok(None) => {
                debug!(resource, owner = %owner, "lock acquired");
                lock_context.insert(resource);
                let heartbeat =
                    start_heartbeat(Arc::clone(&context), resource.to_string(), owner.clone(), lifetime);
                return Ok(DistributedLockGuard {
                    locks: Some(locks),
                    resource: resource.to_string(),
                    owner: Some(owner),
                    lock_context: lock_context.clone(),
                    heartbeat: Some(heartbeat),
                    released: false,
                });
            }
            Ok(Some(existing)) => existing.owner,
            // Two contenders can race the insert; the loser sees a
            // duplicate key and retries as ordinary contention.
            Err(error) if is_duplicate_key(&error) => {
                check_remaining(resource, timeout, started)?;
                continue;
            }
            Err(error) => return Err(error.into()),
        };

        let remaining = check_remaining(resource, timeout, started)?;

        if is_local_owner(&holder) {
            trace!(resource, "held in-process, waiting on awaiter");
            let notify = awaiter::awaiter_for(resource);
            if tokio::time::timeout(remaining, notify.notified())
                .await
                .is_err()
            {
                return Err(Error::LockTimeout {
                    resource: resource.to_string(),
                    timeout,
                });
            }
        } else {
            let interval = (remaining / 5).min(lifetime);
            trace!(resource, ?interval, "held remotely, polling");
            tokio::time::sleep(interval).await;
        }
    }
}

fn check_remaining(resource: &str, timeout: Duration, started: Instant) -> Result<Duration> {
    match timeout.checked_sub(started.elapsed()) {
        Some(remaining) if !remaining.is_zero() => Ok(remaining),
        _ => Err(Error::LockTimeout {
            resource: resource.to_string(),
            timeout,
        }),
    }
}

fn is_duplicate_key(error: &mongodb::error::Error) -> bool {
    match *error.kind {
        ErrorKind::Command(ref command) => command.code == 11000,
        ErrorKind::Write(mongodb::error::WriteFailure::WriteError(ref write)) => {
            write.code == 11000
        }
        _ => false,
    }
}

/// Refresh the lock's expiry at a fifth of its lifetime until told to stop
/// or until the row no longer belongs to `owner` (the lock was stolen, in
/// which case the next release surfaces the loss).
fn start_heartbeat(
    context: Arc<DbContext>,
    resource: String,
    owner: String,
    lifetime: Duration,
) -> CancellationToken {
    let token = CancellationToken::new();
    let stop = token.clone();
    let period = lifetime / 5;

    tokio::spawn(async move {
        let lifetime_chrono = match ChronoDuration::from_std(lifetime) {
            Ok(lifetime) => lifetime,
            Err(_) => return,
        };
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = tokio::time::sleep(period) => {}
            }

            let now = match context.server_time().await {
                Ok(now) => now,
                Err(error) => {
                    warn!(resource, %error, "heartbeat could not sample server time");
                    continue;
                }
            };
            let refresh = context
                .locks()
                .update_one(
                    doc! { "_id": &resource, "owner": &owner },
                    doc! { "$set": {
                        "expireAt": bson::DateTime::from_chrono(now + lifetime_chrono),
                    } },
                    None,
                )
                .await;
            match refresh {
                Ok(outcome) if outcome.matched_count == 0 => {
                    debug!(resource, "lock no longer owned, heartbeat stopping");
                    break;
                }
                Ok(_) => trace!(resource, "lock heartbeat"),
                Err(error) => warn!(resource, %error, "lock heartbeat failed"),
            }
        }
    });

    token
}

/// Holds a distributed lock until released or dropped.
///
/// [`release`] reports whether the lock was still owned at release time;
/// dropping the guard performs a best-effort spawned release instead.
/// Re-entrant guards own nothing and release nothing.
///
/// [`release`]: DistributedLockGuard::release
pub struct DistributedLockGuard {
    locks: Option<Collection<LockDocument>>,
    resource: String,
    owner: Option<String>,
    lock_context: LockContext,
    heartbeat: Option<CancellationToken>,
    released: bool,
}

impl DistributedLockGuard {
    fn reentrant(resource: &str) -> Self {
        Self {
            locks: None,
            resource: resource.to_string(),
            owner: None,
            lock_context: LockContext::new(),
            heartbeat: None,
            released: true,
        }
    }

    /// The locked resource name.
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Release the lock, failing with [`Error::LockLost`] when the row was
    /// already stolen by TTL expiry or another participant. The heartbeat
    /// is stopped and in-process contenders are signaled on every outcome.
    pub async fn release(mut self) -> Result<()> {
        let (Some(owner), Some(locks)) = (self.owner.take(), self.locks.take()) else {
            return Ok(());
        };
        self.released = true;

        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.cancel();
        }
        let deleted = locks
            .delete_one(doc! { "_id": &self.resource, "owner": &owner }, None)
            .await;
        self.lock_context.remove(&self.resource);
        awaiter::signal(&self.resource);
        awaiter::prune();

        match deleted {
            Ok(outcome) if outcome.deleted_count == 0 => Err(Error::LockLost {
                resource: self.resource.clone(),
            }),
            Ok(_) => {
                debug!(resource = %self.resource, "lock released");
                Ok(())
            }
            Err(error) => Err(error.into()),
        }
    }
}

impl Drop for DistributedLockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let (Some(owner), Some(locks)) = (self.owner.take(), self.locks.take()) else {
            return;
        };
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.cancel();
        }
        self.lock_context.remove(&self.resource);

        let resource = self.resource.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let deleted = locks
                        .delete_one(doc! { "_id": &resource, "owner": &owner }, None)
                        .await;
                    match deleted {
                        Ok(outcome) if outcome.deleted_count == 0 => {
                            warn!(resource, "lock was already stolen at drop")
                        }
                        Ok(_) => debug!(resource, "lock released on drop"),
                        Err(error) => warn!(resource, %error, "lock release on drop failed"),
                    }
                    awaiter::signal(&resource);
                    awaiter::prune();
                });
            }
            Err(_) => {
                warn!(
                    resource = %self.resource,
                    "no runtime to release lock on drop; TTL expiry will recover it"
                );
            }
        }
    }
}
