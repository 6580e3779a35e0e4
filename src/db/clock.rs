//! Database server clock.
//!
//! Expiry, invisibility and lock comparisons all use the server's clock so
//! that heterogeneous hosts with skewed wall clocks agree on "now". The
//! clock samples `localTime` from the handshake reply, caches the offset
//! against a monotonic local instant, and refreshes stale samples.

use bson::doc;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use mongodb::Database;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::error::Result;

/// Samples older than this are refreshed before use.
const MAX_SAMPLE_AGE: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone, Copy)]
struct ClockSample {
    offset: ChronoDuration,
    taken_at: Instant,
}

/// Cached offset between this process's clock and the database server's.
pub(crate) struct ServerClock {
    database: Database,
    sample: Mutex<Option<ClockSample>>,
}

impl ServerClock {
    pub(crate) fn new(database: Database) -> Self {
        Self {
            database,
            sample: Mutex::new(None),
        }
    }

    /// Current time according to the database server.
    pub(crate) async fn now(&self) -> Result<DateTime<Utc>> {
        if let Some(offset) = self.cached_offset() {
            return Ok(Utc::now() + offset);
        }
        let offset = self.resample().await?;
        Ok(Utc::now() + offset)
    }

    fn cached_offset(&self) -> Option<ChronoDuration> {
        let guard = self.sample.lock().expect("clock sample mutex poisoned");
        guard
            .as_ref()
            .filter(|sample| sample.taken_at.elapsed() < MAX_SAMPLE_AGE)
            .map(|sample| sample.offset)
    }

    async fn resample(&self) -> Result<ChronoDuration> {
        let reply = self
            .database
            .run_command(doc! { "isMaster": 1 }, None)
            .await?;
        let server_now = reply
            .get_datetime("localTime")
            .map_err(|_| {
                mongodb::error::Error::custom("handshake reply did not carry localTime")
            })?
            .to_chrono();
        let offset = server_now - Utc::now();

        debug!(offset_ms = offset.num_milliseconds(), "sampled server clock");
        let mut guard = self.sample.lock().expect("clock sample mutex poisoned");
        *guard = Some(ClockSample {
            offset,
            taken_at: Instant::now(),
        });
        Ok(offset)
    }
}
