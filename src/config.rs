//! Storage configuration.
//!
//! Options are plain serde structs so they can be built in code or loaded
//! from the environment with figment. Duration fields accept both numeric
//! values (interpreted as seconds) and duration strings with units.

use figment::providers::Env;
use figment::Figment;
use fundu::{DurationParser, TimeUnit};
use rand::Rng;
use serde::{Deserialize, Deserializer};
use std::time::Duration;

use crate::error::{Error, Result};

/// Options governing the storage core.
///
/// Every instance carries an auto-generated `client_id` used for
/// diagnostics; override it only when correlating logs across restarts.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageOptions {
    /// Collection name prefix shared by every collection in the deployment.
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// How often a blocked dequeue wakes up to re-poll the queue.
    ///
    /// Must be greater than zero. Blocked dequeuers also wake on the
    /// in-process queue-changed pulse, so this is a backstop, not the
    /// primary delivery latency.
    #[serde(
        default = "default_queue_poll_interval",
        deserialize_with = "deserialize_duration"
    )]
    pub queue_poll_interval: Duration,

    /// How long a fetched job stays invisible before it is considered
    /// abandoned and eligible for redelivery. Must be greater than zero.
    #[serde(
        default = "default_invisibility_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub invisibility_timeout: Duration,

    /// Lifetime of a distributed lock document. The heartbeat refreshes the
    /// lock at a fifth of this interval. Must be greater than zero.
    #[serde(
        default = "default_distributed_lock_lifetime",
        deserialize_with = "deserialize_duration"
    )]
    pub distributed_lock_lifetime: Duration,

    /// How long the counters aggregator sleeps between passes when the
    /// previous pass did not drain a full batch.
    #[serde(
        default = "default_counters_aggregate_interval",
        deserialize_with = "deserialize_duration"
    )]
    pub counters_aggregate_interval: Duration,

    /// Maximum number of raw counter rows merged per aggregator pass.
    #[serde(default = "default_counters_aggregate_batch")]
    pub counters_aggregate_batch: usize,

    /// Identifier for this storage instance, used in logs only.
    #[serde(default = "generate_client_id")]
    pub client_id: String,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
            queue_poll_interval: default_queue_poll_interval(),
            invisibility_timeout: default_invisibility_timeout(),
            distributed_lock_lifetime: default_distributed_lock_lifetime(),
            counters_aggregate_interval: default_counters_aggregate_interval(),
            counters_aggregate_batch: default_counters_aggregate_batch(),
            client_id: generate_client_id(),
        }
    }
}

impl StorageOptions {
    /// Load options from `STOKER_`-prefixed environment variables.
    ///
    /// e.g. `STOKER_PREFIX=jobs`, `STOKER_QUEUE_POLL_INTERVAL=5s`,
    /// `STOKER_INVISIBILITY_TIMEOUT=15m`.
    pub fn from_env() -> Result<Self> {
        let options: StorageOptions = Figment::new()
            .merge(Env::prefixed("STOKER_"))
            .extract()
            .map_err(|e| Error::invalid_argument(format!("configuration error: {e}")))?;
        options.validate()?;
        Ok(options)
    }

    /// Reject option combinations the core cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.prefix.is_empty() {
            return Err(Error::invalid_argument("prefix must not be empty"));
        }
        if self.queue_poll_interval.is_zero() {
            return Err(Error::invalid_argument(
                "queue_poll_interval must be greater than zero",
            ));
        }
        if self.invisibility_timeout.is_zero() {
            return Err(Error::invalid_argument(
                "invisibility_timeout must be greater than zero",
            ));
        }
        if self.distributed_lock_lifetime.is_zero() {
            return Err(Error::invalid_argument(
                "distributed_lock_lifetime must be greater than zero",
            ));
        }
        if self.counters_aggregate_batch == 0 {
            return Err(Error::invalid_argument(
                "counters_aggregate_batch must be greater than zero",
            ));
        }
        Ok(())
    }
}

/// Default collection prefix
fn default_prefix() -> String {
    "hangfire".to_string()
}

/// Default poll backstop of 15 seconds
fn default_queue_poll_interval() -> Duration {
    Duration::from_secs(15)
}

/// Default invisibility timeout of 30 minutes
fn default_invisibility_timeout() -> Duration {
    Duration::from_secs(30 * 60)
}

/// Default lock lifetime of 30 seconds
fn default_distributed_lock_lifetime() -> Duration {
    Duration::from_secs(30)
}

/// Default aggregation interval of 5 minutes
fn default_counters_aggregate_interval() -> Duration {
    Duration::from_secs(5 * 60)
}

/// Default aggregation batch of 1000 rows
fn default_counters_aggregate_batch() -> usize {
    1000
}

/// Random 12-hex-digit instance identifier
fn generate_client_id() -> String {
    let mut rng = rand::thread_rng();
    (0..12)
        .map(|_| format!("{:x}", rng.gen_range(0..16u8)))
        .collect()
}

/// Duration parser handling seconds (default), milliseconds, minutes and
/// hours, with whitespace allowed between number and unit.
const DURATION_PARSER: DurationParser<'static> = DurationParser::builder()
    .time_units(&[
        TimeUnit::MilliSecond,
        TimeUnit::Second,
        TimeUnit::Minute,
        TimeUnit::Hour,
    ])
    .allow_time_unit_delimiter()
    .disable_infinity()
    .disable_fraction()
    .disable_exponent()
    .default_unit(TimeUnit::Second)
    .build();

/// Deserialize a duration from either a bare number of seconds or a
/// duration string such as `"500ms"`, `"30s"`, `"5m"`.
fn deserialize_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Visitor;

    struct DurationVisitor;

    impl<'de> Visitor<'de> for DurationVisitor {
        type Value = Duration;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a duration string or number of seconds")
        }

        fn visit_str<E>(self, value: &str) -> std::result::Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            DURATION_PARSER
                .parse(value)
                .map_err(|e| {
                    serde::de::Error::custom(format!(
                        "invalid duration '{value}': {e}. Examples: '5' (seconds), '500ms', '30s', '5m'"
                    ))
                })?
                .try_into()
                .map_err(|e| serde::de::Error::custom(format!("duration out of range: {e}")))
        }

        fn visit_u64<E>(self, value: u64) -> std::result::Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            Ok(Duration::from_secs(value))
        }

        fn visit_i64<E>(self, value: i64) -> std::result::Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            if value < 0 {
                return Err(serde::de::Error::custom("duration cannot be negative"));
            }
            Ok(Duration::from_secs(value as u64))
        }
    }

    deserializer.deserialize_any(DurationVisitor)
}
