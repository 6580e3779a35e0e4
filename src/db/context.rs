//! Database context wrapping one logical database.
//!
//! All collection access goes through this context so collection naming,
//! write-concern overrides, and the server clock stay in one place.

use chrono::{DateTime, Utc};
use mongodb::options::{Acknowledgment, CollectionOptions, WriteConcern};
use mongodb::{Client, Collection, Database};

use crate::config::StorageOptions;
use crate::db::clock::ServerClock;
use crate::db::schema;
use crate::documents::*;
use crate::error::Result;

/// Named-collection accessors over one logical database.
pub struct DbContext {
    database: Database,
    options: StorageOptions,
    clock: ServerClock,
}

impl DbContext {
    /// Create a context over `database_name`, resolving collection names
    /// from the configured prefix. No I/O happens here; call [`init`]
    /// before using the context.
    ///
    /// [`init`]: DbContext::init
    pub fn new(client: &Client, database_name: &str, options: StorageOptions) -> Self {
        let database = client.database(database_name);
        let clock = ServerClock::new(database.clone());
        Self {
            database,
            options,
            clock,
        }
    }

    /// Verify the schema version and build all required indexes.
    ///
    /// Fails with [`crate::Error::UnsupportedSchema`] when the persisted
    /// version is newer than this build; installs or upgrades the marker
    /// otherwise. Index creation is idempotent: an existing index with
    /// conflicting options is dropped and recreated.
    pub async fn init(&self) -> Result<()> {
        schema::ensure_schema(self).await?;
        schema::ensure_indexes(self).await
    }

    /// Storage options this context was built with.
    pub fn options(&self) -> &StorageOptions {
        &self.options
    }

    /// Current time according to the database server, not the local host.
    pub async fn server_time(&self) -> Result<DateTime<Utc>> {
        self.clock.now().await
    }

    fn name(&self, collection: &str) -> String {
        format!("{}.{}", self.options.prefix, collection)
    }

    pub fn jobs(&self) -> Collection<JobDocument> {
        self.database.collection(&self.name("job"))
    }

    pub fn job_parameters(&self) -> Collection<JobParameterDocument> {
        self.database.collection(&self.name("jobParameter"))
    }

    pub fn states(&self) -> Collection<StateDocument> {
        self.database.collection(&self.name("state"))
    }

    pub fn sets(&self) -> Collection<SetDocument> {
        self.database.collection(&self.name("set"))
    }

    pub fn hashes(&self) -> Collection<HashDocument> {
        self.database.collection(&self.name("hash"))
    }

    pub fn lists(&self) -> Collection<ListDocument> {
        self.database.collection(&self.name("list"))
    }

    pub fn counters(&self) -> Collection<CounterDocument> {
        self.database.collection(&self.name("counter"))
    }

    pub fn aggregated_counters(&self) -> Collection<AggregatedCounterDocument> {
        self.database.collection(&self.name("aggregatedcounter"))
    }

    pub fn servers(&self) -> Collection<ServerDocument> {
        self.database.collection(&self.name("server"))
    }

    pub fn schema(&self) -> Collection<SchemaDocument> {
        self.database.collection(&self.name("schema"))
    }

    /// The locks collection writes with majority concern: a lock that is
    /// not durable across a primary failover is not a lock.
    pub fn locks(&self) -> Collection<LockDocument> {
        let options = CollectionOptions::builder()
            .write_concern(WriteConcern::builder().w(Acknowledgment::Majority).build())
            .build();
        self.database
            .collection_with_options(&self.name("locks"), options)
    }
}
