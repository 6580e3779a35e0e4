//! Top-level storage wiring.

use mongodb::Client;
use std::sync::Arc;
use tracing::info;

use crate::aggregator::CountersAggregator;
use crate::config::StorageOptions;
use crate::connection::Connection;
use crate::db::DbContext;
use crate::error::Result;
use crate::monitoring::MonitoringApi;
use crate::queue::{DefaultQueueProvider, QueueProvider, QueueProviders};

/// Entry point: owns the database context and the queue provider registry,
/// and hands out connections, monitoring views, and the aggregator.
///
/// One `Storage` per process is the intended shape; clones of the handles
/// it produces all share the same context and in-process queue state.
pub struct Storage {
    context: Arc<DbContext>,
    providers: Arc<QueueProviders>,
}

impl Storage {
    /// Connect to `uri`, validate options, check the schema version, and
    /// build all indexes.
    pub async fn connect(uri: &str, database_name: &str, options: StorageOptions) -> Result<Self> {
        let client = Client::with_uri_str(uri).await?;
        Self::with_client(&client, database_name, options).await
    }

    /// Like [`connect`], reusing an existing client.
    ///
    /// [`connect`]: Storage::connect
    pub async fn with_client(
        client: &Client,
        database_name: &str,
        options: StorageOptions,
    ) -> Result<Self> {
        options.validate()?;
        let context = Arc::new(DbContext::new(client, database_name, options));
        context.init().await?;

        let default_provider = Arc::new(DefaultQueueProvider::new(Arc::clone(&context)));
        let providers = Arc::new(QueueProviders::new(default_provider));

        info!(
            client_id = %context.options().client_id,
            prefix = %context.options().prefix,
            "storage initialized"
        );
        Ok(Self { context, providers })
    }

    /// A new connection over this storage.
    pub fn connection(&self) -> Connection {
        Connection::new(Arc::clone(&self.context), Arc::clone(&self.providers))
    }

    /// The read-only monitoring API.
    pub fn monitoring(&self) -> MonitoringApi {
        MonitoringApi::new(Arc::clone(&self.context))
    }

    /// The counters aggregator; run it from one background task.
    pub fn counters_aggregator(&self) -> CountersAggregator {
        CountersAggregator::new(Arc::clone(&self.context))
    }

    /// Route `queue` to a non-default provider.
    pub fn register_queue_provider(
        &self,
        queue: impl Into<String>,
        provider: Arc<dyn QueueProvider>,
    ) {
        self.providers.register(queue, provider);
    }

    /// The shared database context.
    pub fn context(&self) -> &Arc<DbContext> {
        &self.context
    }

    /// This instance's diagnostics identifier.
    pub fn client_id(&self) -> &str {
        &self.context.options().client_id
    }
}
