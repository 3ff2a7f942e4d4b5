use crate::source::{CatalogSource, OdreSource};
use crate::store::{DocumentStore, MongoStore};
use crate::sync::{SyncEngine, SyncReport};
use collector_core::{Config, Result};
use std::sync::Arc;
use tracing::{info, instrument};

/// Wires configuration, store, source and sync engine together and exposes
/// the entry points the dashboard layer calls. All state lives behind `Arc`s
/// so updates triggered from a background task are safe to run concurrently
/// with ongoing reads.
pub struct App {
    store: Arc<MongoStore>,
    engine: SyncEngine,
}

impl App {
    #[instrument(skip(config))]
    pub async fn new(config: Config) -> Result<Self> {
        info!("Initializing application");

        let store = Arc::new(MongoStore::connect(&config.database).await?);
        let source: Arc<dyn CatalogSource> = Arc::new(OdreSource::new(&config.api)?);

        info!("Performing health checks");
        store.health_check().await?;
        // The catalog is checked lazily on first fetch; probing it here
        // would burn a rate-limited request per start.

        let store_handle: Arc<dyn DocumentStore> = store.clone();
        let engine = SyncEngine::new(source, store_handle, config.ingest.clone());

        Ok(Self { store, engine })
    }

    /// Idempotently create the configured collections and their indexes.
    pub async fn init(&self) -> Result<()> {
        self.create_collections().await?;
        self.create_indexes().await
    }

    pub async fn create_collections(&self) -> Result<()> {
        self.engine.create_collections().await
    }

    pub async fn create_indexes(&self) -> Result<()> {
        self.engine.create_indexes().await
    }

    /// One synchronization pass over every configured dataset.
    pub async fn perform_update(&self) -> Result<Vec<SyncReport>> {
        self.engine.perform_update().await
    }

    /// Synchronize a single dataset by its remote id.
    pub async fn update_dataset(&self, id: &str) -> Result<SyncReport> {
        let dataset = self.engine.dataset(id)?.clone();
        self.engine.create_collections().await?;
        self.engine.update_dataset(&dataset).await
    }

    /// Store handle for the query layer.
    pub fn store(&self) -> &dyn DocumentStore {
        self.store.as_ref()
    }
}
