use crate::model::{fmt_date, Batch};
use async_trait::async_trait;
use chrono::NaiveDate;
use collector_core::config::{DatabaseConfig, DatasetConfig};
use collector_core::Result;
use futures::TryStreamExt;
use metrics::counter;
use mongodb::bson::{doc, Document};
use mongodb::options::ClientOptions;
use mongodb::{Client, Database, IndexModel};
use std::time::Duration;
use tracing::{debug, info, instrument};

/// Document-store handle owned by the application and passed by reference
/// into the sync engine and the query layer. The sync engine is the only
/// writer; batch insert is the unit of atomicity.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Create a collection if it does not exist yet.
    async fn create_collection(&self, name: &str) -> Result<()>;

    /// Persist one fetched page as a single batch document.
    async fn insert_batch(&self, collection: &str, batch: Batch) -> Result<()>;

    /// Delete every batch holding records dated `date` or later. Returns the
    /// number of batches removed.
    async fn delete_from_date(&self, collection: &str, date: NaiveDate) -> Result<u64>;

    /// Execute an aggregation pipeline and collect the resulting rows.
    async fn aggregate(&self, collection: &str, pipeline: Vec<Document>) -> Result<Vec<Document>>;

    /// Build the indexes backing the date-range and region-filter queries.
    async fn create_indexes(&self, dataset: &DatasetConfig) -> Result<()>;

    async fn health_check(&self) -> Result<()>;
}

pub struct MongoStore {
    database: Database,
}

impl MongoStore {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let mut options = ClientOptions::parse(&config.url).await?;
        options.connect_timeout = Some(Duration::from_secs(config.connect_timeout_secs));
        options.server_selection_timeout = Some(Duration::from_secs(config.connect_timeout_secs));

        let client = Client::with_options(options)?;
        let database = client.database(&config.name);

        info!(database = %config.name, "Connected to document store");

        Ok(Self { database })
    }
}

#[async_trait]
impl DocumentStore for MongoStore {
    async fn create_collection(&self, name: &str) -> Result<()> {
        let existing = self.database.list_collection_names(None).await?;
        if existing.iter().any(|c| c == name) {
            debug!(collection = name, "Collection already exists");
            return Ok(());
        }

        self.database.create_collection(name, None).await?;
        info!(collection = name, "Created collection");
        Ok(())
    }

    async fn insert_batch(&self, collection: &str, batch: Batch) -> Result<()> {
        let rows = batch.results.len();
        self.database
            .collection::<Document>(collection)
            .insert_one(batch.into_document(), None)
            .await?;

        counter!("collector_batches_inserted", "collection" => collection.to_string())
            .increment(1);
        counter!("collector_records_ingested", "collection" => collection.to_string())
            .increment(rows as u64);

        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_from_date(&self, collection: &str, date: NaiveDate) -> Result<u64> {
        let result = self
            .database
            .collection::<Document>(collection)
            .delete_many(doc! {"results.date": {"$gte": fmt_date(date)}}, None)
            .await?;

        debug!(
            collection,
            from = %date,
            deleted = result.deleted_count,
            "Deleted trailing batches"
        );

        Ok(result.deleted_count)
    }

    async fn aggregate(&self, collection: &str, pipeline: Vec<Document>) -> Result<Vec<Document>> {
        let cursor = self
            .database
            .collection::<Document>(collection)
            .aggregate(pipeline, None)
            .await?;

        Ok(cursor.try_collect().await?)
    }

    async fn create_indexes(&self, dataset: &DatasetConfig) -> Result<()> {
        let collection = self.database.collection::<Document>(&dataset.collection);
        let date_key = format!("results.{}", dataset.date_field);

        collection
            .create_index(
                IndexModel::builder().keys(doc! {&date_key: 1}).build(),
                None,
            )
            .await?;

        if let Some(region_field) = &dataset.region_field {
            let region_key = format!("results.{}", region_field);
            collection
                .create_index(
                    IndexModel::builder()
                        .keys(doc! {&date_key: 1, &region_key: 1})
                        .build(),
                    None,
                )
                .await?;
        }

        info!(collection = %dataset.collection, "Indexes in place");
        Ok(())
    }

    async fn health_check(&self) -> Result<()> {
        self.database.run_command(doc! {"ping": 1}, None).await?;
        Ok(())
    }
}
