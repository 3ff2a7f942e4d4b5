pub mod odre;

use crate::model::Page;
use async_trait::async_trait;
use chrono::NaiveDate;
use collector_core::Result;

/// Stateless access to a remote open-data catalog, keyed by dataset name.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    /// Fetch one page of records for a single calendar date.
    async fn fetch_page(
        &self,
        dataset: &str,
        offset: u64,
        limit: u64,
        date: NaiveDate,
    ) -> Result<Page>;

    /// Total number of records in the dataset.
    async fn record_count(&self, dataset: &str) -> Result<u64>;

    /// Earliest date available upstream, `None` when the dataset is empty.
    async fn first_date(&self, dataset: &str) -> Result<Option<NaiveDate>>;

    /// Latest date available upstream, `None` when the dataset is empty.
    async fn last_date(&self, dataset: &str) -> Result<Option<NaiveDate>>;

    /// Number of rows upstream for one calendar date; plans the per-day
    /// pagination loop.
    async fn record_count_for_date(&self, dataset: &str, date: NaiveDate) -> Result<u64>;

    /// Get the source identifier
    fn source_id(&self) -> &str;

    /// Check if the source is reachable
    async fn health_check(&self) -> Result<()>;
}

pub use odre::OdreSource;
