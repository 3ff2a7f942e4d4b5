use crate::model::Batch;
use crate::query;
use crate::source::CatalogSource;
use crate::store::DocumentStore;
use chrono::{Datelike, Duration, NaiveDate, Utc};
use collector_core::backoff::retry_with_backoff;
use collector_core::config::{DatasetConfig, IngestConfig};
use collector_core::{Error, Result};
use futures::stream::{self, StreamExt, TryStreamExt};
use metrics::{gauge, histogram};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, instrument, warn};

/// Outcome of one dataset synchronization run.
#[derive(Debug, Clone)]
pub struct SyncReport {
    pub dataset: String,
    pub collection: String,
    /// Inclusive span that was fetched; `None` when there was nothing to do.
    pub span: Option<(NaiveDate, NaiveDate)>,
    pub batches_inserted: u64,
    pub records_ingested: u64,
}

impl SyncReport {
    fn empty(dataset: &DatasetConfig) -> Self {
        Self {
            dataset: dataset.id.clone(),
            collection: dataset.collection.clone(),
            span: None,
            batches_inserted: 0,
            records_ingested: 0,
        }
    }
}

/// Brings local collections up to date with their remote datasets. The
/// engine is the sole writer to the document store; the query layer only
/// reads, so running an update concurrently with reads is safe. A reader
/// can still observe a gap while the trailing window is being re-fetched:
/// delete and reinsert are not atomic together.
pub struct SyncEngine {
    source: Arc<dyn CatalogSource>,
    store: Arc<dyn DocumentStore>,
    config: IngestConfig,
}

impl SyncEngine {
    pub fn new(
        source: Arc<dyn CatalogSource>,
        store: Arc<dyn DocumentStore>,
        config: IngestConfig,
    ) -> Self {
        Self {
            source,
            store,
            config,
        }
    }

    pub async fn create_collections(&self) -> Result<()> {
        for dataset in &self.config.datasets {
            self.store.create_collection(&dataset.collection).await?;
        }
        Ok(())
    }

    pub async fn create_indexes(&self) -> Result<()> {
        for dataset in &self.config.datasets {
            self.store.create_indexes(dataset).await?;
        }
        Ok(())
    }

    /// Full run over every configured dataset: ensure collections exist,
    /// sync datasets on a bounded pool, then build indexes. A failing
    /// dataset does not abort the others; the first failure is returned
    /// once every dataset has finished.
    #[instrument(skip(self))]
    pub async fn perform_update(&self) -> Result<Vec<SyncReport>> {
        let started = Instant::now();
        self.create_collections().await?;

        let results: Vec<(String, Result<SyncReport>)> =
            stream::iter(self.config.datasets.clone())
                .map(|dataset| async move {
                    let report = self.update_dataset(&dataset).await;
                    (dataset.id, report)
                })
                .buffer_unordered(self.config.max_concurrent_datasets)
                .collect()
                .await;

        self.create_indexes().await?;

        let mut reports = Vec::new();
        let mut first_error = None;
        for (dataset, result) in results {
            match result {
                Ok(report) => reports.push(report),
                Err(e) => {
                    error!(dataset = %dataset, error = %e, "Dataset synchronization failed");
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }

        histogram!("collector_update_duration_secs").record(started.elapsed().as_secs_f64());
        info!(
            datasets = reports.len(),
            records = reports.iter().map(|r| r.records_ingested).sum::<u64>(),
            duration_secs = started.elapsed().as_secs(),
            "Synchronization pass completed"
        );

        Ok(reports)
    }

    /// Synchronize one dataset. Start is the remote first date for an empty
    /// collection, the stored watermark otherwise (clamped when the upstream
    /// publishes future-dated rows); the trailing window from the start date
    /// on is deleted and re-fetched so reruns are idempotent and upstream
    /// corrections are absorbed.
    #[instrument(skip(self, dataset), fields(dataset = %dataset.id, collection = %dataset.collection))]
    pub async fn update_dataset(&self, dataset: &DatasetConfig) -> Result<SyncReport> {
        let today = Utc::now().date_naive();

        let watermark = query::watermark(self.store.as_ref(), &dataset.collection).await?;
        let start_date = match watermark {
            Some(watermark) => {
                let start = clamp_start(watermark, today, self.config.correction_window_days);
                if start < watermark {
                    debug!(%watermark, %start, "Future watermark clamped");
                }
                let deleted = self
                    .store
                    .delete_from_date(&dataset.collection, start)
                    .await?;
                debug!(deleted, from = %start, "Cleared re-fetch window");
                start
            }
            None => match self.source.first_date(&dataset.id).await? {
                Some(first) => first,
                None => {
                    info!("Remote dataset is empty, nothing to sync");
                    return Ok(SyncReport::empty(dataset));
                }
            },
        };

        let end_date = match self.source.last_date(&dataset.id).await? {
            Some(last) => last,
            None => {
                info!("Remote dataset is empty, nothing to sync");
                return Ok(SyncReport::empty(dataset));
            }
        };

        if end_date < start_date {
            info!(%start_date, %end_date, "Collection already up to date");
            return Ok(SyncReport::empty(dataset));
        }

        info!(%start_date, %end_date, "Synchronizing");

        // Months fan out on a bounded pool; insertion order across months is
        // not calendar order, which is fine because every query sorts
        // explicitly by date or timestamp.
        let (batches_inserted, records_ingested) =
            stream::iter(month_spans(start_date, end_date))
                .map(|(from, to)| self.sync_span(dataset, from, to))
                .buffer_unordered(self.config.max_concurrent_months)
                .try_fold((0u64, 0u64), |(batches, records), (b, r)| async move {
                    Ok::<_, Error>((batches + b, records + r))
                })
                .await?;

        if let Ok(Some(new_watermark)) =
            query::watermark(self.store.as_ref(), &dataset.collection).await
        {
            gauge!("collector_watermark_age_days", "collection" => dataset.collection.clone())
                .set((today - new_watermark).num_days() as f64);
        }

        info!(
            batches = batches_inserted,
            records = records_ingested,
            "Dataset synchronized"
        );

        Ok(SyncReport {
            dataset: dataset.id.clone(),
            collection: dataset.collection.clone(),
            span: Some((start_date, end_date)),
            batches_inserted,
            records_ingested,
        })
    }

    /// Sequential day loop over one month span. Each day is paged through in
    /// fixed-size chunks; a chunk that keeps failing surfaces its error after
    /// the configured retries instead of looping forever.
    async fn sync_span(
        &self,
        dataset: &DatasetConfig,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<(u64, u64)> {
        let mut batches = 0u64;
        let mut records = 0u64;

        let mut day = from;
        while day <= to {
            let day_total = retry_with_backoff(
                || self.source.record_count_for_date(&dataset.id, day),
                self.config.max_retries,
                self.config.retry_base_delay_ms,
                "record_count_for_date",
            )
            .await?;

            let mut offset = 0u64;
            while offset < day_total {
                let rows = self.config.page_size.min(day_total - offset);
                let inserted = retry_with_backoff(
                    || self.fetch_and_insert_chunk(dataset, day, offset, rows),
                    self.config.max_retries,
                    self.config.retry_base_delay_ms,
                    "fetch_and_insert_chunk",
                )
                .await
                .map_err(|e| {
                    warn!(date = %day, offset, error = %e, "Chunk permanently failed");
                    e
                })?;

                if inserted > 0 {
                    batches += 1;
                    records += inserted;
                }
                offset += self.config.page_size;
            }

            debug!(date = %day, rows = day_total, "Day ingested");
            day += Duration::days(1);
        }

        Ok((batches, records))
    }

    async fn fetch_and_insert_chunk(
        &self,
        dataset: &DatasetConfig,
        date: NaiveDate,
        offset: u64,
        rows: u64,
    ) -> Result<u64> {
        let page = self
            .source
            .fetch_page(&dataset.id, offset, rows, date)
            .await?;

        // The day can shrink upstream between the count query and the fetch.
        if page.records.is_empty() {
            return Ok(0);
        }

        let count = page.records.len() as u64;
        self.store
            .insert_batch(
                &dataset.collection,
                Batch {
                    results: page.records,
                    offset,
                    requested_date: date,
                },
            )
            .await?;

        Ok(count)
    }

    /// Look up a configured dataset by its remote id.
    pub fn dataset(&self, id: &str) -> Result<&DatasetConfig> {
        self.config
            .datasets
            .iter()
            .find(|dataset| dataset.id == id)
            .ok_or_else(|| Error::Validation(format!("unknown dataset: {}", id)))
    }
}

/// Start of the re-fetch window. A watermark at or past `today` is an
/// upstream anomaly (the API publishes forecast rows dated in the future)
/// and is clamped back to `today - window_days`.
fn clamp_start(watermark: NaiveDate, today: NaiveDate, window_days: i64) -> NaiveDate {
    if watermark >= today {
        today - Duration::days(window_days)
    } else {
        watermark
    }
}

/// Split an inclusive date span into calendar-month sub-spans.
fn month_spans(start: NaiveDate, end: NaiveDate) -> Vec<(NaiveDate, NaiveDate)> {
    let mut spans = Vec::new();
    let mut cursor = start;
    while cursor <= end {
        let month_end = last_day_of_month(cursor).min(end);
        spans.push((cursor, month_end));
        cursor = month_end + Duration::days(1);
    }
    spans
}

fn last_day_of_month(date: NaiveDate) -> NaiveDate {
    let (year, month) = match date.month() {
        12 => (date.year() + 1, 1),
        m => (date.year(), m + 1),
    };
    NaiveDate::from_ymd_opt(year, month, 1).expect("first of month") - Duration::days(1)
}
