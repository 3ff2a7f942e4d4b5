use super::CatalogSource;
use crate::model::{fmt_date, parse_date_prefix, Page};
use async_trait::async_trait;
use chrono::NaiveDate;
use collector_core::config::{ApiConfig, REMOTE_MAX_PAGE_SIZE};
use collector_core::{Error, Result};
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use serde::Deserialize;
use serde_json::Value;
use std::num::NonZeroU32;
use std::time::Duration;
use tracing::{debug, instrument, warn};

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

// The catalog answers with the Explore-v2 envelope; the v1 search endpoint
// (still referenced by older dataset mirrors) wraps each row in a
// records/fields pair. Both shapes are normalized here so nothing downstream
// ever sees more than one record layout.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ApiEnvelope {
    Explore {
        #[serde(default)]
        total_count: Option<u64>,
        results: Vec<serde_json::Map<String, Value>>,
    },
    Legacy {
        #[serde(default)]
        nhits: Option<u64>,
        records: Vec<LegacyRecord>,
    },
}

#[derive(Debug, Deserialize)]
struct LegacyRecord {
    #[serde(default)]
    fields: serde_json::Map<String, Value>,
}

impl ApiEnvelope {
    fn normalize(self) -> Result<Page> {
        match self {
            ApiEnvelope::Explore {
                total_count,
                results,
            } => {
                let records = results
                    .iter()
                    .map(mongodb::bson::to_document)
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(Page {
                    total_count: total_count.unwrap_or(records.len() as u64),
                    records,
                })
            }
            ApiEnvelope::Legacy { nhits, records } => {
                let records = records
                    .iter()
                    .map(|record| mongodb::bson::to_document(&record.fields))
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(Page {
                    total_count: nhits.unwrap_or(records.len() as u64),
                    records,
                })
            }
        }
    }
}

fn parse_body(dataset: &str, body: &str) -> Result<Page> {
    match serde_json::from_str::<ApiEnvelope>(body) {
        Ok(envelope) => envelope.normalize(),
        Err(e) => {
            warn!(
                dataset,
                error = %e,
                "Unrecognized response body, treating as empty page"
            );
            Ok(Page::default())
        }
    }
}

pub struct OdreSource {
    client: reqwest::Client,
    base_url: String,
    limiter: DirectLimiter,
}

impl OdreSource {
    pub fn new(config: &ApiConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        let per_second = NonZeroU32::new(config.requests_per_second).ok_or_else(|| {
            Error::Config("api.requests_per_second must be greater than 0".to_string())
        })?;

        let mut base_url = config.base_url.clone();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }

        Ok(Self {
            client,
            base_url,
            limiter: RateLimiter::direct(Quota::per_second(per_second)),
        })
    }

    fn records_url(&self, dataset: &str) -> String {
        format!("{}{}/records", self.base_url, dataset)
    }

    async fn request(&self, dataset: &str, params: &[(&str, String)]) -> Result<Page> {
        self.limiter.until_ready().await;

        let url = self.records_url(dataset);
        let response = self.client.get(&url).query(params).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Http {
                url,
                status: status.as_u16(),
                body,
            });
        }

        let body = response.text().await?;
        parse_body(dataset, &body)
    }

    async fn boundary_date(&self, dataset: &str, ascending: bool) -> Result<Option<NaiveDate>> {
        let order_by = if ascending { "date" } else { "-date" };
        let page = self
            .request(
                dataset,
                &[
                    ("select", "date".to_string()),
                    ("rows", "1".to_string()),
                    ("order_by", order_by.to_string()),
                ],
            )
            .await?;

        match page.records.first().and_then(|row| row.get_str("date").ok()) {
            Some(raw) => Ok(Some(parse_date_prefix(raw)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl CatalogSource for OdreSource {
    #[instrument(skip(self))]
    async fn fetch_page(
        &self,
        dataset: &str,
        offset: u64,
        limit: u64,
        date: NaiveDate,
    ) -> Result<Page> {
        if limit == 0 || limit > REMOTE_MAX_PAGE_SIZE {
            return Err(Error::Validation(format!(
                "page limit {} outside 1..={}",
                limit, REMOTE_MAX_PAGE_SIZE
            )));
        }

        let page = self
            .request(
                dataset,
                &[
                    ("offset", offset.to_string()),
                    ("rows", limit.to_string()),
                    ("where", format!("date='{}'", fmt_date(date))),
                ],
            )
            .await?;

        debug!(
            dataset,
            offset,
            rows = page.records.len(),
            "Fetched catalog page"
        );

        Ok(page)
    }

    async fn record_count(&self, dataset: &str) -> Result<u64> {
        let page = self
            .request(
                dataset,
                &[("select", "date".to_string()), ("rows", "1".to_string())],
            )
            .await?;
        Ok(page.total_count)
    }

    async fn first_date(&self, dataset: &str) -> Result<Option<NaiveDate>> {
        self.boundary_date(dataset, true).await
    }

    async fn last_date(&self, dataset: &str) -> Result<Option<NaiveDate>> {
        self.boundary_date(dataset, false).await
    }

    async fn record_count_for_date(&self, dataset: &str, date: NaiveDate) -> Result<u64> {
        let page = self
            .request(
                dataset,
                &[
                    ("select", "date".to_string()),
                    ("rows", "1".to_string()),
                    ("where", format!("date='{}'", fmt_date(date))),
                ],
            )
            .await?;
        Ok(page.total_count)
    }

    fn source_id(&self) -> &str {
        "odre"
    }

    async fn health_check(&self) -> Result<()> {
        self.limiter.until_ready().await;

        let response = self.client.get(&self.base_url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Http {
                url: self.base_url.clone(),
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        Ok(())
    }
}
