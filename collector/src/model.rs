use chrono::NaiveDate;
use collector_core::Result;
use mongodb::bson::{doc, Document};

/// Calendar-date format used by the catalog's `date` field and by every
/// stored record. ISO dates compare correctly as strings, which the range
/// filters and the watermark pipeline rely on.
pub const DATE_FORMAT: &str = "%Y-%m-%d";

pub fn fmt_date(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

/// Parse the calendar-date prefix of a raw date value. The catalog sometimes
/// answers with full timestamps where a plain date is expected.
pub fn parse_date_prefix(raw: &str) -> Result<NaiveDate> {
    let prefix = raw.get(..10).unwrap_or(raw);
    Ok(NaiveDate::parse_from_str(prefix, DATE_FORMAT)?)
}

/// One normalized page from the remote catalog.
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub total_count: u64,
    pub records: Vec<Document>,
}

/// One fetched page as it is persisted: a single document wrapping the raw
/// records plus the fetch coordinates. Batches are immutable once written;
/// corrections are absorbed by deleting and re-fetching the trailing window.
#[derive(Debug, Clone)]
pub struct Batch {
    pub results: Vec<Document>,
    pub offset: u64,
    pub requested_date: NaiveDate,
}

impl Batch {
    pub fn into_document(self) -> Document {
        doc! {
            "results": self.results,
            "offset": self.offset as i64,
            "requested_date": fmt_date(self.requested_date),
        }
    }
}
