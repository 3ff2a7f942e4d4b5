#![allow(dead_code)]

//! In-memory doubles for the document store and the remote catalog. The
//! store interprets exactly the aggregation stage subset the crate emits,
//! so sync and query behavior can be exercised without a live MongoDB.

use async_trait::async_trait;
use chrono::NaiveDate;
use collector::model::{fmt_date, Batch, Page};
use collector::source::CatalogSource;
use collector::store::DocumentStore;
use collector_core::config::DatasetConfig;
use collector_core::{Error, Result};
use mongodb::bson::{doc, Bson, Document};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Mutex;

// ---------------------------------------------------------------------------
// Document store fake

#[derive(Default)]
pub struct MemoryStore {
    collections: Mutex<BTreeMap<String, Vec<Document>>>,
    pub indexed: Mutex<Vec<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batch_count(&self, collection: &str) -> usize {
        self.collections
            .lock()
            .unwrap()
            .get(collection)
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub fn batch_sizes(&self, collection: &str) -> Vec<usize> {
        self.collections
            .lock()
            .unwrap()
            .get(collection)
            .map(|docs| {
                docs.iter()
                    .map(|d| d.get_array("results").map(Vec::len).unwrap_or(0))
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn create_collection(&self, name: &str) -> Result<()> {
        self.collections
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_default();
        Ok(())
    }

    async fn insert_batch(&self, collection: &str, batch: Batch) -> Result<()> {
        self.collections
            .lock()
            .unwrap()
            .entry(collection.to_string())
            .or_default()
            .push(batch.into_document());
        Ok(())
    }

    async fn delete_from_date(&self, collection: &str, date: NaiveDate) -> Result<u64> {
        let cutoff = fmt_date(date);
        let mut collections = self.collections.lock().unwrap();
        let docs = collections.entry(collection.to_string()).or_default();
        let before = docs.len();
        docs.retain(|doc| {
            !doc.get_array("results")
                .map(|results| {
                    results.iter().any(|r| match r {
                        Bson::Document(record) => record
                            .get_str("date")
                            .map(|d| d >= cutoff.as_str())
                            .unwrap_or(false),
                        _ => false,
                    })
                })
                .unwrap_or(false)
        });
        Ok((before - docs.len()) as u64)
    }

    async fn aggregate(&self, collection: &str, pipeline: Vec<Document>) -> Result<Vec<Document>> {
        let docs = self
            .collections
            .lock()
            .unwrap()
            .get(collection)
            .cloned()
            .unwrap_or_default();
        run_pipeline(docs, &pipeline)
    }

    async fn create_indexes(&self, dataset: &DatasetConfig) -> Result<()> {
        self.indexed.lock().unwrap().push(dataset.collection.clone());
        Ok(())
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Pipeline interpreter

fn run_pipeline(mut docs: Vec<Document>, pipeline: &[Document]) -> Result<Vec<Document>> {
    for stage in pipeline {
        let (name, spec) = stage
            .iter()
            .next()
            .ok_or_else(|| Error::Internal("empty pipeline stage".into()))?;
        docs = match name.as_str() {
            "$unwind" => apply_unwind(docs, spec)?,
            "$match" => apply_match(docs, spec)?,
            "$group" => apply_group(docs, spec)?,
            "$sort" => apply_sort(docs, spec)?,
            "$limit" => apply_limit(docs, spec)?,
            "$project" => apply_project(docs, spec)?,
            "$replaceRoot" => apply_replace_root(docs, spec)?,
            other => return Err(Error::Internal(format!("unsupported stage: {}", other))),
        };
    }
    Ok(docs)
}

fn lookup(doc: &Document, path: &str) -> Option<Bson> {
    let mut segments = path.split('.');
    let mut value = doc.get(segments.next()?)?.clone();
    for segment in segments {
        value = match value {
            Bson::Document(inner) => inner.get(segment)?.clone(),
            _ => return None,
        };
    }
    Some(value)
}

fn eval(doc: &Document, expr: &Bson) -> Bson {
    match expr {
        Bson::String(s) if s.starts_with('$') => lookup(doc, &s[1..]).unwrap_or(Bson::Null),
        other => other.clone(),
    }
}

fn as_f64(value: &Bson) -> Option<f64> {
    match value {
        Bson::Double(v) => Some(*v),
        Bson::Int32(v) => Some(*v as f64),
        Bson::Int64(v) => Some(*v as f64),
        _ => None,
    }
}

fn compare(a: &Bson, b: &Bson) -> Ordering {
    match (a, b) {
        (Bson::Null, Bson::Null) => Ordering::Equal,
        (Bson::Null, _) => Ordering::Less,
        (_, Bson::Null) => Ordering::Greater,
        (Bson::String(x), Bson::String(y)) => x.cmp(y),
        (x, y) => match (as_f64(x), as_f64(y)) {
            (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
            _ => Ordering::Equal,
        },
    }
}

fn apply_unwind(docs: Vec<Document>, spec: &Bson) -> Result<Vec<Document>> {
    let path = spec
        .as_str()
        .and_then(|s| s.strip_prefix('$'))
        .ok_or_else(|| Error::Internal("unwind expects a $-path".into()))?;

    let mut out = Vec::new();
    for doc in docs {
        if let Some(Bson::Array(elements)) = doc.get(path).cloned() {
            for element in elements {
                let mut unwound = doc.clone();
                unwound.insert(path, element);
                out.push(unwound);
            }
        }
    }
    Ok(out)
}

fn matches_condition(doc: &Document, field: &str, condition: &Bson) -> bool {
    let value = lookup(doc, field);
    match condition {
        Bson::Document(operators) => operators.iter().all(|(op, operand)| {
            let value = match &value {
                Some(v) => v,
                None => return false,
            };
            match op.as_str() {
                "$gte" => compare(value, operand) != Ordering::Less,
                "$lte" => compare(value, operand) != Ordering::Greater,
                "$eq" => value == operand,
                "$type" => {
                    operand.as_str() == Some("number") && as_f64(value).is_some()
                }
                _ => false,
            }
        }),
        literal => value.as_ref() == Some(literal),
    }
}

fn apply_match(docs: Vec<Document>, spec: &Bson) -> Result<Vec<Document>> {
    let conditions = spec
        .as_document()
        .ok_or_else(|| Error::Internal("match expects a document".into()))?;
    Ok(docs
        .into_iter()
        .filter(|doc| {
            conditions
                .iter()
                .all(|(field, condition)| matches_condition(doc, field, condition))
        })
        .collect())
}

enum Accumulated {
    Sum(f64),
    Avg { total: f64, count: u64 },
    Max(Bson),
}

fn apply_group(docs: Vec<Document>, spec: &Bson) -> Result<Vec<Document>> {
    let spec = spec
        .as_document()
        .ok_or_else(|| Error::Internal("group expects a document".into()))?;
    let id_expr = spec.get("_id").cloned().unwrap_or(Bson::Null);

    // Insertion-ordered groups; callers sort explicitly anyway.
    let mut keys: Vec<Bson> = Vec::new();
    let mut groups: Vec<Vec<(String, Accumulated)>> = Vec::new();

    for doc in &docs {
        let key = eval(doc, &id_expr);
        let index = match keys.iter().position(|k| k == &key) {
            Some(index) => index,
            None => {
                keys.push(key);
                let mut accumulators = Vec::new();
                for (name, acc) in spec.iter().filter(|(name, _)| *name != "_id") {
                    let acc = acc
                        .as_document()
                        .and_then(|a| a.iter().next())
                        .ok_or_else(|| Error::Internal("bad accumulator".into()))?;
                    let initial = match acc.0.as_str() {
                        "$sum" => Accumulated::Sum(0.0),
                        "$avg" => Accumulated::Avg {
                            total: 0.0,
                            count: 0,
                        },
                        "$max" => Accumulated::Max(Bson::Null),
                        other => {
                            return Err(Error::Internal(format!(
                                "unsupported accumulator: {}",
                                other
                            )))
                        }
                    };
                    accumulators.push((name.clone(), initial));
                }
                groups.push(accumulators);
                groups.len() - 1
            }
        };

        for (name, state) in groups[index].iter_mut() {
            let operand = spec
                .get_document(name)
                .ok()
                .and_then(|a| a.iter().next())
                .map(|(_, operand)| eval(doc, operand))
                .unwrap_or(Bson::Null);
            match state {
                Accumulated::Sum(total) => {
                    if let Some(v) = as_f64(&operand) {
                        *total += v;
                    }
                }
                Accumulated::Avg { total, count } => {
                    if let Some(v) = as_f64(&operand) {
                        *total += v;
                        *count += 1;
                    }
                }
                Accumulated::Max(max) => {
                    if *max == Bson::Null || compare(&operand, max) == Ordering::Greater {
                        *max = operand;
                    }
                }
            }
        }
    }

    Ok(keys
        .into_iter()
        .zip(groups)
        .map(|(key, accumulators)| {
            let mut row = doc! {"_id": key};
            for (name, state) in accumulators {
                let value = match state {
                    Accumulated::Sum(total) => Bson::Double(total),
                    Accumulated::Avg { count: 0, .. } => Bson::Null,
                    Accumulated::Avg { total, count } => Bson::Double(total / count as f64),
                    Accumulated::Max(max) => max,
                };
                row.insert(name, value);
            }
            row
        })
        .collect())
}

fn apply_sort(mut docs: Vec<Document>, spec: &Bson) -> Result<Vec<Document>> {
    let keys: Vec<(String, i32)> = spec
        .as_document()
        .ok_or_else(|| Error::Internal("sort expects a document".into()))?
        .iter()
        .map(|(field, direction)| {
            (
                field.clone(),
                direction.as_i32().unwrap_or_else(|| {
                    direction.as_i64().map(|d| d as i32).unwrap_or(1)
                }),
            )
        })
        .collect();

    docs.sort_by(|a, b| {
        for (field, direction) in &keys {
            let left = lookup(a, field).unwrap_or(Bson::Null);
            let right = lookup(b, field).unwrap_or(Bson::Null);
            let ordering = compare(&left, &right);
            let ordering = if *direction < 0 {
                ordering.reverse()
            } else {
                ordering
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
    Ok(docs)
}

fn apply_limit(docs: Vec<Document>, spec: &Bson) -> Result<Vec<Document>> {
    let limit = spec
        .as_i64()
        .or_else(|| spec.as_i32().map(i64::from))
        .ok_or_else(|| Error::Internal("limit expects an integer".into()))?;
    Ok(docs.into_iter().take(limit as usize).collect())
}

fn apply_project(docs: Vec<Document>, spec: &Bson) -> Result<Vec<Document>> {
    let spec = spec
        .as_document()
        .ok_or_else(|| Error::Internal("project expects a document".into()))?;

    Ok(docs
        .into_iter()
        .map(|doc| {
            let mut row = Document::new();
            let keep_id = spec.get("_id").map(|v| v != &Bson::Int32(0)).unwrap_or(true);
            if keep_id {
                if let Some(id) = doc.get("_id") {
                    row.insert("_id", id.clone());
                }
            }
            for (field, rule) in spec.iter().filter(|(field, _)| *field != "_id") {
                match rule {
                    Bson::String(path) if path.starts_with('$') => {
                        row.insert(field, eval(&doc, rule));
                    }
                    _ => {
                        if let Some(value) = lookup(&doc, field) {
                            row.insert(field, value);
                        }
                    }
                }
            }
            row
        })
        .collect())
}

fn apply_replace_root(docs: Vec<Document>, spec: &Bson) -> Result<Vec<Document>> {
    let new_root = spec
        .as_document()
        .and_then(|s| s.get("newRoot"))
        .ok_or_else(|| Error::Internal("replaceRoot expects newRoot".into()))?
        .clone();

    docs.into_iter()
        .map(|doc| match eval(&doc, &new_root) {
            Bson::Document(root) => Ok(root),
            other => Err(Error::Internal(format!(
                "newRoot did not resolve to a document: {}",
                other
            ))),
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Catalog fake

#[derive(Default)]
pub struct FakeCatalog {
    datasets: Mutex<BTreeMap<String, BTreeMap<NaiveDate, Vec<Document>>>>,
    pub fetched_dates: Mutex<Vec<NaiveDate>>,
}

impl FakeCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_day(&self, dataset: &str, date: NaiveDate, rows: Vec<Document>) {
        self.datasets
            .lock()
            .unwrap()
            .entry(dataset.to_string())
            .or_default()
            .insert(date, rows);
    }

    pub fn clear_fetch_log(&self) {
        self.fetched_dates.lock().unwrap().clear();
    }

    fn day_rows(&self, dataset: &str, date: NaiveDate) -> Vec<Document> {
        self.datasets
            .lock()
            .unwrap()
            .get(dataset)
            .and_then(|days| days.get(&date))
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl CatalogSource for FakeCatalog {
    async fn fetch_page(
        &self,
        dataset: &str,
        offset: u64,
        limit: u64,
        date: NaiveDate,
    ) -> Result<Page> {
        self.fetched_dates.lock().unwrap().push(date);
        let rows = self.day_rows(dataset, date);
        let total_count = rows.len() as u64;
        let records = rows
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect();
        Ok(Page {
            total_count,
            records,
        })
    }

    async fn record_count(&self, dataset: &str) -> Result<u64> {
        Ok(self
            .datasets
            .lock()
            .unwrap()
            .get(dataset)
            .map(|days| days.values().map(|rows| rows.len() as u64).sum())
            .unwrap_or(0))
    }

    async fn first_date(&self, dataset: &str) -> Result<Option<NaiveDate>> {
        Ok(self
            .datasets
            .lock()
            .unwrap()
            .get(dataset)
            .and_then(|days| days.keys().next().copied()))
    }

    async fn last_date(&self, dataset: &str) -> Result<Option<NaiveDate>> {
        Ok(self
            .datasets
            .lock()
            .unwrap()
            .get(dataset)
            .and_then(|days| days.keys().next_back().copied()))
    }

    async fn record_count_for_date(&self, dataset: &str, date: NaiveDate) -> Result<u64> {
        Ok(self.day_rows(dataset, date).len() as u64)
    }

    fn source_id(&self) -> &str {
        "fake"
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Builders

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

/// Quarter-hourly consumption rows for one day, in descending timestamp
/// order so that query-layer sorting is actually exercised.
pub fn day_rows(day: NaiveDate, count: usize) -> Vec<Document> {
    (0..count)
        .rev()
        .map(|i| {
            doc! {
                "date": fmt_date(day),
                "date_heure": format!("{}T{:02}:{:02}:00+02:00", fmt_date(day), i / 4, (i % 4) * 15),
                "consommation": 40_000 + i as i64,
            }
        })
        .collect()
}

pub fn regional_row(day: NaiveDate, hour: u32, region: &str, consommation: i64) -> Document {
    doc! {
        "date": fmt_date(day),
        "date_heure": format!("{}T{:02}:00:00+02:00", fmt_date(day), hour),
        "libelle_region": region,
        "consommation": consommation,
    }
}

pub fn national_dataset() -> DatasetConfig {
    DatasetConfig {
        id: "eco2mix-national-tr".to_string(),
        collection: "DonneesNationales".to_string(),
        date_field: "date".to_string(),
        region_field: None,
    }
}

pub fn regional_dataset() -> DatasetConfig {
    DatasetConfig {
        id: "eco2mix-regional-tr".to_string(),
        collection: "DonneesRegionales".to_string(),
        date_field: "date".to_string(),
        region_field: Some("libelle_region".to_string()),
    }
}

pub fn test_ingest_config(max_concurrent_months: usize) -> collector_core::config::IngestConfig {
    collector_core::config::IngestConfig {
        datasets: vec![national_dataset(), regional_dataset()],
        page_size: 100,
        correction_window_days: 3,
        max_retries: 3,
        retry_base_delay_ms: 1,
        max_concurrent_datasets: 2,
        max_concurrent_months,
    }
}
