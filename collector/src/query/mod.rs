pub mod pipeline;

pub use pipeline::{PipelineBuilder, Stage};

use crate::model::{fmt_date, parse_date_prefix};
use crate::store::DocumentStore;
use chrono::NaiveDate;
use collector_core::Result;
use mongodb::bson::{doc, Bson, Document};
use std::collections::BTreeMap;
use tracing::{error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    Descending,
}

impl SortDirection {
    fn as_i32(self) -> i32 {
        match self {
            SortDirection::Ascending => 1,
            SortDirection::Descending => -1,
        }
    }
}

/// Execute a pipeline against one collection. Backend failures are logged
/// and converted to an empty result so a bad query degrades to an empty
/// chart instead of taking the caller down.
pub async fn run(
    store: &dyn DocumentStore,
    collection: &str,
    pipeline: Vec<Document>,
) -> Vec<Document> {
    match store.aggregate(collection, pipeline).await {
        Ok(rows) => rows,
        Err(e) => {
            error!(collection, error = %e, "Aggregation failed, returning empty result");
            Vec::new()
        }
    }
}

/// Most recent date present in a collection, `None` when it is empty.
/// Unlike the canned queries this propagates store failures: the sync
/// engine must not mistake a broken store for an empty collection.
pub async fn watermark(
    store: &dyn DocumentStore,
    collection: &str,
) -> Result<Option<NaiveDate>> {
    let pipeline = vec![
        doc! {"$unwind": "$results"},
        doc! {"$sort": {"results.date": -1}},
        doc! {"$limit": 1},
        doc! {"$project": {"_id": 0, "date": "$results.date"}},
    ];

    let rows = store.aggregate(collection, pipeline).await?;
    match rows.first().and_then(|row| row.get_str("date").ok()) {
        Some(raw) => Ok(Some(parse_date_prefix(raw)?)),
        None => Ok(None),
    }
}

fn date_range_filter(
    from: NaiveDate,
    to: NaiveDate,
    region: Option<&str>,
) -> Document {
    let mut conditions = doc! {
        "results.date": {
            "$gte": fmt_date(from),
            "$lte": fmt_date(to),
        }
    };
    if let Some(region) = region {
        conditions.insert("results.libelle_region", region);
    }
    conditions
}

/// Per-key sum of each requested field, sorted by key.
pub async fn grouped_sum(
    store: &dyn DocumentStore,
    collection: &str,
    group_field: &str,
    fields: &[&str],
    direction: SortDirection,
) -> Vec<Document> {
    let mut group = doc! {"_id": format!("$results.{}", group_field)};
    let mut project = doc! {"_id": 0, group_field: "$_id"};
    for field in fields {
        group.insert(*field, doc! {"$sum": format!("$results.{}", field)});
        project.insert(*field, 1);
    }

    let pipeline = PipelineBuilder::new()
        .unwind("$results")
        .group(group)
        .sort(doc! {"_id": direction.as_i32()})
        .project(project)
        .build();

    run(store, collection, pipeline).await
}

/// All rows for exactly one date, flattened and sorted by timestamp.
pub async fn rows_for_date(
    store: &dyn DocumentStore,
    collection: &str,
    date: NaiveDate,
) -> Vec<Document> {
    rows_between(store, collection, date, date, None).await
}

/// All rows in a date range, optionally restricted to one region,
/// flattened and sorted by timestamp.
pub async fn rows_between(
    store: &dyn DocumentStore,
    collection: &str,
    from: NaiveDate,
    to: NaiveDate,
    region: Option<&str>,
) -> Vec<Document> {
    let pipeline = PipelineBuilder::new()
        .unwind("$results")
        .filter(date_range_filter(from, to, region))
        .sort(doc! {"results.date_heure": 1})
        .replace_root("$results")
        .build();

    run(store, collection, pipeline).await
}

/// One row per distinct date in the range, with one averaged column per
/// requested field.
pub async fn mean_per_date(
    store: &dyn DocumentStore,
    collection: &str,
    from: NaiveDate,
    to: NaiveDate,
    fields: &[&str],
    region: Option<&str>,
) -> Vec<Document> {
    let mut group = doc! {"_id": "$results.date"};
    let mut project = doc! {"_id": 0, "date": "$_id"};
    for field in fields {
        group.insert(*field, doc! {"$avg": format!("$results.{}", field)});
        project.insert(*field, 1);
    }

    let pipeline = PipelineBuilder::new()
        .unwind("$results")
        .filter(date_range_filter(from, to, region))
        .group(group)
        .sort(doc! {"_id": 1})
        .project(project)
        .build();

    run(store, collection, pipeline).await
}

async fn global_aggregate(
    store: &dyn DocumentStore,
    collection: &str,
    from: NaiveDate,
    to: NaiveDate,
    fields: &[&str],
    accumulator: &str,
) -> Document {
    let mut out = Document::new();

    // One pipeline per field: the numeric-type filter must not drop a row
    // for every field just because one of them holds a string or a null.
    for field in fields {
        let path = format!("results.{}", field);
        let mut conditions = date_range_filter(from, to, None);
        conditions.insert(&path, doc! {"$type": "number"});

        let pipeline = PipelineBuilder::new()
            .unwind("$results")
            .filter(conditions)
            .group(doc! {"_id": Bson::Null, "value": {accumulator: format!("${}", path)}})
            .project(doc! {"_id": 0, "value": 1})
            .build();

        let rows = run(store, collection, pipeline).await;
        match rows.first().and_then(|row| bson_f64(row.get("value")?)) {
            Some(value) => {
                out.insert(*field, value);
            }
            None => {
                warn!(collection, field, "No numeric rows in range for field");
            }
        }
    }

    out
}

/// Global per-field average over a date range. Rows where a field is
/// missing, null or non-numeric are excluded from that field's computation.
pub async fn average_values(
    store: &dyn DocumentStore,
    collection: &str,
    from: NaiveDate,
    to: NaiveDate,
    fields: &[&str],
) -> Document {
    global_aggregate(store, collection, from, to, fields, "$avg").await
}

/// Global per-field sum over a date range, with the same numeric-type
/// restriction as `average_values`.
pub async fn sum_values(
    store: &dyn DocumentStore,
    collection: &str,
    from: NaiveDate,
    to: NaiveDate,
    fields: &[&str],
) -> Document {
    global_aggregate(store, collection, from, to, fields, "$sum").await
}

/// Record holding the maximum value of `field`, carrying the requested
/// associated columns.
pub async fn max_record(
    store: &dyn DocumentStore,
    collection: &str,
    field: &str,
    carry_fields: &[&str],
) -> Option<Document> {
    let path = format!("results.{}", field);
    let mut project = doc! {"_id": 0, field: format!("${}", path)};
    for carry in carry_fields {
        project.insert(*carry, format!("$results.{}", carry));
    }

    let pipeline = vec![
        doc! {"$unwind": "$results"},
        doc! {"$match": {&path: {"$type": "number"}}},
        doc! {"$sort": {&path: -1}},
        doc! {"$limit": 1},
        doc! {"$project": project},
    ];

    run(store, collection, pipeline).await.into_iter().next()
}

/// Mean consumption per region over a date range, as a region → value map
/// sorted by region name.
pub async fn mean_consumption_by_region(
    store: &dyn DocumentStore,
    collection: &str,
    from: NaiveDate,
    to: NaiveDate,
) -> BTreeMap<String, f64> {
    let pipeline = PipelineBuilder::new()
        .unwind("$results")
        .filter(date_range_filter(from, to, None))
        .group(doc! {
            "_id": "$results.libelle_region",
            "mean_consommation": {"$avg": "$results.consommation"},
        })
        .sort(doc! {"_id": 1})
        .project(doc! {"_id": 0, "region": "$_id", "mean_consommation": 1})
        .build();

    run(store, collection, pipeline)
        .await
        .into_iter()
        .filter_map(|row| {
            let region = row.get_str("region").ok()?.to_string();
            let mean = bson_f64(row.get("mean_consommation")?)?;
            Some((region, mean))
        })
        .collect()
}

/// Latest date for which both collections have data: the earlier of the two
/// collections' own maxima, so the dashboard never shows a date one of them
/// has not reached yet.
pub async fn latest_common_date(
    store: &dyn DocumentStore,
    national: &str,
    regional: &str,
) -> Option<NaiveDate> {
    let national_max = match watermark(store, national).await {
        Ok(date) => date?,
        Err(e) => {
            error!(collection = national, error = %e, "Watermark lookup failed");
            return None;
        }
    };
    let regional_max = match watermark(store, regional).await {
        Ok(date) => date?,
        Err(e) => {
            error!(collection = regional, error = %e, "Watermark lookup failed");
            return None;
        }
    };

    Some(national_max.min(regional_max))
}

fn bson_f64(value: &Bson) -> Option<f64> {
    match value {
        Bson::Double(v) => Some(*v),
        Bson::Int32(v) => Some(*v as f64),
        Bson::Int64(v) => Some(*v as f64),
        _ => None,
    }
}

/// Replace missing, null and non-numeric values with 0 and coerce the rest
/// to integers, in place. Display columns only; row order is preserved.
pub fn coerce_zero_int(rows: &mut [Document], columns: &[&str]) {
    for row in rows.iter_mut() {
        for column in columns {
            let coerced = row.get(*column).and_then(bson_f64).unwrap_or(0.0) as i64;
            row.insert(*column, coerced);
        }
    }
}

/// Drop rows where `column` is missing or null, preserving order.
pub fn drop_null_rows(rows: Vec<Document>, column: &str) -> Vec<Document> {
    rows.into_iter()
        .filter(|row| !matches!(row.get(column), None | Some(Bson::Null)))
        .collect()
}
