// Arrow schema for journal record sets.
//
// One row per journal entry, expanded repeats included. Object coordinates are
// repeated on every row so a record set stays self-describing after it is
// copied out of its partition.

use arrow::array::{
    ArrayRef, BooleanBuilder, Date32Builder, Int32Builder, Int64Builder, RecordBatch,
    StringBuilder, TimestampMicrosecondBuilder,
};
use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use arrow::error::ArrowError;
use chrono::NaiveDate;
use std::sync::{Arc, OnceLock};

use crate::journal::ParsedJournal;
use crate::queue::{IdempotencyKey, UploadEvent};

pub mod field {
    pub const IDEMPOTENCY_KEY: &str = "idempotency_key";
    pub const BUCKET: &str = "bucket";
    pub const OBJECT_PATH: &str = "object_path";
    pub const GENERATION: &str = "generation";
    pub const FILE_NAME: &str = "file_name";
    pub const LANE: &str = "lane";
    pub const LOG_DATE: &str = "log_date";
    pub const LINE_NUMBER: &str = "line_number";
    pub const TIMESTAMP: &str = "timestamp";
    pub const CATEGORY: &str = "category";
    pub const MESSAGE: &str = "message";
    pub const IS_EXPANDED: &str = "is_expanded";
    pub const EXPANSION_COUNT: &str = "expansion_count";
}

/// Returns a cached `Arc<Schema>` for journal records.
pub fn journal_schema_arc() -> Arc<Schema> {
    static SCHEMA: OnceLock<Arc<Schema>> = OnceLock::new();
    Arc::clone(SCHEMA.get_or_init(|| Arc::new(build_schema())))
}

fn build_schema() -> Schema {
    Schema::new(vec![
        Field::new(field::IDEMPOTENCY_KEY, DataType::Utf8, false),
        Field::new(field::BUCKET, DataType::Utf8, false),
        Field::new(field::OBJECT_PATH, DataType::Utf8, false),
        Field::new(field::GENERATION, DataType::Int64, false),
        Field::new(field::FILE_NAME, DataType::Utf8, false),
        Field::new(field::LANE, DataType::Int32, false),
        Field::new(field::LOG_DATE, DataType::Date32, true),
        Field::new(field::LINE_NUMBER, DataType::Int64, false),
        // Journal clocks carry no zone
        Field::new(
            field::TIMESTAMP,
            DataType::Timestamp(TimeUnit::Microsecond, None),
            false,
        ),
        Field::new(field::CATEGORY, DataType::Utf8, false),
        Field::new(field::MESSAGE, DataType::Utf8, false),
        Field::new(field::IS_EXPANDED, DataType::Boolean, false),
        Field::new(field::EXPANSION_COUNT, DataType::Int32, false),
    ])
}

fn days_since_epoch(date: NaiveDate) -> i32 {
    let epoch = NaiveDate::from_ymd_opt(1970, 1, 1).unwrap_or(NaiveDate::MIN);
    (date - epoch).num_days() as i32
}

/// Build the record batch for one parsed journal.
pub fn to_record_batch(
    key: &IdempotencyKey,
    event: &UploadEvent,
    journal: &ParsedJournal,
) -> Result<RecordBatch, ArrowError> {
    let rows = journal.entries.len();
    let lane = i32::try_from(journal.metadata.lane).unwrap_or(i32::MAX);
    let log_date = journal.metadata.log_date.map(days_since_epoch);

    let mut keys = StringBuilder::with_capacity(rows, rows * 64);
    let mut buckets = StringBuilder::new();
    let mut paths = StringBuilder::new();
    let mut generations = Int64Builder::with_capacity(rows);
    let mut file_names = StringBuilder::new();
    let mut lanes = Int32Builder::with_capacity(rows);
    let mut dates = Date32Builder::with_capacity(rows);
    let mut line_numbers = Int64Builder::with_capacity(rows);
    let mut timestamps = TimestampMicrosecondBuilder::with_capacity(rows);
    let mut categories = StringBuilder::new();
    let mut messages = StringBuilder::new();
    let mut expanded = BooleanBuilder::with_capacity(rows);
    let mut expansion_counts = Int32Builder::with_capacity(rows);

    for entry in &journal.entries {
        keys.append_value(key.as_str());
        buckets.append_value(&event.bucket);
        paths.append_value(&event.object_path);
        generations.append_value(event.generation);
        file_names.append_value(&journal.metadata.file_name);
        lanes.append_value(lane);
        dates.append_option(log_date);
        line_numbers.append_value(entry.line_number as i64);
        timestamps.append_value(entry.timestamp.and_utc().timestamp_micros());
        categories.append_value(entry.category.as_str());
        messages.append_value(&entry.message);
        expanded.append_value(entry.is_expanded);
        expansion_counts.append_value(i32::try_from(entry.expansion_count).unwrap_or(i32::MAX));
    }

    let columns: Vec<ArrayRef> = vec![
        Arc::new(keys.finish()),
        Arc::new(buckets.finish()),
        Arc::new(paths.finish()),
        Arc::new(generations.finish()),
        Arc::new(file_names.finish()),
        Arc::new(lanes.finish()),
        Arc::new(dates.finish()),
        Arc::new(line_numbers.finish()),
        Arc::new(timestamps.finish()),
        Arc::new(categories.finish()),
        Arc::new(messages.finish()),
        Arc::new(expanded.finish()),
        Arc::new(expansion_counts.finish()),
    ];

    RecordBatch::try_new(journal_schema_arc(), columns)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::parse_journal;
    use arrow::array::{Array, BooleanArray, Date32Array, StringArray};

    #[test]
    fn batch_has_one_row_per_entry() {
        let content = b"\
11/30/25 08:00:00.000 SERIAL poll
    (Above Line Repeated 2 Times)
11/30/25 08:00:01.000 METRIC cpu=3
";
        let event = UploadEvent::new("journals", "acme/0042/jrnl0002.txt", 7);
        let key = event.idempotency_key();
        let journal = parse_journal("jrnl0002.txt", content).unwrap();

        let batch = to_record_batch(&key, &event, &journal).unwrap();
        assert_eq!(batch.num_rows(), 4);
        assert_eq!(batch.schema(), journal_schema_arc());

        let categories = batch
            .column_by_name(field::CATEGORY)
            .unwrap()
            .as_any()
            .downcast_ref::<StringArray>()
            .unwrap();
        assert_eq!(categories.value(3), "METRIC");

        let expanded = batch
            .column_by_name(field::IS_EXPANDED)
            .unwrap()
            .as_any()
            .downcast_ref::<BooleanArray>()
            .unwrap();
        assert!(!expanded.value(0));
        assert!(expanded.value(1) && expanded.value(2));

        let dates = batch
            .column_by_name(field::LOG_DATE)
            .unwrap()
            .as_any()
            .downcast_ref::<Date32Array>()
            .unwrap();
        let expected = NaiveDate::from_ymd_opt(2025, 11, 30).unwrap();
        assert_eq!(dates.value(0), days_since_epoch(expected));
        assert_eq!(dates.null_count(), 0);
    }

    #[test]
    fn empty_journal_gives_empty_batch() {
        let event = UploadEvent::new("journals", "jrnl0001.txt", 1);
        let journal = parse_journal("jrnl0001.txt", b"").unwrap();
        let batch = to_record_batch(&event.idempotency_key(), &event, &journal).unwrap();
        assert_eq!(batch.num_rows(), 0);
    }
}
