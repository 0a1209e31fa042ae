use arrow::array::RecordBatch;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::errors::ParquetError;
use parquet::file::properties::{EnabledStatistics, WriterProperties};
use parquet::format::KeyValue;
use std::sync::OnceLock;

const ROW_GROUP_SIZE: usize = 32 * 1024;

/// Shared writer properties: Snappy, dictionary encoding, page statistics.
///
/// No timestamps or host details are embedded, so encoding the same batch
/// twice yields identical bytes.
pub(crate) fn writer_properties() -> &'static WriterProperties {
    static PROPERTIES: OnceLock<WriterProperties> = OnceLock::new();
    PROPERTIES.get_or_init(|| {
        let metadata = vec![
            KeyValue {
                key: "journal2parquet.version".to_string(),
                value: Some(env!("CARGO_PKG_VERSION").to_string()),
            },
            KeyValue {
                key: "schema.source".to_string(),
                value: Some("pos-journal".to_string()),
            },
        ];

        WriterProperties::builder()
            .set_dictionary_enabled(true)
            .set_statistics_enabled(EnabledStatistics::Page)
            .set_compression(Compression::SNAPPY)
            .set_max_row_group_size(ROW_GROUP_SIZE)
            .set_key_value_metadata(Some(metadata))
            .build()
    })
}

/// Encode a batch as a complete Parquet file in memory. `file_metadata` is
/// appended to the footer key-value metadata.
pub(crate) fn to_parquet_bytes(
    batch: &RecordBatch,
    file_metadata: &[(String, String)],
) -> Result<Vec<u8>, ParquetError> {
    let mut buffer = Vec::new();
    let mut writer = ArrowWriter::try_new(
        &mut buffer,
        batch.schema(),
        Some(writer_properties().clone()),
    )?;
    for (key, value) in file_metadata {
        writer.append_key_value_metadata(KeyValue::new(key.clone(), value.clone()));
    }
    writer.write(batch)?;
    writer.close()?;
    Ok(buffer)
}
