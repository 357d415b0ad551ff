//! Parquet exports written ahead of every retention delete.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use arrow_array::{ArrayRef, BooleanArray, Date32Array, Float64Array, Int64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, NaiveDate, Utc};
use folio_core::{DailyHolding, DailySnapshot, MonthlySnapshot, Transaction};
use folio_storage::ArchiveStore;
use parquet::arrow::ArrowWriter;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct ArchiveManifest {
    pub schema_version: u32,
    pub kind: String,
    pub period: String,
    pub exported_at: DateTime<Utc>,
    pub files: Vec<ArchiveManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ArchiveManifestFile {
    pub name: String,
    pub path: String,
    pub rows: usize,
    pub sha256: String,
    pub bytes: u64,
}

/// One table to export: file stem plus its record batch.
pub struct ExportTable {
    pub name: &'static str,
    pub batch: RecordBatch,
}

fn days_since_epoch(date: NaiveDate) -> i32 {
    let epoch = NaiveDate::from_ymd_opt(1970, 1, 1).unwrap_or_default();
    (date - epoch).num_days() as i32
}

pub fn parquet_bytes(batch: &RecordBatch) -> Result<Vec<u8>> {
    let mut writer =
        ArrowWriter::try_new(Vec::new(), batch.schema(), None).context("opening in-memory parquet writer")?;
    writer.write(batch).context("writing record batch")?;
    writer.into_inner().context("closing parquet writer")
}

/// Writes every table plus `manifest.json` under `{kind}/{period}/` and
/// re-reads each file against its digest before returning.
pub async fn export_period(
    archive: &ArchiveStore,
    kind: &str,
    period: &str,
    tables: Vec<ExportTable>,
    now: DateTime<Utc>,
) -> Result<ArchiveManifest> {
    let mut files = Vec::with_capacity(tables.len());
    for table in tables {
        let file_name = format!("{}.parquet", table.name);
        let bytes = parquet_bytes(&table.batch).with_context(|| format!("encoding {kind}/{period}/{file_name}"))?;
        let relative = ArchiveStore::period_path(kind, period, &file_name);
        let stored = archive.write_atomic(&relative, &bytes).await?;
        if !archive.verify(&stored).await? {
            bail!("archive file {} failed verification", stored.absolute_path.display());
        }
        files.push(ArchiveManifestFile {
            name: table.name.to_string(),
            path: stored.relative_path.display().to_string(),
            rows: table.batch.num_rows(),
            sha256: stored.sha256,
            bytes: stored.byte_size,
        });
    }

    let manifest = ArchiveManifest {
        schema_version: 1,
        kind: kind.to_string(),
        period: period.to_string(),
        exported_at: now,
        files,
    };
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing archive manifest")?;
    archive
        .write_atomic(&ArchiveStore::period_path(kind, period, "manifest.json"), &bytes)
        .await?;
    Ok(manifest)
}

pub fn daily_snapshots_batch(rows: &[DailySnapshot]) -> Result<RecordBatch> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("date", DataType::Date32, false),
        ArrowField::new("portfolio_value_cents", DataType::Int64, false),
    ]));
    let dates = Date32Array::from(rows.iter().map(|r| days_since_epoch(r.date)).collect::<Vec<_>>());
    let values = Int64Array::from(rows.iter().map(|r| r.portfolio_value_cents).collect::<Vec<_>>());
    RecordBatch::try_new(schema, vec![Arc::new(dates) as ArrayRef, Arc::new(values)])
        .context("building daily_snapshots record batch")
}

pub fn daily_holdings_batch(rows: &[DailyHolding]) -> Result<RecordBatch> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("date", DataType::Date32, false),
        ArrowField::new("account_id", DataType::Utf8, false),
        ArrowField::new("symbol", DataType::Utf8, false),
        ArrowField::new("quantity", DataType::Float64, false),
        ArrowField::new("value_cents", DataType::Int64, false),
    ]));
    let dates = Date32Array::from(rows.iter().map(|r| days_since_epoch(r.date)).collect::<Vec<_>>());
    let accounts = StringArray::from(rows.iter().map(|r| r.account_id.as_str()).collect::<Vec<_>>());
    let symbols = StringArray::from(rows.iter().map(|r| r.symbol.as_str()).collect::<Vec<_>>());
    let quantities = Float64Array::from(rows.iter().map(|r| r.quantity).collect::<Vec<_>>());
    let values = Int64Array::from(rows.iter().map(|r| r.value_cents).collect::<Vec<_>>());
    RecordBatch::try_new(
        schema,
        vec![
            Arc::new(dates) as ArrayRef,
            Arc::new(accounts),
            Arc::new(symbols),
            Arc::new(quantities),
            Arc::new(values),
        ],
    )
    .context("building daily_holdings record batch")
}

pub fn monthly_snapshots_batch(rows: &[MonthlySnapshot]) -> Result<RecordBatch> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("month", DataType::Date32, false),
        ArrowField::new("account_id", DataType::Utf8, false),
        ArrowField::new("portfolio_value_cents", DataType::Int64, false),
    ]));
    let months = Date32Array::from(rows.iter().map(|r| days_since_epoch(r.month)).collect::<Vec<_>>());
    let accounts = StringArray::from(rows.iter().map(|r| r.account_id.as_str()).collect::<Vec<_>>());
    let values = Int64Array::from(rows.iter().map(|r| r.portfolio_value_cents).collect::<Vec<_>>());
    RecordBatch::try_new(schema, vec![Arc::new(months) as ArrayRef, Arc::new(accounts), Arc::new(values)])
        .context("building monthly_snapshots record batch")
}

pub fn transactions_batch(rows: &[Transaction]) -> Result<RecordBatch> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("external_id", DataType::Utf8, false),
        ArrowField::new("account_id", DataType::Utf8, false),
        ArrowField::new("date", DataType::Date32, false),
        ArrowField::new("amount_cents", DataType::Int64, false),
        ArrowField::new("name", DataType::Utf8, false),
        ArrowField::new("merchant_name", DataType::Utf8, true),
        ArrowField::new("category_id", DataType::Int64, true),
        ArrowField::new("pending", DataType::Boolean, false),
        ArrowField::new("updated_at", DataType::Utf8, false),
    ]));
    let ids = StringArray::from(rows.iter().map(|r| r.external_id.as_str()).collect::<Vec<_>>());
    let accounts = StringArray::from(rows.iter().map(|r| r.account_id.as_str()).collect::<Vec<_>>());
    let dates = Date32Array::from(rows.iter().map(|r| days_since_epoch(r.date)).collect::<Vec<_>>());
    let amounts = Int64Array::from(rows.iter().map(|r| r.amount_cents).collect::<Vec<_>>());
    let names = StringArray::from(rows.iter().map(|r| r.name.as_str()).collect::<Vec<_>>());
    let merchants = StringArray::from(rows.iter().map(|r| r.merchant_name.as_deref()).collect::<Vec<_>>());
    let categories = Int64Array::from(rows.iter().map(|r| r.category_id).collect::<Vec<_>>());
    let pending = BooleanArray::from(rows.iter().map(|r| r.pending).collect::<Vec<_>>());
    let updated = StringArray::from(rows.iter().map(|r| r.updated_at.to_rfc3339()).collect::<Vec<_>>());
    RecordBatch::try_new(
        schema,
        vec![
            Arc::new(ids) as ArrayRef,
            Arc::new(accounts),
            Arc::new(dates),
            Arc::new(amounts),
            Arc::new(names),
            Arc::new(merchants),
            Arc::new(categories),
            Arc::new(pending),
            Arc::new(updated),
        ],
    )
    .context("building transactions record batch")
}

#[cfg(test)]
mod tests {
    use std::fs::File;

    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
    use tempfile::tempdir;

    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).expect("date")
    }

    #[test]
    fn epoch_offsets() {
        assert_eq!(days_since_epoch(d(1970, 1, 1)), 0);
        assert_eq!(days_since_epoch(d(1970, 1, 31)), 30);
        assert_eq!(days_since_epoch(d(1969, 12, 31)), -1);
    }

    #[test]
    fn parquet_bytes_round_trip_row_count() {
        let rows = vec![
            DailySnapshot {
                date: d(2026, 1, 30),
                portfolio_value_cents: 100,
            },
            DailySnapshot {
                date: d(2026, 1, 31),
                portfolio_value_cents: 200,
            },
        ];
        let bytes = parquet_bytes(&daily_snapshots_batch(&rows).expect("batch")).expect("encode");
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("daily.parquet");
        std::fs::write(&path, &bytes).expect("write");
        let reader = ParquetRecordBatchReaderBuilder::try_new(File::open(&path).expect("open"))
            .expect("reader")
            .build()
            .expect("build");
        let total: usize = reader.map(|batch| batch.expect("batch").num_rows()).sum();
        assert_eq!(total, 2);
    }

    #[tokio::test]
    async fn export_writes_files_and_manifest() {
        let dir = tempdir().expect("tempdir");
        let archive = ArchiveStore::new(dir.path());
        let rows = vec![MonthlySnapshot {
            month: d(2024, 12, 1),
            account_id: "acc".into(),
            portfolio_value_cents: 5,
        }];
        let manifest = export_period(
            &archive,
            "monthly",
            "2024",
            vec![ExportTable {
                name: "monthly_snapshots",
                batch: monthly_snapshots_batch(&rows).expect("batch"),
            }],
            Utc::now(),
        )
        .await
        .expect("export");

        assert_eq!(manifest.files.len(), 1);
        assert_eq!(manifest.files[0].rows, 1);
        assert!(dir.path().join("monthly/2024/monthly_snapshots.parquet").exists());
        let written: serde_json::Value = serde_json::from_slice(
            &std::fs::read(dir.path().join("monthly/2024/manifest.json")).expect("manifest"),
        )
        .expect("json");
        assert_eq!(written["files"][0]["sha256"], manifest.files[0].sha256);
    }
}
