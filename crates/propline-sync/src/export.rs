//! Columnar snapshot of a session's rows with a hashed manifest.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{ArrayRef, Float64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use parquet::arrow::ArrowWriter;
use propline_core::{Row, Session};
use propline_storage::{OutputStore, StoredOutput};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const SNAPSHOT_DIR: &str = "snapshots";
pub const SNAPSHOT_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub schema_version: u32,
    pub run_id: Uuid,
    pub files: Vec<SnapshotManifestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
    pub rows: usize,
}

/// Writes `<date>/snapshots/rows.parquet` and its manifest, returning the
/// manifest's absolute path.
pub async fn write_snapshot(store: &OutputStore, session: &Session) -> Result<PathBuf> {
    let rows: Vec<&Row> = session.rows().collect();
    let bytes = rows_parquet(&rows)?;

    let snapshot_dir = PathBuf::from(session.date.format("%Y-%m-%d").to_string()).join(SNAPSHOT_DIR);
    let stored = store
        .write_output(snapshot_dir.join("rows.parquet"), &bytes)
        .await?;

    let manifest = SnapshotManifest {
        schema_version: SNAPSHOT_SCHEMA_VERSION,
        run_id: session.run_id,
        files: vec![manifest_entry("rows", &stored, rows.len())],
    };
    let manifest_bytes =
        serde_json::to_vec_pretty(&manifest).context("serializing snapshot manifest")?;
    let stored = store
        .write_output(snapshot_dir.join("manifest.json"), &manifest_bytes)
        .await?;
    Ok(stored.absolute_path)
}

fn manifest_entry(name: &str, stored: &StoredOutput, rows: usize) -> SnapshotManifestFile {
    SnapshotManifestFile {
        name: name.to_string(),
        path: stored
            .relative_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default(),
        sha256: stored.content_hash.clone(),
        bytes: stored.byte_size as u64,
        rows,
    }
}

fn utf8(rows: &[&Row], value: impl Fn(&Row) -> Option<String>) -> ArrayRef {
    Arc::new(StringArray::from(
        rows.iter().map(|r| value(r)).collect::<Vec<_>>(),
    ))
}

fn float(rows: &[&Row], value: impl Fn(&Row) -> Option<f64>) -> ArrayRef {
    Arc::new(Float64Array::from(
        rows.iter().map(|r| value(r)).collect::<Vec<_>>(),
    ))
}

fn rows_parquet(rows: &[&Row]) -> Result<Vec<u8>> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("category_key", DataType::Utf8, false),
        ArrowField::new("category_label", DataType::Utf8, false),
        ArrowField::new("date", DataType::Utf8, false),
        ArrowField::new("player_name", DataType::Utf8, false),
        ArrowField::new("team", DataType::Utf8, true),
        ArrowField::new("status", DataType::Utf8, true),
        ArrowField::new("line", DataType::Float64, true),
        ArrowField::new("odds_over", DataType::Float64, true),
        ArrowField::new("odds_under", DataType::Float64, true),
        ArrowField::new("projection", DataType::Float64, true),
        ArrowField::new("diff", DataType::Float64, true),
        ArrowField::new("rank_metric", DataType::Float64, true),
        ArrowField::new("hit_rates", DataType::Utf8, false),
        ArrowField::new("raw", DataType::Utf8, false),
        ArrowField::new("signature", DataType::Utf8, false),
    ]));

    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![
            utf8(rows, |r| Some(r.category_key.clone())),
            utf8(rows, |r| Some(r.category_label.clone())),
            utf8(rows, |r| Some(r.date.format("%Y-%m-%d").to_string())),
            utf8(rows, |r| Some(r.player_name.clone())),
            utf8(rows, |r| r.team.clone()),
            utf8(rows, |r| r.status.clone()),
            float(rows, |r| r.line),
            float(rows, |r| r.odds_over),
            float(rows, |r| r.odds_under),
            float(rows, |r| r.projection),
            float(rows, |r| r.diff),
            float(rows, |r| r.rank_metric),
            utf8(rows, |r| serde_json::to_string(&r.hit_rates).ok()),
            utf8(rows, |r| serde_json::to_string(&r.raw).ok()),
            utf8(rows, |r| Some(r.signature().to_string())),
        ],
    )
    .context("building rows record batch")?;

    let mut writer =
        ArrowWriter::try_new(Vec::new(), schema, None).context("opening parquet writer")?;
    writer.write(&batch).context("writing rows record batch")?;
    writer.into_inner().context("closing parquet writer")
}
