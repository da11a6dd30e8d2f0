//! Run outputs, the cross-process run lock, and the WebDriver transport.

pub mod lock;
pub mod webdriver;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::NaiveDate;
use propline_core::{CategoryResult, Row, Session};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

pub use lock::{LockError, RunLock};
pub use webdriver::{WebDriverClient, WebDriverConfig, WebDriverError, ELEMENT_KEY};

pub const CRATE_NAME: &str = "propline-storage";

pub const SESSION_FILE: &str = "session.json";

/// Leading CSV columns, in order. Hit-rate columns and `raw` follow.
pub const CSV_LEADING_COLUMNS: [&str; 9] = [
    "player",
    "team",
    "status",
    "line",
    "odds_over",
    "odds_under",
    "projection",
    "diff",
    "rank_metric",
];

#[derive(Debug, Clone)]
pub struct StoredOutput {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub unchanged: bool,
}

#[derive(Debug, Clone)]
pub struct CategoryOutputs {
    pub json: StoredOutput,
    pub csv: StoredOutput,
}

/// Per-date output directory tree: `<root>/<YYYY-MM-DD>/...`.
#[derive(Debug, Clone)]
pub struct OutputStore {
    root: PathBuf,
}

impl OutputStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn date_dir(&self, date: NaiveDate) -> PathBuf {
        self.root.join(date.format("%Y-%m-%d").to_string())
    }

    /// Write bytes under the root via a temp file + rename, so readers never
    /// observe a half-written file. Identical content is left in place.
    pub async fn write_output(
        &self,
        relative_path: impl AsRef<Path>,
        bytes: &[u8],
    ) -> anyhow::Result<StoredOutput> {
        let relative_path = relative_path.as_ref().to_path_buf();
        let absolute_path = self.root.join(&relative_path);
        let content_hash = Self::sha256_hex(bytes);

        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating output directory {}", parent.display()))?;

        if let Ok(existing) = fs::read(&absolute_path).await {
            if Self::sha256_hex(&existing) == content_hash {
                return Ok(StoredOutput {
                    content_hash,
                    relative_path,
                    absolute_path,
                    byte_size: bytes.len(),
                    unchanged: true,
                });
            }
        }

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp output file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp output file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp output file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &absolute_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp output {} -> {}",
                    temp_path.display(),
                    absolute_path.display()
                )
            });
        }

        Ok(StoredOutput {
            content_hash,
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
            unchanged: false,
        })
    }

    /// `<date>/<key>.json` and `<date>/<key>.csv` for one category.
    pub async fn write_category(
        &self,
        date: NaiveDate,
        result: &CategoryResult,
    ) -> anyhow::Result<CategoryOutputs> {
        let dir = PathBuf::from(date.format("%Y-%m-%d").to_string());
        let json = serde_json::to_vec_pretty(result)
            .with_context(|| format!("serializing category {}", result.category_key))?;
        let json = self
            .write_output(dir.join(format!("{}.json", result.category_key)), &json)
            .await?;
        let csv = rows_to_csv(&result.rows);
        let csv = self
            .write_output(dir.join(format!("{}.csv", result.category_key)), csv.as_bytes())
            .await?;
        Ok(CategoryOutputs { json, csv })
    }

    pub async fn write_session(&self, session: &Session) -> anyhow::Result<StoredOutput> {
        let bytes = serde_json::to_vec_pretty(session).context("serializing session")?;
        let rel = PathBuf::from(session.date.format("%Y-%m-%d").to_string()).join(SESSION_FILE);
        self.write_output(rel, &bytes).await
    }

    pub fn load_session(&self, date: NaiveDate) -> anyhow::Result<Option<Session>> {
        let path = self.date_dir(date).join(SESSION_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let session = serde_json::from_str(&text)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(Some(session))
    }

    /// Dates that have a combined session artifact, newest first.
    pub fn session_dates(&self) -> anyhow::Result<Vec<NaiveDate>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut dates = std::fs::read_dir(&self.root)
            .with_context(|| format!("reading {}", self.root.display()))?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().join(SESSION_FILE).exists())
            .filter_map(|entry| {
                NaiveDate::parse_from_str(&entry.file_name().to_string_lossy(), "%Y-%m-%d").ok()
            })
            .collect::<Vec<_>>();
        dates.sort();
        dates.reverse();
        Ok(dates)
    }
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn csv_number(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

/// Delimited export of one category's rows.
pub fn rows_to_csv(rows: &[Row]) -> String {
    let hit_rate_columns = rows
        .iter()
        .flat_map(|r| r.hit_rates.keys().cloned())
        .collect::<BTreeSet<_>>();

    let mut header = CSV_LEADING_COLUMNS
        .iter()
        .map(|c| c.to_string())
        .collect::<Vec<_>>();
    header.extend(hit_rate_columns.iter().cloned());
    header.push("raw".to_string());

    let mut out = String::new();
    out.push_str(
        &header
            .iter()
            .map(|h| csv_field(h))
            .collect::<Vec<_>>()
            .join(","),
    );
    out.push('\n');

    for row in rows {
        let mut fields = vec![
            row.player_name.clone(),
            row.team.clone().unwrap_or_default(),
            row.status.clone().unwrap_or_default(),
            csv_number(row.line),
            csv_number(row.odds_over),
            csv_number(row.odds_under),
            csv_number(row.projection),
            csv_number(row.diff),
            csv_number(row.rank_metric),
        ];
        for column in &hit_rate_columns {
            fields.push(csv_number(row.hit_rates.get(column).copied().flatten()));
        }
        fields.push(serde_json::to_string(&row.raw).unwrap_or_default());

        out.push_str(
            &fields
                .iter()
                .map(|f| csv_field(f))
                .collect::<Vec<_>>()
                .join(","),
        );
        out.push('\n');
    }
    out
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    /// Same pause before every retry.
    pub fn fixed(max_retries: usize, delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay: delay,
            max_delay: delay,
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use propline_core::{CategoryOption, RowDraft};
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn row(player: &str, hit_rates: &[(&str, Option<f64>)]) -> Row {
        let mut raw = BTreeMap::new();
        raw.insert("Player".to_string(), player.to_string());
        Row::from_draft(RowDraft {
            category_key: "points".into(),
            category_label: "Points".into(),
            date: NaiveDate::from_ymd_opt(2026, 2, 24).unwrap(),
            player_name: player.into(),
            team: Some("BOS".into()),
            line: Some(25.5),
            odds_over: Some(-110.0),
            odds_under: Some(-110.0),
            hit_rates: hit_rates
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect(),
            raw,
            ..Default::default()
        })
    }

    #[test]
    fn output_hashing_is_stable() {
        let hash = OutputStore::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn csv_quotes_delimiters_quotes_and_newlines() {
        assert_eq!(csv_field("plain"), "plain");
        assert_eq!(csv_field("a,b"), "\"a,b\"");
        assert_eq!(csv_field("say \"hi\""), "\"say \"\"hi\"\"\"");
        assert_eq!(csv_field("two\nlines"), "\"two\nlines\"");
    }

    #[test]
    fn csv_orders_hit_rate_columns_after_fixed_columns() {
        let rows = vec![
            row("Jane Doe", &[("l5", Some(60.0)), ("h2h", None)]),
            row("John Smith", &[("2024-25", Some(55.0))]),
        ];
        let csv = rows_to_csv(&rows);
        let mut lines = csv.lines();
        assert_eq!(
            lines.next().unwrap(),
            "player,team,status,line,odds_over,odds_under,projection,diff,rank_metric,2024-25,h2h,l5,raw"
        );
        let first = lines.next().unwrap();
        assert!(first.starts_with("Jane Doe,BOS,,25.5,-110,-110,,,,,,60,"));
        assert!(first.ends_with("\"{\"\"Player\"\":\"\"Jane Doe\"\"}\""));
    }

    #[tokio::test]
    async fn rewrites_are_atomic_and_skip_identical_content() {
        let dir = tempdir().expect("tempdir");
        let store = OutputStore::new(dir.path());

        let first = store.write_output("2026-02-24/points.csv", b"a").await.expect("first");
        let same = store.write_output("2026-02-24/points.csv", b"a").await.expect("same");
        let changed = store.write_output("2026-02-24/points.csv", b"b").await.expect("changed");

        assert!(!first.unchanged);
        assert!(same.unchanged);
        assert!(!changed.unchanged);
        assert_eq!(std::fs::read(&changed.absolute_path).unwrap(), b"b");
        let leftovers = std::fs::read_dir(dir.path().join("2026-02-24"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn session_artifacts_are_written_per_date_and_reload() {
        let dir = tempdir().expect("tempdir");
        let store = OutputStore::new(dir.path());
        let date = NaiveDate::from_ymd_opt(2026, 2, 24).unwrap();
        let started = Utc.with_ymd_and_hms(2026, 2, 24, 12, 0, 0).single().unwrap();

        let option = CategoryOption::new("Points");
        let result = CategoryResult::new(&option, vec![row("Jane Doe", &[])], 42);
        let outputs = store.write_category(date, &result).await.expect("category");
        assert!(outputs.json.absolute_path.ends_with("2026-02-24/points.json"));
        assert!(outputs.csv.absolute_path.ends_with("2026-02-24/points.csv"));

        let mut rec = Session::begin(Uuid::new_v4(), "default", date, started);
        rec.push_result(result);
        let session = rec.finish(started);
        store.write_session(&session).await.expect("session");

        assert_eq!(store.session_dates().unwrap(), vec![date]);
        let loaded = store.load_session(date).unwrap().expect("present");
        assert_eq!(loaded, session);
        assert!(store
            .load_session(NaiveDate::from_ymd_opt(2026, 2, 25).unwrap())
            .unwrap()
            .is_none());
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn fixed_backoff_never_grows() {
        let policy = BackoffPolicy::fixed(2, Duration::from_millis(1500));
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(1500));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(1500));
    }
}
