//! Core domain model for propline: categories, rows, sessions.

pub mod parse;

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use parse::{category_key, parse_line, parse_number, parse_odds, row_signature};

pub const CRATE_NAME: &str = "propline-core";

/// One selectable prop category (points, assists, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CategoryOption {
    pub label: String,
    pub key: String,
}

impl CategoryOption {
    pub fn new(label: impl Into<String>) -> Self {
        let label = label.into().trim().to_string();
        let key = category_key(&label);
        Self { label, key }
    }
}

/// Parsed fields of one table row before its identity is derived.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RowDraft {
    pub category_key: String,
    pub category_label: String,
    pub date: NaiveDate,
    pub player_name: String,
    pub team: Option<String>,
    pub status: Option<String>,
    pub line: Option<f64>,
    pub odds_over: Option<f64>,
    pub odds_under: Option<f64>,
    pub projection: Option<f64>,
    pub diff: Option<f64>,
    pub rank_metric: Option<f64>,
    pub hit_rates: BTreeMap<String, Option<f64>>,
    pub raw: BTreeMap<String, String>,
}

/// One player/category/line observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Row {
    pub category_key: String,
    pub category_label: String,
    pub date: NaiveDate,
    pub player_name: String,
    pub team: Option<String>,
    pub status: Option<String>,
    pub line: Option<f64>,
    pub odds_over: Option<f64>,
    pub odds_under: Option<f64>,
    pub projection: Option<f64>,
    pub diff: Option<f64>,
    pub rank_metric: Option<f64>,
    #[serde(default)]
    pub hit_rates: BTreeMap<String, Option<f64>>,
    #[serde(default)]
    pub raw: BTreeMap<String, String>,
    signature: String,
}

impl Row {
    pub fn from_draft(draft: RowDraft) -> Self {
        let signature = row_signature(
            &draft.category_key,
            &draft.player_name,
            draft.team.as_deref(),
            draft.line,
            draft.odds_over,
            draft.odds_under,
            &draft.raw,
        );
        Self {
            category_key: draft.category_key,
            category_label: draft.category_label,
            date: draft.date,
            player_name: draft.player_name,
            team: draft.team,
            status: draft.status,
            line: draft.line,
            odds_over: draft.odds_over,
            odds_under: draft.odds_under,
            projection: draft.projection,
            diff: draft.diff,
            rank_metric: draft.rank_metric,
            hit_rates: draft.hit_rates,
            raw: draft.raw,
            signature,
        }
    }

    pub fn signature(&self) -> &str {
        &self.signature
    }
}

impl From<RowDraft> for Row {
    fn from(draft: RowDraft) -> Self {
        Self::from_draft(draft)
    }
}

/// Outcome of one successfully scraped category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryResult {
    pub category_key: String,
    pub category_label: String,
    pub rows: Vec<Row>,
    pub row_count: usize,
    pub duration_ms: u64,
}

impl CategoryResult {
    pub fn new(option: &CategoryOption, rows: Vec<Row>, duration_ms: u64) -> Self {
        Self {
            category_key: option.key.clone(),
            category_label: option.label.clone(),
            row_count: rows.len(),
            rows,
            duration_ms,
        }
    }
}

/// A category that exhausted its attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryError {
    pub category_key: String,
    pub category_label: String,
    pub error: String,
    pub attempts: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub attempted: usize,
    pub succeeded: usize,
    pub rows_total: usize,
}

/// What discovery saw on the page, kept for troubleshooting DOM drift.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryDiagnostics {
    pub strategy_used: Option<String>,
    pub option_count: usize,
    pub headers: Vec<String>,
    pub sample_rows: Vec<Vec<String>>,
}

/// One complete run across all categories for one date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub run_id: Uuid,
    pub scope: String,
    pub date: NaiveDate,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(default)]
    pub discovery: Option<DiscoveryDiagnostics>,
    pub results: Vec<CategoryResult>,
    pub errors: Vec<CategoryError>,
    pub summary: SessionSummary,
}

impl Session {
    /// Starts recording a session. The returned recorder is the only way to
    /// append results; [`SessionRecorder::finish`] seals it.
    pub fn begin(
        run_id: Uuid,
        scope: impl Into<String>,
        date: NaiveDate,
        started_at: DateTime<Utc>,
    ) -> SessionRecorder {
        SessionRecorder {
            run_id,
            scope: scope.into(),
            date,
            started_at,
            discovery: None,
            results: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn rows(&self) -> impl Iterator<Item = &Row> {
        self.results.iter().flat_map(|r| r.rows.iter())
    }

    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct SessionRecorder {
    run_id: Uuid,
    scope: String,
    date: NaiveDate,
    started_at: DateTime<Utc>,
    discovery: Option<DiscoveryDiagnostics>,
    results: Vec<CategoryResult>,
    errors: Vec<CategoryError>,
}

impl SessionRecorder {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn date(&self) -> NaiveDate {
        self.date
    }

    pub fn set_discovery(&mut self, diagnostics: DiscoveryDiagnostics) {
        self.discovery = Some(diagnostics);
    }

    pub fn push_result(&mut self, result: CategoryResult) {
        self.results.push(result);
    }

    pub fn push_error(&mut self, error: CategoryError) {
        self.errors.push(error);
    }

    pub fn finish(self, finished_at: DateTime<Utc>) -> Session {
        let summary = SessionSummary {
            attempted: self.results.len() + self.errors.len(),
            succeeded: self.results.len(),
            rows_total: self.results.iter().map(|r| r.row_count).sum(),
        };
        Session {
            run_id: self.run_id,
            scope: self.scope,
            date: self.date,
            started_at: self.started_at,
            finished_at,
            discovery: self.discovery,
            results: self.results,
            errors: self.errors,
            summary,
        }
    }
}
