//! Read side: dates, categories and rows, from PostgreSQL or from the
//! `session.json` files when no database is configured.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use propline_core::{Row, RowDraft};
use propline_storage::OutputStore;
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::{Postgres, QueryBuilder, Row as _};

use crate::persist::PgStore;

pub const DEFAULT_ROW_LIMIT: usize = 500;
pub const MAX_ROW_LIMIT: usize = 5_000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortBy {
    #[default]
    Player,
    Line,
    Diff,
    Projection,
    RankMetric,
}

impl SortBy {
    fn column(self) -> &'static str {
        match self {
            Self::Player => "player_name",
            Self::Line => "line",
            Self::Diff => "diff",
            Self::Projection => "projection",
            Self::RankMetric => "rank_metric",
        }
    }

    fn numeric(self, row: &Row) -> Option<f64> {
        match self {
            Self::Player => None,
            Self::Line => row.line,
            Self::Diff => row.diff,
            Self::Projection => row.projection,
            Self::RankMetric => row.rank_metric,
        }
    }
}

impl FromStr for SortBy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "player" => Ok(Self::Player),
            "line" => Ok(Self::Line),
            "diff" => Ok(Self::Diff),
            "projection" | "proj" => Ok(Self::Projection),
            "rank_metric" | "rank" => Ok(Self::RankMetric),
            other => Err(format!("unknown sort field `{other}`")),
        }
    }
}

/// Row lookup for one date. Player sorts ascending; numeric sorts put the
/// largest values first and missing values last.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RowQuery {
    pub date: NaiveDate,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub player: Option<String>,
    #[serde(default)]
    pub sort: SortBy,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl RowQuery {
    pub fn new(date: NaiveDate) -> Self {
        Self {
            date,
            category: None,
            player: None,
            sort: SortBy::default(),
            limit: None,
        }
    }

    pub fn effective_limit(&self) -> usize {
        self.limit
            .unwrap_or(DEFAULT_ROW_LIMIT)
            .clamp(1, MAX_ROW_LIMIT)
    }

    fn player_filter(&self) -> Option<String> {
        self.player
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_lowercase)
    }

    fn category_filter(&self) -> Option<&str> {
        self.category.as_deref().map(str::trim).filter(|c| !c.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategorySummary {
    pub key: String,
    pub label: String,
    pub rows: usize,
}

/// Where queries are answered from.
#[derive(Debug, Clone)]
pub enum QuerySource {
    Database { store: PgStore, scope: String },
    Files(OutputStore),
}

impl QuerySource {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Database { .. } => "database",
            Self::Files(_) => "files",
        }
    }

    pub async fn dates(&self) -> Result<Vec<NaiveDate>> {
        match self {
            Self::Database { store, scope } => {
                let rows = sqlx::query(
                    "SELECT DISTINCT scrape_date FROM prop_rows WHERE scope = $1 ORDER BY scrape_date DESC",
                )
                .bind(scope.as_str())
                .fetch_all(store.pool())
                .await
                .context("listing dates")?;
                rows.iter()
                    .map(|r| r.try_get::<NaiveDate, _>("scrape_date").map_err(anyhow::Error::from))
                    .collect()
            }
            Self::Files(files) => files.session_dates(),
        }
    }

    pub async fn categories(&self, date: NaiveDate) -> Result<Vec<CategorySummary>> {
        match self {
            Self::Database { store, scope } => {
                let rows = sqlx::query(
                    "SELECT category_key, MAX(category_label) AS category_label, COUNT(*) AS row_count \
                     FROM prop_rows WHERE scope = $1 AND scrape_date = $2 \
                     GROUP BY category_key ORDER BY category_key",
                )
                .bind(scope.as_str())
                .bind(date)
                .fetch_all(store.pool())
                .await
                .with_context(|| format!("listing categories for {date}"))?;
                rows.iter()
                    .map(|r| -> Result<CategorySummary> {
                        Ok(CategorySummary {
                            key: r.try_get("category_key")?,
                            label: r.try_get("category_label")?,
                            rows: r.try_get::<i64, _>("row_count")? as usize,
                        })
                    })
                    .collect()
            }
            Self::Files(files) => {
                let Some(session) = files.load_session(date)? else {
                    return Ok(Vec::new());
                };
                let mut out = session
                    .results
                    .iter()
                    .map(|r| CategorySummary {
                        key: r.category_key.clone(),
                        label: r.category_label.clone(),
                        rows: r.row_count,
                    })
                    .collect::<Vec<_>>();
                out.sort_by(|a, b| a.key.cmp(&b.key));
                Ok(out)
            }
        }
    }

    pub async fn rows(&self, query: &RowQuery) -> Result<Vec<Row>> {
        match self {
            Self::Database { store, scope } => rows_from_db(store, scope, query).await,
            Self::Files(files) => {
                let rows = files
                    .load_session(query.date)?
                    .map(|s| s.rows().cloned().collect())
                    .unwrap_or_default();
                Ok(filter_rows(rows, query))
            }
        }
    }
}

/// Applies a query's filters, ordering and limit to in-memory rows.
pub fn filter_rows(rows: Vec<Row>, query: &RowQuery) -> Vec<Row> {
    let category = query.category_filter();
    let player = query.player_filter();
    let mut rows = rows
        .into_iter()
        .filter(|r| category.map_or(true, |c| r.category_key == c))
        .filter(|r| {
            player
                .as_deref()
                .map_or(true, |p| r.player_name.to_lowercase().contains(p))
        })
        .collect::<Vec<_>>();

    let sort = query.sort;
    rows.sort_by(|a, b| match sort {
        SortBy::Player => a.player_name.cmp(&b.player_name),
        _ => match (sort.numeric(a), sort.numeric(b)) {
            (Some(x), Some(y)) => y.partial_cmp(&x).unwrap_or(Ordering::Equal),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        }
        .then_with(|| a.player_name.cmp(&b.player_name)),
    });
    rows.truncate(query.effective_limit());
    rows
}

async fn rows_from_db(store: &PgStore, scope: &str, query: &RowQuery) -> Result<Vec<Row>> {
    let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(
        "SELECT category_key, category_label, scrape_date, player_name, team, status, line, \
         odds_over, odds_under, projection, diff, rank_metric, hit_rates, raw \
         FROM prop_rows WHERE scope = ",
    );
    qb.push_bind(scope);
    qb.push(" AND scrape_date = ").push_bind(query.date);
    if let Some(category) = query.category_filter() {
        qb.push(" AND category_key = ").push_bind(category);
    }
    if let Some(player) = query.player_filter() {
        qb.push(" AND LOWER(player_name) LIKE ")
            .push_bind(format!("%{}%", player.replace('%', "\\%").replace('_', "\\_")));
    }
    match query.sort {
        SortBy::Player => qb.push(" ORDER BY player_name ASC"),
        other => qb
            .push(" ORDER BY ")
            .push(other.column())
            .push(" DESC NULLS LAST, player_name ASC"),
    };
    qb.push(" LIMIT ").push_bind(query.effective_limit() as i64);

    let rows = qb
        .build()
        .fetch_all(store.pool())
        .await
        .with_context(|| format!("fetching rows for {}", query.date))?;

    rows.iter()
        .map(|r| -> Result<Row> {
            let hit_rates: Json<BTreeMap<String, Option<f64>>> = r.try_get("hit_rates")?;
            let raw: Json<BTreeMap<String, String>> = r.try_get("raw")?;
            Ok(Row::from_draft(RowDraft {
                category_key: r.try_get("category_key")?,
                category_label: r.try_get("category_label")?,
                date: r.try_get("scrape_date")?,
                player_name: r.try_get("player_name")?,
                team: r.try_get("team")?,
                status: r.try_get("status")?,
                line: r.try_get("line")?,
                odds_over: r.try_get("odds_over")?,
                odds_under: r.try_get("odds_under")?,
                projection: r.try_get("projection")?,
                diff: r.try_get("diff")?,
                rank_metric: r.try_get("rank_metric")?,
                hit_rates: hit_rates.0,
                raw: raw.0,
            }))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(category: &str, player: &str, diff: Option<f64>) -> Row {
        Row::from_draft(RowDraft {
            category_key: category.into(),
            category_label: category.into(),
            date: NaiveDate::from_ymd_opt(2026, 2, 24).unwrap(),
            player_name: player.into(),
            diff,
            ..Default::default()
        })
    }

    fn rows() -> Vec<Row> {
        vec![
            row("points", "Marcus Hale", Some(-1.4)),
            row("points", "Devin Park", None),
            row("points", "Aaron Kim", Some(3.2)),
            row("assists", "Marcus Hale", Some(0.5)),
        ]
    }

    #[test]
    fn limit_defaults_and_clamps() {
        let mut query = RowQuery::new(NaiveDate::from_ymd_opt(2026, 2, 24).unwrap());
        assert_eq!(query.effective_limit(), 500);
        query.limit = Some(50_000);
        assert_eq!(query.effective_limit(), 5_000);
        query.limit = Some(0);
        assert_eq!(query.effective_limit(), 1);
    }

    #[test]
    fn sort_names_parse_loosely() {
        assert_eq!("rank-metric".parse::<SortBy>(), Ok(SortBy::RankMetric));
        assert_eq!(" Diff ".parse::<SortBy>(), Ok(SortBy::Diff));
        assert!("volume".parse::<SortBy>().is_err());
    }

    #[test]
    fn numeric_sorts_put_missing_values_last() {
        let mut query = RowQuery::new(NaiveDate::from_ymd_opt(2026, 2, 24).unwrap());
        query.category = Some("points".into());
        query.sort = SortBy::Diff;
        let names: Vec<String> = filter_rows(rows(), &query)
            .into_iter()
            .map(|r| r.player_name)
            .collect();
        assert_eq!(names, vec!["Aaron Kim", "Marcus Hale", "Devin Park"]);
    }

    #[test]
    fn player_filter_is_a_case_insensitive_substring() {
        let mut query = RowQuery::new(NaiveDate::from_ymd_opt(2026, 2, 24).unwrap());
        query.player = Some("hale".into());
        let found = filter_rows(rows(), &query);
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].category_key, "points");
        assert_eq!(found[1].category_key, "assists");
    }
}
