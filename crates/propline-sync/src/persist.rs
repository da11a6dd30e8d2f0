//! PostgreSQL persistence: one run record plus a natural-key upsert of every
//! row, all inside a single transaction.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use propline_core::{Row, Session};
use serde::Serialize;
use sqlx::migrate::Migrator;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{Postgres, QueryBuilder, Row as _};
use tracing::info;
use uuid::Uuid;

pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

/// Stands in for a missing line or price inside the natural key. Several
/// "no line offered" rows for one player therefore share a single slot.
pub const NULL_SENTINEL: f64 = -1.0e9;

const BINDS_PER_ROW: usize = 20;
/// Kept far below PostgreSQL's 65 535 bind parameter ceiling.
const MAX_BINDS_PER_STATEMENT: usize = 20_000;
const ROWS_PER_CHUNK: usize = MAX_BINDS_PER_STATEMENT / BINDS_PER_ROW;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PersistOutcome {
    pub run_id: Uuid,
    pub inserted: usize,
    pub updated: usize,
}

pub fn key_value(value: Option<f64>) -> f64 {
    match value {
        // -0.0 and 0.0 are the same key
        Some(v) if v == 0.0 => 0.0,
        Some(v) => v,
        None => NULL_SENTINEL,
    }
}

type NaturalKey = (String, String, u64, u64, u64);

fn natural_key(row: &Row) -> NaturalKey {
    (
        row.category_key.clone(),
        row.player_name.clone(),
        key_value(row.line).to_bits(),
        key_value(row.odds_over).to_bits(),
        key_value(row.odds_under).to_bits(),
    )
}

/// One row per natural key, keeping the first-seen position and the
/// last-seen values.
pub fn collapse_natural_keys<'a>(rows: impl IntoIterator<Item = &'a Row>) -> Vec<&'a Row> {
    let mut positions: HashMap<NaturalKey, usize> = HashMap::new();
    let mut out: Vec<&Row> = Vec::new();
    for row in rows {
        match positions.entry(natural_key(row)) {
            Entry::Occupied(slot) => out[*slot.get()] = row,
            Entry::Vacant(slot) => {
                slot.insert(out.len());
                out.push(row);
            }
        }
    }
    out
}

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<()> {
        MIGRATOR
            .run(&self.pool)
            .await
            .context("running database migrations")
    }

    pub async fn persist_session(&self, session: &Session) -> Result<PersistOutcome> {
        let mut tx = self.pool.begin().await.context("opening transaction")?;

        sqlx::query(
            "INSERT INTO scrape_runs \
             (run_id, scope, scrape_date, started_at, finished_at, attempted, succeeded, rows_total, errors, discovery) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
             ON CONFLICT (run_id) DO UPDATE SET \
               finished_at = EXCLUDED.finished_at, attempted = EXCLUDED.attempted, \
               succeeded = EXCLUDED.succeeded, rows_total = EXCLUDED.rows_total, \
               errors = EXCLUDED.errors, discovery = EXCLUDED.discovery, recorded_at = now()",
        )
        .bind(session.run_id)
        .bind(session.scope.as_str())
        .bind(session.date)
        .bind(session.started_at)
        .bind(session.finished_at)
        .bind(session.summary.attempted as i32)
        .bind(session.summary.succeeded as i32)
        .bind(session.summary.rows_total as i32)
        .bind(Json(&session.errors))
        .bind(session.discovery.as_ref().map(Json))
        .execute(&mut *tx)
        .await
        .context("recording scrape run")?;

        let rows = collapse_natural_keys(session.rows());
        let collapsed = session.summary.rows_total.saturating_sub(rows.len());
        let mut inserted = 0usize;
        let mut updated = 0usize;

        for chunk in rows.chunks(ROWS_PER_CHUNK) {
            let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(
                "INSERT INTO prop_rows (run_id, scope, scrape_date, category_key, category_label, \
                 player_name, team, status, line, odds_over, odds_under, line_key, odds_over_key, \
                 odds_under_key, projection, diff, rank_metric, hit_rates, raw, signature) ",
            );
            qb.push_values(chunk.iter(), |mut b, row| {
                b.push_bind(session.run_id)
                    .push_bind(session.scope.as_str())
                    .push_bind(session.date)
                    .push_bind(row.category_key.as_str())
                    .push_bind(row.category_label.as_str())
                    .push_bind(row.player_name.as_str())
                    .push_bind(row.team.as_deref())
                    .push_bind(row.status.as_deref())
                    .push_bind(row.line)
                    .push_bind(row.odds_over)
                    .push_bind(row.odds_under)
                    .push_bind(key_value(row.line))
                    .push_bind(key_value(row.odds_over))
                    .push_bind(key_value(row.odds_under))
                    .push_bind(row.projection)
                    .push_bind(row.diff)
                    .push_bind(row.rank_metric)
                    .push_bind(Json(&row.hit_rates))
                    .push_bind(Json(&row.raw))
                    .push_bind(row.signature());
            });
            qb.push(
                " ON CONFLICT (scope, scrape_date, category_key, player_name, line_key, odds_over_key, odds_under_key) \
                 DO UPDATE SET run_id = EXCLUDED.run_id, category_label = EXCLUDED.category_label, \
                 team = EXCLUDED.team, status = EXCLUDED.status, projection = EXCLUDED.projection, \
                 diff = EXCLUDED.diff, rank_metric = EXCLUDED.rank_metric, hit_rates = EXCLUDED.hit_rates, \
                 raw = EXCLUDED.raw, signature = EXCLUDED.signature, updated_at = now() \
                 RETURNING (xmax = 0) AS inserted",
            );

            let results = qb
                .build()
                .fetch_all(&mut *tx)
                .await
                .with_context(|| format!("upserting {} prop rows", chunk.len()))?;
            for result in results {
                if result.try_get::<bool, _>("inserted")? {
                    inserted += 1;
                } else {
                    updated += 1;
                }
            }
        }

        tx.commit().await.context("committing scrape run")?;
        info!(
            run_id = %session.run_id,
            inserted,
            updated,
            collapsed,
            "session persisted"
        );
        Ok(PersistOutcome {
            run_id: session.run_id,
            inserted,
            updated,
        })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use propline_core::RowDraft;

    fn row(player: &str, line: Option<f64>, projection: Option<f64>) -> Row {
        Row::from_draft(RowDraft {
            category_key: "points".into(),
            category_label: "Points".into(),
            date: NaiveDate::from_ymd_opt(2026, 2, 24).unwrap(),
            player_name: player.into(),
            line,
            projection,
            ..Default::default()
        })
    }

    #[test]
    fn chunks_stay_under_the_bind_ceiling() {
        assert!(ROWS_PER_CHUNK * BINDS_PER_ROW <= MAX_BINDS_PER_STATEMENT);
        assert!(MAX_BINDS_PER_STATEMENT < u16::MAX as usize);
    }

    #[test]
    fn missing_values_map_to_the_sentinel() {
        assert_eq!(key_value(None), NULL_SENTINEL);
        assert_eq!(key_value(Some(-0.0)).to_bits(), 0.0f64.to_bits());
        assert_eq!(key_value(Some(25.5)), 25.5);
    }

    #[test]
    fn duplicate_natural_keys_collapse_last_wins() {
        let rows = vec![
            row("Jane Doe", Some(25.5), Some(27.0)),
            row("John Smith", Some(9.5), None),
            row("Jane Doe", Some(25.5), Some(28.0)),
            row("Jane Doe", None, Some(1.0)),
            row("Jane Doe", None, Some(2.0)),
        ];
        let collapsed = collapse_natural_keys(&rows);
        assert_eq!(collapsed.len(), 3);
        assert_eq!(collapsed[0].player_name, "Jane Doe");
        assert_eq!(collapsed[0].projection, Some(28.0));
        assert_eq!(collapsed[1].player_name, "John Smith");
        // the lossy sentinel slot keeps only the last line-less row
        assert_eq!(collapsed[2].projection, Some(2.0));
    }
}
