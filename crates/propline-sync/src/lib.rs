//! Scrape orchestration, persistence, snapshots and the read-side queries.

pub mod config;
pub mod export;
pub mod persist;
pub mod pipeline;
pub mod query;

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{Local, NaiveDate};
use propline_core::Session;
use propline_extract::{PageDriver, StaticDomPage, WebDriverPage};
use propline_storage::{LockError, OutputStore, RunLock, WebDriverClient};
use serde::Serialize;
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

pub use config::ScrapeConfig;
pub use export::{write_snapshot, SnapshotManifest, SnapshotManifestFile};
pub use persist::{collapse_natural_keys, PersistOutcome, PgStore, NULL_SENTINEL};
pub use pipeline::{ScrapePipeline, Stage};
pub use query::{filter_rows, CategorySummary, QuerySource, RowQuery, SortBy};

pub const CRATE_NAME: &str = "propline-sync";

/// Failures that end a run before or instead of its category loop.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("discovery found no selectable categories")]
    DiscoveryEmpty,
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error("writing run outputs: {0:#}")]
    Output(anyhow::Error),
    #[error("{0:#}")]
    Other(#[from] anyhow::Error),
}

impl RunError {
    pub fn is_lock_held(&self) -> bool {
        matches!(self, Self::Lock(LockError::Held { .. }))
    }
}

/// Everything one run produced. Persistence and snapshot failures are
/// recorded here rather than failing the run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub session: Session,
    pub snapshot_manifest: Option<PathBuf>,
    pub persisted: Option<PersistOutcome>,
    pub persistence_error: Option<String>,
}

impl RunReport {
    /// True when no category recorded an error. A category that scraped
    /// cleanly but found zero rows still counts as a success.
    pub fn is_success(&self) -> bool {
        self.session.is_clean()
    }
}

fn acquire_lock(config: &ScrapeConfig) -> Result<RunLock, RunError> {
    Ok(RunLock::acquire(
        &config.lock_path,
        Some(config.lock_stale_after),
    )?)
}

fn release_lock(lock: RunLock) {
    if let Err(err) = lock.release() {
        warn!(error = %err, "failed to release run lock");
    }
}

/// Runs one locked scrape against `page`, then snapshots and persists it.
pub async fn run_scrape(
    config: &ScrapeConfig,
    page: &dyn PageDriver,
    date: NaiveDate,
) -> Result<RunReport, RunError> {
    let lock = acquire_lock(config)?;
    let report = scrape_and_persist(config, page, date).await;
    release_lock(lock);
    report
}

async fn scrape_and_persist(
    config: &ScrapeConfig,
    page: &dyn PageDriver,
    date: NaiveDate,
) -> Result<RunReport, RunError> {
    let profile = config.load_profile()?;
    let pipeline = ScrapePipeline::new(config, profile);
    let session = pipeline.run(page, date).await?;

    let snapshot_manifest = match write_snapshot(pipeline.store(), &session).await {
        Ok(path) => Some(path),
        Err(err) => {
            warn!(error = %format!("{err:#}"), "snapshot export failed");
            None
        }
    };

    let (persisted, persistence_error) = match config.database_url.as_deref() {
        Some(url) => match persist_to_database(config, url, &session).await {
            Ok(outcome) => (Some(outcome), None),
            Err(err) => {
                let message = format!("{err:#}");
                warn!(error = %message, "persistence failed; file outputs are intact");
                (None, Some(message))
            }
        },
        None => {
            info!("DATABASE_URL not set; skipping persistence");
            (None, None)
        }
    };

    Ok(RunReport {
        session,
        snapshot_manifest,
        persisted,
        persistence_error,
    })
}

async fn persist_to_database(
    config: &ScrapeConfig,
    database_url: &str,
    session: &Session,
) -> anyhow::Result<PersistOutcome> {
    let store = PgStore::connect(database_url, config.db_max_connections).await?;
    let outcome = async {
        store.migrate().await?;
        store.persist_session(session).await
    }
    .await;
    store.close().await;
    outcome
}

/// Opens (or attaches to) the browser session and loads the target page.
pub async fn connect_browser(config: &ScrapeConfig) -> anyhow::Result<WebDriverPage> {
    let client = WebDriverClient::connect(config.webdriver_config())
        .await
        .with_context(|| format!("connecting to webdriver at {}", config.webdriver_url))?;
    if let Some(url) = &config.target_url {
        client
            .navigate(url)
            .await
            .with_context(|| format!("navigating to {url}"))?;
    }
    Ok(WebDriverPage::new(client))
}

/// A run from configuration: a captured HTML fixture when `fixture` is given,
/// the WebDriver browser otherwise. `date` defaults to today.
pub async fn run_configured(
    config: &ScrapeConfig,
    fixture: Option<&Path>,
    date: Option<NaiveDate>,
) -> Result<RunReport, RunError> {
    let date = date.unwrap_or_else(|| Local::now().date_naive());
    if let Some(path) = fixture {
        let page = StaticDomPage::from_file(path)?;
        return run_scrape(config, &page, date).await;
    }

    let lock = acquire_lock(config)?;
    let report = match connect_browser(config).await {
        Ok(page) => {
            let report = scrape_and_persist(config, &page, date).await;
            if let Err(err) = page.into_client().close().await {
                warn!(error = %err, "failed to close webdriver session");
            }
            report
        }
        Err(err) => Err(RunError::Other(err)),
    };
    release_lock(lock);
    report
}

pub async fn run_scrape_from_env(
    fixture: Option<&Path>,
    date: Option<NaiveDate>,
) -> Result<RunReport, RunError> {
    run_configured(&ScrapeConfig::from_env(), fixture, date).await
}

pub async fn migrate(config: &ScrapeConfig) -> anyhow::Result<()> {
    let url = config
        .database_url
        .as_deref()
        .context("DATABASE_URL must be set to run migrations")?;
    let store = PgStore::connect(url, config.db_max_connections).await?;
    let outcome = store.migrate().await;
    store.close().await;
    outcome
}

/// The database when `DATABASE_URL` connects, the output files otherwise.
pub async fn query_source(config: &ScrapeConfig) -> QuerySource {
    if let Some(url) = config.database_url.as_deref() {
        match PgStore::connect(url, config.db_max_connections).await {
            Ok(store) => {
                return QuerySource::Database {
                    store,
                    scope: config.scope.clone(),
                }
            }
            Err(err) => warn!(error = %format!("{err:#}"), "database unavailable; reading output files"),
        }
    }
    QuerySource::Files(OutputStore::new(config.output_dir.clone()))
}

pub async fn maybe_build_scheduler(config: &ScrapeConfig) -> anyhow::Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job_config = config.clone();
    let job = Job::new_async(config.scrape_cron.as_str(), move |_uuid, _lock| {
        let config = job_config.clone();
        Box::pin(async move {
            match run_configured(&config, None, None).await {
                Ok(report) => info!(
                    run_id = %report.session.run_id,
                    rows = report.session.summary.rows_total,
                    errors = report.session.errors.len(),
                    "scheduled scrape finished"
                ),
                Err(err) => warn!(error = %err, "scheduled scrape failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {}", config.scrape_cron))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

/// Starts the scheduler and blocks until Ctrl-C.
pub async fn run_scheduler(config: &ScrapeConfig) -> anyhow::Result<()> {
    let Some(mut sched) = maybe_build_scheduler(config).await? else {
        anyhow::bail!("scheduler disabled; set PROPLINE_SCHEDULER_ENABLED=1");
    };
    sched.start().await.context("starting scheduler")?;
    info!(cron = %config.scrape_cron, "scheduler running");
    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn disabled_scheduler_is_not_built() {
        let config = ScrapeConfig::default();
        assert!(maybe_build_scheduler(&config).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn enabled_scheduler_accepts_the_default_cron() {
        let config = ScrapeConfig {
            scheduler_enabled: true,
            ..Default::default()
        };
        assert!(maybe_build_scheduler(&config).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn held_lock_fails_fast() {
        let dir = tempdir().expect("tempdir");
        let config = ScrapeConfig {
            output_dir: dir.path().join("out"),
            lock_path: dir.path().join("run.lock"),
            ..Default::default()
        };
        let _held = RunLock::acquire(&config.lock_path, None).unwrap();
        let page = StaticDomPage::from_html("<html><body></body></html>");
        let date = NaiveDate::from_ymd_opt(2026, 2, 24).unwrap();

        let err = run_scrape(&config, &page, date).await.unwrap_err();
        assert!(err.is_lock_held());
    }

    #[test]
    fn empty_categories_do_not_fail_the_run() {
        use chrono::{TimeZone, Utc};
        use propline_core::{CategoryError, CategoryOption, CategoryResult};

        let started = Utc.with_ymd_and_hms(2026, 2, 24, 18, 0, 0).single().unwrap();
        let date = NaiveDate::from_ymd_opt(2026, 2, 24).unwrap();
        let report = |with_error: bool| {
            let mut rec = Session::begin(uuid::Uuid::new_v4(), "default", date, started);
            rec.push_result(CategoryResult::new(&CategoryOption::new("Blocks"), Vec::new(), 0));
            if with_error {
                rec.push_error(CategoryError {
                    category_key: "steals".into(),
                    category_label: "Steals".into(),
                    error: "no headers found".into(),
                    attempts: 3,
                });
            }
            RunReport {
                session: rec.finish(started),
                snapshot_manifest: None,
                persisted: None,
                persistence_error: None,
            }
        };

        let clean = report(false);
        assert_eq!(clean.session.summary.rows_total, 0);
        assert!(clean.is_success());
        assert!(!report(true).is_success());
    }

    #[tokio::test]
    async fn without_a_database_queries_read_output_files() {
        let dir = tempdir().expect("tempdir");
        let config = ScrapeConfig {
            output_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let source = query_source(&config).await;
        assert_eq!(source.kind(), "files");
        assert!(source.dates().await.unwrap().is_empty());
    }
}
