//! The per-category scrape loop: select, await refresh, collect, write.
//!
//! Categories run strictly one after another against one page. A category
//! that keeps failing is recorded as an isolated error and the loop moves on.

use std::fmt;

use chrono::{NaiveDate, Utc};
use propline_core::{CategoryError, CategoryOption, CategoryResult, Session, SessionRecorder};
use propline_extract::{
    collect_rows, default_strategies, discover_with, select_category, table_signature,
    wait_for_headers, wait_for_refresh, ExtractionProfile, LocatorStrategy, PageDriver, RowContext,
};
use propline_storage::{BackoffPolicy, OutputStore};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::ScrapeConfig;
use crate::RunError;

/// Where in its lifecycle a category attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Selecting,
    AwaitingRefresh,
    Collecting,
    Writing,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Selecting => "selecting",
            Self::AwaitingRefresh => "awaiting-refresh",
            Self::Collecting => "collecting",
            Self::Writing => "writing",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
struct AttemptFailure {
    stage: Stage,
    error: anyhow::Error,
}

impl AttemptFailure {
    fn new(stage: Stage, error: impl Into<anyhow::Error>) -> Self {
        Self {
            stage,
            error: error.into(),
        }
    }
}

pub struct ScrapePipeline {
    profile: ExtractionProfile,
    store: OutputStore,
    scope: String,
    retry: BackoffPolicy,
    strategies: Vec<Box<dyn LocatorStrategy>>,
}

impl ScrapePipeline {
    pub fn new(config: &ScrapeConfig, profile: ExtractionProfile) -> Self {
        Self {
            profile,
            store: OutputStore::new(config.output_dir.clone()),
            scope: config.scope.clone(),
            retry: config.retry_policy(),
            strategies: default_strategies(),
        }
    }

    pub fn with_strategies(mut self, strategies: Vec<Box<dyn LocatorStrategy>>) -> Self {
        self.strategies = strategies;
        self
    }

    pub fn store(&self) -> &OutputStore {
        &self.store
    }

    pub fn profile(&self) -> &ExtractionProfile {
        &self.profile
    }

    fn max_attempts(&self) -> u32 {
        self.retry.max_retries as u32 + 1
    }

    /// Discovers the categories on `page` and scrapes each of them.
    pub async fn run(&self, page: &dyn PageDriver, date: NaiveDate) -> Result<Session, RunError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("scrape_run", %run_id, scope = %self.scope, %date);
        async move {
            let report = discover_with(page, &self.profile, &self.strategies).await;
            if report.options.is_empty() {
                warn!(headers = report.headers.len(), "discovery found no categories");
                return Err(RunError::DiscoveryEmpty);
            }
            info!(
                strategy = report.strategy_used.as_deref().unwrap_or("none"),
                categories = report.options.len(),
                "discovery complete"
            );

            let mut recorder = Session::begin(run_id, self.scope.clone(), date, Utc::now());
            recorder.set_discovery(report.diagnostics());
            self.scrape_into(page, &mut recorder, &report.options).await;
            self.finish(recorder).await
        }
        .instrument(span)
        .await
    }

    /// Scrapes a known category list, skipping discovery.
    pub async fn scrape_categories(
        &self,
        page: &dyn PageDriver,
        date: NaiveDate,
        options: &[CategoryOption],
    ) -> Result<Session, RunError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("scrape_run", %run_id, scope = %self.scope, %date);
        async move {
            let mut recorder = Session::begin(run_id, self.scope.clone(), date, Utc::now());
            self.scrape_into(page, &mut recorder, options).await;
            self.finish(recorder).await
        }
        .instrument(span)
        .await
    }

    async fn scrape_into(
        &self,
        page: &dyn PageDriver,
        recorder: &mut SessionRecorder,
        options: &[CategoryOption],
    ) {
        let mut last_signature = match table_signature(page, &self.profile).await {
            Ok(signature) => signature,
            Err(err) => {
                debug!(error = %err, "no initial table signature");
                String::new()
            }
        };

        for option in options {
            let span = info_span!("category", key = %option.key);
            let outcome = self
                .scrape_category(page, option, recorder.date(), &mut last_signature)
                .instrument(span)
                .await;
            match outcome {
                Ok(result) => recorder.push_result(result),
                Err(error) => recorder.push_error(error),
            }
        }
    }

    async fn scrape_category(
        &self,
        page: &dyn PageDriver,
        option: &CategoryOption,
        date: NaiveDate,
        last_signature: &mut String,
    ) -> Result<CategoryResult, CategoryError> {
        let max_attempts = self.max_attempts();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.attempt(page, option, date, last_signature).await {
                Ok(result) => {
                    info!(
                        rows = result.row_count,
                        attempt,
                        duration_ms = result.duration_ms,
                        "category scraped"
                    );
                    return Ok(result);
                }
                Err(failure) if attempt < max_attempts => {
                    warn!(
                        attempt,
                        stage = %failure.stage,
                        error = %failure.error,
                        "category attempt failed, retrying"
                    );
                    sleep(self.retry.delay_for_attempt(attempt as usize - 1)).await;
                }
                Err(failure) => {
                    warn!(
                        attempts = attempt,
                        stage = %failure.stage,
                        error = %failure.error,
                        "category failed"
                    );
                    return Err(CategoryError {
                        category_key: option.key.clone(),
                        category_label: option.label.clone(),
                        error: format!("{:#}", failure.error),
                        attempts: attempt,
                    });
                }
            }
        }
    }

    async fn attempt(
        &self,
        page: &dyn PageDriver,
        option: &CategoryOption,
        date: NaiveDate,
        last_signature: &mut String,
    ) -> Result<CategoryResult, AttemptFailure> {
        let started = Instant::now();

        let via = select_category(page, option, &self.profile)
            .await
            .map_err(|err| AttemptFailure::new(Stage::Selecting, err))?;
        debug!(?via, "category selected");

        let signature = wait_for_refresh(page, last_signature.as_str(), &self.profile).await;
        *last_signature = signature;
        let headers = wait_for_headers(page, &option.label, &self.profile)
            .await
            .map_err(|err| AttemptFailure::new(Stage::AwaitingRefresh, err))?;

        let ctx = RowContext { option, date };
        let rows = collect_rows(page, &headers, &ctx, &self.profile)
            .await
            .map_err(|err| AttemptFailure::new(Stage::Collecting, err))?;

        let result = CategoryResult::new(option, rows, started.elapsed().as_millis() as u64);
        self.store
            .write_category(date, &result)
            .await
            .map_err(|err| AttemptFailure::new(Stage::Writing, err))?;
        Ok(result)
    }

    async fn finish(&self, recorder: SessionRecorder) -> Result<Session, RunError> {
        let session = recorder.finish(Utc::now());
        let stored = self
            .store
            .write_session(&session)
            .await
            .map_err(RunError::Output)?;
        info!(
            attempted = session.summary.attempted,
            succeeded = session.summary.succeeded,
            rows = session.summary.rows_total,
            errors = session.errors.len(),
            path = %stored.relative_path.display(),
            "session written"
        );
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use propline_extract::StaticDomPage;
    use std::time::Duration;
    use tempfile::tempdir;

    fn config(dir: &std::path::Path) -> ScrapeConfig {
        ScrapeConfig {
            output_dir: dir.to_path_buf(),
            retry_backoff: Duration::from_millis(50),
            ..Default::default()
        }
    }

    #[test]
    fn stages_render_as_lifecycle_names() {
        assert_eq!(Stage::AwaitingRefresh.to_string(), "awaiting-refresh");
        assert_eq!(Stage::Writing.to_string(), "writing");
    }

    #[tokio::test(start_paused = true)]
    async fn pages_without_a_control_fail_with_discovery_empty() {
        let dir = tempdir().expect("tempdir");
        let pipeline = ScrapePipeline::new(&config(dir.path()), ExtractionProfile::default());
        let page = StaticDomPage::from_html("<html><body><p>maintenance</p></body></html>");
        let date = NaiveDate::from_ymd_opt(2026, 2, 24).unwrap();

        let err = pipeline.run(&page, date).await.unwrap_err();
        assert!(matches!(err, RunError::DiscoveryEmpty));
        assert!(pipeline.store().load_session(date).unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn headerless_categories_are_retried_then_isolated() {
        let dir = tempdir().expect("tempdir");
        let pipeline = ScrapePipeline::new(&config(dir.path()), ExtractionProfile::default());
        let page = StaticDomPage::from_html(
            r#"<html><body><nav><button role="tab" data-category="Points">Points</button></nav>
            <p>no table yet</p></body></html>"#,
        );
        let date = NaiveDate::from_ymd_opt(2026, 2, 24).unwrap();

        let session = pipeline
            .scrape_categories(&page, date, &[CategoryOption::new("Points")])
            .await
            .unwrap();
        assert_eq!(session.summary.succeeded, 0);
        assert_eq!(session.errors.len(), 1);
        assert_eq!(session.errors[0].attempts, 3);
        assert!(session.errors[0].error.contains("headers never rendered"));
        assert_eq!(page.clicked().len(), 3);
    }
}
