use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use propline_extract::ExtractionProfile;
use propline_storage::{BackoffPolicy, WebDriverConfig};

#[derive(Debug, Clone)]
pub struct ScrapeConfig {
    pub database_url: Option<String>,
    pub output_dir: PathBuf,
    pub lock_path: PathBuf,
    pub lock_stale_after: Duration,
    /// Owning identifier stamped on every persisted run and row.
    pub scope: String,
    pub profile_path: Option<PathBuf>,
    pub max_attempts: u32,
    pub retry_backoff: Duration,
    pub db_max_connections: u32,
    pub scheduler_enabled: bool,
    pub scrape_cron: String,
    pub webdriver_url: String,
    pub webdriver_session_id: Option<String>,
    pub browser_profile_dir: Option<PathBuf>,
    pub target_url: Option<String>,
    pub web_port: u16,
}

impl Default for ScrapeConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            output_dir: PathBuf::from("./output"),
            lock_path: PathBuf::from("./output/.propline.lock"),
            lock_stale_after: Duration::from_secs(2 * 60 * 60),
            scope: "default".to_string(),
            profile_path: None,
            max_attempts: 3,
            retry_backoff: Duration::from_millis(2_000),
            db_max_connections: 5,
            scheduler_enabled: false,
            scrape_cron: "0 0 10 * * *".to_string(),
            webdriver_url: "http://localhost:9515".to_string(),
            webdriver_session_id: None,
            browser_profile_dir: None,
            target_url: None,
            web_port: 8000,
        }
    }
}

impl ScrapeConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from any key lookup; unset or unparsable values keep
    /// their defaults. Empty strings count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let parsed = |key: &str| get(key).and_then(|v| v.parse::<u64>().ok());
        let defaults = Self::default();

        Self {
            database_url: get("DATABASE_URL"),
            output_dir: get("PROPLINE_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.output_dir),
            lock_path: get("PROPLINE_LOCK_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.lock_path),
            lock_stale_after: parsed("PROPLINE_LOCK_STALE_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.lock_stale_after),
            scope: get("PROPLINE_SCOPE").unwrap_or(defaults.scope),
            profile_path: get("PROPLINE_PROFILE").map(PathBuf::from),
            max_attempts: parsed("PROPLINE_MAX_ATTEMPTS")
                .map(|v| v.clamp(1, 20) as u32)
                .unwrap_or(defaults.max_attempts),
            retry_backoff: parsed("PROPLINE_RETRY_BACKOFF_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry_backoff),
            db_max_connections: parsed("PROPLINE_DB_MAX_CONNECTIONS")
                .map(|v| v.clamp(1, 100) as u32)
                .unwrap_or(defaults.db_max_connections),
            scheduler_enabled: get("PROPLINE_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            scrape_cron: get("PROPLINE_SCRAPE_CRON").unwrap_or(defaults.scrape_cron),
            webdriver_url: get("WEBDRIVER_URL").unwrap_or(defaults.webdriver_url),
            webdriver_session_id: get("WEBDRIVER_SESSION_ID"),
            browser_profile_dir: get("PROPLINE_BROWSER_PROFILE_DIR").map(PathBuf::from),
            target_url: get("PROPLINE_TARGET_URL"),
            web_port: get("PROPLINE_WEB_PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.web_port),
        }
    }

    pub fn load_profile(&self) -> Result<ExtractionProfile> {
        match &self.profile_path {
            Some(path) => ExtractionProfile::from_yaml_file(path),
            None => Ok(ExtractionProfile::default()),
        }
    }

    pub fn webdriver_config(&self) -> WebDriverConfig {
        WebDriverConfig {
            server_url: self.webdriver_url.clone(),
            session_id: self.webdriver_session_id.clone(),
            browser_profile_dir: self.browser_profile_dir.clone(),
            ..Default::default()
        }
    }

    /// Pause schedule between category attempts.
    pub fn retry_policy(&self) -> BackoffPolicy {
        BackoffPolicy::fixed(self.max_attempts.saturating_sub(1) as usize, self.retry_backoff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::path::Path;

    #[test]
    fn unset_values_fall_back_to_defaults() {
        let config = ScrapeConfig::from_lookup(|_| None);
        assert_eq!(config.database_url, None);
        assert_eq!(config.output_dir, PathBuf::from("./output"));
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.scope, "default");
        assert!(!config.scheduler_enabled);
        assert_eq!(config.web_port, 8000);
    }

    #[test]
    fn env_values_override_and_bad_numbers_are_ignored() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("DATABASE_URL", "postgres://propline@localhost/propline"),
            ("PROPLINE_OUTPUT_DIR", "/tmp/props"),
            ("PROPLINE_MAX_ATTEMPTS", "5"),
            ("PROPLINE_RETRY_BACKOFF_MS", "soon"),
            ("PROPLINE_SCHEDULER_ENABLED", "true"),
            ("PROPLINE_SCOPE", " "),
            ("WEBDRIVER_SESSION_ID", "abc123"),
        ]);
        let config = ScrapeConfig::from_lookup(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(
            config.database_url.as_deref(),
            Some("postgres://propline@localhost/propline")
        );
        assert_eq!(config.output_dir, PathBuf::from("/tmp/props"));
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.retry_backoff, Duration::from_millis(2_000));
        assert!(config.scheduler_enabled);
        assert_eq!(config.scope, "default");
        assert_eq!(
            config.webdriver_config().session_id.as_deref(),
            Some("abc123")
        );
        assert_eq!(config.retry_policy().max_retries, 4);
    }

    #[test]
    fn missing_profile_path_yields_default_profile() {
        let profile = ScrapeConfig::default().load_profile().unwrap();
        assert_eq!(profile.min_options, 3);
    }

    #[test]
    fn profile_file_overrides_only_what_it_lists() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/profile.example.yaml");
        let config = ScrapeConfig {
            profile_path: Some(path),
            ..Default::default()
        };
        let profile = config.load_profile().unwrap();
        assert_eq!(profile.control_labels, vec!["prop type", "stat type"]);
        assert_eq!(profile.table.table, "table.props, [role=grid]");
        assert_eq!(profile.table.body_rows, "tbody tr");
        assert_eq!(profile.timing.refresh_timeout_ms, 12_000);
        assert_eq!(profile.timing.stable_rounds, 3);
        assert!(profile.matches_vocabulary("Pts+Reb+Ast"));
    }
}
