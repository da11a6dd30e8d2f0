//! Tunables for one target application: vocabulary, selectors, timings.
//! Every field defaults, so a YAML profile only lists what it overrides.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::driver::TableSelectors;

const DEFAULT_VOCABULARY: &[&str] = &[
    "points", "pts", "rebounds", "reb", "rebs", "assists", "ast", "asts", "steals", "stl",
    "blocks", "blk", "blks", "turnovers", "tov", "threes", "3pm", "3pt", "3 pt", "3 pointers",
    "pra", "pr", "pa", "ra", "fantasy", "fpts", "fantasy score", "double double",
    "triple double", "minutes", "fgm", "fga", "ftm", "hits", "runs", "rbi", "rbis",
    "strikeouts", "ks", "total bases", "walks", "home runs", "hr", "outs", "earned runs",
    "goals", "shots", "sog", "saves", "blocked shots", "passing yards", "rushing yards",
    "receiving yards", "yards", "yds", "receptions", "touchdowns", "tds", "completions",
    "interceptions", "ints", "aces", "kills", "headshots",
];

const DEFAULT_CONTROL_LABELS: &[&str] = &["prop type", "stat type", "stat", "category", "market", "props"];

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionProfile {
    pub vocabulary: Vec<String>,
    /// Conceptual names of the category control, matched against nearby labels.
    pub control_labels: Vec<String>,
    pub table: TableSelectors,
    pub select_selector: String,
    pub combobox_selectors: Vec<String>,
    pub popup_trigger_selectors: Vec<String>,
    pub list_item_selectors: Vec<String>,
    pub role_item_selectors: Vec<String>,
    pub clickable_selector: String,
    pub label_selector: String,
    pub interactive_selector: String,
    pub loading_selectors: Vec<String>,
    pub min_options: usize,
    pub max_option_label_len: usize,
    pub max_broad_candidates: usize,
    pub timing: Timing,
}

impl Default for ExtractionProfile {
    fn default() -> Self {
        Self {
            vocabulary: strings(DEFAULT_VOCABULARY),
            control_labels: strings(DEFAULT_CONTROL_LABELS),
            table: TableSelectors::default(),
            select_selector: "select".to_string(),
            combobox_selectors: strings(&["[role=combobox]"]),
            popup_trigger_selectors: strings(&[
                "button[aria-haspopup]",
                "[role=button][aria-haspopup]",
                "[aria-haspopup=listbox]",
                "[aria-haspopup=menu]",
            ]),
            list_item_selectors: strings(&[
                "[role=option]",
                "[role=menuitem]",
                "[role=menuitemradio]",
                "[role=listbox] li",
                "[role=menu] li",
                "ul.dropdown-menu li",
                "li[data-value]",
            ]),
            role_item_selectors: strings(&[
                "[role=option]",
                "[role=menuitem]",
                "[role=menuitemradio]",
                "[role=tab]",
            ]),
            clickable_selector: "button, [role=button], [role=tab], a".to_string(),
            label_selector: "label, span, p, h2, h3, h4, h5, h6, div".to_string(),
            interactive_selector:
                "button, [role=button], [role=combobox], [aria-haspopup], select, [tabindex]"
                    .to_string(),
            loading_selectors: strings(&[
                "[data-loading-indicator]",
                "[aria-busy=true]",
                "[role=progressbar]",
                ".spinner",
                ".loading",
            ]),
            min_options: 3,
            max_option_label_len: 40,
            max_broad_candidates: 25,
            timing: Timing::default(),
        }
    }
}

impl ExtractionProfile {
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        serde_yaml::from_str(raw).context("parsing extraction profile")
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading extraction profile {}", path.display()))?;
        Self::from_yaml_str(&raw).with_context(|| format!("in {}", path.display()))
    }

    /// True when `text` is short and contains a vocabulary term on word
    /// boundaries (`Pts+Reb+Ast` matches `pts`).
    pub fn matches_vocabulary(&self, text: &str) -> bool {
        let text = text.trim();
        if text.is_empty() || text.chars().count() > self.max_option_label_len {
            return false;
        }
        let haystack = format!(" {} ", word_normalize(text));
        self.vocabulary.iter().any(|term| {
            let term = word_normalize(term);
            !term.is_empty() && haystack.contains(&format!(" {term} "))
        })
    }

    /// Enough labels, each plausibly a category.
    pub fn plausible_options(&self, labels: &[String]) -> bool {
        labels.len() >= self.min_options
            && labels.iter().filter(|l| self.matches_vocabulary(l)).count() >= self.min_options
    }

    pub fn matches_control_label(&self, text: &str) -> bool {
        let text = word_normalize(text);
        if text.is_empty() {
            return false;
        }
        self.control_labels.iter().any(|label| {
            let label = word_normalize(label);
            !label.is_empty() && (text == label || text.starts_with(&format!("{label} ")))
        })
    }
}

/// Lowercased alphanumeric words joined by single spaces.
pub(crate) fn word_normalize(text: &str) -> String {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timing {
    pub poll_interval_ms: u64,
    pub refresh_timeout_ms: u64,
    pub spinner_timeout_ms: u64,
    pub network_idle_timeout_ms: u64,
    pub grace_ms: u64,
    pub popup_settle_ms: u64,
    pub header_timeout_ms: u64,
    pub scroll_pause_ms: u64,
    pub max_scroll_iterations: usize,
    pub stable_rounds: usize,
    /// Share of the visible height scrolled per step.
    pub scroll_fraction: f64,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            poll_interval_ms: 150,
            refresh_timeout_ms: 8_000,
            spinner_timeout_ms: 5_000,
            network_idle_timeout_ms: 3_000,
            grace_ms: 300,
            popup_settle_ms: 200,
            header_timeout_ms: 5_000,
            scroll_pause_ms: 250,
            max_scroll_iterations: 60,
            stable_rounds: 3,
            scroll_fraction: 0.8,
        }
    }
}

impl Timing {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_millis(self.refresh_timeout_ms)
    }

    pub fn spinner_timeout(&self) -> Duration {
        Duration::from_millis(self.spinner_timeout_ms)
    }

    pub fn network_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.network_idle_timeout_ms)
    }

    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }

    pub fn popup_settle(&self) -> Duration {
        Duration::from_millis(self.popup_settle_ms)
    }

    pub fn header_timeout(&self) -> Duration {
        Duration::from_millis(self.header_timeout_ms)
    }

    pub fn scroll_pause(&self) -> Duration {
        Duration::from_millis(self.scroll_pause_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vocabulary_matches_on_word_boundaries() {
        let profile = ExtractionProfile::default();
        assert!(profile.matches_vocabulary("Points"));
        assert!(profile.matches_vocabulary("Pts+Reb+Ast"));
        assert!(profile.matches_vocabulary("3 PT Made"));
        assert!(profile.matches_vocabulary("Double Double"));
        assert!(!profile.matches_vocabulary("Sign out"));
        assert!(!profile.matches_vocabulary("Pointsbet promo"));
        assert!(!profile.matches_vocabulary(
            "Points scored by the player in the full game including overtime periods"
        ));
    }

    #[test]
    fn plausibility_needs_enough_vocabulary_hits() {
        let profile = ExtractionProfile::default();
        let good = strings(&["Points", "Rebounds", "Assists", "Home"]);
        let bad = strings(&["Home", "Settings", "Points"]);
        assert!(profile.plausible_options(&good));
        assert!(!profile.plausible_options(&bad));
        assert!(!profile.plausible_options(&strings(&["Points", "Assists"])));
    }

    #[test]
    fn control_labels_match_prefixes() {
        let profile = ExtractionProfile::default();
        assert!(profile.matches_control_label("Prop Type:"));
        assert!(profile.matches_control_label("Stat  type"));
        assert!(!profile.matches_control_label("Statistics"));
    }

    #[test]
    fn yaml_overrides_only_listed_fields() {
        let profile = ExtractionProfile::from_yaml_str(
            "vocabulary: [goals, saves]\ntiming:\n  refresh_timeout_ms: 100\n",
        )
        .unwrap();
        assert_eq!(profile.vocabulary, vec!["goals".to_string(), "saves".to_string()]);
        assert_eq!(profile.timing.refresh_timeout(), Duration::from_millis(100));
        assert_eq!(profile.timing.poll_interval_ms, 150);
        assert_eq!(profile.min_options, 3);
        assert_eq!(profile.table, TableSelectors::default());
    }

    #[test]
    fn missing_profile_file_is_an_error_with_path() {
        let err = ExtractionProfile::from_yaml_file("/nonexistent/profile.yaml").unwrap_err();
        assert!(format!("{err:#}").contains("/nonexistent/profile.yaml"));
    }
}
