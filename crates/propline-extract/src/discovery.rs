//! Locating the category control and enumerating its options.

use std::collections::HashSet;

use async_trait::async_trait;
use propline_core::{CategoryOption, DiscoveryDiagnostics};
use tracing::{debug, info, warn};

use crate::driver::{visible_texts, DriverError, ElementHandle, Key, PageDriver};
use crate::profile::ExtractionProfile;

const SAMPLE_ROWS: usize = 3;
const MAX_LABEL_CANDIDATES: usize = 10;
const MAX_INTERACTIVE_PER_LEVEL: usize = 5;
const LABEL_ANCESTOR_DEPTH: usize = 3;

/// One way of finding the category control. Strategies are tried in order
/// and the first plausible option list wins.
#[async_trait]
pub trait LocatorStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Option labels, or `None` when this strategy found no usable control.
    async fn try_discover(
        &self,
        page: &dyn PageDriver,
        profile: &ExtractionProfile,
    ) -> Result<Option<Vec<String>>, DriverError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryReport {
    pub options: Vec<CategoryOption>,
    pub strategy_used: Option<String>,
    pub headers: Vec<String>,
    pub sample_rows: Vec<Vec<String>>,
}

impl DiscoveryReport {
    pub fn diagnostics(&self) -> DiscoveryDiagnostics {
        DiscoveryDiagnostics {
            strategy_used: self.strategy_used.clone(),
            option_count: self.options.len(),
            headers: self.headers.clone(),
            sample_rows: self.sample_rows.clone(),
        }
    }
}

pub fn default_strategies() -> Vec<Box<dyn LocatorStrategy>> {
    vec![
        Box::new(NativeSelect),
        Box::new(Combobox),
        Box::new(PopupButton),
        Box::new(LabelProximity),
        Box::new(BroadScan),
    ]
}

pub async fn discover(page: &dyn PageDriver, profile: &ExtractionProfile) -> DiscoveryReport {
    discover_with(page, profile, &default_strategies()).await
}

/// Runs `strategies` in order. Never fails: a page without a recognizable
/// control yields an empty option list.
pub async fn discover_with(
    page: &dyn PageDriver,
    profile: &ExtractionProfile,
    strategies: &[Box<dyn LocatorStrategy>],
) -> DiscoveryReport {
    let mut report = DiscoveryReport::default();

    for strategy in strategies {
        let labels = match strategy.try_discover(page, profile).await {
            Ok(Some(labels)) => labels,
            Ok(None) => {
                debug!(strategy = strategy.name(), "strategy found nothing");
                continue;
            }
            Err(err) => {
                warn!(strategy = strategy.name(), error = %err, "strategy failed");
                continue;
            }
        };
        let options = dedupe_options(labels, profile);
        if options.len() >= profile.min_options {
            info!(strategy = strategy.name(), options = options.len(), "category control found");
            report.options = options;
            report.strategy_used = Some(strategy.name().to_string());
            break;
        }
    }

    match page.read_table(&profile.table).await {
        Ok(snapshot) => {
            report.headers = snapshot.headers;
            report.sample_rows = snapshot.rows.into_iter().take(SAMPLE_ROWS).collect();
        }
        Err(err) => debug!(error = %err, "no table snapshot for discovery diagnostics"),
    }
    report
}

fn dedupe_options(labels: Vec<String>, profile: &ExtractionProfile) -> Vec<CategoryOption> {
    let mut seen = HashSet::new();
    labels
        .into_iter()
        .map(|label| first_line(&label))
        .filter(|label| label.chars().count() <= profile.max_option_label_len)
        .map(CategoryOption::new)
        .filter(|option| !option.key.is_empty() && seen.insert(option.key.clone()))
        .collect()
}

/// Option rows often carry a count or badge under the label.
pub(crate) fn first_line(text: &str) -> String {
    text.lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or_default()
        .to_string()
}

/// Texts of the first list-item selector that has visible items.
pub(crate) async fn read_open_list(
    page: &dyn PageDriver,
    profile: &ExtractionProfile,
) -> Result<Vec<(ElementHandle, String)>, DriverError> {
    for selector in &profile.list_item_selectors {
        let items = visible_texts(page, selector).await?;
        if !items.is_empty() {
            return Ok(items);
        }
    }
    Ok(Vec::new())
}

pub(crate) async fn close_popup(page: &dyn PageDriver, profile: &ExtractionProfile) {
    if let Err(err) = page.press_key(Key::Escape).await {
        debug!(error = %err, "escape failed");
    }
    tokio::time::sleep(profile.timing.popup_settle()).await;
}

/// Clicks `trigger`, reads whatever list opened and closes it again.
async fn probe_trigger(
    page: &dyn PageDriver,
    trigger: &ElementHandle,
    profile: &ExtractionProfile,
) -> Option<Vec<String>> {
    if let Err(err) = page.click(trigger).await {
        debug!(element = trigger.id(), error = %err, "trigger click failed");
        return None;
    }
    tokio::time::sleep(profile.timing.popup_settle()).await;
    let items = read_open_list(page, profile).await;
    close_popup(page, profile).await;

    let labels: Vec<String> = match items {
        Ok(items) => items.into_iter().map(|(_, text)| first_line(&text)).collect(),
        Err(err) => {
            debug!(element = trigger.id(), error = %err, "reading opened list failed");
            return None;
        }
    };
    profile.plausible_options(&labels).then_some(labels)
}

async fn probe_selector_list(
    page: &dyn PageDriver,
    selectors: &[String],
    profile: &ExtractionProfile,
) -> Result<Option<Vec<String>>, DriverError> {
    let mut tried = HashSet::new();
    for selector in selectors {
        for trigger in page.query_all(selector).await? {
            if !tried.insert(trigger.clone()) || !page.is_visible(&trigger).await? {
                continue;
            }
            if let Some(labels) = probe_trigger(page, &trigger, profile).await {
                return Ok(Some(labels));
            }
        }
    }
    Ok(None)
}

pub struct NativeSelect;

#[async_trait]
impl LocatorStrategy for NativeSelect {
    fn name(&self) -> &'static str {
        "native_select"
    }

    async fn try_discover(
        &self,
        page: &dyn PageDriver,
        profile: &ExtractionProfile,
    ) -> Result<Option<Vec<String>>, DriverError> {
        for select in page.query_all(&profile.select_selector).await? {
            let mut labels = Vec::new();
            for option in page.query_within(&select, "option").await? {
                let text = page.inner_text(&option).await?;
                let text = text.trim();
                if !text.is_empty() {
                    labels.push(text.to_string());
                }
            }
            if profile.plausible_options(&labels) {
                return Ok(Some(labels));
            }
        }
        Ok(None)
    }
}

pub struct Combobox;

#[async_trait]
impl LocatorStrategy for Combobox {
    fn name(&self) -> &'static str {
        "combobox"
    }

    async fn try_discover(
        &self,
        page: &dyn PageDriver,
        profile: &ExtractionProfile,
    ) -> Result<Option<Vec<String>>, DriverError> {
        probe_selector_list(page, &profile.combobox_selectors, profile).await
    }
}

pub struct PopupButton;

#[async_trait]
impl LocatorStrategy for PopupButton {
    fn name(&self) -> &'static str {
        "popup_button"
    }

    async fn try_discover(
        &self,
        page: &dyn PageDriver,
        profile: &ExtractionProfile,
    ) -> Result<Option<Vec<String>>, DriverError> {
        probe_selector_list(page, &profile.popup_trigger_selectors, profile).await
    }
}

/// Finds a caption such as "Prop Type" and probes the label itself, then the
/// interactive elements around it.
pub struct LabelProximity;

#[async_trait]
impl LocatorStrategy for LabelProximity {
    fn name(&self) -> &'static str {
        "label_proximity"
    }

    async fn try_discover(
        &self,
        page: &dyn PageDriver,
        profile: &ExtractionProfile,
    ) -> Result<Option<Vec<String>>, DriverError> {
        let captions: Vec<ElementHandle> = visible_texts(page, &profile.label_selector)
            .await?
            .into_iter()
            .filter(|(_, text)| profile.matches_control_label(text))
            .map(|(el, _)| el)
            .take(MAX_LABEL_CANDIDATES)
            .collect();

        let mut tried = HashSet::new();
        for caption in captions {
            if tried.insert(caption.clone()) {
                if let Some(labels) = probe_trigger(page, &caption, profile).await {
                    return Ok(Some(labels));
                }
            }

            let mut scope = caption;
            for _ in 0..LABEL_ANCESTOR_DEPTH {
                let Some(parent) = page.parent(&scope).await? else {
                    break;
                };
                let mut probed = 0;
                for candidate in page.query_within(&parent, &profile.interactive_selector).await? {
                    if probed >= MAX_INTERACTIVE_PER_LEVEL {
                        break;
                    }
                    if !tried.insert(candidate.clone()) || !page.is_visible(&candidate).await? {
                        continue;
                    }
                    probed += 1;
                    if let Some(labels) = probe_trigger(page, &candidate, profile).await {
                        return Ok(Some(labels));
                    }
                }
                scope = parent;
            }
        }
        Ok(None)
    }
}

/// Clicks anything whose own text looks like a category. When none of them
/// opens a list, enough of them side by side are taken as a tab strip.
pub struct BroadScan;

#[async_trait]
impl LocatorStrategy for BroadScan {
    fn name(&self) -> &'static str {
        "broad_scan"
    }

    async fn try_discover(
        &self,
        page: &dyn PageDriver,
        profile: &ExtractionProfile,
    ) -> Result<Option<Vec<String>>, DriverError> {
        let candidates: Vec<(ElementHandle, String)> =
            visible_texts(page, &profile.clickable_selector)
                .await?
                .into_iter()
                .map(|(el, text)| (el, first_line(&text)))
                .filter(|(_, text)| profile.matches_vocabulary(text))
                .take(profile.max_broad_candidates)
                .collect();

        for (candidate, text) in &candidates {
            debug!(candidate = %text, "broad scan probe");
            if let Some(labels) = probe_trigger(page, candidate, profile).await {
                return Ok(Some(labels));
            }
        }

        let tabs: Vec<String> = candidates.into_iter().map(|(_, text)| text).collect();
        Ok(profile.plausible_options(&tabs).then_some(tabs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::static_page::StaticDomPage;

    fn fast_profile() -> ExtractionProfile {
        let mut profile = ExtractionProfile::default();
        profile.timing.popup_settle_ms = 0;
        profile
    }

    fn keys(report: &DiscoveryReport) -> Vec<&str> {
        report.options.iter().map(|o| o.key.as_str()).collect()
    }

    #[tokio::test]
    async fn native_select_wins_first() {
        let page = StaticDomPage::from_html(
            r#"<html><body><select><option>Points</option><option>Rebounds</option>
            <option>Assists</option><option>Pts+Reb+Ast</option></select>
            <table><thead><tr><th>Player</th></tr></thead><tbody><tr><td>Jane</td></tr></tbody></table>
            </body></html>"#,
        );
        let report = discover(&page, &fast_profile()).await;
        assert_eq!(report.strategy_used.as_deref(), Some("native_select"));
        assert_eq!(keys(&report), vec!["points", "rebounds", "assists", "pts_reb_ast"]);
        assert_eq!(report.headers, vec!["Player"]);
        assert_eq!(report.sample_rows, vec![vec!["Jane".to_string()]]);
        assert_eq!(page.escape_presses(), 0);
    }

    #[tokio::test]
    async fn popup_button_options_are_read_then_closed() {
        let page = StaticDomPage::from_html(
            r#"<html><body>
            <button aria-haspopup="menu" aria-controls="nav">Menu</button>
            <ul id="nav" role="menu" hidden><li role="menuitem">Home</li><li role="menuitem">Help</li></ul>
            <button aria-haspopup="listbox" aria-controls="cats">Points</button>
            <ul id="cats" role="listbox" hidden>
              <li role="option">Points<br><small>42</small></li>
              <li role="option">Rebounds</li>
              <li role="option">Assists</li>
              <li role="option">Points</li>
            </ul></body></html>"#,
        );
        let report = discover(&page, &fast_profile()).await;
        assert_eq!(report.strategy_used.as_deref(), Some("popup_button"));
        assert_eq!(keys(&report), vec!["points", "rebounds", "assists"]);
        assert_eq!(page.escape_presses(), 2);
        let items = page.query_all("[role=option]").await.unwrap();
        assert!(!page.is_visible(&items[0]).await.unwrap());
    }

    #[tokio::test]
    async fn label_proximity_finds_an_unlabelled_trigger() {
        let page = StaticDomPage::from_html(
            r#"<html><body>
            <div class="filter"><span>Prop Type</span>
              <div tabindex="0" aria-controls="picker">Choose</div></div>
            <div id="picker" hidden>
              <li data-value="pts">Points</li><li data-value="reb">Rebounds</li>
              <li data-value="ast">Assists</li></div>
            </body></html>"#,
        );
        let report = discover(&page, &fast_profile()).await;
        assert_eq!(report.strategy_used.as_deref(), Some("label_proximity"));
        assert_eq!(keys(&report), vec!["points", "rebounds", "assists"]);
    }

    #[tokio::test]
    async fn tab_strips_fall_out_of_the_broad_scan() {
        let page = StaticDomPage::from_html(
            r#"<html><body><nav>
            <button role="tab" data-category="Points">Points</button>
            <button role="tab" data-category="Rebounds">Rebounds</button>
            <button role="tab" data-category="Assists">Assists</button>
            <a href="/account">Account</a></nav></body></html>"#,
        );
        let report = discover(&page, &fast_profile()).await;
        assert_eq!(report.strategy_used.as_deref(), Some("broad_scan"));
        assert_eq!(keys(&report), vec!["points", "rebounds", "assists"]);
    }

    #[tokio::test]
    async fn unrecognizable_pages_discover_nothing() {
        let page = StaticDomPage::from_html(
            r#"<html><body><button aria-haspopup="menu" aria-controls="m">Menu</button>
            <ul id="m" role="menu" hidden><li role="menuitem">Home</li></ul></body></html>"#,
        );
        let report = discover(&page, &fast_profile()).await;
        assert!(report.options.is_empty());
        assert_eq!(report.strategy_used, None);
        assert_eq!(report.diagnostics().option_count, 0);
    }
}
