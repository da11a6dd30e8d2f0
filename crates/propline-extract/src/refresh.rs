//! Deciding when the table finished re-rendering after a selection.

use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use crate::driver::{row_cells, DriverError, PageDriver};
use crate::profile::ExtractionProfile;

/// Concatenated cell text of the first data row, or empty when no row is
/// rendered.
pub async fn table_signature(
    page: &dyn PageDriver,
    profile: &ExtractionProfile,
) -> Result<String, DriverError> {
    let selectors = &profile.table;
    let Some(table) = page.query_all(&selectors.table).await?.into_iter().next() else {
        return Ok(String::new());
    };
    for row in page.query_within(&table, &selectors.visible_rows).await? {
        let cells = row_cells(page, &row, &selectors.cells).await?;
        if !cells.is_empty() {
            return Ok(cells.join("|"));
        }
    }
    Ok(String::new())
}

async fn loading_visible(page: &dyn PageDriver, profile: &ExtractionProfile) -> bool {
    for selector in &profile.loading_selectors {
        let Ok(found) = page.query_all(selector).await else {
            continue;
        };
        for element in found {
            if page.is_visible(&element).await.unwrap_or(false) {
                return true;
            }
        }
    }
    false
}

async fn wait_for_loading_to_clear(page: &dyn PageDriver, profile: &ExtractionProfile) {
    let deadline = Instant::now() + profile.timing.spinner_timeout();
    while Instant::now() < deadline {
        if !loading_visible(page, profile).await {
            return;
        }
        sleep(profile.timing.poll_interval()).await;
    }
    debug!("loading indicator still visible after its timeout");
}

/// Waits until the first row differs from `before` and returns the new
/// signature. On timeout it settles for network quiescence plus a grace
/// period and returns whatever it last saw; it never fails.
pub async fn wait_for_refresh(
    page: &dyn PageDriver,
    before: &str,
    profile: &ExtractionProfile,
) -> String {
    let timing = &profile.timing;
    let deadline = Instant::now() + timing.refresh_timeout();
    let mut last = before.to_string();

    while Instant::now() < deadline {
        if loading_visible(page, profile).await {
            wait_for_loading_to_clear(page, profile).await;
        }
        match table_signature(page, profile).await {
            Ok(current) if !current.is_empty() && current != before => return current,
            Ok(current) if !current.is_empty() => last = current,
            Ok(_) => {}
            Err(err) => debug!(error = %err, "signature read failed while polling"),
        }
        sleep(timing.poll_interval()).await;
    }

    match page.wait_for_network_idle(timing.network_idle_timeout()).await {
        Ok(true) => {}
        Ok(false) => debug!("network never went idle"),
        Err(err) => debug!(error = %err, "network idle check failed"),
    }
    sleep(timing.grace()).await;
    match table_signature(page, profile).await {
        Ok(current) if !current.is_empty() => current,
        Ok(_) => last,
        Err(err) => {
            warn!(error = %err, "final signature read failed");
            last
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::static_page::StaticDomPage;

    const PAGE: &str = r#"<html><body data-refresh-delay="4">
      <div data-loading-indicator>Loading</div>
      <nav><button role="tab" data-category="Points">Points</button>
           <button role="tab" data-category="Rebounds">Rebounds</button>
           <button role="tab" data-category="Same">Same</button></nav>
      <table><thead><tr><th>Player</th><th>Line</th></tr></thead>
        <tbody data-category-panel="Points"><tr><td>Jane Doe</td><td>25.5</td></tr></tbody>
        <tbody data-category-panel="Rebounds" hidden><tr><td>John Smith</td><td>9.5</td></tr></tbody>
        <tbody data-category-panel="Same" hidden><tr><td>Jane Doe</td><td>25.5</td></tr></tbody>
      </table></body></html>"#;

    async fn click_tab(page: &StaticDomPage, label: &str) {
        let tab = page
            .query_all(&format!("[data-category=\"{label}\"]"))
            .await
            .unwrap()
            .remove(0);
        page.click(&tab).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn returns_the_new_first_row_once_the_spinner_clears() {
        let page = StaticDomPage::from_html(PAGE);
        let profile = ExtractionProfile::default();
        let before = table_signature(&page, &profile).await.unwrap();
        assert_eq!(before, "Jane Doe|25.5");

        click_tab(&page, "Rebounds").await;
        let after = wait_for_refresh(&page, &before, &profile).await;
        assert_eq!(after, "John Smith|9.5");
        assert_eq!(page.active_category().as_deref(), Some("Rebounds"));
    }

    #[tokio::test(start_paused = true)]
    async fn identical_top_rows_time_out_to_the_same_signature() {
        let page = StaticDomPage::from_html(PAGE);
        let profile = ExtractionProfile::default();
        let before = table_signature(&page, &profile).await.unwrap();

        click_tab(&page, "Same").await;
        let started = Instant::now();
        let after = wait_for_refresh(&page, &before, &profile).await;
        assert_eq!(after, before);
        assert!(started.elapsed() >= profile.timing.refresh_timeout());
        assert_eq!(page.active_category().as_deref(), Some("Same"));
    }

    #[tokio::test(start_paused = true)]
    async fn empty_tables_have_empty_signatures() {
        let page = StaticDomPage::from_html("<html><body><p>nothing</p></body></html>");
        let profile = ExtractionProfile::default();
        assert_eq!(table_signature(&page, &profile).await.unwrap(), "");
        assert_eq!(wait_for_refresh(&page, "", &profile).await, "");
    }
}
