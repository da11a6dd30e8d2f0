//! Harvesting table rows, in one bulk read or by scrolling a virtualized grid.

use std::collections::HashSet;

use propline_core::Row;
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

use crate::driver::{row_cells, DriverError, ElementHandle, PageDriver};
use crate::normalize::{normalize_row, RowContext};
use crate::profile::ExtractionProfile;
use crate::ExtractError;

const MAX_ANCESTOR_WALK: usize = 12;

/// Rows in first-seen order, unique by signature.
#[derive(Debug, Default)]
struct RowAccumulator {
    seen: HashSet<String>,
    rows: Vec<Row>,
}

impl RowAccumulator {
    fn insert(&mut self, row: Row) -> bool {
        if self.seen.insert(row.signature().to_string()) {
            self.rows.push(row);
            true
        } else {
            false
        }
    }

    fn into_rows(self) -> Vec<Row> {
        self.rows
    }
}

/// Header texts of the current table, polled until they render.
pub async fn wait_for_headers(
    page: &dyn PageDriver,
    label: &str,
    profile: &ExtractionProfile,
) -> Result<Vec<String>, ExtractError> {
    let deadline = Instant::now() + profile.timing.header_timeout();
    loop {
        let headers = read_headers(page, profile).await?;
        if !headers.is_empty() {
            return Ok(headers);
        }
        if Instant::now() >= deadline {
            return Err(ExtractError::NoHeadersFound {
                label: label.to_string(),
            });
        }
        sleep(profile.timing.poll_interval()).await;
    }
}

async fn read_headers(
    page: &dyn PageDriver,
    profile: &ExtractionProfile,
) -> Result<Vec<String>, DriverError> {
    let Some(table) = page.query_all(&profile.table.table).await?.into_iter().next() else {
        return Ok(Vec::new());
    };
    let mut headers = Vec::new();
    for cell in page.query_within(&table, &profile.table.header_cells).await? {
        headers.push(page.inner_text(&cell).await?.trim().to_string());
    }
    Ok(headers)
}

/// All rows of the current category: the bulk read when it returns anything,
/// the incremental scroll otherwise.
pub async fn collect_rows(
    page: &dyn PageDriver,
    headers: &[String],
    ctx: &RowContext<'_>,
    profile: &ExtractionProfile,
) -> Result<Vec<Row>, DriverError> {
    let rows = collect_fast(page, headers, ctx, profile).await?;
    if !rows.is_empty() {
        return Ok(rows);
    }
    debug!(category = %ctx.option.key, "bulk read empty, scrolling");
    collect_incremental(page, headers, ctx, profile).await
}

pub async fn collect_fast(
    page: &dyn PageDriver,
    headers: &[String],
    ctx: &RowContext<'_>,
    profile: &ExtractionProfile,
) -> Result<Vec<Row>, DriverError> {
    let snapshot = page.read_table(&profile.table).await?;
    let headers = if snapshot.headers.is_empty() {
        headers
    } else {
        &snapshot.headers[..]
    };
    let mut acc = RowAccumulator::default();
    for cells in &snapshot.rows {
        if let Some(row) = normalize_row(headers, cells, ctx) {
            acc.insert(row);
        }
    }
    Ok(acc.into_rows())
}

pub async fn collect_incremental(
    page: &dyn PageDriver,
    headers: &[String],
    ctx: &RowContext<'_>,
    profile: &ExtractionProfile,
) -> Result<Vec<Row>, DriverError> {
    let container = find_scroll_container(page, profile).await?;
    let mut acc = RowAccumulator::default();
    let harvested = harvest(page, container.as_ref(), headers, ctx, profile, &mut acc).await;

    // the next category starts from the top even when this one failed
    if let Err(err) = reset_scroll(page, container.as_ref()).await {
        debug!(error = %err, "scroll reset failed");
    }
    let iterations = harvested?;
    let rows = acc.into_rows();
    info!(category = %ctx.option.key, rows = rows.len(), iterations, "incremental collection done");
    Ok(rows)
}

/// Scrolls until no new rows show up; returns the number of reads made.
async fn harvest(
    page: &dyn PageDriver,
    container: Option<&ElementHandle>,
    headers: &[String],
    ctx: &RowContext<'_>,
    profile: &ExtractionProfile,
    acc: &mut RowAccumulator,
) -> Result<usize, DriverError> {
    let timing = &profile.timing;
    let mut quiet_rounds = 0;
    let mut iterations = 0;

    while iterations < timing.max_scroll_iterations {
        iterations += 1;
        let mut added = 0;
        for cells in read_visible_rows(page, profile).await? {
            if let Some(row) = normalize_row(headers, &cells, ctx) {
                if acc.insert(row) {
                    added += 1;
                }
            }
        }
        if added == 0 {
            quiet_rounds += 1;
            if quiet_rounds >= timing.stable_rounds {
                break;
            }
        } else {
            quiet_rounds = 0;
        }
        scroll_forward(page, container, profile).await?;
        sleep(timing.scroll_pause()).await;
    }
    Ok(iterations)
}

async fn read_visible_rows(
    page: &dyn PageDriver,
    profile: &ExtractionProfile,
) -> Result<Vec<Vec<String>>, DriverError> {
    let selectors = &profile.table;
    let rows = match page.query_all(&selectors.table).await?.into_iter().next() {
        Some(table) => page.query_within(&table, &selectors.visible_rows).await?,
        None => page.query_all(&selectors.visible_rows).await?,
    };
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        match row_cells(page, &row, &selectors.cells).await {
            Ok(cells) if !cells.is_empty() => out.push(cells),
            Ok(_) => {}
            // virtualized rows can be recycled between the query and the read
            Err(err) if err.is_detached() => {}
            Err(err) => return Err(err),
        }
    }
    Ok(out)
}

/// Nearest element, from the table upwards, that scrolls vertically.
async fn find_scroll_container(
    page: &dyn PageDriver,
    profile: &ExtractionProfile,
) -> Result<Option<ElementHandle>, DriverError> {
    let anchor = match page.query_all(&profile.table.table).await?.into_iter().next() {
        Some(table) => Some(table),
        None => page.query_all(&profile.table.visible_rows).await?.into_iter().next(),
    };
    let mut current = anchor;
    for _ in 0..MAX_ANCESTOR_WALK {
        let Some(element) = current else {
            break;
        };
        if page.scroll_metrics(&element).await?.is_scrollable() {
            return Ok(Some(element));
        }
        current = page.parent(&element).await?;
    }
    Ok(None)
}

async fn scroll_forward(
    page: &dyn PageDriver,
    container: Option<&ElementHandle>,
    profile: &ExtractionProfile,
) -> Result<(), DriverError> {
    let fraction = profile.timing.scroll_fraction;
    match container {
        Some(container) => {
            let metrics = page.scroll_metrics(container).await?;
            let top = metrics.scroll_top + metrics.client_height * fraction;
            page.scroll_to(container, top).await
        }
        None => {
            let viewport = page.viewport_height().await?;
            page.wheel(viewport * fraction).await
        }
    }
}

async fn reset_scroll(
    page: &dyn PageDriver,
    container: Option<&ElementHandle>,
) -> Result<(), DriverError> {
    match container {
        Some(container) => page.scroll_to(container, 0.0).await,
        None => page.scroll_page_to_top().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::ScrollMetrics;
    use crate::faulty_page::FaultyPage;
    use crate::static_page::StaticDomPage;
    use chrono::NaiveDate;
    use propline_core::CategoryOption;

    fn fast_profile() -> ExtractionProfile {
        let mut profile = ExtractionProfile::default();
        profile.timing.scroll_pause_ms = 0;
        profile
    }

    fn grid(rows: usize, window: usize, style: &str) -> String {
        let body: String = (0..rows)
            .map(|i| {
                format!(
                    r#"<div role="row"><div role="cell">Player {i}</div><div role="cell">{}.5</div></div>"#,
                    i % 7
                )
            })
            .collect();
        format!(
            r#"<html><body data-viewport-height="200"><div id="grid" role="grid" data-virtual-window="{window}" style="{style}">
            <div role="row"><div role="columnheader">Player</div><div role="columnheader">Line</div></div>
            {body}</div></body></html>"#
        )
    }

    fn headers() -> Vec<String> {
        vec!["Player".into(), "Line".into()]
    }

    #[tokio::test(start_paused = true)]
    async fn virtualized_grid_is_harvested_by_scrolling_its_container() {
        let page = StaticDomPage::from_html(grid(45, 8, "overflow-y: auto"));
        let option = CategoryOption::new("Points");
        let ctx = RowContext {
            option: &option,
            date: NaiveDate::from_ymd_opt(2026, 2, 24).unwrap(),
        };

        let rows = collect_rows(&page, &headers(), &ctx, &fast_profile()).await.unwrap();
        assert_eq!(rows.len(), 45);
        assert_eq!(rows[0].player_name, "Player 0");
        assert_eq!(rows[44].player_name, "Player 44");

        let grid = page.query_all("#grid").await.unwrap().remove(0);
        let ScrollMetrics { scroll_top, .. } = page.scroll_metrics(&grid).await.unwrap();
        assert_eq!(scroll_top, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn page_wheel_drives_window_virtualization() {
        // 200px viewport scrolls 4 rows per step, inside the 8 row window
        let page = StaticDomPage::from_html(grid(30, 8, ""));
        let option = CategoryOption::new("Points");
        let ctx = RowContext {
            option: &option,
            date: NaiveDate::from_ymd_opt(2026, 2, 24).unwrap(),
        };
        let rows = collect_incremental(&page, &headers(), &ctx, &fast_profile()).await.unwrap();
        assert_eq!(rows.len(), 30);
        // back at the top: the first window of 8 rows, 2 cells each
        assert_eq!(page.query_all("[role=cell]").await.unwrap().len(), 16);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_scroll_still_returns_the_grid_to_the_top() {
        let page = FaultyPage::new(StaticDomPage::from_html(grid(45, 8, "overflow-y: auto")))
            .fail_forward_scrolls_after(1);
        let option = CategoryOption::new("Points");
        let ctx = RowContext {
            option: &option,
            date: NaiveDate::from_ymd_opt(2026, 2, 24).unwrap(),
        };

        let err = collect_incremental(&page, &headers(), &ctx, &fast_profile())
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::Script(_)));

        let grid = page.inner.query_all("#grid").await.unwrap().remove(0);
        let ScrollMetrics { scroll_top, .. } = page.inner.scroll_metrics(&grid).await.unwrap();
        assert_eq!(scroll_top, 0.0);

        // a retry sees the grid from its first row
        let rows = collect_incremental(&page.inner, &headers(), &ctx, &fast_profile())
            .await
            .unwrap();
        assert_eq!(rows.len(), 45);
        assert_eq!(rows[0].player_name, "Player 0");
    }

    #[tokio::test(start_paused = true)]
    async fn missing_headers_raise_no_headers_found() {
        let page = StaticDomPage::from_html("<html><body><table><tbody></tbody></table></body></html>");
        let err = wait_for_headers(&page, "Points", &ExtractionProfile::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractError::NoHeadersFound { ref label } if label == "Points"));
    }

    #[tokio::test(start_paused = true)]
    async fn bulk_read_dedupes_by_signature() {
        let page = StaticDomPage::from_html(
            r#"<html><body><table><thead><tr><th>Player</th><th>Line</th><th>Proj</th></tr></thead><tbody>
            <tr><td>Jane Doe</td><td>25.5</td><td>27</td></tr>
            <tr><td>Jane Doe</td><td>25.5</td><td>28</td></tr>
            <tr><td>Jane Doe</td><td>26.5</td><td>28</td></tr>
            <tr><td></td><td>7</td><td></td></tr>
            </tbody></table></body></html>"#,
        );
        let option = CategoryOption::new("Points");
        let ctx = RowContext {
            option: &option,
            date: NaiveDate::from_ymd_opt(2026, 2, 24).unwrap(),
        };
        let headers = wait_for_headers(&page, "Points", &fast_profile()).await.unwrap();
        assert_eq!(headers, vec!["Player", "Line", "Proj"]);
        let rows = collect_fast(&page, &headers, &ctx, &fast_profile()).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].projection, Some(27.0));
    }
}
