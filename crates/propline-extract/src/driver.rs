//! The page seam the engine drives. Everything the extraction steps need from
//! a live browser tab goes through [`PageDriver`].

use std::time::Duration;

use async_trait::async_trait;
use propline_storage::WebDriverError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Opaque reference to one element of the current page.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ElementHandle(String);

impl ElementHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn id(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key {
    Escape,
    Enter,
}

impl Key {
    /// Code point WebDriver uses for the key in action sequences.
    pub fn webdriver_code(self) -> &'static str {
        match self {
            Self::Escape => "\u{E00C}",
            Self::Enter => "\u{E007}",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrollMetrics {
    pub overflow_y: String,
    pub scroll_top: f64,
    pub scroll_height: f64,
    pub client_height: f64,
}

impl ScrollMetrics {
    pub fn is_scrollable(&self) -> bool {
        matches!(self.overflow_y.as_str(), "auto" | "scroll" | "overlay")
            && self.scroll_height > self.client_height + 1.0
    }

    pub fn max_scroll_top(&self) -> f64 {
        (self.scroll_height - self.client_height).max(0.0)
    }
}

/// CSS selectors describing where the prop table lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TableSelectors {
    pub table: String,
    pub header_cells: String,
    /// Rows the bulk read takes; only fully rendered tables have them.
    pub body_rows: String,
    /// Rows the incremental reader takes, including ARIA grid rows.
    pub visible_rows: String,
    pub cells: String,
}

impl Default for TableSelectors {
    fn default() -> Self {
        Self {
            table: "table, [role=grid], [role=table]".to_string(),
            header_cells: "thead th, thead td, [role=columnheader]".to_string(),
            body_rows: "tbody tr".to_string(),
            visible_rows: "tbody tr, [role=row]".to_string(),
            cells: "td, [role=cell], [role=gridcell]".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSnapshot {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("invalid selector `{selector}`: {message}")]
    Selector { selector: String, message: String },
    #[error("element {0} is no longer attached to the page")]
    Detached(String),
    #[error("element {0} cannot be interacted with")]
    NotInteractable(String),
    #[error("page script returned an unexpected value: {0}")]
    Script(String),
    #[error(transparent)]
    WebDriver(#[from] WebDriverError),
}

impl DriverError {
    pub fn is_detached(&self) -> bool {
        match self {
            Self::Detached(_) => true,
            Self::WebDriver(err) => err.is_stale_element(),
            _ => false,
        }
    }
}

#[async_trait]
pub trait PageDriver: Send + Sync {
    /// Elements matching `selector` that are currently in the document.
    async fn query_all(&self, selector: &str) -> Result<Vec<ElementHandle>, DriverError>;

    async fn query_within(
        &self,
        scope: &ElementHandle,
        selector: &str,
    ) -> Result<Vec<ElementHandle>, DriverError>;

    async fn parent(&self, element: &ElementHandle) -> Result<Option<ElementHandle>, DriverError>;

    /// Rendered text, one line per block.
    async fn inner_text(&self, element: &ElementHandle) -> Result<String, DriverError>;

    async fn attribute(
        &self,
        element: &ElementHandle,
        name: &str,
    ) -> Result<Option<String>, DriverError>;

    async fn is_visible(&self, element: &ElementHandle) -> Result<bool, DriverError>;

    async fn click(&self, element: &ElementHandle) -> Result<(), DriverError>;

    async fn press_key(&self, key: Key) -> Result<(), DriverError>;

    /// Selects the option of a native `<select>` whose text equals `label`
    /// (case-insensitive). `false` when no such option exists.
    async fn select_option(&self, select: &ElementHandle, label: &str) -> Result<bool, DriverError>;

    /// Headers and body rows of the first table in one round trip.
    async fn read_table(&self, selectors: &TableSelectors) -> Result<TableSnapshot, DriverError>;

    async fn scroll_metrics(&self, element: &ElementHandle) -> Result<ScrollMetrics, DriverError>;

    async fn scroll_to(&self, element: &ElementHandle, top: f64) -> Result<(), DriverError>;

    /// Page-level wheel gesture.
    async fn wheel(&self, delta_y: f64) -> Result<(), DriverError>;

    async fn scroll_page_to_top(&self) -> Result<(), DriverError>;

    async fn viewport_height(&self) -> Result<f64, DriverError>;

    /// Waits up to `timeout` for the page to stop loading resources.
    /// Returns whether quiescence was observed.
    async fn wait_for_network_idle(&self, timeout: Duration) -> Result<bool, DriverError>;
}

/// Visible elements matching `selector` paired with their trimmed, non-empty
/// text.
pub async fn visible_texts(
    page: &dyn PageDriver,
    selector: &str,
) -> Result<Vec<(ElementHandle, String)>, DriverError> {
    let mut out = Vec::new();
    for element in page.query_all(selector).await? {
        if !page.is_visible(&element).await? {
            continue;
        }
        let text = page.inner_text(&element).await?;
        let text = text.trim();
        if !text.is_empty() {
            out.push((element, text.to_string()));
        }
    }
    Ok(out)
}

/// Trimmed cell texts of one row; empty when the row has no data cells.
pub async fn row_cells(
    page: &dyn PageDriver,
    row: &ElementHandle,
    cell_selector: &str,
) -> Result<Vec<String>, DriverError> {
    let mut cells = Vec::new();
    for cell in page.query_within(row, cell_selector).await? {
        cells.push(page.inner_text(&cell).await?.trim().to_string());
    }
    Ok(cells)
}
