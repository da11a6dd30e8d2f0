//! Extraction engine: finds the category control, drives it, and harvests
//! the prop table through a [`PageDriver`].

pub mod collector;
pub mod discovery;
pub mod driver;
#[cfg(test)]
mod faulty_page;
pub mod normalize;
pub mod profile;
pub mod refresh;
pub mod selection;
pub mod static_page;
pub mod webdriver_page;

use thiserror::Error;

pub use collector::{collect_rows, wait_for_headers};
pub use discovery::{default_strategies, discover, discover_with, DiscoveryReport, LocatorStrategy};
pub use driver::{
    DriverError, ElementHandle, Key, PageDriver, ScrollMetrics, TableSelectors, TableSnapshot,
};
pub use normalize::{normalize_row, parse_player_cell, PlayerCell, RowContext};
pub use profile::{ExtractionProfile, Timing};
pub use refresh::{table_signature, wait_for_refresh};
pub use selection::{select_category, SelectedVia};
pub use static_page::StaticDomPage;
pub use webdriver_page::WebDriverPage;

pub const CRATE_NAME: &str = "propline-extract";

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("no control offered category `{label}`")]
    SelectionNotFound { label: String },
    #[error("table headers never rendered for category `{label}`")]
    NoHeadersFound { label: String },
    #[error(transparent)]
    Driver(#[from] DriverError),
}
