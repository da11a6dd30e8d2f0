//! [`StaticDomPage`] wrapper that fails chosen driver calls, for error paths.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::driver::{
    DriverError, ElementHandle, Key, PageDriver, ScrollMetrics, TableSelectors, TableSnapshot,
};
use crate::static_page::StaticDomPage;

pub(crate) struct FaultyPage {
    pub(crate) inner: StaticDomPage,
    forward_scrolls_allowed: usize,
    forward_scrolls: AtomicUsize,
    failing_selector: Option<String>,
}

impl FaultyPage {
    pub(crate) fn new(inner: StaticDomPage) -> Self {
        Self {
            inner,
            forward_scrolls_allowed: usize::MAX,
            forward_scrolls: AtomicUsize::new(0),
            failing_selector: None,
        }
    }

    /// Scrolls away from the top succeed `n` times, then fail. Scrolling
    /// back to the top always works.
    pub(crate) fn fail_forward_scrolls_after(mut self, n: usize) -> Self {
        self.forward_scrolls_allowed = n;
        self
    }

    pub(crate) fn fail_queries_for(mut self, selector: &str) -> Self {
        self.failing_selector = Some(selector.to_string());
        self
    }

    fn forward_scroll(&self) -> Result<(), DriverError> {
        if self.forward_scrolls.fetch_add(1, Ordering::SeqCst) >= self.forward_scrolls_allowed {
            return Err(DriverError::Script("scroll did not complete".into()));
        }
        Ok(())
    }

    fn check_selector(&self, selector: &str) -> Result<(), DriverError> {
        if self.failing_selector.as_deref() == Some(selector) {
            return Err(DriverError::Script(format!("query `{selector}` timed out")));
        }
        Ok(())
    }
}

#[async_trait]
impl PageDriver for FaultyPage {
    async fn query_all(&self, selector: &str) -> Result<Vec<ElementHandle>, DriverError> {
        self.check_selector(selector)?;
        self.inner.query_all(selector).await
    }

    async fn query_within(
        &self,
        scope: &ElementHandle,
        selector: &str,
    ) -> Result<Vec<ElementHandle>, DriverError> {
        self.check_selector(selector)?;
        self.inner.query_within(scope, selector).await
    }

    async fn parent(&self, element: &ElementHandle) -> Result<Option<ElementHandle>, DriverError> {
        self.inner.parent(element).await
    }

    async fn inner_text(&self, element: &ElementHandle) -> Result<String, DriverError> {
        self.inner.inner_text(element).await
    }

    async fn attribute(
        &self,
        element: &ElementHandle,
        name: &str,
    ) -> Result<Option<String>, DriverError> {
        self.inner.attribute(element, name).await
    }

    async fn is_visible(&self, element: &ElementHandle) -> Result<bool, DriverError> {
        self.inner.is_visible(element).await
    }

    async fn click(&self, element: &ElementHandle) -> Result<(), DriverError> {
        self.inner.click(element).await
    }

    async fn press_key(&self, key: Key) -> Result<(), DriverError> {
        self.inner.press_key(key).await
    }

    async fn select_option(&self, select: &ElementHandle, label: &str) -> Result<bool, DriverError> {
        self.inner.select_option(select, label).await
    }

    async fn read_table(&self, selectors: &TableSelectors) -> Result<TableSnapshot, DriverError> {
        self.inner.read_table(selectors).await
    }

    async fn scroll_metrics(&self, element: &ElementHandle) -> Result<ScrollMetrics, DriverError> {
        self.inner.scroll_metrics(element).await
    }

    async fn scroll_to(&self, element: &ElementHandle, top: f64) -> Result<(), DriverError> {
        if top > 0.0 {
            self.forward_scroll()?;
        }
        self.inner.scroll_to(element, top).await
    }

    async fn wheel(&self, delta_y: f64) -> Result<(), DriverError> {
        self.forward_scroll()?;
        self.inner.wheel(delta_y).await
    }

    async fn scroll_page_to_top(&self) -> Result<(), DriverError> {
        self.inner.scroll_page_to_top().await
    }

    async fn viewport_height(&self) -> Result<f64, DriverError> {
        self.inner.viewport_height().await
    }

    async fn wait_for_network_idle(&self, timeout: Duration) -> Result<bool, DriverError> {
        self.inner.wait_for_network_idle(timeout).await
    }
}
