//! [`PageDriver`] over a live browser tab reached through WebDriver.

use std::time::Duration;

use async_trait::async_trait;
use propline_storage::WebDriverClient;
use serde_json::{json, Value};
use tokio::time::{sleep, Instant};

use crate::driver::{
    DriverError, ElementHandle, Key, PageDriver, ScrollMetrics, TableSelectors, TableSnapshot,
};

const READ_TABLE_JS: &str = r#"
const [tableSel, headerSel, rowSel, cellSel] = arguments;
const table = document.querySelector(tableSel);
if (!table) { return { headers: [], rows: [] }; }
const text = (el) => (el.innerText || el.textContent || '').trim();
const headers = Array.from(table.querySelectorAll(headerSel)).map(text);
const rows = Array.from(table.querySelectorAll(rowSel))
  .map((row) => Array.from(row.querySelectorAll(cellSel)).map(text))
  .filter((cells) => cells.length > 0);
return { headers, rows };
"#;

const SCROLL_METRICS_JS: &str = r#"
const el = arguments[0];
return {
  overflowY: getComputedStyle(el).overflowY,
  scrollTop: el.scrollTop,
  scrollHeight: el.scrollHeight,
  clientHeight: el.clientHeight,
};
"#;

const SELECT_OPTION_JS: &str = r#"
const [select, label] = arguments;
const wanted = label.trim().toLowerCase();
const option = Array.from(select.options)
  .find((o) => (o.textContent || '').trim().toLowerCase() === wanted);
if (!option) { return false; }
select.value = option.value;
option.selected = true;
select.dispatchEvent(new Event('input', { bubbles: true }));
select.dispatchEvent(new Event('change', { bubbles: true }));
return true;
"#;

const NETWORK_SNAPSHOT_JS: &str = r#"
return {
  ready: document.readyState,
  resources: performance.getEntriesByType('resource').length,
};
"#;

const IDLE_POLL: Duration = Duration::from_millis(250);

pub struct WebDriverPage {
    client: WebDriverClient,
}

impl WebDriverPage {
    pub fn new(client: WebDriverClient) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &WebDriverClient {
        &self.client
    }

    pub fn into_client(self) -> WebDriverClient {
        self.client
    }

    fn handles(ids: Vec<String>) -> Vec<ElementHandle> {
        ids.into_iter().map(ElementHandle::new).collect()
    }

    fn element_arg(element: &ElementHandle) -> Value {
        WebDriverClient::element_ref(element.id())
    }
}

fn number(value: &Value, key: &str) -> f64 {
    value.get(key).and_then(Value::as_f64).unwrap_or(0.0)
}

fn parse_snapshot(value: Value) -> Result<TableSnapshot, DriverError> {
    serde_json::from_value(value).map_err(|err| DriverError::Script(err.to_string()))
}

#[async_trait]
impl PageDriver for WebDriverPage {
    async fn query_all(&self, selector: &str) -> Result<Vec<ElementHandle>, DriverError> {
        Ok(Self::handles(self.client.find_elements(selector).await?))
    }

    async fn query_within(
        &self,
        scope: &ElementHandle,
        selector: &str,
    ) -> Result<Vec<ElementHandle>, DriverError> {
        Ok(Self::handles(
            self.client.find_elements_from(scope.id(), selector).await?,
        ))
    }

    async fn parent(&self, element: &ElementHandle) -> Result<Option<ElementHandle>, DriverError> {
        let value = self
            .client
            .execute(
                "return arguments[0].parentElement;",
                vec![Self::element_arg(element)],
            )
            .await?;
        Ok(WebDriverClient::element_id(&value).map(ElementHandle::new))
    }

    async fn inner_text(&self, element: &ElementHandle) -> Result<String, DriverError> {
        Ok(self.client.element_text(element.id()).await?)
    }

    async fn attribute(
        &self,
        element: &ElementHandle,
        name: &str,
    ) -> Result<Option<String>, DriverError> {
        Ok(self.client.element_attribute(element.id(), name).await?)
    }

    async fn is_visible(&self, element: &ElementHandle) -> Result<bool, DriverError> {
        Ok(self.client.element_displayed(element.id()).await?)
    }

    async fn click(&self, element: &ElementHandle) -> Result<(), DriverError> {
        Ok(self.client.element_click(element.id()).await?)
    }

    async fn press_key(&self, key: Key) -> Result<(), DriverError> {
        let code = key.webdriver_code();
        self.client
            .perform_actions(json!([{
                "type": "key",
                "id": "keyboard",
                "actions": [
                    { "type": "keyDown", "value": code },
                    { "type": "keyUp", "value": code }
                ]
            }]))
            .await?;
        Ok(())
    }

    async fn select_option(&self, select: &ElementHandle, label: &str) -> Result<bool, DriverError> {
        let value = self
            .client
            .execute(SELECT_OPTION_JS, vec![Self::element_arg(select), json!(label)])
            .await?;
        Ok(value.as_bool().unwrap_or(false))
    }

    async fn read_table(&self, selectors: &TableSelectors) -> Result<TableSnapshot, DriverError> {
        let value = self
            .client
            .execute(
                READ_TABLE_JS,
                vec![
                    json!(selectors.table),
                    json!(selectors.header_cells),
                    json!(selectors.body_rows),
                    json!(selectors.cells),
                ],
            )
            .await?;
        parse_snapshot(value)
    }

    async fn scroll_metrics(&self, element: &ElementHandle) -> Result<ScrollMetrics, DriverError> {
        let value = self
            .client
            .execute(SCROLL_METRICS_JS, vec![Self::element_arg(element)])
            .await?;
        Ok(ScrollMetrics {
            overflow_y: value
                .get("overflowY")
                .and_then(Value::as_str)
                .unwrap_or("visible")
                .to_string(),
            scroll_top: number(&value, "scrollTop"),
            scroll_height: number(&value, "scrollHeight"),
            client_height: number(&value, "clientHeight"),
        })
    }

    async fn scroll_to(&self, element: &ElementHandle, top: f64) -> Result<(), DriverError> {
        self.client
            .execute(
                "arguments[0].scrollTop = arguments[1];",
                vec![Self::element_arg(element), json!(top)],
            )
            .await?;
        Ok(())
    }

    async fn wheel(&self, delta_y: f64) -> Result<(), DriverError> {
        self.client
            .perform_actions(json!([{
                "type": "wheel",
                "id": "wheel",
                "actions": [{
                    "type": "scroll",
                    "x": 10,
                    "y": 10,
                    "deltaX": 0,
                    "deltaY": delta_y.round() as i64,
                    "origin": "viewport"
                }]
            }]))
            .await?;
        Ok(())
    }

    async fn scroll_page_to_top(&self) -> Result<(), DriverError> {
        self.client.execute("window.scrollTo(0, 0);", Vec::new()).await?;
        Ok(())
    }

    async fn viewport_height(&self) -> Result<f64, DriverError> {
        let value = self
            .client
            .execute("return window.innerHeight;", Vec::new())
            .await?;
        value
            .as_f64()
            .ok_or_else(|| DriverError::Script(format!("innerHeight was {value}")))
    }

    /// Idle once the document is complete and the resource count holds still
    /// across two polls.
    async fn wait_for_network_idle(&self, timeout: Duration) -> Result<bool, DriverError> {
        let deadline = Instant::now() + timeout;
        let mut previous: Option<u64> = None;
        while Instant::now() < deadline {
            let snapshot = self.client.execute(NETWORK_SNAPSHOT_JS, Vec::new()).await?;
            let complete = snapshot.get("ready").and_then(Value::as_str) == Some("complete");
            let resources = snapshot.get("resources").and_then(Value::as_u64);
            if complete && resources.is_some() && resources == previous {
                return Ok(true);
            }
            previous = resources;
            sleep(IDLE_POLL).await;
        }
        Ok(false)
    }
}
