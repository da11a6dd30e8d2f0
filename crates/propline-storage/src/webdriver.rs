//! Minimal W3C WebDriver client over reqwest.

use std::path::PathBuf;
use std::time::Duration;

use reqwest::{Method, StatusCode};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

use crate::BackoffPolicy;

/// Key under which WebDriver serializes element references.
pub const ELEMENT_KEY: &str = "element-6066-11e4-a52e-4f735466cecf";

#[derive(Debug, Clone)]
pub struct WebDriverConfig {
    pub server_url: String,
    /// Attach to this already-authenticated session instead of opening one.
    pub session_id: Option<String>,
    /// Persistent browser profile holding the logged-in state.
    pub browser_profile_dir: Option<PathBuf>,
    pub headless: bool,
    pub timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for WebDriverConfig {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:9515".to_string(),
            session_id: None,
            browser_profile_dir: None,
            headless: false,
            timeout: Duration::from_secs(30),
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum WebDriverError {
    #[error("webdriver transport failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("webdriver {command} returned {error}: {message}")]
    Command {
        command: String,
        error: String,
        message: String,
    },
    #[error("unexpected webdriver response for {command}: {detail}")]
    Protocol { command: String, detail: String },
}

/// Driver restarts and proxies in front of a grid answer with these while
/// the browser itself is fine.
fn transient_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT
    )
}

fn transient_transport(err: &reqwest::Error) -> bool {
    err.is_connect() || err.is_timeout()
}

impl WebDriverError {
    pub fn is_stale_element(&self) -> bool {
        matches!(self, Self::Command { error, .. } if error == "stale element reference")
    }
}

#[derive(Debug)]
pub struct WebDriverClient {
    http: reqwest::Client,
    base: String,
    session_id: String,
    owns_session: bool,
    backoff: BackoffPolicy,
}

impl WebDriverClient {
    pub async fn connect(config: WebDriverConfig) -> Result<Self, WebDriverError> {
        let http = reqwest::Client::builder().timeout(config.timeout).build()?;
        let mut client = Self {
            http,
            base: config.server_url.trim_end_matches('/').to_string(),
            session_id: String::new(),
            owns_session: false,
            backoff: config.backoff,
        };

        if let Some(session_id) = config.session_id {
            client.session_id = session_id;
            return Ok(client);
        }

        let mut args = Vec::new();
        if let Some(dir) = &config.browser_profile_dir {
            args.push(format!("--user-data-dir={}", dir.display()));
        }
        if config.headless {
            args.push("--headless=new".to_string());
        }
        let capabilities = json!({
            "capabilities": {
                "alwaysMatch": {
                    "browserName": "chrome",
                    "goog:chromeOptions": { "args": args }
                }
            }
        });
        let value = client
            .send(Method::POST, "/session".to_string(), Some(capabilities), "new session")
            .await?;
        let session_id = value
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| WebDriverError::Protocol {
                command: "new session".into(),
                detail: "missing sessionId".into(),
            })?;
        client.session_id = session_id.to_string();
        client.owns_session = true;
        Ok(client)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn element_ref(element_id: &str) -> Value {
        json!({ ELEMENT_KEY: element_id })
    }

    pub fn element_id(value: &Value) -> Option<String> {
        value.get(ELEMENT_KEY).and_then(Value::as_str).map(ToString::to_string)
    }

    fn session_path(&self, suffix: &str) -> String {
        format!("/session/{}{}", self.session_id, suffix)
    }

    async fn send(
        &self,
        method: Method,
        path: String,
        body: Option<Value>,
        command: &str,
    ) -> Result<Value, WebDriverError> {
        let url = format!("{}{}", self.base, path);
        let mut attempt = 0usize;
        loop {
            let mut request = self.http.request(method.clone(), &url);
            if method == Method::POST {
                request = request.json(body.as_ref().unwrap_or(&json!({})));
            }

            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if transient_status(status) && attempt < self.backoff.max_retries {
                        debug!(command, attempt, %status, "webdriver busy, retrying");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    let payload: Value = resp.json().await?;
                    let value = payload.get("value").cloned().unwrap_or(Value::Null);
                    if status.is_success() {
                        return Ok(value);
                    }
                    let error = value
                        .get("error")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown error")
                        .to_string();
                    let message = value
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    return Err(WebDriverError::Command {
                        command: command.to_string(),
                        error,
                        message,
                    });
                }
                Err(err) => {
                    if transient_transport(&err) && attempt < self.backoff.max_retries {
                        debug!(command, attempt, error = %err, "retrying webdriver command");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(WebDriverError::Transport(err));
                }
            }
        }
    }

    fn element_list(command: &str, value: Value) -> Result<Vec<String>, WebDriverError> {
        let items = value.as_array().ok_or_else(|| WebDriverError::Protocol {
            command: command.to_string(),
            detail: "expected an array of elements".into(),
        })?;
        Ok(items.iter().filter_map(Self::element_id).collect())
    }

    pub async fn navigate(&self, url: &str) -> Result<(), WebDriverError> {
        self.send(
            Method::POST,
            self.session_path("/url"),
            Some(json!({ "url": url })),
            "navigate",
        )
        .await?;
        Ok(())
    }

    pub async fn find_elements(&self, css: &str) -> Result<Vec<String>, WebDriverError> {
        let value = self
            .send(
                Method::POST,
                self.session_path("/elements"),
                Some(json!({ "using": "css selector", "value": css })),
                "find elements",
            )
            .await?;
        Self::element_list("find elements", value)
    }

    pub async fn find_elements_from(
        &self,
        element_id: &str,
        css: &str,
    ) -> Result<Vec<String>, WebDriverError> {
        let value = self
            .send(
                Method::POST,
                self.session_path(&format!("/element/{element_id}/elements")),
                Some(json!({ "using": "css selector", "value": css })),
                "find elements from element",
            )
            .await?;
        Self::element_list("find elements from element", value)
    }

    pub async fn element_text(&self, element_id: &str) -> Result<String, WebDriverError> {
        let value = self
            .send(
                Method::GET,
                self.session_path(&format!("/element/{element_id}/text")),
                None,
                "element text",
            )
            .await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    pub async fn element_attribute(
        &self,
        element_id: &str,
        name: &str,
    ) -> Result<Option<String>, WebDriverError> {
        let value = self
            .send(
                Method::GET,
                self.session_path(&format!("/element/{element_id}/attribute/{name}")),
                None,
                "element attribute",
            )
            .await?;
        Ok(value.as_str().map(ToString::to_string))
    }

    pub async fn element_displayed(&self, element_id: &str) -> Result<bool, WebDriverError> {
        let value = self
            .send(
                Method::GET,
                self.session_path(&format!("/element/{element_id}/displayed")),
                None,
                "element displayed",
            )
            .await?;
        Ok(value.as_bool().unwrap_or(false))
    }

    pub async fn element_click(&self, element_id: &str) -> Result<(), WebDriverError> {
        self.send(
            Method::POST,
            self.session_path(&format!("/element/{element_id}/click")),
            None,
            "element click",
        )
        .await?;
        Ok(())
    }

    /// Run a synchronous script in the page. Element arguments are passed as
    /// [`WebDriverClient::element_ref`] values.
    pub async fn execute(&self, script: &str, args: Vec<Value>) -> Result<Value, WebDriverError> {
        self.send(
            Method::POST,
            self.session_path("/execute/sync"),
            Some(json!({ "script": script, "args": args })),
            "execute script",
        )
        .await
    }

    pub async fn perform_actions(&self, actions: Value) -> Result<(), WebDriverError> {
        self.send(
            Method::POST,
            self.session_path("/actions"),
            Some(json!({ "actions": actions })),
            "perform actions",
        )
        .await?;
        self.send(
            Method::DELETE,
            self.session_path("/actions"),
            None,
            "release actions",
        )
        .await?;
        Ok(())
    }

    /// Ends the browser session if this client opened it. Attached sessions
    /// are left running for their owner.
    pub async fn close(self) -> Result<(), WebDriverError> {
        if self.owns_session {
            self.send(Method::DELETE, self.session_path(""), None, "delete session")
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn element_refs_round_trip_through_the_w3c_key() {
        let value = WebDriverClient::element_ref("abc-123");
        assert_eq!(value[ELEMENT_KEY], "abc-123");
        assert_eq!(WebDriverClient::element_id(&value).as_deref(), Some("abc-123"));
        assert_eq!(WebDriverClient::element_id(&json!({"other": "x"})), None);
    }

    #[test]
    fn stale_element_errors_are_recognized() {
        let err = WebDriverError::Command {
            command: "element text".into(),
            error: "stale element reference".into(),
            message: "gone".into(),
        };
        assert!(err.is_stale_element());
        let err = WebDriverError::Command {
            command: "element text".into(),
            error: "no such element".into(),
            message: String::new(),
        };
        assert!(!err.is_stale_element());
    }

    #[test]
    fn only_gateway_statuses_are_transient() {
        assert!(transient_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(transient_status(StatusCode::BAD_GATEWAY));
        // command failures such as "no such element" arrive as 404/500
        assert!(!transient_status(StatusCode::NOT_FOUND));
        assert!(!transient_status(StatusCode::INTERNAL_SERVER_ERROR));
    }

    #[test]
    fn element_lists_require_arrays() {
        let ids = WebDriverClient::element_list(
            "find elements",
            json!([WebDriverClient::element_ref("a"), WebDriverClient::element_ref("b")]),
        )
        .unwrap();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
        assert!(WebDriverClient::element_list("find elements", json!({})).is_err());
    }
}
