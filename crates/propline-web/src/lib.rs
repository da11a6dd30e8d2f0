//! JSON query API over scraped prop rows.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::NaiveDate;
use propline_core::Row;
use propline_sync::{query_source, CategorySummary, QuerySource, RowQuery, ScrapeConfig, SortBy};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "propline-web";

#[derive(Debug, Clone)]
pub struct AppState {
    pub source: QuerySource,
}

impl AppState {
    pub fn new(source: QuerySource) -> Self {
        Self { source }
    }
}

#[derive(Debug, Serialize)]
struct DatesResponse {
    source: &'static str,
    dates: Vec<NaiveDate>,
}

#[derive(Debug, Serialize)]
struct CategoriesResponse {
    date: NaiveDate,
    categories: Vec<CategorySummary>,
}

#[derive(Debug, Serialize)]
struct RowsResponse {
    date: NaiveDate,
    count: usize,
    rows: Vec<Row>,
}

/// Raw query string; parsed by hand so bad values get a JSON 400.
#[derive(Debug, Default, Deserialize)]
struct RowsParams {
    date: Option<String>,
    category: Option<String>,
    player: Option<String>,
    sort: Option<String>,
    limit: Option<String>,
}

impl RowsParams {
    fn into_query(self) -> Result<RowQuery, String> {
        let date = self.date.as_deref().ok_or("missing `date`")?;
        let mut query = RowQuery::new(parse_date(date)?);
        query.category = self.category;
        query.player = self.player;
        if let Some(sort) = self.sort.as_deref().filter(|s| !s.trim().is_empty()) {
            query.sort = sort.parse::<SortBy>()?;
        }
        if let Some(limit) = self.limit.as_deref().filter(|s| !s.trim().is_empty()) {
            query.limit = Some(
                limit
                    .trim()
                    .parse()
                    .map_err(|_| format!("invalid limit `{limit}`"))?,
            );
        }
        Ok(query)
    }
}

fn parse_date(raw: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|_| format!("invalid date `{raw}`; expected YYYY-MM-DD"))
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/dates", get(dates_handler))
        .route("/api/dates/{date}/categories", get(categories_handler))
        .route("/api/rows", get(rows_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(config: &ScrapeConfig) -> anyhow::Result<()> {
    let source = query_source(config).await;
    info!(port = config.web_port, source = source.kind(), "serving query api");
    let listener = TcpListener::bind(("0.0.0.0", config.web_port)).await?;
    axum::serve(listener, app(AppState::new(source))).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    serve(&ScrapeConfig::from_env()).await
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(json!({ "status": "ok", "source": state.source.kind() })).into_response()
}

async fn dates_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.source.dates().await {
        Ok(dates) => Json(DatesResponse {
            source: state.source.kind(),
            dates,
        })
        .into_response(),
        Err(err) => server_error(err),
    }
}

async fn categories_handler(
    State(state): State<Arc<AppState>>,
    Path(date): Path<String>,
) -> Response {
    let date = match parse_date(&date) {
        Ok(date) => date,
        Err(message) => return bad_request(message),
    };
    match state.source.categories(date).await {
        Ok(categories) => Json(CategoriesResponse { date, categories }).into_response(),
        Err(err) => server_error(err),
    }
}

async fn rows_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<RowsParams>,
) -> Response {
    let query = match params.into_query() {
        Ok(query) => query,
        Err(message) => return bad_request(message),
    };
    match state.source.rows(&query).await {
        Ok(rows) => Json(RowsResponse {
            date: query.date,
            count: rows.len(),
            rows,
        })
        .into_response(),
        Err(err) => server_error(err),
    }
}

fn bad_request(message: String) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    let message = format!("{err:#}");
    warn!(error = %message, "query failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": message })),
    )
        .into_response()
}
