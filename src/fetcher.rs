use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use google_cloud_auth::credentials::CredentialsFile;
use google_cloud_auth::token::DefaultTokenSourceProvider;
use google_cloud_token::{TokenSource, TokenSourceProvider};
use reqwest::header::AUTHORIZATION;
use serde::Serialize;
use tracing::{debug, info};

use crate::config::{AnalyticsAuth, REQUEST_TIMEOUT_SECS};
use crate::error::{AppError, Result};
use crate::types::{RawPage, RawRow, ReportQuery};

const ANALYTICS_READONLY_SCOPE: &str = "https://www.googleapis.com/auth/analytics.readonly";

/// Anything that can answer a single-day, single-page report query.
#[async_trait]
pub trait ReportSource: Send + Sync {
    async fn fetch_page(&self, query: &ReportQuery) -> Result<RawPage>;
}

enum Credentials {
    Static(String),
    /// Minted from a service-account key; caches and refreshes on its own.
    ServiceAccount(Arc<dyn TokenSource>),
}

/// GA4 Data API client (`properties/{id}:runReport`).
pub struct AnalyticsClient {
    client: reqwest::Client,
    api_url: String,
    credentials: Credentials,
}

impl AnalyticsClient {
    /// Resolves credentials and builds the HTTP client. With a service-account
    /// key the first token is minted here, so a bad key fails before any day runs.
    pub async fn connect(api_url: &str, auth: &AnalyticsAuth) -> Result<Self> {
        let credentials = match auth {
            AnalyticsAuth::AccessToken(token) => Credentials::Static(token.clone()),
            AnalyticsAuth::ServiceAccountKey(path) => {
                let key_json = tokio::fs::read_to_string(path).await.map_err(|e| {
                    AppError::Auth(format!("cannot read service account key {path}: {e}"))
                })?;
                let source = service_account_token_source(&key_json).await?;
                source
                    .token()
                    .await
                    .map_err(|e| AppError::Auth(format!("cannot mint token from {path}: {e}")))?;
                info!("Minted analytics token from service account key {path}");
                Credentials::ServiceAccount(source)
            }
        };

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            credentials,
        })
    }

    fn report_url(&self, property_id: &str) -> String {
        format!("{}/v1beta/properties/{}:runReport", self.api_url, property_id)
    }

    async fn authorization(&self) -> Result<String> {
        let token = match &self.credentials {
            Credentials::Static(token) => token.clone(),
            Credentials::ServiceAccount(source) => source
                .token()
                .await
                .map_err(|e| AppError::Auth(format!("token refresh failed: {e}")))?,
        };
        Ok(bearer_value(&token))
    }
}

async fn service_account_token_source(key_json: &str) -> Result<Arc<dyn TokenSource>> {
    let creds: CredentialsFile = serde_json::from_str(key_json)
        .map_err(|e| AppError::Auth(format!("malformed service account key: {e}")))?;
    let config = google_cloud_auth::project::Config::default().with_scopes(&[ANALYTICS_READONLY_SCOPE]);
    let provider = DefaultTokenSourceProvider::new_with_credentials(config, Box::new(creds))
        .await
        .map_err(|e| AppError::Auth(format!("cannot build token source: {e}")))?;
    Ok(provider.token_source())
}

/// Token sources already prefix the token type; static tokens are bare.
fn bearer_value(token: &str) -> String {
    if token.starts_with("Bearer ") {
        token.to_string()
    } else {
        format!("Bearer {token}")
    }
}

#[async_trait]
impl ReportSource for AnalyticsClient {
    async fn fetch_page(&self, query: &ReportQuery) -> Result<RawPage> {
        let url = self.report_url(&query.property_id);
        debug!(
            day = %query.start_date,
            offset = query.page_offset,
            limit = query.page_size,
            "runReport request"
        );

        let resp = self
            .client
            .post(&url)
            .header(AUTHORIZATION, self.authorization().await?)
            .json(&RunReportBody::from_query(query))
            .send()
            .await?;

        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(AppError::Api {
                status: status.as_u16(),
                message: api_error_message(&body),
            });
        }

        let value: serde_json::Value = serde_json::from_str(&body)?;
        parse_report_response(&value)
    }
}

// ---------------------------------------------------------------------------
// Wire format
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct NamedField<'a> {
    name: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DateRangeBody {
    start_date: String,
    end_date: String,
}

/// JSON body of a runReport call. int64 fields are sent as strings, as the
/// proto3 JSON mapping expects.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RunReportBody<'a> {
    dimensions: Vec<NamedField<'a>>,
    metrics: Vec<NamedField<'a>>,
    date_ranges: Vec<DateRangeBody>,
    limit: String,
    offset: String,
    keep_empty_rows: bool,
    return_property_quota: bool,
}

impl<'a> RunReportBody<'a> {
    pub(crate) fn from_query(query: &'a ReportQuery) -> Self {
        Self {
            dimensions: query.dimensions.iter().map(|d| NamedField { name: d.as_str() }).collect(),
            metrics: query.metrics.iter().map(|m| NamedField { name: m.as_str() }).collect(),
            date_ranges: vec![DateRangeBody {
                start_date: query.start_date.format("%Y-%m-%d").to_string(),
                end_date: query.end_date.format("%Y-%m-%d").to_string(),
            }],
            limit: query.page_size.to_string(),
            offset: query.page_offset.to_string(),
            keep_empty_rows: query.keep_empty_rows,
            return_property_quota: query.return_property_quota,
        }
    }
}

/// Parse a runReport response. A response without a `rows` key is a valid,
/// empty page: the API omits the key when nothing matched.
pub fn parse_report_response(v: &serde_json::Value) -> Result<RawPage> {
    let dimension_headers = header_names(v, "dimensionHeaders")?;
    let metric_headers = header_names(v, "metricHeaders")?;

    let row_count = v
        .get("rowCount")
        .and_then(|c| c.as_u64().or_else(|| c.as_str().and_then(|s| s.parse().ok())))
        .unwrap_or(0);

    let rows = match v.get("rows") {
        None | Some(serde_json::Value::Null) => Vec::new(),
        Some(serde_json::Value::Array(items)) => items
            .iter()
            .enumerate()
            .map(|(i, item)| {
                Ok(RawRow {
                    dimension_values: cell_values(item, "dimensionValues", i)?,
                    metric_values: cell_values(item, "metricValues", i)?,
                })
            })
            .collect::<Result<Vec<_>>>()?,
        Some(_) => return Err(AppError::Shape("`rows` is not an array".to_string())),
    };

    Ok(RawPage {
        rows,
        row_count,
        dimension_headers,
        metric_headers,
        kind: v.get("kind").and_then(|k| k.as_str()).map(|s| s.to_string()),
        metadata: v.get("metadata").cloned(),
        property_quota: v.get("propertyQuota").cloned(),
    })
}

fn header_names(v: &serde_json::Value, key: &str) -> Result<Vec<String>> {
    match v.get(key) {
        None => Ok(Vec::new()),
        Some(serde_json::Value::Array(items)) => items
            .iter()
            .map(|h| {
                h.get("name")
                    .and_then(|n| n.as_str())
                    .map(|s| s.to_string())
                    .ok_or_else(|| AppError::Shape(format!("{key} entry has no name")))
            })
            .collect(),
        Some(_) => Err(AppError::Shape(format!("`{key}` is not an array"))),
    }
}

fn cell_values(row: &serde_json::Value, key: &str, row_idx: usize) -> Result<Vec<String>> {
    let Some(cells) = row.get(key) else {
        return Ok(Vec::new());
    };
    let cells = cells
        .as_array()
        .ok_or_else(|| AppError::Shape(format!("row {row_idx}: `{key}` is not an array")))?;
    Ok(cells
        .iter()
        .map(|c| {
            c.get("value")
                .and_then(|x| x.as_str())
                .unwrap_or("")
                .to_string()
        })
        .collect())
}

/// Pull the human-readable message out of a Google API error body, falling
/// back to the raw body.
fn api_error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            let err = v.get("error")?;
            let message = err.get("message")?.as_str()?;
            Some(match err.get("status").and_then(|s| s.as_str()) {
                Some(status) => format!("{status}: {message}"),
                None => message.to_string(),
            })
        })
        .unwrap_or_else(|| body.trim().to_string())
}
