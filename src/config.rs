use chrono::NaiveDate;
use serde::Deserialize;

use crate::error::{AppError, Result};
use crate::types::{BatchGranularity, DayErrorPolicy, Destination, ReportSpec};

pub const ANALYTICS_API_URL: &str = "https://analyticsdata.googleapis.com";

/// Largest page the Data API will return for a single runReport call.
pub const DEFAULT_PAGE_SIZE: u64 = 250_000;

/// Timeout for a single runReport call (seconds).
pub const REQUEST_TIMEOUT_SECS: u64 = 30;

pub const DEFAULT_DIMENSIONS: &[&str] = &["country", "pagePath", "pageTitle", "date", "city", "region"];
pub const DEFAULT_METRICS: &[&str] = &["activeUsers", "screenPageviews"];
pub const DEFAULT_START_DATE: &str = "2023-05-07";
pub const DEFAULT_END_DATE: &str = "2023-05-10";
pub const DEFAULT_TABLE: &str = "GA4_REPORT";
pub const DEFAULT_CREDENTIALS_FILE: &str = "service-account-key.json";

/// How the loader authenticates against the Data API.
#[derive(Clone, PartialEq)]
pub enum AnalyticsAuth {
    /// A ready bearer token (ANALYTICS_ACCESS_TOKEN).
    AccessToken(String),
    /// Path to a service-account key; tokens are minted from it at startup.
    ServiceAccountKey(String),
}

// Hand-written so the token never ends up in logs.
impl std::fmt::Debug for AnalyticsAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AnalyticsAuth::AccessToken(_) => f.write_str("AccessToken(***)"),
            AnalyticsAuth::ServiceAccountKey(path) => {
                f.debug_tuple("ServiceAccountKey").field(path).finish()
            }
        }
    }
}

impl AnalyticsAuth {
    /// ANALYTICS_ACCESS_TOKEN wins; otherwise the key named by
    /// GOOGLE_APPLICATION_CREDENTIALS.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        match var("ANALYTICS_ACCESS_TOKEN").map(|t| t.trim().to_string()) {
            Some(token) if !token.is_empty() => AnalyticsAuth::AccessToken(token),
            _ => AnalyticsAuth::ServiceAccountKey(
                var("GOOGLE_APPLICATION_CREDENTIALS")
                    .filter(|p| !p.trim().is_empty())
                    .unwrap_or_else(|| DEFAULT_CREDENTIALS_FILE.to_string()),
            ),
        }
    }
}

/// Warehouse connection parameters, read from a JSON file.
#[derive(Clone, Deserialize)]
pub struct WarehouseConfig {
    #[serde(default)]
    pub user: String,
    /// Only forwarded to warehouses that take one; SQLite authenticates by file access.
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub account: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub warehouse: String,
    pub database: String,
    #[serde(default = "default_schema")]
    pub schema: String,
    /// sqlx connection URL, e.g. `sqlite:warehouse.db`.
    pub url: String,
}

fn default_schema() -> String {
    "main".to_string()
}

// Hand-written so the password never ends up in logs.
impl std::fmt::Debug for WarehouseConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WarehouseConfig")
            .field("user", &self.user)
            .field("password", &"***")
            .field("account", &self.account)
            .field("role", &self.role)
            .field("warehouse", &self.warehouse)
            .field("database", &self.database)
            .field("schema", &self.schema)
            .field("url", &self.url)
            .finish()
    }
}

impl WarehouseConfig {
    pub fn from_json(raw: &str) -> Result<Self> {
        let cfg: WarehouseConfig = serde_json::from_str(raw)?;
        if cfg.database.trim().is_empty() {
            return Err(AppError::Config("warehouse database must not be empty".to_string()));
        }
        Ok(cfg)
    }

    pub fn from_file(path: &str) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| AppError::Config(format!("cannot read warehouse config {path}: {e}")))?;
        Self::from_json(&raw)
    }
}

#[derive(Clone)]
pub struct Config {
    pub log_level: String,
    pub api_url: String,
    pub auth: AnalyticsAuth,
    pub report: ReportSpec,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub warehouse: WarehouseConfig,
    pub destination: Destination,
    pub granularity: BatchGranularity,
    pub on_day_error: DayErrorPolicy,
    /// Create the destination table when it does not exist (WAREHOUSE_AUTO_CREATE)
    pub auto_create: bool,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("log_level", &self.log_level)
            .field("api_url", &self.api_url)
            .field("auth", &self.auth)
            .field("report", &self.report)
            .field("start_date", &self.start_date)
            .field("end_date", &self.end_date)
            .field("warehouse", &self.warehouse)
            .field("destination", &self.destination)
            .field("granularity", &self.granularity)
            .field("on_day_error", &self.on_day_error)
            .field("auto_create", &self.auto_create)
            .finish()
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let warehouse = WarehouseConfig::from_file(
            &std::env::var("WAREHOUSE_CONFIG").unwrap_or_else(|_| "warehouse.json".to_string()),
        )?;
        Self::from_vars(|key| std::env::var(key).ok(), warehouse)
    }

    /// Builds the config from a variable lookup. Split out of `from_env` so the
    /// parsing rules can be exercised without touching the process environment.
    pub fn from_vars(
        var: impl Fn(&str) -> Option<String>,
        warehouse: WarehouseConfig,
    ) -> Result<Self> {
        let property_id = var("ANALYTICS_PROPERTY_ID")
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| AppError::Config("ANALYTICS_PROPERTY_ID must be set".to_string()))?;

        let dimensions = var("REPORT_DIMENSIONS")
            .map(|s| split_list(&s))
            .unwrap_or_else(|| DEFAULT_DIMENSIONS.iter().map(|s| s.to_string()).collect());
        let metrics = var("REPORT_METRICS")
            .map(|s| split_list(&s))
            .unwrap_or_else(|| DEFAULT_METRICS.iter().map(|s| s.to_string()).collect());
        if metrics.is_empty() {
            return Err(AppError::Config("REPORT_METRICS must name at least one metric".to_string()));
        }

        let start_date = parse_date(
            "REPORT_START_DATE",
            &var("REPORT_START_DATE").unwrap_or_else(|| DEFAULT_START_DATE.to_string()),
        )?;
        let end_date = parse_date(
            "REPORT_END_DATE",
            &var("REPORT_END_DATE").unwrap_or_else(|| DEFAULT_END_DATE.to_string()),
        )?;
        if start_date > end_date {
            return Err(AppError::Config(format!(
                "REPORT_START_DATE {start_date} is after REPORT_END_DATE {end_date}"
            )));
        }

        let page_size = var("REPORT_PAGE_SIZE")
            .unwrap_or_else(|| DEFAULT_PAGE_SIZE.to_string())
            .parse::<u64>()
            .ok()
            .filter(|n| *n > 0)
            .ok_or_else(|| AppError::Config("REPORT_PAGE_SIZE must be a positive integer".to_string()))?;

        let destination = Destination {
            database: var("DESTINATION_DATABASE").unwrap_or_else(|| warehouse.database.clone()),
            schema: var("DESTINATION_SCHEMA").unwrap_or_else(|| warehouse.schema.clone()),
            table: var("DESTINATION_TABLE").unwrap_or_else(|| DEFAULT_TABLE.to_string()),
        };

        Ok(Self {
            log_level: var("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            api_url: var("ANALYTICS_API_URL").unwrap_or_else(|| ANALYTICS_API_URL.to_string()),
            auth: AnalyticsAuth::from_vars(&var),
            report: ReportSpec {
                property_id,
                dimensions,
                metrics,
                page_size,
                keep_empty_rows: parse_bool("REPORT_KEEP_EMPTY_ROWS", var("REPORT_KEEP_EMPTY_ROWS"), false)?,
                return_property_quota: parse_bool("REPORT_RETURN_QUOTA", var("REPORT_RETURN_QUOTA"), false)?,
            },
            start_date,
            end_date,
            warehouse,
            destination,
            granularity: var("LOAD_GRANULARITY")
                .map(|s| s.parse::<BatchGranularity>())
                .transpose()
                .map_err(AppError::Config)?
                .unwrap_or_default(),
            on_day_error: var("ON_DAY_ERROR")
                .map(|s| s.parse::<DayErrorPolicy>())
                .transpose()
                .map_err(AppError::Config)?
                .unwrap_or_default(),
            auto_create: parse_bool("WAREHOUSE_AUTO_CREATE", var("WAREHOUSE_AUTO_CREATE"), true)?,
        })
    }
}

fn split_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_date(key: &str, s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|_| AppError::Config(format!("{key} must be a YYYY-MM-DD date, got {s:?}")))
}

fn parse_bool(key: &str, raw: Option<String>, default: bool) -> Result<bool> {
    match raw.as_deref().map(|s| s.trim().to_lowercase()) {
        None => Ok(default),
        Some(s) => match s.as_str() {
            "1" | "true" | "yes" => Ok(true),
            "0" | "false" | "no" => Ok(false),
            _ => Err(AppError::Config(format!("{key} must be true or false, got {s:?}"))),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn warehouse() -> WarehouseConfig {
        WarehouseConfig::from_json(
            r#"{"user":"loader","password":"hunter2","account":"acme","role":"LOADER",
                "warehouse":"COMPUTE_WH","database":"ANALYTICS","url":"sqlite::memory:"}"#,
        )
        .unwrap()
    }

    fn config_with(vars: &[(&str, &str)]) -> Result<Config> {
        let map: HashMap<String, String> =
            vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_vars(|k| map.get(k).cloned(), warehouse())
    }

    #[test]
    fn defaults_match_the_pages_report() {
        let cfg = config_with(&[("ANALYTICS_PROPERTY_ID", "123456")]).unwrap();
        assert_eq!(cfg.report.dimensions.len(), 6);
        assert_eq!(cfg.report.metrics, vec!["activeUsers", "screenPageviews"]);
        assert_eq!(cfg.report.page_size, DEFAULT_PAGE_SIZE);
        assert_eq!(cfg.start_date, NaiveDate::from_ymd_opt(2023, 5, 7).unwrap());
        assert_eq!(cfg.end_date, NaiveDate::from_ymd_opt(2023, 5, 10).unwrap());
        assert_eq!(cfg.destination.database, "ANALYTICS");
        assert_eq!(cfg.destination.schema, "main");
        assert_eq!(cfg.destination.table, DEFAULT_TABLE);
        assert_eq!(cfg.granularity, BatchGranularity::PerPage);
        assert_eq!(cfg.on_day_error, DayErrorPolicy::Abort);
        assert!(cfg.auto_create);
        assert!(!cfg.report.keep_empty_rows);
    }

    #[test]
    fn property_id_is_required() {
        assert!(matches!(config_with(&[]), Err(AppError::Config(_))));
    }

    #[test]
    fn rejects_inverted_range_and_zero_page_size() {
        let inverted = config_with(&[
            ("ANALYTICS_PROPERTY_ID", "1"),
            ("REPORT_START_DATE", "2023-05-10"),
            ("REPORT_END_DATE", "2023-05-07"),
        ]);
        assert!(matches!(inverted, Err(AppError::Config(_))));

        let zero = config_with(&[("ANALYTICS_PROPERTY_ID", "1"), ("REPORT_PAGE_SIZE", "0")]);
        assert!(matches!(zero, Err(AppError::Config(_))));
    }

    #[test]
    fn overrides_are_applied() {
        let cfg = config_with(&[
            ("ANALYTICS_PROPERTY_ID", "1"),
            ("REPORT_DIMENSIONS", "date, country"),
            ("REPORT_METRICS", "sessions"),
            ("REPORT_KEEP_EMPTY_ROWS", "true"),
            ("LOAD_GRANULARITY", "whole_run"),
            ("ON_DAY_ERROR", "skip"),
            ("DESTINATION_SCHEMA", "raw"),
            ("DESTINATION_TABLE", "PAGES"),
        ])
        .unwrap();
        assert_eq!(cfg.report.dimensions, vec!["date", "country"]);
        assert_eq!(cfg.report.metrics, vec!["sessions"]);
        assert!(cfg.report.keep_empty_rows);
        assert_eq!(cfg.granularity, BatchGranularity::WholeRun);
        assert_eq!(cfg.on_day_error, DayErrorPolicy::Skip);
        assert_eq!(cfg.destination.to_string(), "ANALYTICS.raw.PAGES");
    }

    #[test]
    fn password_is_not_printed() {
        let rendered = format!("{:?}", warehouse());
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn service_account_key_is_the_default_credential() {
        let cfg = config_with(&[("ANALYTICS_PROPERTY_ID", "1")]).unwrap();
        assert_eq!(
            cfg.auth,
            AnalyticsAuth::ServiceAccountKey(DEFAULT_CREDENTIALS_FILE.to_string())
        );

        let cfg = config_with(&[
            ("ANALYTICS_PROPERTY_ID", "1"),
            ("GOOGLE_APPLICATION_CREDENTIALS", "/secrets/ga4.json"),
        ])
        .unwrap();
        assert_eq!(cfg.auth, AnalyticsAuth::ServiceAccountKey("/secrets/ga4.json".to_string()));
    }

    #[test]
    fn access_token_overrides_the_key_file() {
        let cfg = config_with(&[
            ("ANALYTICS_PROPERTY_ID", "1"),
            ("ANALYTICS_ACCESS_TOKEN", " ya29.token "),
            ("GOOGLE_APPLICATION_CREDENTIALS", "/secrets/ga4.json"),
        ])
        .unwrap();
        assert_eq!(cfg.auth, AnalyticsAuth::AccessToken("ya29.token".to_string()));
        assert!(!format!("{cfg:?}").contains("ya29.token"));

        // Blank means unset.
        let cfg = config_with(&[("ANALYTICS_PROPERTY_ID", "1"), ("ANALYTICS_ACCESS_TOKEN", "  ")]).unwrap();
        assert!(matches!(cfg.auth, AnalyticsAuth::ServiceAccountKey(_)));
    }
}
