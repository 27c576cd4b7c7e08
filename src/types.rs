use chrono::{NaiveDate, NaiveDateTime};

// ---------------------------------------------------------------------------
// Report definition
// ---------------------------------------------------------------------------

/// The fixed part of every request issued during a run.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportSpec {
    pub property_id: String,
    pub dimensions: Vec<String>,
    pub metrics: Vec<String>,
    pub page_size: u64,
    pub keep_empty_rows: bool,
    pub return_property_quota: bool,
}

/// One runReport request: a single-day window at one page offset.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportQuery {
    pub property_id: String,
    pub dimensions: Vec<String>,
    pub metrics: Vec<String>,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub page_size: u64,
    pub page_offset: u64,
    pub keep_empty_rows: bool,
    pub return_property_quota: bool,
}

impl ReportQuery {
    pub fn for_day(spec: &ReportSpec, day: NaiveDate, page_offset: u64) -> Self {
        Self {
            property_id: spec.property_id.clone(),
            dimensions: spec.dimensions.clone(),
            metrics: spec.metrics.clone(),
            start_date: day,
            end_date: day,
            page_size: spec.page_size,
            page_offset,
            keep_empty_rows: spec.keep_empty_rows,
            return_property_quota: spec.return_property_quota,
        }
    }
}

// ---------------------------------------------------------------------------
// Raw API data
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct RawRow {
    pub dimension_values: Vec<String>,
    pub metric_values: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawPage {
    pub rows: Vec<RawRow>,
    /// Total rows matching the day, not the number of rows in this page.
    pub row_count: u64,
    pub dimension_headers: Vec<String>,
    pub metric_headers: Vec<String>,
    pub kind: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub property_quota: Option<serde_json::Value>,
}

impl RawPage {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tabular data
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Text(String),
    Float(f64),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Text(s) => write!(f, "{s}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            Value::Timestamp(ts) => write!(f, "{}", ts.format("%Y-%m-%d %H:%M:%S")),
        }
    }
}

/// Ordered columns plus rows of the same width.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TabularBatch {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl TabularBatch {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.eq_ignore_ascii_case(name))
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// A batch whose metric, DATE and LOADTIMESTAMP columns carry typed values.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedBatch {
    pub batch: TabularBatch,
    pub loaded_at: NaiveDateTime,
}

impl NormalizedBatch {
    pub fn columns(&self) -> &[String] {
        &self.batch.columns
    }

    pub fn rows(&self) -> &[Vec<Value>] {
        &self.batch.rows
    }

    pub fn len(&self) -> usize {
        self.batch.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Load settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub database: String,
    pub schema: String,
    pub table: String,
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.database, self.schema, self.table)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BatchGranularity {
    /// Append every page as soon as it is normalized.
    #[default]
    PerPage,
    /// Buffer every page and append once at the end of the run.
    WholeRun,
}

impl std::str::FromStr for BatchGranularity {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "per_page" | "perpage" => Ok(BatchGranularity::PerPage),
            "whole_run" | "wholerun" => Ok(BatchGranularity::WholeRun),
            other => Err(format!("unknown load granularity {other:?}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DayErrorPolicy {
    #[default]
    Abort,
    /// Log request/cast failures and move on to the next day.
    Skip,
}

impl std::str::FromStr for DayErrorPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "abort" => Ok(DayErrorPolicy::Abort),
            "skip" => Ok(DayErrorPolicy::Skip),
            other => Err(format!("unknown day error policy {other:?}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunResult {
    pub total_rows_written: u64,
    pub api_calls_issued: u64,
    pub pages_written: u64,
    pub days_skipped: u64,
}
