use chrono::NaiveDate;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Report request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Report API auth error: {0}")]
    Auth(String),

    #[error("Report API returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Malformed report page: {0}")]
    Shape(String),

    #[error("Cannot cast {column} value {value:?} (row {row}) to {target}")]
    Cast {
        column: String,
        row: usize,
        value: String,
        target: &'static str,
    },

    #[error("Warehouse write error: {0}")]
    Write(#[from] sqlx::Error),

    #[error("Warehouse schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("day {day} offset {offset}: {source}")]
    Page {
        day: NaiveDate,
        offset: u64,
        source: Box<AppError>,
    },

    #[error("buffered write of {batches} batches: {source}")]
    BufferedWrite {
        batches: usize,
        source: Box<AppError>,
    },
}

pub type Result<T> = std::result::Result<T, AppError>;

impl AppError {
    pub fn at_page(self, day: NaiveDate, offset: u64) -> Self {
        AppError::Page {
            day,
            offset,
            source: Box::new(self),
        }
    }

    /// Request and cast failures only affect the day they happened on.
    /// Everything else means the run itself is broken.
    pub fn is_day_scoped(&self) -> bool {
        match self {
            AppError::Request(_)
            | AppError::Auth(_)
            | AppError::Api { .. }
            | AppError::Cast { .. } => true,
            AppError::Page { source, .. } => source.is_day_scoped(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_context_is_rendered() {
        let day = NaiveDate::from_ymd_opt(2023, 5, 7).unwrap();
        let err = AppError::Shape("row 0 has 1 metric values, expected 2".to_string())
            .at_page(day, 250_000);
        assert_eq!(
            err.to_string(),
            "day 2023-05-07 offset 250000: Malformed report page: row 0 has 1 metric values, expected 2"
        );
    }

    #[test]
    fn day_scope_follows_wrapped_source() {
        let day = NaiveDate::from_ymd_opt(2023, 5, 7).unwrap();
        let cast = AppError::Cast {
            column: "activeUsers".to_string(),
            row: 0,
            value: "N/A".to_string(),
            target: "double",
        };
        assert!(cast.at_page(day, 0).is_day_scoped());
        assert!(AppError::Auth("token refresh failed".to_string()).at_page(day, 0).is_day_scoped());
        assert!(!AppError::SchemaMismatch("x".to_string()).at_page(day, 0).is_day_scoped());
        assert!(!AppError::Shape("x".to_string()).is_day_scoped());
    }
}
