use chrono::{NaiveDate, NaiveDateTime, SubsecRound, Utc};

use crate::error::{AppError, Result};
use crate::types::{NormalizedBatch, TabularBatch, Value};

pub const DATE_COLUMN: &str = "DATE";
pub const LOAD_TIMESTAMP_COLUMN: &str = "LOADTIMESTAMP";

/// Normalize a batch, stamping it with the current UTC time (whole seconds).
pub fn normalize(batch: TabularBatch, metric_columns: &[String]) -> Result<NormalizedBatch> {
    normalize_at(batch, metric_columns, Utc::now().trunc_subsecs(0).naive_utc())
}

/// Cast metric columns to f64, parse the DATE column and set LOADTIMESTAMP to
/// `loaded_at` on every row. All-or-nothing: the first bad value fails the
/// whole batch.
pub fn normalize_at(
    mut batch: TabularBatch,
    metric_columns: &[String],
    loaded_at: NaiveDateTime,
) -> Result<NormalizedBatch> {
    for metric in metric_columns {
        let idx = batch.column_index(metric).ok_or_else(|| {
            AppError::Shape(format!("metric column {metric} is missing from the batch"))
        })?;
        let column = batch.columns[idx].clone();
        for (row_idx, row) in batch.rows.iter_mut().enumerate() {
            row[idx] = cast_float(&column, row_idx, &row[idx])?;
        }
    }

    if let Some(idx) = batch.column_index(DATE_COLUMN) {
        let column = batch.columns[idx].clone();
        for (row_idx, row) in batch.rows.iter_mut().enumerate() {
            row[idx] = cast_date(&column, row_idx, &row[idx])?;
        }
    }

    match batch.column_index(LOAD_TIMESTAMP_COLUMN) {
        Some(idx) => {
            for row in batch.rows.iter_mut() {
                row[idx] = Value::Timestamp(loaded_at);
            }
        }
        None => {
            batch.columns.push(LOAD_TIMESTAMP_COLUMN.to_string());
            for row in batch.rows.iter_mut() {
                row.push(Value::Timestamp(loaded_at));
            }
        }
    }

    Ok(NormalizedBatch { batch, loaded_at })
}

fn cast_float(column: &str, row: usize, value: &Value) -> Result<Value> {
    let text = match value {
        Value::Float(_) => return Ok(value.clone()),
        Value::Text(s) => s.trim(),
        other => return Err(cast_error(column, row, other.to_string(), "double")),
    };
    match text.parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(Value::Float(v)),
        _ => Err(cast_error(column, row, text.to_string(), "double")),
    }
}

fn cast_date(column: &str, row: usize, value: &Value) -> Result<Value> {
    let text = match value {
        Value::Date(_) => return Ok(value.clone()),
        Value::Text(s) => s.trim(),
        other => return Err(cast_error(column, row, other.to_string(), "date")),
    };
    parse_compact_date(text)
        .map(Value::Date)
        .ok_or_else(|| cast_error(column, row, text.to_string(), "date"))
}

/// `YYYYMMDD`, exactly eight ASCII digits.
fn parse_compact_date(s: &str) -> Option<NaiveDate> {
    if s.len() != 8 || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let year = s[0..4].parse().ok()?;
    let month = s[4..6].parse().ok()?;
    let day = s[6..8].parse().ok()?;
    NaiveDate::from_ymd_opt(year, month, day)
}

fn cast_error(column: &str, row: usize, value: String, target: &'static str) -> AppError {
    AppError::Cast {
        column: column.to_string(),
        row,
        value,
        target,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_batch(columns: &[&str], rows: &[&[&str]]) -> TabularBatch {
        TabularBatch {
            columns: columns.iter().map(|s| s.to_string()).collect(),
            rows: rows
                .iter()
                .map(|r| r.iter().map(|v| Value::Text(v.to_string())).collect())
                .collect(),
        }
    }

    fn metrics() -> Vec<String> {
        vec!["activeUsers".to_string(), "screenPageviews".to_string()]
    }

    fn ts() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2023, 5, 11)
            .unwrap()
            .and_hms_opt(6, 30, 0)
            .unwrap()
    }

    #[test]
    fn casts_metrics_parses_date_and_stamps_rows() {
        let batch = text_batch(
            &["country", "date", "activeUsers", "screenPageviews"],
            &[&["Germany", "20230507", "12", "40"], &["France", "20230507", "7", "0.5"]],
        );
        let out = normalize_at(batch, &metrics(), ts()).unwrap();

        assert_eq!(
            out.columns(),
            &["country", "date", "activeUsers", "screenPageviews", LOAD_TIMESTAMP_COLUMN]
        );
        let day = NaiveDate::from_ymd_opt(2023, 5, 7).unwrap();
        assert_eq!(
            out.rows()[1],
            vec![
                Value::Text("France".to_string()),
                Value::Date(day),
                Value::Float(7.0),
                Value::Float(0.5),
                Value::Timestamp(ts()),
            ]
        );
        assert!(out.rows().iter().all(|r| r[4] == Value::Timestamp(ts())));
        assert_eq!(out.loaded_at, ts());
    }

    #[test]
    fn non_numeric_metric_is_a_cast_error() {
        let batch = text_batch(
            &["date", "activeUsers", "screenPageviews"],
            &[&["20230507", "3", "4"], &["20230507", "N/A", "4"]],
        );
        match normalize_at(batch, &metrics(), ts()).unwrap_err() {
            AppError::Cast { column, row, value, target } => {
                assert_eq!(column, "activeUsers");
                assert_eq!(row, 1);
                assert_eq!(value, "N/A");
                assert_eq!(target, "double");
            }
            other => panic!("expected Cast, got {other:?}"),
        }
    }

    #[test]
    fn nan_is_not_accepted_as_a_metric() {
        let batch = text_batch(&["activeUsers", "screenPageviews"], &[&["NaN", "1"]]);
        assert!(matches!(
            normalize_at(batch, &metrics(), ts()),
            Err(AppError::Cast { .. })
        ));
    }

    #[test]
    fn malformed_date_is_a_cast_error() {
        for bad in ["2023057", "20231301", "2023-5-7x", "2023-05-07", ""] {
            let batch = text_batch(&["date", "activeUsers", "screenPageviews"], &[&[bad, "1", "1"]]);
            match normalize_at(batch, &metrics(), ts()) {
                Err(AppError::Cast { target, .. }) => assert_eq!(target, "date"),
                other => panic!("expected date Cast for {bad:?}, got {other:?}"),
            }
        }
    }

    #[test]
    fn missing_metric_column_is_rejected() {
        let batch = text_batch(&["date", "activeUsers"], &[&["20230507", "1"]]);
        assert!(matches!(
            normalize_at(batch, &metrics(), ts()),
            Err(AppError::Shape(_))
        ));
    }

    #[test]
    fn renormalizing_keeps_values() {
        let batch = text_batch(
            &["date", "activeUsers", "screenPageviews"],
            &[&["20230507", "12", "40.25"]],
        );
        let once = normalize_at(batch, &metrics(), ts()).unwrap();
        let twice = normalize_at(once.batch.clone(), &metrics(), ts()).unwrap();
        assert_eq!(once, twice);
        assert_eq!(twice.columns().len(), 4);
    }

    #[test]
    fn batch_without_date_column_is_fine() {
        let batch = text_batch(&["country", "activeUsers", "screenPageviews"], &[&["Peru", "1", "2"]]);
        let out = normalize_at(batch, &metrics(), ts()).unwrap();
        assert_eq!(out.rows()[0][0], Value::Text("Peru".to_string()));
    }

    #[test]
    fn normalize_stamps_whole_seconds() {
        let batch = text_batch(&["activeUsers", "screenPageviews"], &[&["1", "2"]]);
        let out = normalize(batch, &metrics()).unwrap();
        assert_eq!(out.loaded_at.and_utc().timestamp_subsec_nanos(), 0);
    }
}
