use crate::error::{AppError, Result};
use crate::types::{RawPage, TabularBatch, Value};

/// Flatten a report page into ordered columns: dimension headers followed by
/// metric headers. Values stay text until normalization.
pub fn shape(page: &RawPage) -> Result<TabularBatch> {
    let dims = page.dimension_headers.len();
    let mets = page.metric_headers.len();

    let columns: Vec<String> = page
        .dimension_headers
        .iter()
        .chain(page.metric_headers.iter())
        .cloned()
        .collect();

    let mut rows = Vec::with_capacity(page.rows.len());
    for (i, row) in page.rows.iter().enumerate() {
        if row.dimension_values.len() != dims {
            return Err(AppError::Shape(format!(
                "row {i} has {} dimension values, expected {dims}",
                row.dimension_values.len()
            )));
        }
        if row.metric_values.len() != mets {
            return Err(AppError::Shape(format!(
                "row {i} has {} metric values, expected {mets}",
                row.metric_values.len()
            )));
        }
        rows.push(
            row.dimension_values
                .iter()
                .chain(row.metric_values.iter())
                .map(|v| Value::Text(v.clone()))
                .collect(),
        );
    }

    Ok(TabularBatch { columns, rows })
}
