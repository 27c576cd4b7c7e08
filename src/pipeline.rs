use chrono::NaiveDate;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::db::Warehouse;
use crate::error::{AppError, Result};
use crate::fetcher::ReportSource;
use crate::transform::{normalize, shape};
use crate::types::{
    BatchGranularity, DayErrorPolicy, Destination, NormalizedBatch, ReportQuery, ReportSpec,
    RunResult,
};

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub report: ReportSpec,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub destination: Destination,
    pub granularity: BatchGranularity,
    pub on_day_error: DayErrorPolicy,
}

impl PipelineSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            report: cfg.report.clone(),
            start_date: cfg.start_date,
            end_date: cfg.end_date,
            destination: cfg.destination.clone(),
            granularity: cfg.granularity,
            on_day_error: cfg.on_day_error,
        }
    }
}

/// Walks the date range one day at a time and pages through each day,
/// shaping, normalizing and appending every page. Strictly sequential:
/// the next fetch is only issued after the previous write completed.
pub struct Pipeline<S, W> {
    source: S,
    warehouse: W,
    settings: PipelineSettings,
}

impl<S: ReportSource, W: Warehouse> Pipeline<S, W> {
    pub fn new(source: S, warehouse: W, settings: PipelineSettings) -> Self {
        Self {
            source,
            warehouse,
            settings,
        }
    }

    pub async fn run(&self) -> Result<RunResult> {
        let s = &self.settings;
        if s.report.page_size == 0 {
            return Err(AppError::Config("page size must be positive".to_string()));
        }
        if s.start_date > s.end_date {
            return Err(AppError::Config(format!(
                "start date {} is after end date {}",
                s.start_date, s.end_date
            )));
        }

        let mut result = RunResult::default();
        let mut buffer: Vec<NormalizedBatch> = Vec::new();

        for day in s.start_date.iter_days().take_while(|d| *d <= s.end_date) {
            match self.load_day(day, &mut result, &mut buffer).await {
                Ok(()) => {}
                Err(e) if s.on_day_error == DayErrorPolicy::Skip && e.is_day_scoped() => {
                    result.days_skipped += 1;
                    warn!(event = "DAY_SKIPPED", day = %day, "Skipping rest of {day}: {e}");
                }
                Err(e) => return Err(e),
            }
        }

        if s.granularity == BatchGranularity::WholeRun {
            result.total_rows_written += self.flush(buffer).await?;
        }

        info!(
            event = "RUN_COMPLETE",
            rows = result.total_rows_written,
            api_calls = result.api_calls_issued,
            pages = result.pages_written,
            days_skipped = result.days_skipped,
            "RUN COMPLETE | {} → {} | rows: {} | api calls: {} | table: {}",
            s.start_date,
            s.end_date,
            result.total_rows_written,
            result.api_calls_issued,
            s.destination,
        );
        Ok(result)
    }

    async fn load_day(
        &self,
        day: NaiveDate,
        result: &mut RunResult,
        buffer: &mut Vec<NormalizedBatch>,
    ) -> Result<()> {
        let s = &self.settings;
        let page_size = s.report.page_size;
        let mut offset = 0u64;
        let mut pages = 0u64;

        loop {
            let query = ReportQuery::for_day(&s.report, day, offset);
            result.api_calls_issued += 1;
            let page = self
                .source
                .fetch_page(&query)
                .await
                .map_err(|e| e.at_page(day, offset))?;

            if page.is_empty() {
                if pages == 0 {
                    info!(event = "DAY_EMPTY", day = %day, "No rows for {day}");
                }
                break;
            }
            debug!(
                day = %day,
                offset,
                kind = ?page.kind,
                metadata = ?page.metadata,
                quota = ?page.property_quota,
                "page received"
            );

            let batch = shape(&page)
                .and_then(|b| normalize(b, &s.report.metrics))
                .map_err(|e| e.at_page(day, offset))?;
            let rows = batch.len() as u64;

            match s.granularity {
                BatchGranularity::PerPage => {
                    let written = self
                        .warehouse
                        .append(&batch, &s.destination)
                        .await
                        .map_err(|e| e.at_page(day, offset))?;
                    result.total_rows_written += written;
                }
                BatchGranularity::WholeRun => buffer.push(batch),
            }
            result.pages_written += 1;

            info!(
                event = "PAGE_WRITTEN",
                day = %day,
                offset,
                rows,
                row_count = page.row_count,
                "PAGE {} | day: {} | offset: {} | rows: {} of {}",
                if s.granularity == BatchGranularity::PerPage { "WRITTEN" } else { "BUFFERED" },
                day,
                offset,
                rows,
                page.row_count,
            );

            offset += page_size;
            pages += 1;
            // row_count is the day's total and does not change between pages
            if pages >= page.row_count.div_ceil(page_size) {
                break;
            }
        }
        Ok(())
    }

    /// Concatenate buffered batches and append them in one write.
    async fn flush(&self, buffer: Vec<NormalizedBatch>) -> Result<u64> {
        let batches = buffer.len();
        let Some(merged) = concat(buffer)? else {
            return Ok(0);
        };
        if merged.is_empty() {
            return Ok(0);
        }
        self.warehouse
            .append(&merged, &self.settings.destination)
            .await
            .map_err(|e| AppError::BufferedWrite {
                batches,
                source: Box::new(e),
            })
    }
}

/// Rows keep their own LOADTIMESTAMP; the merged batch reports the earliest.
fn concat(batches: Vec<NormalizedBatch>) -> Result<Option<NormalizedBatch>> {
    let mut iter = batches.into_iter();
    let Some(mut merged) = iter.next() else {
        return Ok(None);
    };
    for next in iter {
        if next.batch.columns != merged.batch.columns {
            return Err(AppError::Shape(format!(
                "column set changed mid-run: {:?} vs {:?}",
                merged.batch.columns, next.batch.columns
            )));
        }
        merged.loaded_at = merged.loaded_at.min(next.loaded_at);
        merged.batch.rows.extend(next.batch.rows);
    }
    Ok(Some(merged))
}
