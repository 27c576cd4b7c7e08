use std::path::{Path, PathBuf};
use std::str::FromStr;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Connection, QueryBuilder, Row, Sqlite, SqliteConnection};
use tracing::{debug, info, warn};

use crate::config::WarehouseConfig;
use crate::error::{AppError, Result};
use crate::types::{Destination, NormalizedBatch, Value};

/// SQLite caps bound parameters per statement; stay under the historical limit.
const MAX_BIND_PARAMS: usize = 999;

/// Append-only sink for normalized batches.
#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Append `batch` to `dest` and return the number of rows written.
    async fn append(&self, batch: &NormalizedBatch, dest: &Destination) -> Result<u64>;
}

/// Warehouse backed by SQLite. The connection is bound to one database;
/// schemas other than `main` are attached on first use as sibling files.
pub struct SqliteWarehouse {
    pool: sqlx::SqlitePool,
    database: String,
    /// None for in-memory warehouses.
    attach_dir: Option<PathBuf>,
    auto_create: bool,
}

impl SqliteWarehouse {
    pub async fn connect(cfg: &WarehouseConfig, auto_create: bool) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&cfg.url)?.create_if_missing(true);
        // One long-lived connection: attached schemas are per connection.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        info!(
            database = %cfg.database,
            warehouse = %cfg.warehouse,
            role = %cfg.role,
            user = %cfg.user,
            "Warehouse connected at {}",
            cfg.url
        );
        if !cfg.password.is_empty() {
            warn!(user = %cfg.user, "Warehouse password ignored: SQLite has no login");
        }
        Ok(Self {
            pool,
            database: cfg.database.clone(),
            attach_dir: attach_dir_for(&cfg.url),
            auto_create,
        })
    }

    async fn ensure_schema(&self, conn: &mut SqliteConnection, schema: &str) -> Result<()> {
        if schema.eq_ignore_ascii_case("main") || schema.eq_ignore_ascii_case("temp") {
            return Ok(());
        }
        let attached = sqlx::query("SELECT name FROM pragma_database_list")
            .fetch_all(&mut *conn)
            .await?;
        if attached
            .iter()
            .any(|r| r.get::<String, _>("name").eq_ignore_ascii_case(schema))
        {
            return Ok(());
        }

        let path = match &self.attach_dir {
            Some(dir) => dir
                .join(format!("{}.db", schema.to_lowercase()))
                .to_string_lossy()
                .into_owned(),
            None => ":memory:".to_string(),
        };
        sqlx::query(&format!("ATTACH DATABASE ? AS {}", quote_ident(schema)))
            .bind(path.as_str())
            .execute(&mut *conn)
            .await?;
        debug!(schema, path = %path, "attached schema");
        Ok(())
    }

    async fn ensure_table(
        &self,
        conn: &mut SqliteConnection,
        batch: &NormalizedBatch,
        dest: &Destination,
    ) -> Result<()> {
        let existing: Vec<String> = sqlx::query("SELECT name FROM pragma_table_info(?, ?)")
            .bind(dest.table.to_uppercase())
            .bind(dest.schema.as_str())
            .fetch_all(&mut *conn)
            .await?
            .iter()
            .map(|r| r.get::<String, _>("name"))
            .collect();

        if existing.is_empty() {
            if !self.auto_create {
                return Err(AppError::SchemaMismatch(format!("table {dest} does not exist")));
            }
            sqlx::query(&create_table_sql(batch, dest))
                .execute(&mut *conn)
                .await?;
            info!("Created table {dest}");
            return Ok(());
        }

        let missing: Vec<&str> = batch
            .columns()
            .iter()
            .filter(|c| !existing.iter().any(|e| e.eq_ignore_ascii_case(c)))
            .map(|c| c.as_str())
            .collect();
        if !missing.is_empty() {
            return Err(AppError::SchemaMismatch(format!(
                "table {dest} has no column(s) {}",
                missing.join(", ")
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Warehouse for SqliteWarehouse {
    async fn append(&self, batch: &NormalizedBatch, dest: &Destination) -> Result<u64> {
        if !dest.database.eq_ignore_ascii_case(&self.database) {
            return Err(AppError::SchemaMismatch(format!(
                "connected to database {}, cannot write to {dest}",
                self.database
            )));
        }
        if batch.is_empty() {
            return Ok(0);
        }

        let mut conn = self.pool.acquire().await?;
        self.ensure_schema(&mut conn, &dest.schema).await?;
        self.ensure_table(&mut conn, batch, dest).await?;

        let columns = batch
            .columns()
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        let insert = format!("INSERT INTO {} ({columns}) ", qualified_name(dest));
        let rows_per_statement = (MAX_BIND_PARAMS / batch.columns().len()).max(1);

        let mut written = 0u64;
        let mut tx = conn.begin().await?;
        for chunk in batch.rows().chunks(rows_per_statement) {
            let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(&insert);
            qb.push_values(chunk, |mut b, row| {
                for value in row {
                    match value {
                        Value::Text(s) => b.push_bind(s.clone()),
                        Value::Float(v) => b.push_bind(*v),
                        Value::Date(_) | Value::Timestamp(_) => b.push_bind(value.to_string()),
                    };
                }
            });
            written += qb.build().execute(&mut *tx).await?.rows_affected();
        }
        tx.commit().await?;

        debug!(rows = written, table = %dest, "batch appended");
        Ok(written)
    }
}

/// Upper-case and double-quote an identifier.
fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.to_uppercase().replace('"', "\"\""))
}

fn qualified_name(dest: &Destination) -> String {
    format!("{}.{}", quote_ident(&dest.schema), quote_ident(&dest.table))
}

fn column_type(value: &Value) -> &'static str {
    match value {
        Value::Text(_) => "TEXT",
        Value::Float(_) => "DOUBLE",
        Value::Date(_) => "DATE",
        Value::Timestamp(_) => "TIMESTAMP",
    }
}

fn create_table_sql(batch: &NormalizedBatch, dest: &Destination) -> String {
    let first = batch.rows().first();
    let defs = batch
        .columns()
        .iter()
        .enumerate()
        .map(|(i, c)| {
            let ty = first.and_then(|r| r.get(i)).map(column_type).unwrap_or("TEXT");
            format!("{} {ty}", quote_ident(c))
        })
        .collect::<Vec<_>>()
        .join(", ");
    format!("CREATE TABLE IF NOT EXISTS {} ({defs})", qualified_name(dest))
}

/// Directory holding the main database file, where attached schemas live.
fn attach_dir_for(url: &str) -> Option<PathBuf> {
    let path = url
        .strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))
        .unwrap_or(url);
    let path = path.split('?').next().unwrap_or("");
    if path.is_empty() || path == ":memory:" {
        return None;
    }
    Some(
        Path::new(path)
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default(),
    )
}
