// Embedded SQLite warehouse, used for local runs and tests
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection, ErrorCode, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::EtlError;
use crate::models::{StarSchema, Value, DATE_FORMAT};

use super::adapter::{Warehouse, WarehouseConnection};
use super::dialect::Dialect;
use super::statement::UpsertStatement;

const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(30);

pub struct SqliteWarehouse {
    path: PathBuf,
    enforce_foreign_keys: bool,
    busy_timeout: Duration,
}

impl SqliteWarehouse {
    /// Accepts a bare path or a `sqlite:` / `sqlite://` URL
    pub fn new(location: &str) -> Self {
        // Handle SQLite URL format (sqlite:./path or sqlite://path)
        let clean_path = if location.starts_with("sqlite:") {
            location.trim_start_matches("sqlite:").trim_start_matches("//")
        } else {
            location
        };

        Self::from_path(clean_path)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            enforce_foreign_keys: true,
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        }
    }

    /// Turn off `PRAGMA foreign_keys`, so orphan rows can be committed
    pub fn with_foreign_keys(mut self, enforce: bool) -> Self {
        self.enforce_foreign_keys = enforce;
        self
    }

    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> Result<Connection, EtlError> {
        let conn = Connection::open(&self.path).map_err(|e| {
            EtlError::ConnectionFailure(format!(
                "Failed to open SQLite warehouse {}: {}",
                self.path.display(),
                e
            ))
        })?;

        conn.busy_timeout(self.busy_timeout).map_err(classify_error)?;
        conn.pragma_update(None, "foreign_keys", self.enforce_foreign_keys)
            .map_err(classify_error)?;
        Ok(conn)
    }

    /// Create every table of the schema that does not exist yet
    pub async fn initialize_schema(&self, schema: &StarSchema) -> Result<(), EtlError> {
        let conn = self.open()?;
        for stage in schema.load_stages()? {
            for table in stage {
                conn.execute_batch(&table.create_table_sql(Dialect::Sqlite))
                    .map_err(|e| {
                        EtlError::Internal(format!("Failed to create table {}: {}", table.name, e))
                    })?;
            }
        }

        tracing::info!("Initialized SQLite warehouse schema at {}", self.path.display());
        Ok(())
    }
}

#[async_trait::async_trait]
impl Warehouse for SqliteWarehouse {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    async fn connect(&self) -> Result<Box<dyn WarehouseConnection>, EtlError> {
        let conn = self.open()?;
        Ok(Box::new(SqliteConnection { conn }))
    }

    fn describe(&self) -> String {
        format!("sqlite:{}", self.path.display())
    }
}

pub struct SqliteConnection {
    conn: Connection,
}

#[async_trait::async_trait]
impl WarehouseConnection for SqliteConnection {
    async fn upsert_batch(
        &mut self,
        statement: &UpsertStatement,
        rows: &[Vec<Value>],
    ) -> Result<u64, EtlError> {
        // IMMEDIATE takes the write lock up front, so concurrent writers wait
        // on the busy timeout instead of failing mid-transaction
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(classify_error)?;

        let mut affected = 0u64;
        {
            let mut stmt = tx.prepare_cached(statement.sql()).map_err(classify_error)?;
            for row in rows {
                affected += stmt
                    .execute(params_from_iter(row.iter().map(to_sql_value)))
                    .map_err(classify_error)? as u64;
            }
        }

        tx.commit().map_err(classify_error)?;
        Ok(affected)
    }

    async fn fetch_one(&mut self, sql: &str) -> Result<Option<Vec<Value>>, EtlError> {
        let mut stmt = self.conn.prepare(sql).map_err(classify_error)?;
        let column_count = stmt.column_count();
        let mut rows = stmt.query([]).map_err(classify_error)?;

        match rows.next().map_err(classify_error)? {
            Some(row) => {
                let values = (0..column_count)
                    .map(|idx| row.get_ref(idx).map(from_sql_value))
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(classify_error)?;
                Ok(Some(values))
            }
            None => Ok(None),
        }
    }

    async fn close(self: Box<Self>) -> Result<(), EtlError> {
        self.conn.close().map_err(|(_, e)| {
            EtlError::ConnectionFailure(format!("Failed to close SQLite connection: {}", e))
        })
    }
}

fn classify_error(err: rusqlite::Error) -> EtlError {
    match err.sqlite_error_code() {
        Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) | Some(ErrorCode::CannotOpen) => {
            EtlError::ConnectionFailure(format!("SQLite unavailable: {}", err))
        }
        _ => EtlError::BatchLoadFailure(format!("SQLite error: {}", err)),
    }
}

fn to_sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Text(s) => SqlValue::Text(s.clone()),
        Value::Integer(i) => SqlValue::Integer(*i),
        Value::Decimal(d) => SqlValue::Real(*d),
        Value::Date(d) => SqlValue::Text(d.format(DATE_FORMAT).to_string()),
    }
}

fn from_sql_value(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null | ValueRef::Blob(_) => Value::Null,
        ValueRef::Integer(i) => Value::Integer(i),
        ValueRef::Real(d) => Value::Decimal(d),
        ValueRef::Text(bytes) => Value::Text(String::from_utf8_lossy(bytes).into_owned()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CUSTOMER_DIM, SALES_FACT};
    use tempfile::tempdir;

    #[test]
    fn test_url_forms() {
        assert_eq!(SqliteWarehouse::new("sqlite:./dw.db").path(), Path::new("./dw.db"));
        assert_eq!(SqliteWarehouse::new("sqlite:///tmp/dw.db").path(), Path::new("/tmp/dw.db"));
        assert_eq!(SqliteWarehouse::new("dw.db").path(), Path::new("dw.db"));
    }

    #[tokio::test]
    async fn test_initialize_schema_and_upsert() {
        let dir = tempdir().unwrap();
        let warehouse = SqliteWarehouse::from_path(dir.path().join("dw.db"));
        let schema = StarSchema::retail();
        warehouse.initialize_schema(&schema).await.unwrap();
        // idempotent
        warehouse.initialize_schema(&schema).await.unwrap();

        let table = schema.table(CUSTOMER_DIM).unwrap();
        let columns = vec!["Customer_ID".to_string(), "Gender".to_string()];
        let stmt =
            UpsertStatement::prepare(Dialect::Sqlite, table, &columns, &table.primary_key).unwrap();

        let mut conn = warehouse.connect().await.unwrap();
        conn.upsert_batch(&stmt, &[vec!["C1".into(), "M".into()]]).await.unwrap();
        conn.upsert_batch(&stmt, &[vec!["C1".into(), "F".into()]]).await.unwrap();

        let row = conn
            .fetch_one("SELECT COUNT(*), MAX(\"Gender\") FROM \"Customer_Dim\"")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row, vec![Value::Integer(1), Value::text("F")]);
        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_foreign_key_violation_rolls_back_batch() {
        let dir = tempdir().unwrap();
        let warehouse = SqliteWarehouse::from_path(dir.path().join("dw.db"));
        let schema = StarSchema::retail();
        warehouse.initialize_schema(&schema).await.unwrap();

        let table = schema.table(SALES_FACT).unwrap();
        let columns: Vec<String> = table.columns.iter().map(|c| c.name.clone()).collect();
        let stmt =
            UpsertStatement::prepare(Dialect::Sqlite, table, &columns, &table.primary_key).unwrap();
        let rows = stmt
            .bind(&[vec![
                1i64.into(),
                "C404".into(),
                "P404".into(),
                1i64.into(),
                1i64.into(),
                20170101i64.into(),
                1i64.into(),
                10.0.into(),
                10.0.into(),
            ]])
            .unwrap();

        let mut conn = warehouse.connect().await.unwrap();
        let err = conn.upsert_batch(&stmt, &rows).await.unwrap_err();
        assert!(matches!(err, EtlError::BatchLoadFailure(_)));

        let count = conn
            .fetch_one("SELECT COUNT(*) FROM \"Sales_Fact\"")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(count[0], Value::Integer(0));
    }

    #[tokio::test]
    async fn test_unopenable_path_is_connection_failure() {
        let dir = tempdir().unwrap();
        let warehouse = SqliteWarehouse::from_path(dir.path().join("missing").join("dw.db"));
        let err = warehouse.connect().await.err().unwrap();
        assert!(err.is_retryable());
    }
}
