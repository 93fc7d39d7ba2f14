// PostgreSQL warehouse backend
use chrono::NaiveDate;
use tokio::task::JoinHandle;
use tokio_postgres::types::{ToSql, Type};
use tokio_postgres::{Client, NoTls, Row};
use url::Url;

use crate::error::EtlError;
use crate::models::{ColumnType, Value};

use super::adapter::{mask_credentials, Warehouse, WarehouseConnection};
use super::dialect::Dialect;
use super::statement::UpsertStatement;

type BoxedParam = Box<dyn ToSql + Sync + Send>;

pub struct PostgresWarehouse {
    connection_url: String,
}

impl PostgresWarehouse {
    pub fn new(connection_url: &str) -> Result<Self, EtlError> {
        // Validate PostgreSQL URL format
        let url = Url::parse(connection_url)
            .map_err(|e| EtlError::InvalidConfiguration(format!("Invalid PostgreSQL URL: {}", e)))?;

        if url.scheme() != "postgresql" && url.scheme() != "postgres" {
            return Err(EtlError::InvalidConfiguration(
                "URL must use postgresql:// or postgres:// scheme".to_string(),
            ));
        }

        Ok(Self {
            connection_url: connection_url.to_string(),
        })
    }
}

#[async_trait::async_trait]
impl Warehouse for PostgresWarehouse {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    async fn connect(&self) -> Result<Box<dyn WarehouseConnection>, EtlError> {
        let (client, connection) = tokio_postgres::connect(&self.connection_url, NoTls)
            .await
            .map_err(|e| EtlError::ConnectionFailure(format!("Failed to connect to PostgreSQL: {}", e)))?;

        // The connection object drives the socket; it ends when the client is dropped
        let driver = tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::warn!("PostgreSQL connection error: {}", e);
            }
        });

        Ok(Box::new(PostgresConnection { client, driver }))
    }

    fn describe(&self) -> String {
        mask_credentials(&self.connection_url)
    }
}

pub struct PostgresConnection {
    client: Client,
    driver: JoinHandle<()>,
}

#[async_trait::async_trait]
impl WarehouseConnection for PostgresConnection {
    async fn upsert_batch(
        &mut self,
        statement: &UpsertStatement,
        rows: &[Vec<Value>],
    ) -> Result<u64, EtlError> {
        let tx = self.client.transaction().await.map_err(classify_error)?;
        let prepared = tx.prepare(statement.sql()).await.map_err(classify_error)?;

        // Dropping the transaction without commit rolls it back
        let mut affected = 0u64;
        for row in rows {
            let params: Vec<BoxedParam> = row
                .iter()
                .zip(statement.column_types())
                .map(|(value, column_type)| to_sql_param(value, *column_type))
                .collect();
            let refs: Vec<&(dyn ToSql + Sync)> = params
                .iter()
                .map(|p| p.as_ref() as &(dyn ToSql + Sync))
                .collect();

            affected += tx.execute(&prepared, &refs).await.map_err(classify_error)?;
        }

        tx.commit().await.map_err(classify_error)?;
        Ok(affected)
    }

    async fn fetch_one(&mut self, sql: &str) -> Result<Option<Vec<Value>>, EtlError> {
        let row = self.client.query_opt(sql, &[]).await.map_err(classify_error)?;
        Ok(row.map(|row| (0..row.len()).map(|idx| from_sql_value(&row, idx)).collect()))
    }

    async fn close(self: Box<Self>) -> Result<(), EtlError> {
        let PostgresConnection { client, driver } = *self;
        drop(client);
        driver
            .await
            .map_err(|e| EtlError::ConnectionFailure(format!("PostgreSQL connection task failed: {}", e)))
    }
}

fn classify_error(err: tokio_postgres::Error) -> EtlError {
    if let Some(db_error) = err.as_db_error() {
        return EtlError::BatchLoadFailure(format!(
            "Code: {}, Message: {}",
            db_error.code().code(),
            db_error.message()
        ));
    }

    let is_io = std::error::Error::source(&err)
        .map(|source| source.is::<std::io::Error>())
        .unwrap_or(false);

    if err.is_closed() || is_io {
        EtlError::ConnectionFailure(format!("PostgreSQL connection error: {}", err))
    } else {
        EtlError::BatchLoadFailure(format!("PostgreSQL error: {}", err))
    }
}

/// Values are already coerced to the column type; nulls still need a
/// concrete Rust type for the wire encoding.
fn to_sql_param(value: &Value, column_type: ColumnType) -> BoxedParam {
    match (value, column_type) {
        (Value::Text(s), _) => Box::new(s.clone()),
        (Value::Integer(i), _) => Box::new(*i),
        (Value::Decimal(d), _) => Box::new(*d),
        (Value::Date(d), _) => Box::new(*d),
        (Value::Null, ColumnType::Text) => Box::new(None::<String>),
        (Value::Null, ColumnType::Integer) => Box::new(None::<i64>),
        (Value::Null, ColumnType::Decimal) => Box::new(None::<f64>),
        (Value::Null, ColumnType::Date) => Box::new(None::<NaiveDate>),
    }
}

fn from_sql_value(row: &Row, idx: usize) -> Value {
    let column_type = row.columns()[idx].type_().clone();
    let value = match column_type {
        Type::INT2 => row.try_get::<_, Option<i16>>(idx).map(|v| v.map(|i| Value::Integer(i as i64))),
        Type::INT4 => row.try_get::<_, Option<i32>>(idx).map(|v| v.map(|i| Value::Integer(i as i64))),
        Type::INT8 => row.try_get::<_, Option<i64>>(idx).map(|v| v.map(Value::Integer)),
        Type::FLOAT4 => row.try_get::<_, Option<f32>>(idx).map(|v| v.map(|f| Value::Decimal(f as f64))),
        Type::FLOAT8 => row.try_get::<_, Option<f64>>(idx).map(|v| v.map(Value::Decimal)),
        Type::DATE => row.try_get::<_, Option<NaiveDate>>(idx).map(|v| v.map(Value::Date)),
        _ => row.try_get::<_, Option<String>>(idx).map(|v| v.map(Value::Text)),
    };

    match value {
        Ok(v) => v.unwrap_or(Value::Null),
        Err(e) => {
            tracing::debug!("Unreadable {} column at {}: {}", column_type.name(), idx, e);
            Value::Null
        }
    }
}
