// MySQL / MariaDB warehouse backend
use chrono::NaiveDate;
use mysql_async::prelude::*;
use mysql_async::{Conn, DriverError, Opts, Params, Row, TxOpts, Value as MySqlValue};
use url::Url;

use crate::error::EtlError;
use crate::models::{Value, DATE_FORMAT};

use super::adapter::{mask_credentials, Warehouse, WarehouseConnection};
use super::dialect::Dialect;
use super::statement::UpsertStatement;

pub struct MySqlWarehouse {
    opts: Opts,
    connection_url: String,
}

impl MySqlWarehouse {
    pub fn new(connection_url: &str) -> Result<Self, EtlError> {
        let mut url = Url::parse(connection_url)
            .map_err(|e| EtlError::InvalidConfiguration(format!("Invalid MySQL URL: {}", e)))?;

        match url.scheme() {
            "mysql" => {}
            // the driver only understands mysql://
            "mariadb" => {
                url.set_scheme("mysql").map_err(|_| {
                    EtlError::InvalidConfiguration("Cannot normalize mariadb:// URL".to_string())
                })?;
            }
            _ => {
                return Err(EtlError::InvalidConfiguration(
                    "URL must use mysql:// or mariadb:// scheme".to_string(),
                ))
            }
        }

        let opts = Opts::from_url(url.as_str())
            .map_err(|e| EtlError::InvalidConfiguration(format!("Invalid MySQL URL: {}", e)))?;

        Ok(Self {
            opts,
            connection_url: connection_url.to_string(),
        })
    }
}

#[async_trait::async_trait]
impl Warehouse for MySqlWarehouse {
    fn dialect(&self) -> Dialect {
        Dialect::MySql
    }

    async fn connect(&self) -> Result<Box<dyn WarehouseConnection>, EtlError> {
        let conn = Conn::new(self.opts.clone()).await.map_err(|e| {
            EtlError::ConnectionFailure(format!("Failed to connect to MySQL: {}", e))
        })?;
        Ok(Box::new(MySqlConnection { conn }))
    }

    fn describe(&self) -> String {
        mask_credentials(&self.connection_url)
    }
}

pub struct MySqlConnection {
    conn: Conn,
}

#[async_trait::async_trait]
impl WarehouseConnection for MySqlConnection {
    async fn upsert_batch(
        &mut self,
        statement: &UpsertStatement,
        rows: &[Vec<Value>],
    ) -> Result<u64, EtlError> {
        let mut tx = self
            .conn
            .start_transaction(TxOpts::default())
            .await
            .map_err(classify_error)?;

        let params = rows
            .iter()
            .map(|row| Params::Positional(row.iter().map(to_mysql_value).collect()));

        match tx.exec_batch(statement.sql(), params).await {
            Ok(()) => {
                tx.commit().await.map_err(classify_error)?;
                Ok(rows.len() as u64)
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    tracing::warn!("MySQL rollback failed: {}", rollback_err);
                }
                Err(classify_error(e))
            }
        }
    }

    async fn fetch_one(&mut self, sql: &str) -> Result<Option<Vec<Value>>, EtlError> {
        let row: Option<Row> = self.conn.query_first(sql).await.map_err(classify_error)?;

        Ok(row.map(|row| {
            (0..row.len())
                .map(|idx| row.as_ref(idx).map(from_mysql_value).unwrap_or(Value::Null))
                .collect()
        }))
    }

    async fn close(self: Box<Self>) -> Result<(), EtlError> {
        self.conn
            .disconnect()
            .await
            .map_err(|e| EtlError::ConnectionFailure(format!("Failed to close MySQL connection: {}", e)))
    }
}

/// Server-side errors reject the batch; transport errors are retryable
fn classify_error(err: mysql_async::Error) -> EtlError {
    match err {
        mysql_async::Error::Server(e) => EtlError::BatchLoadFailure(format!(
            "MySQL error {} ({}): {}",
            e.code, e.state, e.message
        )),
        mysql_async::Error::Driver(DriverError::ConnectionClosed) => {
            EtlError::ConnectionFailure("MySQL connection closed".to_string())
        }
        mysql_async::Error::Driver(e) => EtlError::BatchLoadFailure(format!("MySQL driver error: {}", e)),
        other => EtlError::ConnectionFailure(format!("MySQL connection error: {}", other)),
    }
}

fn to_mysql_value(value: &Value) -> MySqlValue {
    match value {
        Value::Null => MySqlValue::NULL,
        Value::Text(s) => MySqlValue::Bytes(s.as_bytes().to_vec()),
        Value::Integer(i) => MySqlValue::Int(*i),
        Value::Decimal(d) => MySqlValue::Double(*d),
        Value::Date(d) => {
            use chrono::Datelike;
            // Bound rows are already range-checked; anything else goes as
            // text and the server rejects it
            match u16::try_from(d.year()) {
                Ok(year) => MySqlValue::Date(year, d.month() as u8, d.day() as u8, 0, 0, 0, 0),
                Err(_) => MySqlValue::Bytes(d.format(DATE_FORMAT).to_string().into_bytes()),
            }
        }
    }
}

/// The text protocol returns most values as bytes; callers parse them
/// through the `Value` accessors.
fn from_mysql_value(value: &MySqlValue) -> Value {
    match value {
        MySqlValue::NULL => Value::Null,
        MySqlValue::Bytes(bytes) => Value::Text(String::from_utf8_lossy(bytes).into_owned()),
        MySqlValue::Int(i) => Value::Integer(*i),
        MySqlValue::UInt(u) => i64::try_from(*u)
            .map(Value::Integer)
            .unwrap_or(Value::Decimal(*u as f64)),
        MySqlValue::Float(f) => Value::Decimal(*f as f64),
        MySqlValue::Double(d) => Value::Decimal(*d),
        MySqlValue::Date(y, m, d, _, _, _, _) => {
            NaiveDate::from_ymd_opt(*y as i32, *m as u32, *d as u32)
                .map(Value::Date)
                .unwrap_or(Value::Null)
        }
        MySqlValue::Time(is_neg, d, h, m, s, _) => {
            let sign = if *is_neg { "-" } else { "" };
            let total_hours = d * 24 + *h as u32;
            Value::Text(format!("{}{}:{:02}:{:02}", sign, total_hours, m, s))
        }
    }
}
