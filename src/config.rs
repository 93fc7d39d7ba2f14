use chrono::NaiveDate;
use serde::Deserialize;
use std::env;
use std::time::Duration;

use crate::error::EtlError;
use crate::services::join_engine::JoinConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub warehouse: WarehouseConfig,
    pub loader: LoaderConfig,
    pub join: JoinConfig,
    pub input: InputConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WarehouseConfig {
    pub url: String,
}

/// Loader tuning. Passed into the loader and planner constructors.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LoaderConfig {
    pub worker_count: usize,
    pub dimension_batch_size: usize,
    pub fact_batch_size: usize,
    /// Reconnect attempts per batch after a connection failure
    pub connect_retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            dimension_batch_size: 500,
            fact_batch_size: 1000,
            connect_retries: 3,
            retry_backoff_ms: 200,
        }
    }
}

impl LoaderConfig {
    pub fn validate(&self) -> Result<(), EtlError> {
        if self.worker_count == 0 {
            return Err(EtlError::InvalidConfiguration(
                "Worker count must be a positive integer".to_string(),
            ));
        }
        if self.dimension_batch_size == 0 || self.fact_batch_size == 0 {
            return Err(EtlError::InvalidConfiguration(
                "Batch sizes must be positive integers".to_string(),
            ));
        }
        Ok(())
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct InputConfig {
    pub customers_path: String,
    pub products_path: String,
    pub transactions_path: String,
    pub date_start: NaiveDate,
    pub date_end: NaiveDate,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Config {
    pub fn from_env() -> Result<Self, EtlError> {
        // Try to load from .env file
        let _ = dotenv::dotenv();

        let mut builder = config::Config::builder()
            .set_default("warehouse.url", "sqlite:./warehouse.db")?
            .set_default("loader.worker_count", 4)?
            .set_default("loader.dimension_batch_size", 500)?
            .set_default("loader.fact_batch_size", 1000)?
            .set_default("loader.connect_retries", 3)?
            .set_default("loader.retry_backoff_ms", 200)?
            .set_default("join.nested_loop_threshold", 0)?
            .set_default("join.fail_on_empty", false)?
            .set_default("input.customers_path", "customer_master_data.csv")?
            .set_default("input.products_path", "product_master_data.csv")?
            .set_default("input.transactions_path", "transactional_data.csv")?
            .set_default("input.date_start", "2015-01-01")?
            .set_default("input.date_end", "2025-12-31")?
            .set_default("logging.level", "info")?;

        // Load from environment variables; values are parsed on deserialize
        let overrides = [
            ("WAREHOUSE_URL", "warehouse.url"),
            ("ETL_WORKERS", "loader.worker_count"),
            ("ETL_DIMENSION_BATCH_SIZE", "loader.dimension_batch_size"),
            ("ETL_FACT_BATCH_SIZE", "loader.fact_batch_size"),
            ("ETL_CONNECT_RETRIES", "loader.connect_retries"),
            ("ETL_RETRY_BACKOFF_MS", "loader.retry_backoff_ms"),
            ("ETL_NESTED_LOOP_THRESHOLD", "join.nested_loop_threshold"),
            ("ETL_FAIL_ON_EMPTY_JOIN", "join.fail_on_empty"),
            ("ETL_CUSTOMERS_CSV", "input.customers_path"),
            ("ETL_PRODUCTS_CSV", "input.products_path"),
            ("ETL_TRANSACTIONS_CSV", "input.transactions_path"),
            ("ETL_DATE_START", "input.date_start"),
            ("ETL_DATE_END", "input.date_end"),
            ("RUST_LOG", "logging.level"),
        ];
        for (var, key) in overrides {
            if let Ok(value) = env::var(var) {
                builder = builder.set_override(key, value)?;
            }
        }

        let config: Config = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), EtlError> {
        self.loader.validate()?;
        if self.input.date_start > self.input.date_end {
            return Err(EtlError::InvalidConfiguration(format!(
                "Date range start {} is after end {}",
                self.input.date_start, self.input.date_end
            )));
        }
        Ok(())
    }
}
