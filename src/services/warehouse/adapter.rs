// Warehouse adapter traits for multi-backend support
use crate::error::EtlError;
use crate::models::Value;

use super::dialect::Dialect;
use super::statement::UpsertStatement;

/// A warehouse the loader can open connections to
#[async_trait::async_trait]
pub trait Warehouse: Send + Sync {
    fn dialect(&self) -> Dialect;

    /// Open a fresh, dedicated connection
    async fn connect(&self) -> Result<Box<dyn WarehouseConnection>, EtlError>;

    /// Human-readable target with credentials masked, for logging
    fn describe(&self) -> String;
}

/// One live connection, owned by exactly one worker at a time
#[async_trait::async_trait]
pub trait WarehouseConnection: Send {
    /// Execute the upsert for every row inside a single transaction.
    /// On error nothing from this call is committed.
    async fn upsert_batch(
        &mut self,
        statement: &UpsertStatement,
        rows: &[Vec<Value>],
    ) -> Result<u64, EtlError>;

    /// Run a read-only query and return its first row, if any
    async fn fetch_one(&mut self, sql: &str) -> Result<Option<Vec<Value>>, EtlError>;

    async fn close(self: Box<Self>) -> Result<(), EtlError>;
}

/// Mask credentials in connection URL for safe logging
pub fn mask_credentials(url: &str) -> String {
    if let Ok(parsed_url) = url::Url::parse(url) {
        let mut masked = parsed_url.clone();
        if parsed_url.password().is_some() {
            let _ = masked.set_password(Some("***"));
        }
        masked.to_string()
    } else {
        "[invalid-url]".to_string()
    }
}
