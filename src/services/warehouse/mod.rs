// Warehouse abstraction layer for multi-backend loads
pub mod adapter;
pub mod dialect;
pub mod mysql;
pub mod postgresql;
pub mod sqlite;
pub mod statement;

pub use adapter::{mask_credentials, Warehouse, WarehouseConnection};
pub use dialect::Dialect;
pub use mysql::MySqlWarehouse;
pub use postgresql::PostgresWarehouse;
pub use sqlite::SqliteWarehouse;
pub use statement::UpsertStatement;

use std::sync::Arc;

use crate::error::EtlError;

/// Factory function to create the warehouse backend matching the URL scheme
pub fn open_warehouse(url: &str) -> Result<Arc<dyn Warehouse>, EtlError> {
    let warehouse: Arc<dyn Warehouse> = match Dialect::from_url(url)? {
        Dialect::MySql => Arc::new(MySqlWarehouse::new(url)?),
        Dialect::Postgres => Arc::new(PostgresWarehouse::new(url)?),
        Dialect::Sqlite => Arc::new(SqliteWarehouse::new(url)),
    };

    tracing::info!(
        "Using {} warehouse at {}",
        warehouse.dialect().as_str(),
        warehouse.describe()
    );
    Ok(warehouse)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_warehouse_by_scheme() {
        assert_eq!(open_warehouse("sqlite:./dw.db").unwrap().dialect(), Dialect::Sqlite);
        assert_eq!(
            open_warehouse("postgres://etl@localhost/dw").unwrap().dialect(),
            Dialect::Postgres
        );
        assert_eq!(
            open_warehouse("mysql://etl@localhost/dw").unwrap().dialect(),
            Dialect::MySql
        );
        assert!(matches!(
            open_warehouse("redis://localhost"),
            Err(EtlError::InvalidConfiguration(_))
        ));
    }
}
