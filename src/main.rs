use anyhow::Context;
use std::sync::Arc;
use tracing::{info, warn};

use warehouse_etl::config::Config;
use warehouse_etl::models::StarSchema;
use warehouse_etl::services::extract::{read_csv, CsvOptions};
use warehouse_etl::services::pipeline::{EtlPipeline, PipelineSettings, SourceRelations};
use warehouse_etl::services::warehouse::{open_warehouse, Dialect, SqliteWarehouse, Warehouse};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = Config::from_env().context("Failed to load configuration")?;

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_new(&config.logging.level)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let url = &config.warehouse.url;
    let warehouse: Arc<dyn Warehouse> = match Dialect::from_url(url)? {
        // The embedded warehouse has no external owner for its DDL
        Dialect::Sqlite => {
            let sqlite = SqliteWarehouse::new(url);
            sqlite
                .initialize_schema(&StarSchema::retail())
                .await
                .context("Failed to initialize warehouse schema")?;
            Arc::new(sqlite)
        }
        _ => open_warehouse(url)?,
    };

    let options = CsvOptions::default();
    let sources = SourceRelations {
        customers: read_csv(&config.input.customers_path, options)?,
        products: read_csv(&config.input.products_path, options)?,
        transactions: read_csv(&config.input.transactions_path, options)?,
    };

    let pipeline = EtlPipeline::new(warehouse, PipelineSettings::from(&config))?;

    let cancel = pipeline.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, finishing in-flight batches");
            cancel.cancel();
        }
    });

    let report = pipeline.run(&sources).await.context("ETL run failed")?;

    for entity in &report.entities {
        info!(
            "{}: {}/{} rows committed, {} failed batches",
            entity.table,
            entity.rows_succeeded,
            entity.rows_attempted,
            entity.failed_batches.len()
        );
    }
    if let Err(e) = report.integrity.ensure_passed() {
        warn!("{}", e);
    }

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
