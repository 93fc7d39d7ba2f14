use chrono::{NaiveDate, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{Config, LoaderConfig};
use crate::error::EtlError;
use crate::models::{
    LoadSummary, PipelineReport, Relation, StarSchema, TableKind, CUSTOMER_DIM, DATE_DIM,
    PRODUCT_DIM, SALES_FACT, STORE_DIM, SUPPLIER_DIM,
};
use crate::services::connection_pool::ConnectionPool;
use crate::services::join_engine::{HybridJoinEngine, JoinConfig};
use crate::services::loader::ParallelUpsertLoader;
use crate::services::transform::{
    build_sales_fact, generate_date_dimension, prepare_transactions, transform_customers,
    transform_products, ProductDimensions,
};
use crate::services::warehouse::Warehouse;
use crate::validation::{BusinessRule, IntegrityValidator};

/// Raw extracted inputs, as read from the source files
#[derive(Debug, Clone)]
pub struct SourceRelations {
    pub customers: Relation,
    pub products: Relation,
    pub transactions: Relation,
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub loader: LoaderConfig,
    pub join: JoinConfig,
    pub date_start: NaiveDate,
    pub date_end: NaiveDate,
    pub business_rules: Vec<BusinessRule>,
}

impl From<&Config> for PipelineSettings {
    fn from(config: &Config) -> Self {
        Self {
            loader: config.loader.clone(),
            join: config.join.clone(),
            date_start: config.input.date_start,
            date_end: config.input.date_end,
            business_rules: Vec::new(),
        }
    }
}

/// Transform, load in dependency stages, then validate
pub struct EtlPipeline {
    warehouse: Arc<dyn Warehouse>,
    schema: StarSchema,
    settings: PipelineSettings,
    cancel: CancellationToken,
}

impl EtlPipeline {
    pub fn new(warehouse: Arc<dyn Warehouse>, settings: PipelineSettings) -> Result<Self, EtlError> {
        settings.loader.validate()?;
        Ok(Self {
            warehouse,
            schema: StarSchema::retail(),
            settings,
            cancel: CancellationToken::new(),
        })
    }

    /// Cancelling stops batch dispatch; in-flight batches still commit
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn schema(&self) -> &StarSchema {
        &self.schema
    }

    /// Build every warehouse relation from the raw inputs. Any error here
    /// aborts the run before the warehouse is touched.
    pub fn transform(&self, sources: &SourceRelations) -> Result<HashMap<String, Arc<Relation>>, EtlError> {
        let customers = transform_customers(&sources.customers)?;
        let ProductDimensions {
            products,
            stores,
            suppliers,
        } = transform_products(&sources.products)?;
        let dates = generate_date_dimension(self.settings.date_start, self.settings.date_end)?;
        let transactions = prepare_transactions(&sources.transactions)?;

        let engine = HybridJoinEngine::new(self.settings.join.clone());
        let fact = build_sales_fact(&engine, &transactions, &products, &dates)?;

        Ok(HashMap::from([
            (STORE_DIM.to_string(), Arc::new(stores)),
            (SUPPLIER_DIM.to_string(), Arc::new(suppliers)),
            (CUSTOMER_DIM.to_string(), Arc::new(customers)),
            (DATE_DIM.to_string(), Arc::new(dates)),
            (PRODUCT_DIM.to_string(), Arc::new(products)),
            (SALES_FACT.to_string(), Arc::new(fact)),
        ]))
    }

    pub async fn run(&self, sources: &SourceRelations) -> Result<PipelineReport, EtlError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let started = Instant::now();
        tracing::info!("Starting ETL run {}", run_id);

        let relations = self.transform(sources)?;

        let pool = Arc::new(ConnectionPool::new(Arc::clone(&self.warehouse)));
        let loader = ParallelUpsertLoader::new(Arc::clone(&pool), self.settings.loader.clone())?
            .with_cancellation(self.cancel.clone());

        let entities = self.load_entities(&loader, &relations).await;
        let closed = pool.shutdown().await;
        tracing::debug!("Closed {} worker connections", closed);
        let entities = entities?;

        let integrity = IntegrityValidator::new(self.schema.clone())
            .with_rules(self.settings.business_rules.clone())
            .validate(self.warehouse.as_ref())
            .await?;

        let report = PipelineReport {
            run_id,
            started_at,
            entities,
            integrity,
            elapsed_ms: started.elapsed().as_millis() as u64,
        };

        tracing::info!(
            "ETL run {} completed with {} failed batches in {}ms",
            run_id,
            report.failed_batch_count(),
            report.elapsed_ms
        );
        Ok(report)
    }

    /// Load each stage to completion before the next one starts. A table
    /// whose prerequisite committed nothing is reported as blocked; a table
    /// with no relation is reported as skipped.
    pub async fn load_entities(
        &self,
        loader: &ParallelUpsertLoader,
        relations: &HashMap<String, Arc<Relation>>,
    ) -> Result<Vec<LoadSummary>, EtlError> {
        let stages = self.schema.load_stages()?;
        let mut summaries: Vec<LoadSummary> = Vec::with_capacity(self.schema.tables().len());

        for (level, stage) in stages.iter().enumerate() {
            let names: Vec<&str> = stage.iter().map(|t| t.name.as_str()).collect();
            tracing::info!("Load stage {}: {}", level, names.join(", "));

            for table in stage {
                let blocking: Vec<String> = table
                    .dependencies()
                    .into_iter()
                    .filter(|dep| {
                        !summaries
                            .iter()
                            .any(|s| s.table == *dep && s.unblocks_dependents())
                    })
                    .map(String::from)
                    .collect();

                let summary = if !blocking.is_empty() {
                    tracing::warn!("{} blocked by {}", table.name, blocking.join(", "));
                    LoadSummary::blocked(&table.name, blocking)
                } else if let Some(relation) = relations.get(&table.name) {
                    let batch_size = match table.kind {
                        TableKind::Fact => self.settings.loader.fact_batch_size,
                        TableKind::Dimension => self.settings.loader.dimension_batch_size,
                    };
                    let results = loader
                        .load(Arc::clone(relation), table, &table.primary_key, batch_size)
                        .await?;
                    LoadSummary::from_results(&table.name, &results)
                } else {
                    tracing::warn!("No relation supplied for {}, skipping", table.name);
                    LoadSummary::skipped(&table.name)
                };

                summaries.push(summary);
            }
        }

        Ok(summaries)
    }
}
