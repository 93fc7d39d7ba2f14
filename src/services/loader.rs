use futures::future::join_all;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::LoaderConfig;
use crate::error::EtlError;
use crate::models::{Batch, FailureCause, LoadResult, Relation, TableSchema, Value};
use crate::services::batch_planner::BatchPlanner;
use crate::services::connection_pool::{ConnectionPool, WorkerId};
use crate::services::warehouse::UpsertStatement;

/// Fully materialized batch queue shared by the workers
struct BatchQueue {
    batches: Mutex<VecDeque<Batch>>,
}

impl BatchQueue {
    fn new(batches: impl Iterator<Item = Batch>) -> Self {
        Self {
            batches: Mutex::new(batches.collect()),
        }
    }

    fn pop(&self) -> Option<Batch> {
        // a panicking worker cannot leave the deque half-updated
        let mut batches = self.batches.lock().unwrap_or_else(|p| p.into_inner());
        batches.pop_front()
    }

    fn drain(&self) -> Vec<Batch> {
        let mut batches = self.batches.lock().unwrap_or_else(|p| p.into_inner());
        batches.drain(..).collect()
    }
}

#[derive(Debug, Clone, Copy)]
struct RetryPolicy {
    retries: u32,
    backoff: Duration,
}

impl RetryPolicy {
    fn delay(&self, attempt: u32) -> Duration {
        self.backoff.saturating_mul(2u32.saturating_pow(attempt))
    }
}

/// Everything a worker task needs, cloned per worker
#[derive(Clone)]
struct WorkerContext {
    pool: Arc<ConnectionPool>,
    queue: Arc<BatchQueue>,
    statement: Arc<UpsertStatement>,
    results: mpsc::Sender<LoadResult>,
    cancel: CancellationToken,
    retry: RetryPolicy,
}

/// Loads relations through a fixed set of workers, each holding its own
/// warehouse connection. Each batch is one transaction; a failed batch is
/// rolled back and recorded without affecting any other batch.
pub struct ParallelUpsertLoader {
    pool: Arc<ConnectionPool>,
    config: LoaderConfig,
    cancel: CancellationToken,
}

impl ParallelUpsertLoader {
    pub fn new(pool: Arc<ConnectionPool>, config: LoaderConfig) -> Result<Self, EtlError> {
        config.validate()?;
        Ok(Self {
            pool,
            config,
            cancel: CancellationToken::new(),
        })
    }

    /// Share an external cancellation signal
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Upsert `relation` into `target`, keyed by `key_columns`.
    ///
    /// Returns exactly one `LoadResult` per batch, ordered by batch index.
    /// Schema and configuration problems fail before any batch runs;
    /// everything after that is reported per batch.
    pub async fn load(
        &self,
        relation: Arc<Relation>,
        target: &TableSchema,
        key_columns: &[String],
        batch_size: usize,
    ) -> Result<Vec<LoadResult>, EtlError> {
        let planner = BatchPlanner::new(batch_size)?;
        let statement = Arc::new(UpsertStatement::prepare(
            self.pool.dialect(),
            target,
            relation.columns(),
            key_columns,
        )?);

        let plan = planner.plan(&relation);
        let total = plan.len();
        if total == 0 {
            tracing::info!("Nothing to load into {}", target.name);
            return Ok(Vec::new());
        }

        let started = Instant::now();
        let worker_count = self.config.worker_count.min(total);
        tracing::info!(
            "Loading {} rows into {} as {} batches of up to {} rows with {} workers",
            relation.len(),
            target.name,
            total,
            batch_size,
            worker_count
        );

        let queue = Arc::new(BatchQueue::new(plan));
        // Every batch yields at most one result, so senders never wait
        let (tx, mut rx) = mpsc::channel(total);

        let context = WorkerContext {
            pool: Arc::clone(&self.pool),
            queue: Arc::clone(&queue),
            statement,
            results: tx,
            cancel: self.cancel.clone(),
            retry: RetryPolicy {
                retries: self.config.connect_retries,
                backoff: self.config.retry_backoff(),
            },
        };

        let handles: Vec<_> = (0..worker_count)
            .map(|worker_id| tokio::spawn(Self::run_worker(worker_id, context.clone())))
            .collect();
        drop(context);

        for (worker_id, joined) in join_all(handles).await.into_iter().enumerate() {
            if let Err(e) = joined {
                tracing::error!("Loader worker {} for {} aborted: {}", worker_id, target.name, e);
            }
        }

        let mut results = Vec::with_capacity(total);
        while let Some(result) = rx.recv().await {
            results.push(result);
        }

        // Batches nobody picked up: dispatch stopped, or every worker lost
        // its connection
        let cancelled = self.cancel.is_cancelled();
        for batch in queue.drain() {
            results.push(if cancelled {
                LoadResult::cancelled(batch.index())
            } else {
                LoadResult::failed(
                    batch.index(),
                    batch.len(),
                    FailureCause::Connection("no worker with a live connection remained".to_string()),
                )
            });
        }

        results.sort_by_key(|r| r.batch_index);

        let failed = results.iter().filter(|r| !r.is_success()).count();
        let succeeded: usize = results.iter().map(|r| r.rows_succeeded).sum();
        tracing::info!(
            "Loaded {}: {}/{} rows committed, {} of {} batches failed ({}ms)",
            target.name,
            succeeded,
            relation.len(),
            failed,
            total,
            started.elapsed().as_millis()
        );

        Ok(results)
    }

    async fn run_worker(worker_id: WorkerId, ctx: WorkerContext) {
        loop {
            // Cancellation is checked between batches only; a batch that
            // started always commits or rolls back
            if ctx.cancel.is_cancelled() {
                tracing::debug!("Worker {} stopping: cancelled", worker_id);
                break;
            }
            let Some(batch) = ctx.queue.pop() else {
                break;
            };

            let (result, connection_lost) = Self::process_batch(worker_id, &batch, &ctx).await;
            if ctx.results.send(result).await.is_err() {
                tracing::error!("Worker {} could not report batch {}", worker_id, batch.index());
                break;
            }
            if connection_lost {
                tracing::error!(
                    "Worker {} exiting after repeated connection failures",
                    worker_id
                );
                break;
            }
        }
    }

    /// Returns the batch outcome and whether the worker lost its connection
    /// for good
    async fn process_batch(worker_id: WorkerId, batch: &Batch, ctx: &WorkerContext) -> (LoadResult, bool) {
        let index = batch.index();
        let rows = match ctx.statement.bind(batch.rows()) {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!("Batch {} for {} rejected before execution: {}", index, ctx.statement.table(), e);
                return (
                    LoadResult::failed(index, batch.len(), FailureCause::Rejected(e.to_string())),
                    false,
                );
            }
        };

        let mut attempt = 0;
        loop {
            match Self::execute(worker_id, &rows, ctx).await {
                Ok(_) => {
                    tracing::debug!(
                        "Worker {} committed batch {} ({} rows) into {}",
                        worker_id,
                        index,
                        rows.len(),
                        ctx.statement.table()
                    );
                    return (LoadResult::succeeded(index, batch.len()), false);
                }
                Err(e) if e.is_retryable() => {
                    ctx.pool.invalidate(worker_id).await;
                    if attempt >= ctx.retry.retries {
                        return (
                            LoadResult::failed(index, batch.len(), FailureCause::Connection(e.to_string())),
                            true,
                        );
                    }

                    let delay = ctx.retry.delay(attempt);
                    attempt += 1;
                    tracing::warn!(
                        "Worker {} batch {}: {} (retry {}/{} in {:?})",
                        worker_id,
                        index,
                        e,
                        attempt,
                        ctx.retry.retries,
                        delay
                    );

                    tokio::select! {
                        _ = ctx.cancel.cancelled() => {
                            return (
                                LoadResult::failed(index, batch.len(), FailureCause::Cancelled),
                                false,
                            );
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => {
                    tracing::warn!("Batch {} for {} rolled back: {}", index, ctx.statement.table(), e);
                    return (
                        LoadResult::failed(index, batch.len(), FailureCause::Rejected(e.to_string())),
                        false,
                    );
                }
            }
        }
    }

    async fn execute(worker_id: WorkerId, rows: &[Vec<Value>], ctx: &WorkerContext) -> Result<u64, EtlError> {
        let handle = ctx.pool.acquire(worker_id).await?;
        let mut conn = handle.lock().await;
        conn.upsert_batch(&ctx.statement, rows).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{StarSchema, CUSTOMER_DIM, SALES_FACT};
    use crate::services::warehouse::{Dialect, SqliteWarehouse, Warehouse, WarehouseConnection};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::{tempdir, TempDir};

    /// Refuses the first `failures` connection attempts
    struct FlakyWarehouse {
        inner: Arc<SqliteWarehouse>,
        failures: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Warehouse for FlakyWarehouse {
        fn dialect(&self) -> Dialect {
            Dialect::Sqlite
        }

        async fn connect(&self) -> Result<Box<dyn WarehouseConnection>, EtlError> {
            let refused = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if refused {
                return Err(EtlError::ConnectionFailure("connection refused".to_string()));
            }
            self.inner.connect().await
        }

        fn describe(&self) -> String {
            "flaky".to_string()
        }
    }

    /// Raises cancellation while its first batch is in flight
    struct CancellingWarehouse {
        inner: Arc<SqliteWarehouse>,
        cancel: CancellationToken,
    }

    struct CancellingConnection {
        inner: Box<dyn WarehouseConnection>,
        cancel: CancellationToken,
    }

    #[async_trait::async_trait]
    impl Warehouse for CancellingWarehouse {
        fn dialect(&self) -> Dialect {
            Dialect::Sqlite
        }

        async fn connect(&self) -> Result<Box<dyn WarehouseConnection>, EtlError> {
            Ok(Box::new(CancellingConnection {
                inner: self.inner.connect().await?,
                cancel: self.cancel.clone(),
            }))
        }

        fn describe(&self) -> String {
            "cancelling".to_string()
        }
    }

    #[async_trait::async_trait]
    impl WarehouseConnection for CancellingConnection {
        async fn upsert_batch(
            &mut self,
            statement: &UpsertStatement,
            rows: &[Vec<Value>],
        ) -> Result<u64, EtlError> {
            self.cancel.cancel();
            self.inner.upsert_batch(statement, rows).await
        }

        async fn fetch_one(&mut self, sql: &str) -> Result<Option<Vec<Value>>, EtlError> {
            self.inner.fetch_one(sql).await
        }

        async fn close(self: Box<Self>) -> Result<(), EtlError> {
            self.inner.close().await
        }
    }

    async fn setup(enforce_fk: bool) -> (TempDir, Arc<SqliteWarehouse>, StarSchema) {
        let dir = tempdir().unwrap();
        let warehouse = SqliteWarehouse::from_path(dir.path().join("dw.db")).with_foreign_keys(enforce_fk);
        let schema = StarSchema::retail();
        warehouse.initialize_schema(&schema).await.unwrap();
        (dir, Arc::new(warehouse), schema)
    }

    fn loader<W: Warehouse + 'static>(warehouse: Arc<W>, workers: usize) -> ParallelUpsertLoader {
        let config = LoaderConfig {
            worker_count: workers,
            retry_backoff_ms: 1,
            ..LoaderConfig::default()
        };
        ParallelUpsertLoader::new(Arc::new(ConnectionPool::new(warehouse)), config).unwrap()
    }

    fn customers(rows: Vec<(&str, &str)>) -> Arc<Relation> {
        Arc::new(
            Relation::from_rows(
                &["Customer_ID", "Gender"],
                rows.into_iter().map(|(id, g)| vec![id.into(), g.into()]).collect(),
            )
            .unwrap(),
        )
    }

    async fn scalar(warehouse: &SqliteWarehouse, sql: &str) -> Value {
        let mut conn = warehouse.connect().await.unwrap();
        let row = conn.fetch_one(sql).await.unwrap().unwrap();
        row.into_iter().next().unwrap()
    }

    fn fact_row(order: i64, revenue: Value) -> Vec<Value> {
        vec![
            order.into(),
            "C1".into(),
            "P1".into(),
            1i64.into(),
            1i64.into(),
            20170101i64.into(),
            2i64.into(),
            20.0.into(),
            revenue,
        ]
    }

    fn fact_columns(schema: &StarSchema) -> Vec<&str> {
        schema
            .table(SALES_FACT)
            .unwrap()
            .columns
            .iter()
            .map(|c| c.name.as_str())
            .collect()
    }

    #[tokio::test]
    async fn test_later_batch_overwrites_earlier_one() {
        let (_dir, warehouse, schema) = setup(true).await;
        // single worker keeps batch 0 before batch 1
        let loader = loader(Arc::clone(&warehouse), 1);
        let target = schema.table(CUSTOMER_DIM).unwrap();

        let results = loader
            .load(customers(vec![("C1", "M"), ("C1", "F")]), target, &target.primary_key, 1)
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        assert!(results.iter().all(LoadResult::is_success));
        assert_eq!(
            scalar(&warehouse, "SELECT COUNT(*) FROM \"Customer_Dim\" WHERE \"Customer_ID\" = 'C1'").await,
            Value::Integer(1)
        );
        assert_eq!(
            scalar(&warehouse, "SELECT \"Gender\" FROM \"Customer_Dim\" WHERE \"Customer_ID\" = 'C1'").await,
            Value::text("F")
        );
    }

    #[tokio::test]
    async fn test_malformed_row_fails_whole_batch() {
        let (_dir, warehouse, schema) = setup(false).await;
        let loader = loader(Arc::clone(&warehouse), 2);
        let target = schema.table(SALES_FACT).unwrap();

        let relation = Arc::new(
            Relation::from_rows(
                &fact_columns(&schema),
                vec![
                    fact_row(1, "20.00".into()),
                    fact_row(2, "20.0O".into()),
                    fact_row(3, "20.00".into()),
                ],
            )
            .unwrap(),
        );

        let results = loader
            .load(relation, target, &target.primary_key, 1000)
            .await
            .unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].rows_attempted, 3);
        assert_eq!(results[0].rows_succeeded, 0);
        match &results[0].failure {
            Some(FailureCause::Rejected(msg)) => assert!(msg.contains("malformed decimal")),
            other => panic!("unexpected failure: {:?}", other),
        }
        assert_eq!(
            scalar(&warehouse, "SELECT COUNT(*) FROM \"Sales_Fact\"").await,
            Value::Integer(0)
        );
    }

    #[tokio::test]
    async fn test_failed_batch_does_not_affect_others() {
        let (_dir, warehouse, schema) = setup(false).await;
        let loader = loader(Arc::clone(&warehouse), 2);
        let target = schema.table(SALES_FACT).unwrap();

        let relation = Arc::new(
            Relation::from_rows(
                &fact_columns(&schema),
                vec![
                    fact_row(1, 20.0.into()),
                    fact_row(2, Value::Null),
                    fact_row(3, 20.0.into()),
                ],
            )
            .unwrap(),
        );

        let results = loader
            .load(relation, target, &target.primary_key, 1)
            .await
            .unwrap();

        let outcomes: Vec<bool> = results.iter().map(LoadResult::is_success).collect();
        assert_eq!(outcomes, vec![true, false, true]);
        assert_eq!(
            scalar(&warehouse, "SELECT COUNT(*) FROM \"Sales_Fact\"").await,
            Value::Integer(2)
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_parallel_load_is_idempotent() {
        let (_dir, warehouse, schema) = setup(true).await;
        let loader = loader(Arc::clone(&warehouse), 4);
        let target = schema.table(CUSTOMER_DIM).unwrap();

        let ids: Vec<String> = (0..250).map(|i| format!("C{}", i)).collect();
        let relation = customers(ids.iter().map(|id| (id.as_str(), "M")).collect());

        for _ in 0..2 {
            let results = loader
                .load(Arc::clone(&relation), target, &target.primary_key, 20)
                .await
                .unwrap();
            assert_eq!(results.len(), 13);
            assert!(results.iter().all(LoadResult::is_success));
            assert_eq!(
                results.iter().map(|r| r.batch_index).collect::<Vec<_>>(),
                (0..13).collect::<Vec<_>>()
            );
            assert_eq!(
                scalar(&warehouse, "SELECT COUNT(*) FROM \"Customer_Dim\"").await,
                Value::Integer(250)
            );
        }

        assert!(loader.pool().connection_count().await <= 4);
        loader.pool().shutdown().await;
    }

    #[tokio::test]
    async fn test_cancelled_load_dispatches_nothing() {
        let (_dir, warehouse, schema) = setup(true).await;
        let loader = loader(Arc::clone(&warehouse), 2);
        loader.cancellation_token().cancel();
        let target = schema.table(CUSTOMER_DIM).unwrap();

        let results = loader
            .load(customers(vec![("C1", "M"), ("C2", "F")]), target, &target.primary_key, 1)
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.failure == Some(FailureCause::Cancelled)));
        assert_eq!(
            scalar(&warehouse, "SELECT COUNT(*) FROM \"Customer_Dim\"").await,
            Value::Integer(0)
        );
    }

    #[tokio::test]
    async fn test_connection_recovers_within_retries() {
        let (_dir, warehouse, schema) = setup(true).await;
        let flaky = Arc::new(FlakyWarehouse {
            inner: Arc::clone(&warehouse),
            failures: AtomicUsize::new(2),
        });
        // default connect_retries is 3
        let loader = loader(flaky.clone(), 2);
        let target = schema.table(CUSTOMER_DIM).unwrap();

        let results = loader
            .load(customers(vec![("C1", "M"), ("C2", "F")]), target, &target.primary_key, 1)
            .await
            .unwrap();

        assert_eq!(flaky.failures.load(Ordering::SeqCst), 0);
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(LoadResult::is_success));
        assert_eq!(results.iter().map(|r| r.rows_succeeded).sum::<usize>(), 2);
        assert_eq!(
            scalar(&warehouse, "SELECT COUNT(*) FROM \"Customer_Dim\"").await,
            Value::Integer(2)
        );
    }

    #[tokio::test]
    async fn test_cancellation_lets_in_flight_batch_commit() {
        let (_dir, warehouse, schema) = setup(true).await;
        let cancel = CancellationToken::new();
        let cancelling = Arc::new(CancellingWarehouse {
            inner: Arc::clone(&warehouse),
            cancel: cancel.clone(),
        });
        let loader = loader(cancelling, 1).with_cancellation(cancel.clone());
        let target = schema.table(CUSTOMER_DIM).unwrap();

        let results = loader
            .load(
                customers(vec![("C1", "M"), ("C2", "F"), ("C3", "M")]),
                target,
                &target.primary_key,
                1,
            )
            .await
            .unwrap();

        assert!(cancel.is_cancelled());
        assert_eq!(results.len(), 3);
        assert!(results[0].is_success());
        assert_eq!(results[0].rows_succeeded, 1);
        for result in &results[1..] {
            assert_eq!(result.failure, Some(FailureCause::Cancelled));
            assert_eq!(result.rows_attempted, 0);
        }
        assert_eq!(
            scalar(&warehouse, "SELECT COUNT(*) FROM \"Customer_Dim\"").await,
            Value::Integer(1)
        );
    }

    #[tokio::test]
    async fn test_unreachable_warehouse_fails_every_batch() {
        let dir = tempdir().unwrap();
        let warehouse = Arc::new(SqliteWarehouse::from_path(dir.path().join("missing").join("dw.db")));
        let loader = loader(warehouse, 2);
        let schema = StarSchema::retail();
        let target = schema.table(CUSTOMER_DIM).unwrap();

        let results = loader
            .load(
                customers(vec![("C1", "M"), ("C2", "F"), ("C3", "M")]),
                target,
                &target.primary_key,
                1,
            )
            .await
            .unwrap();

        assert_eq!(results.len(), 3);
        assert!(results
            .iter()
            .all(|r| matches!(r.failure, Some(FailureCause::Connection(_)))));
    }

    #[tokio::test]
    async fn test_schema_problems_fail_before_loading() {
        let (_dir, warehouse, schema) = setup(true).await;
        let loader = loader(warehouse, 2);
        let target = schema.table(CUSTOMER_DIM).unwrap();
        let relation = Arc::new(Relation::from_rows(&["Customer", "Gender"], vec![]).unwrap());

        let err = loader
            .load(relation, target, &target.primary_key, 10)
            .await
            .unwrap_err();
        assert!(matches!(err, EtlError::SchemaMismatch(_)));

        let err = loader
            .load(customers(vec![]), target, &target.primary_key, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, EtlError::InvalidConfiguration(_)));
    }
}
