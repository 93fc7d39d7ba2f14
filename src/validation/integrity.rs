use serde::{Deserialize, Serialize};

use crate::error::EtlError;
use crate::models::{
    BusinessMetrics, ForeignKey, IntegrityCheck, IntegrityReport, StarSchema, TableSchema, Value,
};
use crate::services::warehouse::{Dialect, Warehouse, WarehouseConnection};

use super::read_only::ReadOnlyQuery;

/// A named data-quality rule. The check passes iff no row of `table`
/// matches `violation_condition` (an SQL boolean expression).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusinessRule {
    pub name: String,
    pub table: String,
    pub violation_condition: String,
}

impl BusinessRule {
    pub fn new(name: &str, table: &str, violation_condition: &str) -> Self {
        Self {
            name: name.to_string(),
            table: table.to_string(),
            violation_condition: violation_condition.to_string(),
        }
    }
}

/// Post-load checks against the warehouse. Issues read-only queries only.
pub struct IntegrityValidator {
    schema: StarSchema,
    rules: Vec<BusinessRule>,
}

impl IntegrityValidator {
    pub fn new(schema: StarSchema) -> Self {
        Self {
            schema,
            rules: Vec::new(),
        }
    }

    pub fn with_rules(mut self, rules: Vec<BusinessRule>) -> Self {
        self.rules = rules;
        self
    }

    pub fn orphan_check_name(table: &str, fk: &ForeignKey) -> String {
        format!(
            "orphan {}.{} -> {}.{}",
            table, fk.column, fk.references_table, fk.references_column
        )
    }

    pub async fn validate(&self, warehouse: &dyn Warehouse) -> Result<IntegrityReport, EtlError> {
        let dialect = warehouse.dialect();
        let mut conn = warehouse.connect().await?;
        let report = self.run_checks(dialect, conn.as_mut()).await;

        if let Err(e) = conn.close().await {
            tracing::warn!("Failed to close validation connection: {}", e);
        }

        let report = report?;
        for check in report.failed_checks() {
            tracing::warn!("Integrity check failed: {} ({} rows)", check.name, check.violations);
        }
        tracing::info!(
            "Integrity validation finished: {}/{} checks passed, total revenue {:.2}",
            report.checks.iter().filter(|c| c.passed).count(),
            report.checks.len(),
            report.metrics.total_revenue
        );
        Ok(report)
    }

    async fn run_checks(
        &self,
        dialect: Dialect,
        conn: &mut dyn WarehouseConnection,
    ) -> Result<IntegrityReport, EtlError> {
        let q = |ident: &str| dialect.quote_ident(ident);
        let mut report = IntegrityReport::default();

        for table in self.schema.tables() {
            let sql = format!("SELECT COUNT(*) FROM {}", q(&table.name));
            let count = Self::count(conn, dialect, &sql).await?;
            report.row_counts.insert(table.name.clone(), count);
        }

        for table in self.schema.tables() {
            for fk in &table.foreign_keys {
                let sql = format!(
                    "SELECT COUNT(*) FROM {child} c LEFT JOIN {parent} p ON c.{col} = p.{refcol} \
                     WHERE c.{col} IS NOT NULL AND p.{refcol} IS NULL",
                    child = q(&table.name),
                    parent = q(&fk.references_table),
                    col = q(&fk.column),
                    refcol = q(&fk.references_column),
                );
                let orphans = Self::count(conn, dialect, &sql).await?;
                report
                    .checks
                    .push(IntegrityCheck::from_violations(Self::orphan_check_name(&table.name, fk), orphans));
            }
        }

        for rule in &self.rules {
            let sql = format!(
                "SELECT COUNT(*) FROM {} WHERE ({})",
                q(&rule.table),
                rule.violation_condition
            );
            let violations = Self::count(conn, dialect, &sql).await?;
            report.checks.push(IntegrityCheck::from_violations(rule.name.clone(), violations));
        }

        report.metrics = self.metrics(conn, dialect).await?;
        Ok(report)
    }

    /// Fact table with a revenue measure and a date dimension it references
    fn metrics_source(&self) -> Option<(&TableSchema, &ForeignKey, &TableSchema)> {
        self.schema.tables().iter().filter(|t| t.is_fact()).find_map(|fact| {
            fact.column_def("Revenue")?;
            fact.foreign_keys.iter().find_map(|fk| {
                let dim = self.schema.table(&fk.references_table)?;
                dim.column_def("Full_Date").map(|_| (fact, fk, dim))
            })
        })
    }

    async fn metrics(
        &self,
        conn: &mut dyn WarehouseConnection,
        dialect: Dialect,
    ) -> Result<BusinessMetrics, EtlError> {
        let Some((fact, fk, dim)) = self.metrics_source() else {
            return Ok(BusinessMetrics::default());
        };

        let q = |ident: &str| dialect.quote_ident(ident);
        let date = q("Full_Date");

        let revenue = format!(
            "SELECT {} FROM {}",
            dialect.as_float(&format!("COALESCE(SUM({}), 0)", q("Revenue"))),
            q(&fact.name)
        );
        let coverage = format!("SELECT MIN({date}), MAX({date}) FROM {}", q(&dim.name));
        let sales = format!(
            "SELECT MIN(d.{date}), MAX(d.{date}) FROM {fact} f JOIN {dim} d ON f.{col} = d.{refcol}",
            fact = q(&fact.name),
            dim = q(&dim.name),
            col = q(&fk.column),
            refcol = q(&fk.references_column),
        );

        let revenue = Self::fetch(conn, dialect, &revenue).await?;
        let coverage = Self::fetch(conn, dialect, &coverage).await?;
        let sales = Self::fetch(conn, dialect, &sales).await?;
        let cell = |row: &[Value], idx: usize| row.get(idx).cloned().unwrap_or(Value::Null);

        Ok(BusinessMetrics {
            total_revenue: cell(&revenue, 0).as_f64().unwrap_or(0.0),
            date_range_start: cell(&coverage, 0).as_date(),
            date_range_end: cell(&coverage, 1).as_date(),
            first_sale_date: cell(&sales, 0).as_date(),
            last_sale_date: cell(&sales, 1).as_date(),
        })
    }

    /// First row of a read-only query; empty when there is none
    async fn fetch(
        conn: &mut dyn WarehouseConnection,
        dialect: Dialect,
        sql: &str,
    ) -> Result<Vec<Value>, EtlError> {
        ReadOnlyQuery::validate(sql, dialect)?;
        Ok(conn.fetch_one(sql).await?.unwrap_or_default())
    }

    async fn count(
        conn: &mut dyn WarehouseConnection,
        dialect: Dialect,
        sql: &str,
    ) -> Result<u64, EtlError> {
        ReadOnlyQuery::validate(sql, dialect)?;
        let row = conn.fetch_one(sql).await?;
        row.and_then(|r| r.first().and_then(Value::as_i64))
            .and_then(|n| u64::try_from(n).ok())
            .ok_or_else(|| EtlError::Internal(format!("Count query returned no number: {}", sql)))
    }
}
