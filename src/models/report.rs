use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use super::load::{FailureCause, LoadResult};
use crate::error::EtlError;

/// Terminal state of one entity load
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum EntityStatus {
    Completed,
    CompletedWithFailures,
    /// A prerequisite entity committed no batch at all
    Blocked { prerequisites: Vec<String> },
    /// No relation was supplied for this entity
    Skipped,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedBatch {
    pub batch_index: usize,
    pub cause: FailureCause,
}

/// Aggregated outcome of loading one table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadSummary {
    pub table: String,
    pub status: EntityStatus,
    pub batches: usize,
    pub successful_batches: usize,
    pub rows_attempted: usize,
    pub rows_succeeded: usize,
    pub failed_batches: Vec<FailedBatch>,
}

impl LoadSummary {
    pub fn from_results(table: &str, results: &[LoadResult]) -> Self {
        let mut summary = Self::empty(table, EntityStatus::Completed);
        summary.batches = results.len();

        let mut cancelled = false;
        for result in results {
            summary.rows_attempted += result.rows_attempted;
            summary.rows_succeeded += result.rows_succeeded;
            match &result.failure {
                None => summary.successful_batches += 1,
                Some(cause) => {
                    cancelled |= *cause == FailureCause::Cancelled;
                    summary.failed_batches.push(FailedBatch {
                        batch_index: result.batch_index,
                        cause: cause.clone(),
                    });
                }
            }
        }

        summary.status = if cancelled {
            EntityStatus::Cancelled
        } else if summary.failed_batches.is_empty() {
            EntityStatus::Completed
        } else {
            EntityStatus::CompletedWithFailures
        };
        summary
    }

    pub fn blocked(table: &str, prerequisites: Vec<String>) -> Self {
        Self::empty(table, EntityStatus::Blocked { prerequisites })
    }

    pub fn skipped(table: &str) -> Self {
        Self::empty(table, EntityStatus::Skipped)
    }

    fn empty(table: &str, status: EntityStatus) -> Self {
        Self {
            table: table.to_string(),
            status,
            batches: 0,
            successful_batches: 0,
            rows_attempted: 0,
            rows_succeeded: 0,
            failed_batches: Vec::new(),
        }
    }

    /// Whether dependents of this table may load. An empty relation that
    /// loaded cleanly counts; a table that committed nothing does not.
    pub fn unblocks_dependents(&self) -> bool {
        match self.status {
            EntityStatus::Completed => true,
            EntityStatus::CompletedWithFailures | EntityStatus::Cancelled => {
                self.successful_batches > 0
            }
            EntityStatus::Blocked { .. } | EntityStatus::Skipped => false,
        }
    }
}

/// One named pass/fail check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrityCheck {
    pub name: String,
    pub violations: u64,
    pub passed: bool,
}

impl IntegrityCheck {
    pub fn from_violations(name: impl Into<String>, violations: u64) -> Self {
        Self {
            name: name.into(),
            violations,
            passed: violations == 0,
        }
    }
}

/// Informational aggregates; never gate pass/fail
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BusinessMetrics {
    /// Summed over every fact row, orphans included
    pub total_revenue: f64,
    /// Calendar covered by the date dimension
    pub date_range_start: Option<NaiveDate>,
    pub date_range_end: Option<NaiveDate>,
    /// Sale dates of fact rows that resolve to a date dimension row
    pub first_sale_date: Option<NaiveDate>,
    pub last_sale_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub row_counts: BTreeMap<String, u64>,
    pub checks: Vec<IntegrityCheck>,
    pub metrics: BusinessMetrics,
}

impl IntegrityReport {
    pub fn passed(&self) -> bool {
        self.checks.iter().all(|c| c.passed)
    }

    pub fn failed_checks(&self) -> impl Iterator<Item = &IntegrityCheck> {
        self.checks.iter().filter(|c| !c.passed)
    }

    pub fn check(&self, name: &str) -> Option<&IntegrityCheck> {
        self.checks.iter().find(|c| c.name == name)
    }

    /// Turn a failing report into an error, for callers that want one
    pub fn ensure_passed(&self) -> Result<(), EtlError> {
        let failed: Vec<String> = self
            .failed_checks()
            .map(|c| format!("{} ({} rows)", c.name, c.violations))
            .collect();

        if failed.is_empty() {
            Ok(())
        } else {
            Err(EtlError::IntegrityViolation(failed.join("; ")))
        }
    }
}

/// Everything one pipeline run produced
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub entities: Vec<LoadSummary>,
    pub integrity: IntegrityReport,
    pub elapsed_ms: u64,
}

impl PipelineReport {
    pub fn failed_batch_count(&self) -> usize {
        self.entities.iter().map(|e| e.failed_batches.len()).sum()
    }

    pub fn entity(&self, table: &str) -> Option<&LoadSummary> {
        self.entities.iter().find(|e| e.table == table)
    }
}
