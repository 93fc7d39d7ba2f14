use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::sync::Arc;

use super::relation::Relation;
use super::value::Value;

/// A contiguous slice of a relation, loaded as one transaction.
/// Batches share the source relation instead of copying rows.
#[derive(Debug, Clone)]
pub struct Batch {
    index: usize,
    relation: Arc<Relation>,
    range: Range<usize>,
}

impl Batch {
    pub(crate) fn new(index: usize, relation: Arc<Relation>, range: Range<usize>) -> Self {
        Self {
            index,
            relation,
            range,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn len(&self) -> usize {
        self.range.len()
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }

    /// Offset of the first row within the source relation
    pub fn start(&self) -> usize {
        self.range.start
    }

    pub fn columns(&self) -> &[String] {
        self.relation.columns()
    }

    pub fn rows(&self) -> &[Vec<Value>] {
        &self.relation.rows()[self.range.clone()]
    }
}

/// Why a batch did not commit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum FailureCause {
    /// The warehouse rejected a row (constraint, type, or NOT NULL violation)
    Rejected(String),
    /// Connection-level error persisted after retries
    Connection(String),
    /// Never attempted because the run was cancelled
    Cancelled,
}

impl FailureCause {
    pub fn message(&self) -> String {
        match self {
            FailureCause::Rejected(msg) | FailureCause::Connection(msg) => msg.clone(),
            FailureCause::Cancelled => "cancelled before execution".to_string(),
        }
    }
}

/// Outcome of one batch. A batch is all-or-nothing, so `rows_succeeded`
/// is either `rows_attempted` or zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadResult {
    pub batch_index: usize,
    pub rows_attempted: usize,
    pub rows_succeeded: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureCause>,
}

impl LoadResult {
    pub fn succeeded(batch_index: usize, rows: usize) -> Self {
        Self {
            batch_index,
            rows_attempted: rows,
            rows_succeeded: rows,
            failure: None,
        }
    }

    pub fn failed(batch_index: usize, rows: usize, cause: FailureCause) -> Self {
        Self {
            batch_index,
            rows_attempted: rows,
            rows_succeeded: 0,
            failure: Some(cause),
        }
    }

    pub fn cancelled(batch_index: usize) -> Self {
        Self {
            batch_index,
            rows_attempted: 0,
            rows_succeeded: 0,
            failure: Some(FailureCause::Cancelled),
        }
    }

    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }
}
