use std::sync::Arc;

use crate::error::EtlError;
use crate::models::{Batch, Relation};

/// Slices relations into fixed-size, ordered batches
#[derive(Debug, Clone, Copy)]
pub struct BatchPlanner {
    batch_size: usize,
}

impl BatchPlanner {
    pub fn new(batch_size: usize) -> Result<Self, EtlError> {
        if batch_size == 0 {
            return Err(EtlError::InvalidConfiguration(
                "Batch size must be a positive integer".to_string(),
            ));
        }
        Ok(Self { batch_size })
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn batch_count(&self, rows: usize) -> usize {
        rows.div_ceil(self.batch_size)
    }

    /// Lazy plan over `relation`. Cloning the plan restarts it from the
    /// first batch.
    pub fn plan(&self, relation: &Arc<Relation>) -> BatchPlan {
        BatchPlan {
            relation: Arc::clone(relation),
            batch_size: self.batch_size,
            next_index: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BatchPlan {
    relation: Arc<Relation>,
    batch_size: usize,
    next_index: usize,
}

impl Iterator for BatchPlan {
    type Item = Batch;

    fn next(&mut self) -> Option<Batch> {
        let start = self.next_index * self.batch_size;
        if start >= self.relation.len() {
            return None;
        }
        let end = (start + self.batch_size).min(self.relation.len());
        let batch = Batch::new(self.next_index, Arc::clone(&self.relation), start..end);
        self.next_index += 1;
        Some(batch)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let total = self.relation.len().div_ceil(self.batch_size);
        let remaining = total.saturating_sub(self.next_index);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for BatchPlan {}
