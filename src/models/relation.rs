use std::collections::HashSet;

use super::value::{KeyValue, Value};
use crate::error::EtlError;

/// In-memory tabular dataset. Immutable once built: every operation that
/// changes shape or content returns a new relation.
#[derive(Debug, Clone, PartialEq)]
pub struct Relation {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

/// Borrowed view of one row, addressable by column name
#[derive(Debug, Clone, Copy)]
pub struct RowRef<'a> {
    columns: &'a [String],
    values: &'a [Value],
}

impl<'a> RowRef<'a> {
    pub fn get(&self, column: &str) -> Option<&'a Value> {
        self.columns
            .iter()
            .position(|c| c == column)
            .map(|idx| &self.values[idx])
    }

    pub fn value(&self, idx: usize) -> &'a Value {
        &self.values[idx]
    }

    pub fn values(&self) -> &'a [Value] {
        self.values
    }

    pub fn columns(&self) -> &'a [String] {
        self.columns
    }
}

impl Relation {
    /// Build a relation, checking that column names are unique and every
    /// row has exactly one value per column.
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Result<Self, EtlError> {
        let mut seen = HashSet::new();
        for column in &columns {
            if !seen.insert(column.as_str()) {
                return Err(EtlError::SchemaMismatch(format!(
                    "Duplicate column '{}' in relation",
                    column
                )));
            }
        }

        if let Some((idx, row)) = rows.iter().enumerate().find(|(_, r)| r.len() != columns.len()) {
            return Err(EtlError::SchemaMismatch(format!(
                "Row {} has {} values but the relation has {} columns",
                idx,
                row.len(),
                columns.len()
            )));
        }

        Ok(Self { columns, rows })
    }

    /// Convenience constructor from string column names
    pub fn from_rows(columns: &[&str], rows: Vec<Vec<Value>>) -> Result<Self, EtlError> {
        Self::new(columns.iter().map(|c| c.to_string()).collect(), rows)
    }

    pub fn empty(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    /// Skips validation; callers guarantee the shape invariant
    pub(crate) fn from_parts(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        debug_assert!(rows.iter().all(|r| r.len() == columns.len()));
        Self { columns, rows }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c == name)
    }

    pub fn column_index(&self, name: &str) -> Result<usize, EtlError> {
        self.columns.iter().position(|c| c == name).ok_or_else(|| {
            EtlError::SchemaMismatch(format!(
                "Column '{}' not found (available: {})",
                name,
                self.columns.join(", ")
            ))
        })
    }

    pub fn row(&self, idx: usize) -> Option<RowRef<'_>> {
        self.rows.get(idx).map(|values| RowRef {
            columns: &self.columns,
            values,
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = RowRef<'_>> + '_ {
        self.rows.iter().map(move |values| RowRef {
            columns: &self.columns,
            values,
        })
    }

    /// Keep the named columns, in the given order
    pub fn project(&self, columns: &[&str]) -> Result<Relation, EtlError> {
        let indices = columns
            .iter()
            .map(|c| self.column_index(c))
            .collect::<Result<Vec<_>, _>>()?;

        let rows = self
            .rows
            .iter()
            .map(|row| indices.iter().map(|&i| row[i].clone()).collect())
            .collect();

        Relation::new(columns.iter().map(|c| c.to_string()).collect(), rows)
    }

    /// Rename columns; unknown source names are a schema mismatch
    pub fn rename(&self, renames: &[(&str, &str)]) -> Result<Relation, EtlError> {
        let mut columns = self.columns.clone();
        for (from, to) in renames {
            let idx = self.column_index(from)?;
            columns[idx] = to.to_string();
        }
        Relation::new(columns, self.rows.clone())
    }

    pub fn filter<F>(&self, mut keep: F) -> Relation
    where
        F: FnMut(RowRef<'_>) -> bool,
    {
        let rows = self
            .iter()
            .filter(|row| keep(*row))
            .map(|row| row.values().to_vec())
            .collect();
        Relation::from_parts(self.columns.clone(), rows)
    }

    /// Build a new relation with `columns`, mapping each row; rows mapped to
    /// `None` are dropped.
    pub fn map_rows<F>(&self, columns: &[&str], mut f: F) -> Result<Relation, EtlError>
    where
        F: FnMut(RowRef<'_>) -> Result<Option<Vec<Value>>, EtlError>,
    {
        let mut rows = Vec::with_capacity(self.rows.len());
        for row in self.iter() {
            if let Some(values) = f(row)? {
                rows.push(values);
            }
        }
        Relation::new(columns.iter().map(|c| c.to_string()).collect(), rows)
    }

    /// Drop rows containing any null
    pub fn drop_nulls(&self) -> Relation {
        self.filter(|row| row.values().iter().all(|v| !v.is_null()))
    }

    /// Drop repeated rows, keeping the first occurrence
    pub fn distinct(&self) -> Relation {
        let mut seen: HashSet<Vec<Option<KeyValue>>> = HashSet::new();
        self.filter(|row| {
            let key: Vec<Option<KeyValue>> = row.values().iter().map(Value::key).collect();
            seen.insert(key)
        })
    }
}
