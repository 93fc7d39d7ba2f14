use crate::error::EtlError;
use crate::models::{ColumnType, TableSchema, Value};

use super::dialect::Dialect;

/// A parameterized upsert for one target table, prepared once per load and
/// shared by every worker.
#[derive(Debug, Clone)]
pub struct UpsertStatement {
    table: String,
    columns: Vec<String>,
    column_types: Vec<ColumnType>,
    nullable: Vec<bool>,
    key_columns: Vec<String>,
    sql: String,
}

impl UpsertStatement {
    /// Check the relation's columns against the target table and render the
    /// upsert SQL. Fails before any batch is dispatched.
    pub fn prepare(
        dialect: Dialect,
        target: &TableSchema,
        relation_columns: &[String],
        key_columns: &[String],
    ) -> Result<Self, EtlError> {
        if key_columns.is_empty() {
            return Err(EtlError::InvalidConfiguration(format!(
                "No key columns given for upsert into {}",
                target.name
            )));
        }

        let mut column_types = Vec::with_capacity(relation_columns.len());
        let mut nullable = Vec::with_capacity(relation_columns.len());
        for column in relation_columns {
            let def = target.column_def(column).ok_or_else(|| {
                EtlError::SchemaMismatch(format!(
                    "Column '{}' does not exist in table {}",
                    column, target.name
                ))
            })?;
            column_types.push(def.column_type);
            nullable.push(def.nullable);
        }

        if let Some(key) = key_columns.iter().find(|k| !relation_columns.contains(*k)) {
            return Err(EtlError::SchemaMismatch(format!(
                "Key column '{}' missing from relation loaded into {}",
                key, target.name
            )));
        }

        if let Some(required) = target
            .columns
            .iter()
            .find(|c| !c.nullable && !relation_columns.contains(&c.name))
        {
            return Err(EtlError::SchemaMismatch(format!(
                "NOT NULL column '{}' of {} missing from relation",
                required.name, target.name
            )));
        }

        let update_columns: Vec<String> = relation_columns
            .iter()
            .filter(|c| !key_columns.contains(*c))
            .cloned()
            .collect();

        let placeholders = column_types
            .iter()
            .enumerate()
            .map(|(i, t)| dialect.placeholder(i + 1, *t))
            .collect::<Vec<_>>()
            .join(", ");

        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({}) {}",
            dialect.quote_ident(&target.name),
            dialect.ident_list(relation_columns),
            placeholders,
            dialect.upsert_clause(key_columns, &update_columns)
        );

        Ok(Self {
            table: target.name.clone(),
            columns: relation_columns.to_vec(),
            column_types,
            nullable,
            key_columns: key_columns.to_vec(),
            sql,
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn column_types(&self) -> &[ColumnType] {
        &self.column_types
    }

    pub fn key_columns(&self) -> &[String] {
        &self.key_columns
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Coerce every value to its declared column type. Any failure rejects
    /// the whole batch, so nothing reaches the driver.
    pub fn bind(&self, rows: &[Vec<Value>]) -> Result<Vec<Vec<Value>>, EtlError> {
        rows.iter()
            .enumerate()
            .map(|(row_idx, row)| {
                row.iter()
                    .enumerate()
                    .map(|(col_idx, value)| self.bind_value(row_idx, col_idx, value))
                    .collect::<Result<Vec<_>, _>>()
            })
            .collect()
    }

    fn bind_value(&self, row_idx: usize, col_idx: usize, value: &Value) -> Result<Value, EtlError> {
        let column = &self.columns[col_idx];
        let coerced = value.coerce(self.column_types[col_idx]).map_err(|msg| {
            EtlError::BatchLoadFailure(format!("row {} column {}: {}", row_idx + 1, column, msg))
        })?;

        if coerced.is_null() && !self.nullable[col_idx] {
            return Err(EtlError::BatchLoadFailure(format!(
                "row {} column {}: NULL in NOT NULL column",
                row_idx + 1,
                column
            )));
        }
        Ok(coerced)
    }
}
