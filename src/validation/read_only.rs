use sqlparser::ast::Statement;
use sqlparser::dialect::{Dialect as SqlDialect, MySqlDialect, PostgreSqlDialect, SQLiteDialect};
use sqlparser::parser::Parser;

use crate::error::EtlError;
use crate::services::warehouse::Dialect;

/// Guard for queries issued against a loaded warehouse: each must parse as
/// exactly one SELECT in the warehouse's dialect.
pub struct ReadOnlyQuery;

impl ReadOnlyQuery {
    fn parser_dialect(dialect: Dialect) -> Box<dyn SqlDialect> {
        match dialect {
            Dialect::MySql => Box::new(MySqlDialect {}),
            Dialect::Postgres => Box::new(PostgreSqlDialect {}),
            Dialect::Sqlite => Box::new(SQLiteDialect {}),
        }
    }

    /// Validate SQL query and ensure it's a single SELECT statement
    pub fn validate(sql: &str, dialect: Dialect) -> Result<(), EtlError> {
        let parser_dialect = Self::parser_dialect(dialect);
        let statements = Parser::new(parser_dialect.as_ref())
            .try_with_sql(sql)
            .and_then(|mut parser| parser.parse_statements())
            .map_err(|e| EtlError::InvalidConfiguration(format!("SQL parsing error: {}", e)))?;

        match statements.as_slice() {
            [Statement::Query(_)] => Ok(()),
            [] => Err(EtlError::InvalidConfiguration("Empty SQL query".to_string())),
            [_] => Err(EtlError::InvalidConfiguration(format!(
                "Only SELECT queries are permitted against the warehouse: {}",
                sql
            ))),
            _ => Err(EtlError::InvalidConfiguration(format!(
                "Expected a single statement, found {}",
                statements.len()
            ))),
        }
    }
}
