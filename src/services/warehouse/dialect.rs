// SQL dialect differences between warehouse backends
use crate::error::EtlError;
use crate::models::ColumnType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dialect {
    MySql,
    Postgres,
    Sqlite,
}

impl Dialect {
    /// Pick the dialect from a warehouse URL scheme
    pub fn from_url(url: &str) -> Result<Self, EtlError> {
        let scheme = url.split(':').next().unwrap_or_default().to_lowercase();
        match scheme.as_str() {
            "mysql" | "mariadb" => Ok(Dialect::MySql),
            "postgres" | "postgresql" => Ok(Dialect::Postgres),
            "sqlite" => Ok(Dialect::Sqlite),
            _ => Err(EtlError::InvalidConfiguration(format!(
                "Unsupported warehouse URL scheme '{}' (expected mysql, postgres or sqlite)",
                scheme
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Dialect::MySql => "mysql",
            Dialect::Postgres => "postgresql",
            Dialect::Sqlite => "sqlite",
        }
    }

    /// Quote an identifier. Postgres identifiers are quoted too, so the
    /// mixed-case table names survive case folding.
    pub fn quote_ident(&self, ident: &str) -> String {
        match self {
            Dialect::MySql => format!("`{}`", ident.replace('`', "``")),
            Dialect::Postgres | Dialect::Sqlite => format!("\"{}\"", ident.replace('"', "\"\"")),
        }
    }

    pub fn ident_list<S: AsRef<str>>(&self, idents: &[S]) -> String {
        idents
            .iter()
            .map(|i| self.quote_ident(i.as_ref()))
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub fn sql_type(&self, column_type: ColumnType) -> &'static str {
        match (self, column_type) {
            (Dialect::MySql, ColumnType::Text) => "VARCHAR(255)",
            (Dialect::MySql, ColumnType::Integer) => "BIGINT",
            (Dialect::MySql, ColumnType::Decimal) => "DECIMAL(12,2)",
            (Dialect::MySql, ColumnType::Date) => "DATE",

            (Dialect::Postgres, ColumnType::Text) => "TEXT",
            (Dialect::Postgres, ColumnType::Integer) => "BIGINT",
            (Dialect::Postgres, ColumnType::Decimal) => "NUMERIC(12,2)",
            (Dialect::Postgres, ColumnType::Date) => "DATE",

            (Dialect::Sqlite, ColumnType::Text) => "TEXT",
            (Dialect::Sqlite, ColumnType::Integer) => "INTEGER",
            (Dialect::Sqlite, ColumnType::Decimal) => "REAL",
            // ISO-8601 text sorts and compares correctly
            (Dialect::Sqlite, ColumnType::Date) => "TEXT",
        }
    }

    /// Bind placeholder for the 1-based parameter `n`. Postgres placeholders
    /// carry a cast so text-typed parameters land in NUMERIC/DATE columns.
    pub fn placeholder(&self, n: usize, column_type: ColumnType) -> String {
        match self {
            Dialect::MySql => "?".to_string(),
            Dialect::Sqlite => format!("?{}", n),
            Dialect::Postgres => {
                let cast = match column_type {
                    ColumnType::Text => "TEXT",
                    ColumnType::Integer => "BIGINT",
                    ColumnType::Decimal => "DOUBLE PRECISION",
                    ColumnType::Date => "DATE",
                };
                format!("${}::{}", n, cast)
            }
        }
    }

    /// Wrap a numeric aggregate so every backend returns a float
    pub fn as_float(&self, expr: &str) -> String {
        match self {
            Dialect::Postgres => format!("CAST({} AS DOUBLE PRECISION)", expr),
            Dialect::MySql => format!("CAST({} AS DOUBLE)", expr),
            Dialect::Sqlite => format!("CAST({} AS REAL)", expr),
        }
    }

    /// Render the conflict clause appended to an INSERT: present keys get
    /// every non-key column overwritten, absent keys are inserted.
    pub fn upsert_clause(&self, key_columns: &[String], update_columns: &[String]) -> String {
        match self {
            Dialect::MySql => {
                let assignments = match key_columns.first() {
                    // no-op update keeps the statement idempotent
                    Some(key) if update_columns.is_empty() => {
                        let k = self.quote_ident(key);
                        format!("{} = {}", k, k)
                    }
                    _ => update_columns
                        .iter()
                        .map(|c| {
                            let q = self.quote_ident(c);
                            format!("{} = VALUES({})", q, q)
                        })
                        .collect::<Vec<_>>()
                        .join(", "),
                };
                format!("ON DUPLICATE KEY UPDATE {}", assignments)
            }
            Dialect::Postgres | Dialect::Sqlite => {
                let target = self.ident_list(key_columns);
                if update_columns.is_empty() {
                    format!("ON CONFLICT ({}) DO NOTHING", target)
                } else {
                    let assignments = update_columns
                        .iter()
                        .map(|c| {
                            let q = self.quote_ident(c);
                            format!("{} = excluded.{}", q, q)
                        })
                        .collect::<Vec<_>>()
                        .join(", ");
                    format!("ON CONFLICT ({}) DO UPDATE SET {}", target, assignments)
                }
            }
        }
    }
}
