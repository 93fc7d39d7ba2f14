use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::error::EtlError;
use crate::services::warehouse::Dialect;

pub const STORE_DIM: &str = "Store_Dim";
pub const SUPPLIER_DIM: &str = "Supplier_Dim";
pub const CUSTOMER_DIM: &str = "Customer_Dim";
pub const DATE_DIM: &str = "Date_Dim";
pub const PRODUCT_DIM: &str = "Product_Dim";
pub const SALES_FACT: &str = "Sales_Fact";

/// Declared warehouse column type; load values are coerced to it before binding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Text,
    Integer,
    Decimal,
    Date,
}

impl ColumnType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnType::Text => "text",
            ColumnType::Integer => "integer",
            ColumnType::Decimal => "decimal",
            ColumnType::Date => "date",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub column_type: ColumnType,
    pub nullable: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForeignKey {
    pub column: String,
    pub references_table: String,
    pub references_column: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TableKind {
    Dimension,
    Fact,
}

/// Description of one warehouse table. The DDL itself is owned by the
/// warehouse; this is what the loader and validator need to know about it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub kind: TableKind,
    pub columns: Vec<ColumnDef>,
    pub primary_key: Vec<String>,
    pub foreign_keys: Vec<ForeignKey>,
}

impl TableSchema {
    pub fn dimension(name: impl Into<String>) -> Self {
        Self::new(name, TableKind::Dimension)
    }

    pub fn fact(name: impl Into<String>) -> Self {
        Self::new(name, TableKind::Fact)
    }

    fn new(name: impl Into<String>, kind: TableKind) -> Self {
        Self {
            name: name.into(),
            kind,
            columns: Vec::new(),
            primary_key: Vec::new(),
            foreign_keys: Vec::new(),
        }
    }

    /// Add a NOT NULL column
    pub fn column(mut self, name: &str, column_type: ColumnType) -> Self {
        self.columns.push(ColumnDef {
            name: name.to_string(),
            column_type,
            nullable: false,
        });
        self
    }

    pub fn nullable_column(mut self, name: &str, column_type: ColumnType) -> Self {
        self.columns.push(ColumnDef {
            name: name.to_string(),
            column_type,
            nullable: true,
        });
        self
    }

    pub fn primary_key(mut self, columns: &[&str]) -> Self {
        self.primary_key = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn foreign_key(mut self, column: &str, references_table: &str, references_column: &str) -> Self {
        self.foreign_keys.push(ForeignKey {
            column: column.to_string(),
            references_table: references_table.to_string(),
            references_column: references_column.to_string(),
        });
        self
    }

    pub fn column_def(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn is_fact(&self) -> bool {
        self.kind == TableKind::Fact
    }

    /// Distinct tables this table references, in declaration order
    pub fn dependencies(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.foreign_keys
            .iter()
            .map(|fk| fk.references_table.as_str())
            .filter(|t| *t != self.name && seen.insert(*t))
            .collect()
    }

    /// Render CREATE TABLE for the given dialect
    pub fn create_table_sql(&self, dialect: Dialect) -> String {
        let mut parts: Vec<String> = self
            .columns
            .iter()
            .map(|c| {
                format!(
                    "{} {}{}",
                    dialect.quote_ident(&c.name),
                    dialect.sql_type(c.column_type),
                    if c.nullable { "" } else { " NOT NULL" }
                )
            })
            .collect();

        if !self.primary_key.is_empty() {
            parts.push(format!("PRIMARY KEY ({})", dialect.ident_list(&self.primary_key)));
        }

        for fk in &self.foreign_keys {
            parts.push(format!(
                "FOREIGN KEY ({}) REFERENCES {} ({})",
                dialect.quote_ident(&fk.column),
                dialect.quote_ident(&fk.references_table),
                dialect.quote_ident(&fk.references_column)
            ));
        }

        format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    {}\n)",
            dialect.quote_ident(&self.name),
            parts.join(",\n    ")
        )
    }
}

/// The set of tables making up the warehouse
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StarSchema {
    tables: Vec<TableSchema>,
}

impl StarSchema {
    pub fn new(tables: Vec<TableSchema>) -> Self {
        Self { tables }
    }

    /// Retail sales warehouse: five dimensions and the sales fact
    pub fn retail() -> Self {
        use ColumnType::*;

        let store = TableSchema::dimension(STORE_DIM)
            .column("Store_ID", Integer)
            .column("Store_Name", Text)
            .primary_key(&["Store_ID"]);

        let supplier = TableSchema::dimension(SUPPLIER_DIM)
            .column("Supplier_ID", Integer)
            .column("Supplier_Name", Text)
            .primary_key(&["Supplier_ID"]);

        let customer = TableSchema::dimension(CUSTOMER_DIM)
            .column("Customer_ID", Text)
            .nullable_column("Gender", Text)
            .nullable_column("Age_Range", Text)
            .nullable_column("Occupation", Integer)
            .nullable_column("City_Category", Text)
            .nullable_column("Stay_In_Current_City_Years", Text)
            .nullable_column("Marital_Status", Integer)
            .primary_key(&["Customer_ID"]);

        let date = TableSchema::dimension(DATE_DIM)
            .column("Date_ID", Integer)
            .column("Full_Date", Date)
            .column("Day", Integer)
            .column("Month", Integer)
            .column("Month_Name", Text)
            .column("Quarter", Text)
            .column("Year", Integer)
            .column("Weekday_Weekend", Text)
            .column("Season", Text)
            .primary_key(&["Date_ID"]);

        let product = TableSchema::dimension(PRODUCT_DIM)
            .column("Product_ID", Text)
            .nullable_column("Product_Category", Text)
            .column("Price", Decimal)
            .column("Store_ID", Integer)
            .column("Supplier_ID", Integer)
            .primary_key(&["Product_ID"])
            .foreign_key("Store_ID", STORE_DIM, "Store_ID")
            .foreign_key("Supplier_ID", SUPPLIER_DIM, "Supplier_ID");

        let sales = TableSchema::fact(SALES_FACT)
            .column("OrderID", Integer)
            .column("Customer_ID", Text)
            .column("Product_ID", Text)
            .column("Store_ID", Integer)
            .column("Supplier_ID", Integer)
            .column("Date_ID", Integer)
            .column("Quantity", Integer)
            .column("Total_Amount", Decimal)
            .column("Revenue", Decimal)
            .primary_key(&["OrderID", "Product_ID"])
            .foreign_key("Customer_ID", CUSTOMER_DIM, "Customer_ID")
            .foreign_key("Product_ID", PRODUCT_DIM, "Product_ID")
            .foreign_key("Store_ID", STORE_DIM, "Store_ID")
            .foreign_key("Supplier_ID", SUPPLIER_DIM, "Supplier_ID")
            .foreign_key("Date_ID", DATE_DIM, "Date_ID");

        Self::new(vec![store, supplier, customer, date, product, sales])
    }

    pub fn tables(&self) -> &[TableSchema] {
        &self.tables
    }

    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// Group tables into load stages: every table lands in a stage strictly
    /// after all the tables it references. Table order inside a stage
    /// follows declaration order.
    pub fn load_stages(&self) -> Result<Vec<Vec<&TableSchema>>, EtlError> {
        let mut levels: HashMap<&str, usize> = HashMap::new();
        let mut remaining: Vec<&TableSchema> = self.tables.iter().collect();

        while !remaining.is_empty() {
            let before = remaining.len();
            remaining.retain(|table| {
                let deps = table.dependencies();
                if deps.iter().all(|d| levels.contains_key(d)) {
                    let level = deps.iter().map(|d| levels[d] + 1).max().unwrap_or(0);
                    levels.insert(table.name.as_str(), level);
                    false
                } else {
                    true
                }
            });

            if remaining.len() == before {
                let names: Vec<&str> = remaining.iter().map(|t| t.name.as_str()).collect();
                return Err(EtlError::InvalidConfiguration(format!(
                    "Unresolvable foreign key dependencies among: {}",
                    names.join(", ")
                )));
            }
        }

        let depth = levels.values().copied().max().map_or(0, |m| m + 1);
        let mut stages: Vec<Vec<&TableSchema>> = vec![Vec::new(); depth];
        for table in &self.tables {
            stages[levels[table.name.as_str()]].push(table);
        }
        Ok(stages)
    }
}

impl Default for StarSchema {
    fn default() -> Self {
        Self::retail()
    }
}
