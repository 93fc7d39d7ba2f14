use chrono::{Datelike, NaiveDate, Weekday};

use crate::error::EtlError;
use crate::models::{date_key, Relation, Value};
use crate::services::join_engine::{HybridJoinEngine, JoinKey, JoinStrategy};

pub const CUSTOMER_COLUMNS: [&str; 7] = [
    "Customer_ID",
    "Gender",
    "Age_Range",
    "Occupation",
    "City_Category",
    "Stay_In_Current_City_Years",
    "Marital_Status",
];

pub const PRODUCT_COLUMNS: [&str; 5] = ["Product_ID", "Product_Category", "Price", "Store_ID", "Supplier_ID"];

pub const DATE_COLUMNS: [&str; 9] = [
    "Date_ID",
    "Full_Date",
    "Day",
    "Month",
    "Month_Name",
    "Quarter",
    "Year",
    "Weekday_Weekend",
    "Season",
];

pub const TRANSACTION_COLUMNS: [&str; 5] = ["orderID", "Customer_ID", "Product_ID", "quantity", "date"];

pub const FACT_COLUMNS: [&str; 9] = [
    "OrderID",
    "Customer_ID",
    "Product_ID",
    "Store_ID",
    "Supplier_ID",
    "Date_ID",
    "Quantity",
    "Total_Amount",
    "Revenue",
];

/// Dimensions derived from the product master file
#[derive(Debug, Clone)]
pub struct ProductDimensions {
    pub products: Relation,
    pub stores: Relation,
    pub suppliers: Relation,
}

/// Integer view that also accepts whole floats written as text ("3.0")
fn integer(value: &Value) -> Value {
    value
        .as_i64()
        .or_else(|| value.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
        .map(Value::Integer)
        .unwrap_or(Value::Null)
}

fn decimal(value: &Value) -> Value {
    value.as_f64().map(Value::Decimal).unwrap_or(Value::Null)
}

fn text(value: &Value) -> Value {
    match value {
        Value::Null => Value::Null,
        Value::Text(_) => value.clone(),
        other => Value::Text(other.to_string()),
    }
}

/// Upper-cased first character, or `default` when missing
fn initial(value: &Value, default: &str) -> Value {
    let first = value
        .as_text()
        .and_then(|s| s.trim().chars().next())
        .map(|c| c.to_uppercase().collect::<String>());
    Value::Text(first.unwrap_or_else(|| default.to_string()))
}

fn log_dropped(entity: &str, before: usize, after: usize) {
    if before > after {
        tracing::warn!("Dropped {} {} rows with missing or malformed values", before - after, entity);
    }
}

pub fn transform_customers(raw: &Relation) -> Result<Relation, EtlError> {
    let id = raw.column_index("Customer_ID")?;
    let gender = raw.column_index("Gender")?;
    let age = raw.column_index("Age")?;
    let occupation = raw.column_index("Occupation")?;
    let city = raw.column_index("City_Category")?;
    let stay = raw.column_index("Stay_In_Current_City_Years")?;
    let marital = raw.column_index("Marital_Status")?;

    let customers = raw.map_rows(&CUSTOMER_COLUMNS, |row| {
        let customer_id = text(row.value(id));
        if customer_id.is_null() {
            return Ok(None);
        }
        let or_zero = |v: Value| if v.is_null() { Value::Integer(0) } else { v };

        Ok(Some(vec![
            customer_id,
            initial(row.value(gender), "U"),
            text(row.value(age)),
            or_zero(integer(row.value(occupation))),
            initial(row.value(city), "Z"),
            text(row.value(stay)),
            or_zero(integer(row.value(marital))),
        ]))
    })?;

    log_dropped("customer", raw.len(), customers.len());
    tracing::info!("Transformed {} customer records", customers.len());
    Ok(customers)
}

pub fn transform_products(raw: &Relation) -> Result<ProductDimensions, EtlError> {
    let stores = raw
        .project(&["storeID", "storeName"])?
        .rename(&[("storeID", "Store_ID"), ("storeName", "Store_Name")])?
        .map_rows(&["Store_ID", "Store_Name"], |row| {
            Ok(Some(vec![integer(row.value(0)), text(row.value(1))]))
        })?
        .drop_nulls()
        .distinct();

    let suppliers = raw
        .project(&["supplierID", "supplierName"])?
        .rename(&[("supplierID", "Supplier_ID"), ("supplierName", "Supplier_Name")])?
        .map_rows(&["Supplier_ID", "Supplier_Name"], |row| {
            Ok(Some(vec![integer(row.value(0)), text(row.value(1))]))
        })?
        .drop_nulls()
        .distinct();

    let products = raw
        .project(&["Product_ID", "Product_Category", "price$", "storeID", "supplierID"])?
        .map_rows(&PRODUCT_COLUMNS, |row| {
            Ok(Some(vec![
                text(row.value(0)),
                text(row.value(1)),
                decimal(row.value(2)),
                integer(row.value(3)),
                integer(row.value(4)),
            ]))
        })?
        .drop_nulls();

    log_dropped("product", raw.len(), products.len());
    tracing::info!(
        "Transformed {} products, {} stores, {} suppliers",
        products.len(),
        stores.len(),
        suppliers.len()
    );

    Ok(ProductDimensions {
        products,
        stores,
        suppliers,
    })
}

fn season(month: u32) -> &'static str {
    match month {
        12 | 1 | 2 => "Winter",
        3..=5 => "Spring",
        6..=8 => "Summer",
        _ => "Fall",
    }
}

/// One row per calendar day in `[start, end]`. Date_ID is the `YYYYMMDD`
/// integer, so keys are stable across reruns with different ranges.
pub fn generate_date_dimension(start: NaiveDate, end: NaiveDate) -> Result<Relation, EtlError> {
    if start > end {
        return Err(EtlError::InvalidConfiguration(format!(
            "Date dimension start {} is after end {}",
            start, end
        )));
    }

    let rows: Vec<Vec<Value>> = start
        .iter_days()
        .take_while(|d| *d <= end)
        .map(|date| {
            let weekend = matches!(date.weekday(), Weekday::Sat | Weekday::Sun);
            vec![
                Value::Integer(date_key(date)),
                Value::Date(date),
                Value::Integer(date.day() as i64),
                Value::Integer(date.month() as i64),
                Value::text(date.format("%B").to_string()),
                Value::text(format!("Q{}", (date.month() - 1) / 3 + 1)),
                Value::Integer(date.year() as i64),
                Value::text(if weekend { "Weekend" } else { "Weekday" }),
                Value::text(season(date.month())),
            ]
        })
        .collect();

    tracing::info!("Generated {} date records from {} to {}", rows.len(), start, end);
    Relation::from_rows(&DATE_COLUMNS, rows)
}

/// Type the raw transaction columns; rows with missing or unparsable
/// values are dropped
pub fn prepare_transactions(raw: &Relation) -> Result<Relation, EtlError> {
    let indices = TRANSACTION_COLUMNS
        .iter()
        .map(|c| raw.column_index(c))
        .collect::<Result<Vec<_>, _>>()?;

    let prepared = raw
        .map_rows(&TRANSACTION_COLUMNS, |row| {
            Ok(Some(vec![
                integer(row.value(indices[0])),
                text(row.value(indices[1])),
                text(row.value(indices[2])),
                integer(row.value(indices[3])),
                row.value(indices[4]).as_date().map(Value::Date).unwrap_or(Value::Null),
            ]))
        })?
        .drop_nulls();

    log_dropped("transaction", raw.len(), prepared.len());
    Ok(prepared)
}

/// Build the sales fact: transactions hash-joined with products (for store,
/// supplier and price) and with the date dimension (for Date_ID).
pub fn build_sales_fact(
    engine: &HybridJoinEngine,
    transactions: &Relation,
    products: &Relation,
    dates: &Relation,
) -> Result<Relation, EtlError> {
    let product_lookup = products.project(&["Product_ID", "Store_ID", "Supplier_ID", "Price"])?;
    let with_products = engine.join(
        transactions,
        &product_lookup,
        &JoinKey::on("Product_ID", "Product_ID"),
        JoinStrategy::Auto,
    )?;

    let date_lookup = dates.project(&["Date_ID", "Full_Date"])?;
    let with_dates = engine.join(
        &with_products,
        &date_lookup,
        &JoinKey::on("date", "Full_Date"),
        JoinStrategy::Auto,
    )?;

    let source = [
        "orderID",
        "Customer_ID",
        "Product_ID",
        "Store_ID",
        "Supplier_ID",
        "Date_ID",
        "quantity",
        "Price",
    ]
    .iter()
    .map(|c| with_dates.column_index(c))
    .collect::<Result<Vec<_>, _>>()?;

    let fact = with_dates
        .map_rows(&FACT_COLUMNS, |row| {
            let quantity = row.value(source[6]);
            let total = match (quantity.as_f64(), row.value(source[7]).as_f64()) {
                // cents, matching the warehouse column scale
                (Some(q), Some(p)) => Value::Decimal((q * p * 100.0).round() / 100.0),
                _ => Value::Null,
            };
            Ok(Some(vec![
                row.value(source[0]).clone(),
                row.value(source[1]).clone(),
                row.value(source[2]).clone(),
                row.value(source[3]).clone(),
                row.value(source[4]).clone(),
                row.value(source[5]).clone(),
                quantity.clone(),
                total.clone(),
                total,
            ]))
        })?
        .distinct()
        .drop_nulls();

    tracing::info!("Prepared {} fact records", fact.len());
    Ok(fact)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_transform_customers_applies_defaults() {
        let raw = Relation::from_rows(
            &[
                "Customer_ID",
                "Gender",
                "Age",
                "Occupation",
                "City_Category",
                "Stay_In_Current_City_Years",
                "Marital_Status",
            ],
            vec![
                vec!["1000001".into(), "female".into(), "0-17".into(), "10".into(), "a".into(), "2".into(), "0".into()],
                vec!["1000002".into(), Value::Null, "55+".into(), Value::Null, Value::Null, "4+".into(), Value::Null],
                vec![Value::Null, "M".into(), "26-35".into(), "1".into(), "B".into(), "1".into(), "1".into()],
            ],
        )
        .unwrap();

        let customers = transform_customers(&raw).unwrap();
        assert_eq!(customers.len(), 2);

        let first = customers.row(0).unwrap();
        assert_eq!(first.get("Gender"), Some(&Value::text("F")));
        assert_eq!(first.get("City_Category"), Some(&Value::text("A")));
        assert_eq!(first.get("Occupation"), Some(&Value::Integer(10)));

        let second = customers.row(1).unwrap();
        assert_eq!(second.get("Gender"), Some(&Value::text("U")));
        assert_eq!(second.get("City_Category"), Some(&Value::text("Z")));
        assert_eq!(second.get("Occupation"), Some(&Value::Integer(0)));
        assert_eq!(second.get("Marital_Status"), Some(&Value::Integer(0)));
    }

    #[test]
    fn test_transform_products_splits_dimensions() {
        let raw = Relation::from_rows(
            &["Product_ID", "Product_Category", "price$", "storeID", "storeName", "supplierID", "supplierName"],
            vec![
                vec!["P1".into(), "Toys".into(), "9.99".into(), "1".into(), "North".into(), "7".into(), "Acme".into()],
                vec!["P2".into(), "Food".into(), "2.50".into(), "1".into(), "North".into(), "8".into(), "Globex".into()],
                vec!["P3".into(), "Food".into(), "n/a".into(), "2.0".into(), "South".into(), "8".into(), "Globex".into()],
            ],
        )
        .unwrap();

        let dims = transform_products(&raw).unwrap();
        assert_eq!(dims.stores.len(), 2);
        assert_eq!(dims.suppliers.len(), 2);
        assert_eq!(dims.products.len(), 2);
        assert_eq!(dims.products.columns(), &PRODUCT_COLUMNS);
        assert_eq!(dims.products.rows()[0][2], Value::Decimal(9.99));
        assert_eq!(dims.stores.rows()[1][0], Value::Integer(2));
    }

    #[test]
    fn test_date_dimension_attributes() {
        let dates = generate_date_dimension(date(2016, 12, 30), date(2017, 1, 2)).unwrap();
        assert_eq!(dates.len(), 4);

        let first = dates.row(0).unwrap();
        assert_eq!(first.get("Date_ID"), Some(&Value::Integer(20161230)));
        assert_eq!(first.get("Month_Name"), Some(&Value::text("December")));
        assert_eq!(first.get("Quarter"), Some(&Value::text("Q4")));
        assert_eq!(first.get("Season"), Some(&Value::text("Winter")));
        assert_eq!(first.get("Weekday_Weekend"), Some(&Value::text("Weekday")));

        // 2016-12-31 was a Saturday
        assert_eq!(dates.row(1).unwrap().get("Weekday_Weekend"), Some(&Value::text("Weekend")));
        assert_eq!(dates.row(3).unwrap().get("Quarter"), Some(&Value::text("Q1")));

        assert_eq!(season(4), "Spring");
        assert_eq!(season(7), "Summer");
        assert_eq!(season(10), "Fall");

        assert!(matches!(
            generate_date_dimension(date(2017, 1, 2), date(2017, 1, 1)),
            Err(EtlError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_build_sales_fact() {
        let engine = HybridJoinEngine::default();
        let raw = Relation::from_rows(
            &TRANSACTION_COLUMNS,
            vec![
                vec!["1".into(), "C1".into(), "P1".into(), "2".into(), "2017-01-01".into()],
                vec!["2".into(), "C2".into(), "P1".into(), "1".into(), "2017-01-02 00:00:00".into()],
                vec!["3".into(), "C1".into(), "P2".into(), "1".into(), "2017-01-01".into()],
                vec!["4".into(), "C1".into(), "P1".into(), "1".into(), "2030-01-01".into()],
                vec!["5".into(), "C1".into(), "P1".into(), Value::Null, "2017-01-01".into()],
            ],
        )
        .unwrap();
        let transactions = prepare_transactions(&raw).unwrap();
        assert_eq!(transactions.len(), 4);

        let products = Relation::from_rows(
            &PRODUCT_COLUMNS,
            vec![vec!["P1".into(), "Toys".into(), 9.99.into(), 1i64.into(), 7i64.into()]],
        )
        .unwrap();
        let dates = generate_date_dimension(date(2017, 1, 1), date(2017, 12, 31)).unwrap();

        let fact = build_sales_fact(&engine, &transactions, &products, &dates).unwrap();
        assert_eq!(fact.columns(), &FACT_COLUMNS);
        // P2 has no product, 2030 is outside the date range
        assert_eq!(fact.len(), 2);

        let first = fact.row(0).unwrap();
        assert_eq!(first.get("OrderID"), Some(&Value::Integer(1)));
        assert_eq!(first.get("Date_ID"), Some(&Value::Integer(20170101)));
        assert_eq!(first.get("Total_Amount"), Some(&Value::Decimal(19.98)));
        assert_eq!(first.get("Revenue"), first.get("Total_Amount"));
        assert_eq!(first.get("Store_ID"), Some(&Value::Integer(1)));
    }
}
