use chrono::{Datelike, NaiveDate};
use std::fmt;

use super::schema::ColumnType;

pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// A single scalar cell
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Text(String),
    Integer(i64),
    Decimal(f64),
    Date(NaiveDate),
}

/// Hashable form of a non-null value, used for equi-join matching
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyValue {
    Text(String),
    Integer(i64),
    Decimal(u64),
    Date(NaiveDate),
}

impl Value {
    pub fn text(s: impl Into<String>) -> Self {
        Value::Text(s.into())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Integer view; text is parsed, whole decimals are accepted
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            Value::Decimal(d) if d.fract() == 0.0 && d.is_finite() => Some(*d as i64),
            Value::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Decimal view; drivers hand DECIMAL aggregates back as text
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Decimal(d) => Some(*d),
            Value::Integer(i) => Some(*i as f64),
            Value::Text(s) => s.trim().parse().ok().filter(|d: &f64| d.is_finite()),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            Value::Date(d) => Some(*d),
            Value::Text(s) => parse_date(s),
            _ => None,
        }
    }

    /// Join key for this value. Nulls and NaN never match anything.
    pub fn key(&self) -> Option<KeyValue> {
        match self {
            Value::Null => None,
            Value::Text(s) => Some(KeyValue::Text(s.clone())),
            Value::Integer(i) => Some(KeyValue::Integer(*i)),
            Value::Decimal(d) if d.is_nan() => None,
            // -0.0 and 0.0 compare equal, so they must hash equal
            Value::Decimal(d) if *d == 0.0 => Some(KeyValue::Decimal(0.0f64.to_bits())),
            Value::Decimal(d) => Some(KeyValue::Decimal(d.to_bits())),
            Value::Date(d) => Some(KeyValue::Date(*d)),
        }
    }

    /// Equality under join semantics
    pub fn join_eq(&self, other: &Value) -> bool {
        match (self.key(), other.key()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }

    /// Convert to the declared column type. Nulls pass through; NOT NULL is
    /// enforced by the caller, which knows the column definition.
    pub fn coerce(&self, target: ColumnType) -> Result<Value, String> {
        match (self, target) {
            (Value::Null, _) => Ok(Value::Null),

            (Value::Text(_), ColumnType::Text) => Ok(self.clone()),
            (Value::Integer(i), ColumnType::Text) => Ok(Value::Text(i.to_string())),
            (Value::Decimal(d), ColumnType::Text) => Ok(Value::Text(d.to_string())),
            (Value::Date(d), ColumnType::Text) => Ok(Value::Text(d.format(DATE_FORMAT).to_string())),

            (Value::Integer(_), ColumnType::Integer) => Ok(self.clone()),
            (Value::Decimal(d), ColumnType::Integer) => {
                if !d.is_finite() || d.fract() != 0.0 {
                    Err(format!("cannot store {} in an integer column", d))
                } else if *d < I64_LOWER || *d >= I64_UPPER {
                    Err(format!("malformed integer {}: out of range", d))
                } else {
                    Ok(Value::Integer(*d as i64))
                }
            }
            (Value::Text(s), ColumnType::Integer) => s
                .trim()
                .parse::<i64>()
                .map(Value::Integer)
                .map_err(|_| format!("malformed integer '{}'", s)),

            (Value::Decimal(d), ColumnType::Decimal) => {
                if d.is_finite() {
                    Ok(self.clone())
                } else {
                    Err(format!("non-finite decimal {}", d))
                }
            }
            (Value::Integer(i), ColumnType::Decimal) => Ok(Value::Decimal(*i as f64)),
            (Value::Text(s), ColumnType::Decimal) => match s.trim().parse::<f64>() {
                Ok(d) if d.is_finite() => Ok(Value::Decimal(d)),
                _ => Err(format!("malformed decimal '{}'", s)),
            },

            (Value::Date(d), ColumnType::Date) => storable_date(*d),
            (Value::Text(s), ColumnType::Date) => parse_date(s)
                .ok_or_else(|| format!("malformed date '{}'", s))
                .and_then(storable_date),

            (other, target) => Err(format!(
                "cannot convert {} to {}",
                other.type_name(),
                target.as_str()
            )),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Text(_) => "text",
            Value::Integer(_) => "integer",
            Value::Decimal(_) => "decimal",
            Value::Date(_) => "date",
        }
    }
}

// i64::MIN is exact in f64; i64::MAX rounds up to 2^63
const I64_LOWER: f64 = -9_223_372_036_854_775_808.0;
const I64_UPPER: f64 = 9_223_372_036_854_775_808.0;

/// Every warehouse DATE type holds four-digit years
fn storable_date(date: NaiveDate) -> Result<Value, String> {
    if (0..=9999).contains(&date.year()) {
        Ok(Value::Date(date))
    } else {
        Err(format!("date {} out of range", date))
    }
}

/// Accepts `YYYY-MM-DD`, optionally followed by a time part
pub fn parse_date(s: &str) -> Option<NaiveDate> {
    let s = s.trim();
    let date_part = s.split(|c| c == ' ' || c == 'T').next().unwrap_or(s);
    NaiveDate::parse_from_str(date_part, DATE_FORMAT).ok()
}

/// Integer surrogate key for a calendar day, e.g. 2024-03-09 -> 20240309
pub fn date_key(date: NaiveDate) -> i64 {
    date.year() as i64 * 10_000 + date.month() as i64 * 100 + date.day() as i64
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Text(s) => write!(f, "{}", s),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Decimal(d) => write!(f, "{}", d),
            Value::Date(d) => write!(f, "{}", d.format(DATE_FORMAT)),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<f64> for Value {
    fn from(d: f64) -> Self {
        Value::Decimal(d)
    }
}

impl From<NaiveDate> for Value {
    fn from(d: NaiveDate) -> Self {
        Value::Date(d)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nulls_never_join() {
        assert!(!Value::Null.join_eq(&Value::Null));
        assert!(!Value::Decimal(f64::NAN).join_eq(&Value::Decimal(f64::NAN)));
        assert!(Value::text("P1").join_eq(&Value::text("P1")));
        assert!(Value::Decimal(0.0).join_eq(&Value::Decimal(-0.0)));
    }

    #[test]
    fn test_join_keys_are_type_strict() {
        assert!(!Value::Integer(1).join_eq(&Value::text("1")));
        assert!(!Value::Integer(1).join_eq(&Value::Decimal(1.0)));
    }

    #[test]
    fn test_coerce_text_to_typed_columns() {
        assert_eq!(Value::text(" 42 ").coerce(ColumnType::Integer), Ok(Value::Integer(42)));
        assert_eq!(Value::text("19.99").coerce(ColumnType::Decimal), Ok(Value::Decimal(19.99)));
        assert_eq!(
            Value::text("2017-03-05").coerce(ColumnType::Date),
            Ok(Value::Date(NaiveDate::from_ymd_opt(2017, 3, 5).unwrap()))
        );
        assert_eq!(Value::Integer(7).coerce(ColumnType::Text), Ok(Value::text("7")));
        assert_eq!(Value::Null.coerce(ColumnType::Decimal), Ok(Value::Null));
    }

    #[test]
    fn test_coerce_rejects_malformed_values() {
        let err = Value::text("12,5x").coerce(ColumnType::Decimal).unwrap_err();
        assert!(err.contains("malformed decimal"));
        assert!(Value::text("NaN").coerce(ColumnType::Decimal).is_err());
        assert!(Value::Decimal(2.5).coerce(ColumnType::Integer).is_err());
        assert!(Value::Integer(3).coerce(ColumnType::Date).is_err());
        assert!(Value::text("2017-13-40").coerce(ColumnType::Date).is_err());
    }

    #[test]
    fn test_coerce_rejects_out_of_range_values() {
        let err = Value::Decimal(1e20).coerce(ColumnType::Integer).unwrap_err();
        assert!(err.contains("malformed integer"));
        assert!(Value::Decimal(-1e19).coerce(ColumnType::Integer).is_err());
        assert_eq!(
            Value::Decimal(-9_223_372_036_854_775_808.0).coerce(ColumnType::Integer),
            Ok(Value::Integer(i64::MIN))
        );

        let far = NaiveDate::from_ymd_opt(70000, 1, 1).unwrap();
        assert!(Value::Date(far).coerce(ColumnType::Date).unwrap_err().contains("out of range"));
        let before = NaiveDate::from_ymd_opt(-1, 6, 1).unwrap();
        assert!(Value::Date(before).coerce(ColumnType::Date).is_err());
        assert!(Value::text("12345-01-01").coerce(ColumnType::Date).is_err());
        assert!(Value::text("9999-12-31").coerce(ColumnType::Date).is_ok());
    }

    #[test]
    fn test_parse_date_accepts_timestamp_suffix() {
        let expected = NaiveDate::from_ymd_opt(2019, 7, 1);
        assert_eq!(parse_date("2019-07-01"), expected);
        assert_eq!(parse_date("2019-07-01 00:00:00"), expected);
        assert_eq!(parse_date("2019-07-01T10:30:00"), expected);
        assert_eq!(parse_date("07/01/2019"), None);
    }

    #[test]
    fn test_date_key() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 9).unwrap();
        assert_eq!(date_key(date), 20240309);
    }

    #[test]
    fn test_numeric_views() {
        assert_eq!(Value::text("1234.50").as_f64(), Some(1234.5));
        assert_eq!(Value::Decimal(3.0).as_i64(), Some(3));
        assert_eq!(Value::Decimal(3.5).as_i64(), None);
        assert_eq!(Value::Null.as_f64(), None);
    }
}
