// ABOUTME: Column values carried from source to destination
// ABOUTME: Decodes source rows by column kind and encodes values for the destination type

use std::error::Error;
use std::fmt;

use bytes::BytesMut;
use chrono::{NaiveDate, NaiveDateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tokio_postgres::types::{to_sql_checked, IsNull, ToSql, Type};
use tokio_postgres::Row;

use crate::registry::{ColumnKind, ColumnSpec};

/// Canonical text form of a normalized timestamp column.
pub const CANONICAL_DATE_FORMAT: &str = "%Y/%m/%d";

/// A single column value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Numeric(Decimal),
    Text(String),
    Timestamp(NaiveDateTime),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// The timestamp this value denotes, accepting canonical date text.
    pub fn as_timestamp(&self) -> Option<NaiveDateTime> {
        match self {
            SqlValue::Timestamp(ts) => Some(*ts),
            SqlValue::Text(text) => parse_canonical_date(text)
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0)),
            _ => None,
        }
    }
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlValue::Null => f.write_str("NULL"),
            SqlValue::Bool(v) => write!(f, "{}", v),
            SqlValue::Int(v) => write!(f, "{}", v),
            SqlValue::Numeric(v) => write!(f, "{}", v),
            SqlValue::Text(v) => write!(f, "'{}'", crate::utils::sanitize_identifier(v)),
            SqlValue::Timestamp(v) => write!(f, "{}", v),
        }
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(SqlValue::Null)
    }
}

impl From<bool> for SqlValue {
    fn from(value: bool) -> Self {
        SqlValue::Bool(value)
    }
}

impl From<i32> for SqlValue {
    fn from(value: i32) -> Self {
        SqlValue::Int(value.into())
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        SqlValue::Int(value)
    }
}

impl From<Decimal> for SqlValue {
    fn from(value: Decimal) -> Self {
        SqlValue::Numeric(value)
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        SqlValue::Text(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        SqlValue::Text(value)
    }
}

impl From<NaiveDateTime> for SqlValue {
    fn from(value: NaiveDateTime) -> Self {
        SqlValue::Timestamp(value)
    }
}

fn parse_canonical_date(text: &str) -> Result<NaiveDate, chrono::ParseError> {
    NaiveDate::parse_from_str(text, CANONICAL_DATE_FORMAT)
}

fn mismatch(value: &SqlValue, ty: &Type) -> Box<dyn Error + Sync + Send> {
    format!("cannot encode {:?} as PostgreSQL type {}", value, ty).into()
}

impl ToSql for SqlValue {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, Box<dyn Error + Sync + Send>> {
        match self {
            SqlValue::Null => Ok(IsNull::Yes),
            SqlValue::Bool(v) if *ty == Type::BOOL => v.to_sql(ty, out),
            SqlValue::Int(v) => {
                if *ty == Type::INT2 {
                    i16::try_from(*v)?.to_sql(ty, out)
                } else if *ty == Type::INT4 {
                    i32::try_from(*v)?.to_sql(ty, out)
                } else if *ty == Type::INT8 {
                    v.to_sql(ty, out)
                } else if *ty == Type::NUMERIC {
                    Decimal::from(*v).to_sql(ty, out)
                } else {
                    Err(mismatch(self, ty))
                }
            }
            SqlValue::Numeric(v) if *ty == Type::NUMERIC => v.to_sql(ty, out),
            SqlValue::Text(v) => {
                if *ty == Type::TIMESTAMP || *ty == Type::TIMESTAMPTZ || *ty == Type::DATE {
                    let date = parse_canonical_date(v)?;
                    let midnight = date.and_hms_opt(0, 0, 0).ok_or_else(|| mismatch(self, ty))?;
                    if *ty == Type::TIMESTAMP {
                        midnight.to_sql(ty, out)
                    } else if *ty == Type::TIMESTAMPTZ {
                        Utc.from_utc_datetime(&midnight).to_sql(ty, out)
                    } else {
                        date.to_sql(ty, out)
                    }
                } else if <String as ToSql>::accepts(ty) {
                    v.to_sql(ty, out)
                } else {
                    Err(mismatch(self, ty))
                }
            }
            SqlValue::Timestamp(v) => {
                if *ty == Type::TIMESTAMP {
                    v.to_sql(ty, out)
                } else if *ty == Type::TIMESTAMPTZ {
                    Utc.from_utc_datetime(v).to_sql(ty, out)
                } else if *ty == Type::DATE {
                    v.date().to_sql(ty, out)
                } else {
                    Err(mismatch(self, ty))
                }
            }
            _ => Err(mismatch(self, ty)),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

/// One extracted row, in the owning table's column order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeltaRow {
    pub values: Vec<SqlValue>,
}

impl DeltaRow {
    pub fn new(values: Vec<SqlValue>) -> Self {
        Self { values }
    }

    /// Leading column value, used to identify the row in logs.
    pub fn key(&self) -> Option<&SqlValue> {
        self.values.first()
    }

    /// Replace the value at `index` with its canonical `YYYY/MM/DD` text.
    /// Values that are not timestamps are left unchanged.
    pub fn normalize_date(mut self, index: usize) -> Self {
        if let Some(SqlValue::Timestamp(ts)) = self.values.get(index) {
            let text = ts.format(CANONICAL_DATE_FORMAT).to_string();
            self.values[index] = SqlValue::Text(text);
        }
        self
    }

    /// Borrow the values as query parameters.
    pub fn params(&self) -> Vec<&(dyn ToSql + Sync)> {
        self.values
            .iter()
            .map(|v| v as &(dyn ToSql + Sync))
            .collect()
    }
}

/// Decode a source row according to the declared column kinds.
///
/// Each kind tolerates the common representations of the same data, e.g.
/// `int4` and `int8` for integers or `timestamptz` and `date` for timestamps.
pub fn decode_row(row: &Row, columns: &[ColumnSpec]) -> Result<Vec<SqlValue>, tokio_postgres::Error> {
    columns
        .iter()
        .enumerate()
        .map(|(idx, column)| decode_column(row, idx, column.kind))
        .collect()
}

fn decode_column(row: &Row, idx: usize, kind: ColumnKind) -> Result<SqlValue, tokio_postgres::Error> {
    let value = match kind {
        ColumnKind::Integer => match row.try_get::<_, Option<i32>>(idx) {
            Ok(v) => v.into(),
            Err(_) => match row.try_get::<_, Option<i64>>(idx) {
                Ok(v) => v.into(),
                Err(_) => row.try_get::<_, Option<i16>>(idx)?.map(i64::from).into(),
            },
        },
        ColumnKind::Text => row.try_get::<_, Option<String>>(idx)?.into(),
        ColumnKind::Boolean => row.try_get::<_, Option<bool>>(idx)?.into(),
        ColumnKind::Decimal => match row.try_get::<_, Option<Decimal>>(idx) {
            Ok(v) => v.into(),
            Err(_) => row
                .try_get::<_, Option<f64>>(idx)?
                .and_then(Decimal::from_f64_retain)
                .into(),
        },
        ColumnKind::Timestamp => match row.try_get::<_, Option<NaiveDateTime>>(idx) {
            Ok(v) => v.into(),
            Err(_) => match row.try_get::<_, Option<chrono::DateTime<Utc>>>(idx) {
                Ok(v) => v.map(|ts| ts.naive_utc()).into(),
                Err(_) => row
                    .try_get::<_, Option<NaiveDate>>(idx)?
                    .and_then(|d| d.and_hms_opt(0, 0, 0))
                    .into(),
            },
        },
    };
    Ok(value)
}
