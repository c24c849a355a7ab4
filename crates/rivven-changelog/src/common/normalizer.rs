//! Raw value and default-expression normalization
//!
//! Captured values arrive in three shapes: native driver values (SQL Server
//! change tables, snapshot reads), literal bodies mined from redo SQL (quotes
//! stripped, `''` escapes still present), and opaque redo expressions such as
//! `TO_DATE('2020-01-01 00:00:00', 'YYYY-MM-DD HH24:MI:SS')`. The
//! [`ValueNormalizer`] turns all of them into JSON values driven by the
//! column's type family.
//!
//! | Family      | JSON output                               |
//! |-------------|-------------------------------------------|
//! | Integer     | number                                    |
//! | Decimal     | string (precision preserved)              |
//! | Float       | number (`NaN`/`Inf` → null)               |
//! | Boolean     | bool                                      |
//! | Text        | string                                    |
//! | Binary      | base64 string                             |
//! | Date/Time   | ISO-8601 string                           |
//! | Uuid        | lowercase hyphenated string               |

use crate::common::{CdcError, Column, Result};
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime};
use serde_json::Value;
use tracing::{trace, warn};

/// A captured column value before type normalization
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    /// Native text from the driver
    Text(String),
    /// Literal body mined from a redo statement (`''` escapes preserved)
    Literal(String),
    /// Opaque expression mined from a redo statement, verbatim
    Expression(String),
    Binary(Vec<u8>),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Timestamp(NaiveDateTime),
}

impl RawValue {
    /// Textual payload of text-like variants
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) | Self::Literal(s) | Self::Expression(s) => Some(s),
            _ => None,
        }
    }
}

/// Type family of a column, derived from its backend type name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnKind {
    Integer,
    Decimal,
    Float,
    Boolean,
    Text,
    Binary,
    Date,
    Time,
    Timestamp,
    TimestampTz,
    Uuid,
    Other,
}

impl ColumnKind {
    /// Classify a SQL Server or Oracle type name.
    ///
    /// Length/precision suffixes are ignored: `NVARCHAR(50)` is text,
    /// `TIMESTAMP(6) WITH TIME ZONE` is a zoned timestamp.
    pub fn from_type_name(type_name: &str) -> Self {
        let lower = type_name.trim().to_ascii_lowercase();
        if lower.contains("with time zone") || lower.contains("with local time zone") {
            return Self::TimestampTz;
        }
        let base = match lower.find('(') {
            Some(idx) => lower[..idx].trim_end(),
            None => lower.as_str(),
        };

        match base {
            "tinyint" | "smallint" | "int" | "integer" | "bigint" => Self::Integer,
            "decimal" | "numeric" | "number" | "money" | "smallmoney" => Self::Decimal,
            "float" | "real" | "binary_float" | "binary_double" | "double precision" => {
                Self::Float
            }
            "bit" | "boolean" => Self::Boolean,
            "char" | "varchar" | "nchar" | "nvarchar" | "text" | "ntext" | "varchar2"
            | "nvarchar2" | "clob" | "nclob" | "xml" | "sysname" | "long" => Self::Text,
            "binary" | "varbinary" | "image" | "raw" | "long raw" | "blob" | "rowversion" => {
                Self::Binary
            }
            "date" => Self::Date,
            "time" => Self::Time,
            "datetime" | "datetime2" | "smalldatetime" | "timestamp" => Self::Timestamp,
            "datetimeoffset" => Self::TimestampTz,
            "uniqueidentifier" => Self::Uuid,
            _ => Self::Other,
        }
    }
}

/// Converts raw captured values into typed JSON values.
#[derive(Debug, Clone, Default)]
pub struct ValueNormalizer;

impl ValueNormalizer {
    pub fn new() -> Self {
        Self
    }

    /// Normalize one value for `column`; `None` (unknown / NULL) becomes JSON null.
    pub fn normalize(&self, column: &Column, value: Option<&RawValue>) -> Result<Value> {
        let Some(value) = value else {
            return Ok(Value::Null);
        };
        let kind = ColumnKind::from_type_name(&column.type_name);

        match value {
            RawValue::Text(s) => text_value(column, kind, s),
            RawValue::Literal(s) => text_value(column, kind, &unescape_quotes(s)),
            RawValue::Expression(expr) => match unwrap_expression(expr)? {
                Unwrapped::Text(s) => text_value(column, kind, &s),
                Unwrapped::Bytes(b) => Ok(binary_value(kind, &b)),
                Unwrapped::Null => Ok(Value::Null),
            },
            RawValue::Binary(b) => Ok(binary_value(kind, b)),
            RawValue::Integer(i) => Ok(match kind {
                ColumnKind::Boolean => Value::Bool(*i != 0),
                ColumnKind::Decimal => Value::String(i.to_string()),
                _ => Value::Number((*i).into()),
            }),
            RawValue::Float(f) => Ok(match kind {
                ColumnKind::Decimal => Value::String(f.to_string()),
                _ => float_value(*f),
            }),
            RawValue::Boolean(b) => Ok(match kind {
                ColumnKind::Integer => Value::Number(u8::from(*b).into()),
                _ => Value::Bool(*b),
            }),
            RawValue::Timestamp(ts) => Ok(Value::String(match kind {
                ColumnKind::Date => ts.format("%Y-%m-%d").to_string(),
                ColumnKind::Time => ts.format("%H:%M:%S%.f").to_string(),
                _ => ts.format("%Y-%m-%dT%H:%M:%S%.f").to_string(),
            })),
        }
    }

    /// Static default of a column, if its catalog expression has one.
    ///
    /// Returns `Some(Value::Null)` for an explicit `NULL` default and `None`
    /// for function defaults (`getdate()`, `newid()`, `SYSDATE`) that have no
    /// value outside the row being inserted.
    pub fn parse_default_value(&self, column: &Column) -> Option<Value> {
        let raw = column.default_value.as_deref()?;
        let expr = strip_parens(raw.trim());

        if expr.is_empty() {
            return None;
        }
        if expr.eq_ignore_ascii_case("null") {
            return Some(Value::Null);
        }

        let raw_value = if let Some(body) = quoted_body(expr) {
            RawValue::Literal(body.to_string())
        } else if expr.contains('(') || expr.starts_with(|c: char| c.is_ascii_alphabetic()) {
            trace!("No static default for column '{}': {}", column.name, raw);
            return None;
        } else {
            RawValue::Expression(expr.to_string())
        };

        match self.normalize(column, Some(&raw_value)) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(
                    "Cannot interpret default '{}' of column '{}': {}",
                    raw, column.name, e
                );
                None
            }
        }
    }
}

fn text_value(column: &Column, kind: ColumnKind, text: &str) -> Result<Value> {
    let invalid = |what: &str| {
        CdcError::schema(format!(
            "Invalid {} value '{}' for column '{}' ({})",
            what, text, column.name, column.type_name
        ))
    };

    match kind {
        ColumnKind::Integer => text
            .trim()
            .parse::<i64>()
            .map(|i| Value::Number(i.into()))
            .map_err(|_| invalid("integer")),
        ColumnKind::Decimal => {
            let trimmed = text.trim();
            // Oracle emits bare numbers like `.5` and `-1E+10`
            trimmed
                .parse::<f64>()
                .map(|_| Value::String(trimmed.to_string()))
                .map_err(|_| invalid("decimal"))
        }
        ColumnKind::Float => text
            .trim()
            .parse::<f64>()
            .map(float_value)
            .map_err(|_| invalid("float")),
        ColumnKind::Boolean => match text.trim().to_ascii_lowercase().as_str() {
            "1" | "true" => Ok(Value::Bool(true)),
            "0" | "false" => Ok(Value::Bool(false)),
            _ => Err(invalid("boolean")),
        },
        ColumnKind::Binary => hex::decode(text.trim())
            .map(|b| Value::String(STANDARD.encode(b)))
            .map_err(|_| invalid("binary")),
        ColumnKind::Date => parse_datetime(text)
            .map(|ts| Value::String(ts.format("%Y-%m-%d").to_string()))
            .ok_or_else(|| invalid("date")),
        ColumnKind::Time => NaiveTime::parse_from_str(text.trim(), "%H:%M:%S%.f")
            .map(|t| Value::String(t.format("%H:%M:%S%.f").to_string()))
            .map_err(|_| invalid("time")),
        ColumnKind::Timestamp => parse_datetime(text)
            .map(|ts| Value::String(ts.format("%Y-%m-%dT%H:%M:%S%.f").to_string()))
            .ok_or_else(|| invalid("timestamp")),
        ColumnKind::TimestampTz => parse_zoned(text)
            .map(|ts| Value::String(ts.to_rfc3339()))
            .ok_or_else(|| invalid("zoned timestamp")),
        ColumnKind::Uuid => uuid::Uuid::parse_str(text.trim())
            .map(|u| Value::String(u.to_string()))
            .map_err(|_| invalid("uniqueidentifier")),
        ColumnKind::Text | ColumnKind::Other => Ok(Value::String(text.to_string())),
    }
}

fn binary_value(kind: ColumnKind, bytes: &[u8]) -> Value {
    match kind {
        ColumnKind::Uuid if bytes.len() == 16 => uuid::Uuid::from_slice_le(bytes)
            .map(|u| Value::String(u.to_string()))
            .unwrap_or_else(|_| Value::String(STANDARD.encode(bytes))),
        _ => Value::String(STANDARD.encode(bytes)),
    }
}

fn float_value(f: f64) -> Value {
    if f.is_nan() || f.is_infinite() {
        return Value::Null;
    }
    serde_json::Number::from_f64(f)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%d-%b-%y %I.%M.%S%.f %p",
];

fn parse_datetime(text: &str) -> Option<NaiveDateTime> {
    // TO_TIMESTAMP('2020-02-01 00:00:00.') carries a bare trailing dot
    let text = text.trim().trim_end_matches('.');
    DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(text, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

fn parse_zoned(text: &str) -> Option<DateTime<chrono::FixedOffset>> {
    let text = text.trim();
    DateTime::parse_from_rfc3339(text)
        .ok()
        .or_else(|| DateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f %:z").ok())
}

/// `Bob''s dog` → `Bob's dog`
pub fn unescape_quotes(text: &str) -> String {
    text.replace("''", "'")
}

fn strip_parens(mut expr: &str) -> &str {
    while expr.starts_with('(') && expr.ends_with(')') && encloses(expr) {
        expr = expr[1..expr.len() - 1].trim();
    }
    expr
}

/// Whether the opening paren at index 0 closes at the last character.
fn encloses(expr: &str) -> bool {
    let mut depth = 0usize;
    let mut in_quote = false;
    let last = expr.len() - 1;
    for (i, c) in expr.char_indices() {
        match c {
            '\'' => in_quote = !in_quote,
            '(' if !in_quote => depth += 1,
            ')' if !in_quote => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return i == last;
                }
            }
            _ => {}
        }
    }
    false
}

/// Body of `'x'` or `N'x'`, escapes preserved
fn quoted_body(expr: &str) -> Option<&str> {
    let expr = expr
        .strip_prefix('N')
        .filter(|rest| rest.starts_with('\''))
        .unwrap_or(expr);
    if expr.len() >= 2 && expr.starts_with('\'') && expr.ends_with('\'') {
        Some(&expr[1..expr.len() - 1])
    } else {
        None
    }
}

enum Unwrapped {
    Text(String),
    Bytes(Vec<u8>),
    Null,
}

/// Unwrap the function wrappers LogMiner emits around typed values.
fn unwrap_expression(expr: &str) -> Result<Unwrapped> {
    let expr = expr.trim();
    let upper = expr.to_ascii_uppercase();

    let call = |name: &str| -> Option<&str> {
        upper
            .strip_prefix(name)
            .filter(|rest| rest.starts_with('(') && rest.ends_with(')'))
            .map(|_| &expr[name.len() + 1..expr.len() - 1])
    };

    if let Some(args) = call("TO_DATE")
        .or_else(|| call("TO_TIMESTAMP"))
        .or_else(|| call("TO_TIMESTAMP_TZ"))
    {
        return first_string_arg(args, expr).map(Unwrapped::Text);
    }
    if let Some(args) = call("UNISTR") {
        let escaped = first_string_arg(args, expr)?;
        return decode_unistr(&escaped, expr).map(Unwrapped::Text);
    }
    if let Some(args) = call("HEXTORAW") {
        let text = first_string_arg(args, expr)?;
        return hex::decode(text.trim())
            .map(Unwrapped::Bytes)
            .map_err(|e| CdcError::schema(format!("Invalid HEXTORAW '{}': {}", expr, e)));
    }
    if upper == "EMPTY_CLOB()" {
        return Ok(Unwrapped::Text(String::new()));
    }
    if upper == "EMPTY_BLOB()" {
        return Ok(Unwrapped::Bytes(Vec::new()));
    }
    if upper == "NULL" {
        return Ok(Unwrapped::Null);
    }

    Ok(Unwrapped::Text(expr.to_string()))
}

/// Unescaped content of the leading `'...'` argument
fn first_string_arg(args: &str, expr: &str) -> Result<String> {
    let args = args.trim_start();
    let mut chars = args.char_indices().peekable();
    if !matches!(chars.next(), Some((_, '\''))) {
        return Err(CdcError::schema(format!(
            "Expected quoted argument in '{}'",
            expr
        )));
    }

    let mut out = String::new();
    while let Some((_, c)) = chars.next() {
        if c == '\'' {
            if matches!(chars.peek(), Some((_, '\''))) {
                chars.next();
                out.push('\'');
                continue;
            }
            return Ok(out);
        }
        out.push(c);
    }

    Err(CdcError::schema(format!(
        "Unterminated quoted argument in '{}'",
        expr
    )))
}

/// Decode UNISTR escapes: `\XXXX` is one UTF-16 code unit, `\\` is a backslash.
fn decode_unistr(escaped: &str, expr: &str) -> Result<String> {
    let invalid = || CdcError::schema(format!("Invalid UNISTR escape in '{}'", expr));

    let mut units: Vec<u16> = Vec::with_capacity(escaped.len());
    let mut chars = escaped.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            let mut buf = [0u16; 2];
            units.extend_from_slice(c.encode_utf16(&mut buf));
            continue;
        }
        let rest = chars.as_str();
        if let Some(after) = rest.strip_prefix('\\') {
            units.push(u16::from(b'\\'));
            chars = after.chars();
            continue;
        }
        let code = rest.get(..4).ok_or_else(invalid)?;
        units.push(u16::from_str_radix(code, 16).map_err(|_| invalid())?);
        chars = rest[4..].chars();
    }

    char::decode_utf16(units)
        .collect::<std::result::Result<String, _>>()
        .map_err(|_| invalid())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn col(type_name: &str) -> Column {
        Column::new("c", 1, type_name)
    }

    fn norm(type_name: &str, value: RawValue) -> Value {
        ValueNormalizer::new()
            .normalize(&col(type_name), Some(&value))
            .unwrap()
    }

    #[test]
    fn test_column_kind() {
        assert_eq!(ColumnKind::from_type_name("int"), ColumnKind::Integer);
        assert_eq!(ColumnKind::from_type_name("NUMBER(10,2)"), ColumnKind::Decimal);
        assert_eq!(ColumnKind::from_type_name("NVARCHAR(50)"), ColumnKind::Text);
        assert_eq!(ColumnKind::from_type_name("VARCHAR2(100)"), ColumnKind::Text);
        assert_eq!(ColumnKind::from_type_name("TIMESTAMP(6)"), ColumnKind::Timestamp);
        assert_eq!(
            ColumnKind::from_type_name("TIMESTAMP(6) WITH TIME ZONE"),
            ColumnKind::TimestampTz
        );
        assert_eq!(ColumnKind::from_type_name("bit"), ColumnKind::Boolean);
        assert_eq!(
            ColumnKind::from_type_name("uniqueidentifier"),
            ColumnKind::Uuid
        );
        assert_eq!(ColumnKind::from_type_name("geography"), ColumnKind::Other);
    }

    #[test]
    fn test_none_is_null() {
        let v = ValueNormalizer::new().normalize(&col("int"), None).unwrap();
        assert_eq!(v, Value::Null);
    }

    #[test]
    fn test_native_values() {
        assert_eq!(norm("int", RawValue::Integer(42)), json!(42));
        assert_eq!(norm("bit", RawValue::Integer(1)), json!(true));
        assert_eq!(norm("decimal(10,2)", RawValue::Text("12.50".into())), json!("12.50"));
        assert_eq!(norm("float", RawValue::Float(f64::NAN)), Value::Null);
        assert_eq!(
            norm("varbinary", RawValue::Binary(b"hello world".to_vec())),
            json!("aGVsbG8gd29ybGQ=")
        );
    }

    #[test]
    fn test_literal_unescapes_quotes() {
        assert_eq!(
            norm("VARCHAR2(20)", RawValue::Literal("Bob''s dog".into())),
            json!("Bob's dog")
        );
        // driver text is taken as-is
        assert_eq!(
            norm("nvarchar", RawValue::Text("Bob''s dog".into())),
            json!("Bob''s dog")
        );
    }

    #[test]
    fn test_literal_numbers() {
        assert_eq!(norm("NUMBER", RawValue::Expression("-1.5".into())), json!("-1.5"));
        assert_eq!(norm("int", RawValue::Literal("7".into())), json!(7));
        assert_eq!(norm("BINARY_DOUBLE", RawValue::Literal("2.5".into())), json!(2.5));
    }

    #[test]
    fn test_invalid_typed_value() {
        let err = ValueNormalizer::new()
            .normalize(&col("int"), Some(&RawValue::Literal("abc".into())))
            .unwrap_err();
        assert!(matches!(err, CdcError::Schema(_)));
    }

    #[test]
    fn test_to_date_unwrap() {
        let v = norm(
            "DATE",
            RawValue::Expression("TO_DATE('2020-02-01 00:00:00', 'YYYY-MM-DD HH24:MI:SS')".into()),
        );
        assert_eq!(v, json!("2020-02-01"));

        let v = norm(
            "TIMESTAMP(6)",
            RawValue::Expression("TO_TIMESTAMP('2020-02-01 10:11:12.')".into()),
        );
        assert_eq!(v, json!("2020-02-01T10:11:12"));
    }

    #[test]
    fn test_unistr_decoding() {
        let v = norm(
            "NVARCHAR2(20)",
            RawValue::Expression("UNISTR('\\0412\\044B\\0431\\043E\\0440 (')".into()),
        );
        assert_eq!(v, json!("Выбор ("));

        // surrogate pair
        let v = norm("NVARCHAR2(4)", RawValue::Expression("UNISTR('\\D83D\\DE00')".into()));
        assert_eq!(v, json!("\u{1F600}"));
    }

    #[test]
    fn test_hextoraw() {
        let v = norm("RAW(4)", RawValue::Expression("HEXTORAW('DEADBEEF')".into()));
        assert_eq!(v, json!(STANDARD.encode([0xDE, 0xAD, 0xBE, 0xEF])));
    }

    #[test]
    fn test_uuid() {
        let v = norm(
            "uniqueidentifier",
            RawValue::Text("6F9619FF-8B86-D011-B42D-00C04FC964FF".into()),
        );
        assert_eq!(v, json!("6f9619ff-8b86-d011-b42d-00c04fc964ff"));
    }

    #[test]
    fn test_timestamp_native() {
        let ts = NaiveDate::from_ymd_opt(2024, 1, 2)
            .unwrap()
            .and_hms_opt(3, 4, 5)
            .unwrap();
        assert_eq!(norm("datetime2", RawValue::Timestamp(ts)), json!("2024-01-02T03:04:05"));
        assert_eq!(norm("date", RawValue::Timestamp(ts)), json!("2024-01-02"));
    }

    #[test]
    fn test_default_values() {
        let n = ValueNormalizer::new();
        assert_eq!(
            n.parse_default_value(&col("int").with_default("((0))")),
            Some(json!(0))
        );
        assert_eq!(
            n.parse_default_value(&col("nvarchar(10)").with_default("(N'abc')")),
            Some(json!("abc"))
        );
        assert_eq!(
            n.parse_default_value(&col("varchar(10)").with_default("('it''s')")),
            Some(json!("it's"))
        );
        assert_eq!(
            n.parse_default_value(&col("int").with_default("(NULL)")),
            Some(Value::Null)
        );
        assert_eq!(
            n.parse_default_value(&col("datetime").with_default("(getdate())")),
            None
        );
        assert_eq!(
            n.parse_default_value(&col("uniqueidentifier").with_default("(newid())")),
            None
        );
        assert_eq!(n.parse_default_value(&col("DATE").with_default("SYSDATE")), None);
        assert_eq!(n.parse_default_value(&col("int")), None);
        // unparseable default is dropped, not an error
        assert_eq!(
            n.parse_default_value(&col("int").with_default("('x')")),
            None
        );
    }

    #[test]
    fn test_strip_parens_keeps_inner_calls() {
        assert_eq!(strip_parens("((0))"), "0");
        assert_eq!(strip_parens("(a)+(b)"), "(a)+(b)");
        assert_eq!(strip_parens("('(')"), "'('");
    }
}
