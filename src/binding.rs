//! Text -> typed bind parameter conversion
//!
//! Captured values are text exactly as the server logged them. At replay time
//! each value is converted to the Rust type matching the parameter's native
//! type and bound through `ToSql`. A value that does not convert is a
//! [`ReplayError::ValueConversion`]; nothing is coerced silently.

use bytes::BytesMut;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use tokio_postgres::types::{to_sql_checked, IsNull, ToSql, Type};

use crate::constants::UNRESOLVED_TYPE;
use crate::error::ReplayError;
use crate::log_entry::placeholder_positions;

/// SQL NULL that binds to a parameter of any type
#[derive(Debug)]
pub struct SqlNull;

impl ToSql for SqlNull {
    fn to_sql(
        &self,
        _ty: &Type,
        _out: &mut BytesMut,
    ) -> Result<IsNull, Box<dyn std::error::Error + Sync + Send>> {
        Ok(IsNull::Yes)
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

/// One converted bind parameter
#[derive(Debug, Clone, PartialEq)]
pub enum PgParam {
    Null,
    Bool(bool),
    Char(i8),
    Int2(i16),
    Int4(i32),
    Int8(i64),
    Oid(u32),
    Float4(f32),
    Float8(f64),
    Text(String),
    Bytes(Vec<u8>),
    Date(NaiveDate),
    Time(NaiveTime),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<FixedOffset>),
}

impl PgParam {
    pub fn as_tosql(&self) -> &(dyn ToSql + Sync) {
        match self {
            PgParam::Null => &SqlNull,
            PgParam::Bool(v) => v,
            PgParam::Char(v) => v,
            PgParam::Int2(v) => v,
            PgParam::Int4(v) => v,
            PgParam::Int8(v) => v,
            PgParam::Oid(v) => v,
            PgParam::Float4(v) => v,
            PgParam::Float8(v) => v,
            PgParam::Text(v) => v,
            PgParam::Bytes(v) => v,
            PgParam::Date(v) => v,
            PgParam::Time(v) => v,
            PgParam::Timestamp(v) => v,
            PgParam::TimestampTz(v) => v,
        }
    }
}

/// Types [`convert_param`] can bind natively
pub fn natively_bindable(ty: &Type) -> bool {
    matches!(
        *ty,
        Type::BOOL
            | Type::CHAR
            | Type::INT2
            | Type::INT4
            | Type::INT8
            | Type::OID
            | Type::FLOAT4
            | Type::FLOAT8
            | Type::TEXT
            | Type::VARCHAR
            | Type::BPCHAR
            | Type::NAME
            | Type::UNKNOWN
            | Type::BYTEA
            | Type::DATE
            | Type::TIME
            | Type::TIMESTAMP
            | Type::TIMESTAMPTZ
    )
}

/// Convert the captured text of parameter `$index` to `ty`
pub fn convert_param(index: usize, value: Option<&str>, ty: &Type) -> Result<PgParam, ReplayError> {
    let Some(raw) = value else {
        return Ok(PgParam::Null);
    };
    let fail = |reason: String| ReplayError::ValueConversion {
        index,
        value: raw.to_string(),
        type_name: ty.name().to_string(),
        reason,
    };
    let text = raw.trim();

    let param = match *ty {
        Type::BOOL => PgParam::Bool(parse_bool(text).ok_or_else(|| fail("not a boolean".to_string()))?),
        Type::CHAR => match raw.as_bytes() {
            [b] => PgParam::Char(*b as i8),
            _ => return Err(fail("\"char\" takes exactly one byte".to_string())),
        },
        Type::INT2 => PgParam::Int2(text.parse().map_err(|e| fail(format!("{}", e)))?),
        Type::INT4 => PgParam::Int4(text.parse().map_err(|e| fail(format!("{}", e)))?),
        Type::INT8 => PgParam::Int8(text.parse().map_err(|e| fail(format!("{}", e)))?),
        Type::OID => PgParam::Oid(text.parse().map_err(|e| fail(format!("{}", e)))?),
        Type::FLOAT4 => PgParam::Float4(text.parse().map_err(|e| fail(format!("{}", e)))?),
        Type::FLOAT8 => PgParam::Float8(text.parse().map_err(|e| fail(format!("{}", e)))?),
        Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME | Type::UNKNOWN => PgParam::Text(raw.to_string()),
        Type::BYTEA => PgParam::Bytes(parse_bytea(text).map_err(fail)?),
        Type::DATE => PgParam::Date(
            NaiveDate::parse_from_str(text, "%Y-%m-%d").map_err(|e| fail(format!("{}", e)))?,
        ),
        Type::TIME => PgParam::Time(
            NaiveTime::parse_from_str(text, "%H:%M:%S%.f").map_err(|e| fail(format!("{}", e)))?,
        ),
        Type::TIMESTAMP => PgParam::Timestamp(
            NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
                .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f"))
                .map_err(|e| fail(format!("{}", e)))?,
        ),
        Type::TIMESTAMPTZ => PgParam::TimestampTz(parse_timestamptz(text).map_err(fail)?),
        _ => return Err(fail("unsupported parameter type".to_string())),
    };
    Ok(param)
}

/// Convert every captured value against the statement's parameter types
pub fn convert_params(values: &[Option<String>], types: &[Type]) -> Result<Vec<PgParam>, ReplayError> {
    if values.len() != types.len() {
        return Err(ReplayError::ParameterCountMismatch {
            placeholders: types.len(),
            resolved: types.len(),
            captured: values.len(),
        });
    }
    values
        .iter()
        .zip(types)
        .enumerate()
        .map(|(i, (v, ty))| convert_param(i + 1, v.as_deref(), ty))
        .collect()
}

/// Executable SQL plus the parameter types to declare when preparing it
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedStatement {
    pub sql: String,
    /// Declared prefix; parameters past it are inferred by the server
    pub declared: Vec<Type>,
}

/// Rewrite `?` markers to `$n` and choose declared types from resolved OIDs.
///
/// A resolved type that cannot be bound natively is sent as text and cast
/// server-side (`$n::text::numeric`). The declared list stops at the first
/// placeholder whose type is unresolved.
pub fn render_statement(sql: &str, types: &[u32]) -> RenderedStatement {
    let positions = placeholder_positions(sql);
    let mut out = String::with_capacity(sql.len() + positions.len() * 8);
    let mut declared = Vec::new();
    let mut prefix_open = true;
    let mut last = 0;

    for (i, pos) in positions.iter().enumerate() {
        out.push_str(&sql[last..*pos]);
        out.push_str(&format!("${}", i + 1));
        last = pos + 1;

        let resolved = types
            .get(i)
            .copied()
            .filter(|oid| *oid != UNRESOLVED_TYPE)
            .and_then(Type::from_oid);
        match resolved {
            Some(ty) if natively_bindable(&ty) => {
                if prefix_open {
                    declared.push(ty);
                }
            }
            Some(ty) => {
                out.push_str(&format!("::text::{}", ty.name()));
                if prefix_open {
                    declared.push(Type::TEXT);
                }
            }
            None => prefix_open = false,
        }
    }
    out.push_str(&sql[last..]);

    RenderedStatement { sql: out, declared }
}

fn parse_bool(text: &str) -> Option<bool> {
    match text.to_ascii_lowercase().as_str() {
        "t" | "true" | "y" | "yes" | "on" | "1" => Some(true),
        "f" | "false" | "n" | "no" | "off" | "0" => Some(false),
        _ => None,
    }
}

/// PostgreSQL hex bytea output (`\x0a1b`)
fn parse_bytea(text: &str) -> Result<Vec<u8>, String> {
    let hex = text
        .strip_prefix("\\x")
        .ok_or_else(|| "bytea must use hex format (\\x...)".to_string())?;
    if !hex.is_ascii() {
        return Err("non-hex character in bytea value".to_string());
    }
    if hex.len() % 2 != 0 {
        return Err("odd number of hex digits".to_string());
    }
    hex.as_bytes()
        .chunks(2)
        .map(|pair| {
            std::str::from_utf8(pair)
                .map_err(|e| e.to_string())
                .and_then(|digits| u8::from_str_radix(digits, 16).map_err(|e| e.to_string()))
        })
        .collect()
}

/// PostgreSQL text output (`2024-03-01 10:00:00.5+01`) or RFC 3339
fn parse_timestamptz(text: &str) -> Result<DateTime<FixedOffset>, String> {
    DateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f%#z")
        .or_else(|_| DateTime::parse_from_rfc3339(text))
        .map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_convert_scalars() {
        assert_eq!(convert_param(1, Some("42"), &Type::INT4).unwrap(), PgParam::Int4(42));
        assert_eq!(convert_param(1, Some(" -7 "), &Type::INT8).unwrap(), PgParam::Int8(-7));
        assert_eq!(convert_param(1, Some("t"), &Type::BOOL).unwrap(), PgParam::Bool(true));
        assert_eq!(convert_param(1, Some("2.5"), &Type::FLOAT8).unwrap(), PgParam::Float8(2.5));
        assert_eq!(
            convert_param(1, Some(" padded "), &Type::VARCHAR).unwrap(),
            PgParam::Text(" padded ".to_string())
        );
        assert_eq!(convert_param(1, Some("\\x0aff"), &Type::BYTEA).unwrap(), PgParam::Bytes(vec![10, 255]));
    }

    #[test]
    fn test_convert_temporal() {
        assert!(matches!(convert_param(1, Some("2024-03-01"), &Type::DATE), Ok(PgParam::Date(_))));
        assert!(matches!(
            convert_param(1, Some("2024-03-01 10:00:00.25"), &Type::TIMESTAMP),
            Ok(PgParam::Timestamp(_))
        ));
        match convert_param(1, Some("2024-03-01 10:00:00.5+01"), &Type::TIMESTAMPTZ).unwrap() {
            PgParam::TimestampTz(ts) => assert_eq!(ts.offset().local_minus_utc(), 3600),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_null_binds_any_type() {
        assert_eq!(convert_param(3, None, &Type::NUMERIC).unwrap(), PgParam::Null);
        assert!(<SqlNull as ToSql>::accepts(&Type::JSONB));
    }

    #[test]
    fn test_conversion_errors_are_value_conversion() {
        let err = convert_param(2, Some("abc"), &Type::INT4).unwrap_err();
        match err {
            ReplayError::ValueConversion { index, value, type_name, .. } => {
                assert_eq!(index, 2);
                assert_eq!(value, "abc");
                assert_eq!(type_name, "int4");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(convert_param(1, Some("70000"), &Type::INT2).is_err());
        assert!(convert_param(1, Some("{}"), &Type::JSONB).is_err());
    }

    #[test]
    fn test_bytea_rejects_multibyte_input() {
        assert_eq!(
            convert_param(1, Some("\\x0a1B"), &Type::BYTEA).unwrap(),
            PgParam::Bytes(vec![0x0a, 0x1b])
        );
        for bad in ["\\x0é0", "\\xé", "\\x0g", "0a1b"] {
            let err = convert_param(1, Some(bad), &Type::BYTEA).unwrap_err();
            assert!(matches!(err, ReplayError::ValueConversion { .. }), "{}", bad);
        }
    }

    #[test]
    fn test_convert_params_count_mismatch() {
        let err = convert_params(&[Some("1".to_string())], &[Type::INT4, Type::INT4]).unwrap_err();
        assert!(matches!(err, ReplayError::ParameterCountMismatch { captured: 1, .. }));
    }

    #[test]
    fn test_render_statement() {
        let r = render_statement(
            "UPDATE t SET amount = ?, note = '?' WHERE id = ? AND tag = ?",
            &[Type::NUMERIC.oid(), Type::INT4.oid()],
        );
        assert_eq!(r.sql, "UPDATE t SET amount = $1::text::numeric, note = '?' WHERE id = $2 AND tag = $3");
        assert_eq!(r.declared, vec![Type::TEXT, Type::INT4]);

        let r = render_statement("SELECT ? , ?", &[UNRESOLVED_TYPE, Type::INT8.oid()]);
        assert_eq!(r.sql, "SELECT $1 , $2");
        assert!(r.declared.is_empty());
    }
}
