//! Typed cell parsing.

use crate::types::{CellError, DataType, TypedValue};

use super::timestamp::parse_datetime;

/// Parse a raw cell into a [`TypedValue`] according to `data_type`.
///
/// Rules:
///
/// - Whitespace is trimmed; an empty cell is [`TypedValue::NoValue`], never an error.
/// - A value that does not convert produces [`TypedValue::ParseError`] carrying the
///   position and raw text, so the caller can log it and keep going.
/// - Integers accept a trailing `.0` fraction (`"12.0"`), which spreadsheets often write.
pub fn parse_cell(row: u64, column: usize, data_type: DataType, raw: &str) -> TypedValue {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return TypedValue::NoValue;
    }

    let parsed = match data_type {
        DataType::String => Ok(TypedValue::String(trimmed.to_owned())),
        DataType::Integer => parse_integer(trimmed).map(TypedValue::Integer),
        DataType::Float => parse_float(trimmed).map(TypedValue::Float),
        DataType::Boolean => parse_bool(trimmed).map(TypedValue::Bool),
        DataType::Datetime => parse_datetime(trimmed, None)
            .map(TypedValue::DateTime)
            .map_err(|e| e.to_string()),
    };

    parsed.unwrap_or_else(|reason| {
        TypedValue::ParseError(CellError {
            row,
            column,
            raw: raw.to_owned(),
            reason,
        })
    })
}

fn parse_integer(s: &str) -> Result<i64, String> {
    match s.parse::<i64>() {
        Ok(v) => Ok(v),
        Err(e) => {
            let whole = s
                .strip_suffix(".0")
                .or_else(|| s.strip_suffix('.'))
                .ok_or_else(|| format!("expected integer: {e}"))?;
            whole
                .parse::<i64>()
                .map_err(|e| format!("expected integer: {e}"))
        }
    }
}

fn parse_float(s: &str) -> Result<f64, String> {
    let v = s
        .parse::<f64>()
        .map_err(|e| format!("expected float: {e}"))?;
    if v.is_finite() {
        Ok(v)
    } else {
        Err("expected a finite float".to_string())
    }
}

fn parse_bool(s: &str) -> Result<bool, String> {
    match s.to_ascii_lowercase().as_str() {
        "true" | "t" | "1" | "yes" | "y" | "on" => Ok(true),
        "false" | "f" | "0" | "no" | "n" | "off" => Ok(false),
        _ => Err("expected bool (true/false/1/0/yes/no/on/off)".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_cells_are_no_value() {
        assert_eq!(parse_cell(2, 0, DataType::Float, ""), TypedValue::NoValue);
        assert_eq!(parse_cell(2, 0, DataType::Integer, "   "), TypedValue::NoValue);
    }

    #[test]
    fn parses_each_declared_type() {
        assert_eq!(parse_cell(2, 0, DataType::Float, " 45.67 "), TypedValue::Float(45.67));
        assert_eq!(parse_cell(2, 0, DataType::Integer, "12"), TypedValue::Integer(12));
        assert_eq!(parse_cell(2, 0, DataType::Integer, "12.0"), TypedValue::Integer(12));
        assert_eq!(parse_cell(2, 0, DataType::Boolean, "Yes"), TypedValue::Bool(true));
        assert_eq!(parse_cell(2, 0, DataType::Boolean, "off"), TypedValue::Bool(false));
        assert_eq!(
            parse_cell(2, 0, DataType::String, " occupied "),
            TypedValue::String("occupied".into())
        );
        assert!(matches!(
            parse_cell(2, 0, DataType::Datetime, "2012-02-01 00:30"),
            TypedValue::DateTime(_)
        ));
    }

    #[test]
    fn malformed_cells_carry_position_and_raw_text() {
        match parse_cell(7, 3, DataType::Float, "n/a") {
            TypedValue::ParseError(err) => {
                assert_eq!(err.row, 7);
                assert_eq!(err.column, 3);
                assert_eq!(err.raw, "n/a");
                assert!(err.reason.starts_with("expected float"));
            }
            other => panic!("expected parse error, got {other:?}"),
        }
        assert!(matches!(
            parse_cell(2, 0, DataType::Integer, "12.5"),
            TypedValue::ParseError(_)
        ));
        assert!(matches!(
            parse_cell(2, 0, DataType::Float, "NaN"),
            TypedValue::ParseError(_)
        ));
        assert!(matches!(
            parse_cell(2, 0, DataType::Boolean, "maybe"),
            TypedValue::ParseError(_)
        ));
    }
}
