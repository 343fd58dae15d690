use crate::error::{Error, ErrorKind};
use crate::value::{Value, ValueKind, ValueRepr};

pub enum CoerceResult {
    I64(i64, i64),
    F64(f64, f64),
}

fn as_f64(value: &Value) -> Option<f64> {
    match value.0 {
        ValueRepr::I64(x) => Some(x as f64),
        ValueRepr::F64(x) => Some(x),
        _ => None,
    }
}

pub fn coerce(a: &Value, b: &Value) -> Option<CoerceResult> {
    match (&a.0, &b.0) {
        (ValueRepr::I64(a), ValueRepr::I64(b)) => Some(CoerceResult::I64(*a, *b)),
        (ValueRepr::F64(a), ValueRepr::F64(b)) => Some(CoerceResult::F64(*a, *b)),
        (_, ValueRepr::F64(b)) => Some(CoerceResult::F64(some!(as_f64(a)), *b)),
        (ValueRepr::F64(a), _) => Some(CoerceResult::F64(*a, some!(as_f64(b)))),
        _ => None,
    }
}

fn impossible_op(op: &str, lhs: &Value, rhs: &Value) -> Error {
    Error::new(
        ErrorKind::InvalidOperation,
        format!(
            "tried to use {} operator on unsupported types {} and {}",
            op,
            lhs.kind(),
            rhs.kind()
        ),
    )
}

fn failed_op(op: &str, lhs: &Value, rhs: &Value) -> Error {
    Error::new(
        ErrorKind::InvalidOperation,
        format!("unable to calculate {} {} {}", lhs, op, rhs),
    )
}

macro_rules! math_binop {
    ($name:ident, $int:ident, $float:tt) => {
        pub fn $name(lhs: &Value, rhs: &Value) -> Result<Value, Error> {
            match coerce(lhs, rhs) {
                Some(CoerceResult::I64(a, b)) => match a.$int(b) {
                    Some(val) => Ok(Value::from(val)),
                    None => Err(failed_op(stringify!($float), lhs, rhs)),
                },
                Some(CoerceResult::F64(a, b)) => Ok((a $float b).into()),
                None => Err(impossible_op(stringify!($float), lhs, rhs)),
            }
        }
    };
}

math_binop!(sub, checked_sub, -);
math_binop!(mul, checked_mul, *);
math_binop!(rem, checked_rem, %);

/// Adds two values.
///
/// If either side is a string the other side is formatted and the two are
/// concatenated.  Null and missing values concatenate as empty strings.
pub fn add(lhs: &Value, rhs: &Value) -> Result<Value, Error> {
    if matches!(lhs.kind(), ValueKind::String) || matches!(rhs.kind(), ValueKind::String) {
        return Ok(Value::from(format!("{}{}", lhs, rhs)));
    }
    match coerce(lhs, rhs) {
        Some(CoerceResult::I64(a, b)) => a
            .checked_add(b)
            .map(Value::from)
            .ok_or_else(|| failed_op("+", lhs, rhs)),
        Some(CoerceResult::F64(a, b)) => Ok((a + b).into()),
        None => Err(impossible_op("+", lhs, rhs)),
    }
}

/// Divides two values.
///
/// Integer division truncates and fails on a zero divisor.
pub fn div(lhs: &Value, rhs: &Value) -> Result<Value, Error> {
    match coerce(lhs, rhs) {
        Some(CoerceResult::I64(_, 0)) => Err(Error::new(
            ErrorKind::InvalidOperation,
            "attempted to divide by zero",
        )),
        Some(CoerceResult::I64(a, b)) => a
            .checked_div(b)
            .map(Value::from)
            .ok_or_else(|| failed_op("/", lhs, rhs)),
        Some(CoerceResult::F64(a, b)) => Ok((a / b).into()),
        None => Err(impossible_op("/", lhs, rhs)),
    }
}

pub fn neg(val: &Value) -> Result<Value, Error> {
    match val.0 {
        ValueRepr::I64(x) => x.checked_neg().map(Value::from).ok_or_else(|| {
            Error::new(ErrorKind::InvalidOperation, "integer overflow on negation")
        }),
        ValueRepr::F64(x) => Ok(Value::from(-x)),
        _ => Err(Error::new(
            ErrorKind::InvalidOperation,
            format!("cannot negate {}", val.kind()),
        )),
    }
}

pub fn compare(lhs: &Value, rhs: &Value, op: &str) -> Result<std::cmp::Ordering, Error> {
    lhs.partial_cmp(rhs)
        .ok_or_else(|| impossible_op(op, lhs, rhs))
}

#[cfg(test)]
mod tests {
    use super::*;

    use similar_asserts::assert_eq;

    #[test]
    fn test_adding() {
        assert_eq!(add(&Value::from(1), &Value::from(2)).unwrap(), Value::from(3));
        assert_eq!(add(&Value::from(1), &Value::from(0.5)).unwrap(), Value::from(1.5));
        assert_eq!(
            add(&Value::from("n="), &Value::from(2)).unwrap(),
            Value::from("n=2")
        );
        assert_eq!(
            add(&Value::from("a"), &Value::NONE).unwrap(),
            Value::from("a")
        );
        let err = add(&Value::from(i64::MAX), &Value::from(1)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidOperation);
    }

    #[test]
    fn test_division() {
        assert_eq!(div(&Value::from(7), &Value::from(2)).unwrap(), Value::from(3));
        assert_eq!(div(&Value::from(7.0), &Value::from(2)).unwrap(), Value::from(3.5));
        let err = div(&Value::from(1), &Value::from(0)).unwrap_err();
        assert_eq!(err.detail(), Some("attempted to divide by zero"));
        assert_eq!(rem(&Value::from(7), &Value::from(4)).unwrap(), Value::from(3));
    }

    #[test]
    fn test_compare() {
        use std::cmp::Ordering;
        assert_eq!(
            compare(&Value::from(1), &Value::from(2.0), "<").unwrap(),
            Ordering::Less
        );
        assert_eq!(
            compare(&Value::from("b"), &Value::from("a"), ">").unwrap(),
            Ordering::Greater
        );
        assert!(compare(&Value::from("b"), &Value::from(1), "<").is_err());
    }
}
