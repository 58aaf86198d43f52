//! Defines an enum of all the possible values that flow through a query.
//!
//! Scalars mirror what a database column can hold.  The structured variants
//! (records, sequences, groups) exist because a projection can produce shapes
//! the database only ever sees flattened into columns: the client side of the
//! pipeline materializes and recombines them.

use enum_as_inner::EnumAsInner;

use crate::error::{Error, Result};
use crate::types::ValueType;

#[derive(Debug, Clone, PartialEq, EnumAsInner)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Real(f64),
    Text(String),
    /// An ordered set of named fields, the materialized form of a record
    /// projection.  Field order is meaningful and preserved.
    Record(Vec<(String, Value)>),
    /// A materialized row sequence (subquery results, client-side operator
    /// output).
    List(Vec<Value>),
    /// A materialized group: the grouping key plus the member rows.
    Group { key: Box<Value>, items: Vec<Value> },
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => "NULL".fmt(f),
            Value::Bool(x) => match x {
                true => "TRUE".fmt(f),
                false => "FALSE".fmt(f),
            },
            Value::Int(x) => x.fmt(f),
            Value::Real(x) => x.fmt(f),
            Value::Text(x) => x.fmt(f),
            Value::Record(fields) => {
                write!(f, "{{")?;
                for (i, (name, v)) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", name, v)?;
                }
                write!(f, "}}")
            }
            Value::List(items) => {
                write!(f, "[")?;
                for (i, v) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    v.fmt(f)?;
                }
                write!(f, "]")
            }
            Value::Group { key, items } => {
                write!(f, "group({} => {} items)", key, items.len())
            }
        }
    }
}

impl Value {
    pub fn value_type(&self) -> Option<ValueType> {
        match self {
            Value::Null => Some(ValueType::Null),
            Value::Bool(_) => Some(ValueType::Bool),
            Value::Int(_) => Some(ValueType::Int),
            Value::Real(_) => Some(ValueType::Real),
            Value::Text(_) => Some(ValueType::Text),
            _ => None,
        }
    }

    /// SQL-ish truth test used by predicates: NULL is not true.
    pub fn is_truthy(&self) -> bool {
        matches!(self, Value::Bool(true))
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        match self {
            Value::Record(fields) => fields.iter().find(|(n, _)| n == name).map(|(_, v)| v),
            Value::Group { key, .. } if name == "key" => Some(key),
            _ => None,
        }
    }
}

/// can hold one result row returned by a command executor, one item per
/// output column.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub items: Vec<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
}

fn do_int_arith(i: i64, op: ArithOp, j: i64) -> Result<i64> {
    use ArithOp::*;
    match op {
        Add => Ok(i.wrapping_add(j)),
        Subtract => Ok(i.wrapping_sub(j)),
        Multiply => Ok(i.wrapping_mul(j)),
        Divide => {
            if j == 0 {
                return Err(Error::Type("integer division by zero".to_string()));
            }
            Ok(i / j)
        }
        Modulo => {
            if j == 0 {
                return Err(Error::Type("integer modulo by zero".to_string()));
            }
            Ok(i % j)
        }
    }
}

fn do_real_arith(i: f64, op: ArithOp, j: f64) -> f64 {
    use ArithOp::*;
    match op {
        Add => i + j,
        Subtract => i - j,
        Multiply => i * j,
        Divide => i / j,
        Modulo => i % j,
    }
}

/// performs arithmetic with int/real promotion.  NULL on either side
/// propagates.
pub fn arith(l: &Value, op: ArithOp, r: &Value) -> Result<Value> {
    use Value::*;
    match (l, r) {
        (Int(i), Int(j)) => Ok(Int(do_int_arith(*i, op, *j)?)),
        (Real(i), Real(j)) => Ok(Real(do_real_arith(*i, op, *j))),
        (Int(i), Real(j)) => Ok(Real(do_real_arith(*i as f64, op, *j))),
        (Real(i), Int(j)) => Ok(Real(do_real_arith(*i, op, *j as f64))),
        (Null, _) => Ok(Null),
        (_, Null) => Ok(Null),
        _ => Err(Error::Type(format!(
            "invalid operands in arithmetic expression: {} and {}",
            l, r
        ))),
    }
}

/// Equality used by joins, grouping keys, DISTINCT and IN: structural, with
/// int/real comparing numerically and NULL equal to NULL.
pub fn loose_eq(l: &Value, r: &Value) -> bool {
    use Value::*;
    match (l, r) {
        (Int(i), Real(j)) | (Real(j), Int(i)) => (*i as f64) == *j,
        (Record(a), Record(b)) => {
            a.len() == b.len()
                && a.iter()
                    .zip(b.iter())
                    .all(|((an, av), (bn, bv))| an == bn && loose_eq(av, bv))
        }
        (List(a), List(b)) => a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| loose_eq(x, y)),
        _ => l == r,
    }
}

fn type_rank(v: &Value) -> u8 {
    match v {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Int(_) | Value::Real(_) => 2,
        Value::Text(_) => 3,
        Value::Record(_) => 4,
        Value::List(_) => 5,
        Value::Group { .. } => 6,
    }
}

/// Total ordering used by ORDER BY and MIN/MAX.  NULL sorts first; numbers
/// compare numerically across int/real; unlike types order by a fixed rank so
/// the sort is deterministic.
pub fn compare(l: &Value, r: &Value) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    use Value::*;
    match (l, r) {
        (Null, Null) => Ordering::Equal,
        (Bool(a), Bool(b)) => a.cmp(b),
        (Int(a), Int(b)) => a.cmp(b),
        (Real(a), Real(b)) => a.partial_cmp(b).unwrap_or(Ordering::Equal),
        (Int(a), Real(b)) => (*a as f64).partial_cmp(b).unwrap_or(Ordering::Equal),
        (Real(a), Int(b)) => a.partial_cmp(&(*b as f64)).unwrap_or(Ordering::Equal),
        (Text(a), Text(b)) => a.cmp(b),
        (Record(a), Record(b)) => {
            for ((_, av), (_, bv)) in a.iter().zip(b.iter()) {
                let ord = compare(av, bv);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            a.len().cmp(&b.len())
        }
        _ => type_rank(l).cmp(&type_rank(r)),
    }
}

/// casts a scalar to the given type, NULL passing through.
pub fn cast(v: &Value, ty: ValueType) -> Result<Value> {
    use Value::*;
    match (v, ty) {
        (Null, _) => Ok(Null),
        (Int(i), ValueType::Int) => Ok(Int(*i)),
        (Int(i), ValueType::Real) => Ok(Real(*i as f64)),
        (Int(i), ValueType::Bool) => Ok(Bool(*i != 0)),
        (Int(i), ValueType::Text) => Ok(Text(i.to_string())),
        (Real(x), ValueType::Real) => Ok(Real(*x)),
        (Real(x), ValueType::Int) => Ok(Int(*x as i64)),
        (Real(x), ValueType::Text) => Ok(Text(x.to_string())),
        (Bool(b), ValueType::Bool) => Ok(Bool(*b)),
        (Bool(b), ValueType::Int) => Ok(Int(*b as i64)),
        (Text(s), ValueType::Text) => Ok(Text(s.clone())),
        _ => Err(Error::Type(format!("cannot cast {} to {}", v, ty))),
    }
}

/// encodes a value as JSON.  Used by the serialized-subquery column strategy.
pub fn to_json(v: &Value) -> serde_json::Value {
    use serde_json::json;
    match v {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => json!(b),
        Value::Int(i) => json!(i),
        Value::Real(x) => json!(x),
        Value::Text(s) => json!(s),
        Value::Record(fields) => {
            let mut map = serde_json::Map::new();
            for (name, v) in fields {
                map.insert(name.clone(), to_json(v));
            }
            serde_json::Value::Object(map)
        }
        Value::List(items) => serde_json::Value::Array(items.iter().map(to_json).collect()),
        Value::Group { key, items } => {
            let mut map = serde_json::Map::new();
            map.insert("key".to_string(), to_json(key));
            map.insert(
                "items".to_string(),
                serde_json::Value::Array(items.iter().map(to_json).collect()),
            );
            serde_json::Value::Object(map)
        }
    }
}

/// decodes a JSON document produced by `to_json`.  Integral numbers come back
/// as `Int`, everything else as `Real`; objects come back as records in key
/// order.
pub fn from_json(v: &serde_json::Value) -> Value {
    match v {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Int(i)
            } else {
                Value::Real(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        serde_json::Value::String(s) => Value::Text(s.clone()),
        serde_json::Value::Array(items) => Value::List(items.iter().map(from_json).collect()),
        serde_json::Value::Object(map) => {
            Value::Record(map.iter().map(|(k, v)| (k.clone(), from_json(v))).collect())
        }
    }
}

#[test]
fn test_arith_promotion() {
    use ArithOp::*;
    use Value::*;
    let cases = vec![
        (Int(1), Add, Int(1), Int(2)),
        (Int(3), Multiply, Real(2.0), Real(6.0)),
        (Real(1.5), Add, Int(1), Real(2.5)),
        (Null, Add, Int(1), Null),
        (Int(1), Subtract, Null, Null),
    ];
    for case in cases {
        let res = arith(&case.0, case.1, &case.2);
        assert!(res.is_ok());
        assert_eq!(res.unwrap(), case.3);
    }
}

#[test]
fn test_arith_err() {
    use ArithOp::*;
    use Value::*;
    let cases = vec![
        (Text("foo".to_string()), Subtract, Real(1.1)),
        (Int(1), Divide, Int(0)),
    ];
    for case in cases {
        assert!(arith(&case.0, case.1, &case.2).is_err());
    }
}

#[test]
fn test_compare_orders_nulls_first() {
    use Value::*;
    let mut vals = vec![Int(3), Null, Real(1.5), Int(2)];
    vals.sort_by(compare);
    assert_eq!(vals, vec![Null, Real(1.5), Int(2), Int(3)]);
}

#[test]
fn test_json_round_trip() {
    let v = Value::List(vec![
        Value::Record(vec![
            ("a".to_string(), Value::Int(1)),
            ("b".to_string(), Value::Text("x".to_string())),
        ]),
        Value::Record(vec![
            ("a".to_string(), Value::Null),
            ("b".to_string(), Value::Real(2.5)),
        ]),
    ]);
    assert_eq!(from_json(&to_json(&v)), v);
}
