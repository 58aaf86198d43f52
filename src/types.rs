//! Defines an enum of the basic column types and routines for conversion to and from string.
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// These are the scalar types a column or computed value can have.
/// Shapes (records, sequences, groups) are structural and carry no name here;
/// only scalars participate in column type checks and casts.
pub enum ValueType {
    Int,
    Real,
    Text,
    Bool,
    Null,
}

impl std::fmt::Display for ValueType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValueType::Int => "integer".fmt(f),
            ValueType::Real => "real".fmt(f),
            ValueType::Text => "text".fmt(f),
            ValueType::Bool => "boolean".fmt(f),
            ValueType::Null => "null".fmt(f),
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("Unable to parse ValueType from column declaration: {0}.")]
    ParseValueTypeError(String),
}

impl FromStr for ValueType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "int" | "integer" => Ok(ValueType::Int),
            "real" | "float" | "double" => Ok(ValueType::Real),
            "text" | "string" => Ok(ValueType::Text),
            "bool" | "boolean" => Ok(ValueType::Bool),
            "null" => Ok(ValueType::Null),
            x => Err(Error::ParseValueTypeError(String::from(x))),
        }
    }
}

#[test]
fn test_parse_value_type() {
    let cases = vec![
        ("int", Ok(ValueType::Int)),
        ("INTEGER", Ok(ValueType::Int)),
        ("real", Ok(ValueType::Real)),
        ("text", Ok(ValueType::Text)),
        ("bool", Ok(ValueType::Bool)),
        ("varchar", Err(Error::ParseValueTypeError("varchar".to_string()))),
    ];
    for case in cases {
        assert_eq!(ValueType::from_str(case.0), case.1);
    }
}
