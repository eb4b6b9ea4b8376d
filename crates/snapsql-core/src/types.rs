use std::fmt;

use serde::{Deserialize, Serialize};

use crate::IndexMap;

/// A primitive scalar type, per §3 "TypeSpec".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrimitiveType {
    Int,
    Float,
    Bool,
    String,
    Bytes,
    Timestamp,
    Date,
    Time,
    Decimal,
    Any,
}

impl fmt::Display for PrimitiveType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PrimitiveType::Int => "int",
            PrimitiveType::Float => "float",
            PrimitiveType::Bool => "bool",
            PrimitiveType::String => "string",
            PrimitiveType::Bytes => "bytes",
            PrimitiveType::Timestamp => "timestamp",
            PrimitiveType::Date => "date",
            PrimitiveType::Time => "time",
            PrimitiveType::Decimal => "decimal",
            PrimitiveType::Any => "any",
        };
        f.write_str(s)
    }
}

impl PrimitiveType {
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "int" => PrimitiveType::Int,
            "float" => PrimitiveType::Float,
            "bool" => PrimitiveType::Bool,
            "string" => PrimitiveType::String,
            "bytes" => PrimitiveType::Bytes,
            "timestamp" => PrimitiveType::Timestamp,
            "date" => PrimitiveType::Date,
            "time" => PrimitiveType::Time,
            "decimal" => PrimitiveType::Decimal,
            "any" => PrimitiveType::Any,
            _ => return None,
        })
    }

    /// Whether a value of this type may be inlined via `EMIT_EVAL` into an
    /// identifier slot (§4.3). Only string-shaped, non-quoting types qualify.
    pub fn is_identifier_safe(self) -> bool {
        matches!(self, PrimitiveType::String | PrimitiveType::Int)
    }
}

/// A parameter / response-field type, a tagged variant per §3.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TypeSpec {
    Primitive(PrimitiveType),
    Array(Box<TypeSpec>),
    Nullable(Box<TypeSpec>),
    Named(String),
    Object(IndexMap<String, TypeSpec>),
}

impl TypeSpec {
    pub fn is_identifier_safe(&self) -> bool {
        match self {
            TypeSpec::Primitive(p) => p.is_identifier_safe(),
            TypeSpec::Nullable(inner) => inner.is_identifier_safe(),
            _ => false,
        }
    }

    /// Parses the `"<T>[]"` / `"*<T>"` / primitive / named spelling used in
    /// the embedded interface-schema YAML (§6).
    pub fn parse(spelling: &str) -> TypeSpec {
        let spelling = spelling.trim();
        if let Some(inner) = spelling.strip_suffix("[]") {
            return TypeSpec::Array(Box::new(TypeSpec::parse(inner)));
        }
        if let Some(inner) = spelling.strip_prefix('*') {
            return TypeSpec::Nullable(Box::new(TypeSpec::parse(inner)));
        }
        match PrimitiveType::from_name(spelling) {
            Some(p) => TypeSpec::Primitive(p),
            None => TypeSpec::Named(spelling.to_owned()),
        }
    }
}

impl fmt::Display for TypeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeSpec::Primitive(p) => write!(f, "{p}"),
            TypeSpec::Array(inner) => write!(f, "{inner}[]"),
            TypeSpec::Nullable(inner) => write!(f, "*{inner}"),
            TypeSpec::Named(name) => write!(f, "{name}"),
            TypeSpec::Object(_) => write!(f, "object"),
        }
    }
}
