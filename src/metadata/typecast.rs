//! Typed property values and the coercions that produce them.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;

/// Custom converter for [`Typecast::Custom`].
pub type Converter = Arc<dyn Fn(&serde_json::Value) -> Result<Value, String> + Send + Sync>;

/// Coercion rule attached to a property.
#[derive(Clone)]
pub enum Typecast {
    Str,
    Int,
    Float,
    Bool,
    /// Closed set of allowed string values.
    Enum(Vec<String>),
    /// List whose elements satisfy the nested typecast.
    List(Box<Typecast>),
    /// Arbitrary converter.
    Custom(Converter),
}

impl fmt::Debug for Typecast {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Typecast::Str => write!(f, "Str"),
            Typecast::Int => write!(f, "Int"),
            Typecast::Float => write!(f, "Float"),
            Typecast::Bool => write!(f, "Bool"),
            Typecast::Enum(values) => f.debug_tuple("Enum").field(values).finish(),
            Typecast::List(inner) => f.debug_tuple("List").field(inner).finish(),
            Typecast::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

/// Reference to a BLOB payload, as kept in the property's metadata file.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobRef {
    /// Hex sha1 of the payload; empty for URL-only blobs.
    #[serde(default)]
    pub digest: String,

    #[serde(default)]
    pub size: u64,

    #[serde(default = "default_mime_type")]
    pub mime_type: String,

    /// Remote location when the payload is not held locally.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

fn default_mime_type() -> String {
    "application/octet-stream".to_string()
}

/// A coerced property value.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    /// Language tag to translation.
    Localized(BTreeMap<String, String>),
    List(Vec<Value>),
    Blob(BlobRef),
    /// Active child ids of an aggregated property.
    Aggregate(BTreeSet<String>),
}

impl Value {
    /// Renders the value in its on-disk JSON form.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => json!(b),
            Value::Int(i) => json!(i),
            Value::Float(f) => json!(f),
            Value::Str(s) => json!(s),
            Value::Localized(map) => json!(map),
            Value::List(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Blob(blob) => serde_json::to_value(blob).unwrap_or(serde_json::Value::Null),
            Value::Aggregate(ids) => json!(ids),
        }
    }

    /// Strings under which the value is indexed as exact terms.
    pub fn term_strings(&self) -> Vec<String> {
        match self {
            Value::Null | Value::Blob(_) => Vec::new(),
            Value::Bool(b) => vec![if *b { "1" } else { "0" }.to_string()],
            Value::Int(i) => vec![i.to_string()],
            Value::Float(f) => vec![format_float(*f)],
            Value::Str(s) => vec![s.clone()],
            Value::Localized(map) => map.values().cloned().collect(),
            Value::List(items) => items.iter().flat_map(Value::term_strings).collect(),
            Value::Aggregate(ids) => ids.iter().cloned().collect(),
        }
    }

    /// Text fed to the full-text tokenizer.
    pub fn text(&self) -> Vec<String> {
        match self {
            Value::Str(s) => vec![s.clone()],
            Value::Localized(map) => map.values().cloned().collect(),
            Value::List(items) => items.iter().flat_map(Value::text).collect(),
            _ => Vec::new(),
        }
    }
}

pub(crate) fn format_float(f: f64) -> String {
    if f.fract() == 0.0 && f.abs() < 1e15 {
        format!("{}", f as i64)
    } else {
        format!("{}", f)
    }
}

impl Typecast {
    /// Coerces a JSON input into a typed value.
    pub fn cast(&self, input: &serde_json::Value) -> Result<Value, String> {
        match self {
            Typecast::Str => cast_str(input).map(Value::Str),
            Typecast::Int => cast_int(input).map(Value::Int),
            Typecast::Float => cast_float(input).map(Value::Float),
            Typecast::Bool => cast_bool(input).map(Value::Bool),
            Typecast::Enum(allowed) => {
                let value = cast_str(input)?;
                if allowed.iter().any(|a| *a == value) {
                    Ok(Value::Str(value))
                } else {
                    Err(format!("'{}' is not one of {:?}", value, allowed))
                }
            }
            Typecast::List(inner) => match input {
                serde_json::Value::Array(items) => items
                    .iter()
                    .map(|item| inner.cast(item))
                    .collect::<Result<Vec<_>, _>>()
                    .map(Value::List),
                serde_json::Value::Null => Err("expected a list, got null".to_string()),
                scalar => Ok(Value::List(vec![inner.cast(scalar)?])),
            },
            Typecast::Custom(convert) => convert(input),
        }
    }

    /// Whether values of this typecast sort numerically.
    pub fn is_numeric(&self) -> bool {
        matches!(self, Typecast::Int | Typecast::Float | Typecast::Bool)
    }
}

fn cast_str(input: &serde_json::Value) -> Result<String, String> {
    match input {
        serde_json::Value::String(s) => Ok(s.clone()),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        serde_json::Value::Bool(b) => Ok(b.to_string()),
        other => Err(format!("cannot convert {} to string", other)),
    }
}

fn cast_int(input: &serde_json::Value) -> Result<i64, String> {
    match input {
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(i)
            } else if let Some(f) = n.as_f64().filter(|f| f.fract() == 0.0) {
                Ok(f as i64)
            } else {
                Err(format!("{} is not an integer", n))
            }
        }
        serde_json::Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map_err(|_| format!("'{}' is not an integer", s)),
        serde_json::Value::Bool(b) => Ok(i64::from(*b)),
        other => Err(format!("cannot convert {} to integer", other)),
    }
}

fn cast_float(input: &serde_json::Value) -> Result<f64, String> {
    match input {
        serde_json::Value::Number(n) => n.as_f64().ok_or_else(|| format!("{} is not a float", n)),
        serde_json::Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| format!("'{}' is not a float", s)),
        other => Err(format!("cannot convert {} to float", other)),
    }
}

fn cast_bool(input: &serde_json::Value) -> Result<bool, String> {
    match input {
        serde_json::Value::Bool(b) => Ok(*b),
        serde_json::Value::Number(n) => Ok(n.as_f64().map_or(false, |f| f != 0.0)),
        serde_json::Value::String(s) => match s.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(true),
            "false" | "0" | "no" | "off" | "" => Ok(false),
            _ => Err(format!("'{}' is not a boolean", s)),
        },
        other => Err(format!("cannot convert {} to boolean", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_coercion() {
        assert_eq!(Typecast::Int.cast(&json!(3)).unwrap(), Value::Int(3));
        assert_eq!(Typecast::Int.cast(&json!(" 42 ")).unwrap(), Value::Int(42));
        assert_eq!(Typecast::Int.cast(&json!(2.0)).unwrap(), Value::Int(2));
        assert!(Typecast::Int.cast(&json!(2.5)).is_err());
        assert!(Typecast::Int.cast(&json!("abc")).is_err());
    }

    #[test]
    fn test_bool_coercion() {
        assert_eq!(Typecast::Bool.cast(&json!("yes")).unwrap(), Value::Bool(true));
        assert_eq!(Typecast::Bool.cast(&json!(0)).unwrap(), Value::Bool(false));
        assert!(Typecast::Bool.cast(&json!("maybe")).is_err());
    }

    #[test]
    fn test_enum_coercion() {
        let cast = Typecast::Enum(vec!["a".into(), "b".into()]);
        assert_eq!(cast.cast(&json!("a")).unwrap(), Value::Str("a".into()));
        assert!(cast.cast(&json!("c")).is_err());
    }

    #[test]
    fn test_list_coercion() {
        let cast = Typecast::List(Box::new(Typecast::Int));
        assert_eq!(
            cast.cast(&json!([1, "2"])).unwrap(),
            Value::List(vec![Value::Int(1), Value::Int(2)])
        );
        assert_eq!(cast.cast(&json!(7)).unwrap(), Value::List(vec![Value::Int(7)]));
        assert!(cast.cast(&json!(["x"])).is_err());
    }

    #[test]
    fn test_custom_coercion() {
        let cast = Typecast::Custom(Arc::new(|v| {
            v.as_str()
                .map(|s| Value::Str(s.to_uppercase()))
                .ok_or_else(|| "not a string".to_string())
        }));
        assert_eq!(cast.cast(&json!("abc")).unwrap(), Value::Str("ABC".into()));
        assert!(cast.cast(&json!(1)).is_err());
    }

    #[test]
    fn test_term_strings() {
        assert_eq!(Value::Bool(true).term_strings(), vec!["1"]);
        assert_eq!(Value::Float(2.0).term_strings(), vec!["2"]);
        assert_eq!(Value::Float(2.5).term_strings(), vec!["2.5"]);
        let mut map = BTreeMap::new();
        map.insert("en".to_string(), "qwe".to_string());
        map.insert("ru".to_string(), "йцу".to_string());
        assert_eq!(Value::Localized(map).term_strings(), vec!["qwe", "йцу"]);
    }
}
