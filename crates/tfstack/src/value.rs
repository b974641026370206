//! value representation
//!
//! Values flow in two directions:
//! - out of the provisioner: `terraform output -json` reports every output as a `{type, value}` pair
//!   which gets converted with [Value::from_typed_json]
//! - into hcl evaluation: dependency outputs are declared as variables in an [hcl::eval::Context]
//!
//! The model contains
//! - null
//! - boolean (true/false)
//! - integer (signed, i64)
//! - decimal (f64)
//! - string (utf-8)
//! - array ("list" of values)
//! - object (order-preserving "map"/"dictionary", where the key is of type string)
//!
//! The only **implicit** conversion: every `integer` is also a `decimal`.
use indexmap::IndexMap;
use serde::{
    ser::{SerializeMap, SerializeSeq},
    Serializer,
};

/// All possible value types
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Boolean(bool),
    Integer(i64),
    Decimal(f64),
    String(String),
    Array(Vec<Value>),
    Object(IndexMap<String, Value>),
}

impl Value {
    /// Converts a typed json value as reported by the provisioner
    ///
    /// `ty` is the type constraint in json form: `"string"`, `["list", "number"]`,
    /// `["object", {"a": "bool"}]`, `["tuple", ["string", "number"]]`, `"dynamic"`, ...
    pub fn from_typed_json(
        ty: &serde_json::Value,
        value: serde_json::Value,
    ) -> Result<Value, ValueError> {
        use serde_json::Value as Json;

        if value.is_null() {
            return Ok(Value::Null);
        }

        match ty {
            Json::String(primitive) => match (primitive.as_str(), value) {
                ("string", Json::String(s)) => Ok(Value::String(s)),
                ("bool", Json::Bool(b)) => Ok(Value::Boolean(b)),
                ("number", Json::Number(n)) => Ok(n.into()),
                ("dynamic", value) => Ok(value.into()),
                (primitive, value) => Err(ValueError::TypeMismatch {
                    expected: primitive.to_string(),
                    found: value.to_string(),
                }),
            },
            Json::Array(constraint) => {
                let (Some(Json::String(kind)), Some(inner)) = (constraint.first(), constraint.get(1))
                else {
                    return Err(ValueError::UnknownType(ty.to_string()));
                };

                match (kind.as_str(), value) {
                    ("list" | "set", Json::Array(items)) => items
                        .into_iter()
                        .map(|item| Value::from_typed_json(inner, item))
                        .collect::<Result<Vec<_>, _>>()
                        .map(Value::Array),
                    ("map", Json::Object(entries)) => entries
                        .into_iter()
                        .map(|(key, item)| Ok((key, Value::from_typed_json(inner, item)?)))
                        .collect::<Result<IndexMap<_, _>, ValueError>>()
                        .map(Value::Object),
                    ("object", Json::Object(entries)) => entries
                        .into_iter()
                        .map(|(key, item)| {
                            let item = match inner.get(&key) {
                                Some(attr_ty) => Value::from_typed_json(attr_ty, item)?,
                                None => item.into(),
                            };
                            Ok((key, item))
                        })
                        .collect::<Result<IndexMap<_, _>, ValueError>>()
                        .map(Value::Object),
                    ("tuple", Json::Array(items)) => {
                        let element_types = inner.as_array().cloned().unwrap_or_default();
                        items
                            .into_iter()
                            .enumerate()
                            .map(|(index, item)| match element_types.get(index) {
                                Some(element_ty) => Value::from_typed_json(element_ty, item),
                                None => Ok(item.into()),
                            })
                            .collect::<Result<Vec<_>, _>>()
                            .map(Value::Array)
                    }
                    (kind, value) => Err(ValueError::TypeMismatch {
                        expected: kind.to_string(),
                        found: value.to_string(),
                    }),
                }
            }
            _ => Err(ValueError::UnknownType(ty.to_string())),
        }
    }

    /// String form used for environment variables
    ///
    /// Only scalar values have one.
    pub fn as_env_string(&self) -> Option<String> {
        match self {
            Value::Boolean(b) => Some(b.to_string()),
            Value::Integer(i) => Some(i.to_string()),
            Value::Decimal(d) => Some(d.to_string()),
            Value::String(s) => Some(s.clone()),
            Value::Null | Value::Array(_) | Value::Object(_) => None,
        }
    }

    /// Deep merge `other` into `self`
    ///
    /// Objects merge key by key, everything else is replaced.
    pub fn merge(&mut self, other: Value) {
        match (self, other) {
            (Value::Object(existing), Value::Object(other)) => {
                for (key, value) in other {
                    match existing.get_mut(&key) {
                        Some(current) => current.merge(value),
                        None => {
                            existing.insert(key, value);
                        }
                    }
                }
            }
            (current, other) => *current = other,
        }
    }
}

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum ValueError {
    #[error("unknown type constraint {0}")]
    UnknownType(String),
    #[error("expected a value of type {expected} but found {found}")]
    TypeMismatch { expected: String, found: String },
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(value: Vec<T>) -> Self {
        Value::Array(value.into_iter().map(Into::into).collect())
    }
}

impl<V: Into<Value>> From<IndexMap<String, V>> for Value {
    fn from(value: IndexMap<String, V>) -> Self {
        Value::Object(value.into_iter().map(|(k, v)| (k, v.into())).collect())
    }
}

impl From<hcl::Number> for Value {
    fn from(value: hcl::Number) -> Self {
        if let Some(int) = value.as_i64() {
            return Value::Integer(int);
        }

        value.as_f64().map(Value::Decimal).unwrap_or(Value::Null)
    }
}

impl From<hcl::Value> for Value {
    fn from(value: hcl::Value) -> Value {
        match value {
            hcl::Value::Null => Value::Null,
            hcl::Value::Bool(b) => b.into(),
            hcl::Value::Number(n) => n.into(),
            hcl::Value::String(s) => s.into(),
            hcl::Value::Array(a) => Value::Array(a.into_iter().map(Into::into).collect()),
            hcl::Value::Object(o) => {
                Value::Object(o.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
        }
    }
}

impl From<serde_json::Number> for Value {
    fn from(value: serde_json::Number) -> Self {
        if let Some(int) = value.as_i64() {
            return Value::Integer(int);
        }

        value.as_f64().map(Value::Decimal).unwrap_or(Value::Null)
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        use serde_json::Value as Json;

        match value {
            Json::Null => Value::Null,
            Json::Bool(b) => b.into(),
            Json::Number(n) => n.into(),
            Json::String(s) => s.into(),
            Json::Array(a) => Value::Array(a.into_iter().map(Into::into).collect()),
            Json::Object(o) => Value::Object(o.into_iter().map(|(k, v)| (k, v.into())).collect()),
        }
    }
}

impl From<Value> for hcl::Value {
    fn from(value: Value) -> hcl::Value {
        match value {
            Value::Null => hcl::Value::Null,
            Value::Boolean(b) => hcl::Value::Bool(b),
            Value::Integer(i) => hcl::Value::Number(i.into()),
            Value::Decimal(d) => hcl::Number::from_f64(d)
                .map(hcl::Value::Number)
                .unwrap_or(hcl::Value::Null),
            Value::String(s) => hcl::Value::String(s),
            Value::Array(a) => hcl::Value::Array(a.into_iter().map(Into::into).collect()),
            Value::Object(o) => {
                hcl::Value::Object(o.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
        }
    }
}

impl From<Value> for hcl::Expression {
    fn from(value: Value) -> hcl::Expression {
        hcl::Value::from(value).into()
    }
}

impl serde::ser::Serialize for Value {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Value::Null => serializer.serialize_unit(),
            Value::Boolean(value) => serializer.serialize_bool(*value),
            Value::Integer(value) => serializer.serialize_i64(*value),
            Value::Decimal(value) => serializer.serialize_f64(*value),
            Value::String(value) => serializer.serialize_str(value),
            Value::Array(value) => {
                let mut ser = serializer.serialize_seq(Some(value.len()))?;
                for element in value {
                    ser.serialize_element(element)?;
                }
                ser.end()
            }
            Value::Object(value) => {
                let mut ser = serializer.serialize_map(Some(value.len()))?;
                for (element_key, element_value) in value {
                    ser.serialize_entry(element_key, element_value)?;
                }
                ser.end()
            }
        }
    }
}
