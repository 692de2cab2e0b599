//! Schema adapters validating flow input/success/error payloads.
//!
//! `SchemaAdapter` is a plain sync trait plus a `#[cfg(feature = "async")]`
//! async counterpart, rather than one trait with an `async fn`, since an
//! object-safe async trait without `async-trait`'s boxing would lose
//! dyn-compatibility.

use async_trait::async_trait;

/// A minimal JSON-shaped value schema adapters validate against.
///
/// Kept crate-local rather than re-exporting `serde_json::Value` directly
/// so `schema::custom` works with the `schema-json` feature off. When
/// `schema-json` is enabled, [`Value::from_json`]/[`Value::into_json`]
/// convert losslessly to/from `serde_json::Value`.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Array(Vec<Value>),
    Object(Vec<(String, Value)>),
}

#[cfg(feature = "schema-json")]
impl Value {
    /// Converts from `serde_json::Value`, preserving object key order.
    pub fn from_json(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(0.0)),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => Value::Object(
                map.into_iter()
                    .map(|(k, v)| (k, Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Converts to `serde_json::Value`.
    pub fn into_json(self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(b),
            Value::Number(n) => serde_json::json!(n),
            Value::String(s) => serde_json::Value::String(s),
            Value::Array(items) => {
                serde_json::Value::Array(items.into_iter().map(Value::into_json).collect())
            }
            Value::Object(fields) => serde_json::Value::Object(
                fields
                    .into_iter()
                    .map(|(k, v)| (k, v.into_json()))
                    .collect(),
            ),
        }
    }
}

/// A single validation failure, feeding `GraphError::Schema`.
#[derive(Debug, Clone)]
pub struct SchemaIssue {
    pub message: String,
    pub path: Option<String>,
}

impl std::fmt::Display for SchemaIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.path {
            Some(path) => write!(f, "{path}: {}", self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

/// Validates a [`Value`] into a typed `T`, synchronously.
///
/// # Examples
///
/// ```rust
/// use scopegraph::schema::{SchemaAdapter, SchemaIssue, Value};
///
/// struct PositiveInt;
///
/// impl SchemaAdapter<i64> for PositiveInt {
///     fn validate(&self, input: Value) -> Result<i64, Vec<SchemaIssue>> {
///         match input {
///             Value::Number(n) if n >= 0.0 => Ok(n as i64),
///             other => Err(vec![SchemaIssue {
///                 message: format!("expected a non-negative number, found {other:?}"),
///                 path: None,
///             }]),
///         }
///     }
/// }
///
/// assert_eq!(PositiveInt.validate(Value::Number(4.0)).unwrap(), 4);
/// assert!(PositiveInt.validate(Value::Number(-1.0)).is_err());
/// ```
pub trait SchemaAdapter<T>: Send + Sync {
    /// Validates `input`, returning every failure found rather than
    /// stopping at the first one.
    fn validate(&self, input: Value) -> Result<T, Vec<SchemaIssue>>;
}

/// Validates a [`Value`] into a typed `T` asynchronously.
///
/// Separate from [`SchemaAdapter`] rather than folded into it via
/// `async-trait`'s boxed-future default, so synchronous flows never pay for
/// a `Pin<Box<dyn Future>>` allocation on the hot validation path.
#[async_trait]
pub trait AsyncSchemaAdapter<T>: Send + Sync {
    async fn validate_async(&self, input: Value) -> Result<T, Vec<SchemaIssue>>;
}

/// A passthrough adapter accepting any `T` already shaped as itself.
struct CustomAdapter<T> {
    _marker: std::marker::PhantomData<fn() -> T>,
}

/// Builds a passthrough schema adapter for values that arrive pre-typed.
///
/// No validation is performed; the value is accepted as-is. Only meaningful
/// where `T` can be produced directly from a [`Value::Object`]-free path;
/// callers that need real validation should implement [`SchemaAdapter`]
/// directly.
///
/// # Examples
///
/// ```rust
/// use scopegraph::schema::{custom, SchemaAdapter, Value};
///
/// let adapter = custom::<String>();
/// assert_eq!(
///     adapter.validate(Value::String("ok".into())).unwrap(),
///     "ok"
/// );
/// ```
pub fn custom<T>() -> impl SchemaAdapter<T>
where
    T: TryFrom<Value, Error = SchemaIssue> + Send + Sync,
{
    CustomAdapter {
        _marker: std::marker::PhantomData,
    }
}

impl<T> SchemaAdapter<T> for CustomAdapter<T>
where
    T: TryFrom<Value, Error = SchemaIssue> + Send + Sync,
{
    fn validate(&self, input: Value) -> Result<T, Vec<SchemaIssue>> {
        T::try_from(input).map_err(|issue| vec![issue])
    }
}

impl TryFrom<Value> for String {
    type Error = SchemaIssue;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::String(s) => Ok(s),
            other => Err(SchemaIssue {
                message: format!("expected a string, found {other:?}"),
                path: None,
            }),
        }
    }
}

impl TryFrom<Value> for i64 {
    type Error = SchemaIssue;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Number(n) => Ok(n as i64),
            other => Err(SchemaIssue {
                message: format!("expected a number, found {other:?}"),
                path: None,
            }),
        }
    }
}

impl TryFrom<Value> for bool {
    type Error = SchemaIssue;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Bool(b) => Ok(b),
            other => Err(SchemaIssue {
                message: format!("expected a bool, found {other:?}"),
                path: None,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn custom_passthrough_accepts_matching_shape() {
        let adapter = custom::<i64>();
        assert_eq!(adapter.validate(Value::Number(42.0)).unwrap(), 42);
    }

    #[test]
    fn custom_passthrough_rejects_wrong_shape() {
        let adapter = custom::<i64>();
        assert!(adapter.validate(Value::String("nope".into())).is_err());
    }

    #[cfg(feature = "schema-json")]
    #[test]
    fn value_roundtrips_through_json() {
        let json = serde_json::json!({"a": 1, "b": [true, null]});
        let value = Value::from_json(json.clone());
        assert_eq!(value.into_json(), json);
    }
}
