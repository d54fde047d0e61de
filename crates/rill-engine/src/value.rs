use std::fmt;

use camino::Utf8PathBuf;
use rill_hash::HashInput;
use serde::Serialize;

/// A value flowing through workflow channels.
///
/// Values end up in three places: the firing context map (script template
/// lookup), the cache key (via [`Value::to_hash_input`]) and the shell text
/// rendered into wrappers (via `Display`).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Path(Utf8PathBuf),
    List(Vec<Value>),
}

impl Value {
    pub fn to_hash_input(&self) -> HashInput {
        match self {
            Value::Null => HashInput::Null,
            Value::Bool(b) => HashInput::Bool(*b),
            Value::Int(i) => HashInput::Int(*i),
            Value::Float(f) => HashInput::Float(*f),
            Value::Str(s) => HashInput::Str(s.clone()),
            Value::Path(p) => HashInput::Path(p.clone()),
            Value::List(items) => {
                HashInput::List(items.iter().map(Value::to_hash_input).collect())
            }
        }
    }

    /// Items of a list value, or the value itself as a one-element slice.
    pub fn iter_items(&self) -> Vec<Value> {
        match self {
            Value::List(items) => items.clone(),
            other => vec![other.clone()],
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Str(s) => write!(f, "{s}"),
            Value::Path(p) => write!(f, "{p}"),
            Value::List(items) => {
                let mut first = true;
                for item in items {
                    if !first {
                        write!(f, " ")?;
                    }
                    first = false;
                    write!(f, "{item}")?;
                }
                Ok(())
            }
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<Utf8PathBuf> for Value {
    fn from(v: Utf8PathBuf) -> Self {
        Value::Path(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::List(v)
    }
}
