//! Values that can live in shared state or travel as RPC arguments.

use crate::id::ConnectorId;
use crate::state::{Schema, State};
use core::fmt;
use std::collections::BTreeMap;

/// A state field value.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    /// One variant of an enumerated type, by name.
    Enum(String),
    List(Vec<Value>),
    /// String-keyed mapping. Connector-keyed maps use the id as key.
    Map(BTreeMap<String, Value>),
    /// A (nullable) reference to another connector.
    Connector(Option<ConnectorId>),
    /// A nested sub-state record.
    Record(State),
}

impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            // exact bit equality: no epsilon, and NaN equals itself
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Enum(a), Value::Enum(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            (Value::Connector(a), Value::Connector(b)) => a == b,
            (Value::Record(a), Value::Record(b)) => a == b,
            _ => false,
        }
    }
}

impl Value {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) | Value::Enum(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_connector(&self) -> Option<&ConnectorId> {
        match self {
            Value::Connector(c) => c.as_ref(),
            _ => None,
        }
    }

    pub fn as_record(&self) -> Option<&State> {
        match self {
            Value::Record(r) => Some(r),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Value {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Value {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Value {
        Value::Int(i.into())
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Value {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Value {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Value {
        Value::String(s)
    }
}

impl From<ConnectorId> for Value {
    fn from(id: ConnectorId) -> Value {
        Value::Connector(Some(id))
    }
}

impl From<Vec<Value>> for Value {
    fn from(l: Vec<Value>) -> Value {
        Value::List(l)
    }
}

impl From<State> for Value {
    fn from(r: State) -> Value {
        Value::Record(r)
    }
}

/// Describes the type of a state field or RPC parameter.
#[derive(Clone, Copy)]
pub enum TypeTag {
    Bool,
    Int,
    Float,
    String,
    /// Enumerated type; the first variant is the default.
    Enum(&'static [&'static str]),
    List(&'static TypeTag),
    Map(&'static TypeTag),
    Connector,
    Record(&'static Schema),
    /// Self-describing; used where the wire carries no type information.
    Any,
}

impl TypeTag {
    /// The value a freshly created state holds for this type.
    pub fn default_value(&self) -> Value {
        match self {
            TypeTag::Bool => Value::Bool(false),
            TypeTag::Int => Value::Int(0),
            TypeTag::Float => Value::Float(0.),
            TypeTag::String => Value::String(String::new()),
            TypeTag::Enum(variants) => {
                Value::Enum(variants.first().map(|v| v.to_string()).unwrap_or_default())
            }
            TypeTag::List(_) => Value::List(Vec::new()),
            TypeTag::Map(_) => Value::Map(BTreeMap::new()),
            TypeTag::Connector => Value::Connector(None),
            TypeTag::Record(schema) => Value::Record(State::new(*schema)),
            TypeTag::Any => Value::Null,
        }
    }

    /// Checks whether a value conforms to this type.
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (TypeTag::Any, _) => true,
            (TypeTag::Bool, Value::Bool(_)) => true,
            (TypeTag::Int, Value::Int(_)) => true,
            (TypeTag::Float, Value::Float(_)) => true,
            (TypeTag::String, Value::String(_)) => true,
            (TypeTag::Enum(variants), Value::Enum(v)) => variants.contains(&v.as_str()),
            (TypeTag::List(elem), Value::List(items)) => items.iter().all(|i| elem.accepts(i)),
            (TypeTag::Map(elem), Value::Map(entries)) => entries.values().all(|v| elem.accepts(v)),
            (TypeTag::Connector, Value::Connector(_)) => true,
            (TypeTag::Record(schema), Value::Record(record)) => record.schema().name == schema.name,
            _ => false,
        }
    }

    /// True if values of this type can be compared element by element in a list diff.
    pub(crate) fn is_scalar(&self) -> bool {
        !matches!(
            self,
            TypeTag::List(_) | TypeTag::Map(_) | TypeTag::Record(_) | TypeTag::Any
        )
    }
}

impl fmt::Debug for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TypeTag::Bool => write!(f, "bool"),
            TypeTag::Int => write!(f, "int"),
            TypeTag::Float => write!(f, "float"),
            TypeTag::String => write!(f, "string"),
            TypeTag::Enum(variants) => write!(f, "enum {:?}", variants),
            TypeTag::List(elem) => write!(f, "list<{}>", elem),
            TypeTag::Map(elem) => write!(f, "map<string, {}>", elem),
            TypeTag::Connector => write!(f, "connector"),
            TypeTag::Record(schema) => write!(f, "{}", schema.name),
            TypeTag::Any => write!(f, "any"),
        }
    }
}
