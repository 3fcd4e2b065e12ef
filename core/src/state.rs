//! Shared state records and their schemas.
//!
//! Every state type is described by a static [`Schema`]: a list of named, typed fields,
//! optionally extending a parent schema. Diffing and encoding are loops over the schema, so
//! connector authors only declare the shape of their state.

use crate::error::SyncError;
use crate::value::{TypeTag, Value};
use core::fmt;
use std::collections::BTreeMap;

/// Declares a static state schema.
///
/// Syntax:
///
/// ```text
/// shared_state! {
///     /// Docs.
///     pub static NAME = "TypeName" extends PARENT_SCHEMA {
///         field_name: TypeTag::Bool,
///         other_field: TypeTag::String => "default value",
///     }
/// }
/// ```
///
/// `extends` and the `=> default` parts are optional.
#[macro_export]
macro_rules! shared_state {
    (@parent) => { None };
    (@parent $parent:path) => { Some(&$parent) };
    (@default) => { None };
    (@default $default:expr) => {{
        fn default_value() -> $crate::value::Value {
            $crate::value::Value::from($default)
        }
        Some(default_value as fn() -> $crate::value::Value)
    }};
    (
        $(#[$attr:meta])*
        $vis:vis static $name:ident = $schema_name:literal $(extends $parent:path)? {
            $($field:ident : $ty:expr $(=> $default:expr)?),* $(,)?
        }
    ) => {
        $(#[$attr])*
        $vis static $name: $crate::state::Schema = $crate::state::Schema {
            name: $schema_name,
            parent: $crate::shared_state!(@parent $($parent)?),
            fields: &[
                $(
                    $crate::state::FieldDescriptor {
                        name: stringify!($field),
                        ty: $ty,
                        default: $crate::shared_state!(@default $($default)?),
                    }
                ),*
            ],
        };
    };
}

/// One field of a schema.
pub struct FieldDescriptor {
    pub name: &'static str,
    pub ty: TypeTag,
    /// Overrides the type's default value.
    pub default: Option<fn() -> Value>,
}

impl FieldDescriptor {
    pub fn default_value(&self) -> Value {
        match self.default {
            Some(default) => default(),
            None => self.ty.default_value(),
        }
    }
}

/// Describes the shape of a state record.
pub struct Schema {
    /// Type name; also used as the connector type on the wire.
    pub name: &'static str,
    /// Schema whose fields this one inherits.
    pub parent: Option<&'static Schema>,
    pub fields: &'static [FieldDescriptor],
}

impl Schema {
    /// All fields including inherited ones, parent fields first.
    pub fn all_fields(&'static self) -> Vec<&'static FieldDescriptor> {
        let mut fields = match self.parent {
            Some(parent) => parent.all_fields(),
            None => Vec::new(),
        };
        fields.extend(self.fields.iter());
        fields
    }

    pub fn field(&'static self, name: &str) -> Option<&'static FieldDescriptor> {
        self.fields
            .iter()
            .find(|f| f.name == name)
            .or_else(|| self.parent.and_then(|p| p.field(name)))
    }

    /// True if this schema is `other` or inherits from it.
    pub fn extends(&self, other: &Schema) -> bool {
        if self.name == other.name {
            return true;
        }
        self.parent.map_or(false, |p| p.extends(other))
    }
}

impl fmt::Debug for Schema {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Schema({})", self.name)
    }
}

shared_state! {
    /// Fields common to every component state.
    pub static COMPONENT_STATE = "ComponentState" {
        enabled: TypeTag::Bool => true,
        visible: TypeTag::Bool => true,
        caption: TypeTag::String,
        description: TypeTag::String,
        style_names: TypeTag::List(&TypeTag::String),
        width: TypeTag::String,
        height: TypeTag::String,
        id: TypeTag::String,
    }
}

/// A shared state record.
///
/// Mutated by the owning side only; the mirrored copy changes through patches.
#[derive(Clone)]
pub struct State {
    schema: &'static Schema,
    values: BTreeMap<&'static str, Value>,
}

impl State {
    /// Creates a state holding the schema defaults.
    pub fn new(schema: &'static Schema) -> State {
        let values = schema
            .all_fields()
            .into_iter()
            .map(|f| (f.name, f.default_value()))
            .collect();
        State { schema, values }
    }

    pub fn schema(&self) -> &'static Schema {
        self.schema
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.values.get(field)
    }

    pub fn get_bool(&self, field: &str) -> Option<bool> {
        self.get(field).and_then(Value::as_bool)
    }

    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.get(field).and_then(Value::as_str)
    }

    /// Sets a field, checking it against the schema.
    pub fn set(&mut self, field: &str, value: impl Into<Value>) -> Result<(), SyncError> {
        let descriptor = self.descriptor(field)?;
        let value = value.into();
        if !descriptor.ty.accepts(&value) {
            return Err(SyncError::TypeMismatch {
                field: field.to_string(),
                expected: descriptor.ty.to_string(),
            });
        }
        self.values.insert(descriptor.name, value);
        Ok(())
    }

    /// Iterates fields in schema order.
    pub fn fields(&self) -> impl Iterator<Item = (&'static FieldDescriptor, &Value)> {
        let values = &self.values;
        self.schema
            .all_fields()
            .into_iter()
            .filter_map(move |f| values.get(f.name).map(|v| (f, v)))
    }

    pub(crate) fn descriptor(&self, field: &str) -> Result<&'static FieldDescriptor, SyncError> {
        self.schema.field(field).ok_or_else(|| SyncError::UnknownField {
            schema: self.schema.name,
            field: field.to_string(),
        })
    }

    pub(crate) fn value_mut(&mut self, field: &str) -> Option<&mut Value> {
        self.values.get_mut(field)
    }
}

impl PartialEq for State {
    fn eq(&self, other: &State) -> bool {
        self.schema.name == other.schema.name && self.values == other.values
    }
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_map()
            .entries(self.fields().map(|(d, v)| (d.name, v)))
            .finish()
            .and_then(|_| write!(f, " as {}", self.schema.name))
    }
}
