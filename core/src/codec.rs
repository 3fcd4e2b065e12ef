//! JSON encoding for values and patches.
//!
//! The wire carries no type tags, so decoding is driven by the schema (or, for RPC arguments,
//! by the method signature).
//!
//! Patch encoding per field type:
//!
//! - scalars, connector references, enums: the new value
//! - lists: an array (replacement) or `{"ops": [["+", i, v], ["-", i], ["~", from, to]]}`
//! - maps: `{"clear": true, "put": {..}}` (replacement) or `{"put": {..}, "remove": [..]}`
//! - records: a nested patch object

use crate::diff::{FieldChange, ListOp, Patch};
use crate::error::SyncError;
use crate::id::ConnectorId;
use crate::state::{Schema, State};
use crate::value::{TypeTag, Value};
use serde_json::{json, Map, Number, Value as Json};
use std::collections::BTreeMap;

pub fn encode_value(value: &Value) -> Json {
    match value {
        Value::Null => Json::Null,
        Value::Bool(b) => Json::Bool(*b),
        Value::Int(i) => Json::from(*i),
        Value::Float(f) => encode_float(*f),
        Value::String(s) | Value::Enum(s) => Json::String(s.clone()),
        Value::List(items) => Json::Array(items.iter().map(encode_value).collect()),
        Value::Map(entries) => Json::Object(
            entries
                .iter()
                .map(|(k, v)| (k.clone(), encode_value(v)))
                .collect(),
        ),
        Value::Connector(Some(id)) => Json::String(id.as_str().to_string()),
        Value::Connector(None) => Json::Null,
        Value::Record(state) => encode_state(state),
    }
}

fn encode_float(f: f64) -> Json {
    match Number::from_f64(f) {
        Some(n) => Json::Number(n),
        None if f.is_nan() => Json::String("NaN".into()),
        None if f > 0. => Json::String("Infinity".into()),
        None => Json::String("-Infinity".into()),
    }
}

/// Encodes every field of a state.
pub fn encode_state(state: &State) -> Json {
    Json::Object(
        state
            .fields()
            .map(|(f, v)| (f.name.to_string(), encode_value(v)))
            .collect(),
    )
}

/// Decodes a JSON value as the given type.
pub fn decode_value(ty: &TypeTag, json: &Json) -> Result<Value, String> {
    let expected = || format!("expected {}, got {}", ty, json);

    match ty {
        TypeTag::Bool => json.as_bool().map(Value::Bool).ok_or_else(expected),
        TypeTag::Int => json.as_i64().map(Value::Int).ok_or_else(expected),
        TypeTag::Float => match json {
            Json::Number(n) => n.as_f64().map(Value::Float).ok_or_else(expected),
            Json::String(s) => match s.as_str() {
                "NaN" => Ok(Value::Float(f64::NAN)),
                "Infinity" => Ok(Value::Float(f64::INFINITY)),
                "-Infinity" => Ok(Value::Float(f64::NEG_INFINITY)),
                _ => Err(expected()),
            },
            _ => Err(expected()),
        },
        TypeTag::String => json
            .as_str()
            .map(|s| Value::String(s.to_string()))
            .ok_or_else(expected),
        TypeTag::Enum(variants) => match json.as_str() {
            Some(s) if variants.contains(&s) => Ok(Value::Enum(s.to_string())),
            _ => Err(expected()),
        },
        TypeTag::List(elem) => match json {
            Json::Array(items) => items
                .iter()
                .map(|i| decode_value(elem, i))
                .collect::<Result<_, _>>()
                .map(Value::List),
            _ => Err(expected()),
        },
        TypeTag::Map(elem) => match json {
            Json::Object(entries) => decode_map(elem, entries).map(Value::Map),
            _ => Err(expected()),
        },
        TypeTag::Connector => match json {
            Json::Null => Ok(Value::Connector(None)),
            Json::String(id) => Ok(Value::Connector(Some(ConnectorId::new(id.as_str())))),
            _ => Err(expected()),
        },
        TypeTag::Record(schema) => match json {
            Json::Object(fields) => decode_record(*schema, fields).map(Value::Record),
            _ => Err(expected()),
        },
        TypeTag::Any => Ok(decode_any(json)),
    }
}

fn decode_map(elem: &TypeTag, entries: &Map<String, Json>) -> Result<BTreeMap<String, Value>, String> {
    entries
        .iter()
        .map(|(k, v)| decode_value(elem, v).map(|v| (k.clone(), v)))
        .collect()
}

fn decode_record(schema: &'static Schema, fields: &Map<String, Json>) -> Result<State, String> {
    let mut state = State::new(schema);
    for (name, json) in fields {
        let field = schema
            .field(name)
            .ok_or_else(|| format!("{} has no field {}", schema.name, name))?;
        let value = decode_value(&field.ty, json).map_err(|e| format!("{}: {}", name, e))?;
        state.set(name, value).map_err(|e| e.to_string())?;
    }
    Ok(state)
}

fn decode_any(json: &Json) -> Value {
    match json {
        Json::Null => Value::Null,
        Json::Bool(b) => Value::Bool(*b),
        Json::Number(n) => match n.as_i64() {
            Some(i) => Value::Int(i),
            None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
        },
        Json::String(s) => Value::String(s.clone()),
        Json::Array(items) => Value::List(items.iter().map(decode_any).collect()),
        Json::Object(entries) => Value::Map(
            entries
                .iter()
                .map(|(k, v)| (k.clone(), decode_any(v)))
                .collect(),
        ),
    }
}

/// Encodes a patch for a state of the given schema.
pub fn encode_patch(schema: &'static Schema, patch: &Patch) -> Json {
    let mut out = Map::new();
    for (field, change) in patch.changes() {
        let ty = schema.field(field).map(|f| f.ty).unwrap_or(TypeTag::Any);
        out.insert(field.to_string(), encode_change(&ty, change));
    }
    Json::Object(out)
}

fn encode_change(ty: &TypeTag, change: &FieldChange) -> Json {
    match (ty, change) {
        (TypeTag::Map(_), FieldChange::Set(Value::Map(entries))) => json!({
            "clear": true,
            "put": encode_value(&Value::Map(entries.clone())),
        }),
        (_, FieldChange::Set(value)) => encode_value(value),
        (_, FieldChange::List(ops)) => {
            let ops: Vec<Json> = ops
                .iter()
                .map(|op| match op {
                    ListOp::Insert { index, value } => json!(["+", index, encode_value(value)]),
                    ListOp::Remove { index } => json!(["-", index]),
                    ListOp::Move { from, to } => json!(["~", from, to]),
                })
                .collect();
            json!({ "ops": ops })
        }
        (_, FieldChange::Map { put, remove }) => json!({
            "put": encode_value(&Value::Map(put.clone())),
            "remove": remove,
        }),
        (TypeTag::Record(schema), FieldChange::Record(inner)) => encode_patch(*schema, inner),
        (_, FieldChange::Record(inner)) => {
            // without a record schema the nested field types are unknown; encode self-describing
            let mut out = Map::new();
            for (field, change) in inner.changes() {
                out.insert(field.to_string(), encode_change(&TypeTag::Any, change));
            }
            Json::Object(out)
        }
    }
}

/// Decodes a patch for a state of the given schema.
pub fn decode_patch(schema: &'static Schema, json: &Json) -> Result<Patch, SyncError> {
    let fields = json
        .as_object()
        .ok_or_else(|| SyncError::MalformedMessage(format!("patch for {} is not an object", schema.name)))?;

    let mut patch = Patch::new();
    for (name, json) in fields {
        let field = schema.field(name).ok_or_else(|| SyncError::UnknownField {
            schema: schema.name,
            field: name.clone(),
        })?;
        let change = decode_change(&field.ty, json)
            .map_err(|e| SyncError::MalformedMessage(format!("{}.{}: {}", schema.name, name, e)))?;
        patch.push(name.as_str(), change);
    }
    Ok(patch)
}

fn decode_change(ty: &TypeTag, json: &Json) -> Result<FieldChange, String> {
    match (ty, json) {
        (TypeTag::List(elem), Json::Object(obj)) => {
            let ops = obj
                .get("ops")
                .and_then(Json::as_array)
                .ok_or("list edit without ops")?;
            ops.iter()
                .map(|op| decode_list_op(elem, op))
                .collect::<Result<_, _>>()
                .map(FieldChange::List)
        }
        (TypeTag::Map(elem), Json::Object(obj)) => {
            let put = match obj.get("put") {
                Some(Json::Object(entries)) => decode_map(elem, entries)?,
                Some(_) => return Err("map put is not an object".into()),
                None => BTreeMap::new(),
            };
            if obj.get("clear").and_then(Json::as_bool).unwrap_or(false) {
                return Ok(FieldChange::Set(Value::Map(put)));
            }
            let remove = match obj.get("remove") {
                Some(Json::Array(keys)) => keys
                    .iter()
                    .map(|k| k.as_str().map(str::to_string).ok_or("map key is not a string"))
                    .collect::<Result<Vec<String>, _>>()?,
                Some(_) => return Err("map remove is not an array".into()),
                None => Vec::new(),
            };
            Ok(FieldChange::Map { put, remove })
        }
        (TypeTag::Record(schema), Json::Object(_)) => decode_patch(*schema, json)
            .map(FieldChange::Record)
            .map_err(|e| e.to_string()),
        _ => decode_value(ty, json).map(FieldChange::Set),
    }
}

fn decode_list_op(elem: &TypeTag, json: &Json) -> Result<ListOp, String> {
    let op = json.as_array().ok_or("list op is not an array")?;
    let index = |i: usize| -> Result<usize, String> {
        op.get(i)
            .and_then(Json::as_u64)
            .map(|n| n as usize)
            .ok_or_else(|| format!("bad list op {}", json))
    };

    match op.first().and_then(Json::as_str) {
        Some("+") => {
            let value = op.get(2).ok_or_else(|| format!("bad list op {}", json))?;
            Ok(ListOp::Insert {
                index: index(1)?,
                value: decode_value(elem, value)?,
            })
        }
        Some("-") => Ok(ListOp::Remove { index: index(1)? }),
        Some("~") => Ok(ListOp::Move {
            from: index(1)?,
            to: index(2)?,
        }),
        _ => Err(format!("unknown list op {}", json)),
    }
}

/// Serializes a patch to wire bytes.
pub fn patch_to_bytes(schema: &'static Schema, patch: &Patch) -> Result<Vec<u8>, SyncError> {
    Ok(serde_json::to_vec(&encode_patch(schema, patch))?)
}

/// Parses wire bytes into a patch.
pub fn patch_from_bytes(schema: &'static Schema, bytes: &[u8]) -> Result<Patch, SyncError> {
    let json: Json = serde_json::from_slice(bytes)?;
    decode_patch(schema, &json)
}
