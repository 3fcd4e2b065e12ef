//! State diffing.
//!
//! A [`Patch`] lists the fields that differ between two states of the same schema. Flat fields
//! are replaced whole; lists, maps and nested records get element-level changes when those are
//! smaller than sending the new value.

use crate::error::SyncError;
use crate::state::State;
use crate::value::{TypeTag, Value};
use std::collections::BTreeMap;

/// One element-level list edit. Edits apply in order, each to the result of the previous one.
#[derive(Debug, Clone, PartialEq)]
pub enum ListOp {
    Insert { index: usize, value: Value },
    Remove { index: usize },
    /// Removes the element at `from` and reinserts it at `to`.
    Move { from: usize, to: usize },
}

/// How a single field changed.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldChange {
    /// Full replacement.
    Set(Value),
    List(Vec<ListOp>),
    Map {
        put: BTreeMap<String, Value>,
        remove: Vec<String>,
    },
    /// Nested record changes.
    Record(Patch),
}

/// The minimal description of what changed in a state record.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Patch {
    changes: Vec<(String, FieldChange)>,
}

impl Patch {
    pub fn new() -> Patch {
        Patch::default()
    }

    pub fn push(&mut self, field: impl Into<String>, change: FieldChange) {
        self.changes.push((field.into(), change));
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn get(&self, field: &str) -> Option<&FieldChange> {
        self.changes.iter().find(|(f, _)| f == field).map(|(_, c)| c)
    }

    pub fn changes(&self) -> impl Iterator<Item = (&str, &FieldChange)> {
        self.changes.iter().map(|(f, c)| (f.as_str(), c))
    }

    pub fn changed_fields(&self) -> Vec<String> {
        self.changes.iter().map(|(f, _)| f.clone()).collect()
    }
}

/// Computes the patch that turns `previous` into `current`.
///
/// Comparison is by value: a field written with its old value is not a change.
pub fn diff(previous: &State, current: &State) -> Patch {
    debug_assert_eq!(previous.schema().name, current.schema().name);

    let mut patch = Patch::new();
    for (field, value) in current.fields() {
        match previous.get(field.name) {
            Some(old) if old == value => (),
            Some(old) => patch.push(field.name, diff_field(&field.ty, old, value)),
            None => patch.push(field.name, FieldChange::Set(value.clone())),
        }
    }
    patch
}

/// Diffs a state against its schema defaults; used the first time a connector is sent.
pub fn diff_from_defaults(current: &State) -> Patch {
    diff(&State::new(current.schema()), current)
}

fn diff_field(ty: &TypeTag, old: &Value, new: &Value) -> FieldChange {
    match (ty, old, new) {
        (TypeTag::List(elem), Value::List(a), Value::List(b)) if elem.is_scalar() => {
            match diff_list(a, b) {
                Some(ops) => FieldChange::List(ops),
                None => FieldChange::Set(new.clone()),
            }
        }
        (TypeTag::Map(_), Value::Map(a), Value::Map(b)) => diff_map(a, b),
        (TypeTag::Record(_), Value::Record(a), Value::Record(b)) => FieldChange::Record(diff(a, b)),
        _ => FieldChange::Set(new.clone()),
    }
}

/// Returns `None` when replacing the list is no larger than editing it.
fn diff_list(old: &[Value], new: &[Value]) -> Option<Vec<ListOp>> {
    let prefix = old.iter().zip(new).take_while(|(a, b)| a == b).count();
    let max_suffix = old.len().min(new.len()) - prefix;
    let suffix = old
        .iter()
        .rev()
        .zip(new.iter().rev())
        .take(max_suffix)
        .take_while(|(a, b)| a == b)
        .count();

    let o = &old[prefix..old.len() - suffix];
    let n = &new[prefix..new.len() - suffix];

    let mut ops = Vec::new();
    if o.len() == n.len() && o.len() >= 2 {
        let last = o.len() - 1;
        if o[0] == n[last] && o[1..] == n[..last] {
            ops.push(ListOp::Move {
                from: prefix,
                to: prefix + last,
            });
        } else if o[last] == n[0] && o[..last] == n[1..] {
            ops.push(ListOp::Move {
                from: prefix + last,
                to: prefix,
            });
        }
    }

    if ops.is_empty() {
        ops.extend(o.iter().map(|_| ListOp::Remove { index: prefix }));
        ops.extend(n.iter().enumerate().map(|(i, value)| ListOp::Insert {
            index: prefix + i,
            value: value.clone(),
        }));
    }

    if ops.len() >= new.len() {
        None
    } else {
        Some(ops)
    }
}

fn diff_map(old: &BTreeMap<String, Value>, new: &BTreeMap<String, Value>) -> FieldChange {
    let put: BTreeMap<_, _> = new
        .iter()
        .filter(|(k, v)| old.get(*k) != Some(*v))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    let remove: Vec<_> = old.keys().filter(|k| !new.contains_key(*k)).cloned().collect();

    if put.len() + remove.len() >= new.len() {
        FieldChange::Set(Value::Map(new.clone()))
    } else {
        FieldChange::Map { put, remove }
    }
}

/// Applies a patch. Returns the names of the fields it touched.
///
/// All or nothing: if any change fails, `state` is left as it was.
pub fn apply(state: &mut State, patch: &Patch) -> Result<Vec<String>, SyncError> {
    let mut updated = state.clone();
    let changed = apply_in_place(&mut updated, patch)?;
    *state = updated;
    Ok(changed)
}

fn apply_in_place(state: &mut State, patch: &Patch) -> Result<Vec<String>, SyncError> {
    let schema_name = state.schema().name;
    let mut changed = Vec::with_capacity(patch.len());
    for (field, change) in patch.changes() {
        let descriptor = state.descriptor(field)?;
        let value = state
            .value_mut(descriptor.name)
            .ok_or_else(|| SyncError::UnknownField {
                schema: schema_name,
                field: field.to_string(),
            })?;
        apply_change(field, &descriptor.ty, value, change)?;
        changed.push(field.to_string());
    }
    Ok(changed)
}

fn apply_change(
    field: &str,
    ty: &TypeTag,
    target: &mut Value,
    change: &FieldChange,
) -> Result<(), SyncError> {
    let mismatch = || SyncError::TypeMismatch {
        field: field.to_string(),
        expected: ty.to_string(),
    };
    // element type of a list or map field; `Any` fields take anything
    let elem = match ty {
        TypeTag::List(elem) | TypeTag::Map(elem) => *elem,
        _ => &TypeTag::Any,
    };

    match change {
        FieldChange::Set(value) => {
            if !ty.accepts(value) {
                return Err(mismatch());
            }
            *target = value.clone();
        }
        FieldChange::List(ops) => {
            let list = match target {
                Value::List(list) => list,
                _ => return Err(mismatch()),
            };
            for op in ops {
                if let ListOp::Insert { value, .. } = op {
                    if !elem.accepts(value) {
                        return Err(mismatch());
                    }
                }
                apply_list_op(field, list, op)?;
            }
        }
        FieldChange::Map { put, remove } => {
            let map = match target {
                Value::Map(map) => map,
                _ => return Err(mismatch()),
            };
            if !put.values().all(|value| elem.accepts(value)) {
                return Err(mismatch());
            }
            for key in remove {
                map.remove(key);
            }
            for (key, value) in put {
                map.insert(key.clone(), value.clone());
            }
        }
        FieldChange::Record(patch) => match target {
            Value::Record(record) => {
                apply_in_place(record, patch)?;
            }
            _ => return Err(mismatch()),
        },
    }
    Ok(())
}

fn apply_list_op(field: &str, list: &mut Vec<Value>, op: &ListOp) -> Result<(), SyncError> {
    let out_of_range = |index: usize| {
        SyncError::MalformedMessage(format!("list edit at {} out of range for {}", index, field))
    };

    match op {
        ListOp::Insert { index, value } => {
            if *index > list.len() {
                return Err(out_of_range(*index));
            }
            list.insert(*index, value.clone());
        }
        ListOp::Remove { index } => {
            if *index >= list.len() {
                return Err(out_of_range(*index));
            }
            list.remove(*index);
        }
        ListOp::Move { from, to } => {
            if *from >= list.len() || *to >= list.len() {
                return Err(out_of_range(*from.max(to)));
            }
            let value = list.remove(*from);
            list.insert(*to, value);
        }
    }
    Ok(())
}
