//! Helpers for walking nested lists, tuples and dicts of values.
//!
//! Dict entries are visited in key order. Every non-container value is a leaf.

use crate::value::Value;

pub fn flatten(value: &Value) -> Vec<&Value> {
    let mut out = Vec::new();
    flatten_into(value, &mut out);
    out
}

fn flatten_into<'a>(value: &'a Value, out: &mut Vec<&'a Value>) {
    match value {
        Value::List(items) | Value::Tuple(items) => {
            for item in items {
                flatten_into(item, out);
            }
        }
        Value::Dict(map) => {
            for item in map.values() {
                flatten_into(item, out);
            }
        }
        leaf => out.push(leaf),
    }
}

/// Rebuilds `value` with every leaf replaced by `f(leaf)`.
pub fn map_leaves<E>(
    value: &Value,
    f: &mut impl FnMut(&Value) -> Result<Value, E>,
) -> Result<Value, E> {
    Ok(match value {
        Value::List(items) => Value::List(
            items
                .iter()
                .map(|v| map_leaves(v, f))
                .collect::<Result<_, _>>()?,
        ),
        Value::Tuple(items) => Value::Tuple(
            items
                .iter()
                .map(|v| map_leaves(v, f))
                .collect::<Result<_, _>>()?,
        ),
        Value::Dict(map) => Value::Dict(
            map.iter()
                .map(|(k, v)| Ok((k.clone(), map_leaves(v, f)?)))
                .collect::<Result<_, _>>()?,
        ),
        leaf => f(leaf)?,
    })
}

/// Whether two values share container nesting (ignores leaf contents).
pub fn same_structure(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::List(x), Value::List(y)) | (Value::Tuple(x), Value::Tuple(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(p, q)| same_structure(p, q))
        }
        (Value::Dict(x), Value::Dict(y)) => {
            x.len() == y.len()
                && x
                    .iter()
                    .zip(y)
                    .all(|((ka, va), (kb, vb))| ka == kb && same_structure(va, vb))
        }
        (a, b) => !a.is_container() && !b.is_container(),
    }
}

/// Fills the leaves of `structure` from `flat`, in flatten order.
///
/// Returns `None` when `flat` runs out early or has values left over.
pub fn pack_sequence_as(structure: &Value, flat: Vec<Value>) -> Option<Value> {
    let mut iter = flat.into_iter();
    let packed = map_leaves(structure, &mut |_| iter.next().ok_or(()));
    match (packed, iter.next()) {
        (Ok(value), None) => Some(value),
        _ => None,
    }
}
