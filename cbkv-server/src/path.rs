//! # Sub-Document Paths
//!
//! Parses `a.b[0].c` style paths and applies one mutation to a JSON value.
//! Failures are reported as the protocol status a node would send.

use bytes::Bytes;
use serde_json::{Map, Value};

use cbkv_common::{MutationKind, Status, PATH_FLAG_CREATE_PARENTS};

/// One path step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Component {
    Key(String),
    /// Array position; negative values count from the end.
    Index(i64),
}

/// Splits a path into components.
///
/// Keys may be quoted with backticks to contain `.` or `[`.
pub fn parse_path(path: &str) -> Result<Vec<Component>, Status> {
    let bytes = path.as_bytes();
    let mut out = Vec::new();
    let mut pos = 0;
    let mut expect_key = true;

    while pos < bytes.len() {
        match bytes[pos] {
            b'[' => {
                let close = path[pos..].find(']').ok_or(Status::SubdocPathInvalid)? + pos;
                let index = path[pos + 1..close]
                    .parse::<i64>()
                    .map_err(|_| Status::SubdocPathInvalid)?;
                out.push(Component::Index(index));
                pos = close + 1;
                expect_key = false;
            }
            b'.' => {
                if expect_key {
                    return Err(Status::SubdocPathInvalid);
                }
                pos += 1;
                expect_key = true;
            }
            b'`' => {
                let close = path[pos + 1..].find('`').ok_or(Status::SubdocPathInvalid)? + pos + 1;
                out.push(Component::Key(path[pos + 1..close].to_string()));
                pos = close + 1;
                expect_key = false;
            }
            _ => {
                if !expect_key {
                    return Err(Status::SubdocPathInvalid);
                }
                let end = path[pos..]
                    .find(['.', '['])
                    .map_or(bytes.len(), |offset| pos + offset);
                out.push(Component::Key(path[pos..end].to_string()));
                pos = end;
                expect_key = false;
            }
        }
    }

    if out.is_empty() || expect_key {
        return Err(Status::SubdocPathInvalid);
    }
    Ok(out)
}

fn resolve_index(index: i64, len: usize) -> Option<usize> {
    if index < 0 {
        let back = index.unsigned_abs() as usize;
        len.checked_sub(back)
    } else if (index as usize) < len {
        Some(index as usize)
    } else {
        None
    }
}

/// Walks `path`, optionally creating missing dictionary levels.
fn walk_mut<'a>(root: &'a mut Value, path: &[Component], create: bool) -> Result<&'a mut Value, Status> {
    let mut current = root;
    for component in path {
        current = match component {
            Component::Key(key) => {
                let object = current.as_object_mut().ok_or(Status::SubdocPathMismatch)?;
                if !object.contains_key(key) {
                    if !create {
                        return Err(Status::SubdocPathNotFound);
                    }
                    object.insert(key.clone(), Value::Object(Map::new()));
                }
                object.get_mut(key).ok_or(Status::SubdocPathNotFound)?
            }
            Component::Index(index) => {
                let array = current.as_array_mut().ok_or(Status::SubdocPathMismatch)?;
                let idx = resolve_index(*index, array.len()).ok_or(Status::SubdocPathNotFound)?;
                &mut array[idx]
            }
        };
    }
    Ok(current)
}

fn parse_value(fragment: &[u8]) -> Result<Value, Status> {
    serde_json::from_slice(fragment).map_err(|_| Status::SubdocValueCantInsert)
}

/// Parses a comma-separated list of values, as array mutations accept.
fn parse_values(fragment: &[u8]) -> Result<Vec<Value>, Status> {
    let mut wrapped = Vec::with_capacity(fragment.len() + 2);
    wrapped.push(b'[');
    wrapped.extend_from_slice(fragment);
    wrapped.push(b']');
    serde_json::from_slice(&wrapped).map_err(|_| Status::SubdocValueCantInsert)
}

/// Array addressed by `path`; created empty when missing and `create` is set.
fn array_mut<'a>(root: &'a mut Value, path: &[Component], create: bool) -> Result<&'a mut Vec<Value>, Status> {
    let (last, parents) = path.split_last().ok_or(Status::SubdocPathInvalid)?;
    let parent = walk_mut(root, parents, create)?;
    let target = match last {
        Component::Key(key) => {
            let object = parent.as_object_mut().ok_or(Status::SubdocPathMismatch)?;
            if !object.contains_key(key) {
                if !create {
                    return Err(Status::SubdocPathNotFound);
                }
                object.insert(key.clone(), Value::Array(Vec::new()));
            }
            object.get_mut(key).ok_or(Status::SubdocPathNotFound)?
        }
        Component::Index(index) => {
            let array = parent.as_array_mut().ok_or(Status::SubdocPathMismatch)?;
            let idx = resolve_index(*index, array.len()).ok_or(Status::SubdocPathNotFound)?;
            &mut array[idx]
        }
    };
    target.as_array_mut().ok_or(Status::SubdocPathMismatch)
}

/// Applies one mutation in place. Returns the result value for kinds that
/// produce one (counters).
pub fn apply_mutation(
    root: &mut Value,
    kind: MutationKind,
    flags: u8,
    path: &str,
    fragment: &[u8],
) -> Result<Option<Bytes>, Status> {
    let components = parse_path(path)?;
    let create = flags & PATH_FLAG_CREATE_PARENTS != 0;
    let (last, parents) = components.split_last().ok_or(Status::SubdocPathInvalid)?;

    match kind {
        MutationKind::Insert | MutationKind::Upsert => {
            let value = parse_value(fragment)?;
            let Component::Key(key) = last else {
                return Err(Status::SubdocPathInvalid);
            };
            let object = walk_mut(root, parents, create)?
                .as_object_mut()
                .ok_or(Status::SubdocPathMismatch)?;
            if kind == MutationKind::Insert && object.contains_key(key) {
                return Err(Status::SubdocPathExists);
            }
            object.insert(key.clone(), value);
        }
        MutationKind::Replace => {
            let value = parse_value(fragment)?;
            *walk_mut(root, &components, false)? = value;
        }
        MutationKind::Delete => {
            let parent = walk_mut(root, parents, false)?;
            match last {
                Component::Key(key) => {
                    let object = parent.as_object_mut().ok_or(Status::SubdocPathMismatch)?;
                    object.remove(key).ok_or(Status::SubdocPathNotFound)?;
                }
                Component::Index(index) => {
                    let array = parent.as_array_mut().ok_or(Status::SubdocPathMismatch)?;
                    let idx = resolve_index(*index, array.len()).ok_or(Status::SubdocPathNotFound)?;
                    array.remove(idx);
                }
            }
        }
        MutationKind::ArrayAppend => {
            let values = parse_values(fragment)?;
            array_mut(root, &components, create)?.extend(values);
        }
        MutationKind::ArrayPrepend => {
            let values = parse_values(fragment)?;
            array_mut(root, &components, create)?.splice(0..0, values);
        }
        MutationKind::ArrayInsert => {
            let values = parse_values(fragment)?;
            let Component::Index(index) = *last else {
                return Err(Status::SubdocPathInvalid);
            };
            if index < 0 {
                return Err(Status::SubdocPathInvalid);
            }
            let array = walk_mut(root, parents, false)?
                .as_array_mut()
                .ok_or(Status::SubdocPathMismatch)?;
            let idx = index as usize;
            if idx > array.len() {
                return Err(Status::SubdocPathNotFound);
            }
            array.splice(idx..idx, values);
        }
        MutationKind::ArrayAddUnique => {
            let value = parse_value(fragment)?;
            if value.is_array() || value.is_object() {
                return Err(Status::SubdocValueCantInsert);
            }
            let array = array_mut(root, &components, create)?;
            if array.iter().any(|existing| existing.is_array() || existing.is_object()) {
                return Err(Status::SubdocPathMismatch);
            }
            if array.contains(&value) {
                return Err(Status::SubdocPathExists);
            }
            array.push(value);
        }
        MutationKind::Counter => {
            let delta: i64 = std::str::from_utf8(fragment)
                .ok()
                .and_then(|text| text.trim().parse().ok())
                .filter(|delta| *delta != 0)
                .ok_or(Status::SubdocDeltaRange)?;
            let parent = walk_mut(root, parents, create)?;
            let slot = match last {
                Component::Key(key) => {
                    let object = parent.as_object_mut().ok_or(Status::SubdocPathMismatch)?;
                    object.entry(key.clone()).or_insert(Value::from(0))
                }
                Component::Index(index) => {
                    let array = parent.as_array_mut().ok_or(Status::SubdocPathMismatch)?;
                    let idx = resolve_index(*index, array.len()).ok_or(Status::SubdocPathNotFound)?;
                    &mut array[idx]
                }
            };
            let current = slot.as_i64().ok_or(Status::SubdocPathMismatch)?;
            let next = current.checked_add(delta).ok_or(Status::SubdocValueCantInsert)?;
            *slot = Value::from(next);
            return Ok(Some(Bytes::from(next.to_string())));
        }
    }
    Ok(None)
}
