//! Structural diff between two JSON documents, expressed as a JSON patch.
//!
//! Objects are compared key by key. Arrays and scalars are opaque: any change
//! replaces the whole value. Paths use JSON Pointer syntax.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use recordsync_common::{Error, Result};

/// One JSON patch operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOperation {
    /// Add a member that was absent.
    Add { path: String, value: Value },
    /// Remove a member.
    Remove { path: String },
    /// Replace the value at `path`.
    Replace { path: String, value: Value },
}

impl PatchOperation {
    /// Path this operation applies to.
    pub fn path(&self) -> &str {
        match self {
            PatchOperation::Add { path, .. }
            | PatchOperation::Remove { path }
            | PatchOperation::Replace { path, .. } => path,
        }
    }

    /// Wire form of the operation.
    pub fn to_value(&self) -> Value {
        match self {
            PatchOperation::Add { path, value } => json!({"op": "add", "path": path, "value": value}),
            PatchOperation::Remove { path } => json!({"op": "remove", "path": path}),
            PatchOperation::Replace { path, value } => {
                json!({"op": "replace", "path": path, "value": value})
            }
        }
    }
}

/// Escape one reference token (`~` → `~0`, `/` → `~1`).
pub fn escape_token(token: &str) -> String {
    token.replace('~', "~0").replace('/', "~1")
}

fn unescape_token(token: &str) -> String {
    token.replace("~1", "/").replace("~0", "~")
}

/// Operations turning `from` into `to`. Empty when the documents are equal.
pub fn diff(from: &Value, to: &Value) -> Vec<PatchOperation> {
    let mut operations = Vec::new();
    diff_at("", from, to, &mut operations);
    operations
}

fn diff_at(pointer: &str, from: &Value, to: &Value, operations: &mut Vec<PatchOperation>) {
    match (from, to) {
        (Value::Object(old), Value::Object(new)) => {
            for (key, old_value) in old {
                let path = format!("{}/{}", pointer, escape_token(key));
                match new.get(key) {
                    Some(new_value) => diff_at(&path, old_value, new_value, operations),
                    None => operations.push(PatchOperation::Remove { path }),
                }
            }
            for (key, new_value) in new {
                if !old.contains_key(key) {
                    operations.push(PatchOperation::Add {
                        path: format!("{}/{}", pointer, escape_token(key)),
                        value: new_value.clone(),
                    });
                }
            }
        }
        _ if from == to => {}
        _ => operations.push(PatchOperation::Replace {
            path: pointer.to_string(),
            value: to.clone(),
        }),
    }
}

/// JSON patch document for a list of operations.
pub fn to_document(operations: &[PatchOperation]) -> Value {
    Value::Array(operations.iter().map(PatchOperation::to_value).collect())
}

/// Apply operations produced by [`diff`] to a document.
///
/// Only object members are addressed; array indices are not supported.
///
/// # Errors
/// - `InvalidInput` if a path does not resolve to an object member
pub fn apply(document: &Value, operations: &[PatchOperation]) -> Result<Value> {
    let mut result = document.clone();

    for operation in operations {
        let path = operation.path();
        if path.is_empty() {
            match operation {
                PatchOperation::Add { value, .. } | PatchOperation::Replace { value, .. } => {
                    result = value.clone();
                }
                PatchOperation::Remove { .. } => result = Value::Null,
            }
            continue;
        }

        let (parent, key) = split_last(path)?;
        let target = parent_object(&mut result, parent)?;
        match operation {
            PatchOperation::Add { value, .. } | PatchOperation::Replace { value, .. } => {
                target.insert(key, value.clone());
            }
            PatchOperation::Remove { .. } => {
                target.remove(&key);
            }
        }
    }

    Ok(result)
}

fn split_last(path: &str) -> Result<(&str, String)> {
    let index = path
        .rfind('/')
        .ok_or_else(|| Error::InvalidInput(format!("Invalid JSON pointer: {}", path)))?;
    Ok((&path[..index], unescape_token(&path[index + 1..])))
}

fn parent_object<'a>(document: &'a mut Value, pointer: &str) -> Result<&'a mut Map<String, Value>> {
    let target = if pointer.is_empty() {
        Some(document)
    } else {
        document.pointer_mut(pointer)
    };

    target
        .and_then(Value::as_object_mut)
        .ok_or_else(|| Error::InvalidInput(format!("No object at {}", pointer)))
}
