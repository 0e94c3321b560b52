//! Dot-path document filters.
//!
//! Filters are equality / missing-field predicates over dot-separated
//! paths, the only query shape the engine needs; everything richer goes
//! through the pipeline library.

use serde_json::{Map, Value};

/// Reads the value at a dot-separated path, `None` when any segment is
/// absent or a non-object is traversed.
pub fn get_path<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = doc;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Writes a value at a dot-separated path, creating intermediate objects.
/// Intermediate non-objects are replaced.
pub fn set_path(doc: &mut Map<String, Value>, path: &str, value: Value) {
    match path.split_once('.') {
        None => {
            doc.insert(path.to_string(), value);
        }
        Some((head, rest)) => {
            let entry = doc
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            if let Some(child) = entry.as_object_mut() {
                set_path(child, rest, value);
            }
        }
    }
}

/// Removes the value at a dot-separated path, if present.
pub fn remove_path(doc: &mut Map<String, Value>, path: &str) {
    match path.split_once('.') {
        None => {
            doc.remove(path);
        }
        Some((head, rest)) => {
            if let Some(child) = doc.get_mut(head).and_then(Value::as_object_mut) {
                remove_path(child, rest);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Cond {
    Eq(Value),
    Missing,
}

/// Conjunction of per-path conditions.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Filter {
    clauses: Vec<(String, Cond)>,
}

impl Filter {
    pub fn new() -> Self {
        Filter::default()
    }

    /// Requires the value at `path` to equal `value`.
    pub fn eq(mut self, path: impl Into<String>, value: impl Into<Value>) -> Self {
        self.clauses.push((path.into(), Cond::Eq(value.into())));
        self
    }

    /// Requires the field at `path` to be absent (null does not count).
    pub fn missing(mut self, path: impl Into<String>) -> Self {
        self.clauses.push((path.into(), Cond::Missing));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    pub fn matches(&self, doc: &Value) -> bool {
        self.clauses.iter().all(|(path, cond)| match cond {
            Cond::Eq(expected) => get_path(doc, path) == Some(expected),
            Cond::Missing => get_path(doc, path).is_none(),
        })
    }

    /// Seed document for upserts: every equality clause becomes a field.
    pub fn equality_seed(&self) -> Map<String, Value> {
        let mut seed = Map::new();
        for (path, cond) in &self.clauses {
            if let Cond::Eq(value) = cond {
                set_path(&mut seed, path, value.clone());
            }
        }
        seed
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
