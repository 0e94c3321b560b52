//! Pipeline execution over document lists and store collections.
//!
//! [`transform`] runs stages over an in-memory document list and is
//! what unit tests and single-document update pipelines build on.
//! [`aggregate`] reads a source collection from a [`DocumentStore`]
//! first and additionally enables the store-backed stages (`Lookup`,
//! `Merge`, `Out`). Source documents are cloned out of their collection
//! before any target collection is locked, so a pipeline never holds
//! two collection locks at once.

use super::expr::{compare, nullish, truthy, Scope};
use super::{Accumulator, Expr, MatchCond, MergePolicy, Pipeline, PipelineError, SortOrder, Stage};
use crate::pipeline::quantile::QuantileSketch;
use crate::store::filter::{get_path, remove_path, set_path};
use crate::store::{DocumentStore, Filter};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

/// Runs a pipeline against a store collection.
pub fn aggregate(
    store: &DocumentStore,
    source: &str,
    pipeline: &Pipeline,
) -> Result<Vec<Value>, PipelineError> {
    let docs = store.read_all(source)?;
    let read = docs.len();
    let out = execute_stages(docs, &pipeline.stages, Some(store), &[])?;
    tracing::debug!(
        source,
        stages = pipeline.stages.len(),
        read,
        emitted = out.len(),
        "pipeline complete"
    );
    Ok(out)
}

/// Runs stages over an in-memory document list. Store-backed stages
/// fail with [`PipelineError::RequiresStore`].
pub fn transform(docs: Vec<Value>, stages: &[Stage]) -> Result<Vec<Value>, PipelineError> {
    execute_stages(docs, stages, None, &[])
}

/// Applies a document-level update pipeline to one document in place.
pub fn update_document(doc: &mut Value, stages: &[Stage]) -> Result<(), PipelineError> {
    let out = execute_stages(vec![doc.clone()], stages, None, &[])?;
    let mut out = out.into_iter();
    match (out.next(), out.next()) {
        (Some(updated), None) => {
            *doc = updated;
            Ok(())
        }
        _ => Err(PipelineError::TypeMismatch {
            expected: "exactly one document",
            context: "update pipeline",
        }),
    }
}

/// Updates the first document matching `filter`, or seeds a new one
/// from the filter's equality fields and updates that. Returns the
/// resulting document.
pub fn upsert_with_pipeline(
    docs: &mut Vec<Value>,
    filter: &Filter,
    stages: &[Stage],
) -> Result<Value, PipelineError> {
    match docs.iter_mut().find(|doc| filter.matches(doc)) {
        Some(doc) => {
            update_document(doc, stages)?;
            Ok(doc.clone())
        }
        None => {
            let mut doc = Value::Object(filter.equality_seed());
            update_document(&mut doc, stages)?;
            docs.push(doc.clone());
            Ok(doc)
        }
    }
}

/// Updates the first document matching `filter`, returning the updated
/// document, or `None` when nothing matched.
pub fn update_one(
    docs: &mut [Value],
    filter: &Filter,
    stages: &[Stage],
) -> Result<Option<Value>, PipelineError> {
    match docs.iter_mut().find(|doc| filter.matches(doc)) {
        Some(doc) => {
            update_document(doc, stages)?;
            Ok(Some(doc.clone()))
        }
        None => Ok(None),
    }
}

fn scope_for<'a>(doc: &'a Value, vars: &[(String, Value)]) -> Scope<'a> {
    if vars.is_empty() {
        Scope::new(doc)
    } else {
        Scope::new(doc).with_vars(vars.to_vec())
    }
}

/// Deterministic string key over a tuple of document values.
fn composite_key(doc: &Value, paths: &[String]) -> String {
    let parts: Vec<Value> = paths
        .iter()
        .map(|path| get_path(doc, path).cloned().unwrap_or(Value::Null))
        .collect();
    Value::Array(parts).to_string()
}

fn execute_stages(
    mut docs: Vec<Value>,
    stages: &[Stage],
    store: Option<&DocumentStore>,
    outer_vars: &[(String, Value)],
) -> Result<Vec<Value>, PipelineError> {
    for stage in stages {
        match stage {
            Stage::Match(cond) => {
                let mut kept = Vec::with_capacity(docs.len());
                for doc in docs {
                    let keep = match cond {
                        MatchCond::Query(filter) => filter.matches(&doc),
                        MatchCond::Cond(expr) => {
                            truthy(expr.eval(&scope_for(&doc, outer_vars))?.as_ref())
                        }
                    };
                    if keep {
                        kept.push(doc);
                    }
                }
                docs = kept;
            }

            Stage::Set(assignments) => {
                for doc in docs.iter_mut() {
                    // All expressions see the pre-stage document.
                    let mut results = Vec::with_capacity(assignments.len());
                    {
                        let scope = scope_for(doc, outer_vars);
                        for (path, expr) in assignments {
                            results.push((path.as_str(), expr.eval(&scope)?));
                        }
                    }
                    let map = doc.as_object_mut().ok_or(PipelineError::NotAnObject)?;
                    for (path, value) in results {
                        match value {
                            Some(value) => set_path(map, path, value),
                            None => remove_path(map, path),
                        }
                    }
                }
            }

            Stage::Project(paths) => {
                for doc in docs.iter_mut() {
                    let mut out = Map::new();
                    for path in paths {
                        if let Some(value) = get_path(doc, path) {
                            set_path(&mut out, path, value.clone());
                        }
                    }
                    *doc = Value::Object(out);
                }
            }

            Stage::Unset(paths) => {
                for doc in docs.iter_mut() {
                    let map = doc.as_object_mut().ok_or(PipelineError::NotAnObject)?;
                    for path in paths {
                        remove_path(map, path);
                    }
                }
            }

            Stage::ReplaceWith(expr) => {
                for doc in docs.iter_mut() {
                    match expr.eval(&scope_for(doc, outer_vars))? {
                        Some(replacement @ Value::Object(_)) => *doc = replacement,
                        _ => return Err(PipelineError::NotAnObject),
                    }
                }
            }

            Stage::Group { id, fields } => {
                docs = run_group(docs, id, fields, outer_vars)?;
            }

            Stage::Sort(keys) => {
                sort_documents(&mut docs, keys);
            }

            Stage::Limit(n) => {
                docs.truncate(*n);
            }

            Stage::Lookup {
                from,
                local_field,
                foreign_field,
                let_vars,
                pipeline,
                as_field,
            } => {
                let store = store.ok_or(PipelineError::RequiresStore("lookup"))?;
                let foreign = store.read_all(from)?;
                for doc in docs.iter_mut() {
                    let local = get_path(doc, local_field).cloned().unwrap_or(Value::Null);
                    let matched: Vec<Value> = foreign
                        .iter()
                        .filter(|candidate| {
                            let key = get_path(candidate, foreign_field).unwrap_or(&Value::Null);
                            compare(key, &local) == Ordering::Equal
                        })
                        .cloned()
                        .collect();

                    let mut bound = outer_vars.to_vec();
                    {
                        let scope = scope_for(doc, outer_vars);
                        for (name, expr) in let_vars {
                            bound.push((name.clone(), expr.eval(&scope)?.unwrap_or(Value::Null)));
                        }
                    }
                    let joined = execute_stages(matched, pipeline, Some(store), &bound)?;

                    let map = doc.as_object_mut().ok_or(PipelineError::NotAnObject)?;
                    set_path(map, as_field, Value::Array(joined));
                }
            }

            Stage::WindowShift {
                partition_by,
                sort_by,
                target,
                source,
                by,
            } => {
                let mut partitions: BTreeMap<String, Vec<usize>> = BTreeMap::new();
                for (index, doc) in docs.iter().enumerate() {
                    partitions
                        .entry(composite_key(doc, partition_by))
                        .or_default()
                        .push(index);
                }

                let mut updates: Vec<(usize, Option<Value>)> = Vec::with_capacity(docs.len());
                for indices in partitions.values_mut() {
                    indices.sort_by(|&a, &b| compare_by_keys(&docs[a], &docs[b], sort_by));
                    let len = indices.len() as i64;
                    for (position, &index) in indices.iter().enumerate() {
                        let neighbour = position as i64 + by;
                        let value = if (0..len).contains(&neighbour) {
                            let neighbour_doc = &docs[indices[neighbour as usize]];
                            source.eval(&scope_for(neighbour_doc, outer_vars))?
                        } else {
                            None
                        };
                        updates.push((index, value));
                    }
                }

                for (index, value) in updates {
                    let map = docs[index]
                        .as_object_mut()
                        .ok_or(PipelineError::NotAnObject)?;
                    match value {
                        Some(value) => set_path(map, target, value),
                        None => remove_path(map, target),
                    }
                }
            }

            Stage::Merge {
                into,
                on,
                when_matched,
            } => {
                let store = store.ok_or(PipelineError::RequiresStore("merge"))?;
                let incoming = std::mem::take(&mut docs);
                store.with_collection_mut(into, |target: &mut Vec<Value>| {
                    let mut index: HashMap<String, usize> = target
                        .iter()
                        .enumerate()
                        .map(|(i, doc)| (composite_key(doc, on), i))
                        .collect();
                    for doc in incoming {
                        let key = composite_key(&doc, on);
                        match index.get(&key).copied() {
                            None => {
                                index.insert(key, target.len());
                                target.push(doc);
                            }
                            Some(i) => match when_matched {
                                MergePolicy::KeepExisting => {}
                                MergePolicy::Replace => target[i] = doc,
                                MergePolicy::Merge => {
                                    let incoming_fields = match doc {
                                        Value::Object(map) => map,
                                        _ => return Err(PipelineError::NotAnObject),
                                    };
                                    let existing = target[i]
                                        .as_object_mut()
                                        .ok_or(PipelineError::NotAnObject)?;
                                    for (key, value) in incoming_fields {
                                        existing.insert(key, value);
                                    }
                                }
                            },
                        }
                    }
                    Ok(())
                })?;
            }

            Stage::Out(name) => {
                let store = store.ok_or(PipelineError::RequiresStore("out"))?;
                store.replace_collection(name, std::mem::take(&mut docs))?;
            }
        }
    }
    Ok(docs)
}

fn compare_by_keys(a: &Value, b: &Value, keys: &[(String, SortOrder)]) -> Ordering {
    for (path, order) in keys {
        let ordering = compare(
            nullish(&get_path(a, path).cloned()),
            nullish(&get_path(b, path).cloned()),
        );
        let ordering = match order {
            SortOrder::Asc => ordering,
            SortOrder::Desc => ordering.reverse(),
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

fn sort_documents(docs: &mut [Value], keys: &[(String, SortOrder)]) {
    docs.sort_by(|a, b| compare_by_keys(a, b, keys));
}

// ─────────────────────────────────────────────────────────────────────────────
// Group
// ─────────────────────────────────────────────────────────────────────────────

/// One accumulator's running state; carries its own expression so a
/// group only ever advances a state against the current document.
enum AccState {
    First {
        expr: Expr,
        slot: Option<Option<Value>>,
    },
    FirstN {
        expr: Expr,
        limit: usize,
        values: Vec<Value>,
    },
    Last {
        expr: Expr,
        slot: Option<Option<Value>>,
    },
    Push {
        expr: Expr,
        values: Vec<Value>,
    },
    Min {
        expr: Expr,
        best: Option<Value>,
    },
    Max {
        expr: Expr,
        best: Option<Value>,
    },
    Avg {
        expr: Expr,
        sum: f64,
        n: u64,
    },
    Sum {
        expr: Expr,
        sum: f64,
    },
    Count(u64),
    Percentiles {
        expr: Expr,
        sketch: QuantileSketch,
        points: Vec<(String, f64)>,
    },
}

impl AccState {
    fn new(acc: &Accumulator) -> AccState {
        match acc {
            Accumulator::First(expr) => AccState::First {
                expr: expr.clone(),
                slot: None,
            },
            Accumulator::FirstN(expr, n) => AccState::FirstN {
                expr: expr.clone(),
                limit: *n,
                values: Vec::new(),
            },
            Accumulator::Last(expr) => AccState::Last {
                expr: expr.clone(),
                slot: None,
            },
            Accumulator::Push(expr) => AccState::Push {
                expr: expr.clone(),
                values: Vec::new(),
            },
            Accumulator::Min(expr) => AccState::Min {
                expr: expr.clone(),
                best: None,
            },
            Accumulator::Max(expr) => AccState::Max {
                expr: expr.clone(),
                best: None,
            },
            Accumulator::Avg(expr) => AccState::Avg {
                expr: expr.clone(),
                sum: 0.0,
                n: 0,
            },
            Accumulator::Sum(expr) => AccState::Sum {
                expr: expr.clone(),
                sum: 0.0,
            },
            Accumulator::Count => AccState::Count(0),
            Accumulator::Percentiles { input, points } => AccState::Percentiles {
                expr: input.clone(),
                sketch: QuantileSketch::new(),
                points: points.clone(),
            },
        }
    }

    fn observe(&mut self, scope: &Scope) -> Result<(), PipelineError> {
        match self {
            AccState::First { expr, slot } => {
                if slot.is_none() {
                    *slot = Some(expr.eval(scope)?);
                }
            }
            AccState::FirstN {
                expr,
                limit,
                values,
            } => {
                if values.len() < *limit {
                    values.push(expr.eval(scope)?.unwrap_or(Value::Null));
                }
            }
            AccState::Last { expr, slot } => {
                *slot = Some(expr.eval(scope)?);
            }
            AccState::Push { expr, values } => {
                if let Some(value) = expr.eval(scope)? {
                    values.push(value);
                }
            }
            AccState::Min { expr, best } => {
                if let Some(value) = expr.eval(scope)? {
                    let smaller = best
                        .as_ref()
                        .map_or(true, |current| compare(&value, current) == Ordering::Less);
                    if !value.is_null() && smaller {
                        *best = Some(value);
                    }
                }
            }
            AccState::Max { expr, best } => {
                if let Some(value) = expr.eval(scope)? {
                    let larger = best
                        .as_ref()
                        .map_or(true, |current| compare(&value, current) == Ordering::Greater);
                    if !value.is_null() && larger {
                        *best = Some(value);
                    }
                }
            }
            AccState::Avg { expr, sum, n } => {
                if let Some(Value::Number(number)) = expr.eval(scope)? {
                    *sum += number.as_f64().unwrap_or(0.0);
                    *n += 1;
                }
            }
            AccState::Sum { expr, sum } => {
                if let Some(Value::Number(number)) = expr.eval(scope)? {
                    *sum += number.as_f64().unwrap_or(0.0);
                }
            }
            AccState::Count(n) => *n += 1,
            AccState::Percentiles { expr, sketch, .. } => {
                if let Some(Value::Number(number)) = expr.eval(scope)? {
                    sketch.insert(number.as_f64().unwrap_or(0.0));
                }
            }
        }
        Ok(())
    }

    fn finish(self) -> Option<Value> {
        match self {
            AccState::First { slot, .. } | AccState::Last { slot, .. } => slot.flatten(),
            AccState::FirstN { values, .. } | AccState::Push { values, .. } => {
                Some(Value::Array(values))
            }
            AccState::Min { best, .. } | AccState::Max { best, .. } => {
                Some(best.unwrap_or(Value::Null))
            }
            AccState::Avg { sum, n, .. } => Some(if n == 0 {
                Value::Null
            } else {
                Value::from(sum / n as f64)
            }),
            AccState::Sum { sum, .. } => Some(Value::from(sum)),
            AccState::Count(n) => Some(Value::from(n)),
            AccState::Percentiles { sketch, points, .. } => {
                if sketch.is_empty() {
                    return Some(Value::Null);
                }
                let mut out = Map::new();
                for (label, q) in points {
                    let estimate = sketch.quantile(q).unwrap_or(f64::NAN);
                    out.insert(label, Value::from(estimate));
                }
                Some(Value::Object(out))
            }
        }
    }
}

fn run_group(
    docs: Vec<Value>,
    id: &Expr,
    fields: &[(String, Accumulator)],
    outer_vars: &[(String, Value)],
) -> Result<Vec<Value>, PipelineError> {
    struct GroupState {
        id: Value,
        accs: Vec<AccState>,
    }

    let mut groups: BTreeMap<String, GroupState> = BTreeMap::new();
    for doc in docs {
        let scope = scope_for(&doc, outer_vars);
        let id_value = id.eval(&scope)?.unwrap_or(Value::Null);
        let key = id_value.to_string();
        let state = groups.entry(key).or_insert_with(|| GroupState {
            id: id_value,
            accs: fields.iter().map(|(_, acc)| AccState::new(acc)).collect(),
        });
        for acc in state.accs.iter_mut() {
            acc.observe(&scope)?;
        }
    }

    let mut out = Vec::with_capacity(groups.len());
    for state in groups.into_values() {
        let mut doc = Map::new();
        doc.insert("_id".to_string(), state.id);
        for (acc, (name, _)) in state.accs.into_iter().zip(fields) {
            if let Some(value) = acc.finish() {
                doc.insert(name.clone(), value);
            }
        }
        out.push(Value::Object(doc));
    }
    Ok(out)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
