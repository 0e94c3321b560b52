//! Aggregation expression language and its evaluator.
//!
//! Expressions evaluate against a [`Scope`] (the current document plus
//! bound variables) to `Ok(None)` when the result is a missing field,
//! or `Ok(Some(value))` otherwise. Missing is distinct from JSON null:
//! object construction and `Set` drop missing fields, while null is a
//! stored value. Comparisons treat missing as null; arithmetic
//! propagates missing as missing and null as null, so a derived field
//! like a price change stays absent exactly when its inputs are.

use super::{PipelineError, SortOrder};
use crate::store::filter::get_path;
use chrono::{Days, NaiveDate, NaiveDateTime, NaiveTime};
use serde_json::{Map, Value};
use std::cmp::Ordering;

static NULL: Value = Value::Null;

const DATETIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";
const DATE_FORMAT: &str = "%Y-%m-%d";

/// Evaluation scope: the stage's input document and any bound variables.
#[derive(Debug, Clone)]
pub struct Scope<'a> {
    doc: &'a Value,
    vars: Vec<(String, Value)>,
}

impl<'a> Scope<'a> {
    pub fn new(doc: &'a Value) -> Self {
        Scope {
            doc,
            vars: Vec::new(),
        }
    }

    pub fn with_vars(&self, extra: Vec<(String, Value)>) -> Self {
        let mut vars = self.vars.clone();
        vars.extend(extra);
        Scope {
            doc: self.doc,
            vars,
        }
    }

    /// Same variables, different document. Used by sub-pipelines that
    /// carry outer bindings into each joined document.
    pub fn rebound(&self, doc: &'a Value) -> Self {
        Scope {
            doc,
            vars: self.vars.clone(),
        }
    }

    fn var(&self, name: &str) -> Option<&Value> {
        self.vars
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }
}

#[derive(Debug, Clone)]
pub enum Expr {
    Lit(Value),
    /// Dot-path read on the current document.
    Field(String),
    /// Bound variable reference, optionally with a trailing dot-path.
    Var(String),
    /// The whole current document.
    Root,
    /// Always missing; setting a field to this removes it.
    Remove,
    /// Array literal of expressions.
    Array(Vec<Expr>),
    /// Object literal; fields whose expressions are missing are omitted.
    Object(Vec<(String, Expr)>),
    GetField {
        field: String,
        input: Box<Expr>,
    },
    Cond {
        cond: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
    IfNull(Box<Expr>, Box<Expr>),
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Eq(Box<Expr>, Box<Expr>),
    Ne(Box<Expr>, Box<Expr>),
    Lt(Box<Expr>, Box<Expr>),
    Gt(Box<Expr>, Box<Expr>),
    Add(Vec<Expr>),
    Subtract(Box<Expr>, Box<Expr>),
    Multiply(Vec<Expr>),
    Divide(Box<Expr>, Box<Expr>),
    Round(Box<Expr>, u32),
    ConcatArrays(Vec<Expr>),
    /// First `count` elements when positive, last `-count` when negative,
    /// empty when zero.
    Slice {
        input: Box<Expr>,
        count: Box<Expr>,
    },
    Size(Box<Expr>),
    First(Box<Expr>),
    Last(Box<Expr>),
    /// Maps each element, bound as `this`.
    Map {
        input: Box<Expr>,
        body: Box<Expr>,
    },
    /// Keeps elements, bound as `this`, for which the condition holds.
    Filter {
        input: Box<Expr>,
        cond: Box<Expr>,
    },
    /// Folds the array with `value` (accumulator) and `this` bound.
    Reduce {
        input: Box<Expr>,
        initial: Box<Expr>,
        body: Box<Expr>,
    },
    /// Stable sort of an object array by one dot-path key.
    SortArray {
        input: Box<Expr>,
        by: String,
        order: SortOrder,
    },
    /// Pairwise zip; with `longest` the shorter inputs pad with null.
    Zip {
        inputs: Vec<Expr>,
        longest: bool,
    },
    /// Merges object operands left to right; array operands are merged
    /// element-wise, null and missing operands are skipped.
    MergeObjects(Vec<Expr>),
    /// Builds an object from `[key, value]` pairs or `{k, v}` elements.
    ArrayToObject(Box<Expr>),
    Let {
        vars: Vec<(String, Expr)>,
        body: Box<Expr>,
    },
    /// Truncates a timestamp to its day string.
    DateTrunc(Box<Expr>),
    DateAddDays(Box<Expr>, i64),
    /// Whole seconds from `start` to `end`.
    DateDiffSeconds {
        start: Box<Expr>,
        end: Box<Expr>,
    },
}

enum NumArgs {
    Missing,
    Null,
    Values(Vec<f64>),
}

impl Expr {
    pub fn lit(value: impl Into<Value>) -> Expr {
        Expr::Lit(value.into())
    }

    pub fn field(path: impl Into<String>) -> Expr {
        Expr::Field(path.into())
    }

    pub fn var(name: impl Into<String>) -> Expr {
        Expr::Var(name.into())
    }

    /// Evaluates the expression; `Ok(None)` means the result is missing.
    pub fn eval(&self, scope: &Scope) -> Result<Option<Value>, PipelineError> {
        match self {
            Expr::Lit(value) => Ok(Some(value.clone())),
            Expr::Field(path) => Ok(get_path(scope.doc, path).cloned()),
            Expr::Root => Ok(Some(scope.doc.clone())),
            Expr::Remove => Ok(None),

            Expr::Var(name) => {
                let (base, rest) = match name.split_once('.') {
                    Some((base, rest)) => (base, Some(rest)),
                    None => (name.as_str(), None),
                };
                let value = if base == "ROOT" {
                    scope.doc
                } else {
                    scope
                        .var(base)
                        .ok_or_else(|| PipelineError::UnknownVariable(base.to_string()))?
                };
                match rest {
                    None => Ok(Some(value.clone())),
                    Some(path) => Ok(get_path(value, path).cloned()),
                }
            }

            Expr::Array(elements) => {
                let mut out = Vec::with_capacity(elements.len());
                for element in elements {
                    out.push(element.eval(scope)?.unwrap_or(Value::Null));
                }
                Ok(Some(Value::Array(out)))
            }

            Expr::Object(fields) => {
                let mut out = Map::new();
                for (key, expr) in fields {
                    if let Some(value) = expr.eval(scope)? {
                        out.insert(key.clone(), value);
                    }
                }
                Ok(Some(Value::Object(out)))
            }

            Expr::GetField { field, input } => match input.eval(scope)? {
                Some(Value::Object(map)) => Ok(map.get(field).cloned()),
                _ => Ok(None),
            },

            Expr::Cond {
                cond,
                then,
                otherwise,
            } => {
                if truthy(cond.eval(scope)?.as_ref()) {
                    then.eval(scope)
                } else {
                    otherwise.eval(scope)
                }
            }

            Expr::IfNull(primary, fallback) => match primary.eval(scope)? {
                Some(value) if !value.is_null() => Ok(Some(value)),
                _ => fallback.eval(scope),
            },

            Expr::And(exprs) => {
                for expr in exprs {
                    if !truthy(expr.eval(scope)?.as_ref()) {
                        return Ok(Some(Value::Bool(false)));
                    }
                }
                Ok(Some(Value::Bool(true)))
            }

            Expr::Or(exprs) => {
                for expr in exprs {
                    if truthy(expr.eval(scope)?.as_ref()) {
                        return Ok(Some(Value::Bool(true)));
                    }
                }
                Ok(Some(Value::Bool(false)))
            }

            Expr::Eq(a, b) => Ok(Some(Value::Bool(
                compare(nullish(&a.eval(scope)?), nullish(&b.eval(scope)?)) == Ordering::Equal,
            ))),
            Expr::Ne(a, b) => Ok(Some(Value::Bool(
                compare(nullish(&a.eval(scope)?), nullish(&b.eval(scope)?)) != Ordering::Equal,
            ))),
            Expr::Lt(a, b) => Ok(Some(Value::Bool(
                compare(nullish(&a.eval(scope)?), nullish(&b.eval(scope)?)) == Ordering::Less,
            ))),
            Expr::Gt(a, b) => Ok(Some(Value::Bool(
                compare(nullish(&a.eval(scope)?), nullish(&b.eval(scope)?)) == Ordering::Greater,
            ))),

            Expr::Add(args) => match eval_numbers(args.iter(), scope, "add")? {
                NumArgs::Missing => Ok(None),
                NumArgs::Null => Ok(Some(Value::Null)),
                NumArgs::Values(values) => Ok(Some(Value::from(values.iter().sum::<f64>()))),
            },

            Expr::Subtract(a, b) => {
                match eval_numbers([a.as_ref(), b.as_ref()].into_iter(), scope, "subtract")? {
                    NumArgs::Missing => Ok(None),
                    NumArgs::Null => Ok(Some(Value::Null)),
                    NumArgs::Values(values) => Ok(Some(Value::from(values[0] - values[1]))),
                }
            }

            Expr::Multiply(args) => match eval_numbers(args.iter(), scope, "multiply")? {
                NumArgs::Missing => Ok(None),
                NumArgs::Null => Ok(Some(Value::Null)),
                NumArgs::Values(values) => Ok(Some(Value::from(values.iter().product::<f64>()))),
            },

            Expr::Divide(a, b) => {
                match eval_numbers([a.as_ref(), b.as_ref()].into_iter(), scope, "divide")? {
                    NumArgs::Missing => Ok(None),
                    NumArgs::Null => Ok(Some(Value::Null)),
                    NumArgs::Values(values) => {
                        if values[1] == 0.0 {
                            Err(PipelineError::DivideByZero)
                        } else {
                            Ok(Some(Value::from(values[0] / values[1])))
                        }
                    }
                }
            }

            Expr::Round(input, digits) => match eval_numbers([input.as_ref()].into_iter(), scope, "round")? {
                NumArgs::Missing => Ok(None),
                NumArgs::Null => Ok(Some(Value::Null)),
                NumArgs::Values(values) => Ok(Some(Value::from(round_half_away(values[0], *digits)))),
            },

            Expr::ConcatArrays(args) => {
                let mut out = Vec::new();
                for arg in args {
                    match arg.eval(scope)? {
                        None | Some(Value::Null) => return Ok(Some(Value::Null)),
                        Some(Value::Array(elements)) => out.extend(elements),
                        Some(_) => {
                            return Err(PipelineError::TypeMismatch {
                                expected: "array",
                                context: "concatArrays",
                            })
                        }
                    }
                }
                Ok(Some(Value::Array(out)))
            }

            Expr::Slice { input, count } => {
                let elements = match as_array(input.eval(scope)?, "slice")? {
                    Some(elements) => elements,
                    None => return Ok(Some(Value::Null)),
                };
                let count = match eval_numbers([count.as_ref()].into_iter(), scope, "slice")? {
                    NumArgs::Values(values) => values[0] as i64,
                    _ => return Ok(Some(Value::Null)),
                };
                let len = elements.len();
                let sliced: Vec<Value> = if count >= 0 {
                    elements.into_iter().take(count as usize).collect()
                } else {
                    let keep = (-count) as usize;
                    let skip = len.saturating_sub(keep);
                    elements.into_iter().skip(skip).collect()
                };
                Ok(Some(Value::Array(sliced)))
            }

            Expr::Size(input) => match as_array(input.eval(scope)?, "size")? {
                Some(elements) => Ok(Some(Value::from(elements.len() as i64))),
                None => Err(PipelineError::TypeMismatch {
                    expected: "array",
                    context: "size",
                }),
            },

            Expr::First(input) => match as_array(input.eval(scope)?, "first")? {
                Some(elements) => Ok(elements.into_iter().next()),
                None => Ok(Some(Value::Null)),
            },

            Expr::Last(input) => match as_array(input.eval(scope)?, "last")? {
                Some(elements) => Ok(elements.into_iter().next_back()),
                None => Ok(Some(Value::Null)),
            },

            Expr::Map { input, body } => {
                let elements = match as_array(input.eval(scope)?, "map")? {
                    Some(elements) => elements,
                    None => return Ok(Some(Value::Null)),
                };
                let mut out = Vec::with_capacity(elements.len());
                for element in elements {
                    let inner = scope.with_vars(vec![("this".to_string(), element)]);
                    out.push(body.eval(&inner)?.unwrap_or(Value::Null));
                }
                Ok(Some(Value::Array(out)))
            }

            Expr::Filter { input, cond } => {
                let elements = match as_array(input.eval(scope)?, "filter")? {
                    Some(elements) => elements,
                    None => return Ok(Some(Value::Null)),
                };
                let mut out = Vec::new();
                for element in elements {
                    let inner = scope.with_vars(vec![("this".to_string(), element.clone())]);
                    if truthy(cond.eval(&inner)?.as_ref()) {
                        out.push(element);
                    }
                }
                Ok(Some(Value::Array(out)))
            }

            Expr::Reduce {
                input,
                initial,
                body,
            } => {
                let elements = match as_array(input.eval(scope)?, "reduce")? {
                    Some(elements) => elements,
                    None => return Ok(Some(Value::Null)),
                };
                let mut acc = initial.eval(scope)?.unwrap_or(Value::Null);
                for element in elements {
                    let inner = scope.with_vars(vec![
                        ("value".to_string(), acc),
                        ("this".to_string(), element),
                    ]);
                    acc = body.eval(&inner)?.unwrap_or(Value::Null);
                }
                Ok(Some(acc))
            }

            Expr::SortArray { input, by, order } => {
                let mut elements = match as_array(input.eval(scope)?, "sortArray")? {
                    Some(elements) => elements,
                    None => return Ok(Some(Value::Null)),
                };
                elements.sort_by(|a, b| {
                    let ordering = compare(
                        nullish(&get_path(a, by).cloned()),
                        nullish(&get_path(b, by).cloned()),
                    );
                    match order {
                        SortOrder::Asc => ordering,
                        SortOrder::Desc => ordering.reverse(),
                    }
                });
                Ok(Some(Value::Array(elements)))
            }

            Expr::Zip { inputs, longest } => {
                let mut lists = Vec::with_capacity(inputs.len());
                for input in inputs {
                    match as_array(input.eval(scope)?, "zip")? {
                        Some(elements) => lists.push(elements),
                        None => return Ok(Some(Value::Null)),
                    }
                }
                let len = if *longest {
                    lists.iter().map(Vec::len).max().unwrap_or(0)
                } else {
                    lists.iter().map(Vec::len).min().unwrap_or(0)
                };
                let mut out = Vec::with_capacity(len);
                for i in 0..len {
                    let row: Vec<Value> = lists
                        .iter()
                        .map(|list| list.get(i).cloned().unwrap_or(Value::Null))
                        .collect();
                    out.push(Value::Array(row));
                }
                Ok(Some(Value::Array(out)))
            }

            Expr::MergeObjects(args) => {
                let mut out = Map::new();
                for arg in args {
                    match arg.eval(scope)? {
                        None | Some(Value::Null) => {}
                        Some(Value::Object(map)) => out.extend(map),
                        Some(Value::Array(elements)) => {
                            for element in elements {
                                match element {
                                    Value::Null => {}
                                    Value::Object(map) => out.extend(map),
                                    _ => {
                                        return Err(PipelineError::TypeMismatch {
                                            expected: "object or null element",
                                            context: "mergeObjects",
                                        })
                                    }
                                }
                            }
                        }
                        Some(_) => {
                            return Err(PipelineError::TypeMismatch {
                                expected: "object, array or null",
                                context: "mergeObjects",
                            })
                        }
                    }
                }
                Ok(Some(Value::Object(out)))
            }

            Expr::ArrayToObject(input) => {
                let elements = match as_array(input.eval(scope)?, "arrayToObject")? {
                    Some(elements) => elements,
                    None => return Ok(Some(Value::Null)),
                };
                let mut out = Map::new();
                for element in elements {
                    match element {
                        Value::Array(pair) if pair.len() == 2 => {
                            let key = pair[0].as_str().ok_or(PipelineError::TypeMismatch {
                                expected: "string key",
                                context: "arrayToObject",
                            })?;
                            out.insert(key.to_string(), pair[1].clone());
                        }
                        Value::Object(map) => {
                            let key = map
                                .get("k")
                                .and_then(Value::as_str)
                                .ok_or(PipelineError::TypeMismatch {
                                    expected: "string k field",
                                    context: "arrayToObject",
                                })?;
                            let value = map.get("v").cloned().unwrap_or(Value::Null);
                            out.insert(key.to_string(), value);
                        }
                        _ => {
                            return Err(PipelineError::TypeMismatch {
                                expected: "pair or {k, v} element",
                                context: "arrayToObject",
                            })
                        }
                    }
                }
                Ok(Some(Value::Object(out)))
            }

            Expr::Let { vars, body } => {
                let mut bound = Vec::with_capacity(vars.len());
                for (name, expr) in vars {
                    bound.push((name.clone(), expr.eval(scope)?.unwrap_or(Value::Null)));
                }
                body.eval(&scope.with_vars(bound))
            }

            Expr::DateTrunc(input) => match input.eval(scope)? {
                None => Ok(None),
                Some(Value::Null) => Ok(Some(Value::Null)),
                Some(value) => {
                    let day = parse_datetime(date_str(&value, "dateTrunc")?)?.date();
                    Ok(Some(Value::from(day.format(DATE_FORMAT).to_string())))
                }
            },

            Expr::DateAddDays(input, days) => match input.eval(scope)? {
                None => Ok(None),
                Some(Value::Null) => Ok(Some(Value::Null)),
                Some(value) => {
                    let day = parse_datetime(date_str(&value, "dateAdd")?)?.date();
                    let shifted = if *days >= 0 {
                        day.checked_add_days(Days::new(*days as u64))
                    } else {
                        day.checked_sub_days(Days::new(days.unsigned_abs()))
                    };
                    let shifted = shifted.ok_or_else(|| PipelineError::BadDate(value.to_string()))?;
                    Ok(Some(Value::from(shifted.format(DATE_FORMAT).to_string())))
                }
            },

            Expr::DateDiffSeconds { start, end } => {
                let (start, end) = match (start.eval(scope)?, end.eval(scope)?) {
                    (Some(s), Some(e)) if !s.is_null() && !e.is_null() => (s, e),
                    (None, _) | (_, None) => return Ok(None),
                    _ => return Ok(Some(Value::Null)),
                };
                let start = parse_datetime(date_str(&start, "dateDiff")?)?;
                let end = parse_datetime(date_str(&end, "dateDiff")?)?;
                Ok(Some(Value::from((end - start).num_seconds())))
            }
        }
    }
}

fn eval_numbers<'a>(
    exprs: impl Iterator<Item = &'a Expr>,
    scope: &Scope,
    context: &'static str,
) -> Result<NumArgs, PipelineError> {
    let mut values = Vec::new();
    let mut saw_null = false;
    for expr in exprs {
        match expr.eval(scope)? {
            None => return Ok(NumArgs::Missing),
            Some(Value::Null) => saw_null = true,
            Some(Value::Number(n)) => values.push(n.as_f64().unwrap_or(0.0)),
            Some(_) => {
                return Err(PipelineError::TypeMismatch {
                    expected: "number",
                    context,
                })
            }
        }
    }
    if saw_null {
        Ok(NumArgs::Null)
    } else {
        Ok(NumArgs::Values(values))
    }
}

fn as_array(
    value: Option<Value>,
    context: &'static str,
) -> Result<Option<Vec<Value>>, PipelineError> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Array(elements)) => Ok(Some(elements)),
        Some(_) => Err(PipelineError::TypeMismatch {
            expected: "array",
            context,
        }),
    }
}

fn date_str<'a>(value: &'a Value, context: &'static str) -> Result<&'a str, PipelineError> {
    value.as_str().ok_or(PipelineError::TypeMismatch {
        expected: "date string",
        context,
    })
}

/// Missing-as-null view used by comparisons and key matching.
pub(crate) fn nullish(value: &Option<Value>) -> &Value {
    value.as_ref().unwrap_or(&NULL)
}

/// Boolean conversion: false, zero, null and missing are falsy.
pub(crate) fn truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) | Some(Value::Bool(false)) => false,
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0) != 0.0,
        Some(_) => true,
    }
}

/// Total order over JSON values: null < bool < number < string < array
/// < object, numbers compared as doubles, ISO date strings falling out
/// chronologically.
pub(crate) fn compare(a: &Value, b: &Value) -> Ordering {
    fn rank(value: &Value) -> u8 {
        match value {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }

    let by_rank = rank(a).cmp(&rank(b));
    if by_rank != Ordering::Equal {
        return by_rank;
    }
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or(f64::NAN);
            let y = y.as_f64().unwrap_or(f64::NAN);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (xe, ye) in x.iter().zip(y.iter()) {
                let ordering = compare(xe, ye);
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(_), Value::Object(_)) => a.to_string().cmp(&b.to_string()),
        _ => Ordering::Equal,
    }
}

/// Rounds half away from zero at the given number of decimal places.
pub fn round_half_away(value: f64, digits: u32) -> f64 {
    let scale = 10f64.powi(digits as i32);
    (value * scale).round() / scale
}

/// Parses the engine's two date shapes: a full timestamp or a plain day
/// (which reads as midnight).
pub(crate) fn parse_datetime(text: &str) -> Result<NaiveDateTime, PipelineError> {
    NaiveDateTime::parse_from_str(text, DATETIME_FORMAT)
        .or_else(|_| {
            NaiveDate::parse_from_str(text, DATE_FORMAT).map(|d| d.and_time(NaiveTime::MIN))
        })
        .map_err(|_| PipelineError::BadDate(text.to_string()))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
