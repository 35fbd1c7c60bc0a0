//! `@pipe` and `@reduce` expression evaluation
//!
//! A pipe is a list of rows. A row is either a literal argument row (each
//! element resolved independently) or an invocation row — a single-element
//! list naming a pure operator as `{@namespace.op}` — whose arguments are the
//! previous row's output. `@reduce` folds an array, binding `$item`, `$index`
//! and the running `$output`.

use serde_json::{Map, Value};

use crate::mapper::{resolve_expr, MapError};

/// Evaluate a `@pipe` row list against the job document.
pub fn eval_pipe(rows: &[Value], doc: &Value) -> Result<Value, MapError> {
    let mut acc: Vec<Value> = Vec::new();

    for row in rows {
        let row = row
            .as_array()
            .ok_or_else(|| MapError::BadExpression("pipe rows must be lists".into()))?;

        if let Some(op) = invocation(row) {
            let result = apply(op, &acc)?;
            acc = vec![result];
        } else {
            let mut next = Vec::with_capacity(row.len());
            for cell in row {
                next.push(resolve_expr(cell, doc)?);
            }
            acc = next;
        }
    }

    Ok(collapse(acc))
}

/// Evaluate a `@reduce` row list.
///
/// The first row resolves to the input array (second element, if present, is
/// the initial `$output`). The remaining rows form a pipe evaluated once per
/// item with `$item` / `$index` / `$output` bound in the document.
pub fn eval_reduce(rows: &[Value], doc: &Value) -> Result<Value, MapError> {
    let (head, body) = rows
        .split_first()
        .ok_or_else(|| MapError::BadExpression("@reduce requires an input row".into()))?;
    let head = head
        .as_array()
        .ok_or_else(|| MapError::BadExpression("@reduce input row must be a list".into()))?;

    let input = resolve_expr(
        head.first()
            .ok_or_else(|| MapError::BadExpression("@reduce requires an input array".into()))?,
        doc,
    )?;
    let items = input
        .as_array()
        .cloned()
        .ok_or_else(|| MapError::BadExpression("@reduce input did not resolve to an array".into()))?;

    let mut output = match head.get(1) {
        Some(expr) => resolve_expr(expr, doc)?,
        None => Value::Null,
    };

    let mut scope = match doc {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };

    for (index, item) in items.into_iter().enumerate() {
        scope.insert("$item".to_string(), item);
        scope.insert("$index".to_string(), Value::from(index as u64));
        scope.insert("$output".to_string(), output);
        output = eval_pipe(body, &Value::Object(scope.clone()))?;
    }

    Ok(output)
}

/// A single-element row whose element is an `{@ns.op}` string.
fn invocation(row: &[Value]) -> Option<&str> {
    if row.len() != 1 {
        return None;
    }
    let s = row[0].as_str()?;
    let inner = s.strip_prefix('{')?.strip_suffix('}')?;
    inner.strip_prefix('@')
}

fn collapse(mut values: Vec<Value>) -> Value {
    match values.len() {
        0 => Value::Null,
        1 => values.remove(0),
        _ => Value::Array(values),
    }
}

// Coercions

fn as_num(op: &str, v: &Value) -> Result<f64, MapError> {
    match v {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| MapError::NotANumber { op: op.into() }),
        Value::String(s) => s
            .parse::<f64>()
            .map_err(|_| MapError::NotANumber { op: op.into() }),
        _ => Err(MapError::NotANumber { op: op.into() }),
    }
}

fn as_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn num_value(f: f64) -> Value {
    if f.fract() == 0.0 && f.abs() < (i64::MAX as f64) {
        Value::from(f as i64)
    } else {
        serde_json::Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
    }
}

fn want(op: &str, args: &[Value], expected: usize) -> Result<(), MapError> {
    if args.len() < expected {
        Err(MapError::BadArity {
            op: op.into(),
            expected,
            got: args.len(),
        })
    } else {
        Ok(())
    }
}

fn fold_nums(op: &str, args: &[Value], f: impl Fn(f64, f64) -> f64) -> Result<Value, MapError> {
    want(op, args, 1)?;
    let mut acc = as_num(op, &args[0])?;
    for v in &args[1..] {
        acc = f(acc, as_num(op, v)?);
    }
    Ok(num_value(acc))
}

fn cmp_nums(op: &str, args: &[Value], f: impl Fn(f64, f64) -> bool) -> Result<Value, MapError> {
    want(op, args, 2)?;
    Ok(Value::Bool(f(as_num(op, &args[0])?, as_num(op, &args[1])?)))
}

/// Apply a pure operator to the accumulator row.
pub fn apply(op: &str, args: &[Value]) -> Result<Value, MapError> {
    match op {
        // string
        "string.concat" => Ok(Value::String(args.iter().map(as_text).collect())),
        "string.split" => {
            want(op, args, 2)?;
            let parts = as_text(&args[0])
                .split(&as_text(&args[1]))
                .map(|s| Value::String(s.to_string()))
                .collect();
            Ok(Value::Array(parts))
        }
        "string.join" => {
            want(op, args, 2)?;
            let items = args[0]
                .as_array()
                .ok_or_else(|| MapError::BadExpression("string.join expects an array".into()))?;
            let sep = as_text(&args[1]);
            Ok(Value::String(
                items.iter().map(as_text).collect::<Vec<_>>().join(&sep),
            ))
        }
        "string.uppercase" => {
            want(op, args, 1)?;
            Ok(Value::String(as_text(&args[0]).to_uppercase()))
        }
        "string.lowercase" => {
            want(op, args, 1)?;
            Ok(Value::String(as_text(&args[0]).to_lowercase()))
        }
        "string.trim" => {
            want(op, args, 1)?;
            Ok(Value::String(as_text(&args[0]).trim().to_string()))
        }
        "string.slice" => {
            want(op, args, 2)?;
            let s = as_text(&args[0]);
            let chars: Vec<char> = s.chars().collect();
            let start = (as_num(op, &args[1])? as usize).min(chars.len());
            let end = match args.get(2) {
                Some(v) => (as_num(op, v)? as usize).min(chars.len()),
                None => chars.len(),
            };
            Ok(Value::String(chars[start..end.max(start)].iter().collect()))
        }
        "string.length" => {
            want(op, args, 1)?;
            Ok(Value::from(as_text(&args[0]).chars().count() as u64))
        }

        // math
        "math.add" => fold_nums(op, args, |a, b| a + b),
        "math.subtract" => fold_nums(op, args, |a, b| a - b),
        "math.multiply" => fold_nums(op, args, |a, b| a * b),
        "math.divide" => fold_nums(op, args, |a, b| a / b),
        "math.max" => fold_nums(op, args, f64::max),
        "math.min" => fold_nums(op, args, f64::min),
        "math.modulo" => {
            want(op, args, 2)?;
            Ok(num_value(as_num(op, &args[0])? % as_num(op, &args[1])?))
        }
        "math.floor" => {
            want(op, args, 1)?;
            Ok(num_value(as_num(op, &args[0])?.floor()))
        }
        "math.ceil" => {
            want(op, args, 1)?;
            Ok(num_value(as_num(op, &args[0])?.ceil()))
        }
        "math.abs" => {
            want(op, args, 1)?;
            Ok(num_value(as_num(op, &args[0])?.abs()))
        }

        // conditional
        "conditional.ternary" => {
            want(op, args, 3)?;
            Ok(if truthy(&args[0]) {
                args[1].clone()
            } else {
                args[2].clone()
            })
        }
        "conditional.nullish" => {
            want(op, args, 2)?;
            Ok(if args[0].is_null() {
                args[1].clone()
            } else {
                args[0].clone()
            })
        }
        "conditional.equality" | "logical.eq" => {
            want(op, args, 2)?;
            Ok(Value::Bool(args[0] == args[1]))
        }

        // logical
        "logical.and" => Ok(Value::Bool(args.iter().all(truthy))),
        "logical.or" => Ok(Value::Bool(args.iter().any(truthy))),
        "logical.not" => {
            want(op, args, 1)?;
            Ok(Value::Bool(!truthy(&args[0])))
        }
        "logical.ne" => {
            want(op, args, 2)?;
            Ok(Value::Bool(args[0] != args[1]))
        }
        "logical.gt" => cmp_nums(op, args, |a, b| a > b),
        "logical.gte" => cmp_nums(op, args, |a, b| a >= b),
        "logical.lt" => cmp_nums(op, args, |a, b| a < b),
        "logical.lte" => cmp_nums(op, args, |a, b| a <= b),

        // object
        "object.create" => {
            let mut out = Map::new();
            for pair in args.chunks(2) {
                if let [k, v] = pair {
                    out.insert(as_text(k), v.clone());
                }
            }
            Ok(Value::Object(out))
        }
        "object.get" => {
            want(op, args, 2)?;
            Ok(args[0]
                .get(as_text(&args[1]))
                .cloned()
                .unwrap_or(Value::Null))
        }
        "object.keys" => {
            want(op, args, 1)?;
            let keys = args[0]
                .as_object()
                .map(|m| m.keys().map(|k| Value::String(k.clone())).collect())
                .unwrap_or_default();
            Ok(Value::Array(keys))
        }
        "object.values" => {
            want(op, args, 1)?;
            let values = args[0]
                .as_object()
                .map(|m| m.values().cloned().collect())
                .unwrap_or_default();
            Ok(Value::Array(values))
        }
        "object.merge" => {
            let mut out = Map::new();
            for v in args {
                if let Value::Object(map) = v {
                    out.extend(map.clone());
                }
            }
            Ok(Value::Object(out))
        }

        // array
        "array.get" => {
            want(op, args, 2)?;
            let idx = as_num(op, &args[1])? as usize;
            Ok(args[0]
                .as_array()
                .and_then(|a| a.get(idx))
                .cloned()
                .unwrap_or(Value::Null))
        }
        "array.length" => {
            want(op, args, 1)?;
            Ok(Value::from(
                args[0].as_array().map(|a| a.len()).unwrap_or(0) as u64
            ))
        }
        "array.concat" => {
            let mut out = Vec::new();
            for v in args {
                match v {
                    Value::Array(items) => out.extend(items.clone()),
                    other => out.push(other.clone()),
                }
            }
            Ok(Value::Array(out))
        }
        "array.slice" => {
            want(op, args, 2)?;
            let items = args[0].as_array().cloned().unwrap_or_default();
            let start = (as_num(op, &args[1])? as usize).min(items.len());
            let end = match args.get(2) {
                Some(v) => (as_num(op, v)? as usize).min(items.len()),
                None => items.len(),
            };
            Ok(Value::Array(items[start..end.max(start)].to_vec()))
        }
        "array.reverse" => {
            want(op, args, 1)?;
            let mut items = args[0].as_array().cloned().unwrap_or_default();
            items.reverse();
            Ok(Value::Array(items))
        }
        "array.index_of" => {
            want(op, args, 2)?;
            let idx = args[0]
                .as_array()
                .and_then(|a| a.iter().position(|v| v == &args[1]));
            Ok(idx.map(|i| Value::from(i as u64)).unwrap_or(Value::from(-1)))
        }

        other => Err(MapError::UnknownOperator(other.to_string())),
    }
}
