//! Tree-walking evaluator over JSON values.

use std::cmp::Ordering;

use serde_json::{Map, Number, Value};

use super::parser::{BinaryOp, Expr, UnaryOp};
use super::{Activation, EvalError};

/// Upper bound on evaluation steps for a single program run.
pub(crate) const MAX_STEPS: usize = 100_000;

pub(crate) struct Evaluator<'a> {
    activation: &'a Activation<'a>,
    locals: Vec<(String, Value)>,
    steps: usize,
}

impl<'a> Evaluator<'a> {
    pub(crate) fn new(activation: &'a Activation<'a>) -> Self {
        Self {
            activation,
            locals: Vec::new(),
            steps: 0,
        }
    }

    pub(crate) fn eval(&mut self, expr: &Expr) -> Result<Value, EvalError> {
        self.steps += 1;
        if self.steps > MAX_STEPS {
            return Err(EvalError::CostExceeded);
        }
        match expr {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Ident(name) => self.resolve(name),
            Expr::Member(target, field) => {
                let base = self.eval(target)?;
                member(&base, field)
            }
            Expr::Index(target, index) => {
                let base = self.eval(target)?;
                let idx = self.eval(index)?;
                index_value(&base, &idx)
            }
            Expr::List(items) => items
                .iter()
                .map(|e| self.eval(e))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Expr::Map(entries) => {
                let mut map = Map::new();
                for (k, v) in entries {
                    let key = match self.eval(k)? {
                        Value::String(s) => s,
                        other => other.to_string(),
                    };
                    map.insert(key, self.eval(v)?);
                }
                Ok(Value::Object(map))
            }
            Expr::Unary(op, inner) => {
                let v = self.eval(inner)?;
                match (op, v) {
                    (UnaryOp::Not, Value::Bool(b)) => Ok(Value::Bool(!b)),
                    (UnaryOp::Neg, Value::Number(n)) => negate(&n),
                    (op, other) => Err(EvalError::type_mismatch(format!(
                        "cannot apply {op:?} to {}",
                        type_name(&other)
                    ))),
                }
            }
            Expr::Binary(BinaryOp::And, lhs, rhs) => self.logical(lhs, rhs, false),
            Expr::Binary(BinaryOp::Or, lhs, rhs) => self.logical(lhs, rhs, true),
            Expr::Binary(op, lhs, rhs) => {
                let l = self.eval(lhs)?;
                let r = self.eval(rhs)?;
                binary(*op, &l, &r)
            }
            Expr::Conditional(cond, then, otherwise) => match self.eval(cond)? {
                Value::Bool(true) => self.eval(then),
                Value::Bool(false) => self.eval(otherwise),
                other => Err(EvalError::type_mismatch(format!(
                    "condition must be bool, got {}",
                    type_name(&other)
                ))),
            },
            Expr::Call { target, name, args } => self.call(target.as_deref(), name, args),
        }
    }

    fn resolve(&self, name: &str) -> Result<Value, EvalError> {
        if let Some((_, v)) = self.locals.iter().rev().find(|(n, _)| n == name) {
            return Ok(v.clone());
        }
        self.activation
            .resolve(name)
            .ok_or_else(|| EvalError::NoSuchVariable(name.to_string()))
    }

    // `short` is the value that decides the result on its own (true for ||).
    fn logical(&mut self, lhs: &Expr, rhs: &Expr, short: bool) -> Result<Value, EvalError> {
        let l = self.eval(lhs).and_then(expect_bool);
        if matches!(l, Ok(b) if b == short) {
            return Ok(Value::Bool(short));
        }
        let r = self.eval(rhs).and_then(expect_bool);
        match (l, r) {
            (_, Ok(b)) if b == short => Ok(Value::Bool(short)),
            (Ok(_), Ok(_)) => Ok(Value::Bool(!short)),
            (Err(e), _) | (_, Err(e)) => Err(e),
        }
    }

    fn call(&mut self, target: Option<&Expr>, name: &str, args: &[Expr]) -> Result<Value, EvalError> {
        match (target, name) {
            (None, "has") => return self.has(args),
            (Some(t), "exists" | "all" | "exists_one" | "filter" | "map") => {
                return self.comprehension(t, name, args);
            }
            _ => {}
        }

        let receiver = target.map(|t| self.eval(t)).transpose()?;
        let values = args
            .iter()
            .map(|a| self.eval(a))
            .collect::<Result<Vec<_>, _>>()?;

        match (receiver.as_ref(), name, values.as_slice()) {
            (Some(v), "size", []) | (None, "size", [v]) => size(v),
            (Some(Value::String(s)), "startsWith", [Value::String(p)]) => {
                Ok(Value::Bool(s.starts_with(p.as_str())))
            }
            (Some(Value::String(s)), "endsWith", [Value::String(p)]) => {
                Ok(Value::Bool(s.ends_with(p.as_str())))
            }
            (Some(Value::String(s)), "contains", [Value::String(p)]) => {
                Ok(Value::Bool(s.contains(p.as_str())))
            }
            (Some(Value::String(s)), "matches", [Value::String(p)])
            | (None, "matches", [Value::String(s), Value::String(p)]) => {
                let re = crate::selector::cache::regex(p)
                    .map_err(|e| EvalError::type_mismatch(format!("invalid regex: {e}")))?;
                Ok(Value::Bool(re.is_match(s)))
            }
            (Some(Value::String(s)), "lowerAscii", []) => Ok(Value::String(s.to_ascii_lowercase())),
            (Some(Value::String(s)), "upperAscii", []) => Ok(Value::String(s.to_ascii_uppercase())),
            (Some(Value::String(s)), "trim", []) => Ok(Value::String(s.trim().to_string())),
            (None, "string", [v]) => Ok(Value::String(match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })),
            (None, "int", [v]) => to_int(v),
            (None, "double", [v]) => to_double(v),
            (None, "bool", [Value::String(s)]) => match s.as_str() {
                "true" => Ok(Value::Bool(true)),
                "false" => Ok(Value::Bool(false)),
                _ => Err(EvalError::type_mismatch(format!("cannot convert '{s}' to bool"))),
            },
            (None, "type", [v]) => Ok(Value::String(type_name(v).to_string())),
            (receiver, name, values) => Err(EvalError::NoSuchOverload(format!(
                "{}{name}({})",
                receiver.map(|r| format!("{}.", type_name(r))).unwrap_or_default(),
                values.iter().map(type_name).collect::<Vec<_>>().join(", ")
            ))),
        }
    }

    fn has(&mut self, args: &[Expr]) -> Result<Value, EvalError> {
        match args {
            [Expr::Member(target, field)] => {
                let base = self.eval(target)?;
                match base {
                    Value::Object(map) => Ok(Value::Bool(map.contains_key(field))),
                    Value::Null => Ok(Value::Bool(false)),
                    other => Err(EvalError::type_mismatch(format!(
                        "has() on {}",
                        type_name(&other)
                    ))),
                }
            }
            _ => Err(EvalError::NoSuchOverload(
                "has() requires a field selection argument".to_string(),
            )),
        }
    }

    fn comprehension(&mut self, target: &Expr, name: &str, args: &[Expr]) -> Result<Value, EvalError> {
        let (var, body, transform) = match args {
            [Expr::Ident(var), body] => (var.clone(), body, None),
            [Expr::Ident(var), filter, transform] if name == "map" => {
                (var.clone(), filter, Some(transform))
            }
            _ => {
                return Err(EvalError::NoSuchOverload(format!(
                    "{name}() requires an identifier and a predicate"
                )));
            }
        };
        let items: Vec<Value> = match self.eval(target)? {
            Value::Array(items) => items,
            Value::Object(map) => map.keys().cloned().map(Value::String).collect(),
            other => {
                return Err(EvalError::type_mismatch(format!(
                    "{name}() on {}",
                    type_name(&other)
                )));
            }
        };

        let mut matched = 0usize;
        let mut out = Vec::new();
        for item in items {
            self.locals.push((var.clone(), item.clone()));
            let result = self.eval(body);
            let mapped = match (result.as_ref(), transform) {
                (Ok(Value::Bool(true)), Some(t)) => Some(self.eval(t)),
                _ => None,
            };
            self.locals.pop();
            let value = result?;
            match name {
                "map" if transform.is_none() => out.push(value),
                "map" => {
                    if let Some(m) = mapped {
                        out.push(m?);
                    }
                }
                _ => {
                    let keep = expect_bool(value)?;
                    match name {
                        "all" if !keep => return Ok(Value::Bool(false)),
                        "exists" if keep => return Ok(Value::Bool(true)),
                        "filter" if keep => out.push(item),
                        "exists_one" if keep => matched += 1,
                        _ => {}
                    }
                }
            }
        }
        Ok(match name {
            "all" => Value::Bool(true),
            "exists" => Value::Bool(false),
            "exists_one" => Value::Bool(matched == 1),
            _ => Value::Array(out),
        })
    }
}

fn expect_bool(v: Value) -> Result<bool, EvalError> {
    match v {
        Value::Bool(b) => Ok(b),
        other => Err(EvalError::type_mismatch(format!(
            "expected bool, got {}",
            type_name(&other)
        ))),
    }
}

pub(crate) fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "double",
        Value::Number(_) => "int",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "map",
    }
}

fn member(base: &Value, field: &str) -> Result<Value, EvalError> {
    match base {
        Value::Object(map) => map
            .get(field)
            .cloned()
            .ok_or_else(|| EvalError::NoSuchKey(field.to_string())),
        _ => Err(EvalError::NoSuchKey(field.to_string())),
    }
}

fn index_value(base: &Value, index: &Value) -> Result<Value, EvalError> {
    match (base, index) {
        (Value::Object(map), Value::String(k)) => map
            .get(k)
            .cloned()
            .ok_or_else(|| EvalError::NoSuchKey(k.clone())),
        (Value::Array(items), Value::Number(n)) => n
            .as_i64()
            .and_then(|i| usize::try_from(i).ok())
            .and_then(|i| items.get(i))
            .cloned()
            .ok_or_else(|| EvalError::NoSuchKey(format!("index {n}"))),
        (b, i) => Err(EvalError::type_mismatch(format!(
            "cannot index {} with {}",
            type_name(b),
            type_name(i)
        ))),
    }
}

fn size(v: &Value) -> Result<Value, EvalError> {
    let len = match v {
        Value::String(s) => s.chars().count(),
        Value::Array(items) => items.len(),
        Value::Object(map) => map.len(),
        other => {
            return Err(EvalError::type_mismatch(format!(
                "size() on {}",
                type_name(other)
            )));
        }
    };
    Ok(Value::from(len))
}

fn negate(n: &Number) -> Result<Value, EvalError> {
    if let Some(i) = n.as_i64() {
        return i
            .checked_neg()
            .map(Value::from)
            .ok_or_else(|| EvalError::type_mismatch("integer overflow"));
    }
    float_value(-n.as_f64().unwrap_or_default())
}

fn float_value(f: f64) -> Result<Value, EvalError> {
    Number::from_f64(f)
        .map(Value::Number)
        .ok_or_else(|| EvalError::type_mismatch("non-finite result"))
}

fn to_int(v: &Value) -> Result<Value, EvalError> {
    match v {
        Value::Number(n) if n.is_i64() => Ok(v.clone()),
        #[allow(clippy::cast_possible_truncation)]
        Value::Number(n) => Ok(Value::from(n.as_f64().unwrap_or_default().trunc() as i64)),
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map(Value::from)
            .map_err(|_| EvalError::type_mismatch(format!("cannot convert '{s}' to int"))),
        Value::Bool(b) => Ok(Value::from(i64::from(*b))),
        other => Err(EvalError::type_mismatch(format!(
            "cannot convert {} to int",
            type_name(other)
        ))),
    }
}

fn to_double(v: &Value) -> Result<Value, EvalError> {
    match v {
        Value::Number(n) => float_value(n.as_f64().unwrap_or_default()),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| EvalError::type_mismatch(format!("cannot convert '{s}' to double")))
            .and_then(float_value),
        other => Err(EvalError::type_mismatch(format!(
            "cannot convert {} to double",
            type_name(other)
        ))),
    }
}

/// Structural equality that treats `1` and `1.0` as equal.
pub(crate) fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(i), Some(j)) => i == j,
            _ => x.as_f64() == y.as_f64(),
        },
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(l, r)| values_equal(l, r))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x.iter()
                    .all(|(k, v)| y.get(k).is_some_and(|w| values_equal(v, w)))
        }
        _ => a == b,
    }
}

fn compare(a: &Value, b: &Value) -> Result<Ordering, EvalError> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(i), Some(j)) => Ok(i.cmp(&j)),
            _ => x
                .as_f64()
                .zip(y.as_f64())
                .and_then(|(l, r)| l.partial_cmp(&r))
                .ok_or_else(|| EvalError::type_mismatch("incomparable numbers")),
        },
        (Value::String(x), Value::String(y)) => Ok(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Ok(x.cmp(y)),
        (l, r) => Err(EvalError::NoSuchOverload(format!(
            "cannot compare {} with {}",
            type_name(l),
            type_name(r)
        ))),
    }
}

fn arithmetic(op: BinaryOp, x: &Number, y: &Number) -> Result<Value, EvalError> {
    if let (Some(i), Some(j)) = (x.as_i64(), y.as_i64()) {
        let result = match op {
            BinaryOp::Add => i.checked_add(j),
            BinaryOp::Sub => i.checked_sub(j),
            BinaryOp::Mul => i.checked_mul(j),
            BinaryOp::Div if j == 0 => return Err(EvalError::DivisionByZero),
            BinaryOp::Div => i.checked_div(j),
            BinaryOp::Rem if j == 0 => return Err(EvalError::DivisionByZero),
            BinaryOp::Rem => i.checked_rem(j),
            _ => None,
        };
        return result
            .map(Value::from)
            .ok_or_else(|| EvalError::type_mismatch("integer overflow"));
    }
    let (l, r) = (x.as_f64().unwrap_or_default(), y.as_f64().unwrap_or_default());
    let result = match op {
        BinaryOp::Add => l + r,
        BinaryOp::Sub => l - r,
        BinaryOp::Mul => l * r,
        BinaryOp::Div => l / r,
        BinaryOp::Rem => l % r,
        _ => return Err(EvalError::type_mismatch("not an arithmetic operator")),
    };
    float_value(result)
}

fn binary(op: BinaryOp, l: &Value, r: &Value) -> Result<Value, EvalError> {
    match op {
        BinaryOp::Eq => Ok(Value::Bool(values_equal(l, r))),
        BinaryOp::Ne => Ok(Value::Bool(!values_equal(l, r))),
        BinaryOp::Lt => Ok(Value::Bool(compare(l, r)? == Ordering::Less)),
        BinaryOp::Le => Ok(Value::Bool(compare(l, r)? != Ordering::Greater)),
        BinaryOp::Gt => Ok(Value::Bool(compare(l, r)? == Ordering::Greater)),
        BinaryOp::Ge => Ok(Value::Bool(compare(l, r)? != Ordering::Less)),
        BinaryOp::In => match r {
            Value::Array(items) => Ok(Value::Bool(items.iter().any(|i| values_equal(i, l)))),
            Value::Object(map) => match l {
                Value::String(k) => Ok(Value::Bool(map.contains_key(k))),
                other => Err(EvalError::type_mismatch(format!(
                    "map key must be string, got {}",
                    type_name(other)
                ))),
            },
            other => Err(EvalError::NoSuchOverload(format!(
                "'in' on {}",
                type_name(other)
            ))),
        },
        BinaryOp::Add => match (l, r) {
            (Value::Number(x), Value::Number(y)) => arithmetic(op, x, y),
            (Value::String(x), Value::String(y)) => Ok(Value::String(format!("{x}{y}"))),
            (Value::Array(x), Value::Array(y)) => {
                Ok(Value::Array(x.iter().chain(y).cloned().collect()))
            }
            (x, y) => Err(EvalError::NoSuchOverload(format!(
                "{} + {}",
                type_name(x),
                type_name(y)
            ))),
        },
        BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => match (l, r) {
            (Value::Number(x), Value::Number(y)) => arithmetic(op, x, y),
            (x, y) => Err(EvalError::NoSuchOverload(format!(
                "{op:?} on {} and {}",
                type_name(x),
                type_name(y)
            ))),
        },
        BinaryOp::And | BinaryOp::Or => Err(EvalError::type_mismatch(
            "logical operators are evaluated lazily",
        )),
    }
}
