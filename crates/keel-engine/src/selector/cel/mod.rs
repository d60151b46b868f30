//! A small CEL dialect evaluated over JSON values.
//!
//! Supported: literals, lists and maps, field access and indexing, the usual
//! arithmetic, comparison and logical operators, `in`, the ternary operator,
//! string methods (`startsWith`, `endsWith`, `contains`, `matches`,
//! `lowerAscii`, `upperAscii`, `trim`), `size`, `has`, conversions (`int`,
//! `double`, `string`, `bool`, `type`) and the list macros `exists`, `all`,
//! `exists_one`, `filter` and `map`.
//!
//! Identifiers resolve against named variables first and then against the
//! fields of an optional subject value, so `kind == "server"` and
//! `resource.kind == "server"` are equivalent when the subject is a resource.

mod eval;
mod lexer;
mod parser;

use std::collections::BTreeMap;
use std::fmt;

use serde_json::Value;

pub(crate) use eval::values_equal;

/// Maximum accepted source length.
pub const MAX_SOURCE_LEN: usize = 16 * 1024;

/// The expression failed to parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileError {
    message: String,
}

impl CompileError {
    pub(crate) fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for CompileError {}

/// Evaluation failed at runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvalError {
    /// A field or map key was absent.
    NoSuchKey(String),
    /// An identifier resolved to nothing.
    NoSuchVariable(String),
    /// No function matches the argument types.
    NoSuchOverload(String),
    /// Operand types do not fit the operator.
    TypeMismatch(String),
    /// Integer division or modulo by zero.
    DivisionByZero,
    /// The step budget was exhausted.
    CostExceeded,
}

impl EvalError {
    pub(crate) fn type_mismatch(message: impl Into<String>) -> Self {
        Self::TypeMismatch(message.into())
    }

    /// Missing keys and variables are absorbed into `false` by selectors.
    #[must_use]
    pub fn is_missing(&self) -> bool {
        matches!(self, Self::NoSuchKey(_) | Self::NoSuchVariable(_))
    }
}

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoSuchKey(k) => write!(f, "no such key: {k}"),
            Self::NoSuchVariable(v) => write!(f, "undeclared reference: {v}"),
            Self::NoSuchOverload(o) => write!(f, "no matching overload: {o}"),
            Self::TypeMismatch(m) => write!(f, "type mismatch: {m}"),
            Self::DivisionByZero => f.write_str("division by zero"),
            Self::CostExceeded => f.write_str("evaluation cost limit exceeded"),
        }
    }
}

impl std::error::Error for EvalError {}

/// Variable bindings for one evaluation.
#[derive(Debug, Default)]
pub struct Activation<'a> {
    vars: BTreeMap<&'a str, &'a Value>,
    subject: Option<&'a Value>,
}

impl<'a> Activation<'a> {
    /// Creates an empty activation.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds a named variable.
    #[must_use]
    pub fn bind(mut self, name: &'a str, value: &'a Value) -> Self {
        self.vars.insert(name, value);
        self
    }

    /// Sets the value whose fields are addressable as bare identifiers.
    #[must_use]
    pub fn with_subject(mut self, subject: &'a Value) -> Self {
        self.subject = Some(subject);
        self
    }

    fn resolve(&self, name: &str) -> Option<Value> {
        if let Some(v) = self.vars.get(name) {
            return Some((*v).clone());
        }
        match self.subject {
            Some(Value::Object(map)) => map.get(name).cloned(),
            _ => None,
        }
    }
}

/// A compiled expression.
#[derive(Debug, Clone)]
pub struct Program {
    source: String,
    expr: parser::Expr,
}

impl Program {
    /// Parses `source`.
    ///
    /// # Errors
    ///
    /// Returns a [`CompileError`] when the source is empty, too long, or malformed.
    pub fn compile(source: &str) -> Result<Self, CompileError> {
        if source.trim().is_empty() {
            return Err(CompileError::new("expression is empty"));
        }
        if source.len() > MAX_SOURCE_LEN {
            return Err(CompileError::new(format!(
                "expression exceeds {MAX_SOURCE_LEN} bytes"
            )));
        }
        let tokens = lexer::tokenize(source)?;
        let expr = parser::parse(tokens)?;
        Ok(Self {
            source: source.to_string(),
            expr,
        })
    }

    /// Source text the program was compiled from.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluates the program.
    ///
    /// # Errors
    ///
    /// Returns an [`EvalError`] on missing data, type mismatches or cost overrun.
    pub fn evaluate(&self, activation: &Activation<'_>) -> Result<Value, EvalError> {
        eval::Evaluator::new(activation).eval(&self.expr)
    }

    /// Evaluates the program and requires a boolean result.
    ///
    /// # Errors
    ///
    /// Returns an [`EvalError`] if evaluation fails or the result is not a bool.
    pub fn evaluate_bool(&self, activation: &Activation<'_>) -> Result<bool, EvalError> {
        match self.evaluate(activation)? {
            Value::Bool(b) => Ok(b),
            other => Err(EvalError::type_mismatch(format!(
                "expected bool result, got {}",
                eval::type_name(&other)
            ))),
        }
    }
}
