//! Arc inscriptions, guards and variable bindings
//!
//! Input arcs carry patterns that are matched against the tokens of a
//! place; output arcs carry patterns that are evaluated under the binding
//! selected for a firing.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::{SimError, SimResult, Token};

/// Assignment of pattern variables to concrete tokens
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Binding(BTreeMap<String, Token>);

impl Binding {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert, mostly for tests
    pub fn with(mut self, name: impl Into<String>, token: impl Into<Token>) -> Self {
        self.0.insert(name.into(), token.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&Token> {
        self.0.get(name)
    }

    /// Bind `name` to `token`; false if already bound to a different value
    pub fn bind(&mut self, name: &str, token: &Token) -> bool {
        match self.0.get(name) {
            Some(existing) => existing == token,
            None => {
                self.0.insert(name.to_string(), token.clone());
                true
            }
        }
    }

    pub fn value(&self, name: &str) -> SimResult<&Token> {
        self.0
            .get(name)
            .ok_or_else(|| SimError::UnboundVariable(name.to_string()))
    }

    pub fn float(&self, name: &str) -> SimResult<f64> {
        let token = self.value(name)?;
        token.as_float().ok_or_else(|| kind_error(name, "float", token))
    }

    pub fn int(&self, name: &str) -> SimResult<i64> {
        let token = self.value(name)?;
        token.as_int().ok_or_else(|| kind_error(name, "int", token))
    }

    pub fn boolean(&self, name: &str) -> SimResult<bool> {
        let token = self.value(name)?;
        token.as_bool().ok_or_else(|| kind_error(name, "bool", token))
    }

    pub fn string(&self, name: &str) -> SimResult<&str> {
        let token = self.value(name)?;
        token.as_str().ok_or_else(|| kind_error(name, "str", token))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Token)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

fn kind_error(name: &str, expected: &str, token: &Token) -> SimError {
    SimError::Expression {
        label: name.to_string(),
        reason: format!("expected {}, got {}", expected, token.kind()),
    }
}

impl fmt::Display for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (name, token)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{} -> {}", name, token)?;
        }
        f.write_str("}")
    }
}

type ExprFn = dyn Fn(&Binding) -> SimResult<Token> + Send + Sync;
type GuardFn = dyn Fn(&Binding) -> bool + Send + Sync;

/// Computed output inscription
#[derive(Clone)]
pub struct Expr {
    label: String,
    func: Arc<ExprFn>,
}

impl Expr {
    pub fn new<F>(label: impl Into<String>, func: F) -> Self
    where
        F: Fn(&Binding) -> SimResult<Token> + Send + Sync + 'static,
    {
        Expr {
            label: label.into(),
            func: Arc::new(func),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn eval(&self, binding: &Binding) -> SimResult<Token> {
        (self.func)(binding)
    }
}

impl fmt::Debug for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Expr({})", self.label)
    }
}

/// Transition guard predicate
#[derive(Clone)]
pub struct Guard {
    label: String,
    func: Arc<GuardFn>,
}

impl Guard {
    pub fn new<F>(label: impl Into<String>, func: F) -> Self
    where
        F: Fn(&Binding) -> bool + Send + Sync + 'static,
    {
        Guard {
            label: label.into(),
            func: Arc::new(func),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn check(&self, binding: &Binding) -> bool {
        (self.func)(binding)
    }
}

impl fmt::Debug for Guard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Guard({})", self.label)
    }
}

/// Arc inscription
#[derive(Clone, Debug)]
pub enum Pattern {
    /// Binds (or checks) a variable
    Var(String),
    /// Matches / produces a constant
    Value(Token),
    /// Matches / produces a tuple element-wise
    Tuple(Vec<Pattern>),
    /// Output-only computed value
    Expr(Expr),
}

impl Pattern {
    pub fn var(name: impl Into<String>) -> Self {
        Pattern::Var(name.into())
    }

    pub fn value(token: impl Into<Token>) -> Self {
        Pattern::Value(token.into())
    }

    pub fn tuple<I: IntoIterator<Item = Pattern>>(items: I) -> Self {
        Pattern::Tuple(items.into_iter().collect())
    }

    pub fn expr<F>(label: impl Into<String>, func: F) -> Self
    where
        F: Fn(&Binding) -> SimResult<Token> + Send + Sync + 'static,
    {
        Pattern::Expr(Expr::new(label, func))
    }

    /// Whether the pattern can be matched against tokens
    pub fn is_matchable(&self) -> bool {
        match self {
            Pattern::Var(_) | Pattern::Value(_) => true,
            Pattern::Tuple(items) => items.iter().all(Pattern::is_matchable),
            Pattern::Expr(_) => false,
        }
    }

    /// Extend `binding` so that this pattern produces `token`
    pub fn match_token(&self, token: &Token, binding: &Binding) -> Option<Binding> {
        let mut extended = binding.clone();
        if self.match_into(token, &mut extended) {
            Some(extended)
        } else {
            None
        }
    }

    fn match_into(&self, token: &Token, binding: &mut Binding) -> bool {
        match self {
            Pattern::Var(name) => binding.bind(name, token),
            Pattern::Value(value) => value == token,
            Pattern::Tuple(items) => match token {
                Token::Tuple(values) if values.len() == items.len() => items
                    .iter()
                    .zip(values)
                    .all(|(pattern, value)| pattern.match_into(value, binding)),
                _ => false,
            },
            Pattern::Expr(_) => false,
        }
    }

    /// Token produced by this pattern under `binding`
    pub fn flow(&self, binding: &Binding) -> SimResult<Token> {
        match self {
            Pattern::Var(name) => binding.value(name).cloned(),
            Pattern::Value(value) => Ok(value.clone()),
            Pattern::Tuple(items) => items
                .iter()
                .map(|item| item.flow(binding))
                .collect::<SimResult<Vec<_>>>()
                .map(Token::Tuple),
            Pattern::Expr(expr) => expr.eval(binding),
        }
    }

    /// Variables named directly by this pattern (not inside expressions)
    pub fn variables(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_variables(&mut out);
        out
    }

    fn collect_variables<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Pattern::Var(name) => out.push(name),
            Pattern::Tuple(items) => {
                for item in items {
                    item.collect_variables(out);
                }
            }
            Pattern::Value(_) | Pattern::Expr(_) => {}
        }
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pattern::Var(name) => f.write_str(name),
            Pattern::Value(token) => write!(f, "{}", token),
            Pattern::Tuple(items) => {
                f.write_str("(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                f.write_str(")")
            }
            Pattern::Expr(expr) => f.write_str(expr.label()),
        }
    }
}
