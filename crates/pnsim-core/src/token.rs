//! Token values circulating through nets
//!
//! Tokens form a closed set of kinds. Floats participate in a total order
//! (via their bit pattern) so tokens can live in ordered multisets and
//! bindings sort deterministically.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Kind of a token, as named on the wire
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TokenKind {
    Bool,
    Int,
    Float,
    Str,
    Tuple,
}

impl TokenKind {
    pub fn type_name(self) -> &'static str {
        match self {
            TokenKind::Bool => "bool",
            TokenKind::Int => "int",
            TokenKind::Float => "float",
            TokenKind::Str => "str",
            TokenKind::Tuple => "tuple",
        }
    }

    pub fn from_type_name(name: &str) -> Option<Self> {
        match name {
            "bool" => Some(TokenKind::Bool),
            "int" => Some(TokenKind::Int),
            "float" => Some(TokenKind::Float),
            "str" => Some(TokenKind::Str),
            "tuple" => Some(TokenKind::Tuple),
            _ => None,
        }
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_name())
    }
}

/// An immutable typed value
#[derive(Clone, Debug)]
pub enum Token {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Tuple(Vec<Token>),
}

impl Token {
    #[inline]
    pub fn kind(&self) -> TokenKind {
        match self {
            Token::Bool(_) => TokenKind::Bool,
            Token::Int(_) => TokenKind::Int,
            Token::Float(_) => TokenKind::Float,
            Token::Str(_) => TokenKind::Str,
            Token::Tuple(_) => TokenKind::Tuple,
        }
    }

    pub fn tuple<I: IntoIterator<Item = Token>>(items: I) -> Self {
        Token::Tuple(items.into_iter().collect())
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Token::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Token::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Numeric view; ints widen to floats
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Token::Float(v) => Some(*v),
            Token::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Token::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_tuple(&self) -> Option<&[Token]> {
        match self {
            Token::Tuple(items) => Some(items),
            _ => None,
        }
    }
}

impl PartialEq for Token {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Token {}

impl Ord for Token {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Token::Bool(a), Token::Bool(b)) => a.cmp(b),
            (Token::Int(a), Token::Int(b)) => a.cmp(b),
            (Token::Float(a), Token::Float(b)) => a.total_cmp(b),
            (Token::Str(a), Token::Str(b)) => a.cmp(b),
            (Token::Tuple(a), Token::Tuple(b)) => a.cmp(b),
            _ => self.kind().cmp(&other.kind()),
        }
    }
}

impl PartialOrd for Token {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Hash for Token {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.kind().hash(state);
        match self {
            Token::Bool(b) => b.hash(state),
            Token::Int(i) => i.hash(state),
            Token::Float(v) => v.to_bits().hash(state),
            Token::Str(s) => s.hash(state),
            Token::Tuple(items) => items.hash(state),
        }
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Bool(true) => f.write_str("True"),
            Token::Bool(false) => f.write_str("False"),
            Token::Int(i) => write!(f, "{}", i),
            Token::Float(v) => write!(f, "{:?}", v),
            Token::Str(s) => write!(f, "{:?}", s),
            Token::Tuple(items) => {
                f.write_str("(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                f.write_str(")")
            }
        }
    }
}

impl From<bool> for Token {
    fn from(v: bool) -> Self {
        Token::Bool(v)
    }
}

impl From<i64> for Token {
    fn from(v: i64) -> Self {
        Token::Int(v)
    }
}

impl From<i32> for Token {
    fn from(v: i32) -> Self {
        Token::Int(v as i64)
    }
}

impl From<f64> for Token {
    fn from(v: f64) -> Self {
        Token::Float(v)
    }
}

impl From<&str> for Token {
    fn from(v: &str) -> Self {
        Token::Str(v.to_string())
    }
}

impl From<String> for Token {
    fn from(v: String) -> Self {
        Token::Str(v)
    }
}

impl From<Vec<Token>> for Token {
    fn from(v: Vec<Token>) -> Self {
        Token::Tuple(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names_roundtrip() {
        for kind in [
            TokenKind::Bool,
            TokenKind::Int,
            TokenKind::Float,
            TokenKind::Str,
            TokenKind::Tuple,
        ] {
            assert_eq!(TokenKind::from_type_name(kind.type_name()), Some(kind));
        }
        assert_eq!(TokenKind::from_type_name("list"), None);
    }

    #[test]
    fn test_float_total_order() {
        assert!(Token::Float(-1.5) < Token::Float(0.0));
        assert_eq!(Token::Float(2.5), Token::Float(2.5));
        assert_ne!(Token::Float(1.0), Token::Int(1));
    }

    #[test]
    fn test_cross_kind_order_is_stable() {
        let mut tokens = vec![Token::from("a"), Token::from(3), Token::from(true)];
        tokens.sort();
        assert_eq!(tokens, vec![Token::from(true), Token::from(3), Token::from("a")]);
    }

    #[test]
    fn test_display_matches_python_repr() {
        let t = Token::tuple([Token::from("kitchen"), Token::from(false)]);
        assert_eq!(t.to_string(), "(\"kitchen\", False)");
        assert_eq!(Token::Float(1.0).to_string(), "1.0");
    }
}
