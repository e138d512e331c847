//! Places and their token multisets

use std::collections::BTreeMap;
use std::fmt;

use crate::{SimError, SimResult, Token, TokenKind};

/// Bag of tokens with deterministic iteration order
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MultiSet {
    items: BTreeMap<Token, usize>,
    len: usize,
}

impl MultiSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, token: Token) {
        *self.items.entry(token).or_insert(0) += 1;
        self.len += 1;
    }

    pub fn add_all<I: IntoIterator<Item = Token>>(&mut self, tokens: I) {
        for token in tokens {
            self.add(token);
        }
    }

    /// Remove one occurrence; returns false when absent
    pub fn remove(&mut self, token: &Token) -> bool {
        match self.items.get_mut(token) {
            Some(count) => {
                *count -= 1;
                if *count == 0 {
                    self.items.remove(token);
                }
                self.len -= 1;
                true
            }
            None => false,
        }
    }

    pub fn count(&self, token: &Token) -> usize {
        self.items.get(token).copied().unwrap_or(0)
    }

    /// Whether every token of `other` is available with its multiplicity
    pub fn contains_all(&self, other: &MultiSet) -> bool {
        other
            .items
            .iter()
            .all(|(token, n)| self.count(token) >= *n)
    }

    /// Distinct tokens in ascending order
    pub fn distinct(&self) -> impl Iterator<Item = &Token> {
        self.items.keys()
    }

    /// All tokens, repeated by multiplicity, in ascending order
    pub fn iter(&self) -> impl Iterator<Item = &Token> {
        self.items
            .iter()
            .flat_map(|(token, n)| std::iter::repeat(token).take(*n))
    }

    pub fn drain(&mut self) -> Vec<Token> {
        let tokens = self.iter().cloned().collect();
        self.items.clear();
        self.len = 0;
        tokens
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl FromIterator<Token> for MultiSet {
    fn from_iter<I: IntoIterator<Item = Token>>(iter: I) -> Self {
        let mut set = MultiSet::new();
        set.add_all(iter);
        set
    }
}

/// External role of a place
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum PortRole {
    #[default]
    Unbound,
    /// Receives tokens from an external topic
    Input,
    /// Publishes tokens to one or more external topics
    Output,
}

impl fmt::Display for PortRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortRole::Unbound => f.write_str("unbound"),
            PortRole::Input => f.write_str("input"),
            PortRole::Output => f.write_str("output"),
        }
    }
}

/// A named multiset of tokens, optionally bound to a port role
#[derive(Clone, Debug)]
pub struct Place {
    name: String,
    tokens: MultiSet,
    check: Option<TokenKind>,
    role: PortRole,
    input_topics: Vec<String>,
    output_topics: Vec<String>,
}

impl Place {
    pub fn new(name: impl Into<String>) -> Self {
        Place {
            name: name.into(),
            tokens: MultiSet::new(),
            check: None,
            role: PortRole::Unbound,
            input_topics: Vec::new(),
            output_topics: Vec::new(),
        }
    }

    /// Restrict the place to tokens of one kind
    pub fn checked(mut self, kind: TokenKind) -> Self {
        self.check = Some(kind);
        self
    }

    /// Initial marking
    pub fn with_tokens<I: IntoIterator<Item = Token>>(mut self, tokens: I) -> SimResult<Self> {
        self.add_all(tokens)?;
        Ok(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tokens(&self) -> &MultiSet {
        &self.tokens
    }

    pub fn check(&self) -> Option<TokenKind> {
        self.check
    }

    pub fn add(&mut self, token: Token) -> SimResult<()> {
        self.check_kind(&token)?;
        self.tokens.add(token);
        Ok(())
    }

    pub fn add_all<I: IntoIterator<Item = Token>>(&mut self, tokens: I) -> SimResult<()> {
        for token in tokens {
            self.add(token)?;
        }
        Ok(())
    }

    pub(crate) fn tokens_mut(&mut self) -> &mut MultiSet {
        &mut self.tokens
    }

    pub fn check_kind(&self, token: &Token) -> SimResult<()> {
        match self.check {
            Some(expected) if expected != token.kind() => Err(SimError::TypeMismatch {
                place: self.name.clone(),
                expected,
                actual: token.kind(),
            }),
            _ => Ok(()),
        }
    }

    pub fn role(&self) -> PortRole {
        self.role
    }

    /// Assign the port role; a role can be set once, re-setting the same role is a no-op
    pub fn set_role(&mut self, role: PortRole) -> SimResult<()> {
        if self.role == PortRole::Unbound || self.role == role {
            self.role = role;
            Ok(())
        } else {
            Err(SimError::ConflictingPortRole {
                place: self.name.clone(),
                current: self.role,
                requested: role,
            })
        }
    }

    pub fn add_input_topic(&mut self, topic: impl Into<String>) -> SimResult<()> {
        self.set_role(PortRole::Input)?;
        let topic = topic.into();
        if !self.input_topics.contains(&topic) {
            self.input_topics.push(topic);
        }
        Ok(())
    }

    pub fn add_output_topic(&mut self, topic: impl Into<String>) -> SimResult<()> {
        self.set_role(PortRole::Output)?;
        let topic = topic.into();
        if !self.output_topics.contains(&topic) {
            self.output_topics.push(topic);
        }
        Ok(())
    }

    pub fn input_topics(&self) -> &[String] {
        &self.input_topics
    }

    pub fn output_topics(&self) -> &[String] {
        &self.output_topics
    }
}
