//! Metadata predicates for adapter queries
//!
//! Predicates are built programmatically or parsed from a small text form:
//!
//! ```text
//! language = rust AND NOT has draft
//! type = code OR content ~ "retry loop"
//! tags ~ auth
//! ```
//!
//! `=` is equality, `~` is case-insensitive containment, `has key` tests for
//! presence. `AND` binds tighter than `OR`; parentheses group.

use crate::error::{MemoryError, MemoryResult};
use crate::item::{value_text, MemoryItem, MemoryItemType};
use serde::{Deserialize, Serialize};

/// Boolean filter over memory items
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Predicate {
    /// Matches everything
    All,
    /// Metadata value equals (string comparison for non-string values)
    Eq { key: String, value: serde_json::Value },
    /// Metadata value contains the needle (arrays: any element equals it)
    Contains { key: String, needle: String },
    /// Metadata key present
    Exists { key: String },
    /// Item type matches
    TypeIs { item_type: MemoryItemType },
    /// Content text contains the needle
    ContentContains { needle: String },
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
}

impl Predicate {
    /// Metadata `key` equals `value`
    pub fn eq(key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        Self::Eq {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Metadata `key` contains `needle`, case-insensitively
    pub fn contains(key: impl Into<String>, needle: impl Into<String>) -> Self {
        Self::Contains {
            key: key.into(),
            needle: needle.into(),
        }
    }

    /// Metadata `key` is present
    pub fn exists(key: impl Into<String>) -> Self {
        Self::Exists { key: key.into() }
    }

    /// Item has the given type
    pub fn type_is(item_type: MemoryItemType) -> Self {
        Self::TypeIs { item_type }
    }

    /// Content text contains `needle`, case-insensitively
    pub fn content_contains(needle: impl Into<String>) -> Self {
        Self::ContentContains {
            needle: needle.into(),
        }
    }

    /// Conjunction, flattening `All`
    pub fn and(self, other: Predicate) -> Self {
        match (self, other) {
            (Predicate::All, p) | (p, Predicate::All) => p,
            (Predicate::And(mut left), Predicate::And(right)) => {
                left.extend(right);
                Predicate::And(left)
            }
            (Predicate::And(mut left), p) => {
                left.push(p);
                Predicate::And(left)
            }
            (p, q) => Predicate::And(vec![p, q]),
        }
    }

    /// Build an equality conjunction from key/value pairs
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<serde_json::Value>,
    {
        pairs
            .into_iter()
            .fold(Predicate::All, |acc, (k, v)| acc.and(Predicate::eq(k, v)))
    }

    /// Evaluate against an item
    pub fn matches(&self, item: &MemoryItem) -> bool {
        match self {
            Predicate::All => true,
            Predicate::Eq { key, value } => match item.metadata.get(key) {
                Some(actual) => actual == value || value_text(actual) == value_text(value),
                None => false,
            },
            Predicate::Contains { key, needle } => match item.metadata.get(key) {
                Some(serde_json::Value::Array(values)) => values
                    .iter()
                    .any(|v| value_text(v).eq_ignore_ascii_case(needle)),
                Some(actual) => value_text(actual)
                    .to_lowercase()
                    .contains(&needle.to_lowercase()),
                None => false,
            },
            Predicate::Exists { key } => item.metadata.contains_key(key),
            Predicate::TypeIs { item_type } => &item.item_type == item_type,
            Predicate::ContentContains { needle } => item
                .content_text()
                .to_lowercase()
                .contains(&needle.to_lowercase()),
            Predicate::And(parts) => parts.iter().all(|p| p.matches(item)),
            Predicate::Or(parts) => parts.iter().any(|p| p.matches(item)),
            Predicate::Not(inner) => !inner.matches(item),
        }
    }

    /// Parse the text form
    pub fn parse(input: &str) -> MemoryResult<Self> {
        let tokens = tokenize(input)?;
        if tokens.is_empty() {
            return Ok(Predicate::All);
        }
        let mut parser = Parser {
            tokens,
            pos: 0,
            end: input.len(),
            depth: 0,
        };
        let predicate = parser.parse_or()?;
        if let Some(token) = parser.peek() {
            return Err(MemoryError::syntax(token.offset, format!("unexpected '{}'", token.text)));
        }
        Ok(predicate)
    }
}

impl Default for Predicate {
    fn default() -> Self {
        Predicate::All
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Kind {
    Word,
    Quoted,
    Eq,
    Tilde,
    LParen,
    RParen,
}

#[derive(Debug, Clone)]
struct Token {
    kind: Kind,
    text: String,
    offset: usize,
}

fn tokenize(input: &str) -> MemoryResult<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();

    while let Some(&(offset, c)) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '=' | '~' | '(' | ')' => {
                chars.next();
                let kind = match c {
                    '=' => Kind::Eq,
                    '~' => Kind::Tilde,
                    '(' => Kind::LParen,
                    _ => Kind::RParen,
                };
                tokens.push(Token { kind, text: c.to_string(), offset });
            }
            '"' => {
                chars.next();
                let mut text = String::new();
                let mut closed = false;
                for (_, c) in chars.by_ref() {
                    if c == '"' {
                        closed = true;
                        break;
                    }
                    text.push(c);
                }
                if !closed {
                    return Err(MemoryError::syntax(offset, "unterminated string"));
                }
                tokens.push(Token { kind: Kind::Quoted, text, offset });
            }
            _ => {
                let mut text = String::new();
                while let Some(&(_, c)) = chars.peek() {
                    if c.is_whitespace() || matches!(c, '=' | '~' | '(' | ')' | '"') {
                        break;
                    }
                    text.push(c);
                    chars.next();
                }
                tokens.push(Token { kind: Kind::Word, text, offset });
            }
        }
    }

    Ok(tokens)
}

/// Deepest `NOT`/parenthesis nesting the parser accepts
pub const MAX_NESTING: usize = 32;

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    end: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn offset(&self) -> usize {
        self.peek().map_or(self.end, |t| t.offset)
    }

    fn descend(&mut self, offset: usize) -> MemoryResult<()> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(MemoryError::validation(
                "predicate",
                format!("nesting deeper than {MAX_NESTING}"),
                format!("offset {offset}"),
            ));
        }
        Ok(())
    }

    fn keyword(&self, word: &str) -> bool {
        matches!(self.peek(), Some(t) if t.kind == Kind::Word && t.text.eq_ignore_ascii_case(word))
    }

    fn parse_or(&mut self) -> MemoryResult<Predicate> {
        let mut parts = vec![self.parse_and()?];
        while self.keyword("OR") {
            self.pos += 1;
            parts.push(self.parse_and()?);
        }
        Ok(if parts.len() == 1 { parts.remove(0) } else { Predicate::Or(parts) })
    }

    fn parse_and(&mut self) -> MemoryResult<Predicate> {
        let mut parts = vec![self.parse_unary()?];
        while self.keyword("AND") {
            self.pos += 1;
            parts.push(self.parse_unary()?);
        }
        Ok(if parts.len() == 1 { parts.remove(0) } else { Predicate::And(parts) })
    }

    fn parse_unary(&mut self) -> MemoryResult<Predicate> {
        if self.keyword("NOT") {
            let offset = self.offset();
            self.descend(offset)?;
            self.pos += 1;
            let inner = self.parse_unary()?;
            self.depth -= 1;
            return Ok(Predicate::Not(Box::new(inner)));
        }
        if self.keyword("HAS") {
            self.pos += 1;
            let key = self.expect_operand()?;
            return Ok(Predicate::exists(key));
        }
        match self.peek() {
            Some(t) if t.kind == Kind::LParen => {
                let offset = t.offset;
                self.descend(offset)?;
                self.pos += 1;
                let inner = self.parse_or()?;
                self.depth -= 1;
                match self.next() {
                    Some(t) if t.kind == Kind::RParen => Ok(inner),
                    Some(t) => Err(MemoryError::syntax(t.offset, "expected ')'")),
                    None => Err(MemoryError::syntax(self.end, "expected ')'")),
                }
            }
            _ => self.parse_comparison(),
        }
    }

    fn parse_comparison(&mut self) -> MemoryResult<Predicate> {
        let key = self.expect_operand()?;
        let op = match self.next() {
            Some(t) if t.kind == Kind::Eq || t.kind == Kind::Tilde => t,
            Some(t) => {
                return Err(MemoryError::syntax(
                    t.offset,
                    format!("expected '=' or '~' after '{key}', found '{}'", t.text),
                ))
            }
            None => return Err(MemoryError::syntax(self.end, format!("expected operator after '{key}'"))),
        };
        let value = self.expect_operand()?;

        Ok(match (key.to_ascii_lowercase().as_str(), op.kind) {
            ("type", Kind::Eq) => Predicate::type_is(MemoryItemType::parse(&value)),
            ("content", Kind::Tilde) => Predicate::content_contains(value),
            (_, Kind::Eq) => Predicate::eq(key, value),
            _ => Predicate::contains(key, value),
        })
    }

    fn expect_operand(&mut self) -> MemoryResult<String> {
        match self.next() {
            Some(t) if t.kind == Kind::Word || t.kind == Kind::Quoted => Ok(t.text),
            Some(t) => Err(MemoryError::syntax(t.offset, format!("unexpected '{}'", t.text))),
            None => Err(MemoryError::syntax(self.end, "unexpected end of input")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> MemoryItem {
        MemoryItem::new(MemoryItemType::Code, "impl retry loop with backoff")
            .with_id("c1")
            .with_metadata("language", "rust")
            .with_metadata("tags", serde_json::json!(["auth", "network"]))
            .with_metadata("confidence_score", 0.9)
    }

    #[test]
    fn test_programmatic_predicates() {
        let item = sample();
        assert!(Predicate::All.matches(&item));
        assert!(Predicate::eq("language", "rust").matches(&item));
        assert!(Predicate::eq("confidence_score", 0.9).matches(&item));
        assert!(Predicate::contains("tags", "AUTH").matches(&item));
        assert!(!Predicate::exists("draft").matches(&item));
        assert!(Predicate::from_pairs([("language", "rust")]).matches(&item));
    }

    #[test]
    fn test_parse_and_or_not() {
        let item = sample();
        let p = Predicate::parse("language = rust AND NOT has draft").unwrap();
        assert!(p.matches(&item));

        let p = Predicate::parse("type = knowledge OR content ~ \"retry loop\"").unwrap();
        assert!(p.matches(&item));

        let p = Predicate::parse("(language = go OR language = python) AND tags ~ auth").unwrap();
        assert!(!p.matches(&item));
    }

    #[test]
    fn test_empty_input_matches_all() {
        assert_eq!(Predicate::parse("   ").unwrap(), Predicate::All);
    }

    #[test]
    fn test_syntax_errors_report_position() {
        let err = Predicate::parse("language rust").unwrap_err();
        assert!(matches!(err, MemoryError::QuerySyntax { position: 9, .. }));

        let err = Predicate::parse("(language = rust").unwrap_err();
        assert!(matches!(err, MemoryError::QuerySyntax { position: 16, .. }));

        let err = Predicate::parse("content ~ \"open").unwrap_err();
        assert!(matches!(err, MemoryError::QuerySyntax { position: 10, .. }));
    }

    #[test]
    fn test_nesting_depth_is_capped() {
        let nested = format!("{}language = rust{}", "(".repeat(MAX_NESTING), ")".repeat(MAX_NESTING));
        assert!(Predicate::parse(&nested).unwrap().matches(&sample()));

        let hostile = format!("{}has draft", "NOT ".repeat(10_000));
        let err = Predicate::parse(&hostile).unwrap_err();
        assert!(matches!(err, MemoryError::Validation { ref field, .. } if field == "predicate"));

        let hostile = "(".repeat(10_000);
        assert!(matches!(Predicate::parse(&hostile), Err(MemoryError::Validation { .. })));
    }
}
