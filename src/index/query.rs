//! Free-text query grammar and structured filters.
//!
//! The grammar:
//!
//! ```text
//! query    := or
//! or       := and ("OR" and)*
//! and      := not (["AND"] not)*
//! not      := "NOT" not | primary
//! primary  := "(" query ")" | phrase | term
//! term     := word | name ":" value | name ":=" value | name ":" [a] ".." [b]
//! phrase   := '"' words '"'
//! ```
//!
//! Both the committed index and the pending cache evaluate the same [`Query`] tree, so
//! a document matches identically before and after its commit.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::document::{exact_key, tokenize, word_key, IndexedDoc, SortKey};
use super::{IndexError, IndexResult};
use crate::metadata::{Metadata, PropertyDescriptor, Typecast, LAYER};

/// Parsed query tree.
#[derive(Clone, Debug, PartialEq)]
pub enum Query {
    /// Matches every document.
    All,

    /// A word, either free text or restricted to one property.
    Word { prop: Option<String>, word: String },

    /// Consecutive words.
    Phrase { prop: Option<String>, words: Vec<String> },

    /// Exact attribute value.
    Exact { prop: String, value: String },

    /// Inclusive slot range; a missing bound is open.
    Range {
        prop: String,
        from: Option<String>,
        to: Option<String>,
    },

    And(Vec<Query>),
    Or(Vec<Query>),
    Not(Box<Query>),
}

/// A find request.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FindRequest {
    /// Free-text query string.
    #[serde(default)]
    pub query: Option<String>,

    /// Structured filter: a value means equality, a list means any-of, a `!` or `-`
    /// prefix excludes matching documents.
    #[serde(default)]
    pub filters: BTreeMap<String, serde_json::Value>,

    /// Properties prefixed by `+` (ascending, the default) or `-` (descending).
    #[serde(default)]
    pub order_by: Vec<String>,

    #[serde(default)]
    pub group_by: Option<String>,

    #[serde(default)]
    pub offset: usize,

    #[serde(default)]
    pub limit: Option<usize>,

    /// Properties to materialize in results.
    #[serde(default)]
    pub reply: Vec<String>,

    /// Language preference for localized sorting and projection.
    #[serde(default)]
    pub languages: Vec<String>,

    /// Keep documents tagged `deleted` even when no filter names `layer`.
    #[serde(default)]
    pub include_deleted: bool,
}

impl FindRequest {
    pub fn query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    pub fn filter(mut self, prop: impl Into<String>, value: serde_json::Value) -> Self {
        self.filters.insert(prop.into(), value);
        self
    }

    pub fn order_by(mut self, prop: impl Into<String>) -> Self {
        self.order_by.push(prop.into());
        self
    }

    pub fn group_by(mut self, prop: impl Into<String>) -> Self {
        self.group_by = Some(prop.into());
        self
    }

    pub fn limit(mut self, offset: usize, limit: usize) -> Self {
        self.offset = offset;
        self.limit = Some(limit);
        self
    }

    pub fn reply(mut self, props: &[&str]) -> Self {
        self.reply = props.iter().map(|p| p.to_string()).collect();
        self
    }

    /// Combines the query string and the filters into one tree.
    ///
    /// Documents tagged `deleted` are excluded unless the filter names `layer` or
    /// `include_deleted` is set.
    pub fn compile(&self) -> IndexResult<Query> {
        let mut parts = Vec::new();

        if let Some(text) = self.query.as_deref().filter(|q| !q.trim().is_empty()) {
            parts.push(parse(text)?);
        }

        for (prop, value) in &self.filters {
            parts.extend(filter_clauses(prop, value)?);
        }

        if !self.include_deleted && !self.filters.contains_key(LAYER) {
            parts.push(Query::Not(Box::new(Query::Exact {
                prop: LAYER.to_string(),
                value: "deleted".to_string(),
            })));
        }

        Ok(match parts.len() {
            0 => Query::All,
            1 => parts.remove(0),
            _ => Query::And(parts),
        })
    }
}

fn filter_clauses(prop: &str, value: &serde_json::Value) -> IndexResult<Vec<Query>> {
    let exact = |text: String| Query::Exact {
        prop: prop.to_string(),
        value: text,
    };

    match value {
        serde_json::Value::Array(items) => {
            let alternatives = items.iter().map(|item| exact(scalar_text(item))).collect();
            Ok(vec![Query::Or(alternatives)])
        }
        serde_json::Value::Null => Err(IndexError::Query(format!(
            "filter on {} has no value",
            prop
        ))),
        serde_json::Value::String(text) => {
            match text.strip_prefix('!').or_else(|| text.strip_prefix('-')) {
                Some(negated) => Ok(vec![Query::Not(Box::new(exact(negated.to_string())))]),
                None => Ok(vec![exact(text.clone())]),
            }
        }
        scalar => Ok(vec![exact(scalar_text(scalar))]),
    }
}

fn scalar_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Word(String),
    Phrase(String),
    LParen,
    RParen,
}

fn lex(input: &str) -> IndexResult<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c == '(' {
            chars.next();
            tokens.push(Token::LParen);
        } else if c == ')' {
            chars.next();
            tokens.push(Token::RParen);
        } else if c == '"' {
            chars.next();
            let mut phrase = String::new();
            let mut closed = false;
            for c in chars.by_ref() {
                if c == '"' {
                    closed = true;
                    break;
                }
                phrase.push(c);
            }
            if !closed {
                return Err(IndexError::Query("unterminated phrase".to_string()));
            }
            tokens.push(Token::Phrase(phrase));
        } else {
            let mut word = String::new();
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() || c == '(' || c == ')' {
                    break;
                }
                if c == '"' {
                    // name:"some phrase"
                    if word.ends_with(':') || word.ends_with(":=") {
                        chars.next();
                        word.push('"');
                        for c in chars.by_ref() {
                            word.push(c);
                            if c == '"' {
                                break;
                            }
                        }
                        continue;
                    }
                    break;
                }
                word.push(c);
                chars.next();
            }
            tokens.push(Token::Word(word));
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
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

    fn is_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Some(Token::Word(w)) if w == keyword)
    }

    fn parse_or(&mut self) -> IndexResult<Query> {
        let mut items = vec![self.parse_and()?];
        while self.is_keyword("OR") {
            self.next();
            items.push(self.parse_and()?);
        }
        Ok(if items.len() == 1 {
            items.remove(0)
        } else {
            Query::Or(items)
        })
    }

    fn parse_and(&mut self) -> IndexResult<Query> {
        let mut items = vec![self.parse_not()?];
        loop {
            if self.is_keyword("AND") {
                self.next();
                items.push(self.parse_not()?);
                continue;
            }
            match self.peek() {
                None | Some(Token::RParen) => break,
                Some(Token::Word(w)) if w == "OR" => break,
                _ => items.push(self.parse_not()?),
            }
        }
        Ok(if items.len() == 1 {
            items.remove(0)
        } else {
            Query::And(items)
        })
    }

    fn parse_not(&mut self) -> IndexResult<Query> {
        if self.is_keyword("NOT") {
            self.next();
            return Ok(Query::Not(Box::new(self.parse_not()?)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> IndexResult<Query> {
        match self.next() {
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(IndexError::Query("missing closing parenthesis".to_string())),
                }
            }
            Some(Token::Phrase(text)) => Ok(phrase(None, &text)),
            Some(Token::Word(word)) => parse_term(&word),
            Some(Token::RParen) => Err(IndexError::Query("unexpected ')'".to_string())),
            None => Err(IndexError::Query("unexpected end of query".to_string())),
        }
    }
}

fn phrase(prop: Option<String>, text: &str) -> Query {
    let words = tokenize(text);
    match words.len() {
        0 => Query::All,
        1 => Query::Word {
            prop,
            word: words[0].clone(),
        },
        _ => Query::Phrase { prop, words },
    }
}

fn parse_term(word: &str) -> IndexResult<Query> {
    let Some((name, value)) = word.split_once(':') else {
        return Ok(phrase(None, word));
    };
    if name.is_empty() {
        return Ok(phrase(None, word));
    }
    let name = name.to_string();

    if let Some(exact) = value.strip_prefix('=') {
        return Ok(Query::Exact {
            prop: name,
            value: unquote(exact).to_string(),
        });
    }

    if let Some((from, to)) = value.split_once("..") {
        let bound = |s: &str| (!s.is_empty()).then(|| s.to_string());
        return Ok(Query::Range {
            prop: name,
            from: bound(from),
            to: bound(to),
        });
    }

    let value = unquote(value);
    if value.is_empty() {
        return Err(IndexError::Query(format!("empty value for {}", name)));
    }
    Ok(Query::Or(vec![
        Query::Exact {
            prop: name.clone(),
            value: value.to_string(),
        },
        phrase(Some(name), value),
    ]))
}

fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}

/// Parses a free-text query string.
pub fn parse(input: &str) -> IndexResult<Query> {
    let tokens = lex(input)?;
    if tokens.is_empty() {
        return Ok(Query::All);
    }
    let mut parser = Parser { tokens, pos: 0 };
    let query = parser.parse_or()?;
    if parser.pos < parser.tokens.len() {
        return Err(IndexError::Query(format!(
            "unexpected token at position {}",
            parser.pos
        )));
    }
    Ok(query)
}

/// Resolves a query name to its descriptor, by property name or by prefix.
pub fn resolve<'a>(metadata: &'a Metadata, name: &str) -> IndexResult<&'a PropertyDescriptor> {
    metadata
        .get(name)
        .or_else(|| metadata.by_prefix(name))
        .ok_or_else(|| IndexError::Query(format!("unknown property {}", name)))
}

/// Normalizes an attribute value the way the property's terms are stored.
pub fn normalize(prop: &PropertyDescriptor, value: &str) -> String {
    let inner = match &prop.typecast {
        Typecast::List(inner) => inner.as_ref(),
        other => other,
    };
    match inner.cast(&serde_json::Value::String(value.to_string())) {
        Ok(typed) => typed
            .term_strings()
            .into_iter()
            .next()
            .unwrap_or_else(|| value.to_string()),
        Err(_) => value.to_string(),
    }
}

impl Query {
    /// Evaluates the query against one indexed document.
    pub fn matches(&self, doc: &IndexedDoc, metadata: &Metadata) -> IndexResult<bool> {
        Ok(match self {
            Query::All => true,
            Query::Word { prop: None, word } => doc.has_term(&word_key("", word)),
            Query::Word {
                prop: Some(name),
                word,
            } => {
                let prop = resolve(metadata, name)?;
                match &prop.prefix {
                    Some(prefix) => {
                        doc.has_term(&word_key(prefix, word))
                            || doc.has_term(&exact_key(prefix, word))
                    }
                    None => false,
                }
            }
            Query::Phrase { prop: None, words } => doc.has_phrase("", words),
            Query::Phrase {
                prop: Some(name),
                words,
            } => {
                let prop = resolve(metadata, name)?;
                match &prop.prefix {
                    Some(prefix) => doc.has_phrase(prefix, words),
                    None => false,
                }
            }
            Query::Exact { prop: name, value } => {
                let prop = resolve(metadata, name)?;
                let value = normalize(prop, value);
                match (&prop.prefix, prop.slot) {
                    (Some(prefix), _) => doc.has_term(&exact_key(prefix, &value)),
                    (None, Some(slot)) => doc.slots.get(&slot).map_or(false, |key| {
                        key.encode() == SortKey::parse_bound(&value, &prop.typecast).encode()
                    }),
                    (None, None) => false,
                }
            }
            Query::Range {
                prop: name,
                from,
                to,
            } => {
                let prop = resolve(metadata, name)?;
                let slot = prop
                    .slot
                    .ok_or_else(|| IndexError::Query(format!("{} has no slot", name)))?;
                match doc.slots.get(&slot) {
                    Some(key) => in_range(key, from.as_deref(), to.as_deref(), &prop.typecast),
                    None => false,
                }
            }
            Query::And(items) => {
                for item in items {
                    if !item.matches(doc, metadata)? {
                        return Ok(false);
                    }
                }
                true
            }
            Query::Or(items) => {
                for item in items {
                    if item.matches(doc, metadata)? {
                        return Ok(true);
                    }
                }
                false
            }
            Query::Not(inner) => !inner.matches(doc, metadata)?,
        })
    }

    /// Relevance of a document: occurrences of the ranked words it contains.
    pub fn score(&self, doc: &IndexedDoc, metadata: &Metadata) -> usize {
        match self {
            Query::Word { prop: None, word } => {
                doc.terms.get(&word_key("", word)).map_or(0, Vec::len)
            }
            Query::Phrase { prop: None, words } => words
                .iter()
                .map(|w| doc.terms.get(&word_key("", w)).map_or(0, Vec::len))
                .sum(),
            Query::Word {
                prop: Some(name),
                word,
            } => match resolve(metadata, name) {
                Ok(prop) if !prop.boolean => prop
                    .prefix
                    .as_ref()
                    .and_then(|prefix| doc.terms.get(&word_key(prefix, word)))
                    .map_or(0, Vec::len),
                _ => 0,
            },
            Query::And(items) | Query::Or(items) => {
                items.iter().map(|item| item.score(doc, metadata)).sum()
            }
            _ => 0,
        }
    }

    /// Whether the query ranks documents by relevance.
    pub fn is_ranked(&self) -> bool {
        match self {
            Query::Word { .. } | Query::Phrase { .. } => true,
            Query::And(items) | Query::Or(items) => items.iter().any(Query::is_ranked),
            _ => false,
        }
    }
}

pub(crate) fn in_range(key: &SortKey, from: Option<&str>, to: Option<&str>, typecast: &Typecast) -> bool {
    let encoded = key.encode();
    if let Some(from) = from {
        if encoded < SortKey::parse_bound(from, typecast).encode() {
            return false;
        }
    }
    if let Some(to) = to {
        if encoded > SortKey::parse_bound(to, typecast).encode() {
            return false;
        }
    }
    true
}
