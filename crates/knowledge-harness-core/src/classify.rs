//! Query classification and fusion weighting.
//!
//! A query is tagged with one of four [`QueryClass`]es by cheap string
//! heuristics. The class only selects the semantic/lexical weights used by
//! Reciprocal Rank Fusion; it never filters results. Rules are evaluated in
//! order and the first match wins:
//!
//! 1. `exact_match`: a quoted phrase, a lookup prefix such as
//!    `"find the term"`, or a single identifier-like token (`ERR-4021`).
//! 2. `technical`: code-like tokens (`::`, `()`, `->`, backticks,
//!    `snake_case`, `camelCase`, mixed letters and digits).
//! 3. `conversational`: first/second person pronouns or greetings.
//! 4. `conceptual`: everything else.
//!
//! The weight table is configuration ([`FusionPolicy`]) and can be overridden
//! per tenant.

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryClass {
    Conceptual,
    Technical,
    Conversational,
    ExactMatch,
}

impl QueryClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryClass::Conceptual => "conceptual",
            QueryClass::Technical => "technical",
            QueryClass::Conversational => "conversational",
            QueryClass::ExactMatch => "exact_match",
        }
    }
}

impl std::fmt::Display for QueryClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-list RRF weights.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FusionWeights {
    pub semantic: f64,
    pub lexical: f64,
}

impl FusionWeights {
    pub const fn new(semantic: f64, lexical: f64) -> Self {
        Self { semantic, lexical }
    }

    fn validate(&self, class: QueryClass) -> EngineResult<()> {
        let ok = |w: f64| w.is_finite() && w >= 0.0;
        if !ok(self.semantic) || !ok(self.lexical) || self.semantic + self.lexical <= 0.0 {
            return Err(EngineError::Configuration(format!(
                "fusion weights for {} must be finite, non-negative and not both zero",
                class
            )));
        }
        Ok(())
    }
}

/// RRF constant plus the weight table indexed by query class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionPolicy {
    pub rrf_k: f64,
    pub conceptual: FusionWeights,
    pub technical: FusionWeights,
    pub conversational: FusionWeights,
    pub exact_match: FusionWeights,
}

impl Default for FusionPolicy {
    fn default() -> Self {
        Self {
            rrf_k: 60.0,
            conceptual: FusionWeights::new(0.7, 0.3),
            technical: FusionWeights::new(0.4, 0.6),
            conversational: FusionWeights::new(0.6, 0.4),
            exact_match: FusionWeights::new(0.2, 0.8),
        }
    }
}

impl FusionPolicy {
    pub fn validate(&self) -> EngineResult<()> {
        if !self.rrf_k.is_finite() || self.rrf_k < 0.0 {
            return Err(EngineError::Configuration(format!(
                "rrf_k must be a non-negative number, got {}",
                self.rrf_k
            )));
        }
        for class in [
            QueryClass::Conceptual,
            QueryClass::Technical,
            QueryClass::Conversational,
            QueryClass::ExactMatch,
        ] {
            self.weights_for(class).validate(class)?;
        }
        Ok(())
    }

    pub fn weights_for(&self, class: QueryClass) -> FusionWeights {
        match class {
            QueryClass::Conceptual => self.conceptual,
            QueryClass::Technical => self.technical,
            QueryClass::Conversational => self.conversational,
            QueryClass::ExactMatch => self.exact_match,
        }
    }
}

const LOOKUP_PREFIXES: &[&str] = &[
    "find the term",
    "find term",
    "exact",
    "look up",
    "lookup",
    "search for",
];

const CODE_MARKERS: &[&str] = &["::", "()", "->", "=>", "{}", "`"];

const PRONOUNS: &[&str] = &["i", "me", "my", "we", "our", "you", "your", "i'm"];

const GREETINGS: &[&str] = &["hi", "hello", "hey", "thanks", "please"];

/// Classify a query. Pure and deterministic.
pub fn classify_query(query: &str) -> QueryClass {
    let trimmed = query.trim();
    let lower = trimmed.to_lowercase();

    if has_quoted_phrase(trimmed)
        || LOOKUP_PREFIXES.iter().any(|p| starts_with_words(&lower, p))
        || is_single_identifier(trimmed)
    {
        return QueryClass::ExactMatch;
    }

    if CODE_MARKERS.iter().any(|m| trimmed.contains(m))
        || trimmed.split_whitespace().any(is_code_token)
    {
        return QueryClass::Technical;
    }

    let words: Vec<&str> = lower
        .split(|c: char| !c.is_alphanumeric() && c != '\'')
        .filter(|w| !w.is_empty())
        .collect();
    if words
        .iter()
        .any(|w| PRONOUNS.contains(w) || GREETINGS.contains(w))
    {
        return QueryClass::Conversational;
    }

    QueryClass::Conceptual
}

/// `text` begins with the whole words of `prefix`.
fn starts_with_words(text: &str, prefix: &str) -> bool {
    text.strip_prefix(prefix).is_some_and(|rest| {
        !rest.starts_with(|c: char| c.is_alphanumeric() || c == '\'' || c == '_')
    })
}

fn has_quoted_phrase(query: &str) -> bool {
    let mut parts = query.split('"');
    parts.next();
    match (parts.next(), parts.next()) {
        (Some(inner), Some(_)) => !inner.trim().is_empty(),
        _ => false,
    }
}

/// A lone token like `ERR-4021`, `INV_2023_11` or `RFC7231`.
fn is_single_identifier(query: &str) -> bool {
    let mut tokens = query.split_whitespace();
    let (Some(token), None) = (tokens.next(), tokens.next()) else {
        return false;
    };
    let token = token.trim_end_matches(['?', '.', '!']);
    let has_digit = token.chars().any(|c| c.is_ascii_digit());
    let has_alpha = token.chars().any(|c| c.is_alphabetic());
    let all_upper = token
        .chars()
        .filter(|c| c.is_alphabetic())
        .all(|c| c.is_uppercase());
    token.len() >= 3
        && token
            .chars()
            .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
        && ((has_digit && has_alpha) || (all_upper && has_alpha && token.len() >= 4))
}

fn is_code_token(word: &str) -> bool {
    let word = word.trim_matches(|c: char| !c.is_alphanumeric() && c != '_');
    if word.is_empty() {
        return false;
    }
    let snake = word.contains('_') && word.chars().any(|c| c.is_alphabetic());
    let camel = word
        .chars()
        .zip(word.chars().skip(1))
        .any(|(a, b)| a.is_lowercase() && b.is_uppercase());
    let mixed = word.chars().any(|c| c.is_ascii_digit())
        && word.chars().any(|c| c.is_alphabetic());
    snake || camel || mixed
}
