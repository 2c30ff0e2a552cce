//! Routing keys and topic-exchange binding patterns.
//!
//! Routing keys are dot-separated `<resource>.<verb>` strings such as
//! `content.created`. Subscribers bind with either an exact key or a pattern
//! using the broker-native wildcards:
//!
//! - `*` matches exactly one word
//! - `#` matches zero or more words
//!
//! ```
//! use ripple_core::topic::TopicPattern;
//!
//! let pattern = TopicPattern::parse("content.*").unwrap();
//! assert!(pattern.matches("content.created"));
//! assert!(!pattern.matches("media.uploaded"));
//! ```

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Routing key for newly committed content.
pub const CONTENT_CREATED: &str = "content.created";

/// Routing key for deleted content.
pub const CONTENT_DELETED: &str = "content.deleted";

/// Errors raised while parsing routing keys or binding patterns.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TopicError {
    /// The key or pattern was empty.
    #[error("Topic must not be empty")]
    Empty,

    /// A word between two dots was empty (e.g. `content..created`).
    #[error("Topic '{0}' contains an empty word")]
    EmptyWord(String),

    /// A routing key contained a wildcard; wildcards are only valid in patterns.
    #[error("Routing key '{0}' must not contain wildcards")]
    WildcardInRoutingKey(String),

    /// A word mixed a wildcard with literal characters (e.g. `cont*`).
    #[error("Topic '{0}' has a malformed wildcard word")]
    MalformedWildcard(String),
}

/// Validate a concrete routing key (no wildcards, no empty words).
///
/// # Errors
///
/// Returns [`TopicError`] describing the first violation found.
pub fn validate_routing_key(key: &str) -> Result<(), TopicError> {
    if key.is_empty() {
        return Err(TopicError::Empty);
    }
    for word in key.split('.') {
        if word.is_empty() {
            return Err(TopicError::EmptyWord(key.to_string()));
        }
        if word.contains('*') || word.contains('#') {
            return Err(TopicError::WildcardInRoutingKey(key.to_string()));
        }
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Segment {
    Literal(String),
    Star,
    Hash,
}

/// A parsed binding pattern with topic-exchange semantics.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicPattern {
    raw: String,
    segments: Vec<Segment>,
}

impl TopicPattern {
    /// Parse a binding pattern.
    ///
    /// # Errors
    ///
    /// Returns [`TopicError`] if the pattern is empty, has empty words, or
    /// mixes wildcards with literal characters inside one word.
    pub fn parse(pattern: &str) -> Result<Self, TopicError> {
        if pattern.is_empty() {
            return Err(TopicError::Empty);
        }

        let segments = pattern
            .split('.')
            .map(|word| match word {
                "" => Err(TopicError::EmptyWord(pattern.to_string())),
                "*" => Ok(Segment::Star),
                "#" => Ok(Segment::Hash),
                w if w.contains('*') || w.contains('#') => {
                    Err(TopicError::MalformedWildcard(pattern.to_string()))
                }
                w => Ok(Segment::Literal(w.to_string())),
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            raw: pattern.to_string(),
            segments,
        })
    }

    /// The pattern as written.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// True if the pattern has no wildcards (binds one routing key only).
    #[must_use]
    pub fn is_exact(&self) -> bool {
        self.segments
            .iter()
            .all(|segment| matches!(segment, Segment::Literal(_)))
    }

    /// Check whether a routing key is delivered to a queue bound with this pattern.
    #[must_use]
    pub fn matches(&self, routing_key: &str) -> bool {
        if routing_key.is_empty() {
            return false;
        }
        let words: Vec<&str> = routing_key.split('.').collect();
        matches_segments(&self.segments, &words)
    }
}

fn matches_segments(pattern: &[Segment], words: &[&str]) -> bool {
    match pattern.split_first() {
        None => words.is_empty(),
        Some((Segment::Hash, rest)) => {
            (0..=words.len()).any(|skip| matches_segments(rest, &words[skip..]))
        }
        Some((Segment::Star, rest)) => {
            !words.is_empty() && matches_segments(rest, &words[1..])
        }
        Some((Segment::Literal(literal), rest)) => match words.split_first() {
            Some((word, tail)) => *word == literal.as_str() && matches_segments(rest, tail),
            None => false,
        },
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for TopicPattern {
    type Err = TopicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn exact_pattern_matches_only_itself() {
        let pattern = TopicPattern::parse(CONTENT_CREATED).unwrap();
        assert!(pattern.is_exact());
        assert!(pattern.matches("content.created"));
        assert!(!pattern.matches("content.deleted"));
        assert!(!pattern.matches("content.created.v2"));
    }

    #[test]
    fn star_matches_exactly_one_word() {
        let pattern = TopicPattern::parse("content.*").unwrap();
        assert!(!pattern.is_exact());
        assert!(pattern.matches("content.created"));
        assert!(pattern.matches("content.deleted"));
        assert!(!pattern.matches("content"));
        assert!(!pattern.matches("content.created.late"));
    }

    #[test]
    fn hash_matches_zero_or_more_words() {
        let pattern = TopicPattern::parse("content.#").unwrap();
        assert!(pattern.matches("content"));
        assert!(pattern.matches("content.created"));
        assert!(pattern.matches("content.created.late"));
        assert!(!pattern.matches("media.deleted"));

        let everything = TopicPattern::parse("#").unwrap();
        assert!(everything.matches("media.uploaded"));
    }

    #[test]
    fn hash_in_the_middle_backtracks() {
        let pattern = TopicPattern::parse("content.#.deleted").unwrap();
        assert!(pattern.matches("content.deleted"));
        assert!(pattern.matches("content.archive.deleted"));
        assert!(!pattern.matches("content.created"));
    }

    #[test]
    fn rejects_malformed_patterns() {
        assert_eq!(TopicPattern::parse(""), Err(TopicError::Empty));
        assert!(matches!(
            TopicPattern::parse("content..created"),
            Err(TopicError::EmptyWord(_))
        ));
        assert!(matches!(
            TopicPattern::parse("content.creat*"),
            Err(TopicError::MalformedWildcard(_))
        ));
    }

    #[test]
    fn routing_keys_reject_wildcards() {
        assert!(validate_routing_key(CONTENT_DELETED).is_ok());
        assert!(matches!(
            validate_routing_key("content.*"),
            Err(TopicError::WildcardInRoutingKey(_))
        ));
        assert!(matches!(
            validate_routing_key("content."),
            Err(TopicError::EmptyWord(_))
        ));
    }

    proptest! {
        #[test]
        fn every_routing_key_matches_itself_and_hash(words in proptest::collection::vec("[a-z]{1,8}", 1..5)) {
            let key = words.join(".");
            let exact = TopicPattern::parse(&key).unwrap();
            prop_assert!(exact.matches(&key));
            prop_assert!(TopicPattern::parse("#").unwrap().matches(&key));
        }

        #[test]
        fn star_per_word_matches_same_arity(words in proptest::collection::vec("[a-z]{1,8}", 1..5)) {
            let key = words.join(".");
            let stars = vec!["*"; words.len()].join(".");
            let longer = format!("{stars}.*");
            prop_assert!(TopicPattern::parse(&stars).unwrap().matches(&key));
            prop_assert!(!TopicPattern::parse(&longer).unwrap().matches(&key));
        }
    }
}
