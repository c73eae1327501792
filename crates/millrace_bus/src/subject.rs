//! Subject and pattern grammar.
//!
//! A subject is one or more non-empty dot-separated tokens of printable
//! ASCII without spaces or wildcards. A pattern is a subject that may use
//! `*` (exactly one token) or a final `>` (one or more trailing tokens).

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SubjectError {
    #[error("subject cannot be empty")]
    Empty,
    #[error("empty token in subject: '{0}'")]
    EmptyToken(String),
    #[error("invalid character in subject token: '{0}'")]
    InvalidToken(String),
    #[error("wildcard not allowed in publish subject: '{0}'")]
    WildcardInSubject(String),
    #[error("'>' must be the final token: '{0}'")]
    MisplacedGt(String),
}

fn token_is_literal(token: &str) -> bool {
    !token.is_empty()
        && token
            .chars()
            .all(|c| c.is_ascii_graphic() && c != '.' && c != '*' && c != '>')
}

/// Validate a concrete publish subject (no wildcards).
pub fn validate_subject(subject: &str) -> Result<(), SubjectError> {
    if subject.is_empty() {
        return Err(SubjectError::Empty);
    }
    for token in subject.split('.') {
        if token.is_empty() {
            return Err(SubjectError::EmptyToken(subject.to_string()));
        }
        if token == "*" || token == ">" {
            return Err(SubjectError::WildcardInSubject(subject.to_string()));
        }
        if !token_is_literal(token) {
            return Err(SubjectError::InvalidToken(subject.to_string()));
        }
    }
    Ok(())
}

/// Validate a subscription pattern.
pub fn validate_pattern(pattern: &str) -> Result<(), SubjectError> {
    Pattern::parse(pattern).map(|_| ())
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Literal(String),
    Star,
    Gt,
}

/// Parsed subscription pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    tokens: Vec<Token>,
}

impl Pattern {
    pub fn parse(pattern: &str) -> Result<Self, SubjectError> {
        if pattern.is_empty() {
            return Err(SubjectError::Empty);
        }
        let raw: Vec<&str> = pattern.split('.').collect();
        let mut tokens = Vec::with_capacity(raw.len());
        for (i, token) in raw.iter().enumerate() {
            match *token {
                "" => return Err(SubjectError::EmptyToken(pattern.to_string())),
                "*" => tokens.push(Token::Star),
                ">" => {
                    if i != raw.len() - 1 {
                        return Err(SubjectError::MisplacedGt(pattern.to_string()));
                    }
                    tokens.push(Token::Gt);
                }
                literal => {
                    if !token_is_literal(literal) {
                        return Err(SubjectError::InvalidToken(pattern.to_string()));
                    }
                    tokens.push(Token::Literal(literal.to_string()));
                }
            }
        }
        Ok(Self { tokens })
    }

    /// Whether a concrete subject matches this pattern.
    pub fn matches(&self, subject: &str) -> bool {
        let subject_tokens: Vec<&str> = subject.split('.').collect();
        let mut si = 0;
        for (pi, token) in self.tokens.iter().enumerate() {
            match token {
                Token::Gt => {
                    // Must consume at least one remaining token
                    return si < subject_tokens.len() && pi == self.tokens.len() - 1;
                }
                Token::Star => {
                    if si >= subject_tokens.len() {
                        return false;
                    }
                    si += 1;
                }
                Token::Literal(lit) => {
                    if si >= subject_tokens.len() || subject_tokens[si] != lit.as_str() {
                        return false;
                    }
                    si += 1;
                }
            }
        }
        si == subject_tokens.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matches(pattern: &str, subject: &str) -> bool {
        Pattern::parse(pattern).unwrap().matches(subject)
    }

    #[test]
    fn literal_patterns_match_exactly() {
        assert!(matches("snapshot.finalize.3", "snapshot.finalize.3"));
        assert!(!matches("snapshot.finalize.3", "snapshot.finalize.4"));
        assert!(!matches("snapshot.finalize", "snapshot.finalize.3"));
    }

    #[test]
    fn star_matches_exactly_one_token() {
        assert!(matches("snapshot.batch.TRN.*", "snapshot.batch.TRN.mops"));
        assert!(!matches("snapshot.batch.TRN.*", "snapshot.batch.TRN"));
        assert!(!matches("snapshot.batch.*", "snapshot.batch.TRN.mops"));
        assert!(matches("*.*.*", "a.b.c"));
    }

    #[test]
    fn gt_matches_one_or_more_trailing() {
        assert!(matches("snapshot.>", "snapshot.batch.TRN.mops"));
        assert!(matches("snapshot.>", "snapshot.refresh"));
        assert!(!matches("snapshot.>", "snapshot"));
        assert!(!matches("analysis.>", "snapshot.refresh.TRN"));
    }

    #[test]
    fn invalid_patterns_rejected() {
        assert!(Pattern::parse("").is_err());
        assert!(Pattern::parse("a..b").is_err());
        assert!(Pattern::parse("a.>.b").is_err());
        assert!(Pattern::parse("a b.c").is_err());
    }

    #[test]
    fn publish_subject_validation() {
        assert!(validate_subject("snapshot.refresh.TRN").is_ok());
        assert!(validate_subject("snapshot.*").is_err());
        assert!(validate_subject("snapshot.>").is_err());
        assert!(validate_subject("").is_err());
    }
}
