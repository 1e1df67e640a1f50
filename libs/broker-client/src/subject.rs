//! Subject and subject-pattern handling.
//!
//! Subjects are `.`-delimited token strings such as `updates` or
//! `orders.eu.created`. Patterns may additionally use `*` to match exactly one
//! token and a trailing `>` to match one or more remaining tokens.

use std::fmt;

use thiserror::Error;

/// Token delimiter for subjects and patterns.
pub const DELIMITER: char = '.';
/// Wildcard matching exactly one token.
pub const SINGLE_WILDCARD: &str = "*";
/// Wildcard matching one or more trailing tokens.
pub const TAIL_WILDCARD: &str = ">";

/// Reasons a subject or pattern is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubjectError {
    #[error("subject is empty")]
    Empty,

    #[error("subject '{subject}' contains an empty token")]
    EmptyToken { subject: String },

    #[error("subject '{subject}' contains whitespace")]
    Whitespace { subject: String },

    /// Publish subjects must be concrete.
    #[error("subject '{subject}' contains a wildcard; only patterns may use '*' or '>'")]
    WildcardInSubject { subject: String },

    /// `>` is only legal as the whole last token.
    #[error("pattern '{pattern}' uses '>' before its last token")]
    TailWildcardNotLast { pattern: String },

    /// Wildcards must be whole tokens, `a.b*` is not a pattern.
    #[error("pattern '{pattern}' has a wildcard inside token '{token}'")]
    PartialWildcard { pattern: String, token: String },
}

/// A single parsed pattern token.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Token {
    Literal(String),
    Single,
    Tail,
}

fn check_common(raw: &str) -> Result<(), SubjectError> {
    if raw.is_empty() {
        return Err(SubjectError::Empty);
    }
    if raw.chars().any(char::is_whitespace) {
        return Err(SubjectError::Whitespace {
            subject: raw.to_owned(),
        });
    }
    if raw.split(DELIMITER).any(str::is_empty) {
        return Err(SubjectError::EmptyToken {
            subject: raw.to_owned(),
        });
    }
    Ok(())
}

/// Validate a concrete subject used as a publish target or reply subject.
pub fn validate_subject(subject: &str) -> Result<(), SubjectError> {
    check_common(subject)?;
    if subject
        .split(DELIMITER)
        .any(|token| token.contains('*') || token.contains('>'))
    {
        return Err(SubjectError::WildcardInSubject {
            subject: subject.to_owned(),
        });
    }
    Ok(())
}

/// A validated subscription pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubjectPattern {
    raw: String,
    tokens: Vec<Token>,
}

impl SubjectPattern {
    /// Parse and validate a pattern.
    pub fn parse(pattern: &str) -> Result<Self, SubjectError> {
        check_common(pattern)?;

        let parts: Vec<&str> = pattern.split(DELIMITER).collect();
        let last = parts.len() - 1;
        let mut tokens = Vec::with_capacity(parts.len());

        for (idx, part) in parts.into_iter().enumerate() {
            let token = match part {
                SINGLE_WILDCARD => Token::Single,
                TAIL_WILDCARD if idx == last => Token::Tail,
                TAIL_WILDCARD => {
                    return Err(SubjectError::TailWildcardNotLast {
                        pattern: pattern.to_owned(),
                    });
                }
                other if other.contains('*') || other.contains('>') => {
                    return Err(SubjectError::PartialWildcard {
                        pattern: pattern.to_owned(),
                        token: other.to_owned(),
                    });
                }
                other => Token::Literal(other.to_owned()),
            };
            tokens.push(token);
        }

        Ok(Self {
            raw: pattern.to_owned(),
            tokens,
        })
    }

    /// The pattern as it was written.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// True when the pattern contains `*` or `>`.
    pub fn is_wildcard(&self) -> bool {
        self.tokens.iter().any(|t| !matches!(t, Token::Literal(_)))
    }

    /// Match a concrete subject against this pattern.
    ///
    /// `*` consumes exactly one token, `>` consumes one or more trailing
    /// tokens. Subjects with empty tokens never match.
    pub fn matches(&self, subject: &str) -> bool {
        let mut subject_tokens = subject.split(DELIMITER);

        for token in &self.tokens {
            match token {
                Token::Tail => {
                    // at least one token must remain
                    return subject_tokens.next().is_some_and(|t| !t.is_empty());
                }
                Token::Single => match subject_tokens.next() {
                    Some(t) if !t.is_empty() => {}
                    _ => return false,
                },
                Token::Literal(lit) => match subject_tokens.next() {
                    Some(t) if t == lit => {}
                    _ => return false,
                },
            }
        }

        subject_tokens.next().is_none()
    }
}

impl fmt::Display for SubjectPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl std::str::FromStr for SubjectPattern {
    type Err = SubjectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
