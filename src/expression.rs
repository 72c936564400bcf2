//! Global regular expressions
//!
//! The server ships named expression sets with the active check list.
//! Plugins refer to them as `@name`; a value matches a named set when it
//! satisfies every entry of that set.

use std::collections::HashMap;

use regex::{Regex, RegexBuilder};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExpressionError {
    #[error("unknown expression type {0}")]
    UnknownType(i64),

    #[error("invalid delimiter \"{0}\": must be a single character")]
    InvalidDelimiter(String),

    #[error("invalid regular expression \"{pattern}\": {source}")]
    InvalidRegex {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("global regular expression \"{0}\" does not exist")]
    UnknownName(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpressionType {
    /// Substring is present
    Included,
    /// Any of the delimited substrings is present
    AnyIncluded,
    /// Substring is absent
    NotIncluded,
    /// Regular expression matches
    True,
    /// Regular expression does not match
    False,
}

impl TryFrom<i64> for ExpressionType {
    type Error = ExpressionError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ExpressionType::Included),
            1 => Ok(ExpressionType::AnyIncluded),
            2 => Ok(ExpressionType::NotIncluded),
            3 => Ok(ExpressionType::True),
            4 => Ok(ExpressionType::False),
            other => Err(ExpressionError::UnknownType(other)),
        }
    }
}

/// One entry as received from the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpressionEntry {
    pub name: String,
    pub expression: String,
    pub expression_type: i64,
    pub delimiter: String,
    pub case_sensitive: bool,
}

#[derive(Debug, Clone)]
enum Matcher {
    Substrings {
        needles: Vec<String>,
        case_sensitive: bool,
        negate: bool,
    },
    Regex {
        regex: Regex,
        negate: bool,
    },
}

impl Matcher {
    fn compile(entry: &ExpressionEntry) -> Result<Self, ExpressionError> {
        let kind = ExpressionType::try_from(entry.expression_type)?;

        let lowered = |s: &str| {
            if entry.case_sensitive {
                s.to_string()
            } else {
                s.to_lowercase()
            }
        };

        Ok(match kind {
            ExpressionType::Included | ExpressionType::NotIncluded => Matcher::Substrings {
                needles: vec![lowered(&entry.expression)],
                case_sensitive: entry.case_sensitive,
                negate: kind == ExpressionType::NotIncluded,
            },
            ExpressionType::AnyIncluded => {
                let mut chars = entry.delimiter.chars();
                let delimiter = match (chars.next(), chars.next()) {
                    (None, _) => ',',
                    (Some(c), None) => c,
                    _ => return Err(ExpressionError::InvalidDelimiter(entry.delimiter.clone())),
                };
                Matcher::Substrings {
                    needles: entry.expression.split(delimiter).map(lowered).collect(),
                    case_sensitive: entry.case_sensitive,
                    negate: false,
                }
            }
            ExpressionType::True | ExpressionType::False => Matcher::Regex {
                regex: compile_regex(&entry.expression, entry.case_sensitive)?,
                negate: kind == ExpressionType::False,
            },
        })
    }

    fn is_match(&self, value: &str) -> bool {
        match self {
            Matcher::Substrings {
                needles,
                case_sensitive,
                negate,
            } => {
                let haystack = if *case_sensitive {
                    value.to_string()
                } else {
                    value.to_lowercase()
                };
                needles.iter().any(|n| haystack.contains(n.as_str())) != *negate
            }
            Matcher::Regex { regex, negate } => regex.is_match(value) != *negate,
        }
    }
}

fn compile_regex(pattern: &str, case_sensitive: bool) -> Result<Regex, ExpressionError> {
    RegexBuilder::new(pattern)
        .case_insensitive(!case_sensitive)
        .build()
        .map_err(|source| ExpressionError::InvalidRegex {
            pattern: pattern.to_string(),
            source,
        })
}

/// Compiled global expressions keyed by name
#[derive(Debug, Clone, Default)]
pub struct Expressions {
    sets: HashMap<String, Vec<Matcher>>,
}

impl Expressions {
    pub fn compile(entries: &[ExpressionEntry]) -> Result<Self, ExpressionError> {
        let mut sets: HashMap<String, Vec<Matcher>> = HashMap::new();
        for entry in entries {
            sets.entry(entry.name.clone())
                .or_default()
                .push(Matcher::compile(entry)?);
        }
        Ok(Self { sets })
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    /// Match `value` against `@name` or a literal regular expression
    pub fn matches(&self, pattern: &str, value: &str) -> Result<bool, ExpressionError> {
        match pattern.strip_prefix('@') {
            Some(name) => {
                let set = self
                    .sets
                    .get(name)
                    .ok_or_else(|| ExpressionError::UnknownName(name.to_string()))?;
                Ok(set.iter().all(|m| m.is_match(value)))
            }
            None => Ok(compile_regex(pattern, true)?.is_match(value)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn entry(name: &str, expression: &str, kind: i64, case_sensitive: bool) -> ExpressionEntry {
        ExpressionEntry {
            name: name.into(),
            expression: expression.into(),
            expression_type: kind,
            delimiter: ",".into(),
            case_sensitive,
        }
    }

    #[test]
    fn test_expression_types() {
        let expressions = Expressions::compile(&[
            entry("included", "error", 0, true),
            entry("any", "warn,crit", 1, false),
            entry("excluded", "debug", 2, true),
            entry("regex", "^ERR-[0-9]+$", 3, true),
            entry("not_regex", "^#", 4, true),
        ])
        .unwrap();

        assert!(expressions.matches("@included", "an error occurred").unwrap());
        assert!(!expressions.matches("@included", "an ERROR occurred").unwrap());
        assert!(expressions.matches("@any", "CRITICAL").unwrap());
        assert!(!expressions.matches("@any", "info").unwrap());
        assert!(expressions.matches("@excluded", "info").unwrap());
        assert!(!expressions.matches("@excluded", "debug line").unwrap());
        assert!(expressions.matches("@regex", "ERR-42").unwrap());
        assert!(expressions.matches("@not_regex", "value").unwrap());
        assert!(!expressions.matches("@not_regex", "# comment").unwrap());
    }

    #[test]
    fn test_all_entries_of_a_set_must_match() {
        let expressions = Expressions::compile(&[
            entry("fs", "^/", 3, true),
            entry("fs", "^/proc", 4, true),
        ])
        .unwrap();
        assert!(expressions.matches("@fs", "/home").unwrap());
        assert!(!expressions.matches("@fs", "/proc").unwrap());
    }

    #[test]
    fn test_plain_pattern_and_unknown_name() {
        let expressions = Expressions::default();
        assert!(expressions.matches("^sshd$", "sshd").unwrap());
        assert_matches!(
            expressions.matches("@missing", "x"),
            Err(ExpressionError::UnknownName(_))
        );
    }

    #[test]
    fn test_invalid_entries() {
        assert_matches!(
            Expressions::compile(&[entry("x", "a", 9, true)]),
            Err(ExpressionError::UnknownType(9))
        );
        assert_matches!(
            Expressions::compile(&[entry("x", "(", 3, true)]),
            Err(ExpressionError::InvalidRegex { .. })
        );
        let mut bad = entry("x", "a", 1, true);
        bad.delimiter = ";;".into();
        assert_matches!(
            Expressions::compile(&[bad]),
            Err(ExpressionError::InvalidDelimiter(_))
        );
    }
}
