//! Key access rules
//!
//! An ordered list of allow/deny rules decides whether a requested item key
//! may be evaluated. Rules are matched in declaration order, the first match
//! wins, and a request that matches nothing is allowed.
//!
//! ## Load-time normalisation
//!
//! - duplicate or conflicting rules for the same pattern are dropped with a warning
//! - everything after the first match-all rule (`*`) is unreachable and dropped
//! - trailing allow rules are redundant (allow is the default) and dropped,
//!   except for `system.run` which carries an implicit deny
//! - `system.run[*]` deny is appended unless already covered
//!
//! The active rule set is replaced atomically on reload, so concurrent readers
//! always see either the old or the new set in full.

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::key::{ItemKey, KeyError};

/// Pattern of the deny rule appended to every non-empty rule set
pub const SYSTEM_RUN_PATTERN: &str = "system.run[*]";

const SYSTEM_RUN_KEY: &str = "system.run";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    Allow,
    Deny,
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Permission::Allow => write!(f, "AllowKey"),
            Permission::Deny => write!(f, "DenyKey"),
        }
    }
}

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("invalid {permission} pattern \"{pattern}\" at line {line}: {source}")]
    InvalidPattern {
        permission: Permission,
        pattern: String,
        line: usize,
        #[source]
        source: KeyError,
    },

    #[error(
        "item key access rules are configured to match all keys, \
         indicating a possible configuration problem; remove the rules if that was the purpose"
    )]
    MatchesEverything,
}

/// One configured rule pattern and the line it was declared on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleSource {
    pub line: usize,
    pub pattern: String,
}

impl RuleSource {
    pub fn new(line: usize, pattern: impl Into<String>) -> Self {
        Self {
            line,
            pattern: pattern.into(),
        }
    }
}

/// A parsed, wildcard-minimised rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub permission: Permission,
    pub pattern: String,
    pub key: String,
    pub params: Vec<String>,
    /// Rule was written as `key[]`
    pub empty_arguments: bool,
    /// Declaration line, `None` for the implicit `system.run[*]` rule
    pub line: Option<usize>,
}

impl Rule {
    fn parse(permission: Permission, source: &RuleSource) -> Result<Self, RuleError> {
        let parsed =
            ItemKey::parse_pattern(&source.pattern).map_err(|e| RuleError::InvalidPattern {
                permission,
                pattern: source.pattern.clone(),
                line: source.line,
                source: e,
            })?;

        let empty_arguments = parsed.bracketed && parsed.has_empty_arguments();
        let mut params: Vec<String> = if empty_arguments {
            Vec::new()
        } else {
            parsed.params.iter().map(|p| minimize_wildcards(p)).collect()
        };

        // collapse repeated trailing "*" parameters into one
        while params.len() > 1
            && params[params.len() - 1] == "*"
            && params[params.len() - 2] == "*"
        {
            params.pop();
        }

        Ok(Self {
            permission,
            pattern: source.pattern.clone(),
            key: minimize_wildcards(&parsed.name),
            params,
            empty_arguments,
            line: Some(source.line),
        })
    }

    fn same_signature(&self, other: &Rule) -> bool {
        self.key == other.key
            && self.params == other.params
            && self.empty_arguments == other.empty_arguments
    }

    /// `*` with no parameter list
    pub fn is_match_all(&self) -> bool {
        self.key == "*" && self.params.is_empty() && !self.empty_arguments
    }

    /// Whether this rule applies to the request
    pub fn matches(&self, key: &str, params: &[String]) -> bool {
        if self.is_match_all() {
            return true;
        }

        if !wildcard_match(key, &self.key) {
            return false;
        }

        let empty_request = params.len() == 1 && params[0].is_empty();

        if self.empty_arguments {
            return empty_request;
        }

        if self.params.is_empty() {
            return params.is_empty() || empty_request;
        }

        if self.params.last().is_some_and(|p| p == "*") {
            let fixed = &self.params[..self.params.len() - 1];
            return params.len() >= fixed.len()
                && fixed
                    .iter()
                    .zip(params)
                    .all(|(pattern, value)| wildcard_match(value, pattern));
        }

        params.len() == self.params.len()
            && self
                .params
                .iter()
                .zip(params)
                .all(|(pattern, value)| wildcard_match(value, pattern))
    }
}

/// Immutable, normalised rule list
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    /// Build a rule set from allow and deny patterns
    ///
    /// The two lists are merged and evaluated in declaration-line order.
    pub fn load(allow: &[RuleSource], deny: &[RuleSource]) -> Result<Self, RuleError> {
        let mut sources: Vec<(Permission, &RuleSource)> = allow
            .iter()
            .map(|s| (Permission::Allow, s))
            .chain(deny.iter().map(|s| (Permission::Deny, s)))
            .collect();
        sources.sort_by_key(|(_, source)| source.line);

        let mut rules: Vec<Rule> = Vec::with_capacity(sources.len() + 1);
        for (permission, source) in sources {
            let rule = Rule::parse(permission, source)?;

            if let Some(existing) = rules.iter().find(|r| r.same_signature(&rule)) {
                warn!(
                    "{} access rule \"{}\" was not added because it {} another rule defined above",
                    permission,
                    rule.pattern,
                    if existing.permission == permission {
                        "duplicates"
                    } else {
                        "conflicts with"
                    }
                );
                continue;
            }

            rules.push(rule);
        }

        let system_run = Rule::parse(Permission::Deny, &RuleSource::new(0, SYSTEM_RUN_PATTERN))?;
        let system_run = Rule {
            line: None,
            ..system_run
        };

        let mut system_run_index = rules.iter().position(|r| r.same_signature(&system_run));
        let mut configured = rules.len();
        if system_run_index.is_some() {
            configured -= 1;
        }

        if configured != 0 {
            if let Some(match_all) = rules.iter().position(Rule::is_match_all) {
                system_run_index = Some(system_run_index.map_or(match_all, |i| i.min(match_all)));

                for unreachable in rules.drain(match_all + 1..) {
                    warn!(
                        "removed unreachable {} \"{}\" rule",
                        unreachable.permission, unreachable.pattern
                    );
                }
            }

            // system.run allows stay: the implicit system.run[*] deny still follows them
            let mut index = rules.len();
            while index > 0 {
                index -= 1;
                let rule = &rules[index];
                if rule.permission != Permission::Allow {
                    break;
                }
                if rule.key == SYSTEM_RUN_KEY {
                    continue;
                }
                warn!("removed redundant trailing AllowKey \"{}\" rule", rule.pattern);
                rules.remove(index);
            }

            if rules.is_empty() {
                return Err(RuleError::MatchesEverything);
            }
        }

        if system_run_index.is_none() {
            rules.push(system_run);
        }

        debug!("loaded {} key access rules", rules.len());

        Ok(Self { rules })
    }

    /// First matching rule decides; no match means allow
    pub fn check(&self, key: &str, params: &[String]) -> bool {
        self.rules
            .iter()
            .find(|rule| rule.matches(key, params))
            .is_none_or(|rule| rule.permission == Permission::Allow)
    }

    /// Check a full key string; keys that cannot be parsed are denied
    pub fn check_key(&self, text: &str) -> bool {
        match ItemKey::parse(text) {
            Ok(key) => self.check(&key.name, &key.params),
            Err(_) => false,
        }
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Shared access gate with atomic reload
#[derive(Debug, Default)]
pub struct AccessGate {
    current: RwLock<Arc<RuleSet>>,
}

impl AccessGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a new rule set and swap it in; on error the previous set stays active
    pub fn load_rules(&self, allow: &[RuleSource], deny: &[RuleSource]) -> Result<(), RuleError> {
        let rules = Arc::new(RuleSet::load(allow, deny)?);
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = rules;
        Ok(())
    }

    pub fn check_rules(&self, key: &str, params: &[String]) -> bool {
        self.snapshot().check(key, params)
    }

    pub fn check_key(&self, text: &str) -> bool {
        self.snapshot().check_key(text)
    }

    /// The rule set currently in effect
    pub fn snapshot(&self) -> Arc<RuleSet> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Collapse runs of `*` into a single `*`
pub fn minimize_wildcards(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len());
    let mut previous_star = false;
    for c in pattern.chars() {
        if c == '*' {
            if previous_star {
                continue;
            }
            previous_star = true;
        } else {
            previous_star = false;
        }
        out.push(c);
    }
    out
}

/// Match `value` against a pattern where `*` matches any run of characters
pub fn wildcard_match(value: &str, pattern: &str) -> bool {
    let value: Vec<char> = value.chars().collect();
    let pattern: Vec<char> = pattern.chars().collect();

    let (mut v, mut p) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while v < value.len() {
        if p < pattern.len() && pattern[p] == '*' {
            backtrack = Some((p, v));
            p += 1;
        } else if p < pattern.len() && pattern[p] == value[v] {
            p += 1;
            v += 1;
        } else if let Some((star, matched)) = backtrack {
            p = star + 1;
            v = matched + 1;
            backtrack = Some((star, matched + 1));
        } else {
            return false;
        }
    }

    pattern[p..].iter().all(|&c| c == '*')
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn sources(patterns: &[(usize, &str)]) -> Vec<RuleSource> {
        patterns
            .iter()
            .map(|(line, pattern)| RuleSource::new(*line, *pattern))
            .collect()
    }

    fn request(text: &str) -> (String, Vec<String>) {
        let key = ItemKey::parse(text).unwrap();
        (key.name, key.params)
    }

    fn allowed(set: &RuleSet, text: &str) -> bool {
        let (key, params) = request(text);
        set.check(&key, &params)
    }

    #[test]
    fn test_wildcard_match() {
        assert!(wildcard_match("/var/log/app.log", "/var/log/*"));
        assert!(wildcard_match("vfs.file.size", "vfs.*.size"));
        assert!(wildcard_match("", "*"));
        assert!(wildcard_match("abc", "a*b*c"));
        assert!(!wildcard_match("abc", "a*d"));
        assert!(!wildcard_match("/etc/passwd ", "/etc/passwd"));
    }

    #[test]
    fn test_minimize_wildcards() {
        assert_eq!(minimize_wildcards("a***b**"), "a*b*");
        assert_eq!(minimize_wildcards("plain"), "plain");
    }

    #[test]
    fn test_empty_configuration_has_only_implicit_system_run() {
        let set = RuleSet::load(&[], &[]).unwrap();
        assert_eq!(set.len(), 1);
        assert_eq!(set.rules()[0].pattern, SYSTEM_RUN_PATTERN);
        assert_eq!(set.rules()[0].line, None);
        assert!(!allowed(&set, "system.run[id]"));
        assert!(allowed(&set, "agent.ping"));
    }

    #[test]
    fn test_file_contents_deny_with_trailing_wildcard() {
        let deny = sources(&[(1, "vfs.file.contents[/etc/passwd,*]")]);
        let set = RuleSet::load(&[], &deny).unwrap();

        assert!(!allowed(&set, "vfs.file.contents[/etc/passwd]"));
        assert!(!allowed(&set, "vfs.file.contents[/etc/passwd,]"));
        assert!(!allowed(&set, "vfs.file.contents[/etc/passwd,utf8]"));
        assert!(allowed(&set, "vfs.file.contents[/etc/passwd ]"));
        assert!(allowed(&set, "vfs.file.contents[/etc/shadow]"));
    }

    #[test]
    fn test_rule_without_parameters() {
        let deny = sources(&[(1, "agent.ping")]);
        let set = RuleSet::load(&[], &deny).unwrap();

        assert!(!allowed(&set, "agent.ping"));
        assert!(!allowed(&set, "agent.ping[]"));
        assert!(allowed(&set, "agent.ping[x]"));
    }

    #[test]
    fn test_empty_bracket_rule_matches_only_empty_request() {
        let deny = sources(&[(1, "agent.ping[]")]);
        let set = RuleSet::load(&[], &deny).unwrap();

        assert!(!allowed(&set, "agent.ping[]"));
        assert!(allowed(&set, "agent.ping"));
        assert!(allowed(&set, "agent.ping[x]"));
    }

    #[test]
    fn test_exact_parameter_count() {
        let deny = sources(&[(1, "net.tcp.port[*,22]")]);
        let set = RuleSet::load(&[], &deny).unwrap();

        assert!(!allowed(&set, "net.tcp.port[localhost,22]"));
        assert!(!allowed(&set, "net.tcp.port[,22]"));
        assert!(allowed(&set, "net.tcp.port[,80]"));
        assert!(allowed(&set, "net.tcp.port[a,22,x]"));
    }

    #[test]
    fn test_repeated_trailing_wildcards_collapse() {
        let deny = sources(&[(1, "key[a,*,*,*]")]);
        let set = RuleSet::load(&[], &deny).unwrap();
        assert_eq!(set.rules()[0].params, vec!["a", "*"]);
        assert!(!allowed(&set, "key[a]"));
        assert!(!allowed(&set, "key[a,b,c,d,e]"));
    }

    #[test]
    fn test_duplicates_are_dropped() {
        let allow = sources(&[(1, "vfs.file.size[*]"), (3, "vfs.file.size[*]")]);
        let deny = sources(&[(2, "vfs.*")]);
        let set = RuleSet::load(&allow, &deny).unwrap();

        // allow, deny, implicit system.run
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn test_conflicting_rule_is_not_added() {
        let allow = sources(&[(1, "vfs.file.contents[/tmp/*]")]);
        let deny = sources(&[(2, "vfs.file.contents[/tmp/*]"), (3, "vfs.*")]);
        let set = RuleSet::load(&allow, &deny).unwrap();

        assert_eq!(set.rules()[0].permission, Permission::Allow);
        assert_eq!(set.rules()[1].pattern, "vfs.*");
        assert!(allowed(&set, "vfs.file.contents[/tmp/x]"));
    }

    #[test]
    fn test_rules_after_match_all_are_dropped() {
        let allow = sources(&[(1, "agent.*")]);
        let deny = sources(&[(2, "*"), (3, "vfs.*")]);
        let set = RuleSet::load(&allow, &deny).unwrap();

        assert_eq!(set.len(), 2);
        assert!(set.rules()[1].is_match_all());
        assert!(allowed(&set, "agent.ping"));
        assert!(!allowed(&set, "vfs.file.size[/x]"));
        assert!(!allowed(&set, "system.run[ls]"));
    }

    #[test]
    fn test_trailing_allow_rules_are_pruned() {
        let allow = sources(&[(2, "vfs.file.size[*]"), (3, "system.run[echo *]")]);
        let deny = sources(&[(1, "vfs.file.contents[*]")]);
        let set = RuleSet::load(&allow, &deny).unwrap();

        let patterns: Vec<&str> = set.rules().iter().map(|r| r.pattern.as_str()).collect();
        assert_eq!(
            patterns,
            vec!["vfs.file.contents[*]", "system.run[echo *]", SYSTEM_RUN_PATTERN]
        );
        assert!(allowed(&set, "vfs.file.size[/x]"));
        assert!(allowed(&set, "system.run[echo hi]"));
        assert!(!allowed(&set, "system.run[rm -rf /]"));
    }

    #[test]
    fn test_broad_allow_before_system_run_allow_is_pruned() {
        let allow = sources(&[(2, "*[*]"), (3, "system.run[echo *]")]);
        let deny = sources(&[(1, "vfs.*")]);
        let set = RuleSet::load(&allow, &deny).unwrap();

        let patterns: Vec<&str> = set.rules().iter().map(|r| r.pattern.as_str()).collect();
        assert_eq!(patterns, vec!["vfs.*", "system.run[echo *]", SYSTEM_RUN_PATTERN]);
        assert!(!allowed(&set, "system.run[rm -rf /]"));
        assert!(allowed(&set, "system.run[echo hi]"));
        assert!(allowed(&set, "agent.ping"));
        assert!(!allowed(&set, "vfs.file.size"));
    }

    #[test]
    fn test_allow_only_configuration_is_fatal() {
        let allow = sources(&[(1, "vfs.file.contents[/var/log/*]")]);
        assert_matches!(RuleSet::load(&allow, &[]), Err(RuleError::MatchesEverything));

        let allow = sources(&[(1, "*")]);
        assert_matches!(RuleSet::load(&allow, &[]), Err(RuleError::MatchesEverything));
    }

    #[test]
    fn test_explicit_system_run_deny_is_not_duplicated() {
        let deny = sources(&[(1, SYSTEM_RUN_PATTERN)]);
        let set = RuleSet::load(&[], &deny).unwrap();
        assert_eq!(set.len(), 1);
        assert_eq!(set.rules()[0].line, Some(1));
    }

    #[test]
    fn test_invalid_pattern_reports_line() {
        let deny = sources(&[(1, "vfs.*"), (7, "vfs.file.contents[/etc/passwd")]);
        let err = RuleSet::load(&[], &deny).unwrap_err();
        assert_matches!(err, RuleError::InvalidPattern { line: 7, .. });
        assert!(err.to_string().contains("vfs.file.contents[/etc/passwd"));
    }

    #[test]
    fn test_unparsable_key_is_denied() {
        let set = RuleSet::load(&[], &[]).unwrap();
        assert!(!set.check_key("bad key["));
        assert!(set.check_key("agent.ping"));
    }

    #[test]
    fn test_gate_reload_is_atomic_and_keeps_old_set_on_error() {
        let gate = AccessGate::new();
        gate.load_rules(&[], &sources(&[(1, "agent.*")])).unwrap();
        assert!(!gate.check_key("agent.ping"));

        let broken = sources(&[(1, "agent.ping[")]);
        assert!(gate.load_rules(&[], &broken).is_err());
        assert!(!gate.check_key("agent.ping"));

        gate.load_rules(&[], &[]).unwrap();
        assert!(gate.check_key("agent.ping"));
    }
}
