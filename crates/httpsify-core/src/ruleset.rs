//! Rulesets: named bundles of rewrite rules, exclusions and cookie rules.
//!
//! ## Apply Order
//!
//! 1. Exclusions - any match vetoes the whole ruleset
//! 2. Gate pattern (`match_rule`) - if present it must match
//! 3. Rules in declared order - the first substitution that changes the URL wins
//!
//! A rule whose pattern matches but whose substitution leaves the URL
//! unchanged counts as a non-match.

use std::borrow::Cow;
use std::sync::atomic::{AtomicBool, Ordering};

use regex::{Captures, Regex};

use crate::error::{CatalogueError, Result};

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| CatalogueError::pattern(pattern, e))
}

// =============================================================================
// Replacement Templates
// =============================================================================

/// Translates a JavaScript-style replacement template into regex crate syntax.
///
/// Catalogue templates use `$1`..`$99`, `$&` and `$$`. The prefix and suffix
/// references `` $` `` and `$'` have no regex crate form; [`Rule`] splices them
/// in itself and this function leaves them literal. The regex crate reads
/// `$1foo` as a group named `1foo`, so numbered references are braced. A
/// reference to a group that does not exist stays literal, as does a `$` that
/// starts no reference.
pub fn translate_replacement(template: &str, group_count: usize) -> String {
    let chars: Vec<char> = template.chars().collect();
    let mut out = String::with_capacity(template.len() + 8);
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c != '$' {
            out.push(c);
            i += 1;
            continue;
        }

        match chars.get(i + 1) {
            Some('$') => {
                out.push_str("$$");
                i += 2;
            }
            Some('&') => {
                out.push_str("${0}");
                i += 2;
            }
            Some(d1) if d1.is_ascii_digit() => {
                let first = d1.to_digit(10).unwrap_or(0) as usize;
                let two = chars
                    .get(i + 2)
                    .and_then(|d2| d2.to_digit(10))
                    .map(|d2| first * 10 + d2 as usize);

                match two {
                    Some(n) if (1..=group_count).contains(&n) => {
                        out.push_str(&format!("${{{}}}", n));
                        i += 3;
                    }
                    _ if (1..=group_count).contains(&first) => {
                        out.push_str(&format!("${{{}}}", first));
                        i += 2;
                    }
                    _ => {
                        out.push_str("$$");
                        i += 1;
                    }
                }
            }
            _ => {
                out.push_str("$$");
                i += 1;
            }
        }
    }

    out
}

/// A stretch of a template that contains `` $` `` or `$'`.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Piece {
    /// Translated template text without prefix or suffix references.
    Template(String),
    /// The input before the match.
    Before,
    /// The input after the match.
    After,
}

/// Splits a template at its prefix and suffix references.
///
/// Returns `None` when it has neither.
fn split_context(template: &str, group_count: usize) -> Option<Vec<Piece>> {
    let bytes = template.as_bytes();
    let mut pieces = Vec::new();
    let mut start = 0;
    let mut i = 0;

    while i + 1 < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        let piece = match bytes[i + 1] {
            b'$' => {
                i += 2;
                continue;
            }
            b'`' => Piece::Before,
            b'\'' => Piece::After,
            _ => {
                i += 1;
                continue;
            }
        };
        if start < i {
            pieces.push(Piece::Template(translate_replacement(
                &template[start..i],
                group_count,
            )));
        }
        pieces.push(piece);
        i += 2;
        start = i;
    }

    if pieces.is_empty() {
        return None;
    }
    if start < template.len() {
        pieces.push(Piece::Template(translate_replacement(
            &template[start..],
            group_count,
        )));
    }
    Some(pieces)
}

// =============================================================================
// Rule Types
// =============================================================================

/// A single from→to rewrite.
#[derive(Debug, Clone)]
pub struct Rule {
    from: Regex,
    to: String,
    context: Option<Vec<Piece>>,
}

impl Rule {
    /// Compiles a rule from a pattern and a JavaScript-style replacement template.
    pub fn new(from: &str, to: &str) -> Result<Self> {
        let from = compile(from)?;
        // captures_len includes the implicit whole-match group
        let group_count = from.captures_len() - 1;
        let context = split_context(to, group_count);
        let to = translate_replacement(to, group_count);
        Ok(Self { from, to, context })
    }

    /// The match pattern source.
    pub fn from_pattern(&self) -> &str {
        self.from.as_str()
    }

    /// The replacement template in regex crate syntax.
    pub fn template(&self) -> &str {
        &self.to
    }

    /// Substitutes the first match in `url`.
    pub fn substitute<'a>(&self, url: &'a str) -> Cow<'a, str> {
        let Some(pieces) = &self.context else {
            return self.from.replace(url, self.to.as_str());
        };

        self.from.replace(url, |caps: &Captures<'_>| {
            let (start, end) = caps.get(0).map_or((0, 0), |m| (m.start(), m.end()));
            let mut out = String::new();
            for piece in pieces {
                match piece {
                    Piece::Template(template) => caps.expand(template, &mut out),
                    Piece::Before => out.push_str(&url[..start]),
                    Piece::After => out.push_str(&url[end..]),
                }
            }
            out
        })
    }
}

/// A URL pattern that disables its ruleset.
#[derive(Debug, Clone)]
pub struct Exclusion {
    pattern: Regex,
}

impl Exclusion {
    /// Compiles an exclusion pattern.
    pub fn new(pattern: &str) -> Result<Self> {
        Ok(Self {
            pattern: compile(pattern)?,
        })
    }

    /// Returns true if `url` is excluded.
    pub fn matches(&self, url: &str) -> bool {
        self.pattern.is_match(url)
    }
}

/// Marks cookies with a matching host and name as securable.
#[derive(Debug, Clone)]
pub struct CookieRule {
    host: Regex,
    name: Regex,
}

impl CookieRule {
    /// Compiles a cookie rule from host and cookie-name patterns.
    pub fn new(host: &str, name: &str) -> Result<Self> {
        Ok(Self {
            host: compile(host)?,
            name: compile(name)?,
        })
    }

    /// Returns true if both the cookie domain and name match.
    pub fn matches(&self, domain: &str, name: &str) -> bool {
        self.host.is_match(domain) && self.name.is_match(name)
    }
}

// =============================================================================
// RuleSet
// =============================================================================

/// A named, independently toggled bundle of rewrite logic for one site.
#[derive(Debug)]
pub struct RuleSet {
    name: String,
    match_rule: Option<Regex>,
    rules: Vec<Rule>,
    exclusions: Vec<Exclusion>,
    cookie_rules: Vec<CookieRule>,
    active: AtomicBool,
    default_state: bool,
    note: String,
}

impl RuleSet {
    /// Creates an empty ruleset.
    ///
    /// `match_rule` is the optional gate pattern; `default_state` is both the
    /// initial and the default `active` state.
    pub fn new(
        name: impl Into<String>,
        match_rule: Option<&str>,
        default_state: bool,
        note: impl Into<String>,
    ) -> Result<Self> {
        let match_rule = match match_rule {
            Some(pattern) if !pattern.is_empty() => Some(compile(pattern)?),
            _ => None,
        };

        Ok(Self {
            name: name.into(),
            match_rule,
            rules: Vec::new(),
            exclusions: Vec::new(),
            cookie_rules: Vec::new(),
            active: AtomicBool::new(default_state),
            default_state,
            note: note.into(),
        })
    }

    /// Appends a rule.
    pub fn with_rule(mut self, rule: Rule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Appends an exclusion.
    pub fn with_exclusion(mut self, exclusion: Exclusion) -> Self {
        self.exclusions.push(exclusion);
        self
    }

    /// Appends a cookie rule.
    pub fn with_cookie_rule(mut self, cookie_rule: CookieRule) -> Self {
        self.cookie_rules.push(cookie_rule);
        self
    }

    pub(crate) fn push_rule(&mut self, rule: Rule) {
        self.rules.push(rule);
    }

    pub(crate) fn push_exclusion(&mut self, exclusion: Exclusion) {
        self.exclusions.push(exclusion);
    }

    pub(crate) fn push_cookie_rule(&mut self, cookie_rule: CookieRule) {
        self.cookie_rules.push(cookie_rule);
    }

    /// Ruleset name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Human-readable note (default-off reason, platforms).
    pub fn note(&self) -> &str {
        &self.note
    }

    /// Rules in evaluation order.
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Exclusion patterns.
    pub fn exclusions(&self) -> &[Exclusion] {
        &self.exclusions
    }

    /// Cookie rules.
    pub fn cookie_rules(&self) -> &[CookieRule] {
        &self.cookie_rules
    }

    /// Returns true if the ruleset has a gate pattern.
    pub fn has_match_rule(&self) -> bool {
        self.match_rule.is_some()
    }

    /// Whether the ruleset currently participates in rewriting.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    /// Enables or disables the ruleset.
    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Relaxed);
    }

    /// The state the ruleset started in before user overrides.
    pub fn default_state(&self) -> bool {
        self.default_state
    }

    /// Restores the default active state.
    pub fn reset_to_default(&self) {
        self.set_active(self.default_state);
    }

    /// Returns true if some cookie rule covers the given cookie.
    pub fn secures_cookie(&self, domain: &str, name: &str) -> bool {
        self.cookie_rules.iter().any(|cr| cr.matches(domain, name))
    }

    /// Rewrites `url` with the first rule that changes it.
    ///
    /// Does not consult `active`; callers filter inactive rulesets.
    pub fn apply(&self, url: &str) -> Option<String> {
        if self.exclusions.iter().any(|e| e.matches(url)) {
            tracing::debug!("Excluded uri {}", url);
            return None;
        }

        if let Some(gate) = &self.match_rule {
            if !gate.is_match(url) {
                tracing::trace!("Ruleset {} match_rule excluded {}", self.name, url);
                return None;
            }
        }

        for rule in &self.rules {
            let rewritten = rule.substitute(url);
            if rewritten != url {
                return Some(rewritten.into_owned());
            }
        }

        if self.match_rule.is_some() {
            // The gate need not describe the rewritten URL space precisely
            tracing::debug!(
                "Ruleset {} had an applicable match_rule but no matching rules",
                self.name
            );
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn simple_ruleset() -> RuleSet {
        RuleSet::new("Example", None, true, "")
            .unwrap()
            .with_rule(Rule::new(r"^http://example\.com/", "https://example.com/").unwrap())
    }

    // ==================== Template Tests ====================

    #[test]
    fn translate_braces_numbered_groups() {
        assert_eq!(
            translate_replacement("https://$1example.com/", 1),
            "https://${1}example.com/"
        );
    }

    #[test]
    fn translate_two_digit_groups() {
        assert_eq!(translate_replacement("$12", 12), "${12}");
        // Only one group: "$12" is group 1 followed by "2"
        assert_eq!(translate_replacement("$12", 1), "${1}2");
    }

    #[test]
    fn translate_whole_match_and_literal_dollars() {
        assert_eq!(translate_replacement("[$&]", 0), "[${0}]");
        assert_eq!(translate_replacement("$$", 0), "$$");
        assert_eq!(translate_replacement("cost$", 0), "cost$$");
        assert_eq!(translate_replacement("$x", 0), "$$x");
    }

    #[test]
    fn translate_missing_group_stays_literal() {
        assert_eq!(translate_replacement("$2", 1), "$$2");
        assert_eq!(translate_replacement("$0", 3), "$$0");
    }

    // ==================== Rule Tests ====================

    #[test]
    fn rule_substitutes_captures_with_adjacent_text() {
        let rule = Rule::new(r"^http://(www\.)?example\.com/", "https://$1example.com/").unwrap();
        assert_eq!(
            rule.substitute("http://www.example.com/a"),
            "https://www.example.com/a"
        );
        assert_eq!(
            rule.substitute("http://example.com/a"),
            "https://example.com/a"
        );
    }

    #[test]
    fn rule_expands_prefix_and_suffix_references() {
        let rule = Rule::new("b", "[$`|$']").unwrap();
        assert_eq!(rule.substitute("abc"), "a[a|c]c");

        let rule = Rule::new(r"^http://(\w+)\.test/", "https://$1.test/?from=$'").unwrap();
        assert_eq!(
            rule.substitute("http://site.test/path"),
            "https://site.test/?from=pathpath"
        );
    }

    #[test]
    fn escaped_dollar_before_backtick_stays_literal() {
        let rule = Rule::new("x", "$$`").unwrap();
        assert_eq!(rule.substitute("x"), "$`");
    }

    #[test]
    fn rule_replaces_first_match_only() {
        let rule = Rule::new("a", "b").unwrap();
        assert_eq!(rule.substitute("aaa"), "baa");
    }

    #[test]
    fn rule_rejects_invalid_pattern() {
        let err = Rule::new("(unclosed", "x").unwrap_err();
        assert!(matches!(err, CatalogueError::Pattern { .. }));
    }

    #[test]
    fn cookie_rule_requires_both_patterns() {
        let cr = CookieRule::new(r"^(?:www\.)?example\.com$", ".+").unwrap();
        assert!(cr.matches("example.com", "sid"));
        assert!(cr.matches("www.example.com", "sid"));
        assert!(!cr.matches("evil.com", "sid"));
        assert!(!cr.matches("example.com", ""));
    }

    // ==================== RuleSet Tests ====================

    #[test]
    fn apply_rewrites_matching_url() {
        let rs = simple_ruleset();
        assert_eq!(
            rs.apply("http://example.com/page"),
            Some("https://example.com/page".to_string())
        );
        assert_eq!(rs.apply("http://other.com/page"), None);
    }

    #[test]
    fn apply_skips_rule_that_changes_nothing() {
        // Rule 1 matches but substitutes the identical text
        let rs = RuleSet::new("Two rules", None, true, "")
            .unwrap()
            .with_rule(Rule::new(r"^http://example\.com/", "http://example.com/").unwrap())
            .with_rule(Rule::new(r"^http:", "https:").unwrap());

        assert_eq!(
            rs.apply("http://example.com/x"),
            Some("https://example.com/x".to_string())
        );
    }

    #[test]
    fn exclusion_vetoes_active_ruleset() {
        let rs = simple_ruleset()
            .with_exclusion(Exclusion::new(r"^http://example\.com/insecure").unwrap());

        assert!(rs.is_active());
        assert_eq!(rs.apply("http://example.com/insecure/page"), None);
        assert!(rs.apply("http://example.com/secure").is_some());
    }

    #[test]
    fn gate_pattern_must_match() {
        let rs = RuleSet::new("Gated", Some(r"^http://gated\."), true, "")
            .unwrap()
            .with_rule(Rule::new(r"^http:", "https:").unwrap());

        assert!(rs.has_match_rule());
        assert_eq!(rs.apply("http://example.com/"), None);
        assert_eq!(
            rs.apply("http://gated.example.com/"),
            Some("https://gated.example.com/".to_string())
        );
    }

    #[test]
    fn gate_match_without_rule_match_is_none() {
        let rs = RuleSet::new("Gated", Some("example"), true, "")
            .unwrap()
            .with_rule(Rule::new(r"^http://nomatch/", "https://nomatch/").unwrap());
        assert_eq!(rs.apply("http://example.com/"), None);
    }

    #[test]
    fn empty_match_rule_means_no_gate() {
        let rs = RuleSet::new("Ungated", Some(""), true, "").unwrap();
        assert!(!rs.has_match_rule());
    }

    #[test]
    fn active_state_toggles_and_resets() {
        let rs = RuleSet::new("Off", None, false, "default off").unwrap();
        assert!(!rs.is_active());
        assert!(!rs.default_state());

        rs.set_active(true);
        assert!(rs.is_active());

        rs.reset_to_default();
        assert!(!rs.is_active());
        assert_eq!(rs.note(), "default off");
    }

    #[test]
    fn secures_cookie_checks_all_rules() {
        let rs = simple_ruleset()
            .with_cookie_rule(CookieRule::new("^a\\.com$", "^x$").unwrap())
            .with_cookie_rule(CookieRule::new("^b\\.com$", ".").unwrap());

        assert!(rs.secures_cookie("a.com", "x"));
        assert!(!rs.secures_cookie("a.com", "y"));
        assert!(rs.secures_cookie("b.com", "y"));
    }
}
