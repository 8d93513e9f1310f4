//! Text rewriter and engine facade.
//!
//! [`HttpsRewriter`] finds `http` URLs in arbitrary text and upgrades the ones
//! an active ruleset covers. When a rule changed nothing but the scheme the
//! original URL is kept with only its scheme swapped; otherwise the rule's
//! output is emitted as is.
//!
//! Matches are normalized through [`url::Url`] before any rule sees them, so
//! an upgraded URL can differ from the source text beyond its scheme: hosts
//! are lowercased, a bare host gains a `/` path, and characters such as `"`
//! are percent-encoded. The finder can over-match adjacent quoted URLs (a JSON
//! array with no spaces, say), and the encoded quotes then end up inside the
//! single rewritten URL.
//!
//! ```text
//! "visit http://example.com/page"  ──►  "visit https://example.com/page"
//! ```

use std::path::Path;
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use url::Url;

use crate::catalogue::{LoadSummary, RuleSets, UserRule};
use crate::config::EngineConfig;
use crate::cookie::Cookie;
use crate::error::Result;
use crate::ruleset::RuleSet;

/// URL finder. Candidates must open with an `http` scheme, a `www` label or
/// a `host.tld/` prefix, which keeps unterminated `url(...)` constructs from
/// dragging the scan across the whole document.
static FIND_URI: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?i)\b((?:http:(?:/{1,3}|[a-z0-9%])|www\d{0,3}[.]|[a-z0-9.\-]+[.][a-z]{2,4}/)(?:[^\s()<>]+)+(?:\(([^\s()<>]+|(\([^\s()<>]+\)))*\)|[^\s`!()\[\]{};:'".,<>?«»“”‘’]))"#,
    )
    .expect("URL finder pattern is valid")
});

/// Rewrites page text and URLs against a shared [`RuleSets`] engine.
#[derive(Debug, Clone)]
pub struct HttpsRewriter {
    rules: Arc<RuleSets>,
}

impl HttpsRewriter {
    /// Wraps an existing engine.
    pub fn new(rules: Arc<RuleSets>) -> Self {
        Self { rules }
    }

    /// Builds an engine from a catalogue document.
    pub fn from_xml(xml: &str, config: EngineConfig) -> Result<(Self, LoadSummary)> {
        let rules = RuleSets::new(config);
        let summary = rules.add_from_xml(xml)?;
        Ok((Self::new(Arc::new(rules)), summary))
    }

    /// Builds an engine from a catalogue file.
    pub fn from_file(path: impl AsRef<Path>, config: EngineConfig) -> Result<(Self, LoadSummary)> {
        let rules = RuleSets::new(config);
        let summary = rules.load_file(path)?;
        Ok((Self::new(Arc::new(rules)), summary))
    }

    /// The underlying engine.
    pub fn rulesets(&self) -> &Arc<RuleSets> {
        &self.rules
    }

    /// Upgrades every rewritable `http` URL found in `content`.
    ///
    /// Never fails: anything that does not parse as an `http` URL is left
    /// untouched.
    pub fn process(&self, content: &str) -> String {
        FIND_URI
            .replace_all(content, |caps: &Captures| {
                let found = &caps[0];
                self.rewrite_match(found)
                    .unwrap_or_else(|| found.to_string())
            })
            .into_owned()
    }

    /// Upgrades a single URL, returning it unchanged when no rule applies.
    pub fn rewrite_url(&self, url: &str) -> String {
        self.rewrite_match(url).unwrap_or_else(|| url.to_string())
    }

    /// Post-processes a textual response body.
    pub fn rewrite_page_content(&self, body: &str) -> String {
        self.process(body)
    }

    /// See [`RuleSets::should_secure_cookie`].
    pub fn should_secure_cookie(&self, cookie: &Cookie, known_https: bool) -> Option<Arc<RuleSet>> {
        self.rules.should_secure_cookie(cookie, known_https)
    }

    /// See [`RuleSets::add_user_rule`].
    pub fn add_user_rule(&self, rule: &UserRule) -> bool {
        self.rules.add_user_rule(rule)
    }

    fn rewrite_match(&self, found: &str) -> Option<String> {
        let url = Url::parse(found).ok()?;
        if url.scheme() != "http" {
            return None;
        }
        let host = url.host_str()?;

        let rewritten = self.rules.rewrite_uri(url.as_str(), host)?;

        // Scheme-only change: keep the normalized original, swap the scheme
        if let Ok(mut upgraded) = Url::parse(&rewritten) {
            if upgraded.set_scheme("http").is_ok()
                && upgraded.as_str() == url.as_str()
                && upgraded.set_scheme("https").is_ok()
            {
                return Some(upgraded.into());
            }
        }
        Some(rewritten)
    }
}
