//! Cookie security advisor.
//!
//! Decides whether a cookie may be forced to `Secure`. A cookie on a domain
//! that might still be served over plain HTTP must never be secured, so the
//! advisor first checks whether the catalogue would upgrade an arbitrary URL
//! on that domain. The check is conservative: no rewriting ruleset means
//! "unsafe", which may decline cookies that would in fact have been fine.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::catalogue::RuleSets;
use crate::ruleset::RuleSet;

/// An observed cookie to be judged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cookie {
    /// Cookie domain scope, possibly with a leading dot.
    pub domain: String,
    /// Cookie name.
    pub name: String,
}

impl Cookie {
    /// Creates a cookie description.
    pub fn new(domain: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            name: name.into(),
        }
    }
}

// =============================================================================
// Blacklist
// =============================================================================

/// Domains known to have HTTP-only redirect loops.
pub trait DomainBlacklist: Send + Sync {
    /// Returns true if cookies for `domain` must never be secured.
    fn is_blacklisted(&self, domain: &str) -> bool;
}

/// A fixed set of blacklisted domains.
#[derive(Debug, Clone, Default)]
pub struct StaticBlacklist {
    domains: HashSet<String>,
}

impl StaticBlacklist {
    /// Creates an empty blacklist.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses one domain per line; blank lines and `#` comments are skipped.
    pub fn parse(text: &str) -> Self {
        text.lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .collect()
    }

    /// Adds a domain.
    pub fn insert(&mut self, domain: impl Into<String>) {
        self.domains.insert(domain.into());
    }

    /// Number of listed domains.
    pub fn len(&self) -> usize {
        self.domains.len()
    }

    /// Returns true if nothing is listed.
    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }
}

impl<S: Into<String>> FromIterator<S> for StaticBlacklist {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self {
            domains: iter.into_iter().map(Into::into).collect(),
        }
    }
}

impl DomainBlacklist for StaticBlacklist {
    fn is_blacklisted(&self, domain: &str) -> bool {
        self.domains.contains(domain)
    }
}

// =============================================================================
// Advisor
// =============================================================================

impl RuleSets {
    /// Returns the ruleset that asks for `cookie` to be secured, if any.
    ///
    /// `known_https` is true when the cookie is known to have been set over
    /// HTTPS, which skips the domain safety check.
    pub fn should_secure_cookie(&self, cookie: &Cookie, known_https: bool) -> Option<Arc<RuleSet>> {
        let _enter = self.span.enter();
        // Cookie domain scopes can start with "."
        let hostname = cookie.domain.trim_start_matches('.');

        if !known_https && !self.safe_to_secure_cookie(hostname) {
            return None;
        }

        let ruleset = self
            .potentially_applicable_rulesets(hostname)
            .into_iter()
            .filter(|rs| rs.is_active())
            .find(|rs| rs.secures_cookie(&cookie.domain, &cookie.name));

        if let Some(rs) = &ruleset {
            tracing::info!(
                "Securing cookie {} for {} (ruleset {})",
                cookie.name,
                cookie.domain,
                rs.name()
            );
        }
        ruleset
    }

    /// Returns true if `domain` would have an arbitrary URL upgraded.
    ///
    /// Blacklisted domains are never safe and bypass the cache.
    pub fn safe_to_secure_cookie(&self, domain: &str) -> bool {
        let _enter = self.span.enter();

        if self.blacklist.is_blacklisted(domain) {
            tracing::info!("Cookies for {} blacklisted", domain);
            return false;
        }

        // Held across the check and cache fill so set_active cannot interleave
        let catalogue = self.catalogue.read();

        if let Some(&cached) = self.cookie_host_cache.lock().get(domain) {
            tracing::debug!("Cookie host cache hit for {}", domain);
            return cached;
        }
        tracing::debug!("Cookie host cache miss for {}", domain);

        // Make up a random URL on the domain and see if we would upgrade it
        let nonce_path = format!("/{}", rand::random::<f64>());
        let test_uri = format!("http://{}{}{}", domain, nonce_path, nonce_path);
        tracing::info!("Testing securecookie applicability with {}", test_uri);

        let safe = self
            .applicable_in(&catalogue, domain)
            .iter()
            .filter(|rs| rs.is_active())
            .any(|rs| rs.apply(&test_uri).is_some());

        if safe {
            tracing::info!("Cookie domain {} could be secured", domain);
        } else {
            tracing::info!("Cookie domain {} could NOT be secured", domain);
        }

        self.cookie_host_cache.lock().put(domain.to_string(), safe);
        safe
    }
}
