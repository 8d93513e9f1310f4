//! Rule catalogue: parsed rulesets plus the host→rulesets target index.
//!
//! The catalogue owns every [`RuleSet`] in a single collection; the target
//! index maps literal or wildcarded hostnames (`mail.google.com`,
//! `*.google.com`) to ordered, de-duplicated lists of [`RuleSetId`]s into that
//! collection.
//!
//! ## Catalogue Format
//!
//! ```xml
//! <rulesetlibrary>
//!   <ruleset name="Example" default_off="reason" platform="mixedcontent"
//!            match_rule="^http://(www\.)?example\.com/">
//!     <target host="example.com" />
//!     <target host="*.example.com" />
//!     <exclusion pattern="^http://example\.com/plain/" />
//!     <securecookie host="^(www\.)?example\.com$" name=".+" />
//!     <rule from="^http://(www\.)?example\.com/" to="https://$1example.com/" />
//!   </ruleset>
//! </rulesetlibrary>
//! ```
//!
//! A ruleset that fails to parse is logged and skipped; the rest of the
//! catalogue still loads.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use roxmltree::{Document, Node};
use serde::{Deserialize, Serialize};
use tracing::Span;

use crate::config::EngineConfig;
use crate::cookie::{DomainBlacklist, StaticBlacklist};
use crate::error::{CatalogueError, Result};
use crate::lru::LruCache;
use crate::platform::Platform;
use crate::ruleset::{CookieRule, Exclusion, Rule, RuleSet};

/// Identity of a ruleset within its catalogue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RuleSetId(pub usize);

/// Outcome of loading a catalogue document.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadSummary {
    /// Rulesets added to the catalogue.
    pub loaded: usize,
    /// Ruleset definitions that failed to parse and were skipped.
    pub failed: usize,
}

/// Parameters of a user-supplied rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRule {
    /// Target host (may carry a single `*` label).
    pub host: String,
    /// Pattern matched against the full URL.
    pub url_matcher: String,
    /// Replacement template (`$1` style back-references).
    pub redirect_to: String,
}

impl UserRule {
    /// Creates user rule parameters.
    pub fn new(
        host: impl Into<String>,
        url_matcher: impl Into<String>,
        redirect_to: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            url_matcher: url_matcher.into(),
            redirect_to: redirect_to.into(),
        }
    }
}

// =============================================================================
// Catalogue
// =============================================================================

/// Owned rulesets and the target index.
#[derive(Debug, Default)]
pub(crate) struct Catalogue {
    rulesets: Vec<Arc<RuleSet>>,
    targets: HashMap<String, Vec<RuleSetId>>,
}

impl Catalogue {
    /// Adds a ruleset and registers it under each target host.
    fn insert<'a>(
        &mut self,
        ruleset: RuleSet,
        hosts: impl IntoIterator<Item = &'a str>,
    ) -> RuleSetId {
        let id = RuleSetId(self.rulesets.len());
        self.rulesets.push(Arc::new(ruleset));

        for host in hosts {
            let bucket = self.targets.entry(host.to_string()).or_default();
            if !bucket.contains(&id) {
                bucket.push(id);
            }
        }
        id
    }

    /// The bucket registered for an exact (possibly wildcarded) host key.
    pub(crate) fn bucket(&self, host: &str) -> Option<&[RuleSetId]> {
        self.targets.get(host).map(Vec::as_slice)
    }

    pub(crate) fn get(&self, id: RuleSetId) -> Option<&Arc<RuleSet>> {
        self.rulesets.get(id.0)
    }

    /// Resolves ids into shared ruleset handles, preserving order.
    pub(crate) fn resolve(&self, ids: &[RuleSetId]) -> Vec<Arc<RuleSet>> {
        ids.iter().filter_map(|id| self.get(*id).cloned()).collect()
    }
}

// =============================================================================
// RuleSets
// =============================================================================

/// The rewriting engine's shared state: catalogue, target index and caches.
///
/// Lock order is catalogue first, then a cache. Lookups hold the catalogue
/// read lock; `add_user_rule` and loads hold the write lock while they
/// invalidate cache entries, so a lookup can never cache a result computed
/// from a superseded index.
pub struct RuleSets {
    pub(crate) catalogue: RwLock<Catalogue>,
    pub(crate) ruleset_cache: Mutex<LruCache<String, Vec<RuleSetId>>>,
    pub(crate) cookie_host_cache: Mutex<LruCache<String, bool>>,
    pub(crate) blacklist: Arc<dyn DomainBlacklist>,
    pub(crate) span: Span,
    config: EngineConfig,
    platform: Platform,
}

impl std::fmt::Debug for RuleSets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let catalogue = self.catalogue.read();
        f.debug_struct("RuleSets")
            .field("rulesets", &catalogue.rulesets.len())
            .field("targets", &catalogue.targets.len())
            .field("platform", &self.platform)
            .field("user_agent", &self.config.user_agent)
            .finish()
    }
}

impl Default for RuleSets {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl RuleSets {
    /// Creates an empty engine.
    ///
    /// The platform is detected once here from the configured user agent.
    pub fn new(config: EngineConfig) -> Self {
        let platform = Platform::detect(&config.user_agent);

        Self {
            catalogue: RwLock::new(Catalogue::default()),
            ruleset_cache: Mutex::new(LruCache::new(config.ruleset_cache_size)),
            cookie_host_cache: Mutex::new(LruCache::new(config.cookie_host_cache_size)),
            blacklist: Arc::new(StaticBlacklist::new()),
            span: tracing::info_span!("rulesets"),
            config,
            platform,
        }
    }

    /// Sets the redirect-loop domain blacklist consulted by the cookie advisor.
    pub fn with_blacklist(mut self, blacklist: Arc<dyn DomainBlacklist>) -> Self {
        self.blacklist = blacklist;
        self
    }

    /// Sets the span all engine log events are emitted in.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// The detected client platform.
    pub fn platform(&self) -> Platform {
        self.platform
    }

    /// The construction settings.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Number of rulesets in the catalogue.
    pub fn len(&self) -> usize {
        self.catalogue.read().rulesets.len()
    }

    /// Returns true if no rulesets are loaded.
    pub fn is_empty(&self) -> bool {
        self.catalogue.read().rulesets.is_empty()
    }

    /// Number of distinct target host keys.
    pub fn target_count(&self) -> usize {
        self.catalogue.read().targets.len()
    }

    /// Finds the first ruleset with the given name.
    pub fn ruleset_by_name(&self, name: &str) -> Option<Arc<RuleSet>> {
        self.catalogue
            .read()
            .rulesets
            .iter()
            .find(|rs| rs.name() == name)
            .cloned()
    }

    /// Rulesets registered under exactly this host key, without wildcard expansion.
    pub fn rulesets_for_target(&self, host: &str) -> Vec<Arc<RuleSet>> {
        let catalogue = self.catalogue.read();
        catalogue
            .bucket(host)
            .map(|ids| catalogue.resolve(ids))
            .unwrap_or_default()
    }

    // =========================================================================
    // Loading
    // =========================================================================

    /// Reads a catalogue file and adds its rulesets.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<LoadSummary> {
        let xml = std::fs::read_to_string(path.as_ref())?;
        self.add_from_xml(&xml)
    }

    /// Parses a catalogue document and adds every ruleset in it.
    ///
    /// Only a document that is not well-formed XML fails the whole load.
    pub fn add_from_xml(&self, xml: &str) -> Result<LoadSummary> {
        let _enter = self.span.enter();
        let started = std::time::Instant::now();
        let doc = Document::parse(xml)?;

        let mut summary = LoadSummary::default();
        let mut catalogue = self.catalogue.write();

        for node in doc.descendants().filter(|n| n.has_tag_name("ruleset")) {
            match self.parse_one_ruleset(node) {
                Ok((ruleset, targets)) => {
                    catalogue.insert(ruleset, targets.iter().copied());
                    summary.loaded += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        "Error processing ruleset {:?}: {}",
                        node.attribute("name").unwrap_or("<unnamed>"),
                        e
                    );
                    summary.failed += 1;
                }
            }
        }

        // Earlier lookups may have been computed against the smaller index
        self.ruleset_cache.lock().remove_all();
        self.cookie_host_cache.lock().remove_all();
        drop(catalogue);

        tracing::info!(
            "Loaded {} rulesets ({} failed) in {:?}",
            summary.loaded,
            summary.failed,
            started.elapsed()
        );
        Ok(summary)
    }

    /// Builds one ruleset and collects its target hosts.
    fn parse_one_ruleset<'a>(&self, tag: Node<'a, '_>) -> Result<(RuleSet, Vec<&'a str>)> {
        let name = tag.attribute("name").unwrap_or("");
        let mut default_state = true;
        let mut note = String::new();

        if let Some(reason) = tag.attribute("default_off") {
            default_state = false;
            note.push_str(reason);
            note.push('\n');
        }

        // A ruleset for a platform we are not on starts disabled
        if let Some(platform) = tag.attribute("platform").filter(|p| !p.is_empty()) {
            if !self.platform.supports(platform) {
                default_state = false;
            }
            note.push_str("Platform(s): ");
            note.push_str(platform);
            note.push('\n');
        }

        let mut ruleset = RuleSet::new(
            name,
            tag.attribute("match_rule"),
            default_state,
            note.trim(),
        )?;

        if let Some(active) = self.config.override_for(name) {
            ruleset.set_active(active);
        }

        let mut targets = Vec::new();
        for child in tag.descendants().filter(Node::is_element) {
            match child.tag_name().name() {
                "rule" => ruleset.push_rule(Rule::new(
                    required(child, "rule", "from")?,
                    required(child, "rule", "to")?,
                )?),
                "exclusion" => {
                    ruleset.push_exclusion(Exclusion::new(required(child, "exclusion", "pattern")?)?)
                }
                "securecookie" => ruleset.push_cookie_rule(CookieRule::new(
                    required(child, "securecookie", "host")?,
                    required(child, "securecookie", "name")?,
                )?),
                "target" => targets.push(required(child, "target", "host")?),
                _ => {}
            }
        }

        Ok((ruleset, targets))
    }

    // =========================================================================
    // Mutation
    // =========================================================================

    /// Adds a single-rule, always-active ruleset under `rule.host`.
    ///
    /// Returns false if the matcher pattern does not compile.
    pub fn add_user_rule(&self, rule: &UserRule) -> bool {
        let _enter = self.span.enter();
        tracing::info!("Adding new user rule for {:?}", rule);

        let ruleset = match Rule::new(&rule.url_matcher, &rule.redirect_to)
            .and_then(|r| Ok(RuleSet::new(&rule.host, None, true, "user rule")?.with_rule(r)))
        {
            Ok(ruleset) => ruleset,
            Err(e) => {
                tracing::warn!("Rejected user rule for {}: {}", rule.host, e);
                return false;
            }
        };

        let mut catalogue = self.catalogue.write();
        catalogue.insert(ruleset, [rule.host.as_str()]);

        // A wildcard bucket feeds the lookups of many concrete hosts
        if rule.host.contains('*') {
            self.ruleset_cache.lock().remove_all();
            self.cookie_host_cache.lock().remove_all();
        } else {
            self.ruleset_cache.lock().remove(rule.host.as_str());
            self.cookie_host_cache.lock().remove(rule.host.as_str());
        }
        drop(catalogue);

        tracing::info!("Done adding rule");
        true
    }

    /// Enables or disables every ruleset with the given name.
    ///
    /// Returns the number of rulesets changed.
    pub fn set_active(&self, name: &str, active: bool) -> usize {
        let _enter = self.span.enter();
        // Write lock serialises against cookie-safety verdicts being computed
        let catalogue = self.catalogue.write();
        let mut changed = 0;
        for ruleset in catalogue.rulesets.iter().filter(|rs| rs.name() == name) {
            ruleset.set_active(active);
            changed += 1;
        }

        if changed > 0 {
            self.cookie_host_cache.lock().remove_all();
            tracing::info!("Ruleset {} set active={}", name, active);
        }
        changed
    }
}

fn required<'a>(
    node: Node<'a, '_>,
    element: &'static str,
    attribute: &'static str,
) -> Result<&'a str> {
    node.attribute(attribute)
        .ok_or(CatalogueError::MissingAttribute { element, attribute })
}
