//! Host lookup and URL rewriting against the catalogue.
//!
//! ## Lookup Order
//!
//! For `x.y.google.com` the target index is consulted under:
//!
//! 1. `x.y.google.com` (exact)
//! 2. `*.y.google.com`, `x.*.google.com`, `x.y.*.com`, `x.y.google.*` (each label)
//! 3. `*.google.com` (suffix wildcards, narrowest first, down to two labels)
//!
//! Results are unioned in discovery order without duplicates and cached per
//! host.

use std::sync::Arc;

use crate::catalogue::{Catalogue, RuleSetId, RuleSets};
use crate::ruleset::RuleSet;

/// Target index keys consulted for `host`, in lookup order.
pub fn lookup_keys(host: &str) -> Vec<String> {
    let labels: Vec<&str> = host.split('.').collect();
    let mut keys = Vec::with_capacity(labels.len() * 2 + 1);
    keys.push(host.to_string());

    // Replace each label with * in turn
    let mut segmented = labels.clone();
    for i in 0..labels.len() {
        segmented[i] = "*";
        keys.push(segmented.join("."));
        segmented[i] = labels[i];
    }

    // Eat away from the left: for x.y.z.google.com also *.z.google.com and
    // *.google.com (*.y.z.google.com came from the label pass)
    for i in 2..labels.len().saturating_sub(1) {
        keys.push(format!("*.{}", labels[i..].join(".")));
    }

    keys
}

/// Unions the buckets for every lookup key, keeping first-discovered order.
fn collect_candidates(catalogue: &Catalogue, host: &str) -> Vec<RuleSetId> {
    let mut results: Vec<RuleSetId> = Vec::new();
    for key in lookup_keys(host) {
        if let Some(bucket) = catalogue.bucket(&key) {
            for id in bucket {
                if !results.contains(id) {
                    results.push(*id);
                }
            }
        }
    }
    results
}

impl RuleSets {
    /// Returns the rulesets that may apply to `host`, in evaluation order.
    ///
    /// The returned list is a snapshot; mutating it never touches the index.
    pub fn potentially_applicable_rulesets(&self, host: &str) -> Vec<Arc<RuleSet>> {
        let _enter = self.span.enter();
        let catalogue = self.catalogue.read();
        self.applicable_in(&catalogue, host)
    }

    /// Cache-assisted lookup against an already locked catalogue.
    pub(crate) fn applicable_in(&self, catalogue: &Catalogue, host: &str) -> Vec<Arc<RuleSet>> {
        if let Some(ids) = self.ruleset_cache.lock().get(host) {
            tracing::debug!("Ruleset cache hit for {} items: {}", host, ids.len());
            return catalogue.resolve(ids);
        }
        tracing::debug!("Ruleset cache miss for {}", host);

        let ids = collect_candidates(catalogue, host);
        let rulesets = catalogue.resolve(&ids);

        if rulesets.is_empty() {
            tracing::debug!("Applicable rules for {}: none", host);
        } else {
            let names: Vec<&str> = rulesets.iter().map(|rs| rs.name()).collect();
            tracing::debug!("Applicable rules for {}: {:?}", host, names);
        }

        self.ruleset_cache.lock().put(host.to_string(), ids);
        rulesets
    }

    /// Rewrites `url` with the first active ruleset for `host` that changes it.
    pub fn rewrite_uri(&self, url: &str, host: &str) -> Option<String> {
        self.potentially_applicable_rulesets(host)
            .iter()
            .filter(|rs| rs.is_active())
            .find_map(|rs| rs.apply(url))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalogue::UserRule;
    use crate::config::EngineConfig;

    /// One uniquely named ruleset per target pattern.
    fn wildcard_catalogue(targets: &[&str]) -> RuleSets {
        let mut xml = String::from("<rulesetlibrary>");
        for target in targets {
            xml.push_str(&format!(
                r#"<ruleset name="{0}"><target host="{0}"/><rule from="^http:" to="https:"/></ruleset>"#,
                target
            ));
        }
        xml.push_str("</rulesetlibrary>");

        let rules = RuleSets::default();
        rules.add_from_xml(&xml).unwrap();
        rules
    }

    fn names(rulesets: &[Arc<RuleSet>]) -> Vec<String> {
        rulesets.iter().map(|rs| rs.name().to_string()).collect()
    }

    // ==================== Lookup Key Tests ====================

    #[test]
    fn lookup_keys_for_four_labels() {
        assert_eq!(
            lookup_keys("a.b.example.com"),
            vec![
                "a.b.example.com",
                "*.b.example.com",
                "a.*.example.com",
                "a.b.*.com",
                "a.b.example.*",
                "*.example.com",
            ]
        );
    }

    #[test]
    fn lookup_keys_for_five_labels() {
        let keys = lookup_keys("x.y.z.google.com");
        assert_eq!(&keys[keys.len() - 2..], &["*.z.google.com", "*.google.com"]);
    }

    #[test]
    fn lookup_keys_for_two_labels() {
        assert_eq!(
            lookup_keys("example.com"),
            vec!["example.com", "*.com", "example.*"]
        );
    }

    #[test]
    fn lookup_keys_single_label() {
        assert_eq!(lookup_keys("localhost"), vec!["localhost", "*"]);
    }

    // ==================== Applicable Ruleset Tests ====================

    #[test]
    fn wildcard_matching_is_complete() {
        let patterns = [
            "a.b.example.com",
            "*.b.example.com",
            "a.*.example.com",
            "a.b.*.com",
            "a.b.example.*",
            "*.example.com",
        ];
        let rules = wildcard_catalogue(&patterns);

        let found = names(&rules.potentially_applicable_rulesets("a.b.example.com"));
        assert_eq!(found.len(), patterns.len());
        for pattern in patterns {
            assert_eq!(found.iter().filter(|n| *n == pattern).count(), 1, "{}", pattern);
        }

        assert!(rules
            .potentially_applicable_rulesets("unrelated.test")
            .is_empty());
    }

    #[test]
    fn suffix_wildcard_covers_deeper_hosts() {
        let rules = wildcard_catalogue(&["*.example.com"]);
        assert_eq!(
            rules.potentially_applicable_rulesets("x.y.example.com").len(),
            1
        );
        // The bare domain is not covered by *.example.com
        assert!(rules.potentially_applicable_rulesets("example.com").is_empty());
    }

    #[test]
    fn ruleset_under_several_keys_appears_once() {
        let rules = RuleSets::default();
        rules
            .add_from_xml(
                r#"<rulesetlibrary><ruleset name="Both">
                     <target host="www.example.com"/><target host="*.example.com"/>
                     <rule from="^http:" to="https:"/>
                   </ruleset></rulesetlibrary>"#,
            )
            .unwrap();

        let found = rules.potentially_applicable_rulesets("www.example.com");
        assert_eq!(names(&found), vec!["Both"]);
    }

    #[test]
    fn discovery_order_is_preserved() {
        let rules = wildcard_catalogue(&["*.example.com", "a.b.example.com", "*.b.example.com"]);
        let found = names(&rules.potentially_applicable_rulesets("a.b.example.com"));
        assert_eq!(
            found,
            vec!["a.b.example.com", "*.b.example.com", "*.example.com"]
        );
    }

    #[test]
    fn lookups_are_cached() {
        let rules = wildcard_catalogue(&["example.com"]);
        rules.potentially_applicable_rulesets("example.com");
        assert!(rules.ruleset_cache.lock().contains("example.com"));

        let again = rules.potentially_applicable_rulesets("example.com");
        assert_eq!(names(&again), vec!["example.com"]);
    }

    #[test]
    fn user_rule_invalidates_cached_host() {
        let rules = RuleSets::default();
        assert!(rules.potentially_applicable_rulesets("new.test").is_empty());
        assert!(rules.ruleset_cache.lock().contains("new.test"));

        rules.add_user_rule(&UserRule::new("new.test", "^http:", "https:"));
        assert_eq!(rules.potentially_applicable_rulesets("new.test").len(), 1);
    }

    #[test]
    fn wildcard_user_rule_invalidates_covered_hosts() {
        let rules = RuleSets::default();
        assert!(rules.potentially_applicable_rulesets("a.wild.test").is_empty());

        rules.add_user_rule(&UserRule::new("*.wild.test", "^http:", "https:"));
        assert_eq!(
            rules.potentially_applicable_rulesets("a.wild.test").len(),
            1
        );
    }

    #[test]
    fn cache_capacity_is_respected() {
        let rules = RuleSets::new(EngineConfig::new().with_cache_sizes(2, 2));
        rules.potentially_applicable_rulesets("one.test");
        rules.potentially_applicable_rulesets("two.test");
        rules.potentially_applicable_rulesets("three.test");

        let cache = rules.ruleset_cache.lock();
        assert_eq!(cache.len(), 2);
        assert!(!cache.contains("one.test"));
    }

    // ==================== Rewrite Tests ====================

    #[test]
    fn rewrite_uri_uses_first_active_ruleset() {
        let rules = RuleSets::default();
        rules
            .add_from_xml(
                r#"<rulesetlibrary>
                     <ruleset name="Disabled" default_off="x">
                       <target host="example.com"/>
                       <rule from="^http://example\.com/" to="https://disabled.example.com/"/>
                     </ruleset>
                     <ruleset name="Enabled">
                       <target host="example.com"/>
                       <rule from="^http://example\.com/" to="https://example.com/"/>
                     </ruleset>
                   </rulesetlibrary>"#,
            )
            .unwrap();

        assert_eq!(
            rules.rewrite_uri("http://example.com/page", "example.com"),
            Some("https://example.com/page".to_string())
        );

        rules.set_active("Disabled", true);
        assert_eq!(
            rules.rewrite_uri("http://example.com/page", "example.com"),
            Some("https://disabled.example.com/page".to_string())
        );
    }

    #[test]
    fn rewrite_uri_skips_excluded_ruleset() {
        let rules = RuleSets::default();
        rules
            .add_from_xml(
                r#"<rulesetlibrary><ruleset name="Excl">
                     <target host="example.com"/>
                     <exclusion pattern="^http://example\.com/plain"/>
                     <rule from="^http:" to="https:"/>
                   </ruleset></rulesetlibrary>"#,
            )
            .unwrap();

        assert_eq!(
            rules.rewrite_uri("http://example.com/plain/x", "example.com"),
            None
        );
        assert!(rules
            .rewrite_uri("http://example.com/other", "example.com")
            .is_some());
    }

    #[test]
    fn rewrite_uri_without_rulesets_is_none() {
        let rules = RuleSets::default();
        assert_eq!(rules.rewrite_uri("http://unmatched.test/x", "unmatched.test"), None);
    }

    // ==================== Concurrency Tests ====================

    #[test]
    fn user_rules_added_during_lookups_are_never_hidden_by_cache() {
        let rules = RuleSets::default();
        let hosts: Vec<String> = (0..40).map(|i| format!("u{}.test", i)).collect();

        std::thread::scope(|scope| {
            for chunk in hosts.chunks(20) {
                let rules = &rules;
                scope.spawn(move || {
                    for host in chunk {
                        assert!(rules.add_user_rule(&UserRule::new(host.as_str(), "^http:", "https:")));
                    }
                });
            }

            let rules_ref = &rules;
            scope.spawn(move || {
                assert!(rules_ref.add_user_rule(&UserRule::new("*.wild.test", "^http:", "https:")));
            });

            for _ in 0..3 {
                let rules = &rules;
                let hosts = &hosts;
                scope.spawn(move || {
                    for _ in 0..25 {
                        for host in hosts {
                            assert!(rules.potentially_applicable_rulesets(host).len() <= 1);
                        }
                        assert!(rules.potentially_applicable_rulesets("a.wild.test").len() <= 1);
                    }
                });
            }
        });

        assert_eq!(rules.len(), 41);
        for host in &hosts {
            assert_eq!(names(&rules.potentially_applicable_rulesets(host)), vec![host.clone()]);
            assert_eq!(
                rules.rewrite_uri(&format!("http://{}/", host), host),
                Some(format!("https://{}/", host))
            );
        }
        assert_eq!(
            names(&rules.potentially_applicable_rulesets("a.wild.test")),
            vec!["*.wild.test"]
        );
    }
}
