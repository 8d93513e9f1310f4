//! Httpsify Core - ruleset matching and HTTPS rewriting engine.
//!
//! This crate loads a catalogue of rewrite rulesets and uses it to upgrade
//! `http` URLs to `https`, both one URL at a time and inside page text, and
//! to decide which cookies may safely be forced to `Secure`.
//!
//! ## Features
//!
//! - Parses `<rulesetlibrary>` catalogues, skipping broken rulesets
//! - Wildcard target index (`*.example.com`, `www.example.*`)
//! - LRU-cached host lookups
//! - Platform-filtered and user-overridable ruleset activation
//! - User rules added at runtime
//! - Cookie securing with a redirect-loop safety check
//!
//! ## Architecture
//!
//! ```text
//! page text ─► HttpsRewriter::process ─► URL finder ─► RuleSets::rewrite_uri
//!                                                            │
//!                                    lookup cache ◄──────────┤
//!                                                            ▼
//!                                        target index ─► RuleSet::apply
//! ```

pub mod catalogue;
pub mod config;
pub mod cookie;
pub mod error;
pub mod lru;
mod matcher;
pub mod platform;
pub mod rewriter;
pub mod ruleset;

pub use catalogue::{LoadSummary, RuleSetId, RuleSets, UserRule};
pub use config::{rule_states_from_json, EngineConfig};
pub use cookie::{Cookie, DomainBlacklist, StaticBlacklist};
pub use error::{CatalogueError, Result};
pub use lru::LruCache;
pub use matcher::lookup_keys;
pub use platform::Platform;
pub use rewriter::HttpsRewriter;
pub use ruleset::{CookieRule, Exclusion, Rule, RuleSet};
