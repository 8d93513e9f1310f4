//! Engine construction settings.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Default capacity of the host→rulesets lookup cache.
pub const DEFAULT_RULESET_CACHE_SIZE: usize = 1000;

/// Default capacity of the cookie-host safety cache.
pub const DEFAULT_COOKIE_HOST_CACHE_SIZE: usize = 100;

/// Default user agent label used for platform detection.
pub const DEFAULT_USER_AGENT: &str = "Httpsify";

/// Settings supplied to the engine at construction time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Client label used only to evaluate ruleset platform filters.
    pub user_agent: String,
    /// Ruleset name → `"true"`/`"false"` overrides of the default state.
    pub rule_active_states: HashMap<String, String>,
    /// Capacity of the ruleset lookup cache.
    pub ruleset_cache_size: usize,
    /// Capacity of the cookie-host safety cache.
    pub cookie_host_cache_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            rule_active_states: HashMap::new(),
            ruleset_cache_size: DEFAULT_RULESET_CACHE_SIZE,
            cookie_host_cache_size: DEFAULT_COOKIE_HOST_CACHE_SIZE,
        }
    }
}

impl EngineConfig {
    /// Creates a configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the user agent label.
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Sets the active-state override table.
    pub fn with_rule_active_states(mut self, states: HashMap<String, String>) -> Self {
        self.rule_active_states = states;
        self
    }

    /// Sets a single active-state override.
    pub fn with_rule_state(mut self, name: impl Into<String>, active: bool) -> Self {
        self.rule_active_states
            .insert(name.into(), active.to_string());
        self
    }

    /// Sets both cache capacities.
    pub fn with_cache_sizes(mut self, ruleset_cache: usize, cookie_host_cache: usize) -> Self {
        self.ruleset_cache_size = ruleset_cache;
        self.cookie_host_cache_size = cookie_host_cache;
        self
    }

    /// Looks up the override for a ruleset name.
    ///
    /// Only the exact string `"true"` enables; any other value disables.
    pub fn override_for(&self, name: &str) -> Option<bool> {
        self.rule_active_states.get(name).map(|v| v == "true")
    }
}

/// Parses an override table from a JSON object.
///
/// Values may be the strings `"true"`/`"false"` or JSON booleans.
pub fn rule_states_from_json(json: &str) -> Result<HashMap<String, String>> {
    let raw: HashMap<String, serde_json::Value> = serde_json::from_str(json)?;
    Ok(raw
        .into_iter()
        .map(|(name, value)| {
            let state = match value {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            };
            (name, state)
        })
        .collect())
}
