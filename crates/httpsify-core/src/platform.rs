//! Platform detection for ruleset applicability.
//!
//! Rulesets may declare a `platform` attribute (e.g. `"mixedcontent"`); a
//! ruleset whose platform the local client does not support starts disabled.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// First Opera major version with mixed content blocking.
const OPERA_MIXED_CONTENT_VERSION: u32 = 23;

/// Client platform as far as ruleset applicability is concerned.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    /// Chrome, Chromium, modern Opera and everything else.
    #[default]
    Chromium,
    /// Opera before version 23, which lacks mixed content blocking.
    LegacyOpera,
}

/// Matches the Opera version token (`OPR/40.0`, `Opera/12.16`).
static OPERA_VERSION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:OPR|Opera)[/\s](\d+)(?:\.\d+)").expect("opera version pattern is valid")
});

impl Platform {
    /// Determines the platform from a user agent string.
    pub fn detect(user_agent: &str) -> Self {
        let version = OPERA_VERSION
            .captures(user_agent)
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse::<u32>().ok());

        match version {
            Some(v) if v < OPERA_MIXED_CONTENT_VERSION => {
                tracing::debug!("Detected Opera {} (no mixed content blocking)", v);
                Platform::LegacyOpera
            }
            _ => {
                tracing::debug!("Detected Chrome/Chromium platform");
                Platform::Chromium
            }
        }
    }

    /// Platform tokens this client accepts in a ruleset `platform` attribute.
    pub fn tokens(&self) -> &'static [&'static str] {
        match self {
            Platform::Chromium => &["chromium"],
            Platform::LegacyOpera => &["chromium", "mixedcontent"],
        }
    }

    /// Returns true if a ruleset declaring `platform` applies here.
    ///
    /// Matching is a substring search, so `"chromium firefox"` applies to
    /// Chromium.
    pub fn supports(&self, platform: &str) -> bool {
        self.tokens().iter().any(|token| platform.contains(token))
    }

    /// Returns the platform name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Chromium => "chromium",
            Platform::LegacyOpera => "legacy_opera",
        }
    }
}
