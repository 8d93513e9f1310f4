//! Error types for the rewriting engine.

use thiserror::Error;

/// Errors raised while loading a ruleset catalogue.
#[derive(Debug, Error)]
pub enum CatalogueError {
    /// The catalogue document is not well-formed XML.
    #[error("XML error: {0}")]
    Xml(#[from] roxmltree::Error),

    /// A pattern failed to compile.
    #[error("Invalid pattern {pattern:?}: {source}")]
    Pattern {
        /// The offending pattern source.
        pattern: String,
        /// The compiler error.
        #[source]
        source: regex::Error,
    },

    /// A required attribute is missing from an element.
    #[error("<{element}> is missing the {attribute:?} attribute")]
    MissingAttribute {
        /// Element name.
        element: &'static str,
        /// Attribute name.
        attribute: &'static str,
    },

    /// IO error reading a catalogue file.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error reading an active-state override table.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CatalogueError {
    /// Wraps a regex compile failure together with its source pattern.
    pub fn pattern(pattern: impl Into<String>, source: regex::Error) -> Self {
        CatalogueError::Pattern {
            pattern: pattern.into(),
            source,
        }
    }
}

/// Result type for catalogue operations.
pub type Result<T> = std::result::Result<T, CatalogueError>;
