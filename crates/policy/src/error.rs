//! Errors raised while loading, verifying, or applying a policy bundle.

use thiserror::Error;

/// Failure modes of the bundle store (§4.1 of the design: load, verify, apply).
#[derive(Debug, Error)]
pub enum PolicyError {
    /// The bundle file could not be read from disk.
    #[error("failed to read bundle {path}: {source}")]
    Io {
        /// Path that failed to open.
        path: String,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },
    /// The bundle YAML did not parse or violated the schema (unknown predicate,
    /// empty rule name, invalid action, ...).
    #[error("malformed policy bundle: {0}")]
    Malformed(String),
    /// `require_signature` is set and the bundle's `.sig` companion is missing,
    /// malformed, or does not verify against the configured public key.
    #[error("signature invalid: {0}")]
    SignatureInvalid(String),
    /// An apply request conflicted with the bundle store's current version.
    #[error("version conflict: {0}")]
    VersionConflict(String),
}

impl PolicyError {
    /// Whether this error should surface as the Apply API's `SignatureInvalid` kind.
    #[must_use]
    pub fn is_signature_invalid(&self) -> bool {
        matches!(self, Self::SignatureInvalid(_))
    }
}
