//! Error types for the memory subsystem.
//!
//! Recoverable conditions (corrupted documents, unreachable embedding
//! backends, non-conforming planner payloads) never surface here -- they
//! are folded into defaults or fallbacks at the call site. What remains
//! is genuinely fatal: atomic-write failures and serialization of our own
//! documents.

/// Errors that can occur in the memory subsystem.
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    /// A filesystem operation failed. Atomic-write failures propagate as
    /// this variant; persistence invariants must not be silently violated.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path involved in the failed operation.
        path: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Serializing one of our own documents failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl MemoryError {
    /// Wrap an I/O error with the path it occurred at.
    pub fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }
}
