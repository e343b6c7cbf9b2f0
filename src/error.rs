//! Domain-specific error types for the execution pipeline.
//!
//! Each stage has its own error enum so callers can match on the
//! failure mode instead of parsing message strings:
//! - [`ValidationError`]: rejected before any sandbox resource exists
//! - [`PrepError`]: archive extraction failed
//! - [`LaunchError`]: the isolation runtime could not start the sandbox

use std::io;

/// A submission was rejected before any sandbox resource was allocated.
///
/// Always recoverable by the caller: fix the input and retry.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    /// Source code exceeds the configured character limit.
    #[error("Code is too long ({length} characters, max {max})")]
    CodeTooLong { length: usize, max: usize },

    /// Language is not one of the supported runtimes.
    #[error("Unsupported language: {language}")]
    UnsupportedLanguage { language: String },

    /// Archive entry point is not a safe relative path.
    #[error("Invalid entry point '{entry}': {reason}")]
    InvalidEntryPoint { entry: String, reason: String },

    /// Batch contains more tasks than the hard maximum.
    #[error("Batch too large ({count} tasks, max {max})")]
    BatchTooLarge { count: usize, max: usize },

    /// Batch contains no tasks.
    #[error("Batch contains no tasks")]
    EmptyBatch,

    /// Inline code is empty or whitespace only.
    #[error("Code must be a non-empty string")]
    EmptyCode,

    /// Neither inline code nor an entry point was given.
    #[error("Submission needs either inline code or an archive entry point")]
    MissingSource,

    /// Both inline code and an entry point were given.
    #[error("Submission cannot carry both inline code and an archive entry point")]
    ConflictingSource,

    /// An entry point was given where only inline code is accepted.
    #[error("Entry point '{entry}' needs an archive; inline submissions carry code")]
    InlineCodeRequired { entry: String },
}

impl ValidationError {
    /// Creates a `CodeTooLong` error.
    pub fn code_too_long(length: usize, max: usize) -> Self {
        Self::CodeTooLong { length, max }
    }

    /// Creates an `UnsupportedLanguage` error.
    pub fn unsupported_language(language: impl Into<String>) -> Self {
        Self::UnsupportedLanguage {
            language: language.into(),
        }
    }

    /// Creates an `InvalidEntryPoint` error.
    pub fn invalid_entry_point(entry: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidEntryPoint {
            entry: entry.into(),
            reason: reason.into(),
        }
    }

    /// Creates a `BatchTooLarge` error.
    pub fn batch_too_large(count: usize, max: usize) -> Self {
        Self::BatchTooLarge { count, max }
    }

    /// Returns true if this is a code length error.
    #[allow(dead_code)] // Public API for callers
    pub fn is_code_too_long(&self) -> bool {
        matches!(self, Self::CodeTooLong { .. })
    }

    /// Returns true if this is an unsupported language error.
    #[allow(dead_code)] // Public API for callers
    pub fn is_unsupported_language(&self) -> bool {
        matches!(self, Self::UnsupportedLanguage { .. })
    }

    /// Returns true if this is an entry point error.
    #[allow(dead_code)] // Public API for callers
    pub fn is_invalid_entry_point(&self) -> bool {
        matches!(self, Self::InvalidEntryPoint { .. })
    }

    /// Returns true if this is a batch size error.
    #[allow(dead_code)] // Public API for callers
    pub fn is_batch_too_large(&self) -> bool {
        matches!(self, Self::BatchTooLarge { .. })
    }
}

/// An archive could not be turned into a usable staging directory.
///
/// The staging directory is always removed before this is returned.
#[derive(Debug, thiserror::Error)]
pub enum PrepError {
    /// The declared entry point does not exist after extraction.
    #[error("Entry file not found in archive: {entry}")]
    EntryPointNotFound { entry: String },

    /// An archive member would land outside the staging root.
    #[error("Unsafe archive member: {path}")]
    UnsafeArchive { path: String },

    /// The archive could not be read.
    #[error("Bad archive: {source}")]
    BadArchive {
        #[source]
        source: io::Error,
    },

    /// The staging directory could not be created or written.
    #[error("Failed to prepare staging directory: {source}")]
    Staging {
        #[source]
        source: io::Error,
    },
}

impl PrepError {
    /// Creates an `EntryPointNotFound` error.
    pub fn entry_point_not_found(entry: impl Into<String>) -> Self {
        Self::EntryPointNotFound {
            entry: entry.into(),
        }
    }

    /// Creates an `UnsafeArchive` error.
    pub fn unsafe_archive(path: impl Into<String>) -> Self {
        Self::UnsafeArchive { path: path.into() }
    }

    /// Returns true if this is a missing entry point error.
    #[allow(dead_code)] // Public API for callers
    pub fn is_entry_point_not_found(&self) -> bool {
        matches!(self, Self::EntryPointNotFound { .. })
    }

    /// Returns true if this is a path traversal error.
    #[allow(dead_code)] // Public API for callers
    pub fn is_unsafe_archive(&self) -> bool {
        matches!(self, Self::UnsafeArchive { .. })
    }
}

/// The isolation runtime could not start a sandbox.
///
/// Launch failures are reported immediately and never retried.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    /// The container runtime is not running or not reachable.
    #[error("Docker is not available: {message}")]
    RuntimeUnavailable { message: String },

    /// The runtime image for the language is not present locally.
    #[error("Container image not found: {image}")]
    ImageNotFound { image: String },

    /// The runtime refused to create or start the sandbox.
    #[error("Sandbox rejected by runtime: {message}")]
    Rejected { message: String },

    /// Inline code could not be materialized on disk.
    #[error("Failed to stage source: {source}")]
    Staging {
        #[source]
        source: io::Error,
    },

    /// No runtime is configured for the language.
    #[error("No runtime configured for language: {language}")]
    UnsupportedLanguage { language: String },
}

impl LaunchError {
    /// Creates a `RuntimeUnavailable` error.
    pub fn runtime_unavailable(message: impl Into<String>) -> Self {
        Self::RuntimeUnavailable {
            message: message.into(),
        }
    }

    /// Creates an `ImageNotFound` error.
    pub fn image_not_found(image: impl Into<String>) -> Self {
        Self::ImageNotFound {
            image: image.into(),
        }
    }

    /// Creates a `Rejected` error.
    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected {
            message: message.into(),
        }
    }

    /// Creates an `UnsupportedLanguage` error.
    pub fn unsupported_language(language: impl Into<String>) -> Self {
        Self::UnsupportedLanguage {
            language: language.into(),
        }
    }

    /// Returns true if this is a runtime unavailability error.
    pub fn is_runtime_unavailable(&self) -> bool {
        matches!(self, Self::RuntimeUnavailable { .. })
    }

    /// Returns true if this is an image not found error.
    pub fn is_image_not_found(&self) -> bool {
        matches!(self, Self::ImageNotFound { .. })
    }
}

impl From<io::Error> for LaunchError {
    fn from(source: io::Error) -> Self {
        Self::Staging { source }
    }
}
