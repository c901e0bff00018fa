//! Engine error types
//!
//! Default policy: generation failures are soft (recorded per entrant and
//! skipped), queue and scheduler failures are logged and reported as
//! structured outcomes. Only storage and configuration errors are hard.

use thiserror::Error;

/// Error category for structured logging and behavior mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// The opaque generator failed or returned unusable output; retryable
    TransientGeneration,
    /// The generator kept failing after the retry budget was spent
    ContentGeneration,
    /// A chapter was requested that has no outline entry
    PlanMissing,
    /// Chapter N was requested before chapter N-1 exists
    MissingPriorChapter,
    /// Ink balance fell below the bankruptcy threshold
    Bankruptcy,
    /// Duplicate enqueue, lost compare-and-set, stale lock
    ConcurrencyGuard,
    /// A referenced entity does not exist
    NotFound,
    /// The entity exists but is in the wrong lifecycle state
    InvalidState,
    /// `inkwell.toml` or env misconfigured
    ConfigError,
    /// SQLite failures
    StorageError,
}

impl ErrorCategory {
    /// Machine-readable code for logging
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TransientGeneration => "TRANSIENT_GENERATION",
            Self::ContentGeneration => "CONTENT_GENERATION",
            Self::PlanMissing => "PLAN_MISSING",
            Self::MissingPriorChapter => "MISSING_PRIOR_CHAPTER",
            Self::Bankruptcy => "BANKRUPTCY",
            Self::ConcurrencyGuard => "CONCURRENCY_GUARD",
            Self::NotFound => "NOT_FOUND",
            Self::InvalidState => "INVALID_STATE",
            Self::ConfigError => "CONFIG_ERROR",
            Self::StorageError => "STORAGE_ERROR",
        }
    }

    /// Whether a generation step should be attempted again with backoff
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientGeneration)
    }

    /// Whether the failure is scoped to one entrant and must not abort
    /// processing of its siblings
    pub fn is_entrant_scoped(&self) -> bool {
        matches!(
            self,
            Self::TransientGeneration
                | Self::ContentGeneration
                | Self::PlanMissing
                | Self::MissingPriorChapter
                | Self::Bankruptcy
                | Self::InvalidState
        )
    }
}

/// Engine error with category and context
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("transient generation error: {message}")]
    TransientGeneration {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("content generation failed after {attempts} attempt(s): {message}")]
    ContentGeneration { message: String, attempts: usize },

    #[error("no plan entry for chapter {chapter} of book {book_id}")]
    PlanMissing { book_id: String, chapter: u32 },

    #[error("chapter {chapter} of book {book_id} cannot be written before the chapter preceding it")]
    MissingPriorChapter { book_id: String, chapter: u32 },

    #[error("book {book_id} is bankrupt: balance {balance} below threshold {threshold}")]
    Bankruptcy {
        book_id: String,
        balance: i64,
        threshold: i64,
    },

    #[error("concurrency guard: {message}")]
    ConcurrencyGuard { message: String },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("invalid state: {message}")]
    InvalidState { message: String },

    #[error("config error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("storage error: {message}")]
    Storage {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl EngineError {
    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::TransientGeneration { .. } => ErrorCategory::TransientGeneration,
            Self::ContentGeneration { .. } => ErrorCategory::ContentGeneration,
            Self::PlanMissing { .. } => ErrorCategory::PlanMissing,
            Self::MissingPriorChapter { .. } => ErrorCategory::MissingPriorChapter,
            Self::Bankruptcy { .. } => ErrorCategory::Bankruptcy,
            Self::ConcurrencyGuard { .. } => ErrorCategory::ConcurrencyGuard,
            Self::NotFound { .. } => ErrorCategory::NotFound,
            Self::InvalidState { .. } => ErrorCategory::InvalidState,
            Self::Config { .. } => ErrorCategory::ConfigError,
            Self::Storage { .. } => ErrorCategory::StorageError,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.category().is_retryable()
    }

    /// Create a transient generation error
    pub fn transient(message: impl Into<String>) -> Self {
        Self::TransientGeneration {
            message: message.into(),
            source: None,
        }
    }

    /// Create a transient generation error with source
    pub fn transient_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::TransientGeneration {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn content_generation(message: impl Into<String>, attempts: usize) -> Self {
        Self::ContentGeneration {
            message: message.into(),
            attempts,
        }
    }

    pub fn plan_missing(book_id: impl Into<String>, chapter: u32) -> Self {
        Self::PlanMissing {
            book_id: book_id.into(),
            chapter,
        }
    }

    pub fn concurrency(message: impl Into<String>) -> Self {
        Self::ConcurrencyGuard {
            message: message.into(),
        }
    }

    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Create a config error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    /// Create a config error with source
    pub fn config_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a storage error
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Create a storage error with source
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;
