//! Error taxonomy for the ingestion pipeline.
//!
//! Each pipeline layer has its own error type so the run driver can decide
//! how far a failure propagates:
//!
//! | Error | Scope | Retried |
//! |-------|-------|---------|
//! | [`FetchError`] | one page of one source | yes, inside the fetch layer |
//! | [`ExtractionFailure`] | one page of one source | no |
//! | [`NormalizationFailure`] | one candidate record | no, the record is dropped |
//! | [`ReconciliationConflict`] | one candidate record | no, reported in the outcome |
//! | [`StoreError`] | whole run | no, run-fatal |
//!
//! Ledger failures are logged and never abort a run.

use std::path::PathBuf;

/// A page could not be rendered.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// The connection failed or the body could not be read.
    #[error("network error fetching {url}: {message}")]
    Network { url: String, message: String },

    /// The server answered with a non-success status.
    #[error("HTTP {status} from {url}")]
    Status { url: String, status: u16 },

    /// The request or render wait exceeded its deadline.
    #[error("timed out fetching {url}")]
    Timeout { url: String },

    /// The rendering service reported a failure.
    #[error("render failed for {url}: {message}")]
    Render { url: String, message: String },

    /// No fixture is registered for the URL.
    #[error("no fixture for {url}")]
    NotFound { url: String },
}

impl FetchError {
    /// Network errors, timeouts, throttling and server errors are worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Network { .. } | FetchError::Timeout { .. } | FetchError::Render { .. } => {
                true
            }
            FetchError::Status { status, .. } => *status == 429 || *status >= 500,
            FetchError::NotFound { .. } => false,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, FetchError::Timeout { .. })
    }
}

/// A rendered document could not be turned into candidate records.
#[derive(Debug, thiserror::Error)]
pub enum ExtractionFailure {
    #[error("invalid selector `{selector}`: {message}")]
    InvalidSelector { selector: String, message: String },

    #[error("model output is not a product list: {message}")]
    MalformedOutput { message: String },

    #[error("model-assisted extraction requested but no completion provider is configured")]
    ProviderUnavailable,

    #[error("completion provider failed: {0}")]
    Provider(String),
}

/// A candidate record could not be normalized; the record is dropped.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum NormalizationFailure {
    #[error("record has no name")]
    MissingName,

    #[error("record `{name}` has no price")]
    MissingPrice { name: String },

    #[error("record `{name}` has unparseable price `{raw}`")]
    InvalidPrice { name: String, raw: String },

    #[error("record `{name}` has negative price `{raw}`")]
    NegativePrice { name: String, raw: String },
}

/// Two candidates in one batch disagree about the same listing.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ReconciliationConflict {
    #[error("conflicting observations for listing `{key}` from {source_name} in one batch; kept the first")]
    DuplicateListingKey { source_name: String, key: String },
}

/// The canonical store could not be read or written.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("store snapshot is not valid JSON: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("store snapshot is inconsistent: {0}")]
    Corrupt(String),
}

/// The run ledger could not be appended to or read.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("ledger I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ledger entry could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Export or import failed; reported to the caller as-is.
#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("flat table is missing required column `{0}`")]
    MissingColumn(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Configuration files could not be loaded.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid YAML in {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid source registry: {0}")]
    Registry(String),
}

/// The sample dataset could not be loaded into the store.
#[derive(Debug, thiserror::Error)]
pub enum SeedError {
    #[error("invalid seed dataset: {0}")]
    Dataset(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Run-fatal pipeline errors. Everything else is scoped to a source.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("no configured source matches {0:?}")]
    NoSources(Vec<String>),
}
