use std::time::Duration;

use thiserror::Error;

/// Failures of a single page render.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    #[error("timed out after {waited_ms}ms waiting for '{condition}' on {url}")]
    Timeout {
        url: String,
        condition: &'static str,
        waited_ms: u64,
    },
    #[error("access denied on {url} (marker: {marker})")]
    Blocked { url: String, marker: String },
    #[error("transport error on {url}: {reason}")]
    Transport { url: String, reason: String },
}

impl FetchError {
    pub fn url(&self) -> &str {
        match self {
            FetchError::Timeout { url, .. }
            | FetchError::Blocked { url, .. }
            | FetchError::Transport { url, .. } => url,
        }
    }

    /// Only transport failures are worth another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Transport { .. })
    }
}

/// A required field could not be located by any rule in its table.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("could not extract {field}: {reason}")]
pub struct ExtractionError {
    pub field: &'static str,
    pub reason: String,
}

impl ExtractionError {
    pub fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum DetectionError {
    #[error("detection quota exceeded: {info}")]
    QuotaExceeded {
        info: String,
        retry_after: Option<Duration>,
    },
    #[error("detection service error: {0}")]
    ServiceError(String),
    #[error("text too short for detection ({chars} chars)")]
    InputInvalid { chars: usize },
}

#[derive(Debug, Error)]
#[error("persistence failed: {0}")]
pub struct PersistenceError(#[from] pub rusqlite::Error);

/// Everything the crawl loop can observe while working on one category or product.
#[derive(Debug, Error)]
pub enum CrawlError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("{url}: {source}")]
    Extraction {
        url: String,
        #[source]
        source: ExtractionError,
    },
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

impl CrawlError {
    pub fn extraction(url: &str, source: ExtractionError) -> Self {
        CrawlError::Extraction {
            url: url.to_string(),
            source,
        }
    }

    /// Blocking by the site and failed writes end the run; everything else is isolated.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CrawlError::Fetch(FetchError::Blocked { .. }) | CrawlError::Persistence(_)
        )
    }

    pub fn url(&self) -> Option<&str> {
        match self {
            CrawlError::Fetch(e) => Some(e.url()),
            CrawlError::Extraction { url, .. } => Some(url),
            CrawlError::Persistence(_) => None,
        }
    }
}

impl From<rusqlite::Error> for CrawlError {
    fn from(e: rusqlite::Error) -> Self {
        CrawlError::Persistence(PersistenceError(e))
    }
}

pub type CrawlResult<T> = Result<T, CrawlError>;
