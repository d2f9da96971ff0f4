//! Typed failures at the seams of the copyvio engine.
//!
//! Orchestration code returns `anyhow::Result`; these enums exist so callers
//! can tell configuration errors (fatal) from per-query and per-source
//! failures (logged and absorbed).

/// Problems selecting or configuring a search engine. Fatal to starting a check.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("unknown search engine: {0}")]
    Unknown(String),
    #[error("search engine {engine} is not supported in this build: {reason}")]
    Unsupported {
        engine: &'static str,
        reason: &'static str,
    },
    #[error("search engine {engine} requires credential `{key}`")]
    MissingCredential { engine: &'static str, key: &'static str },
    #[error("failed to build HTTP client for {engine}: {reason}")]
    Client { engine: &'static str, reason: String },
}

/// A single search query failed. The check continues without its results.
#[derive(Debug, thiserror::Error)]
pub enum SearchQueryError {
    #[error("{engine} error: {reason}")]
    Transport { engine: &'static str, reason: String },
    #[error("{engine} error: got response code {status}")]
    Status { engine: &'static str, status: u16 },
    #[error("{engine} error: malformed response: {reason}")]
    Malformed { engine: &'static str, reason: String },
}

/// Signals raised by source parsers.
#[derive(Debug, thiserror::Error)]
pub enum ParserError {
    /// The document carries a mirror hint; it is a copy of the wiki itself.
    #[error("source matches a known mirror signature")]
    Exclusion,
    /// The document is a viewer shell for another URL that should be fetched instead.
    #[error("source redirects to {0}")]
    Redirect(String),
    #[error("failed to parse source: {0}")]
    Failed(String),
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Transport(String),
    #[error("HTTP {0}")]
    Status(u16),
    #[error("unsupported content type: {0}")]
    UnsupportedContentType(String),
    #[error("content too large ({size} bytes, limit {limit})")]
    TooLarge { size: u64, limit: u64 },
    #[error("failed to read response body: {0}")]
    Body(String),
    #[error("too many redirects")]
    TooManyRedirects,
}

/// Why a worker gave up on a source.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Parse(#[from] ParserError),
}
