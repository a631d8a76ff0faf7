use thiserror::Error;

/// Failure taxonomy for external calls. The retry layer keys off the
/// classification: transient failures are retried, fatal ones propagate
/// immediately, everything else burns a retry attempt and then degrades.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("upstream timeout: {0}")]
    Timeout(String),

    #[error("upstream throttled: {0}")]
    Throttled(String),

    #[error("upstream failure: {0}")]
    Upstream(String),

    /// Invalid JSON or schema violation from an inference response. Counts
    /// against the retry budget but is never surfaced as a raw parse error.
    #[error("malformed response: {0}")]
    Malformed(String),

    /// Missing/invalid required input. No retry, propagates straight out.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl PipelineError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PipelineError::Timeout(_) | PipelineError::Throttled(_) | PipelineError::Upstream(_)
        )
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, PipelineError::InvalidInput(_))
    }
}

/// Classify a reqwest transport error into the taxonomy.
pub fn classify_transport(err: &reqwest::Error, what: &str) -> PipelineError {
    if err.is_timeout() {
        PipelineError::Timeout(format!("{what}: {err}"))
    } else {
        PipelineError::Upstream(format!("{what}: {err}"))
    }
}

/// Classify an HTTP status into the taxonomy. 404 is not an error at this
/// layer; callers map it to an empty result before getting here.
pub fn classify_status(status: reqwest::StatusCode, what: &str) -> PipelineError {
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        PipelineError::Throttled(format!("{what}: HTTP {status}"))
    } else if status.is_server_error() {
        PipelineError::Upstream(format!("{what}: HTTP {status}"))
    } else {
        PipelineError::Malformed(format!("{what}: unexpected HTTP {status}"))
    }
}

/// True when an anyhow chain bottoms out in a fatal PipelineError.
pub fn is_fatal(err: &anyhow::Error) -> bool {
    err.downcast_ref::<PipelineError>()
        .map(|e| e.is_fatal())
        .unwrap_or(false)
}
