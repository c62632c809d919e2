use thiserror::Error;

/// Conditions surfaced to the user as a notice rather than a crash.
#[derive(Error, Debug)]
pub enum LabelError {
    #[error("cluster not found: {0}")]
    ClusterNotFound(String),

    #[error("suggestion generator is not configured: {0}")]
    GeneratorNotConfigured(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Why a single page produced no suggestions. Never escapes a per-page call.
#[derive(Error, Debug)]
pub enum GenerateError {
    #[error("page content unavailable: {0}")]
    Content(String),

    #[error("generative service call failed: {0}")]
    Service(String),

    #[error("unparseable model response: {0}")]
    Parse(String),
}
