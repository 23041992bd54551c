use thiserror::Error;

/// Failures reported by the collaborators around the collection core.
///
/// None of these abort collection: the caller downgrades them to a log line
/// and records the datum as unavailable.
#[derive(Error, Debug)]
pub enum CollectionError {
    #[error("device timing unavailable: {0}")]
    DeviceTiming(String),
    #[error("call stack capture failed: {0}")]
    CallStack(String),
    #[error("malformed activity metadata: {0}")]
    MalformedMetadata(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CollectionError>;
