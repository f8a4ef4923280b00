use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("run id allocation failed: {0}")]
    RunId(String),
    #[error("workspace setup failed for `{path}`: {source}")]
    Workspace {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("execution runtime unavailable: {reason}")]
    RuntimeUnavailable { reason: String },
}
