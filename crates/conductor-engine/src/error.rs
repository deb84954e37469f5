use conductor_core::errors::ApiError;
use conductor_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("agent API error: {0}")]
    Api(#[from] ApiError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl EngineError {
    /// Stable machine-readable kind, used as the RPC error code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Api(e) => e.error_kind(),
            Self::Store(_) => "store_error",
            Self::InvalidInput(_) => "invalid_params",
        }
    }
}
