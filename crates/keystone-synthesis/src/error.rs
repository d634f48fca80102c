use keystone_core::errors::ProviderError;
use keystone_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum SynthesisError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("store error: {0}")]
    Store(StoreError),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("cancelled")]
    Cancelled,
}

impl From<StoreError> for SynthesisError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(what) => Self::NotFound(what),
            other => Self::Store(other),
        }
    }
}

impl SynthesisError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_not_found_maps_to_not_found() {
        let err: SynthesisError = StoreError::NotFound("project proj_x".into()).into();
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "not found: project proj_x");
    }

    #[test]
    fn other_store_errors_stay_store() {
        let err: SynthesisError = StoreError::Conflict("slug".into()).into();
        assert!(matches!(err, SynthesisError::Store(StoreError::Conflict(_))));
    }
}
