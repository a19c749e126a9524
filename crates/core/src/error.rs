#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Invalid job description: {0}")]
    InvalidDescription(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
