#[derive(Debug, thiserror::Error)]
pub enum ApisError {
    #[error("Annotation {annotation} is not a valid RFC 3339 timestamp: {source}")]
    InvalidTimestampAnnotation {
        annotation: &'static str,
        source: chrono::ParseError,
    },

    #[error("Invalid cluster selector: {0}")]
    InvalidSelector(#[from] kube::core::ParseExpressionError),
}
