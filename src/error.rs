use thiserror::Error;

/// Failures reported by the data collaborators (local gateway, charger
/// manager, cloud API, geocoder).
///
/// Cloneable so a single in-flight result can be handed to every caller
/// awaiting the same request.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SourceError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("upstream returned HTTP {0}")]
    Status(u16),
    #[error("authentication required for {0}")]
    AuthRequired(String),
    #[error("malformed payload: {0}")]
    Payload(String),
    #[error("source not configured: {0}")]
    NotConfigured(&'static str),
}

impl SourceError {
    /// Transient failures leave the cache stale and are retried by the next
    /// scheduled tick.
    pub fn is_transient(&self) -> bool {
        matches!(self, SourceError::Transport(_) | SourceError::Status(_))
    }
}

pub type SourceResult<T> = Result<T, SourceError>;

/// Reject NaN and infinite readings at the collaborator boundary.
pub(crate) fn ensure_finite(field: &str, value: f64) -> SourceResult<()> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(SourceError::Payload(format!("{field} is not finite: {value}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(SourceError::Transport("reset".into()).is_transient());
        assert!(SourceError::Status(503).is_transient());
        assert!(!SourceError::AuthRequired("me@example.com".into()).is_transient());
        assert!(!SourceError::Payload("bad".into()).is_transient());
    }

    #[test]
    fn test_ensure_finite() {
        assert!(ensure_finite("solar", 12.0).is_ok());
        let err = ensure_finite("solar", f64::NAN).unwrap_err();
        assert!(err.to_string().contains("solar"));
    }
}
