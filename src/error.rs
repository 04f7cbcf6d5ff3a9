use thiserror::Error;

/// Crate-wide error type.
///
/// The middleware itself never produces an error per request: a timeout or a
/// rate-limit denial is a well-formed HTTP response, not a failure. This type
/// only surfaces problems at startup, such as unparseable environment
/// configuration.
#[derive(Error, Debug)]
pub enum GuardError {
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Convenience type alias for Results with GuardError.
pub type GuardResult<T> = Result<T, GuardError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display() {
        let err = GuardError::Config("Invalid PORT: invalid digit".to_string());
        assert_eq!(
            err.to_string(),
            "Configuration error: Invalid PORT: invalid digit"
        );
    }
}
