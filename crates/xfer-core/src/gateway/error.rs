//! Error classification for the SQL Gateway.

use thiserror::Error;

/// Errors surfaced by gateway operations against server A or B.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Connection lost, timed out, or reset. Callers should reconnect and
    /// retry once at the I/O boundary that raised it.
    #[error("transient connection error: {0}")]
    ConnectionTransient(String),

    /// Authentication, permission, or address failure. Not retryable.
    #[error("fatal connection error: {0}")]
    ConnectionFatal(String),

    /// Syntax, type, or permission error on source or destination.
    #[error("query failed: {0}")]
    QueryFatal(String),

    /// Row rejected by a unique-key violation at insert time.
    #[error("duplicate key: {0}")]
    Duplicate(String),

    /// Target table does not exist.
    #[error("missing table: {0}")]
    MissingTable(String),
}

impl GatewayError {
    /// Classify a raw `tiberius` error into one of the gateway's error
    /// kinds using the canonical SQL Server error codes where available
    /// (2627/2601 for a unique-constraint violation), falling back to
    /// substring matching on the error text (`"PRIMARY KEY"` /
    /// `"UNIQUE KEY"` / `"duplicate key"`).
    pub fn classify(err: &tiberius::error::Error) -> Self {
        let text = err.to_string();

        if let tiberius::error::Error::Server(token) = err {
            match token.code() {
                2627 | 2601 => return GatewayError::Duplicate(text),
                208 => return GatewayError::MissingTable(text),
                18456 | 4060 => return GatewayError::ConnectionFatal(text),
                _ => {}
            }
        }

        let lower = text.to_lowercase();
        if lower.contains("primary key") || lower.contains("unique key") || lower.contains("duplicate key") {
            GatewayError::Duplicate(text)
        } else if lower.contains("invalid object name") {
            GatewayError::MissingTable(text)
        } else if lower.contains("login failed") || lower.contains("permission denied") {
            GatewayError::ConnectionFatal(text)
        } else if is_transient_text(&lower) {
            GatewayError::ConnectionTransient(text)
        } else {
            GatewayError::QueryFatal(text)
        }
    }

    /// Classify an I/O-level error (connection acquire, liveness probe).
    pub fn classify_io(err: &std::io::Error) -> Self {
        let text = err.to_string();
        let lower = text.to_lowercase();
        if is_transient_text(&lower) {
            GatewayError::ConnectionTransient(text)
        } else {
            GatewayError::ConnectionFatal(text)
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, GatewayError::Duplicate(_))
    }

    pub fn is_missing_table(&self) -> bool {
        matches!(self, GatewayError::MissingTable(_))
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, GatewayError::ConnectionTransient(_))
    }
}

fn is_transient_text(lower: &str) -> bool {
    lower.contains("timeout")
        || lower.contains("timed out")
        || lower.contains("reset")
        || lower.contains("connection")
        || lower.contains("state")
        || lower.contains("broken pipe")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_text_is_classified_as_duplicate() {
        let err = std::io::Error::other("Violation of PRIMARY KEY constraint");
        assert!(!GatewayError::classify_io(&err).is_duplicate());
        // classify_io never returns Duplicate (no DB error codes at the IO
        // layer); duplicate classification only applies to classify().
    }

    #[test]
    fn transient_io_is_classified_as_transient() {
        let err = std::io::Error::new(std::io::ErrorKind::TimedOut, "connection timed out");
        assert!(GatewayError::classify_io(&err).is_transient());
    }

    #[test]
    fn fatal_io_is_classified_as_fatal() {
        let err = std::io::Error::other("permission denied reading certificate");
        let classified = GatewayError::classify_io(&err);
        assert!(!classified.is_transient());
    }
}
