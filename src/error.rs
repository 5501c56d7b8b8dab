//! Error types for rusty_chart

use thiserror::Error;

/// Main error type for rusty_chart
///
/// Every failure is scoped to one instrument; nothing here is fatal to the process.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ChartError {
    /// Transport-level failure (connection refused, timeout, reset)
    #[error("Network error: {0}")]
    Network(String),

    #[error("HTTP status {status} from {url}")]
    HttpStatus { status: u16, url: String },

    /// Malformed payload from the remote source
    #[error("Decode error: {0}")]
    Decode(String),

    /// A range request that returned no bars
    #[error("Empty result for {0}")]
    EmptyResult(String),

    /// Intraday quote that disagrees with the cached series
    #[error("Stale quote: {0}")]
    StaleQuote(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Calendar error: {0}")]
    Calendar(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Parse error: {0}")]
    Parse(String),

    /// The worker task behind a handle has shut down
    #[error("Worker closed: {0}")]
    WorkerClosed(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl ChartError {
    /// Whether this failure should start the offline backoff window
    pub fn is_transient(&self) -> bool {
        matches!(self, ChartError::Network(_) | ChartError::HttpStatus { .. })
    }
}

impl From<std::io::Error> for ChartError {
    fn from(e: std::io::Error) -> Self {
        ChartError::Io(e.to_string())
    }
}

/// Result type alias for rusty_chart operations
pub type Result<T> = std::result::Result<T, ChartError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors() {
        assert!(ChartError::Network("reset".into()).is_transient());
        assert!(ChartError::HttpStatus {
            status: 503,
            url: "http://localhost".into()
        }
        .is_transient());
        assert!(!ChartError::Decode("missing key".into()).is_transient());
        assert!(!ChartError::EmptyResult("AAPL".into()).is_transient());
    }

    #[test]
    fn test_error_display() {
        let err = ChartError::HttpStatus {
            status: 404,
            url: "http://host/ohlcv/XYZ".into(),
        };
        assert_eq!(err.to_string(), "HTTP status 404 from http://host/ohlcv/XYZ");

        let io: ChartError = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert!(matches!(io, ChartError::Io(_)));
        assert_eq!(io.clone(), io);
    }
}
