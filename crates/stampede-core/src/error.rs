use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Template error: {0}")]
    Template(String),

    #[error("Data source exhausted: {0}")]
    DataExhausted(String),

    #[error("Handler error: {0}")]
    Handler(String),

    #[error("Check failed: {0}")]
    CheckFailed(String),

    #[error("Hook error: {0}")]
    Hook(String),

    #[error("Sink error: {0}")]
    Sink(String),

    #[error("Fatal runner error: {0}")]
    Fatal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl Serialize for EngineError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

// ---------------------------------------------------------------------------
// ErrorKind — failure taxonomy carried on result records
// ---------------------------------------------------------------------------

/// Coarse classification of a failed step, recorded alongside the error
/// message so error distributions can be grouped without string parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Connection-level failure (refused, reset, DNS).
    Network,
    /// The step exceeded its configured or effective timeout.
    Timeout,
    /// The request itself was malformed or rejected before I/O.
    Request,
    /// A check predicate evaluated to false.
    Check,
    /// A hook attached to the step failed.
    Hook,
    /// Anything the handler could not classify.
    Unknown,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Network => "network",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Request => "request",
            ErrorKind::Check => "check",
            ErrorKind::Hook => "hook",
            ErrorKind::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_display() {
        let err = EngineError::Config("basic pattern requires users > 0".to_string());
        assert_eq!(
            err.to_string(),
            "Config error: basic pattern requires users > 0"
        );
    }

    #[test]
    fn data_exhausted_display() {
        let err = EngineError::DataExhausted("users.csv".to_string());
        assert_eq!(err.to_string(), "Data source exhausted: users.csv");
    }

    #[test]
    fn io_error_from_std() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: EngineError = io_err.into();
        let msg = err.to_string();
        assert!(msg.contains("IO error"));
        assert!(msg.contains("file not found"));
    }

    #[test]
    fn serde_error_from_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("not valid json").unwrap_err();
        let err: EngineError = json_err.into();
        assert!(err.to_string().contains("Serialization error"));
    }

    #[test]
    fn serialize_produces_string() {
        let err = EngineError::Template("unterminated helper".to_string());
        let json = serde_json::to_string(&err).expect("serialize should succeed");
        assert_eq!(json, "\"Template error: unterminated helper\"");
    }

    #[test]
    fn error_kind_display() {
        assert_eq!(ErrorKind::Network.to_string(), "network");
        assert_eq!(ErrorKind::Timeout.to_string(), "timeout");
        assert_eq!(ErrorKind::Request.to_string(), "request");
        assert_eq!(ErrorKind::Unknown.to_string(), "unknown");
    }

    #[test]
    fn error_kind_serde_roundtrip() {
        for kind in [
            ErrorKind::Network,
            ErrorKind::Timeout,
            ErrorKind::Request,
            ErrorKind::Check,
            ErrorKind::Hook,
            ErrorKind::Unknown,
        ] {
            let json = serde_json::to_string(&kind).unwrap();
            let parsed: ErrorKind = serde_json::from_str(&json).unwrap();
            assert_eq!(parsed, kind);
        }
    }
}
