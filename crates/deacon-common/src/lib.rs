// Re-export dependencies used in public interfaces of common types
pub use chrono;
pub use serde::{Deserialize, Serialize};
use thiserror::Error;

mod instance;
mod runtime;

pub use instance::*;
pub use runtime::*;

#[derive(Error, Debug)]
pub enum DeaconError {
    #[error("Resource Not Found: {0}")]
    NotFound(String),

    #[error("Container Runtime Error: {0}")]
    Runtime(String),

    #[error("Persistence Error writing {path}: {source}")]
    Persistence {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Validation Error: {0}")]
    Validation(String),

    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("Serialization Error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
}

impl DeaconError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, DeaconError::NotFound(_))
    }
}

// Define the primary Result type for Deacon operations
pub type Result<T> = std::result::Result<T, DeaconError>;

/// Severity attached to maintenance findings and outbound alerts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_serialization() {
        let json = serde_json::to_string(&Severity::Critical).unwrap();
        assert_eq!(json, "\"critical\"");
        let back: Severity = serde_json::from_str("\"warning\"").unwrap();
        assert_eq!(back, Severity::Warning);
    }

    #[test]
    fn test_persistence_error_carries_path() {
        let err = DeaconError::Persistence {
            path: "/var/lib/deacon/instances.json".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        };
        let msg = err.to_string();
        assert!(msg.contains("/var/lib/deacon/instances.json"));
        assert!(!err.is_not_found());
    }
}
