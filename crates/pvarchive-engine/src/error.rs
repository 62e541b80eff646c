//! Error types for the archive engine.

use thiserror::Error;

/// Errors that can occur while archiving a PV.
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// The remote source did not answer within the startup grace period.
    #[error("connect timeout after {timeout_ms}ms for {pv}")]
    ConnectTimeout {
        /// PV that could not be reached.
        pv: String,
        /// Grace period that elapsed.
        timeout_ms: u64,
    },

    /// The sample sink rejected a sample.
    #[error("write failure for {pv}: {reason}")]
    WriteFailure {
        /// PV whose sample was rejected.
        pv: String,
        /// Reason reported by the sink.
        reason: String,
    },

    /// The channel's writer queue is full; the sample was not queued.
    #[error("sink queue for {pv} full ({depth} samples)")]
    QueueFull {
        /// PV whose sample was dropped.
        pv: String,
        /// Configured queue depth.
        depth: usize,
    },

    /// The declared sample type does not name a known type.
    #[error("unknown sample type {sample_type:?} for {pv}")]
    UnknownSampleType {
        /// PV carrying the bad type.
        pv: String,
        /// The unparseable type name.
        sample_type: String,
    },

    /// The PV name is empty after normalization.
    #[error("invalid PV name: {name:?}")]
    InvalidPvName {
        /// Name as given by the caller.
        name: String,
    },

    /// The configuration service does not know this PV yet.
    #[error("{pv} is not archivable yet")]
    NotArchivable {
        /// The unknown PV.
        pv: String,
    },

    /// Transport-level failure while opening a subscription.
    #[error("transport error for {pv}: {reason}")]
    Transport {
        /// PV being opened.
        pv: String,
        /// Failure description.
        reason: String,
    },

    /// The configuration service failed to answer.
    #[error("metadata lookup failed: {reason}")]
    Metadata {
        /// Failure description.
        reason: String,
    },

    /// The channel or engine has shut down.
    #[error("archive engine shut down")]
    Shutdown,

    /// Invalid engine configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// TOML configuration could not be parsed.
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// JSON could not be parsed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result alias for the archive engine.
pub type Result<T> = std::result::Result<T, ArchiveError>;

impl ArchiveError {
    /// Whether the channel's reconnect cadence should retry after this error.
    ///
    /// Transient conditions (unreachable source, not-yet-known PV, flaky
    /// metadata service) are retried; configuration errors are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            ArchiveError::ConnectTimeout { .. } => true,
            ArchiveError::NotArchivable { .. } => true,
            ArchiveError::Transport { .. } => true,
            ArchiveError::Metadata { .. } => true,
            ArchiveError::Io(_) => true,
            ArchiveError::WriteFailure { .. } => false,
            ArchiveError::QueueFull { .. } => false,
            ArchiveError::UnknownSampleType { .. } => false,
            ArchiveError::InvalidPvName { .. } => false,
            ArchiveError::Shutdown => false,
            ArchiveError::Config(_) => false,
            ArchiveError::Toml(_) => false,
            ArchiveError::Json(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_timeout_is_retryable() {
        let err = ArchiveError::ConnectTimeout {
            pv: "X".to_string(),
            timeout_ms: 100,
        };
        assert!(err.is_retryable());
        assert_eq!(err.to_string(), "connect timeout after 100ms for X");
    }

    #[test]
    fn test_not_archivable_is_retryable() {
        let err = ArchiveError::NotArchivable { pv: "X".to_string() };
        assert!(err.is_retryable());
    }

    #[test]
    fn test_config_errors_are_not_retryable() {
        let err = ArchiveError::UnknownSampleType {
            pv: "X".to_string(),
            sample_type: "DBR_BOGUS".to_string(),
        };
        assert!(!err.is_retryable());
        assert!(!ArchiveError::Config("bad".to_string()).is_retryable());
        assert!(!ArchiveError::InvalidPvName { name: "".to_string() }.is_retryable());
    }

    #[test]
    fn test_queue_full_message() {
        let err = ArchiveError::QueueFull {
            pv: "X".to_string(),
            depth: 4,
        };
        assert!(!err.is_retryable());
        assert_eq!(err.to_string(), "sink queue for X full (4 samples)");
    }

    #[test]
    fn test_write_failure_message() {
        let err = ArchiveError::WriteFailure {
            pv: "X".to_string(),
            reason: "disk full".to_string(),
        };
        assert_eq!(err.to_string(), "write failure for X: disk full");
    }
}
