//! Error types for gateway core operations
//!
//! Transient broker failures are mostly absorbed inside the link manager
//! (buffer and retry). The variants here surface where a caller has to
//! react: contract violations, validation failures, storage failures and
//! lifecycle misuse.

use thiserror::Error;

/// Main error type for gateway core operations
#[derive(Error, Debug)]
pub enum LinkError {
    // ===== Broker/Transport Errors =====
    /// Broker refused or failed the connection
    #[error("Broker connection failed: {0}")]
    ConnectFailed(String),

    /// Connection attempt did not finish in time
    #[error("Connection timeout after {duration_ms}ms")]
    ConnectionTimeout {
        /// Timeout duration in milliseconds
        duration_ms: u64,
    },

    /// Subscribe request failed
    #[error("Subscribe to {topic} failed: {reason}")]
    SubscribeFailed {
        /// Topic that could not be subscribed
        topic: String,
        /// Failure reason
        reason: String,
    },

    /// Publish could not be handed to the broker
    #[error("Publish failed: {0}")]
    PublishFailed(String),

    /// Broker answered a publish with a non-success reason code
    #[error("Publish rejected by broker: reason code {code}")]
    PublishRejected {
        /// Broker reason code
        code: u8,
    },

    /// Link is not connected
    #[error("MQTT link disconnected")]
    Disconnected,

    /// TLS setup failed
    #[error("TLS configuration error: {0}")]
    Tls(String),

    // ===== Protocol/Validation Errors =====
    /// Device public key has the wrong length
    #[error("Invalid public key length: expected 32 bytes, got {len}")]
    InvalidPublicKey {
        /// Actual key length
        len: usize,
    },

    /// Mesh envelope could not be decoded
    #[error("Envelope decode error: {0}")]
    EnvelopeDecode(String),

    /// Envelope decoded but is missing required parts
    #[error("Invalid envelope: {0}")]
    InvalidEnvelope(String),

    // ===== Storage Errors =====
    /// Persistent storage failure
    #[error("Storage error: {0}")]
    Storage(String),

    // ===== Lifecycle Errors =====
    /// Component has been shut down
    #[error("{0} has been shut down")]
    ShutDown(&'static str),

    /// Component's background task is already running
    #[error("{0} is already running")]
    AlreadyRunning(&'static str),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// IO error wrapper
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl LinkError {
    /// Check if this error is transient and worth retrying
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            LinkError::ConnectFailed(_)
                | LinkError::ConnectionTimeout { .. }
                | LinkError::SubscribeFailed { .. }
                | LinkError::PublishFailed(_)
                | LinkError::PublishRejected { .. }
                | LinkError::Disconnected
        )
    }

    /// Check if this is a validation error (bad input from a caller)
    pub fn is_validation_error(&self) -> bool {
        matches!(
            self,
            LinkError::InvalidPublicKey { .. }
                | LinkError::EnvelopeDecode(_)
                | LinkError::InvalidEnvelope(_)
        )
    }

    /// Get an error code for logging
    pub fn error_code(&self) -> &'static str {
        match self {
            LinkError::ConnectFailed(_) => "CONNECT_FAILED",
            LinkError::ConnectionTimeout { .. } => "CONNECTION_TIMEOUT",
            LinkError::SubscribeFailed { .. } => "SUBSCRIBE_FAILED",
            LinkError::PublishFailed(_) => "PUBLISH_FAILED",
            LinkError::PublishRejected { .. } => "PUBLISH_REJECTED",
            LinkError::Disconnected => "DISCONNECTED",
            LinkError::Tls(_) => "TLS_ERROR",
            LinkError::InvalidPublicKey { .. } => "INVALID_PUBLIC_KEY",
            LinkError::EnvelopeDecode(_) => "ENVELOPE_DECODE",
            LinkError::InvalidEnvelope(_) => "INVALID_ENVELOPE",
            LinkError::Storage(_) => "STORAGE_ERROR",
            LinkError::ShutDown(_) => "SHUT_DOWN",
            LinkError::AlreadyRunning(_) => "ALREADY_RUNNING",
            LinkError::InvalidConfig(_) => "INVALID_CONFIG",
            LinkError::Internal(_) => "INTERNAL_ERROR",
            LinkError::Io(_) => "IO_ERROR",
        }
    }
}

/// Result type alias for gateway core operations
pub type Result<T> = std::result::Result<T, LinkError>;

impl From<prost::DecodeError> for LinkError {
    fn from(err: prost::DecodeError) -> Self {
        LinkError::EnvelopeDecode(err.to_string())
    }
}

impl From<rumqttc::ClientError> for LinkError {
    fn from(err: rumqttc::ClientError) -> Self {
        LinkError::PublishFailed(err.to_string())
    }
}

impl From<rumqttc::ConnectionError> for LinkError {
    fn from(err: rumqttc::ConnectionError) -> Self {
        LinkError::ConnectFailed(err.to_string())
    }
}

impl From<native_tls::Error> for LinkError {
    fn from(err: native_tls::Error) -> Self {
        LinkError::Tls(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(LinkError::Disconnected.error_code(), "DISCONNECTED");
        assert_eq!(
            LinkError::InvalidPublicKey { len: 31 }.error_code(),
            "INVALID_PUBLIC_KEY"
        );
    }

    #[test]
    fn test_is_retriable() {
        assert!(LinkError::Disconnected.is_retriable());
        assert!(LinkError::PublishRejected { code: 0x87 }.is_retriable());
        assert!(!LinkError::InvalidPublicKey { len: 33 }.is_retriable());
        assert!(!LinkError::ShutDown("link manager").is_retriable());
    }

    #[test]
    fn test_is_validation_error() {
        assert!(LinkError::InvalidPublicKey { len: 0 }.is_validation_error());
        assert!(LinkError::EnvelopeDecode("bad".to_string()).is_validation_error());
        assert!(!LinkError::Disconnected.is_validation_error());
    }

    #[test]
    fn test_component_named_in_message() {
        let err = LinkError::AlreadyRunning("dispatcher");
        assert_eq!(err.to_string(), "dispatcher is already running");
        assert_eq!(err.error_code(), "ALREADY_RUNNING");
        assert_eq!(
            LinkError::ShutDown("link manager").to_string(),
            "link manager has been shut down"
        );
    }

    #[test]
    fn test_public_key_message() {
        let err = LinkError::InvalidPublicKey { len: 31 };
        assert!(err.to_string().contains("31"));
        assert!(err.to_string().contains("32"));
    }
}
