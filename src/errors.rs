//! Error types for the CDC agent
//! Structured error handling using thiserror; one variant per failure kind
//! so the top of the pipeline can log a meaningful cause before exiting.

use thiserror::Error;

/// Main error type for the replication-to-Kafka pipeline
///
/// There is no retry machinery behind any of these: every variant is fatal
/// to the process except where the pipeline explicitly says otherwise
/// (individual Kafka enqueue failures, flush failures that merely withhold
/// feedback for a cycle).
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// Database connection related errors
    #[error("database connection error: {message}")]
    Connection { message: String },

    /// Configuration related errors, surfaced before any LSN is advanced
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// Replication protocol errors: failed commands, short frames,
    /// unexpected copy-stream content
    #[error("replication protocol error: {message}")]
    Protocol { message: String },

    /// Structurally invalid pgoutput payload
    #[error("pgoutput decode error: {message}")]
    Decode { message: String },

    /// A pgoutput message type the engine does not support. Fatal so that
    /// enabling a new server feature cannot silently drop data.
    #[error("unsupported pgoutput message type '{0}'")]
    UnknownMessageType(char),

    /// Tuple data that does not fit its declared layout
    #[error("invalid tuple data: {message}")]
    InvalidTupleData { message: String },

    /// A row change referenced a relation the server never announced
    #[error("relation {0} referenced before the server announced it")]
    RelationNotFound(u32),

    /// Kafka producer errors
    #[error("kafka error")]
    Kafka(#[from] rdkafka::error::KafkaError),

    /// Event serialisation errors
    #[error("JSON serialisation error")]
    Json(#[from] serde_json::Error),

    /// Network/IO related errors
    #[error("I/O error")]
    Io(#[from] std::io::Error),

    /// C string conversion errors from the libpq boundary
    #[error("C string conversion error")]
    CStringConversion(#[from] std::ffi::NulError),
}

/// Result type alias for convenience
pub type ReplicationResult<T> = std::result::Result<T, ReplicationError>;

impl ReplicationError {
    /// Create a connection error
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a protocol error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create a decode error
    pub fn decode<S: Into<String>>(message: S) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }

    /// Create an invalid-tuple-data error
    pub fn tuple<S: Into<String>>(message: S) -> Self {
        Self::InvalidTupleData {
            message: message.into(),
        }
    }
}
