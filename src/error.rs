/// Error types for the darknode crate
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DarknodeError {
    /// Invalid parameter provided (e.g. a threshold larger than the pool)
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    /// Configuration could not be loaded or failed validation
    #[error("configuration error: {0}")]
    Config(String),
    /// The epoch registry could not be read
    #[error("registry error: {0}")]
    Registry(String),
    /// An epoch timestamp cannot be represented as a wall-clock deadline
    #[error("cannot convert epoch timestamp: {0}")]
    TimestampConversion(String),
    /// The pool for a node could not be resolved
    #[error("pool error: {0}")]
    Pool(String),
    /// A peer channel could not be established
    #[error("router error: {0}")]
    Router(String),
    /// No live epoch process is registered for the node
    #[error("no live epoch route for node {0}")]
    NoRoute(String),
    /// A peer sent a computation whose delta fragment cannot be decoded
    #[error("malformed delta fragment from {peer}: {reason}")]
    MalformedFragment { peer: String, reason: String },
    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),
    /// Ledger discriminant outside the supported set
    #[error("invalid ledger: {0}")]
    InvalidLedger(i64),
    /// Atomic swap state machine violation
    #[error("swap error: {0}")]
    Swap(String),
    /// A collaborator is temporarily unreachable
    #[error("unavailable: {0}")]
    Unavailable(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<bincode::Error> for DarknodeError {
    fn from(err: bincode::Error) -> Self {
        DarknodeError::Serialization(err.to_string())
    }
}

impl From<ark_serialize::SerializationError> for DarknodeError {
    fn from(err: ark_serialize::SerializationError) -> Self {
        DarknodeError::Serialization(format!("{:?}", err))
    }
}
