//! Error types for the sync engine
//!
//! Only a few boundaries return errors. Mutation APIs on the state store, the
//! batcher and the event bus log and absorb failures instead.

/// Failure to construct a Quick Tab from its required fields.
///
/// This is a programming error on the caller's side (a malformed entity was
/// handed to the engine), not a runtime condition.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EntityError {
    /// A required field was absent
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    /// A required field was present but unusable
    #[error("invalid field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    /// The value could not be decoded as a Quick Tab at all
    #[error("malformed quick tab: {0}")]
    Malformed(String),
}

/// Errors surfaced by a key-value storage area.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    /// The write would exceed the area's capacity quota
    #[error("storage quota exceeded: {needed} bytes needed, quota is {quota}")]
    QuotaExceeded { needed: usize, quota: usize },

    /// The area cannot be reached right now
    #[error("storage area unavailable: {0}")]
    Unavailable(String),

    /// A stored value could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

/// Errors raised by the underlying cross-context transport.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Nothing is listening on the other side
    #[error("no receiving endpoint")]
    NoReceiver,

    /// Any other transport failure, carrying the raw message
    #[error("transport failure: {0}")]
    Failed(String),
}

impl TransportError {
    /// Whether this failure means the peer is gone rather than broken.
    ///
    /// Browser runtimes report a missing receiver as a plain error string, so
    /// `Failed` messages are matched against the known phrasings too.
    pub fn is_disconnected(&self) -> bool {
        match self {
            TransportError::NoReceiver => true,
            TransportError::Failed(message) => {
                let message = message.to_ascii_lowercase();
                message.contains("receiving end does not exist")
                    || message.contains("could not establish connection")
                    || message.contains("no receiving endpoint")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disconnected_classification() {
        assert!(TransportError::NoReceiver.is_disconnected());
        assert!(TransportError::Failed(
            "Could not establish connection. Receiving end does not exist.".into()
        )
        .is_disconnected());
        assert!(!TransportError::Failed("boom".into()).is_disconnected());
    }

    #[test]
    fn test_display() {
        let err = StorageError::QuotaExceeded {
            needed: 20,
            quota: 10,
        };
        assert_eq!(
            err.to_string(),
            "storage quota exceeded: 20 bytes needed, quota is 10"
        );
        assert_eq!(
            EntityError::MissingField("id").to_string(),
            "missing required field: id"
        );
    }
}
