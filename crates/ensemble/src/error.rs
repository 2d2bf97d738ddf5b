use crate::types::ActorAddress;

/// Errors that can occur in the cluster system.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("coordination error: {reason}")]
    Coordination {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("coordination node does not exist: {path}")]
    NoNode { path: String },

    #[error("coordination node already exists: {path}")]
    NodeExists { path: String },

    #[error("no leader elected in scope {scope}")]
    NoLeader { scope: String },

    #[error("persistence error: {reason}")]
    Persistence {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("invalid actor address {input:?}: {reason}")]
    InvalidAddress { input: String, reason: String },

    #[error("no actor at {path}")]
    ActorNotFound { path: String },

    #[error("an actor is already running at {path}")]
    ActorExists { path: String },

    #[error("mailbox closed for {address}")]
    MailboxClosed { address: ActorAddress },

    #[error("handler failed: {reason}")]
    HandlerFailed { reason: String },

    #[error("codec error: {reason}")]
    Codec {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("cluster is shutting down")]
    ShuttingDown,
}

impl ClusterError {
    /// Wrap a handler-level failure message.
    pub fn handler(reason: impl Into<String>) -> Self {
        ClusterError::HandlerFailed {
            reason: reason.into(),
        }
    }

    /// Copy of this error for delivery to several callers. Boxed sources are
    /// not carried over.
    pub(crate) fn replicate(&self) -> Self {
        match self {
            ClusterError::NoNode { path } => ClusterError::NoNode { path: path.clone() },
            ClusterError::NodeExists { path } => ClusterError::NodeExists { path: path.clone() },
            ClusterError::NoLeader { scope } => ClusterError::NoLeader {
                scope: scope.clone(),
            },
            ClusterError::ActorNotFound { path } => ClusterError::ActorNotFound { path: path.clone() },
            ClusterError::MailboxClosed { address } => ClusterError::MailboxClosed {
                address: address.clone(),
            },
            ClusterError::HandlerFailed { reason } => ClusterError::HandlerFailed {
                reason: reason.clone(),
            },
            ClusterError::ShuttingDown => ClusterError::ShuttingDown,
            ClusterError::Coordination { reason, .. } => ClusterError::Coordination {
                reason: reason.clone(),
                source: None,
            },
            ClusterError::Persistence { reason, .. } => ClusterError::Persistence {
                reason: reason.clone(),
                source: None,
            },
            other => ClusterError::HandlerFailed {
                reason: other.to_string(),
            },
        }
    }

    pub(crate) fn codec(context: &str, e: impl std::error::Error + Send + Sync + 'static) -> Self {
        ClusterError::Codec {
            reason: format!("{context}: {e}"),
            source: Some(Box::new(e)),
        }
    }
}

/// Encode a control message with MessagePack.
pub(crate) fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, ClusterError> {
    rmp_serde::to_vec(value).map_err(|e| ClusterError::codec("encode failed", e))
}

/// Decode a control message encoded with [`encode`].
pub(crate) fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, ClusterError> {
    rmp_serde::from_slice(bytes).map_err(|e| ClusterError::codec("decode failed", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let err = ClusterError::NoLeader {
            scope: "distributed-users-mike".into(),
        };
        assert_eq!(
            err.to_string(),
            "no leader elected in scope distributed-users-mike"
        );

        let err = ClusterError::NoNode {
            path: "/ensemble/cluster-demo".into(),
        };
        assert_eq!(
            err.to_string(),
            "coordination node does not exist: /ensemble/cluster-demo"
        );
    }

    #[test]
    fn replicate_keeps_variant_and_message() {
        let err = ClusterError::Coordination {
            reason: "connection lost".into(),
            source: Some(Box::new(std::io::Error::other("reset"))),
        };
        let copy = err.replicate();
        assert!(matches!(copy, ClusterError::Coordination { source: None, .. }));
        assert_eq!(copy.to_string(), err.to_string());
        assert!(matches!(
            ClusterError::ShuttingDown.replicate(),
            ClusterError::ShuttingDown
        ));
    }

    #[test]
    fn errors_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ClusterError>();
    }

    #[test]
    fn decode_garbage_is_codec_error() {
        let err = decode::<String>(&[0xc1]).unwrap_err();
        assert!(matches!(err, ClusterError::Codec { .. }));
    }
}
