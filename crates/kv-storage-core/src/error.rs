/// Coarse classification of a [`StorageError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Failure reported by the worker or the transport behind it.
    Transport,
    /// Local optimistic-concurrency rejection; never reached the network.
    StaleVersion,
}

/// Errors surfaced on the failure branch of a token.
///
/// `Clone` because a single failure is delivered to every callback registered
/// on a shared token.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    /// Non-success envelope, network failure or payload decoding failure.
    /// The reason text is kept verbatim.
    #[error("{0}")]
    Transport(String),

    /// Save or delete attempted on a bucket that has not observed the latest
    /// manifest version.
    #[error(
        "bucket {key} is stale (observed version {observed}, manifest version {manifest})"
    )]
    StaleVersion {
        key: String,
        observed: u64,
        manifest: u64,
    },
}

impl StorageError {
    /// Build a transport failure from anything printable.
    pub fn transport(reason: impl std::fmt::Display) -> Self {
        Self::Transport(reason.to_string())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport(_) => ErrorKind::Transport,
            Self::StaleVersion { .. } => ErrorKind::StaleVersion,
        }
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        Self::Transport(format!("Invalid payload: {}", e))
    }
}
