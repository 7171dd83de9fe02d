use crate::session::SessionState;
use std::path::PathBuf;

/// Boxed engine or I/O error carried as a source.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Why a save-state operation was refused or failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateIoKind {
    #[error("no ROM loaded")]
    NoRomLoaded,
    #[error("slot {0} is outside 0..=9")]
    SlotOutOfRange(i32),
    #[error("could not prepare {}", .0.display())]
    Filesystem(PathBuf),
    #[error("engine could not serialize to {}", .0.display())]
    Serialize(PathBuf),
    #[error("engine could not restore from {}", .0.display())]
    Deserialize(PathBuf),
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("engine initialisation failed")]
    InitFailure(#[source] BoxError),

    #[error("failed to load ROM `{name}`")]
    LoadFailure {
        name: String,
        #[source]
        source: BoxError,
    },

    #[error("save state failed: {kind}")]
    StateIoFailure {
        kind: StateIoKind,
        #[source]
        source: Option<BoxError>,
    },

    #[error("{what} {value} is out of range")]
    InvalidArgument { what: &'static str, value: i64 },

    #[error("cannot {operation} while session is {state:?}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },

    #[error("failed to spawn {name} thread")]
    Spawn {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration in {}", path.display())]
    Config {
        path: PathBuf,
        #[source]
        source: BoxError,
    },
}

impl SessionError {
    pub(crate) fn state_io(kind: StateIoKind) -> Self {
        SessionError::StateIoFailure { kind, source: None }
    }

    pub(crate) fn state_io_with<E>(kind: StateIoKind, source: E) -> Self
    where
        E: Into<BoxError>,
    {
        SessionError::StateIoFailure {
            kind,
            source: Some(source.into()),
        }
    }

    /// The save-state failure reason, if this is a `StateIoFailure`.
    pub fn state_io_kind(&self) -> Option<&StateIoKind> {
        match self {
            SessionError::StateIoFailure { kind, .. } => Some(kind),
            _ => None,
        }
    }
}
