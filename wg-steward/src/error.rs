// Engine error taxonomy

//! Error types shared by every engine component
//!
//! The daemon binary keeps using `anyhow` for start-up plumbing; everything
//! reachable from the library API reports one of these variants so callers
//! (the HTTP layer, the job scheduler) can tell a rejected input from a
//! failed external command or a broken store.

use std::fmt;

/// Kind of object a lookup failed for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Missing {
    /// Unknown configuration name
    Configuration,
    /// Unknown peer public key
    Peer,
    /// Unknown backup file
    Backup,
    /// Unknown job id
    Job,
    /// Unknown share link id
    ShareLink,
}

impl fmt::Display for Missing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Missing::Configuration => "configuration",
            Missing::Peer => "peer",
            Missing::Backup => "backup",
            Missing::Job => "job",
            Missing::ShareLink => "share link",
        };
        f.write_str(s)
    }
}

/// Engine error
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Configuration file is malformed or lacks an `[Interface]` section
    #[error("invalid configuration file {path}: {reason}")]
    Parse {
        /// File that failed to parse
        path: String,
        /// What was wrong with it
        reason: String,
    },

    /// The tunnel utility exited non-zero; `detail` is its output verbatim
    #[error("{command} failed: {detail}")]
    ExternalCommand {
        /// Command line that was run
        command: String,
        /// Captured stderr (or stdout when stderr was empty)
        detail: String,
    },

    /// Input rejected before any side effect took place
    #[error("{0}")]
    Validation(String),

    /// Persistence failure
    #[error("database error: {0}")]
    Store(#[from] sqlx::Error),

    /// Unknown configuration, peer, backup, job or share link
    #[error("{kind} not found: {name}")]
    NotFound {
        /// What kind of object was looked up
        kind: Missing,
        /// The name or id that was requested
        name: String,
    },

    /// Filesystem failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An edit failed and restoring the previous state failed as well
    #[error("{original}; rollback also failed: {rollback}")]
    Rollback {
        /// Error that triggered the rollback
        original: String,
        /// Error raised while rolling back
        rollback: String,
    },

    /// Backup archive could not be written
    #[error("archive error: {0}")]
    Zip(#[from] zip::result::ZipError),
}

impl Error {
    pub(crate) fn not_found(kind: Missing, name: impl Into<String>) -> Self {
        Error::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    /// True for errors a caller should render as "not found"
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }
}

/// Result alias used across the engine
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_message() {
        let err = Error::not_found(Missing::Peer, "abc=");
        assert_eq!(err.to_string(), "peer not found: abc=");
        assert!(err.is_not_found());
    }

    #[test]
    fn test_external_command_message_is_verbatim() {
        let err = Error::ExternalCommand {
            command: "wg-quick up wg0".to_string(),
            detail: "RTNETLINK answers: Operation not permitted".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "wg-quick up wg0 failed: RTNETLINK answers: Operation not permitted"
        );
        assert!(!err.is_not_found());
    }

    #[test]
    fn test_rollback_carries_both_messages() {
        let err = Error::Rollback {
            original: "bad file".to_string(),
            rollback: "disk full".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("bad file"));
        assert!(msg.contains("disk full"));
    }
}
