use thiserror::Error;

use crate::partition::PartitionKey;
use crate::progress::BatchId;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("Invalid Argument - {0}")]
    InvalidArgument(String),

    #[error("Unresolved Position - no offset, sequence number or enqueued time is set")]
    UnresolvedPosition,

    #[error("Latest Position Unavailable - partitions {}", display_partitions(.0))]
    LatestPositionUnavailable(Vec<PartitionKey>),

    #[error("Stale Commit - batch {batch_id} is not after the last committed batch {last_committed}")]
    StaleCommit {
        batch_id: BatchId,
        last_committed: BatchId,
    },

    #[error("Checkpoint Write Error - {0}")]
    CheckpointWrite(String),

    #[error("Corrupt Checkpoint - artifact {artifact}: {reason}")]
    CorruptCheckpoint { artifact: String, reason: String },

    #[error("Client Error - {0}")]
    Client(String),

    #[error("Sink Error - {0}")]
    Sink(String),

    #[error("Config Error - {0}")]
    Config(String),

    #[error("Metrics Error - {0}")]
    Metrics(String),
}

impl Error {
    /// Transient errors only cost the current tick; the caller retries on the next one. Everything
    /// else needs an operator or a job-level restart.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::LatestPositionUnavailable(_) | Error::Client(_) | Error::Sink(_)
        )
    }
}

fn display_partitions(partitions: &[PartitionKey]) -> String {
    partitions
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let unavailable = Error::LatestPositionUnavailable(vec![PartitionKey::new("hub", 0)]);
        assert!(unavailable.is_transient());
        assert!(Error::Client("timeout".to_string()).is_transient());

        let stale = Error::StaleCommit {
            batch_id: 3,
            last_committed: 3,
        };
        assert!(!stale.is_transient());
        assert!(
            !Error::CorruptCheckpoint {
                artifact: "checkpoint-1".to_string(),
                reason: "digest mismatch".to_string(),
            }
            .is_transient()
        );
    }

    #[test]
    fn test_unavailable_lists_partitions() {
        let err = Error::LatestPositionUnavailable(vec![
            PartitionKey::new("hub", 0),
            PartitionKey::new("hub", 3),
        ]);
        assert_eq!(
            err.to_string(),
            "Latest Position Unavailable - partitions hub/0, hub/3"
        );
    }
}
