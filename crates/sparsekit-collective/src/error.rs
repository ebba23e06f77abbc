use std::time::Duration;

use thiserror::Error;

use crate::CollectiveOp;

/// Failures of a collective operation.
///
/// Any of these is fatal for the step that issued the collective: results
/// are never partially delivered, and recovery means re-issuing the step.
#[derive(Debug, Error)]
pub enum CommunicationError {
    /// A peer's channel is closed.
    #[error("worker {rank}: peer {peer} is unreachable during {op}")]
    PeerUnreachable {
        /// Rank reporting the failure.
        rank: usize,
        /// Unreachable peer.
        peer: usize,
        /// Collective in progress.
        op: CollectiveOp,
    },

    /// Not every peer delivered its contribution in time.
    #[error("worker {rank}: {op} round {round} timed out after {after:?} (missing peers: {missing:?})")]
    Timeout {
        /// Rank reporting the failure.
        rank: usize,
        /// Collective in progress.
        op: CollectiveOp,
        /// Round number of the collective.
        round: u64,
        /// Configured timeout.
        after: Duration,
        /// Peers that had not delivered.
        missing: Vec<usize>,
    },

    /// A peer sent something that does not belong to the current collective.
    #[error("worker {rank}: malformed message from peer {peer}: {reason}")]
    MalformedMessage {
        /// Rank reporting the failure.
        rank: usize,
        /// Offending peer.
        peer: usize,
        /// What was wrong.
        reason: String,
    },

    /// A peer entered the collective only to report that its step failed.
    #[error("worker {rank}: peer {peer} aborted the step: {reason}")]
    PeerAborted {
        /// Rank reporting the failure.
        rank: usize,
        /// Peer that aborted.
        peer: usize,
        /// Reason given by the peer.
        reason: String,
    },

    /// The collective was invoked with arguments inconsistent with the group.
    #[error("invalid collective call: {0}")]
    InvalidArgument(String),
}

/// Result type for collective operations.
pub type CommResult<T> = Result<T, CommunicationError>;
