//! Collective communication used by the boxing executor.
//!
//! Collectives are rendezvous points: every member of the group must issue the same call, in
//! the same program order, before any of them returns. Payloads are backend agnostic
//! [`TensorData`] buffers.

use alloc::vec::Vec;
use burn_tensor::TensorData;
use core::fmt;
use core::time::Duration;
use thiserror::Error;

use crate::sharding::{DeviceGroup, Rank};

mod local;
mod reduce;

pub use local::*;
pub use reduce::sum_data;

/// The collective operations the executor relies on.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum CollectiveOp {
    /// Every member receives every member's buffer.
    AllGather,
    /// Member `m` receives part `m` of every member's buffer.
    AllToAll,
    /// Every member receives the elementwise sum of all buffers.
    AllReduceSum,
}

impl fmt::Display for CollectiveOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CollectiveOp::AllGather => f.write_str("all_gather"),
            CollectiveOp::AllToAll => f.write_str("all_to_all"),
            CollectiveOp::AllReduceSum => f.write_str("all_reduce_sum"),
        }
    }
}

/// A collective call that failed; the calling participant should abandon the redistribution.
#[derive(Error, Clone, Debug)]
pub enum CollectiveError {
    /// The caller is not a member of the group it addressed.
    #[error("rank {rank} is not a member of group {group:?}")]
    NotInGroup {
        /// The calling rank.
        rank: Rank,
        /// The group it addressed.
        group: Vec<Rank>,
    },

    /// Not every peer reached the collective in time.
    #[error("{op} on group {group:?} timed out after {waited:?}")]
    Timeout {
        /// The collective that was waited on.
        op: CollectiveOp,
        /// The group of the collective.
        group: Vec<Rank>,
        /// How long the caller waited.
        waited: Duration,
    },

    /// Peers issued different collectives at the same point of the program.
    #[error("rank {rank} issued {found} while its peers issued {expected} on group {group:?}")]
    Mismatch {
        /// The rank that diverged.
        rank: Rank,
        /// The collective its peers issued.
        expected: CollectiveOp,
        /// The collective it issued.
        found: CollectiveOp,
        /// The group of the collective.
        group: Vec<Rank>,
    },

    /// Another member failed the collective, so nobody completes it.
    #[error("{op} on group {group:?} was aborted by a failing peer")]
    Aborted {
        /// The abandoned collective.
        op: CollectiveOp,
        /// The group of the collective.
        group: Vec<Rank>,
    },

    /// An all-to-all was given the wrong number of parts.
    #[error("all_to_all on a group of {expected} needs {expected} parts, got {got}")]
    PartCount {
        /// Size of the group.
        expected: usize,
        /// Number of parts given.
        got: usize,
    },

    /// Payloads could not be combined.
    #[error("invalid payload: {0}")]
    Payload(String),

    /// A participant panicked while holding the fabric.
    #[error("the communication fabric is poisoned")]
    Poisoned,
}

/// The collective-communication layer, as seen by one participant.
///
/// Implementations address peers through [`DeviceGroup`]s; results are always ordered like
/// the group.
pub trait Collective {
    /// Rank of the calling participant.
    fn rank(&self) -> Rank;

    /// Gathers the buffer of every member of `group`, in group order.
    fn all_gather(
        &self,
        group: &DeviceGroup,
        local: TensorData,
    ) -> Result<Vec<TensorData>, CollectiveError>;

    /// Sends `parts[m]` to member `m` and returns the parts addressed to the caller, in
    /// group order.
    fn all_to_all(
        &self,
        group: &DeviceGroup,
        parts: Vec<TensorData>,
    ) -> Result<Vec<TensorData>, CollectiveError>;

    /// Sums the buffers of every member elementwise, in the buffers' dtype.
    fn all_reduce_sum(
        &self,
        group: &DeviceGroup,
        local: TensorData,
    ) -> Result<TensorData, CollectiveError>;
}
