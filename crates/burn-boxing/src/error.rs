use alloc::vec::Vec;
use burn_tensor::DType;
use core::fmt;
use thiserror::Error;

use crate::collective::CollectiveError;
use crate::sharding::{DeviceMeshError, Rank, Sbp};

/// Malformed inputs, detected before any device communicates.
#[derive(Error, Clone, Debug)]
pub enum ConfigError {
    /// A global shape with a zero extent.
    #[error("global shape must have positive extents, got {shape:?}")]
    NonPositiveShape {
        /// The offending global shape.
        shape: Vec<usize>,
    },

    /// The distribution does not have one descriptor per mesh axis.
    #[error("distribution has {got} descriptors but the mesh has {expected} axes")]
    DistributionRank {
        /// Number of mesh axes.
        expected: usize,
        /// Number of descriptors.
        got: usize,
    },

    /// A split names a dim the tensor does not have.
    #[error("split dim {dim} is out of range for a tensor of rank {rank}")]
    SplitDimOutOfRange {
        /// The split tensor dim.
        dim: usize,
        /// Rank of the tensor.
        rank: usize,
    },

    /// An extent is smaller than the number of parts it is split into.
    #[error("cannot split extent {extent} of dim {dim} into {parts} non-empty parts")]
    SplitTooSmall {
        /// The split tensor dim.
        dim: usize,
        /// Extent of `dim` at the level of the split.
        extent: usize,
        /// Number of devices sharing `dim`.
        parts: usize,
    },

    /// The global shape disagrees with the tensor rank.
    #[error("global shape {shape:?} does not have the tensor rank {expected}")]
    TensorRank {
        /// Rank of the tensor type.
        expected: usize,
        /// The global shape given.
        shape: Vec<usize>,
    },

    /// A local shard does not have the shape its layout requires.
    #[error("local shard has shape {got:?} but the layout requires {expected:?}")]
    ShardShapeMismatch {
        /// Shape implied by the layout.
        expected: Vec<usize>,
        /// Shape of the given shard.
        got: Vec<usize>,
    },

    /// The calling device is not a member of the mesh.
    #[error("device {rank} is not part of the mesh")]
    DeviceNotInMesh {
        /// The calling device.
        rank: Rank,
    },

    /// A communicator was used for a shard owned by another device.
    #[error("communicator of rank {communicator} cannot drive the shard owned by rank {owner}")]
    RankMismatch {
        /// Device owning the shard.
        owner: Rank,
        /// Device of the communicator.
        communicator: Rank,
    },

    /// Reconstruction lacks the shard of a device.
    #[error("no shard was provided for device {rank}")]
    MissingShard {
        /// Device without a shard.
        rank: Rank,
    },

    /// Fill values do not exist for the dtype.
    #[error("fill values are not defined for dtype {dtype:?}")]
    UnsupportedFillDType {
        /// The requested dtype.
        dtype: DType,
    },

    /// The mesh itself is malformed.
    #[error(transparent)]
    DeviceMesh(#[from] DeviceMeshError),
}

/// Why the planner could not resolve an axis transform.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum UnimplementedReason {
    /// No rule exists for the descriptor pair, e.g. `S(d) -> P`.
    NoRule,
    /// The transform touches tensor dim `dim`, which a later mesh axis still splits.
    NestedSplit {
        /// The contended tensor dim.
        dim: usize,
        /// The later mesh axis splitting `dim`.
        inner_axis: usize,
    },
    /// The meshes differ and cannot be regrouped into one another.
    MeshChange,
}

impl fmt::Display for UnimplementedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoRule => f.write_str("no boxing rule"),
            Self::NestedSplit { dim, inner_axis } => {
                write!(f, "dim {dim} is still split by mesh axis {inner_axis}")
            }
            Self::MeshChange => f.write_str("meshes cannot be regrouped"),
        }
    }
}

/// The planner has no rule for a requested transform.
///
/// This is an expected outcome, not a crash: callers enumerating distributions branch on it.
#[derive(Error, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[error("unimplemented boxing on mesh axis {axis}: {from} -> {to} ({reason})")]
pub struct UnimplementedBoxing {
    /// The offending mesh axis.
    pub axis: usize,
    /// Descriptor the axis holds.
    pub from: Sbp,
    /// Descriptor the axis was asked to reach.
    pub to: Sbp,
    /// Why no transform exists.
    pub reason: UnimplementedReason,
}

/// Errors returned by [`redistribute`](crate::redistribute) and the boxing planner/executor.
#[derive(Error, Clone, Debug)]
pub enum BoxingError {
    /// Malformed shapes, distributions or meshes.
    #[error("invalid boxing configuration: {0}")]
    Configuration(#[from] ConfigError),

    /// No boxing route exists for the requested pair.
    #[error(transparent)]
    Unimplemented(#[from] UnimplementedBoxing),

    /// A collective failed or timed out; the redistribution was abandoned.
    #[error("collective communication failed: {0}")]
    Communication(#[from] CollectiveError),
}

impl BoxingError {
    /// Whether this is the enumerable "no rule" outcome.
    pub fn is_unimplemented(&self) -> bool {
        matches!(self, Self::Unimplemented(_))
    }

    /// The unimplemented transform, if that is what failed.
    pub fn unimplemented(&self) -> Option<&UnimplementedBoxing> {
        match self {
            Self::Unimplemented(unimplemented) => Some(unimplemented),
            _ => None,
        }
    }
}

impl From<DeviceMeshError> for BoxingError {
    fn from(err: DeviceMeshError) -> Self {
        Self::Configuration(err.into())
    }
}
