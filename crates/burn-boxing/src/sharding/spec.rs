use alloc::vec::Vec;
use core::fmt;
use core::ops::Deref;
use serde::{Deserialize, Serialize};

use super::{DeviceMesh, layout};
use crate::ConfigError;

/// Specifies how a tensor is distributed along a single mesh axis.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub enum Sbp {
    /// The tensor is partitioned along the given tensor dim, one contiguous chunk per
    /// coordinate of the mesh axis.
    Split(usize),
    /// Every coordinate of the mesh axis holds the same copy.
    Broadcast,
    /// Every coordinate holds a partial value; the logical value is their elementwise sum.
    PartialSum,
}

impl Sbp {
    /// The tensor dim this descriptor splits, if any.
    pub fn split_dim(&self) -> Option<usize> {
        match self {
            Sbp::Split(dim) => Some(*dim),
            _ => None,
        }
    }
}

impl fmt::Display for Sbp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sbp::Split(dim) => write!(f, "S({dim})"),
            Sbp::Broadcast => f.write_str("B"),
            Sbp::PartialSum => f.write_str("P"),
        }
    }
}

/// One [`Sbp`] per mesh axis, outermost axis first.
#[derive(Clone, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct NdSbp(Vec<Sbp>);

impl NdSbp {
    /// Creates a distribution from per-axis descriptors.
    pub fn new<S: Into<Vec<Sbp>>>(sbps: S) -> Self {
        Self(sbps.into())
    }

    /// Every axis broadcast.
    pub fn broadcast(ndim: usize) -> Self {
        Self(alloc::vec![Sbp::Broadcast; ndim])
    }

    /// Returns a copy with `axis` set to `sbp`.
    pub fn with_axis(&self, axis: usize, sbp: Sbp) -> Self {
        let mut sbps = self.0.clone();
        sbps[axis] = sbp;
        Self(sbps)
    }

    /// The first mesh axis after `axis` that splits tensor dim `dim`.
    pub fn inner_split_axis(&self, axis: usize, dim: usize) -> Option<usize> {
        self.0
            .iter()
            .enumerate()
            .skip(axis + 1)
            .find_map(|(inner, sbp)| (sbp.split_dim() == Some(dim)).then_some(inner))
    }
}

impl Deref for NdSbp {
    type Target = [Sbp];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<Vec<Sbp>> for NdSbp {
    fn from(sbps: Vec<Sbp>) -> Self {
        Self(sbps)
    }
}

impl<const N: usize> From<[Sbp; N]> for NdSbp {
    fn from(sbps: [Sbp; N]) -> Self {
        Self(sbps.to_vec())
    }
}

impl fmt::Display for NdSbp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (idx, sbp) in self.0.iter().enumerate() {
            if idx > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{sbp}")?;
        }
        f.write_str(")")
    }
}

/// Describes how a tensor is distributed across devices
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShardingSpec {
    /// Distribution for each mesh axis
    nd_sbp: NdSbp,
    /// Description of the device mesh
    device_mesh: DeviceMesh,
}

impl ShardingSpec {
    /// Pairs a distribution with a mesh, one descriptor per mesh axis.
    pub fn new<S: Into<NdSbp>>(nd_sbp: S, device_mesh: DeviceMesh) -> Result<Self, ConfigError> {
        let nd_sbp = nd_sbp.into();
        if nd_sbp.len() != device_mesh.ndim() {
            return Err(ConfigError::DistributionRank {
                expected: device_mesh.ndim(),
                got: nd_sbp.len(),
            });
        }
        Ok(Self {
            nd_sbp,
            device_mesh,
        })
    }

    /// The per-axis distribution.
    pub fn nd_sbp(&self) -> &NdSbp {
        &self.nd_sbp
    }

    /// The device mesh.
    pub fn device_mesh(&self) -> &DeviceMesh {
        &self.device_mesh
    }

    /// Checks that every device of the mesh gets a non-empty shard of `global_shape`.
    pub fn validate(&self, global_shape: &[usize]) -> Result<(), ConfigError> {
        layout::validate(global_shape, &self.nd_sbp, &self.device_mesh)
    }

    /// Shape of the shard held by the device at `coordinate`.
    pub fn shard_shape(
        &self,
        global_shape: &[usize],
        coordinate: &[usize],
    ) -> Result<Vec<usize>, ConfigError> {
        layout::shard_shape(global_shape, &self.nd_sbp, &self.device_mesh, coordinate)
    }
}

impl fmt::Display for ShardingSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on {}", self.nd_sbp, self.device_mesh)
    }
}
