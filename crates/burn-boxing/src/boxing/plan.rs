use alloc::vec::Vec;
use core::fmt;
use serde::{Deserialize, Serialize};

use crate::sharding::{DeviceMesh, NdSbp, Sbp, ShardingSpec};

/// Which of the plan's meshes a step runs on.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub enum MeshSide {
    /// The mesh the tensor currently lives on.
    Source,
    /// The mesh the tensor is redistributed to.
    Destination,
}

/// The data movement that turns one axis descriptor into another.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub enum AxisTransform {
    /// Shards are left untouched.
    Identity,
    /// `S(dim) -> B`: gather the chunks of the group and concatenate them in coordinate order.
    AllGather {
        /// The split dim being gathered.
        dim: usize,
    },
    /// `S(from_dim) -> S(to_dim)`: re-partition within the group.
    AllToAll {
        /// The dim currently split.
        from_dim: usize,
        /// The dim split afterwards.
        to_dim: usize,
    },
    /// `B -> S(dim)`: keep the chunk owned by the local coordinate.
    LocalSlice {
        /// The dim to split.
        dim: usize,
    },
    /// `B -> P`: coordinate 0 keeps its copy, the others hold zeros.
    ZeroFill,
    /// `P -> B`: sum the partial values of the group.
    AllReduce,
    /// `P -> S(dim)`: sum the partial values, then keep the local chunk.
    ReduceScatter {
        /// The dim to split.
        dim: usize,
    },
}

impl AxisTransform {
    /// Whether the transform needs a collective.
    pub fn communicates(&self) -> bool {
        matches!(
            self,
            Self::AllGather { .. } | Self::AllToAll { .. } | Self::AllReduce | Self::ReduceScatter { .. }
        )
    }
}

impl fmt::Display for AxisTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Identity => f.write_str("identity"),
            Self::AllGather { dim } => write!(f, "all_gather(dim={dim})"),
            Self::AllToAll { from_dim, to_dim } => write!(f, "all_to_all({from_dim}->{to_dim})"),
            Self::LocalSlice { dim } => write!(f, "slice(dim={dim})"),
            Self::ZeroFill => f.write_str("zero_fill"),
            Self::AllReduce => f.write_str("all_reduce_sum"),
            Self::ReduceScatter { dim } => write!(f, "reduce_scatter(dim={dim})"),
        }
    }
}

/// One resolved mesh axis.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BoxingStep {
    /// The mesh the step runs on.
    pub side: MeshSide,
    /// The mesh axis being transformed.
    pub axis: usize,
    /// Descriptor of the axis before the step.
    pub from: Sbp,
    /// Descriptor of the axis after the step.
    pub to: Sbp,
    /// The data movement to perform.
    pub transform: AxisTransform,
    /// The whole distribution before the step.
    pub before: NdSbp,
    /// Estimated number of elements crossing the network, summed over all groups.
    pub transfer_elements: u64,
}

impl BoxingStep {
    /// The whole distribution after the step.
    pub fn after(&self) -> NdSbp {
        self.before.with_axis(self.axis, self.to)
    }
}

impl fmt::Display for BoxingStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} axis {}: {} -> {} by {}",
            self.side, self.axis, self.from, self.to, self.transform
        )
    }
}

/// How the planner gets from the source to the destination.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub enum BoxingRoute {
    /// Same mesh: every axis is transformed in place, outermost first.
    Direct,
    /// Different meshes over the same devices: broadcast everything on the source mesh, then
    /// carve the destination layout on the destination mesh.
    Regroup,
}

/// An ordered list of axis transforms, identical on every participant.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BoxingPlan {
    pub(crate) global_shape: Vec<usize>,
    pub(crate) source: ShardingSpec,
    pub(crate) destination: ShardingSpec,
    pub(crate) route: BoxingRoute,
    pub(crate) steps: Vec<BoxingStep>,
}

impl BoxingPlan {
    /// Logical shape of the tensor being redistributed.
    pub fn global_shape(&self) -> &[usize] {
        &self.global_shape
    }

    /// Where the tensor starts.
    pub fn source(&self) -> &ShardingSpec {
        &self.source
    }

    /// Where the tensor ends up.
    pub fn destination(&self) -> &ShardingSpec {
        &self.destination
    }

    /// The route taken.
    pub fn route(&self) -> BoxingRoute {
        self.route
    }

    /// Steps in execution order.
    pub fn steps(&self) -> &[BoxingStep] {
        &self.steps
    }

    /// The mesh a step on `side` runs on.
    pub fn mesh(&self, side: MeshSide) -> &DeviceMesh {
        match side {
            MeshSide::Source => self.source.device_mesh(),
            MeshSide::Destination => self.destination.device_mesh(),
        }
    }

    /// Whether executing the plan leaves every shard untouched.
    pub fn is_noop(&self) -> bool {
        self.steps
            .iter()
            .all(|step| step.transform == AxisTransform::Identity)
    }

    /// Estimated number of elements the whole plan moves across devices.
    pub fn transfer_elements(&self) -> u64 {
        self.steps.iter().map(|step| step.transfer_elements).sum()
    }
}

impl fmt::Display for BoxingPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} -> {} ({:?}, ~{} elements)",
            self.source,
            self.destination,
            self.route,
            self.transfer_elements()
        )?;
        for step in &self.steps {
            writeln!(f, "  {step}")?;
        }
        Ok(())
    }
}
