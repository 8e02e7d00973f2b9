//! Planning and execution of redistributions between distributions.
//!
//! Redistributing a tensor takes two phases. The [`BoxingPlanner`] turns a source and a
//! destination [`ShardingSpec`](crate::sharding::ShardingSpec) into a [`BoxingPlan`] without
//! looking at any data, and every participant derives the same plan. The [`BoxingExecutor`]
//! then applies the plan to the local shard, talking to the other participants through a
//! [`Collective`].

mod executor;
mod plan;
mod planner;

pub use executor::*;
pub use plan::*;
pub use planner::*;

pub(crate) use executor::carve;

use burn_tensor::{Numeric, backend::Backend};

use crate::collective::Collective;
use crate::sharding::{DeviceMesh, NdSbp, ShardingSpec};
use crate::{BoxingError, ConsistentTensor};

/// Redistributes `tensor` to `nd_sbp` over `mesh` with the default planner.
///
/// Every device of both meshes must call this with the same arguments.
pub fn redistribute<B, const D: usize, K, C, S>(
    tensor: &ConsistentTensor<B, D, K>,
    nd_sbp: S,
    mesh: DeviceMesh,
    comm: &C,
) -> Result<ConsistentTensor<B, D, K>, BoxingError>
where
    B: Backend,
    K: Numeric<B>,
    C: Collective,
    S: Into<NdSbp>,
{
    let destination = ShardingSpec::new(nd_sbp, mesh)?;
    tensor.redistribute_with(&BoxingPlanner::default(), destination, comm)
}
