use alloc::vec::Vec;
use burn_tensor::{Numeric, Tensor, backend::Backend};
use hashbrown::HashMap;

use crate::ConfigError;
use crate::sharding::{Rank, Sbp, ShardingSpec};

/// Rebuilds the logical tensor from the shards of every device of the mesh.
///
/// Mesh axes are collapsed from the innermost one out: split axes are concatenated in
/// coordinate order, broadcast axes keep the copy of coordinate 0, and partial-sum axes are
/// summed in coordinate order.
///
/// This gathers everything in one place and is meant for checking redistributions, not for
/// production data paths.
pub fn reconstruct<B, const D: usize, K>(
    shards: Vec<(Rank, Tensor<B, D, K>)>,
    sharding_spec: &ShardingSpec,
) -> Result<Tensor<B, D, K>, ConfigError>
where
    B: Backend,
    K: Numeric<B>,
{
    let mesh = sharding_spec.device_mesh();
    let mut by_rank = shards.into_iter().collect::<HashMap<_, _>>();
    let mut level = mesh
        .coordinates()
        .map(|coordinate| {
            let rank = mesh.device_at(&coordinate);
            by_rank
                .remove(&rank)
                .ok_or(ConfigError::MissingShard { rank })
        })
        .collect::<Result<Vec<_>, _>>()?;

    for (axis, sbp) in sharding_spec.nd_sbp().iter().enumerate().rev() {
        let extent = mesh.extent(axis);
        let mut groups = level.into_iter();
        let mut collapsed = Vec::with_capacity(mesh.num_devices() / extent);
        while let Some(tensor) = collapse(groups.by_ref().take(extent), *sbp) {
            collapsed.push(tensor);
        }
        level = collapsed;
    }

    // A mesh always has at least one device, so a single tensor is left.
    let rank = mesh.devices()[0];
    level.pop().ok_or(ConfigError::MissingShard { rank })
}

/// Merges one group of coordinates along a mesh axis, or `None` once the level is drained.
fn collapse<B, const D: usize, K, I>(mut group: I, sbp: Sbp) -> Option<Tensor<B, D, K>>
where
    B: Backend,
    K: Numeric<B>,
    I: Iterator<Item = Tensor<B, D, K>>,
{
    match sbp {
        Sbp::Split(dim) => {
            let chunks = group.collect::<Vec<_>>();
            (!chunks.is_empty()).then(|| Tensor::cat(chunks, dim))
        }
        Sbp::Broadcast => {
            let first = group.next();
            group.for_each(drop);
            first
        }
        Sbp::PartialSum => group.reduce(|acc, part| acc.add(part)),
    }
}
