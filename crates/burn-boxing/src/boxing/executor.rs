use alloc::vec::Vec;
use burn_tensor::{BasicOps, Numeric, Tensor, TensorData, backend::Backend};

use super::{AxisTransform, BoxingPlan, BoxingStep};
use crate::collective::Collective;
use crate::sharding::{DeviceMesh, Sbp, layout};
use crate::{BoxingError, ConfigError};

/// Applies a [`BoxingPlan`] to the local shard of the calling participant.
///
/// Steps run strictly in plan order; a step that communicates blocks until every member of
/// its group reached the same step. The first failing step aborts the whole plan.
#[derive(Debug)]
pub struct BoxingExecutor<'a, C> {
    comm: &'a C,
}

impl<'a, C: Collective> BoxingExecutor<'a, C> {
    /// Creates an executor communicating through `comm`.
    pub fn new(comm: &'a C) -> Self {
        Self { comm }
    }

    /// Runs every step of `plan` on `local` and returns the new local shard.
    pub fn execute<B, const D: usize, K>(
        &self,
        plan: &BoxingPlan,
        local: Tensor<B, D, K>,
    ) -> Result<Tensor<B, D, K>, BoxingError>
    where
        B: Backend,
        K: Numeric<B>,
    {
        plan.steps()
            .iter()
            .try_fold(local, |local, step| self.execute_step(plan, step, local))
    }

    fn execute_step<B, const D: usize, K>(
        &self,
        plan: &BoxingPlan,
        step: &BoxingStep,
        local: Tensor<B, D, K>,
    ) -> Result<Tensor<B, D, K>, BoxingError>
    where
        B: Backend,
        K: Numeric<B>,
    {
        let rank = self.comm.rank();
        let mesh = plan.mesh(step.side);
        let coordinate = mesh
            .coordinate_of(rank)
            .ok_or(ConfigError::DeviceNotInMesh { rank })?;
        let axis = step.axis;
        let parts = mesh.extent(axis);
        let index = coordinate[axis];
        let level = layout::level_shape(plan.global_shape(), &step.before, mesh, &coordinate, axis)?;
        let group = mesh.group(axis, &coordinate);
        let device = local.device();
        let from_data = |data: Vec<TensorData>| {
            data.into_iter()
                .map(|data| Tensor::<B, D, K>::from_data(data, &device))
                .collect::<Vec<_>>()
        };
        log::trace!("rank {rank}: {step}");

        let output = match step.transform {
            AxisTransform::Identity => local,
            AxisTransform::LocalSlice { dim } => narrow_chunk(local, dim, level[dim], parts, index)?,
            AxisTransform::ZeroFill => zero_unless_first(local, index),
            AxisTransform::AllGather { dim } => {
                let gathered = self.comm.all_gather(&group, local.into_data())?;
                Tensor::cat(from_data(gathered), dim)
            }
            AxisTransform::AllToAll { from_dim, to_dim } => {
                let outgoing = (0..parts)
                    .map(|peer| {
                        narrow_chunk(local.clone(), to_dim, level[to_dim], parts, peer)
                            .map(|chunk| chunk.into_data())
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                let incoming = self.comm.all_to_all(&group, outgoing)?;
                Tensor::cat(from_data(incoming), from_dim)
            }
            AxisTransform::AllReduce => {
                let reduced = self.comm.all_reduce_sum(&group, local.into_data())?;
                Tensor::from_data(reduced, &device)
            }
            AxisTransform::ReduceScatter { dim } => {
                let reduced = self.comm.all_reduce_sum(&group, local.into_data())?;
                narrow_chunk(Tensor::from_data(reduced, &device), dim, level[dim], parts, index)?
            }
        };
        Ok(output)
    }
}

/// Keeps the chunk `index` out of `parts` of a tensor spanning `extent` along `dim`.
pub(crate) fn narrow_chunk<B, const D: usize, K>(
    tensor: Tensor<B, D, K>,
    dim: usize,
    extent: usize,
    parts: usize,
    index: usize,
) -> Result<Tensor<B, D, K>, ConfigError>
where
    B: Backend,
    K: BasicOps<B>,
{
    let range = layout::chunk_range(dim, extent, parts, index)?;
    Ok(tensor.narrow(dim, range.start, range.len()))
}

fn zero_unless_first<B, const D: usize, K>(tensor: Tensor<B, D, K>, index: usize) -> Tensor<B, D, K>
where
    B: Backend,
    K: Numeric<B>,
{
    if index == 0 { tensor } else { tensor.zeros_like() }
}

/// Cuts the shard of the device at `coordinate` out of a full copy of the tensor.
///
/// PartialSum axes keep the value on coordinate 0 and zeros elsewhere, so the sum over the
/// axis is the logical value.
pub(crate) fn carve<B, const D: usize, K>(
    global: Tensor<B, D, K>,
    global_shape: &[usize],
    sbps: &[Sbp],
    mesh: &DeviceMesh,
    coordinate: &[usize],
) -> Result<Tensor<B, D, K>, ConfigError>
where
    B: Backend,
    K: Numeric<B>,
{
    sbps.iter()
        .enumerate()
        .try_fold(global, |local, (axis, sbp)| match *sbp {
            Sbp::Split(dim) => {
                let level = layout::level_shape(global_shape, sbps, mesh, coordinate, axis)?;
                narrow_chunk(local, dim, level[dim], mesh.extent(axis), coordinate[axis])
            }
            Sbp::Broadcast => Ok(local),
            Sbp::PartialSum => Ok(zero_unless_first(local, coordinate[axis])),
        })
}
