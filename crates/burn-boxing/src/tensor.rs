use alloc::vec::Vec;
use burn_tensor::{DType, Float, Numeric, Tensor, TensorData, TensorKind, backend::Backend};

use crate::boxing::{BoxingExecutor, BoxingPlanner, carve};
use crate::collective::Collective;
use crate::sharding::{DeviceMesh, NdSbp, Rank, Sbp, ShardingSpec};
use crate::{BoxingError, ConfigError, FillKind};

/// The view one device has of a logical tensor distributed over a device mesh.
///
/// A `ConsistentTensor` pairs the local shard with the [`ShardingSpec`] describing how the
/// logical tensor is laid out across the mesh. Every device of the mesh holds its own
/// `ConsistentTensor` for the same logical tensor; together the shards determine the logical
/// value (see [`reconstruct`](crate::reconstruct)).
#[derive(Clone, Debug)]
pub struct ConsistentTensor<B, const D: usize, K = Float>
where
    B: Backend,
    K: TensorKind<B>,
{
    /// Local shard of the tensor
    local_shard: Tensor<B, D, K>,
    /// Specification of how this tensor is distributed
    sharding_spec: ShardingSpec,
    /// Global shape of the tensor (across all devices)
    global_shape: Vec<usize>,
    /// Element type of the local shard, as stored by the backend
    dtype: DType,
    /// Device owning the local shard
    rank: Rank,
}

impl<B, const D: usize, K> ConsistentTensor<B, D, K>
where
    B: Backend,
    K: Numeric<B>,
{
    /// Distributes a full copy of the logical tensor, keeping what `rank` owns.
    ///
    /// Split axes keep the local chunk, broadcast axes keep everything, and partial-sum axes
    /// keep the value on coordinate 0 and zeros elsewhere.
    pub fn from_global(
        global: TensorData,
        sharding_spec: ShardingSpec,
        rank: Rank,
        device: &B::Device,
    ) -> Result<Self, ConfigError> {
        let global_shape = global.shape.clone();
        let coordinate = locate::<D>(&global_shape, &sharding_spec, rank)?;
        let local_shard = carve(
            Tensor::<B, D, K>::from_data(global, device),
            &global_shape,
            sharding_spec.nd_sbp(),
            sharding_spec.device_mesh(),
            &coordinate,
        )?;

        Ok(Self {
            dtype: local_shard.dtype(),
            local_shard,
            sharding_spec,
            global_shape,
            rank,
        })
    }

    /// Wraps a shard already held by `rank`.
    pub fn from_local(
        local: TensorData,
        global_shape: Vec<usize>,
        sharding_spec: ShardingSpec,
        rank: Rank,
        device: &B::Device,
    ) -> Result<Self, ConfigError> {
        let coordinate = locate::<D>(&global_shape, &sharding_spec, rank)?;
        let expected = sharding_spec.shard_shape(&global_shape, &coordinate)?;
        if local.shape != expected {
            return Err(ConfigError::ShardShapeMismatch {
                expected,
                got: local.shape,
            });
        }
        let local_shard = Tensor::<B, D, K>::from_data(local, device);

        Ok(Self {
            dtype: local_shard.dtype(),
            local_shard,
            sharding_spec,
            global_shape,
            rank,
        })
    }

    /// A tensor of ones or zeros, materialized directly in its local shape.
    ///
    /// `dtype` is the type of the fill value and defaults to [`DType::F32`]; the shard itself
    /// is stored with the element type of `K` on the backend.
    pub fn full(
        kind: FillKind,
        dtype: Option<DType>,
        global_shape: Vec<usize>,
        sharding_spec: ShardingSpec,
        rank: Rank,
        device: &B::Device,
    ) -> Result<Self, ConfigError> {
        let fill = kind.config(dtype)?;
        let coordinate = locate::<D>(&global_shape, &sharding_spec, rank)?;
        let shape = sharding_spec.shard_shape(&global_shape, &coordinate)?;
        let mut local_shard = Tensor::<B, D, K>::from_data(fill.data(&shape)?, device);
        let partial_elsewhere = sharding_spec
            .nd_sbp()
            .iter()
            .zip(&coordinate)
            .any(|(sbp, index)| *sbp == Sbp::PartialSum && *index != 0);
        if partial_elsewhere {
            local_shard = local_shard.zeros_like();
        }

        Ok(Self {
            dtype: local_shard.dtype(),
            local_shard,
            sharding_spec,
            global_shape,
            rank,
        })
    }

    /// Redistributes the tensor to `nd_sbp` over `mesh`.
    ///
    /// Every device of both meshes must make the same call; the source tensor is left as is.
    pub fn redistribute<C, S>(
        &self,
        nd_sbp: S,
        mesh: DeviceMesh,
        comm: &C,
    ) -> Result<Self, BoxingError>
    where
        C: Collective,
        S: Into<NdSbp>,
    {
        crate::boxing::redistribute(self, nd_sbp, mesh, comm)
    }

    /// Redistributes the tensor to `destination`, planning with `planner`.
    pub fn redistribute_with<C: Collective>(
        &self,
        planner: &BoxingPlanner,
        destination: ShardingSpec,
        comm: &C,
    ) -> Result<Self, BoxingError> {
        if comm.rank() != self.rank {
            return Err(ConfigError::RankMismatch {
                owner: self.rank,
                communicator: comm.rank(),
            }
            .into());
        }

        let plan = planner.plan(&self.global_shape, &self.sharding_spec, &destination)?;
        let local_shard = BoxingExecutor::new(comm).execute(&plan, self.local_shard.clone())?;

        Ok(Self {
            dtype: local_shard.dtype(),
            local_shard,
            sharding_spec: destination,
            global_shape: self.global_shape.clone(),
            rank: self.rank,
        })
    }
}

impl<B, const D: usize, K> ConsistentTensor<B, D, K>
where
    B: Backend,
    K: TensorKind<B>,
{
    /// The shard held by this device.
    pub fn local_shard(&self) -> &Tensor<B, D, K> {
        &self.local_shard
    }

    /// Consumes the tensor, returning the local shard.
    pub fn into_local_shard(self) -> Tensor<B, D, K> {
        self.local_shard
    }

    /// Logical shape of the tensor.
    pub fn global_shape(&self) -> &[usize] {
        &self.global_shape
    }

    /// Element type of the logical tensor, which is always the one of the local shard.
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// How the tensor is distributed.
    pub fn sharding_spec(&self) -> &ShardingSpec {
        &self.sharding_spec
    }

    /// The per-axis distribution.
    pub fn nd_sbp(&self) -> &NdSbp {
        self.sharding_spec.nd_sbp()
    }

    /// The mesh the tensor is distributed over.
    pub fn device_mesh(&self) -> &DeviceMesh {
        self.sharding_spec.device_mesh()
    }

    /// The device owning the local shard.
    pub fn rank(&self) -> Rank {
        self.rank
    }

    /// Coordinate of the owning device in the mesh.
    pub fn coordinate(&self) -> Vec<usize> {
        // Checked at construction.
        self.device_mesh()
            .coordinate_of(self.rank)
            .unwrap_or_default()
    }
}

/// Validates the layout of a `D`-dimensional tensor and finds `rank` in the mesh.
fn locate<const D: usize>(
    global_shape: &[usize],
    sharding_spec: &ShardingSpec,
    rank: Rank,
) -> Result<Vec<usize>, ConfigError> {
    if global_shape.len() != D {
        return Err(ConfigError::TensorRank {
            expected: D,
            shape: global_shape.to_vec(),
        });
    }
    sharding_spec.validate(global_shape)?;
    sharding_spec
        .device_mesh()
        .coordinate_of(rank)
        .ok_or(ConfigError::DeviceNotInMesh { rank })
}
