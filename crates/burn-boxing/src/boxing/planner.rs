use alloc::vec::Vec;

use super::{AxisTransform, BoxingPlan, BoxingRoute, BoxingStep, MeshSide};
use crate::sharding::{DeviceMesh, NdSbp, Sbp, ShardingSpec, layout};
use crate::{BoxingConfig, BoxingError, ConfigError, UnimplementedBoxing, UnimplementedReason};

/// Resolves the steps that redistribute a tensor from one [`ShardingSpec`] to another.
///
/// Planning is a pure function of its inputs and the configuration, so every participant
/// computes the same plan and issues the same collectives in the same order.
#[derive(Clone, Debug, Default)]
pub struct BoxingPlanner {
    config: BoxingConfig,
}

impl BoxingPlanner {
    /// Creates a planner.
    pub fn new(config: BoxingConfig) -> Self {
        Self { config }
    }

    /// The planner's configuration.
    pub fn config(&self) -> &BoxingConfig {
        &self.config
    }

    /// Plans the redistribution of a tensor of `global_shape` from `source` to `destination`.
    ///
    /// Configuration errors and unimplemented transforms are reported here, before any
    /// device communicates.
    pub fn plan(
        &self,
        global_shape: &[usize],
        source: &ShardingSpec,
        destination: &ShardingSpec,
    ) -> Result<BoxingPlan, BoxingError> {
        source.validate(global_shape)?;
        destination.validate(global_shape)?;

        let source_mesh = source.device_mesh();
        let destination_mesh = destination.device_mesh();
        let (route, steps) = if source_mesh.same_layout(destination_mesh) {
            let steps = direct_steps(
                global_shape,
                source.nd_sbp(),
                destination.nd_sbp(),
                source_mesh,
            )?;
            (BoxingRoute::Direct, steps)
        } else if self.config.regroup_across_meshes
            && source_mesh.same_population(destination_mesh)
        {
            let steps = regroup_steps(global_shape, source, destination)?;
            (BoxingRoute::Regroup, steps)
        } else {
            return Err(UnimplementedBoxing {
                axis: 0,
                from: source.nd_sbp()[0],
                to: destination.nd_sbp()[0],
                reason: UnimplementedReason::MeshChange,
            }
            .into());
        };

        let plan = BoxingPlan {
            global_shape: global_shape.to_vec(),
            source: source.clone(),
            destination: destination.clone(),
            route,
            steps,
        };
        log::debug!(
            "planned boxing {} -> {} for {:?}: {:?} route, {} steps, ~{} elements",
            source,
            destination,
            global_shape,
            route,
            plan.steps.len(),
            plan.transfer_elements()
        );
        Ok(plan)
    }
}

fn direct_steps(
    global_shape: &[usize],
    source: &NdSbp,
    destination: &NdSbp,
    mesh: &DeviceMesh,
) -> Result<Vec<BoxingStep>, BoxingError> {
    let mut state = source.clone();
    let mut steps = Vec::with_capacity(mesh.ndim());
    for (axis, &to) in destination.iter().enumerate() {
        let step = plan_step(global_shape, &state, mesh, MeshSide::Source, axis, to)?;
        state = step.after();
        steps.push(step);
    }
    Ok(steps)
}

/// Broadcasts on the source mesh from the innermost axis out, then carves the destination
/// layout from the outermost axis in. Every device holds the full tensor in between, so
/// switching meshes moves no data.
fn regroup_steps(
    global_shape: &[usize],
    source: &ShardingSpec,
    destination: &ShardingSpec,
) -> Result<Vec<BoxingStep>, BoxingError> {
    let source_mesh = source.device_mesh();
    let destination_mesh = destination.device_mesh();
    let mut steps = Vec::with_capacity(source_mesh.ndim() + destination_mesh.ndim());

    let mut state = source.nd_sbp().clone();
    for axis in (0..source_mesh.ndim()).rev() {
        let step = plan_step(
            global_shape,
            &state,
            source_mesh,
            MeshSide::Source,
            axis,
            Sbp::Broadcast,
        )?;
        state = step.after();
        steps.push(step);
    }

    let mut state = NdSbp::broadcast(destination_mesh.ndim());
    for (axis, &to) in destination.nd_sbp().iter().enumerate() {
        let step = plan_step(
            global_shape,
            &state,
            destination_mesh,
            MeshSide::Destination,
            axis,
            to,
        )?;
        state = step.after();
        steps.push(step);
    }
    Ok(steps)
}

fn plan_step(
    global_shape: &[usize],
    state: &NdSbp,
    mesh: &DeviceMesh,
    side: MeshSide,
    axis: usize,
    to: Sbp,
) -> Result<BoxingStep, BoxingError> {
    let transform = resolve_axis(state, axis, to)?;
    let after = state.with_axis(axis, to);
    layout::validate(global_shape, &after, mesh)?;

    Ok(BoxingStep {
        side,
        axis,
        from: state[axis],
        to,
        transform,
        before: state.clone(),
        transfer_elements: transfer_elements(global_shape, state, mesh, axis, transform)?,
    })
}

/// Picks the transform taking `axis` from its current descriptor to `to`.
///
/// A transform that reads or writes the split of a tensor dim is only defined while no
/// later axis splits the same dim: the local chunk must span the whole extent seen at `axis`.
pub fn resolve_axis(state: &NdSbp, axis: usize, to: Sbp) -> Result<AxisTransform, UnimplementedBoxing> {
    let from = state[axis];
    let unimplemented = |reason| UnimplementedBoxing {
        axis,
        from,
        to,
        reason,
    };
    let innermost = |dim: usize| match state.inner_split_axis(axis, dim) {
        Some(inner_axis) => Err(unimplemented(UnimplementedReason::NestedSplit { dim, inner_axis })),
        None => Ok(()),
    };

    let transform = match (from, to) {
        (Sbp::Split(from_dim), Sbp::Split(to_dim)) if from_dim == to_dim => AxisTransform::Identity,
        (Sbp::Split(from_dim), Sbp::Split(to_dim)) => {
            innermost(from_dim)?;
            innermost(to_dim)?;
            AxisTransform::AllToAll { from_dim, to_dim }
        }
        (Sbp::Split(dim), Sbp::Broadcast) => {
            innermost(dim)?;
            AxisTransform::AllGather { dim }
        }
        (Sbp::Split(_), Sbp::PartialSum) => return Err(unimplemented(UnimplementedReason::NoRule)),
        (Sbp::Broadcast, Sbp::Split(dim)) => {
            innermost(dim)?;
            AxisTransform::LocalSlice { dim }
        }
        (Sbp::Broadcast, Sbp::Broadcast) | (Sbp::PartialSum, Sbp::PartialSum) => {
            AxisTransform::Identity
        }
        (Sbp::Broadcast, Sbp::PartialSum) => AxisTransform::ZeroFill,
        (Sbp::PartialSum, Sbp::Broadcast) => AxisTransform::AllReduce,
        (Sbp::PartialSum, Sbp::Split(dim)) => {
            innermost(dim)?;
            AxisTransform::ReduceScatter { dim }
        }
    };
    Ok(transform)
}

/// Elements moved by `transform` on `axis`, summed over every group of the axis.
fn transfer_elements(
    global_shape: &[usize],
    state: &NdSbp,
    mesh: &DeviceMesh,
    axis: usize,
    transform: AxisTransform,
) -> Result<u64, ConfigError> {
    let parts = mesh.extent(axis) as u64;
    let level_elements = mesh
        .coordinates()
        .filter(|coordinate| coordinate[axis] == 0)
        .map(|coordinate| {
            layout::level_shape(global_shape, state, mesh, &coordinate, axis)
                .map(|shape| shape.iter().product::<usize>() as u64)
        })
        .sum::<Result<u64, _>>()?;

    Ok(match transform {
        AxisTransform::Identity | AxisTransform::LocalSlice { .. } | AxisTransform::ZeroFill => 0,
        AxisTransform::AllToAll { .. } => level_elements * (parts - 1) / parts,
        AxisTransform::AllGather { .. } | AxisTransform::ReduceScatter { .. } => {
            level_elements * (parts - 1)
        }
        AxisTransform::AllReduce => 2 * level_elements * (parts - 1),
    })
}
