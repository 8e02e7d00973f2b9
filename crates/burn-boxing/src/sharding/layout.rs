//! Shard shapes derived from a distribution.
//!
//! Distributions are hierarchical: mesh axis 0 is applied to the global tensor, axis 1 to
//! what axis 0 left on a device, and so on. When two axes split the same tensor dim, the
//! inner axis splits the chunk of the outer one.

use alloc::vec::Vec;
use core::ops::Range;

use super::{DeviceMesh, Sbp};
use crate::ConfigError;

/// Sizes of the chunks obtained when splitting `extent` into `parts`.
///
/// Every chunk but the last gets `ceil(extent / parts)` elements and the last one gets the
/// remainder. When that would leave the last chunk empty, the extent is balanced instead:
/// the first `extent % parts` chunks get one element more than the others.
pub fn split_sizes(dim: usize, extent: usize, parts: usize) -> Result<Vec<usize>, ConfigError> {
    if parts == 0 || extent < parts {
        return Err(ConfigError::SplitTooSmall { dim, extent, parts });
    }

    let chunk = extent.div_ceil(parts);
    let head = chunk * (parts - 1);
    if head < extent {
        let mut sizes = alloc::vec![chunk; parts - 1];
        sizes.push(extent - head);
        return Ok(sizes);
    }

    let base = extent / parts;
    let remainder = extent % parts;
    Ok((0..parts)
        .map(|idx| if idx < remainder { base + 1 } else { base })
        .collect())
}

/// The range of `extent` owned by chunk `index` out of `parts`.
pub fn chunk_range(
    dim: usize,
    extent: usize,
    parts: usize,
    index: usize,
) -> Result<Range<usize>, ConfigError> {
    let sizes = split_sizes(dim, extent, parts)?;
    let start = sizes[..index].iter().sum::<usize>();
    Ok(start..start + sizes[index])
}

/// Shape held by coordinate `index` of mesh `axis` when `shape` is distributed by `sbp`.
pub fn axis_local_shape(
    shape: &[usize],
    sbp: Sbp,
    mesh: &DeviceMesh,
    axis: usize,
    index: usize,
) -> Result<Vec<usize>, ConfigError> {
    let mut local = shape.to_vec();
    if let Sbp::Split(dim) = sbp {
        if dim >= shape.len() {
            return Err(ConfigError::SplitDimOutOfRange {
                dim,
                rank: shape.len(),
            });
        }
        local[dim] = chunk_range(dim, shape[dim], mesh.extent(axis), index)?.len();
    }
    Ok(local)
}

/// Shape seen by the device at `coordinate` right before `axis` is applied.
pub fn level_shape(
    global_shape: &[usize],
    sbps: &[Sbp],
    mesh: &DeviceMesh,
    coordinate: &[usize],
    axis: usize,
) -> Result<Vec<usize>, ConfigError> {
    let mut shape = global_shape.to_vec();
    for (outer, sbp) in sbps.iter().enumerate().take(axis) {
        shape = axis_local_shape(&shape, *sbp, mesh, outer, coordinate[outer])?;
    }
    Ok(shape)
}

/// Shape of the shard held by the device at `coordinate`.
pub fn shard_shape(
    global_shape: &[usize],
    sbps: &[Sbp],
    mesh: &DeviceMesh,
    coordinate: &[usize],
) -> Result<Vec<usize>, ConfigError> {
    level_shape(global_shape, sbps, mesh, coordinate, sbps.len())
}

/// Checks the global shape and that every device of `mesh` owns a non-empty shard.
pub fn validate(global_shape: &[usize], sbps: &[Sbp], mesh: &DeviceMesh) -> Result<(), ConfigError> {
    if global_shape.is_empty() || global_shape.contains(&0) {
        return Err(ConfigError::NonPositiveShape {
            shape: global_shape.to_vec(),
        });
    }
    if sbps.len() != mesh.ndim() {
        return Err(ConfigError::DistributionRank {
            expected: mesh.ndim(),
            got: sbps.len(),
        });
    }
    for coordinate in mesh.coordinates() {
        shard_shape(global_shape, sbps, mesh, &coordinate)?;
    }
    Ok(())
}
