use alloc::vec::Vec;
use core::fmt;
use hashbrown::{HashMap, HashSet};
use serde::{Deserialize, Serialize};

/// Identifies a single participant (device) of the cluster.
///
/// Ranks are handed out by the cluster-launch layer and are the addresses used by the
/// collective-communication layer.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Rank(pub usize);

impl fmt::Display for Rank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The name of a mesh axis, e.g. `data_parallel`.
///
/// Names are unique within a mesh and let callers look an axis up by its role.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct MeshDim {
    name: String,
}

impl MeshDim {
    /// Names an axis.
    pub fn new<S: Into<String>>(name: S) -> Self {
        MeshDim { name: name.into() }
    }

    /// The name of the mesh dimension.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// An N-dimensional grid of ranks over which tensors are distributed.
///
/// Devices are stored in row-major order: the device at coordinate `[c0, c1, ..]` lives at
/// the linear index obtained with the usual row-major strides of the mesh shape.
///
/// For any mesh axis, the devices that share every coordinate except the one on that axis
/// form a communication *group*. Boxing along an axis only communicates within its groups.
///
/// For example, a 2D mesh with shape `[2, 2]` over devices `[0, 1, 2, 3]` groups devices
/// `{0, 2}` and `{1, 3}` along axis 0, and `{0, 1}` and `{2, 3}` along axis 1.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceMesh {
    /// Ranks in row-major order
    devices: Vec<Rank>,
    /// Extent of every axis
    shape: Vec<usize>,
    /// Axis index of every named dimension
    dims: HashMap<MeshDim, usize>,
}

/// A mesh that cannot be built from the given devices, shape and axis names.
#[derive(Clone, Debug, thiserror::Error)]
pub enum DeviceMeshError {
    /// An axis name maps to a missing or already named axis.
    #[error("invalid mesh dimension: {0}")]
    InvalidDimension(String),
    /// The shape, the devices or the naming of the axes is inconsistent.
    #[error("invalid mesh: {0}")]
    InvalidMesh(String),
}

impl DeviceMesh {
    /// Creates a mesh whose axes are named `mesh_0`, `mesh_1`, ...
    pub fn new<S: Into<Vec<usize>>>(devices: Vec<Rank>, shape: S) -> Result<Self, DeviceMeshError> {
        let shape = shape.into();
        let ndim = shape.len();
        (0..ndim)
            .fold(DeviceMeshBuilder::new(devices, shape), |builder, idx| {
                builder.with_dim(idx, MeshDim::new(format!("mesh_{idx}")))
            })
            .build()
    }

    /// Creates a mesh over ranks `0..shape.product()` in order.
    pub fn from_shape<S: Into<Vec<usize>>>(shape: S) -> Result<Self, DeviceMeshError> {
        let shape = shape.into();
        let devices = (0..shape.iter().product::<usize>()).map(Rank).collect();
        Self::new(devices, shape)
    }

    /// Shape of the logical mesh.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Number of mesh axes.
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Number of devices along `axis`.
    pub fn extent(&self, axis: usize) -> usize {
        self.shape[axis]
    }

    /// Devices in row-major order.
    pub fn devices(&self) -> &[Rank] {
        &self.devices
    }

    /// Total number of devices.
    pub fn num_devices(&self) -> usize {
        self.devices.len()
    }

    /// Index of the mesh axis registered under `dim`.
    pub fn dim_index(&self, dim: &MeshDim) -> Option<usize> {
        self.dims.get(dim).copied()
    }

    /// Name of the mesh axis at `axis`.
    pub fn dim_name(&self, axis: usize) -> Option<&MeshDim> {
        self.dims
            .iter()
            .find_map(|(dim, &idx)| (idx == axis).then_some(dim))
    }

    /// Coordinate of `rank` in the mesh, if it is a member.
    pub fn coordinate_of(&self, rank: Rank) -> Option<Vec<usize>> {
        let mut linear = self.devices.iter().position(|&device| device == rank)?;
        let mut coordinate = alloc::vec![0; self.ndim()];
        for axis in (0..self.ndim()).rev() {
            coordinate[axis] = linear % self.shape[axis];
            linear /= self.shape[axis];
        }
        Some(coordinate)
    }

    /// Device at `coordinate`.
    ///
    /// # Panics
    ///
    /// If the coordinate does not address a device of the mesh.
    pub fn device_at(&self, coordinate: &[usize]) -> Rank {
        assert_eq!(coordinate.len(), self.ndim(), "coordinate rank mismatch");
        let linear = coordinate
            .iter()
            .zip(self.shape.iter())
            .fold(0, |linear, (&c, &extent)| {
                assert!(c < extent, "coordinate {coordinate:?} out of mesh {:?}", self.shape);
                linear * extent + c
            });
        self.devices[linear]
    }

    /// The devices sharing every coordinate of `coordinate` except the one on `axis`,
    /// ordered by ascending coordinate along `axis`.
    pub fn group(&self, axis: usize, coordinate: &[usize]) -> DeviceGroup {
        let mut peer = coordinate.to_vec();
        let ranks = (0..self.shape[axis])
            .map(|c| {
                peer[axis] = c;
                self.device_at(&peer)
            })
            .collect();
        DeviceGroup::new(ranks)
    }

    /// Iterates over every coordinate of the mesh in row-major order.
    pub fn coordinates(&self) -> impl Iterator<Item = Vec<usize>> + '_ {
        (0..self.num_devices()).map(move |mut linear| {
            let mut coordinate = alloc::vec![0; self.ndim()];
            for axis in (0..self.ndim()).rev() {
                coordinate[axis] = linear % self.shape[axis];
                linear /= self.shape[axis];
            }
            coordinate
        })
    }

    /// Whether both meshes have the same shape and the same devices at the same coordinates.
    ///
    /// Axis names are not compared.
    pub fn same_layout(&self, other: &DeviceMesh) -> bool {
        self.shape == other.shape && self.devices == other.devices
    }

    /// Whether both meshes address the same set of devices, regardless of arrangement.
    pub fn same_population(&self, other: &DeviceMesh) -> bool {
        let mut lhs = self.devices.clone();
        let mut rhs = other.devices.clone();
        lhs.sort_unstable();
        rhs.sort_unstable();
        lhs == rhs
    }
}

impl fmt::Display for DeviceMesh {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mesh{:?}", self.shape)
    }
}

/// An ordered set of devices that take part in the same collective call.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct DeviceGroup {
    ranks: Vec<Rank>,
}

impl DeviceGroup {
    /// Creates a group; the order of `ranks` is the order payloads are exchanged in.
    pub fn new(ranks: Vec<Rank>) -> Self {
        Self { ranks }
    }

    /// Members of the group in order.
    pub fn ranks(&self) -> &[Rank] {
        &self.ranks
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.ranks.len()
    }

    /// Whether the group has no members.
    pub fn is_empty(&self) -> bool {
        self.ranks.is_empty()
    }

    /// Position of `rank` in the group.
    pub fn position(&self, rank: Rank) -> Option<usize> {
        self.ranks.iter().position(|&member| member == rank)
    }
}

/// Builds a [`DeviceMesh`] with caller-chosen axis names.
///
/// Every axis must be named exactly once before [`build`](Self::build).
#[derive(Clone, Debug)]
pub struct DeviceMeshBuilder {
    devices: Vec<Rank>,
    shape: Vec<usize>,
    dims: HashMap<MeshDim, usize>,
}

impl DeviceMeshBuilder {
    /// Starts a mesh of `shape` over `devices`, given in row-major order.
    pub fn new<S: Into<Vec<usize>>>(devices: Vec<Rank>, shape: S) -> Self {
        Self {
            devices,
            shape: shape.into(),
            dims: HashMap::new(),
        }
    }

    /// Names axis `idx`. Validation happens in [`build`](Self::build).
    ///
    /// # Example
    ///
    /// ```rust
    /// use burn_boxing::sharding::{DeviceMeshBuilder, MeshDim, Rank};
    ///
    /// let mesh = DeviceMeshBuilder::new((0..4).map(Rank).collect(), [2, 2])
    ///     .with_dim(0, MeshDim::new("data_parallel"))
    ///     .with_dim(1, MeshDim::new("tensor_parallel"))
    ///     .build()
    ///     .unwrap();
    /// assert_eq!(mesh.dim_index(&MeshDim::new("tensor_parallel")), Some(1));
    /// ```
    pub fn with_dim(mut self, idx: usize, dim: MeshDim) -> Self {
        self.dims.insert(dim, idx);
        self
    }

    /// Checks the axis names, the extents and the devices, then builds the mesh.
    pub fn build(self) -> Result<DeviceMesh, DeviceMeshError> {
        let ndim = self.shape.len();
        if ndim == 0 {
            return Err(DeviceMeshError::InvalidMesh(
                "Mesh must have at least one dimension".into(),
            ));
        }
        if self.shape.contains(&0) {
            return Err(DeviceMeshError::InvalidMesh(format!(
                "Mesh extents must be positive, got {:?}",
                self.shape
            )));
        }

        let mut seen_indices = HashSet::new();
        for &idx in self.dims.values() {
            if idx >= ndim {
                return Err(DeviceMeshError::InvalidDimension(format!(
                    "Index {} exceeds mesh shape {:?}",
                    idx, self.shape
                )));
            }
            if !seen_indices.insert(idx) {
                return Err(DeviceMeshError::InvalidDimension(format!(
                    "Dimension {} already mapped",
                    idx
                )));
            }
        }

        if seen_indices.len() != ndim {
            return Err(DeviceMeshError::InvalidMesh(format!(
                "Not all mesh dimensions are mapped. Got {}, expected {}",
                seen_indices.len(),
                ndim
            )));
        }

        let expected_devices = self.shape.iter().product::<usize>();
        if self.devices.len() != expected_devices {
            return Err(DeviceMeshError::InvalidMesh(format!(
                "Device count ({}) doesn't match mesh shape {:?}",
                self.devices.len(),
                self.shape,
            )));
        }

        let unique = self.devices.iter().collect::<HashSet<_>>().len();
        if unique != self.devices.len() {
            return Err(DeviceMeshError::InvalidMesh(format!(
                "Devices must be unique, got {:?}",
                self.devices
            )));
        }

        Ok(DeviceMesh {
            devices: self.devices,
            shape: self.shape,
            dims: self.dims,
        })
    }
}
