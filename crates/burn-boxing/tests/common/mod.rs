#![allow(dead_code)]

use burn_boxing::collective::{Collective, LocalCluster};
use burn_boxing::sharding::{DeviceMesh, NdSbp, Rank, Sbp, ShardingSpec};
use burn_boxing::{BoxingConfig, BoxingError, ConsistentTensor, reconstruct};
use burn_ndarray::NdArray;
use burn_tensor::{Numeric, Tensor, TensorData};
use core::time::Duration;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub type TestBackend = NdArray<f32>;

pub const SBPS: [Sbp; 4] = [Sbp::Split(0), Sbp::Split(1), Sbp::Broadcast, Sbp::PartialSum];

pub fn config() -> BoxingConfig {
    BoxingConfig::default().with_collective_timeout(Duration::from_secs(5))
}

pub fn mesh(shape: &[usize]) -> DeviceMesh {
    DeviceMesh::from_shape(shape.to_vec()).unwrap()
}

pub fn spec(nd_sbp: impl Into<NdSbp>, mesh: &DeviceMesh) -> ShardingSpec {
    ShardingSpec::new(nd_sbp, mesh.clone()).unwrap()
}

/// Uniform values in `[-100, 100)` drawn from a fixed seed.
pub fn random_data(shape: &[usize], seed: u64) -> TensorData {
    let mut rng = StdRng::seed_from_u64(seed);
    let numel = shape.iter().product::<usize>();
    let values = (0..numel)
        .map(|_| rng.random_range(-1e2f32..1e2))
        .collect::<Vec<_>>();
    TensorData::new(values, shape.to_vec())
}

/// Distributes `global` with `source`, redistributes it to `nd_sbp` over `destination` on
/// every device, and returns the local shards in rank order.
pub fn redistribute_all<const D: usize, K>(
    global: &TensorData,
    source: &ShardingSpec,
    nd_sbp: &NdSbp,
    destination: &DeviceMesh,
    config: &BoxingConfig,
) -> Vec<Result<(Rank, Tensor<TestBackend, D, K>), BoxingError>>
where
    K: Numeric<TestBackend>,
{
    let cluster = LocalCluster::new(source.device_mesh().num_devices(), config);
    cluster.launch(|comm| -> Result<(Rank, Tensor<TestBackend, D, K>), BoxingError> {
        let device = Default::default();
        let tensor = ConsistentTensor::<TestBackend, D, K>::from_global(
            global.clone(),
            source.clone(),
            comm.rank(),
            &device,
        )?;
        let output = tensor.redistribute(nd_sbp.clone(), destination.clone(), &comm)?;
        assert_eq!(output.global_shape(), global.shape.as_slice());
        Ok((comm.rank(), output.into_local_shard()))
    })
}

/// Every participant agrees: either all succeed or all report the same unimplemented transform.
pub fn expect_consistent<const D: usize, K>(
    results: Vec<Result<(Rank, Tensor<TestBackend, D, K>), BoxingError>>,
) -> Result<Vec<(Rank, Tensor<TestBackend, D, K>)>, BoxingError>
where
    K: Numeric<TestBackend>,
{
    if results.iter().all(Result::is_ok) {
        return results.into_iter().collect();
    }
    let errors = results
        .into_iter()
        .map(|result| result.err().expect("some participant succeeded while others failed"))
        .collect::<Vec<_>>();
    for error in &errors {
        assert!(error.is_unimplemented(), "unexpected failure: {error}");
        assert_eq!(error.unimplemented(), errors[0].unimplemented());
    }
    Err(errors.into_iter().next().unwrap())
}

pub fn assert_close(actual: &TensorData, expected: &TensorData) {
    assert_eq!(actual.shape, expected.shape);
    let actual = actual.to_vec::<f32>().unwrap();
    let expected = expected.to_vec::<f32>().unwrap();
    for (idx, (a, e)) in actual.iter().zip(&expected).enumerate() {
        assert!(
            (a - e).abs() <= 1e-3 * e.abs().max(1.0),
            "element {idx}: {a} != {e}"
        );
    }
}

/// Rebuilds the logical value from the shards returned by [`redistribute_all`].
pub fn reconstruct_data<const D: usize, K>(
    shards: Vec<(Rank, Tensor<TestBackend, D, K>)>,
    nd_sbp: &NdSbp,
    mesh: &DeviceMesh,
) -> TensorData
where
    K: Numeric<TestBackend>,
{
    reconstruct(shards, &spec(nd_sbp.clone(), mesh))
        .unwrap()
        .into_data()
}
