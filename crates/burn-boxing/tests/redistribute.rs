mod common;

use burn_boxing::boxing::{BoxingPlanner, BoxingRoute};
use burn_boxing::sharding::{DeviceMesh, NdSbp, Rank, Sbp, layout};
use burn_boxing::{BoxingError, ConsistentTensor, FillKind, UnimplementedBoxing};
use burn_tensor::{DType, Float, Int, TensorData};
use common::*;
use rstest::rstest;

#[rstest]
#[case(&[4])]
#[case(&[1, 4])]
fn test_split_to_broadcast_gives_every_device_the_full_array(#[case] mesh_shape: &[usize]) {
    let mesh = mesh(mesh_shape);
    let global = random_data(&[4, 8], 10);
    let mut source = vec![Sbp::Broadcast; mesh_shape.len()];
    *source.last_mut().unwrap() = Sbp::Split(0);
    let destination = NdSbp::broadcast(mesh_shape.len());

    let shards = expect_consistent::<2, Float>(redistribute_all(
        &global,
        &spec(source, &mesh),
        &destination,
        &mesh,
        &config(),
    ))
    .unwrap();

    assert_eq!(shards.len(), 4);
    for (rank, shard) in shards {
        assert_eq!(shard.dims(), [4, 8], "rank {rank}");
        assert_eq!(shard.into_data(), global);
    }
}

#[test]
fn test_uneven_split_chunk_sizes() {
    let mesh = mesh(&[4]);
    let global = TensorData::new((0..5).map(|v| v as f32).collect::<Vec<_>>(), [5]);
    let spec = spec([Sbp::Split(0)], &mesh);

    let sizes = (0..4)
        .map(|rank| {
            ConsistentTensor::<TestBackend, 1>::from_global(
                global.clone(),
                spec.clone(),
                Rank(rank),
                &Default::default(),
            )
            .unwrap()
            .local_shard()
            .dims()[0]
        })
        .collect::<Vec<_>>();

    assert_eq!(sizes, vec![2, 1, 1, 1]);
    assert_eq!(layout::split_sizes(0, 10, 4).unwrap(), vec![3, 3, 3, 1]);
}

#[test]
fn test_exhaustive_1d() {
    let mesh = mesh(&[4]);
    let global = random_data(&[5, 7], 10);
    let mut unimplemented = Vec::new();

    for from in SBPS {
        for to in SBPS {
            let destination = NdSbp::new([to]);
            let results = redistribute_all::<2, Float>(
                &global,
                &spec([from], &mesh),
                &destination,
                &mesh,
                &config(),
            );
            match expect_consistent(results) {
                Ok(shards) => {
                    assert_close(&reconstruct_data(shards, &destination, &mesh), &global)
                }
                Err(err) => unimplemented.push(*err.unimplemented().unwrap()),
            }
        }
    }

    let pairs = unimplemented
        .iter()
        .map(|err| (err.from, err.to))
        .collect::<Vec<_>>();
    assert_eq!(
        pairs,
        vec![
            (Sbp::Split(0), Sbp::PartialSum),
            (Sbp::Split(1), Sbp::PartialSum)
        ]
    );
}

fn unimplemented_2d_plans(global_shape: &[usize], mesh: &DeviceMesh) -> Vec<UnimplementedBoxing> {
    let planner = BoxingPlanner::default();
    nd_sbps_2d()
        .flat_map(|from| nd_sbps_2d().map(move |to| (from.clone(), to)))
        .filter_map(|(from, to)| {
            planner
                .plan(global_shape, &spec(from, mesh), &spec(to, mesh))
                .err()
                .map(|err| *err.unimplemented().unwrap())
        })
        .collect()
}

fn nd_sbps_2d() -> impl Iterator<Item = NdSbp> + Clone {
    SBPS.into_iter()
        .flat_map(|outer| SBPS.into_iter().map(move |inner| NdSbp::new([outer, inner])))
}

#[test]
fn test_exhaustive_2d() {
    let mesh = mesh(&[2, 2]);
    let global = random_data(&[5, 7], 10);
    let mut unimplemented = Vec::new();
    let mut succeeded = 0;

    for from in nd_sbps_2d() {
        for to in nd_sbps_2d() {
            let results = redistribute_all::<2, Float>(
                &global,
                &spec(from.clone(), &mesh),
                &to,
                &mesh,
                &config(),
            );
            match expect_consistent(results) {
                Ok(shards) => {
                    succeeded += 1;
                    assert_close(&reconstruct_data(shards, &to, &mesh), &global);
                }
                Err(err) => unimplemented.push(*err.unimplemented().unwrap()),
            }
        }
    }

    assert_eq!(succeeded + unimplemented.len(), 256);
    assert!(succeeded > unimplemented.len());
    assert_eq!(unimplemented, unimplemented_2d_plans(&[5, 7], &mesh));
    assert_eq!(
        unimplemented_2d_plans(&[5, 7], &mesh),
        unimplemented_2d_plans(&[5, 7], &mesh)
    );
}

#[rstest]
#[case([Sbp::Broadcast, Sbp::Broadcast])]
#[case([Sbp::PartialSum, Sbp::PartialSum])]
#[case([Sbp::Split(1), Sbp::Split(0)])]
#[case([Sbp::Split(0), Sbp::Split(0)])]
fn test_noop_leaves_shards_byte_identical(#[case] nd_sbp: [Sbp; 2]) {
    let mesh = mesh(&[2, 2]);
    let global = random_data(&[6, 4], 10);
    let spec = spec(nd_sbp, &mesh);
    let plan = BoxingPlanner::default()
        .plan(&[6, 4], &spec, &spec)
        .unwrap();
    assert!(plan.is_noop());
    assert_eq!(plan.transfer_elements(), 0);

    let results = shards_before_and_after(&global, &spec);

    for (before, after) in results {
        assert_eq!(before.as_bytes(), after.as_bytes());
    }
}

fn shards_before_and_after(
    global: &TensorData,
    spec: &burn_boxing::sharding::ShardingSpec,
) -> Vec<(TensorData, TensorData)> {
    let cluster = burn_boxing::collective::LocalCluster::new(4, &config());
    cluster.launch(|comm| {
        use burn_boxing::collective::Collective;

        let tensor = ConsistentTensor::<TestBackend, 2>::from_global(
            global.clone(),
            spec.clone(),
            comm.rank(),
            &Default::default(),
        )
        .unwrap();
        let output = tensor
            .redistribute(spec.nd_sbp().clone(), spec.device_mesh().clone(), &comm)
            .unwrap();
        (tensor.local_shard().to_data(), output.local_shard().to_data())
    })
}

#[rstest]
#[case(&[4], &[2, 2])]
#[case(&[2, 2], &[4])]
fn test_regroup_between_1d_and_2d(#[case] source_shape: &[usize], #[case] destination_shape: &[usize]) {
    let source_mesh = mesh(source_shape);
    let destination_mesh = mesh(destination_shape);
    let global = random_data(&[5, 6], 10);
    let source = NdSbp::new(vec![Sbp::Split(1); source_shape.len()]);
    let destination = match destination_shape.len() {
        1 => NdSbp::new([Sbp::PartialSum]),
        _ => NdSbp::new([Sbp::Split(0), Sbp::Split(1)]),
    };

    let plan = BoxingPlanner::default()
        .plan(
            &[5, 6],
            &spec(source.clone(), &source_mesh),
            &spec(destination.clone(), &destination_mesh),
        )
        .unwrap();
    assert_eq!(plan.route(), BoxingRoute::Regroup);

    let shards = expect_consistent::<2, Float>(redistribute_all(
        &global,
        &spec(source, &source_mesh),
        &destination,
        &destination_mesh,
        &config(),
    ))
    .unwrap();

    assert_close(
        &reconstruct_data(shards, &destination, &destination_mesh),
        &global,
    );
}

#[test]
fn test_regroup_reordered_devices() {
    let source_mesh = mesh(&[4]);
    let reversed = DeviceMesh::new((0..4).rev().map(Rank).collect(), [4]).unwrap();
    let global = random_data(&[8], 10);
    let destination = NdSbp::new([Sbp::Split(0)]);

    let shards = expect_consistent::<1, Float>(redistribute_all(
        &global,
        &spec([Sbp::Split(0)], &source_mesh),
        &destination,
        &reversed,
        &config(),
    ))
    .unwrap();

    // Rank 3 sits at coordinate 0 of the reversed mesh.
    let values = global.to_vec::<f32>().unwrap();
    let (_, first) = shards.iter().find(|(rank, _)| *rank == Rank(3)).unwrap();
    assert_eq!(first.to_data().to_vec::<f32>().unwrap(), values[..2].to_vec());
    assert_close(&reconstruct_data(shards, &destination, &reversed), &global);
}

#[test]
fn test_mesh_change_without_regroup_is_unimplemented() {
    let global = random_data(&[4, 4], 10);
    let results = redistribute_all::<2, Float>(
        &global,
        &spec([Sbp::Split(0)], &mesh(&[4])),
        &NdSbp::new([Sbp::Broadcast, Sbp::Broadcast]),
        &mesh(&[2, 2]),
        &config().with_regroup_across_meshes(false),
    );

    let err = expect_consistent(results).unwrap_err();
    assert!(matches!(err, BoxingError::Unimplemented(_)));
}

#[rstest]
#[case([Sbp::PartialSum, Sbp::Split(0)], [Sbp::Broadcast, Sbp::Split(1)])]
#[case([Sbp::Split(1), Sbp::Broadcast], [Sbp::Split(0), Sbp::PartialSum])]
#[case([Sbp::PartialSum, Sbp::PartialSum], [Sbp::Split(1), Sbp::Broadcast])]
fn test_integer_tensors_sum_exactly(#[case] from: [Sbp; 2], #[case] to: [Sbp; 2]) {
    let mesh = mesh(&[2, 2]);
    let global = TensorData::new((0..35).map(|v| v * 1_000_003i64).collect::<Vec<_>>(), [5, 7]);
    let destination = NdSbp::new(to);

    let shards = expect_consistent::<2, Int>(redistribute_all(
        &global,
        &spec(from, &mesh),
        &destination,
        &mesh,
        &config(),
    ))
    .unwrap();

    let rebuilt = reconstruct_data(shards, &destination, &mesh);
    assert_eq!(
        rebuilt.convert::<i64>().to_vec::<i64>().unwrap(),
        global.to_vec::<i64>().unwrap()
    );
}

#[rstest]
#[case(FillKind::Ones, 1.0)]
#[case(FillKind::Zeros, 0.0)]
fn test_full_then_broadcast(#[case] kind: FillKind, #[case] value: f32) {
    let mesh = mesh(&[2, 2]);
    let spec = spec([Sbp::PartialSum, Sbp::Split(1)], &mesh);
    let cluster = burn_boxing::collective::LocalCluster::new(4, &config());

    let shards = cluster.launch(|comm| {
        use burn_boxing::collective::Collective;

        let tensor = ConsistentTensor::<TestBackend, 2>::full(
            kind,
            None,
            vec![3, 5],
            spec.clone(),
            comm.rank(),
            &Default::default(),
        )
        .unwrap();
        assert_eq!(tensor.dtype(), DType::F32);
        tensor
            .redistribute(NdSbp::broadcast(2), mesh.clone(), &comm)
            .unwrap()
            .into_local_shard()
            .into_data()
    });

    for shard in shards {
        assert_eq!(shard.to_vec::<f32>().unwrap(), vec![value; 15]);
    }
}

#[test]
fn test_double_precision_partial_sum_to_broadcast() {
    type WideBackend = burn_ndarray::NdArray<f64>;

    let mesh = mesh(&[2]);
    let global = TensorData::new(vec![0.1f64, 1e-12, 3.0, -7.5], [4]);
    let cluster = burn_boxing::collective::LocalCluster::new(2, &config());

    let shards = cluster.launch(|comm| {
        use burn_boxing::collective::Collective;

        let tensor = ConsistentTensor::<WideBackend, 1>::from_global(
            global.clone(),
            spec([Sbp::PartialSum], &mesh),
            comm.rank(),
            &Default::default(),
        )
        .unwrap();
        let output = tensor
            .redistribute([Sbp::Broadcast], mesh.clone(), &comm)
            .unwrap();
        assert_eq!(output.dtype(), output.local_shard().dtype());
        assert_eq!(output.dtype(), DType::F64);
        output.into_local_shard().into_data()
    });

    for shard in shards {
        assert_eq!(shard.dtype, DType::F64);
        assert_eq!(shard.to_vec::<f64>().unwrap(), global.to_vec::<f64>().unwrap());
    }
}
