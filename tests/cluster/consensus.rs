use super::helpers::*;
use diffuse::{
    ConsensusAlgorithm, DiffuseConfig, DiffuseError, TensorBuffer, TopologySpec,
    topology::build_topology,
};
use std::time::Duration;

#[tokio::test]
async fn test_ring_of_five_matches_hand_computation() {
    let out = run_ranks(5, DiffuseConfig::default(), |c| async move {
        let v = c.rank() as f64 + 1.0;
        c.register(TensorBuffer::from_f64("w", vec![v])).await;
        let report = c.neighbor_allreduce("w").await.unwrap();
        assert!(report.is_complete());
        scalar(&c, "w").await
    })
    .await;

    let expected = [8.0 / 3.0, 2.0, 3.0, 4.0, 10.0 / 3.0];
    for (got, want) in out.iter().zip(expected) {
        assert_close(*got, want, 1e-12);
    }
}

#[tokio::test]
async fn test_every_family_is_row_stochastic() {
    let specs = [
        TopologySpec::Ring,
        TopologySpec::Star { center: 2 },
        TopologySpec::Full,
        TopologySpec::ExponentialTwo,
        "custom:0->1@0.5,1->2@0.25,2->3@0.5,3->0@0.5,0->2@0.25"
            .parse()
            .unwrap(),
    ];
    for spec in specs {
        let t = build_topology(&spec, 4, false).unwrap();
        assert!(t.is_row_stochastic(1e-9), "{spec} rows do not sum to one");
    }

    let (_fabric, clients) = cluster(6, fast_config(TopologySpec::ExponentialTwo)).await;
    let t = clients[0].set_topology(TopologySpec::Full).unwrap();
    assert!(t.is_row_stochastic(1e-9));
    assert_eq!(t.generation(), 1);
}

#[tokio::test]
async fn test_round_ids_increase_per_buffer() {
    let out = run_ranks(3, DiffuseConfig::default(), |c| async move {
        c.register(TensorBuffer::from_f64("a", vec![1.0])).await;
        c.register(TensorBuffer::from_f64("b", vec![2.0])).await;
        let mut rounds = Vec::new();
        for _ in 0..3 {
            rounds.push(c.neighbor_allreduce("a").await.unwrap().round);
        }
        let b = c.neighbor_allreduce("b").await.unwrap().round;
        (rounds, b)
    })
    .await;
    for (rounds, b) in out {
        assert_eq!(rounds, vec![0, 1, 2]);
        assert_eq!(b, 0);
    }
}

#[tokio::test]
async fn test_concurrent_rounds_on_distinct_buffers() {
    let out = run_ranks(4, DiffuseConfig::default(), |c| async move {
        let r = c.rank() as f64;
        c.register(TensorBuffer::from_f64("x", vec![r])).await;
        c.register(TensorBuffer::from_f64("y", vec![10.0 * r])).await;
        let (x, y) = tokio::join!(c.neighbor_allreduce("x"), c.neighbor_allreduce("y"));
        assert!(x.unwrap().is_complete());
        assert!(y.unwrap().is_complete());
        (scalar(&c, "x").await, scalar(&c, "y").await)
    })
    .await;
    for (x, y) in out {
        assert_close(y, 10.0 * x, 1e-9);
    }
}

#[tokio::test]
async fn test_repeated_rounds_converge_to_mean() {
    let config = DiffuseConfig {
        topology: TopologySpec::ExponentialTwo,
        ..DiffuseConfig::default()
    };
    let out = run_ranks(8, config, |c| async move {
        c.register(TensorBuffer::from_f64("w", vec![c.rank() as f64])).await;
        for _ in 0..40 {
            c.neighbor_allreduce("w").await.unwrap();
        }
        scalar(&c, "w").await
    })
    .await;
    for v in out {
        assert_close(v, 3.5, 1e-6);
    }
}

#[tokio::test]
async fn test_f32_buffer_keeps_dtype() {
    let out = run_ranks(3, DiffuseConfig::default(), |c| async move {
        c.register(TensorBuffer::from_f32("h", vec![c.rank() as f32, 1.0]))
            .await;
        c.neighbor_allreduce("h").await.unwrap();
        c.buffer("h").await.unwrap()
    })
    .await;
    for b in out {
        let v = b.as_f32().unwrap();
        assert!((v[0] - 1.0).abs() < 1e-6);
        assert!((v[1] - 1.0).abs() < 1e-6);
    }
}

#[tokio::test]
async fn test_push_sum_on_directed_ring() {
    let config = DiffuseConfig {
        topology: "custom:0->1,1->2,2->0".parse().unwrap(),
        algorithm: ConsensusAlgorithm::PushSum,
        ..DiffuseConfig::default()
    };
    let out = run_ranks(3, config, |c| async move {
        c.register(TensorBuffer::from_f64("w", vec![3.0 * c.rank() as f64]))
            .await;
        for _ in 0..40 {
            c.neighbor_allreduce("w").await.unwrap();
        }
        scalar(&c, "w").await
    })
    .await;
    for v in out {
        assert_close(v, 3.0, 1e-6);
    }
}

#[tokio::test]
async fn test_exact_diffusion_reaches_mean_without_local_updates() {
    let config = DiffuseConfig {
        algorithm: ConsensusAlgorithm::ExactDiffusion,
        ..DiffuseConfig::default()
    };
    let out = run_ranks(4, config, |c| async move {
        c.register(TensorBuffer::from_f64("w", vec![4.0 * c.rank() as f64]))
            .await;
        for _ in 0..60 {
            c.neighbor_allreduce("w").await.unwrap();
        }
        scalar(&c, "w").await
    })
    .await;
    for v in out {
        assert_close(v, 6.0, 1e-3);
    }
}

#[tokio::test]
async fn test_neighbor_allgather_returns_in_neighbor_values() {
    let out = run_ranks(4, DiffuseConfig::default(), |c| async move {
        c.register(TensorBuffer::from_f64("g", vec![c.rank() as f64])).await;
        let report = c.neighbor_allgather("g").await.unwrap();
        assert!(report.missing.is_empty());
        // Allgather leaves the local value untouched.
        assert_eq!(scalar(&c, "g").await, c.rank() as f64);
        report
            .values
            .into_iter()
            .map(|(r, b)| (r, b.to_f64()[0]))
            .collect::<Vec<_>>()
    })
    .await;
    assert_eq!(out[0], vec![(1, 1.0), (3, 3.0)]);
    assert_eq!(out[2], vec![(1, 1.0), (3, 3.0)]);
}

#[tokio::test]
async fn test_async_handle_completes() {
    let out = run_ranks(3, DiffuseConfig::default(), |c| async move {
        c.register(TensorBuffer::from_f64("w", vec![c.rank() as f64])).await;
        let handle = c.neighbor_allreduce_async("w");
        let report = handle.wait().await.unwrap();
        (report.round, scalar(&c, "w").await)
    })
    .await;
    for (round, v) in out {
        assert_eq!(round, 0);
        assert_close(v, 1.0, 1e-12);
    }
}

#[tokio::test]
async fn test_dropped_handle_leaves_buffer_untouched() {
    let config = DiffuseConfig {
        topology: TopologySpec::Full,
        round_timeout: Duration::from_secs(60),
        ..DiffuseConfig::default()
    };
    let (_fabric, clients) = cluster(2, config).await;
    register_scalars(&clients, "w", &[1.0, 5.0]).await;

    // Rank 1 never joins, so the round can only end by cancellation.
    let handle = clients[0].neighbor_allreduce_async("w");
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!handle.is_finished());
    drop(handle);
    tokio::time::sleep(Duration::from_millis(20)).await;

    let value = tokio::time::timeout(Duration::from_secs(1), scalar(&clients[0], "w"))
        .await
        .expect("buffer lock released after abort");
    assert_eq!(value, 1.0);
}

#[tokio::test]
async fn test_unknown_buffer_is_reported() {
    let (_fabric, clients) = cluster(2, DiffuseConfig::default()).await;
    let err = clients[0].neighbor_allreduce("missing").await.unwrap_err();
    assert!(matches!(err, DiffuseError::UnknownBuffer { .. }));
}

#[tokio::test]
async fn test_shutdown_cancels_pending_round() {
    let config = DiffuseConfig {
        topology: TopologySpec::Full,
        round_timeout: Duration::from_secs(60),
        ..DiffuseConfig::default()
    };
    let (_fabric, clients) = cluster(2, config).await;
    register_scalars(&clients, "w", &[1.0, 5.0]).await;

    let c0 = clients[0].clone();
    let pending = tokio::spawn(async move { c0.neighbor_allreduce("w").await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    clients[0].shutdown().await.unwrap();

    let err = pending.await.unwrap().unwrap_err();
    assert!(matches!(err, DiffuseError::Cancelled));
    assert_eq!(scalar(&clients[0], "w").await, 1.0);
}
