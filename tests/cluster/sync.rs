use super::helpers::*;
use diffuse::{DiffuseConfig, DiffuseError, TensorBuffer, TensorData, TopologySpec};
use std::time::Duration;

fn weights(n: usize) -> Vec<f32> {
    (0..n).map(|i| (i as f32).sin() * 1e-3 + i as f32).collect()
}

#[tokio::test]
async fn test_broadcast_is_bit_identical() {
    let out = run_ranks(4, DiffuseConfig::default(), |c| async move {
        // Rank 3 starts without the buffer; the others hold stale values.
        match c.rank() {
            0 => {
                let b = TensorBuffer::new("p", vec![4, 8], TensorData::F32(weights(32))).unwrap();
                c.register(b).await;
            }
            3 => {}
            r => {
                let stale = TensorData::F32(vec![r as f32; 32]);
                c.register(TensorBuffer::new("p", vec![4, 8], stale).unwrap())
                    .await
            }
        }
        c.broadcast("p", 0).await.unwrap()
    })
    .await;

    let expected = weights(32);
    for b in &out {
        assert_eq!(b.shape, vec![4, 8]);
        let got = b.as_f32().unwrap();
        assert!(
            got.iter()
                .zip(&expected)
                .all(|(a, e)| a.to_bits() == e.to_bits())
        );
    }
}

#[tokio::test]
async fn test_broadcast_with_dead_rank_fails_everywhere() {
    let config = DiffuseConfig {
        sync_timeout: Duration::from_millis(300),
        ..DiffuseConfig::default()
    };
    let (fabric, clients) = cluster(3, config).await;
    register_scalars(&clients, "p", &[7.0, 1.0, 2.0]).await;
    fabric.kill(2);

    let out = on_ranks(&clients[..2], |c| async move { c.broadcast("p", 0).await }).await;
    for res in out {
        match res {
            Err(DiffuseError::IncompleteBroadcast { root, .. }) => assert_eq!(root, 0),
            other => panic!("expected IncompleteBroadcast, got {other:?}"),
        }
    }
    // Rank 1 did not install the root's value.
    assert_eq!(scalar(&clients[1], "p").await, 1.0);
}

#[tokio::test]
async fn test_broadcast_rejects_incompatible_buffer() {
    let config = DiffuseConfig {
        sync_timeout: Duration::from_millis(300),
        ..DiffuseConfig::default()
    };
    let out = run_ranks(2, config, |c| async move {
        let len = if c.rank() == 0 { 4 } else { 3 };
        c.register(TensorBuffer::from_f64("p", vec![1.0; len])).await;
        c.broadcast("p", 0).await
    })
    .await;
    assert!(out.iter().all(|r| r.is_err()));
}

#[tokio::test]
async fn test_allreduce_average_matches_everywhere() {
    let out = run_ranks(5, DiffuseConfig::default(), |c| async move {
        let r = c.rank() as f64;
        c.register(TensorBuffer::from_f64("g", vec![r, 0.1 * r, -r]))
            .await;
        c.allreduce("g", true).await.unwrap().to_f64()
    })
    .await;
    for v in &out {
        assert_eq!(v, &out[0]);
    }
    assert_close(out[0][0], 2.0, 1e-12);
    assert_close(out[0][1], 0.2, 1e-12);
    assert_close(out[0][2], -2.0, 1e-12);
}

#[tokio::test]
async fn test_allgather_is_rank_ordered() {
    let out = run_ranks(3, DiffuseConfig::default(), |c| async move {
        c.register(TensorBuffer::from_f64("s", vec![c.rank() as f64 * 2.0]))
            .await;
        c.allgather("s")
            .await
            .unwrap()
            .iter()
            .map(|b| b.to_f64()[0])
            .collect::<Vec<_>>()
    })
    .await;
    for v in out {
        assert_eq!(v, vec![0.0, 2.0, 4.0]);
    }
}

#[tokio::test]
async fn test_barrier_repeats() {
    let out = run_ranks(4, fast_config(TopologySpec::Ring), |c| async move {
        for _ in 0..5 {
            c.barrier().await?;
        }
        Ok::<_, DiffuseError>(())
    })
    .await;
    assert!(out.into_iter().all(|r| r.is_ok()));
}

#[tokio::test]
async fn test_barrier_times_out_without_peer() {
    let config = DiffuseConfig {
        barrier_timeout: Duration::from_millis(200),
        ..DiffuseConfig::default()
    };
    let (_fabric, clients) = cluster(3, config).await;
    let out = on_ranks(&clients[..2], |c| async move { c.barrier().await }).await;
    for res in out {
        assert!(matches!(res, Err(DiffuseError::BarrierTimeout { .. })));
    }
}
