use super::helpers::*;
use diffuse::{DiffuseClient, DiffuseConfig, TensorBuffer};
use std::sync::Arc;

async fn quic_cluster(world_size: u32) -> Vec<Arc<DiffuseClient>> {
    DiffuseClient::bootstrap_quic_local(world_size, DiffuseConfig::default())
        .await
        .unwrap()
        .into_iter()
        .map(Arc::new)
        .collect()
}

#[tokio::test]
async fn test_quic_ring_round() {
    let clients = quic_cluster(4).await;
    register_scalars(&clients, "w", &[0.0, 3.0, 6.0, 9.0]).await;

    let reports = round(&clients, "w").await;
    assert!(reports.iter().all(|r| r.is_complete()));
    // Ring of 4: each rank averages itself with both sides.
    assert_close(scalar(&clients[0], "w").await, (0.0 + 3.0 + 9.0) / 3.0, 1e-12);
    assert_close(scalar(&clients[2], "w").await, (3.0 + 6.0 + 9.0) / 3.0, 1e-12);

    for c in &clients {
        c.shutdown().await.unwrap();
    }
}

#[tokio::test]
async fn test_quic_broadcast_and_barrier() {
    let clients = quic_cluster(3).await;
    clients[1]
        .register(TensorBuffer::from_f32("p", vec![0.25, -1.5, 3.0]))
        .await;

    let out = on_ranks(&clients, |c| async move {
        let b = c.broadcast("p", 1).await.unwrap();
        c.barrier().await.unwrap();
        b
    })
    .await;
    for b in out {
        assert_eq!(b.as_f32().unwrap(), &[0.25, -1.5, 3.0]);
    }
}
