use super::helpers::*;
use diffuse::{DiffuseClient, DiffuseConfig, DiffuseError, TensorBuffer, TopologySpec, Weights};
use std::time::Duration;

async fn wait_for_slot(c: &DiffuseClient, src: u32, expected: f64) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while c.win_slots("x").unwrap()[&src][0] != expected {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_get_then_sync_matches_neighbor_average() {
    let out = run_ranks(5, DiffuseConfig::default(), |c| async move {
        c.register(TensorBuffer::from_f64("x", vec![c.rank() as f64 + 1.0]))
            .await;
        c.win_create("x").await.unwrap();
        let fetched = c.win_get("x", None).await.unwrap();
        assert_eq!(fetched.len(), 2);
        // Nobody may sync before every get has been answered.
        c.barrier().await.unwrap();
        let v = c.win_sync("x", None, None).await.unwrap().to_f64()[0];
        c.win_free("x").await.unwrap();
        v
    })
    .await;
    let expected = [8.0 / 3.0, 2.0, 3.0, 4.0, 10.0 / 3.0];
    for (got, want) in out.iter().zip(expected) {
        assert_close(*got, want, 1e-12);
    }
}

#[tokio::test]
async fn test_accumulate_then_collect() {
    let (_fabric, clients) = cluster(3, DiffuseConfig::default()).await;
    register_scalars(&clients, "x", &[1.0, 2.0, 4.0]).await;
    on_ranks(&clients, |c| async move { c.win_create("x").await.unwrap() }).await;

    // Drain the initial slot values so only the writes below remain.
    for c in &clients {
        c.win_sync_then_collect("x").await.unwrap();
    }
    // Slots start out holding the local value.
    assert_eq!(scalar(&clients[1], "x").await, 6.0);

    let half: Weights = [(1, 0.5)].into_iter().collect();
    clients[0].win_accumulate("x", Some(&half)).await.unwrap();
    clients[0].win_accumulate("x", Some(&half)).await.unwrap();
    // Rank 0 now holds 3; two half-weight writes add up to 3.
    wait_for_slot(&clients[1], 0, 3.0).await;

    let out = clients[1].win_sync_then_collect("x").await.unwrap();
    assert_eq!(out.to_f64(), vec![9.0]);
    assert_eq!(clients[1].win_slots("x").unwrap()[&0], vec![0.0]);
}

#[tokio::test]
async fn test_put_with_update_weights() {
    let (_fabric, clients) = cluster(3, DiffuseConfig::default()).await;
    register_scalars(&clients, "x", &[0.0, 3.0, 6.0]).await;
    on_ranks(&clients, |c| async move { c.win_create("x").await.unwrap() }).await;

    on_ranks(&clients, |c| async move { c.win_put("x", None).await.unwrap() }).await;
    wait_for_slot(&clients[0], 1, 3.0).await;
    wait_for_slot(&clients[0], 2, 6.0).await;

    let weights: Weights = [(0, 0.5), (1, 0.5)].into_iter().collect();
    let decay: Weights = [(1, 0.0)].into_iter().collect();
    let out = clients[0]
        .win_sync("x", Some(&weights), Some(&decay))
        .await
        .unwrap();
    assert_eq!(out.to_f64(), vec![1.5]);
    let slots = clients[0].win_slots("x").unwrap();
    assert_eq!(slots[&1], vec![0.0]);
    assert_eq!(slots[&2], vec![6.0]);
}

#[tokio::test]
async fn test_window_pins_topology() {
    let (_fabric, clients) = cluster(3, DiffuseConfig::default()).await;
    register_scalars(&clients, "x", &[0.0, 0.0, 0.0]).await;
    on_ranks(&clients, |c| async move { c.win_create("x").await.unwrap() }).await;
    assert_eq!(clients[0].win_names(), vec!["x".to_string()]);

    let err = clients[0].set_topology(TopologySpec::Full).unwrap_err();
    assert!(matches!(err, DiffuseError::Config(_)));

    on_ranks(&clients, |c| async move { c.win_free("x").await.unwrap() }).await;
    assert!(clients[0].win_names().is_empty());
    assert!(clients[0].set_topology(TopologySpec::Full).is_ok());
}

#[tokio::test]
async fn test_get_from_silent_rank_degrades() {
    let config = fast_config(TopologySpec::Ring);
    let (fabric, clients) = cluster(3, config).await;
    register_scalars(&clients, "x", &[1.0, 2.0, 3.0]).await;
    on_ranks(&clients, |c| async move { c.win_create("x").await.unwrap() }).await;

    fabric.mute(2);
    let fetched = clients[0].win_get("x", None).await.unwrap();
    assert_eq!(fetched, vec![1]);
    assert_eq!(clients[0].win_slots("x").unwrap()[&2], vec![1.0]);
    assert!(!clients[0].health(2).is_quarantined());
}

#[tokio::test]
async fn test_nonblocking_window_ops() {
    let (_fabric, clients) = cluster(3, DiffuseConfig::default()).await;
    register_scalars(&clients, "x", &[1.0, 2.0, 4.0]).await;
    on_ranks(&clients, |c| async move { c.win_create("x").await.unwrap() }).await;

    let puts: Vec<_> = clients.iter().map(|c| c.win_put_async("x", None)).collect();
    for handle in puts {
        handle.wait().await.unwrap();
    }
    on_ranks(&clients, |c| async move { c.win_fence("x").await.unwrap() }).await;
    assert_eq!(clients[0].win_slots("x").unwrap()[&2], vec![4.0]);

    let double: Weights = [(0, 2.0)].into_iter().collect();
    let acc = clients[1].win_accumulate_async("x", Some(double));
    acc.wait().await.unwrap();
    on_ranks(&clients, |c| async move { c.win_fence("x").await.unwrap() }).await;
    assert_eq!(clients[0].win_slots("x").unwrap()[&1], vec![6.0]);

    let get = clients[2].win_get_async("x", None);
    while !get.is_finished() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    assert_eq!(get.wait().await.unwrap(), vec![0, 1]);
    assert_eq!(clients[2].win_slots("x").unwrap()[&0], vec![1.0]);
}

#[tokio::test]
async fn test_locked_window_applies_writes_on_unlock() {
    let (_fabric, clients) = cluster(3, DiffuseConfig::default()).await;
    register_scalars(&clients, "x", &[1.0, 2.0, 4.0]).await;
    on_ranks(&clients, |c| async move { c.win_create("x").await.unwrap() }).await;

    let lock = clients[0].win_lock("x").await.unwrap();
    let to_zero: Weights = [(0, 1.0)].into_iter().collect();
    clients[2].win_accumulate("x", Some(&to_zero)).await.unwrap();
    on_ranks(&clients, |c| async move { c.win_fence("x").await.unwrap() }).await;

    // Folding under the lock sees the pre-lock slots only.
    let out = clients[0].win_sync_then_collect("x").await.unwrap();
    assert_eq!(out.to_f64(), vec![1.0 + 2.0 + 4.0]);
    drop(lock);
    assert_eq!(clients[0].win_slots("x").unwrap()[&2], vec![4.0]);
}
