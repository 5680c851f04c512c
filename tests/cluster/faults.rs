use super::helpers::*;
use diffuse::{DiffuseConfig, DiffuseError, FaultReason, RankHealth, TopologySpec};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_deadline_merges_partial_round() {
    let (fabric, clients) = cluster(3, fast_config(TopologySpec::Full)).await;
    register_scalars(&clients, "w", &[0.0, 3.0, 6.0]).await;
    fabric.drop_link(2, 0);

    let reports = round(&clients, "w").await;
    assert!(reports[0].timed_out);
    assert_eq!(reports[0].missing, vec![2]);
    assert_eq!(reports[0].received, vec![1]);
    assert!(reports[1].is_complete());
    assert!(reports[2].is_complete());

    // Rank 0 renormalizes over itself and rank 1.
    assert_close(scalar(&clients[0], "w").await, 1.5, 1e-12);
    assert_close(scalar(&clients[1], "w").await, 3.0, 1e-12);
    assert_eq!(clients[0].health(2), RankHealth::Suspect { failures: 1 });
}

#[tokio::test]
async fn test_dead_rank_is_quarantined_and_excluded() {
    let config = DiffuseConfig {
        quarantine_threshold: 3,
        ..fast_config(TopologySpec::Ring)
    };
    let (fabric, clients) = cluster(4, config).await;
    register_scalars(&clients, "w", &[0.0, 1.0, 2.0, 3.0]).await;
    fabric.kill(2);
    let live: Vec<_> = [0, 1, 3].iter().map(|&r| Arc::clone(&clients[r])).collect();

    // A failed send and the missing contribution count as one failure.
    let reports = round(&live, "w").await;
    assert!(reports[1].timed_out);
    assert_eq!(clients[1].health(2), RankHealth::Suspect { failures: 1 });
    assert_eq!(clients[0].health(2), RankHealth::Healthy);

    round(&live, "w").await;
    assert_eq!(clients[3].health(2), RankHealth::Suspect { failures: 2 });

    round(&live, "w").await;
    for r in [1, 3] {
        assert_eq!(clients[r].health(2), RankHealth::Quarantined);
        let topo = clients[r].topology();
        assert!(topo.is_quarantined(2));
        assert!(!topo.in_neighbors(r as u32).contains(&2));
        assert!(topo.generation() >= 1);
        assert!(topo.is_row_stochastic(1e-9));
        let history = clients[r].fault_history();
        assert_eq!(history.last().map(|f| f.rank), Some(2));
    }

    let reports = round(&live, "w").await;
    for report in reports {
        assert!(report.is_complete(), "{report:?}");
    }
}

#[tokio::test]
async fn test_quarantined_rank_is_readmitted_on_contact() {
    let config = DiffuseConfig {
        quarantine_threshold: 3,
        ..fast_config(TopologySpec::Ring)
    };
    let (fabric, clients) = cluster(4, config).await;
    register_scalars(&clients, "w", &[0.0, 1.0, 2.0, 3.0]).await;
    fabric.drop_link(2, 1);

    for _ in 0..3 {
        round(&clients, "w").await;
    }
    assert_eq!(clients[1].health(2), RankHealth::Quarantined);
    assert!(clients[1].topology().is_quarantined(2));
    let mut events = clients[1].subscribe();

    fabric.restore_link(2, 1);
    // Rank 2's next contribution counts as contact even though rank 1 no
    // longer expects it.
    for _ in 0..2 {
        round(&clients, "w").await;
    }
    assert_eq!(clients[1].health(2), RankHealth::Healthy);
    assert!(!clients[1].topology().is_quarantined(2));
    assert!(!clients[2].health(1).is_quarantined());

    let mut readmitted = Vec::new();
    while let Ok(event) = events.try_recv() {
        readmitted.extend(event.readmitted);
    }
    assert!(readmitted.contains(&2));
}

#[tokio::test]
async fn test_leave_is_quarantined_immediately() {
    let (_fabric, clients) = cluster(4, fast_config(TopologySpec::Ring)).await;
    register_scalars(&clients, "w", &[0.0, 1.0, 2.0, 3.0]).await;

    clients[2].shutdown().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    for r in [0, 1, 3] {
        assert_eq!(clients[r].health(2), RankHealth::Quarantined);
        let history = clients[r].fault_history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].reason, FaultReason::ExplicitLeave);
    }

    let live: Vec<_> = [0, 1, 3].iter().map(|&r| Arc::clone(&clients[r])).collect();
    let reports = round(&live, "w").await;
    assert!(reports.iter().all(|r| r.is_complete()));
    // Rows that lost rank 2 are rescaled over what remains.
    assert_close(scalar(&clients[0], "w").await, 4.0 / 3.0, 1e-12);
    assert_close(scalar(&clients[1], "w").await, 0.5, 1e-12);
    assert_close(scalar(&clients[3], "w").await, 1.5, 1e-12);
}

#[tokio::test]
async fn test_disconnected_topology_is_latched() {
    let config = DiffuseConfig {
        topology: "custom:0->1,1->0,1->2,2->1".parse().unwrap(),
        quarantine_threshold: 1,
        ..fast_config(TopologySpec::Ring)
    };
    let (fabric, clients) = cluster(3, config).await;
    register_scalars(&clients, "w", &[0.0, 1.0, 2.0]).await;
    fabric.kill(1);

    // The round that discovers the fault still finishes.
    let report = clients[0].neighbor_allreduce("w").await.unwrap();
    assert!(report.timed_out);
    assert_eq!(scalar(&clients[0], "w").await, 0.0);

    let err = clients[0].neighbor_allreduce("w").await.unwrap_err();
    assert!(matches!(err, DiffuseError::TopologyDisconnected { .. }));
}

#[tokio::test]
async fn test_isolated_rank_keeps_its_value() {
    let config = DiffuseConfig {
        topology: "custom:0->1,1->0".parse().unwrap(),
        require_connected: false,
        ..DiffuseConfig::default()
    };
    let (_fabric, clients) = cluster(3, config).await;
    register_scalars(&clients, "w", &[2.0, 4.0, 9.0]).await;

    for expected_round in 0..2 {
        let report = clients[2].neighbor_allreduce("w").await.unwrap();
        assert!(report.isolated);
        assert_eq!(report.round, expected_round);
        assert_eq!(scalar(&clients[2], "w").await, 9.0);
    }

    let pair: Vec<_> = clients[..2].to_vec();
    round(&pair, "w").await;
    assert_close(scalar(&clients[0], "w").await, 3.0, 1e-12);
    assert_close(scalar(&clients[1], "w").await, 3.0, 1e-12);
}
