use super::helpers::*;
use diffuse::{DiffuseConfig, OptimizerAdapter, TensorBuffer, TopologySpec};
use std::sync::Arc;

#[tokio::test]
async fn test_training_steps_track_the_mean() {
    let config = DiffuseConfig {
        topology: TopologySpec::Full,
        ..DiffuseConfig::default()
    };
    let out = run_ranks(4, config, |c| async move {
        let adapter = OptimizerAdapter::new(c);
        let mut w = adapter.client().rank() as f64;
        for _ in 0..3 {
            // Every rank applies the same step, so the mean moves by one.
            adapter
                .on_step_begin(vec![TensorBuffer::from_f64("w", vec![w + 1.0])])
                .await;
            w = adapter.consensus_step("w").await.unwrap().to_f64()[0];
        }
        let report = adapter.last_report("w").unwrap();
        assert_eq!(report.round, 2);
        w
    })
    .await;
    for w in out {
        assert_close(w, 1.5 + 3.0, 1e-12);
    }
}

#[tokio::test]
async fn test_checkpoint_restore_from_root() {
    let (_fabric, clients) = cluster(3, DiffuseConfig::default()).await;
    // Only rank 0 has ever seen these buffers.
    let out = on_ranks(&clients, |c| async move {
        let adapter = OptimizerAdapter::new(Arc::clone(&c));
        let checkpoint = vec![
            TensorBuffer::from_f32("layer.weight", vec![0.5; 6]),
            TensorBuffer::from_f64("layer.bias", vec![-2.0]),
        ];
        let restored = adapter.on_checkpoint_restore(checkpoint, 0).await.unwrap();
        assert_eq!(restored.len(), 2);
        let names = c.buffer_names();
        let bias = c.buffer("layer.bias").await.unwrap().to_f64();
        (names, bias)
    })
    .await;
    for (mut names, bias) in out {
        names.sort();
        assert_eq!(names, vec!["layer.bias".to_string(), "layer.weight".to_string()]);
        assert_eq!(bias, vec![-2.0]);
    }
}

#[tokio::test]
async fn test_consensus_step_all() {
    let out = run_ranks(3, DiffuseConfig::default(), |c| async move {
        let r = c.rank() as f64;
        let adapter = OptimizerAdapter::new(c);
        adapter
            .on_step_begin(vec![
                TensorBuffer::from_f64("a", vec![r]),
                TensorBuffer::from_f64("b", vec![2.0 * r]),
            ])
            .await;
        let merged = adapter.consensus_step_all(&["a", "b"]).await.unwrap();
        merged.iter().map(|b| b.to_f64()[0]).collect::<Vec<_>>()
    })
    .await;
    for v in out {
        assert_eq!(v.len(), 2);
        assert_close(v[0], 1.0, 1e-12);
        assert_close(v[1], 2.0, 1e-12);
    }
}
