use diffuse::{DiffuseClient, DiffuseConfig, LocalFabric, RoundReport, TensorBuffer, TopologySpec};
use std::sync::Arc;
use std::time::Duration;

/// Short deadlines and immediate reconfiguration so fault tests finish fast.
pub fn fast_config(topology: TopologySpec) -> DiffuseConfig {
    DiffuseConfig {
        topology,
        round_timeout: Duration::from_millis(300),
        sync_timeout: Duration::from_secs(2),
        barrier_timeout: Duration::from_secs(2),
        reconfigure_interval: Duration::ZERO,
        ..DiffuseConfig::default()
    }
}

/// Bring up an in-process cluster, keeping the fabric for fault injection.
pub async fn cluster(
    world_size: u32,
    config: DiffuseConfig,
) -> (Arc<LocalFabric>, Vec<Arc<DiffuseClient>>) {
    let (fabric, clients) = DiffuseClient::bootstrap_local_with_fabric(world_size, config)
        .await
        .unwrap();
    (fabric, clients.into_iter().map(Arc::new).collect())
}

/// Run `f` on every rank concurrently and return the outputs in rank order.
/// Keeps all clients alive until every task completes.
pub async fn run_ranks<F, Fut, T>(world_size: u32, config: DiffuseConfig, f: F) -> Vec<T>
where
    F: Fn(Arc<DiffuseClient>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let (_fabric, clients) = cluster(world_size, config).await;
    on_ranks(&clients, f).await
}

/// Run `f` concurrently on each of `clients`.
pub async fn on_ranks<F, Fut, T>(clients: &[Arc<DiffuseClient>], f: F) -> Vec<T>
where
    F: Fn(Arc<DiffuseClient>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let f = Arc::new(f);
    let handles: Vec<_> = clients
        .iter()
        .map(|c| {
            let c = Arc::clone(c);
            let f = Arc::clone(&f);
            tokio::spawn(async move { f(c).await })
        })
        .collect();
    let mut out = Vec::with_capacity(handles.len());
    for h in handles {
        out.push(h.await.unwrap());
    }
    out
}

/// Register a one-element `f64` buffer `name` on each client.
pub async fn register_scalars(clients: &[Arc<DiffuseClient>], name: &str, values: &[f64]) {
    for (c, &v) in clients.iter().zip(values) {
        c.register(TensorBuffer::from_f64(name, vec![v])).await;
    }
}

/// One consensus round on `name` at every client in `clients`.
pub async fn round(clients: &[Arc<DiffuseClient>], name: &'static str) -> Vec<RoundReport> {
    on_ranks(clients, move |c| async move { c.neighbor_allreduce(name).await.unwrap() }).await
}

pub async fn scalar(client: &DiffuseClient, name: &str) -> f64 {
    client.buffer(name).await.unwrap().to_f64()[0]
}

pub fn assert_close(actual: f64, expected: f64, tol: f64) {
    assert!(
        (actual - expected).abs() <= tol,
        "expected {expected} ± {tol}, got {actual}"
    );
}
