mod adapter;
mod async_client;
mod bootstrap;
mod handle;
mod sync_client;

pub use adapter::OptimizerAdapter;
pub use async_client::DiffuseClient;
pub use handle::{RoundGroup, RoundHandle, WindowHandle};
pub use sync_client::SyncClient;
