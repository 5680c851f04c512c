use super::DiffuseClient;
use crate::config::DiffuseConfig;
use crate::error::{DiffuseError, Result};
use crate::transport::quic::QuicListener;
use crate::transport::{LocalFabric, LocalTransport, QuicTransport, Transport};
use crate::types::Rank;
use std::net::SocketAddr;
use std::sync::Arc;

impl DiffuseClient {
    /// Bring up `world_size` ranks in this process over an in-memory fabric.
    pub async fn bootstrap_local(world_size: u32, config: DiffuseConfig) -> Result<Vec<Self>> {
        Ok(Self::bootstrap_local_with_fabric(world_size, config).await?.1)
    }

    /// Like [`bootstrap_local`](Self::bootstrap_local), also returning the
    /// fabric for fault injection.
    pub async fn bootstrap_local_with_fabric(
        world_size: u32,
        config: DiffuseConfig,
    ) -> Result<(Arc<LocalFabric>, Vec<Self>)> {
        if world_size == 0 {
            return Err(DiffuseError::config("world_size must be >= 1"));
        }
        let (fabric, transports) = LocalTransport::mesh(world_size);
        let clients = transports
            .into_iter()
            .map(|t| Self::new(Arc::new(t) as Arc<dyn Transport>, config.clone()))
            .collect::<Result<Vec<_>>>()?;
        Ok((fabric, clients))
    }

    /// Bring up `world_size` ranks in this process over QUIC on 127.0.0.1.
    pub async fn bootstrap_quic_local(world_size: u32, config: DiffuseConfig) -> Result<Vec<Self>> {
        config.validate()?;
        let transports = QuicTransport::bootstrap_local(world_size).await?;
        transports
            .into_iter()
            .map(|t| Self::new(Arc::new(t) as Arc<dyn Transport>, config.clone()))
            .collect()
    }

    /// Join a multi-process group over QUIC.
    ///
    /// `addrs[r]` is the listening address of rank `r`; this rank binds
    /// `addrs[rank]` and connects to the others.
    pub async fn connect(rank: Rank, addrs: &[SocketAddr], config: DiffuseConfig) -> Result<Self> {
        config.validate()?;
        let bind = *addrs.get(rank as usize).ok_or(DiffuseError::UnknownRank {
            rank,
            world_size: addrs.len() as u32,
        })?;
        let listener = QuicListener::bind(bind)?;
        let transport = QuicTransport::establish(rank, listener, addrs).await?;
        Self::new(Arc::new(transport), config)
    }
}
