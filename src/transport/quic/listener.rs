use super::tls::{EndpointIdentity, SERVER_NAME, client_config, transport_config};
use crate::error::{DiffuseError, Result};
use std::net::SocketAddr;
use std::sync::Arc;

/// A bound QUIC endpoint that both accepts and initiates connections.
pub struct QuicListener {
    endpoint: quinn::Endpoint,
    local_addr: SocketAddr,
}

impl QuicListener {
    /// Bind on `addr` with a fresh self-signed certificate.
    pub fn bind(addr: SocketAddr) -> Result<Self> {
        let transport = transport_config();
        let server_config = EndpointIdentity::generate()?.server_config(Arc::clone(&transport))?;

        let mut endpoint = quinn::Endpoint::server(server_config, addr)
            .map_err(|e| DiffuseError::transport_with_source(format!("bind {addr}"), e))?;
        endpoint.set_default_client_config(client_config(transport)?);

        let local_addr = endpoint
            .local_addr()
            .map_err(|e| DiffuseError::transport_with_source("local_addr", e))?;

        Ok(Self {
            endpoint,
            local_addr,
        })
    }

    /// Accept the next incoming QUIC connection.
    pub async fn accept(&self) -> Result<quinn::Connection> {
        let incoming = self
            .endpoint
            .accept()
            .await
            .ok_or_else(|| DiffuseError::transport("endpoint closed"))?;

        incoming
            .await
            .map_err(|e| DiffuseError::transport_with_source("accept", e))
    }

    /// Connect to a peer's listener.
    pub async fn connect(&self, addr: SocketAddr) -> Result<quinn::Connection> {
        let connecting = self
            .endpoint
            .connect(addr, SERVER_NAME)
            .map_err(|e| DiffuseError::transport_with_source(format!("connect {addr}"), e))?;
        connecting
            .await
            .map_err(|e| DiffuseError::transport_with_source(format!("handshake {addr}"), e))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub(crate) fn endpoint(&self) -> &quinn::Endpoint {
        &self.endpoint
    }
}
