//! Relay server
//!
//! Binds the HTTP signaling listener, serves until shutdown and then tears
//! every peer session down.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;

use crate::error::{Error, Result};
use crate::server::config::ServerConfig;
use crate::session::SessionHandle;
use crate::signaling::{http, Signaling};
use crate::transport::webrtc::WebRtcEngine;
use crate::transport::TransportEngine;

/// Car relay server
pub struct RelayServer {
    config: ServerConfig,
    session: SessionHandle,
    signaling: Signaling,
}

impl RelayServer {
    /// Create a server backed by the WebRTC engine
    ///
    /// Fails if no public IP is configured or the ICE ports are invalid.
    /// Must be called inside a Tokio runtime when a single ICE port is set.
    pub fn new(config: ServerConfig) -> Result<Self> {
        let Some(public_ip) = config.public_ip.as_deref() else {
            return Err(Error::Config(
                "no public IP configured, set ASE_FWSERVER_IP".into(),
            ));
        };
        if public_ip.parse::<std::net::IpAddr>().is_err() {
            return Err(Error::Config(format!("invalid public IP {public_ip:?}")));
        }

        match config.ice_mux_port {
            Some(0) => return Err(Error::Config("ICE UDP port must not be 0".into())),
            Some(_) => {}
            None => {
                let (start, end) = config.ice_port_range;
                if start == 0 || start > end {
                    return Err(Error::Config(format!("invalid ICE port range {start}-{end}")));
                }
            }
        }

        let engine = WebRtcEngine::new(config.webrtc_settings())?;
        Ok(Self::with_engine(config, Arc::new(engine)))
    }

    /// Create a server on top of any transport engine
    pub fn with_engine(config: ServerConfig, engine: Arc<dyn TransportEngine>) -> Self {
        let session = SessionHandle::spawn(config.session_config());
        let signaling = Signaling::new(session.clone(), engine);

        Self {
            config,
            session,
            signaling,
        }
    }

    /// Handle to the running session
    pub fn session(&self) -> &SessionHandle {
        &self.session
    }

    /// Get the bind address
    pub fn bind_addr(&self) -> SocketAddr {
        self.config.bind_addr
    }

    /// Run the server until `shutdown` resolves, then tear every session down
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = listener.local_addr()?;
        tracing::info!(addr = %addr, producer = %self.config.producer_id, "Relay server listening");

        let app = http::router(self.signaling.clone());
        let served = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown.await;
                tracing::info!("Shutdown signal received");
            })
            .await;

        match self.session.shutdown().await {
            Ok(peers) => tracing::info!(peers, "Relay server stopped"),
            Err(e) => tracing::warn!(error = %e, "Session was already closed"),
        }

        served.map_err(Error::from)
    }
}
