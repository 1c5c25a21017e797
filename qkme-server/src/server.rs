//! mTLS HTTP/1.1 server
//!
//! Each accepted connection completes a TLS handshake, resolves the client
//! certificate to an SAE_ID once, then serves requests on its own task.

use crate::config::KmeConfig;
use crate::handlers::{handle_request, AppState};
use crate::tls;
use anyhow::Context;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use qkme_core::auth::{IdentityResolver, InMemorySaeRegistry, SaeRegistry};
use qkme_core::SaeId;
use qkme_engine::*;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

/// Wire the pool, generator, registry and audit trail described by `config`
pub fn build_state(config: &KmeConfig) -> anyhow::Result<AppState> {
    let pool_config = config.pool_config();

    let store = open_pool(&pool_config, config.data_dir.as_deref())
        .context("Failed to open key pool")?;
    let link = Arc::new(SimulatedQkdLink::new(
        Duration::from_millis(config.link.latency_ms),
        config.link.max_batch,
    ));
    let manager = KeyPoolManager::new(store, link, pool_config);

    let registry: Arc<dyn SaeRegistry> = Arc::new(
        InMemorySaeRegistry::load(&config.registry).with_context(|| {
            format!("Failed to load SAE registry {}", config.registry.display())
        })?,
    );

    let mut audit = AuditLog::new().with_sink(Arc::new(TracingAuditSink));
    if let Some(path) = &config.audit_log {
        let sink = FileAuditSink::open(path)
            .with_context(|| format!("Failed to open audit log {}", path.display()))?;
        audit = audit.with_sink(Arc::new(sink));
    }

    let engine = KeyDistributionEngine::new(manager, AuthorizationEngine::new(audit), registry.clone());
    Ok(AppState::new(config, engine, registry)?)
}

pub struct KmeServer {
    state: Arc<AppState>,
    acceptor: TlsAcceptor,
    resolver: Arc<IdentityResolver>,
}

impl KmeServer {
    pub fn new(state: AppState, acceptor: TlsAcceptor) -> Self {
        let resolver = Arc::new(IdentityResolver::new(state.registry.clone()));
        Self {
            state: Arc::new(state),
            acceptor,
            resolver,
        }
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        info!("qkme {} listening on {}", self.state.kme_id, addr);

        loop {
            let (stream, remote_addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    continue;
                }
            };
            debug!("New connection from {}", remote_addr);

            let acceptor = self.acceptor.clone();
            let resolver = self.resolver.clone();
            let state = self.state.clone();
            tokio::spawn(async move {
                if let Err(err) =
                    Self::handle_connection(stream, remote_addr, acceptor, resolver, state).await
                {
                    error!("Connection error from {}: {:#}", remote_addr, err);
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        remote_addr: SocketAddr,
        acceptor: TlsAcceptor,
        resolver: Arc<IdentityResolver>,
        state: Arc<AppState>,
    ) -> anyhow::Result<()> {
        let stream = acceptor
            .accept(stream)
            .await
            .context("TLS handshake failed")?;

        let caller: Option<SaeId> =
            match tls::peer_certificate(stream.get_ref().1).and_then(|cert| resolver.resolve(&cert)) {
                Ok(sae_id) => {
                    debug!("Connection from {} authenticated as {}", remote_addr, sae_id);
                    Some(sae_id)
                }
                Err(e) => {
                    warn!("Connection from {} not authenticated: {}", remote_addr, e);
                    None
                }
            };

        let io = TokioIo::new(stream);
        let service = service_fn(move |req| {
            let state = state.clone();
            let caller = caller.clone();
            async move { handle_request(req, state, caller).await }
        });

        http1::Builder::new()
            .serve_connection(io, service)
            .await
            .context("HTTP/1.1 connection error")?;

        Ok(())
    }
}
