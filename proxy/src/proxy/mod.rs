//! TCP listener and per-connection orchestration (§4.8).

pub mod handshake;
pub mod pump;
pub mod scram_client;
pub mod stream;
pub mod wire;

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{info, warn, Instrument};

use crate::config::AppConfig;
use crate::context::RequestContext;
use crate::error::ReportableError;
use crate::oidc::{OidcClient, OidcSettings};
use crate::rewriter::Rewriter;
use crate::token_store::TokenStore;

/// Everything a connection handler task needs, shared across the process.
pub struct ProxyDeps {
    pub config: Arc<AppConfig>,
    pub token_store: Arc<TokenStore>,
    pub oidc_settings: Arc<OidcSettings>,
    pub oidc_client: Option<Arc<OidcClient>>,
    pub rewriter: Option<Arc<Rewriter>>,
    pub tls_config: Option<Arc<rustls::ServerConfig>>,
}

/// Accept loop (§4.8): each accepted socket spawns a fresh handler task
/// built from the shared, immutable `deps`. Accept errors are logged and
/// the loop continues.
pub async fn run(deps: Arc<ProxyDeps>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(&deps.config.cli.listen_addr).await?;
    info!(addr = %deps.config.cli.listen_addr, "proxy listener bound");

    loop {
        let (socket, peer_addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };

        let deps = deps.clone();
        tokio::spawn(async move {
            let ctx = RequestContext::new(peer_addr);
            let span = ctx.span.clone();
            handle_connection(socket, deps, ctx).instrument(span).await;
        });
    }
}

async fn handle_connection(socket: tokio::net::TcpStream, deps: Arc<ProxyDeps>, mut ctx: RequestContext) {
    let outcome = handshake::drive(
        socket,
        &deps.config,
        &deps.token_store,
        &deps.oidc_settings,
        deps.oidc_client.as_ref(),
        deps.tls_config.clone(),
        &mut ctx,
    )
    .await;

    match outcome {
        Ok(handshake::HandshakeOutcome::RawPassthrough { client, upstream }) => {
            info!("non-OIDC connection: entering raw passthrough");
            pump::raw_passthrough(client, upstream).await;
        }
        Ok(handshake::HandshakeOutcome::Authenticated(session)) => {
            let (Some(rewriter), Some(oidc_client)) = (deps.rewriter.clone(), deps.oidc_client.clone())
            else {
                warn!("authenticated session but no rewriter/oidc client configured");
                return;
            };
            info!("entering authenticated pump");
            pump::run(*session, rewriter, oidc_client, deps.config.cli.allow_session_escape).await;
        }
        Err(e) => {
            warn!(kind = ?e.get_error_kind(), error = %e, "connection handshake failed");
        }
    }

    ctx.set_stage(crate::context::ConnectionStage::Closed);
}
