use std::net::SocketAddr;
use std::sync::Arc;

use proxy::config::{AppConfig, PermissionAgentKind};
use proxy::oidc::{OidcClient, OidcSettings};
use proxy::policy::{http_agent::HttpAgent, opa::OpaAgent, PolicyAgent};
use proxy::proxy::{stream::load_tls_config, ProxyDeps};
use proxy::rewriter::Rewriter;
use proxy::sidecar::{self, SidecarState};
use proxy::token_store::{run_janitor, TokenStore};
use std::time::Duration;

fn init_tracing(config: &AppConfig) {
    let env_filter = tracing_subscriber::EnvFilter::try_new(&config.cli.log_level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(env_filter);
    match config.cli.log_format {
        proxy::config::LogFormat::Json => builder.json().init(),
        proxy::config::LogFormat::Text => builder.init(),
    }
}

fn build_policy_agent(config: &AppConfig) -> Option<Arc<dyn PolicyAgent>> {
    match config.cli.permission_agent {
        Some(PermissionAgentKind::Opa) => Some(Arc::new(OpaAgent::new(
            config.cli.opa_url.clone().expect("validated at startup"),
            config.cli.opa_select_template.clone(),
            config.cli.opa_create_query.clone(),
            config.cli.opa_update_query.clone(),
            config.cli.opa_delete_query.clone(),
            config.cli.opa_string_escape_char,
        ))),
        Some(PermissionAgentKind::Http) => Some(Arc::new(HttpAgent::new(
            config.cli.http_agent_ddl_endpoint.clone().expect("validated at startup"),
            config.cli.http_agent_select_endpoint.clone().expect("validated at startup"),
        ))),
        None => None,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = match AppConfig::load() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("startup configuration error: {e}");
            std::process::exit(1);
        }
    };
    init_tracing(&config);

    let oidc_settings = OidcSettings {
        enabled: config.cli.oidc_enabled,
        token_url: config.cli.oidc_token_url.clone(),
        userinfo_url: config.cli.oidc_userinfo_url.clone(),
        db_clients: config.cli.oidc_db_clients.clone(),
        global_client_id: config.cli.oidc_client_id.clone(),
        global_client_secret: config.cli.oidc_client_secret.clone(),
        fallback_enabled: config.cli.oidc_fallback_enabled,
    };
    let oidc_client = config
        .cli
        .oidc_enabled
        .then(|| Arc::new(OidcClient::new(oidc_settings.clone())));

    let policy_agent = build_policy_agent(&config);
    let rewriter = policy_agent.map(|agent| Arc::new(Rewriter::new(agent)));

    let token_store = Arc::new(TokenStore::new(Duration::from_secs(
        config.cli.username_lifetime_seconds,
    )));

    let proxy_tls_config = match (&config.cli.proxy_tls_cert, &config.cli.proxy_tls_key) {
        (Some(cert), Some(key)) => Some(load_tls_config(cert, key)?),
        _ => None,
    };

    let config = Arc::new(config);
    let oidc_settings = Arc::new(oidc_settings);

    tokio::spawn(run_janitor(token_store.clone(), config.cli.api_garbage_collection_period));

    let sidecar_state = Arc::new(SidecarState {
        token_store: token_store.clone(),
        oidc_client: oidc_client.clone(),
        oidc_settings: oidc_settings.clone(),
        rewriter: rewriter.clone(),
    });
    let sidecar_addr: SocketAddr = config.cli.sidecar_listen_addr.parse()?;
    tokio::spawn(async move {
        if let Err(e) = sidecar::run(sidecar_addr, sidecar_state).await {
            tracing::error!(error = %e, "sidecar HTTP API exited");
        }
    });

    let deps = Arc::new(ProxyDeps {
        config: config.clone(),
        token_store,
        oidc_settings,
        oidc_client,
        rewriter,
        tls_config: proxy_tls_config,
    });

    proxy::proxy::run(deps).await?;
    Ok(())
}
