//! Configuration surface (§6): CLI flags + environment variables, parsed
//! once at startup and then shared immutably with every task (§5).

use std::collections::HashMap;
use std::time::Duration;

use camino::Utf8PathBuf;
use clap::{Parser, ValueEnum};

#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
pub enum DestinationType {
    Postgres,
}

#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
pub enum PermissionAgentKind {
    Opa,
    Http,
}

#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI surface. Every field here is immutable for the lifetime
/// of the process once [`AppConfig::load`] returns.
#[derive(Parser, Debug, Clone)]
#[command(name = "proxy", about = "Authenticating, SQL-rewriting PostgreSQL proxy")]
pub struct Cli {
    /// Address the proxy listens on for client connections.
    #[arg(long, env = "PROXY_LISTEN_ADDR", default_value = "0.0.0.0:6432")]
    pub listen_addr: String,

    /// Address the sidecar HTTP API listens on.
    #[arg(long, env = "SIDECAR_LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    pub sidecar_listen_addr: String,

    /// Destination database type. `postgres` is the only supported value.
    #[arg(long, env = "DEST_TYPE", value_enum, default_value = "postgres")]
    pub dest_type: DestinationType,

    /// Destination database host.
    #[arg(long, env = "DEST_HOST")]
    pub dest_host: String,

    /// Destination database port.
    #[arg(long, env = "DEST_PORT", default_value_t = 5432)]
    pub dest_port: u16,

    /// Service account username used to authenticate to the destination.
    #[arg(long, env = "DEST_SERVICE_USER")]
    pub dest_service_user: String,

    /// Service account password used to authenticate to the destination.
    #[arg(long, env = "DEST_SERVICE_PASSWORD")]
    pub dest_service_password: String,

    /// Whether OIDC authentication is enabled at all.
    #[arg(long, env = "OIDC_ENABLED", default_value_t = false)]
    pub oidc_enabled: bool,

    /// Global (fallback) OIDC client id.
    #[arg(long, env = "OIDC_CLIENT_ID")]
    pub oidc_client_id: Option<String>,

    /// Global (fallback) OIDC client secret.
    #[arg(long, env = "OIDC_CLIENT_SECRET")]
    pub oidc_client_secret: Option<String>,

    /// OIDC token endpoint URL.
    #[arg(long, env = "OIDC_TOKEN_URL")]
    pub oidc_token_url: Option<String>,

    /// OIDC userinfo endpoint URL.
    #[arg(long, env = "OIDC_USERINFO_URL")]
    pub oidc_userinfo_url: Option<String>,

    /// Per-database OIDC client mapping, `db=client,db=client` syntax.
    #[arg(long, env = "OIDC_DB_CLIENTS", value_parser = parse_db_client_map, default_value = "")]
    pub oidc_db_clients: HashMap<String, String>,

    /// Whether to fall back to the global OIDC client when a database has no
    /// specific mapping in `oidc_db_clients`.
    #[arg(long, env = "OIDC_FALLBACK_ENABLED", default_value_t = true)]
    pub oidc_fallback_enabled: bool,

    /// Path to a SQL template rendered and executed against `userinfo`
    /// immediately after upstream authentication succeeds.
    #[arg(long, env = "POST_AUTH_TEMPLATE")]
    pub post_auth_template: Option<Utf8PathBuf>,

    /// Which policy agent implementation to use.
    #[arg(long, env = "PERMISSION_AGENT", value_enum)]
    pub permission_agent: Option<PermissionAgentKind>,

    /// OPA base address, e.g. `http://localhost:8181`.
    #[arg(long, env = "OPA_URL")]
    pub opa_url: Option<String>,

    /// `text/template`-style select query template; must contain `{{.TableName}}`.
    #[arg(
        long,
        env = "OPA_SELECT_TEMPLATE",
        default_value = "data.tables.allow with input.table as {{.TableName}}"
    )]
    pub opa_select_template: String,

    /// Fixed OPA query string used for `create` DDL checks.
    #[arg(long, env = "OPA_CREATE_QUERY", default_value = "data.tables.create_allowed")]
    pub opa_create_query: String,

    /// Fixed OPA query string used for `update` DDL checks.
    #[arg(long, env = "OPA_UPDATE_QUERY", default_value = "data.tables.update_allowed")]
    pub opa_update_query: String,

    /// Fixed OPA query string used for `delete` DDL checks.
    #[arg(long, env = "OPA_DELETE_QUERY", default_value = "data.tables.delete_allowed")]
    pub opa_delete_query: String,

    /// Character used to quote string literals compiled from OPA terms.
    #[arg(long, env = "OPA_STRING_ESCAPE_CHAR", default_value = "'")]
    pub opa_string_escape_char: char,

    /// HTTP policy agent's DDL-check endpoint.
    #[arg(long, env = "HTTP_AGENT_DDL_ENDPOINT")]
    pub http_agent_ddl_endpoint: Option<String>,

    /// HTTP policy agent's select-filters endpoint.
    #[arg(long, env = "HTTP_AGENT_SELECT_ENDPOINT")]
    pub http_agent_select_endpoint: Option<String>,

    /// Whether to `SET SESSION AUTHORIZATION` to the end user's role after
    /// upstream auth.
    #[arg(long, env = "ASSUME_USER_SESSION", default_value_t = false)]
    pub assume_user_session: bool,

    /// Userinfo claim holding the database role name to assume.
    #[arg(long, env = "ASSUME_USERNAME_CLAIM", default_value = "preferred_username")]
    pub assume_username_claim: String,

    /// Whether clients may issue session-escape statements
    /// (`RESET ROLE`, `SET SESSION AUTHORIZATION DEFAULT`, ...).
    #[arg(long, env = "ALLOW_SESSION_ESCAPE", default_value_t = false)]
    pub allow_session_escape: bool,

    /// TLS certificate for the client-facing proxy listener.
    #[arg(long, env = "PROXY_TLS_CERT")]
    pub proxy_tls_cert: Option<Utf8PathBuf>,

    /// TLS private key for the client-facing proxy listener.
    #[arg(long, env = "PROXY_TLS_KEY")]
    pub proxy_tls_key: Option<Utf8PathBuf>,

    /// TLS certificate for the sidecar HTTP API.
    #[arg(long, env = "SIDECAR_TLS_CERT")]
    pub sidecar_tls_cert: Option<Utf8PathBuf>,

    /// TLS private key for the sidecar HTTP API.
    #[arg(long, env = "SIDECAR_TLS_KEY")]
    pub sidecar_tls_key: Option<Utf8PathBuf>,

    /// Lifetime, in seconds, of a registered OIDC username before the
    /// janitor considers it expired.
    #[arg(long, env = "USERNAME_LIFETIME_SECONDS", default_value_t = 3600)]
    pub username_lifetime_seconds: u64,

    /// Interval at which the sidecar janitor sweeps expired usernames.
    #[arg(long, env = "API_GARBAGE_COLLECTION_PERIOD", value_parser = humantime::parse_duration, default_value = "60s")]
    pub api_garbage_collection_period: Duration,

    /// Timeout for the upstream SCRAM handshake (§5).
    #[arg(long, env = "SCRAM_PROTOCOL_TIMEOUT", value_parser = humantime::parse_duration, default_value = "30s")]
    pub scram_protocol_timeout: Duration,

    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value = "text")]
    pub log_format: LogFormat,
}

fn parse_db_client_map(s: &str) -> Result<HashMap<String, String>, String> {
    let mut map = HashMap::new();
    if s.is_empty() {
        return Ok(map);
    }
    for pair in s.split(',') {
        let (db, client) = pair
            .split_once('=')
            .ok_or_else(|| format!("invalid db=client pair: '{pair}'"))?;
        map.insert(db.to_string(), client.to_string());
    }
    Ok(map)
}

/// Errors that abort startup before any socket is opened (§6 exit code 1).
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unsupported destination type; only 'postgres' is supported")]
    UnsupportedDestinationType,
    #[error("TLS cert file not found: {0}")]
    MissingTlsCert(Utf8PathBuf),
    #[error("TLS key file not found: {0}")]
    MissingTlsKey(Utf8PathBuf),
    #[error("post-auth template file not found: {0}")]
    MissingTemplate(Utf8PathBuf),
    #[error("permission agent '{0:?}' selected but required config is missing")]
    IncompletePermissionAgentConfig(PermissionAgentKind),
}

/// Fully validated, immutable application configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub cli: Cli,
}

impl AppConfig {
    /// Parse CLI/env, then validate everything that would otherwise fail
    /// lazily mid-connection. Any error here is a startup error (exit 1).
    pub fn load() -> Result<Self, ConfigError> {
        let cli = Cli::parse();
        Self::validate(&cli)?;
        Ok(Self { cli })
    }

    fn validate(cli: &Cli) -> Result<(), ConfigError> {
        if cli.dest_type != DestinationType::Postgres {
            return Err(ConfigError::UnsupportedDestinationType);
        }
        if let Some(cert) = &cli.proxy_tls_cert {
            if !cert.exists() {
                return Err(ConfigError::MissingTlsCert(cert.clone()));
            }
        }
        if let Some(key) = &cli.proxy_tls_key {
            if !key.exists() {
                return Err(ConfigError::MissingTlsKey(key.clone()));
            }
        }
        if let Some(template) = &cli.post_auth_template {
            if !template.exists() {
                return Err(ConfigError::MissingTemplate(template.clone()));
            }
        }
        match cli.permission_agent {
            Some(PermissionAgentKind::Opa) => {
                if cli.opa_url.is_none() {
                    return Err(ConfigError::IncompletePermissionAgentConfig(
                        PermissionAgentKind::Opa,
                    ));
                }
            }
            Some(PermissionAgentKind::Http) => {
                if cli.http_agent_ddl_endpoint.is_none() || cli.http_agent_select_endpoint.is_none()
                {
                    return Err(ConfigError::IncompletePermissionAgentConfig(
                        PermissionAgentKind::Http,
                    ));
                }
            }
            None => {}
        }
        Ok(())
    }

    pub fn tls_enabled(&self) -> bool {
        self.cli.proxy_tls_cert.is_some() && self.cli.proxy_tls_key.is_some()
    }
}
