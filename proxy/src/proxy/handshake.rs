//! Client handshake state machine (§4.7): `Connected` through `Post-Auth`.
//! Produces either a raw passthrough (client didn't present OIDC
//! credentials) or a fully authenticated [`PostAuthSession`] ready for the
//! pump.
//!
//! Every fallible step below keeps the client socket reachable even on
//! error, so [`drive`] can deliver a protocol `ErrorResponse` before the
//! connection is closed (§7): the client lives in a local `Option` that
//! the body takes out of and puts back around the one spot (TLS upgrade)
//! that needs to own it outright.

use std::sync::Arc;

use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use super::scram_client;
use super::stream::ClientStream;
use super::wire::{read_message, write_message, write_raw};
use crate::config::AppConfig;
use crate::context::{ConnectionStage, RequestContext};
use crate::error::{AuthError, StartupError, UserFacingError};
use crate::oidc::{OidcClient, OidcClientConfig, OidcSettings};
use crate::token_store::TokenStore;

const PROTOCOL_VERSION_3: i32 = 196_608;

pub struct PostAuthSession {
    pub client: ClientStream,
    pub upstream: TcpStream,
    pub userinfo: Value,
    pub access_token: String,
    pub refresh_token: String,
    pub database: String,
    pub client_config: OidcClientConfig,
}

pub enum HandshakeOutcome {
    RawPassthrough { client: ClientStream, upstream: TcpStream },
    Authenticated(Box<PostAuthSession>),
}

/// What [`negotiate`] decided, without yet owning the client/upstream
/// sockets back from the caller.
enum Negotiated {
    RawPassthrough,
    Authenticated {
        userinfo: Value,
        access_token: String,
        refresh_token: String,
        database: String,
        client_config: OidcClientConfig,
    },
}

#[allow(clippy::too_many_arguments)]
pub async fn drive(
    client_tcp: TcpStream,
    config: &AppConfig,
    token_store: &TokenStore,
    oidc_settings: &OidcSettings,
    oidc: Option<&Arc<OidcClient>>,
    tls_config: Option<Arc<rustls::ServerConfig>>,
    ctx: &mut RequestContext,
) -> Result<HandshakeOutcome, AuthError> {
    let mut upstream =
        TcpStream::connect((config.cli.dest_host.as_str(), config.cli.dest_port)).await?;
    let mut client = Some(ClientStream::Plain(client_tcp));

    let result = negotiate(
        &mut client,
        &mut upstream,
        config,
        token_store,
        oidc_settings,
        oidc,
        tls_config,
        ctx,
    )
    .await;

    let mut client = client.expect("negotiate always puts the client stream back");

    match result {
        Ok(Negotiated::RawPassthrough) => Ok(HandshakeOutcome::RawPassthrough { client, upstream }),
        Ok(Negotiated::Authenticated { userinfo, access_token, refresh_token, database, client_config }) => {
            Ok(HandshakeOutcome::Authenticated(Box::new(PostAuthSession {
                client,
                upstream,
                userinfo,
                access_token,
                refresh_token,
                database,
                client_config,
            })))
        }
        Err(e) => {
            send_error_frame(&mut client, &e).await;
            Err(e)
        }
    }
}

/// SQLSTATE per §7: startup/protocol errors get `08000`, everything else
/// in this phase gets `28000`. Best-effort: a write failure here just
/// means the client already went away, which is not itself an error.
async fn send_error_frame(client: &mut ClientStream, err: &AuthError) {
    let sqlstate = match err {
        AuthError::Startup(_) => pq_proto::SQLSTATE_PROTOCOL_VIOLATION,
        _ => pq_proto::SQLSTATE_INVALID_AUTH,
    };
    let _ = client
        .write_all(&pq_proto::error_response(sqlstate, &err.to_string_client()))
        .await;
    let _ = client.flush().await;
}

#[allow(clippy::too_many_arguments)]
async fn negotiate(
    client: &mut Option<ClientStream>,
    upstream: &mut TcpStream,
    config: &AppConfig,
    token_store: &TokenStore,
    oidc_settings: &OidcSettings,
    oidc: Option<&Arc<OidcClient>>,
    tls_config: Option<Arc<rustls::ServerConfig>>,
    ctx: &mut RequestContext,
) -> Result<Negotiated, AuthError> {
    ctx.set_stage(ConnectionStage::StartupNegotiation);
    let first_len = read_len_prefix(client).await?;

    let auth_payload_len = if first_len == 8 {
        let mut ssl_code = [0u8; 4];
        client_mut(client).read_exact(&mut ssl_code).await?;

        let mut probe = Vec::with_capacity(8);
        probe.extend_from_slice(&8u32.to_be_bytes());
        probe.extend_from_slice(&ssl_code);
        upstream.write_all(&probe).await?;
        upstream.flush().await?;

        let mut reply = [0u8; 1];
        upstream.read_exact(&mut reply).await?;

        match reply[0] {
            b'N' => {
                client_mut(client).write_all(b"N").await?;
                client_mut(client).flush().await?;
            }
            b'S' => {
                client_mut(client).write_all(b"S").await?;
                client_mut(client).flush().await?;
                if let Some(tls_config) = tls_config {
                    let acceptor = tokio_rustls::TlsAcceptor::from(tls_config);
                    let plain = match client.take().expect("client present") {
                        ClientStream::Plain(s) => s,
                        ClientStream::Tls(_) => unreachable!("client TLS not yet negotiated here"),
                    };
                    let tls_stream = acceptor.accept(plain).await?;
                    *client = Some(ClientStream::Tls(Box::new(tls_stream)));
                }
            }
            other => return Err(StartupError::UnexpectedTlsReply(other).into()),
        }

        read_len_prefix(client).await?
    } else {
        first_len
    };

    ctx.set_stage(ConnectionStage::AuthRead);
    if auth_payload_len < 4 {
        return Err(StartupError::ShortRead { expected: 4, got: auth_payload_len as usize }.into());
    }
    let mut auth_payload = vec![0u8; auth_payload_len as usize - 4];
    client_mut(client).read_exact(&mut auth_payload).await?;

    let parts: Vec<&[u8]> = auth_payload.split(|&b| b == 0).collect();
    if parts.len() < 7 {
        return Err(StartupError::MalformedStartup(parts.len()).into());
    }
    let mut uv = None;
    let mut dv = None;
    for pair in parts.windows(2) {
        if pair[0] == b"user" {
            uv = Some(String::from_utf8_lossy(pair[1]).into_owned());
        }
        if pair[0] == b"database" {
            dv = Some(String::from_utf8_lossy(pair[1]).into_owned());
        }
    }
    let uv = uv.ok_or(StartupError::MalformedStartup(parts.len()))?;
    let dv = dv.ok_or(StartupError::MalformedStartup(parts.len()))?;
    ctx.set_database(&dv);

    let mut original_packet = Vec::with_capacity(4 + auth_payload.len());
    original_packet.extend_from_slice(&auth_payload_len.to_be_bytes());
    original_packet.extend_from_slice(&auth_payload);

    let stored = token_store.get(&uv);
    let (access_token, refresh_token, came_from_store) = match stored {
        Some(entry) => (entry.access_token, entry.refresh_token, true),
        None => {
            let fields: Vec<&str> = uv.split(';').collect();
            if fields.len() < 2 {
                write_raw(upstream, &original_packet).await?;
                return Ok(Negotiated::RawPassthrough);
            }
            let mut access = String::new();
            let mut refresh = String::new();
            for field in &fields[1..] {
                if let Some(v) = field.strip_prefix("access_token=") {
                    access = v.to_string();
                }
                if let Some(v) = field.strip_prefix("refresh_token=") {
                    refresh = v.to_string();
                }
            }
            if access.is_empty() || refresh.is_empty() {
                write_raw(upstream, &original_packet).await?;
                return Ok(Negotiated::RawPassthrough);
            }
            (access, refresh, false)
        }
    };

    if !config.cli.oidc_enabled {
        return Err(AuthError::OidcDisabled);
    }
    let oidc = oidc.ok_or(AuthError::OidcDisabled)?;
    let client_config = oidc_settings.client_for_database(&dv)?;

    let (access_token, refresh_token) = if oidc.is_valid(&access_token, &client_config.client_id) {
        (access_token, refresh_token)
    } else {
        let (new_access, new_refresh) = oidc.refresh(&dv, &refresh_token).await?;
        if came_from_store {
            token_store.update_tokens(&uv, new_access.clone(), new_refresh.clone());
        }
        (new_access, new_refresh)
    };
    let userinfo = oidc.userinfo(&access_token).await?;

    ctx.set_stage(ConnectionStage::AuthenticateUpstream);
    let startup_packet = build_startup_packet(&config.cli.dest_service_user, &dv);
    upstream.write_all(&startup_packet).await?;
    upstream.flush().await?;
    scram_client::authenticate(
        upstream,
        &config.cli.dest_service_user,
        &config.cli.dest_service_password,
        config.cli.scram_protocol_timeout,
    )
    .await?;

    client_mut(client).write_all(&pq_proto::authentication_ok()).await?;
    client_mut(client).flush().await?;

    loop {
        let msg = read_message(upstream).await?;
        if msg.tag == b'E' {
            return Err(AuthError::AuthFailed(pq_proto::extract_error_message(&msg.payload)));
        }
        if msg.tag == b'Z' {
            break;
        }
        write_message(client_mut(client), msg.tag, &msg.payload).await?;
    }

    ctx.set_stage(ConnectionStage::PostAuth);
    if let Some(template_path) = &config.cli.post_auth_template {
        let template = std::fs::read_to_string(template_path)
            .map_err(|e| AuthError::RefreshFailed(format!("post-auth template read failed: {e}")))?;
        let rendered = render_userinfo_template(&template, &userinfo);
        run_bracketed(upstream, &rendered).await?;
    }

    if config.cli.assume_user_session {
        let claimed = userinfo
            .get(&config.cli.assume_username_claim)
            .and_then(Value::as_str)
            .ok_or_else(|| AuthError::MissingUsernameClaim(config.cli.assume_username_claim.clone()))?;
        let stmt = format!("SET SESSION AUTHORIZATION {claimed}");
        run_bracketed(upstream, &stmt).await?;
    }

    client_mut(client)
        .write_all(&pq_proto::ready_for_query(pq_proto::STATUS_IDLE))
        .await?;
    client_mut(client).flush().await?;

    Ok(Negotiated::Authenticated { userinfo, access_token, refresh_token, database: dv, client_config })
}

fn client_mut(client: &mut Option<ClientStream>) -> &mut ClientStream {
    client.as_mut().expect("client present")
}

async fn read_len_prefix(client: &mut Option<ClientStream>) -> std::io::Result<i32> {
    let mut len_bytes = [0u8; 4];
    client_mut(client).read_exact(&mut len_bytes).await?;
    Ok(i32::from_be_bytes(len_bytes))
}

fn build_startup_packet(user: &str, database: &str) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&PROTOCOL_VERSION_3.to_be_bytes());
    body.extend_from_slice(b"user\0");
    body.extend_from_slice(user.as_bytes());
    body.push(0);
    body.extend_from_slice(b"database\0");
    body.extend_from_slice(database.as_bytes());
    body.push(0);
    body.push(0);

    let mut packet = Vec::with_capacity(4 + body.len());
    packet.extend_from_slice(&((body.len() + 4) as u32).to_be_bytes());
    packet.extend_from_slice(&body);
    packet
}

/// Naive `{{.Key}}` substitution against userinfo's top-level scalar
/// fields, the same lightweight scheme `policy::opa::render_select_template`
/// uses rather than pulling in a full templating engine for one call site.
fn render_userinfo_template(template: &str, userinfo: &Value) -> String {
    let mut rendered = template.to_string();
    if let Some(map) = userinfo.as_object() {
        for (key, value) in map {
            let placeholder = format!("{{{{.{key}}}}}");
            let value_str = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            rendered = rendered.replace(&placeholder, &value_str);
        }
    }
    rendered
}

/// Run `BEGIN / <stmt> / END` on upstream, draining each to
/// `ReadyForQuery` without forwarding anything to the client.
async fn run_bracketed(upstream: &mut TcpStream, stmt: &str) -> Result<(), AuthError> {
    for sql in ["BEGIN", stmt, "END"] {
        write_raw(upstream, &pq_proto::simple_query_message(sql)).await?;
        loop {
            let msg = read_message(upstream).await?;
            if msg.tag == b'E' {
                return Err(AuthError::AuthFailed(pq_proto::extract_error_message(&msg.payload)));
            }
            if msg.tag == b'Z' {
                break;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn startup_packet_contains_user_and_database() {
        let packet = build_startup_packet("svc", "mydb");
        let text = String::from_utf8_lossy(&packet);
        assert!(text.contains("user"));
        assert!(text.contains("svc"));
        assert!(text.contains("database"));
        assert!(text.contains("mydb"));
    }

    #[test]
    fn template_substitutes_top_level_claims() {
        let userinfo = serde_json::json!({"org": "acme", "tier": 2});
        let rendered = render_userinfo_template("set search_path to {{.org}}_{{.tier}}", &userinfo);
        assert_eq!(rendered, "set search_path to acme_2");
    }
}
