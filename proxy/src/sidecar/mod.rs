//! Sidecar HTTP API (§4.9, §6): `POST /connection` and
//! `POST /permissionapply`. Thin `routerify` handlers — body parsing, a
//! call into the shared token store / OIDC client / rewriter, and a
//! status-coded JSON response. No business logic lives here.

use std::net::SocketAddr;
use std::sync::Arc;

use hyper::{Body, Request, Response, Server, StatusCode};
use routerify::{RequestExt, Router, RouterService};
use serde::{Deserialize, Serialize};

use crate::oidc::{OidcClient, OidcSettings};
use crate::rewriter::Rewriter;
use crate::token_store::TokenStore;

pub struct SidecarState {
    pub token_store: Arc<TokenStore>,
    pub oidc_client: Option<Arc<OidcClient>>,
    pub oidc_settings: Arc<OidcSettings>,
    pub rewriter: Option<Arc<Rewriter>>,
}

#[derive(Deserialize)]
struct ConnectionRequest {
    access_token: String,
    refresh_token: String,
}

#[derive(Serialize)]
struct ConnectionResponse {
    username: String,
}

#[derive(Deserialize)]
struct PermissionApplyRequest {
    username: String,
    database: String,
    sql: String,
}

#[derive(Serialize)]
struct PermissionApplyResponse {
    sql: String,
    new_sql: String,
}

#[derive(Serialize)]
struct ErrorBody {
    detail: String,
}

fn error_response(status: StatusCode, detail: impl Into<String>) -> Response<Body> {
    json_response(status, &ErrorBody { detail: detail.into() })
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<Body> {
    let body = serde_json::to_vec(value).unwrap_or_default();
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Body::from(body))
        .expect("static response components are always valid")
}

async fn parse_body<T: for<'de> Deserialize<'de>>(req: &mut Request<Body>) -> Result<T, Response<Body>> {
    let bytes = hyper::body::to_bytes(req.body_mut())
        .await
        .map_err(|_| error_response(StatusCode::BAD_REQUEST, "Failed to parse request"))?;
    serde_json::from_slice(&bytes).map_err(|_| error_response(StatusCode::BAD_REQUEST, "Failed to parse request"))
}

async fn handle_connection(mut req: Request<Body>) -> Result<Response<Body>, std::convert::Infallible> {
    let state = req
        .data::<Arc<SidecarState>>()
        .expect("sidecar state must be registered")
        .clone();

    let body: ConnectionRequest = match parse_body(&mut req).await {
        Ok(b) => b,
        Err(resp) => return Ok(resp),
    };

    let username = state
        .token_store
        .add(body.access_token, body.refresh_token, String::new(), String::new());
    Ok(json_response(StatusCode::OK, &ConnectionResponse { username }))
}

async fn handle_permission_apply(mut req: Request<Body>) -> Result<Response<Body>, std::convert::Infallible> {
    let state = req
        .data::<Arc<SidecarState>>()
        .expect("sidecar state must be registered")
        .clone();

    let body: PermissionApplyRequest = match parse_body(&mut req).await {
        Ok(b) => b,
        Err(resp) => return Ok(resp),
    };

    let Some(rewriter) = state.rewriter.clone() else {
        return Ok(error_response(StatusCode::FAILED_DEPENDENCY, "permission agent is not configured"));
    };
    let Some(oidc) = state.oidc_client.clone() else {
        return Ok(error_response(StatusCode::FAILED_DEPENDENCY, "oidc is disabled"));
    };

    let Some(entry) = state.token_store.get(&body.username) else {
        return Ok(error_response(StatusCode::NOT_FOUND, "unknown username"));
    };

    let client_config = match state.oidc_settings.client_for_database(&body.database) {
        Ok(c) => c,
        Err(e) => return Ok(error_response(StatusCode::NOT_FOUND, e.to_string())),
    };

    let (access_token, refresh_token) = if oidc.is_valid(&entry.access_token, &client_config.client_id) {
        (entry.access_token, entry.refresh_token)
    } else {
        match oidc.refresh(&body.database, &entry.refresh_token).await {
            Ok(pair) => pair,
            Err(e) => return Ok(error_response(StatusCode::UNAUTHORIZED, e.to_string())),
        }
    };
    state
        .token_store
        .update_tokens(&body.username, access_token.clone(), refresh_token.clone());

    let userinfo = match oidc.userinfo(&access_token).await {
        Ok(u) => u,
        Err(e) => return Ok(error_response(StatusCode::UNAUTHORIZED, e.to_string())),
    };

    match rewriter.rewrite(&body.sql, &userinfo).await {
        Ok(new_sql) => Ok(json_response(
            StatusCode::OK,
            &PermissionApplyResponse { sql: body.sql, new_sql },
        )),
        Err(e) => Ok(error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())),
    }
}

fn router(state: Arc<SidecarState>) -> Router<Body, std::convert::Infallible> {
    Router::builder()
        .data(state)
        .post("/connection", handle_connection)
        .post("/permissionapply", handle_permission_apply)
        .build()
        .expect("sidecar router definition is static and always builds")
}

/// Serve the sidecar API on `addr` until the process exits.
pub async fn run(addr: SocketAddr, state: Arc<SidecarState>) -> anyhow::Result<()> {
    let router = router(state);
    let service = RouterService::new(router).map_err(|e| anyhow::anyhow!(e.to_string()))?;
    tracing::info!(%addr, "sidecar HTTP API listening");
    Server::bind(&addr).serve(service).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_body_serializes_detail_field() {
        let resp = error_response(StatusCode::BAD_REQUEST, "Failed to parse request");
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
