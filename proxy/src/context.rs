//! Per-connection request monitoring context.
//!
//! One [`RequestContext`] is created per inbound connection and threaded
//! through the handshake, policy, and pump stages so every log line and
//! metric carries a stable connection id.

use std::net::SocketAddr;
use std::time::Instant;

use tracing::{field, info_span, Span};
use uuid::Uuid;

/// Stage a connection has reached, recorded for logging/metrics on error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStage {
    Connected,
    StartupNegotiation,
    AuthRead,
    AuthenticateUpstream,
    PostAuth,
    Closed,
}

impl ConnectionStage {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionStage::Connected => "connected",
            ConnectionStage::StartupNegotiation => "startup_negotiation",
            ConnectionStage::AuthRead => "auth_read",
            ConnectionStage::AuthenticateUpstream => "authenticate_upstream",
            ConnectionStage::PostAuth => "post_auth",
            ConnectionStage::Closed => "closed",
        }
    }
}

/// Carries the identity and timing of one client connection through every
/// stage of the proxy.
pub struct RequestContext {
    pub session_id: Uuid,
    pub peer_addr: SocketAddr,
    pub span: Span,
    started_at: Instant,
    stage: ConnectionStage,
    pub database: Option<String>,
    pub username: Option<String>,
}

impl RequestContext {
    pub fn new(peer_addr: SocketAddr) -> Self {
        let session_id = Uuid::new_v4();
        let span = info_span!(
            "connection",
            session_id = %session_id,
            peer_addr = %peer_addr,
            database = field::Empty,
            username = field::Empty,
        );
        Self {
            session_id,
            peer_addr,
            span,
            started_at: Instant::now(),
            stage: ConnectionStage::Connected,
            database: None,
            username: None,
        }
    }

    pub fn set_stage(&mut self, stage: ConnectionStage) {
        self.stage = stage;
    }

    pub fn stage(&self) -> ConnectionStage {
        self.stage
    }

    pub fn elapsed_ms(&self) -> u128 {
        self.started_at.elapsed().as_millis()
    }

    pub fn set_database(&mut self, database: impl Into<String>) {
        let database = database.into();
        self.span.record("database", field::display(&database));
        self.database = Some(database);
    }

    pub fn set_username(&mut self, username: impl Into<String>) {
        let username = username.into();
        self.span.record("username", field::display(&username));
        self.username = Some(username);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_context_starts_at_connected_stage() {
        let ctx = RequestContext::new("127.0.0.1:5432".parse().unwrap());
        assert_eq!(ctx.stage(), ConnectionStage::Connected);
        assert!(ctx.database.is_none());
        assert!(ctx.username.is_none());
    }

    #[test]
    fn stage_transitions_are_tracked() {
        let mut ctx = RequestContext::new("127.0.0.1:5432".parse().unwrap());
        ctx.set_stage(ConnectionStage::AuthRead);
        assert_eq!(ctx.stage(), ConnectionStage::AuthRead);
        assert_eq!(ctx.stage().as_str(), "auth_read");
    }

    #[test]
    fn session_ids_are_unique() {
        let a = RequestContext::new("127.0.0.1:1".parse().unwrap());
        let b = RequestContext::new("127.0.0.1:1".parse().unwrap());
        assert_ne!(a.session_id, b.session_id);
    }
}
