//! Shared error taxonomy.
//!
//! Every error type that can reach a caller (HTTP handler or client-facing
//! protocol frame) implements [`ReportableError`] for metrics/logging and,
//! where the message is safe to show externally, [`UserFacingError`].
//! `anyhow::Error` is reserved for `main`/top-level task boundaries.

use std::fmt;

/// Marks errors that may be safely shown to a client or HTTP caller.
pub trait UserFacingError: ReportableError {
    /// Format the error for the caller, stripping anything sensitive.
    fn to_string_client(&self) -> String {
        self.to_string()
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    /// Wrong credentials, malformed request, policy denial, etc.
    User,
    /// The client went away mid-operation.
    ClientDisconnect,
    /// Error talking to the OIDC provider or the policy agent.
    Upstream,
    /// Error talking to the real Postgres backend.
    Compute,
    /// Internal/unexpected error.
    Internal,
}

impl ErrorKind {
    pub fn to_metric_label(self) -> &'static str {
        match self {
            ErrorKind::User => "user",
            ErrorKind::ClientDisconnect => "client_disconnect",
            ErrorKind::Upstream => "upstream",
            ErrorKind::Compute => "compute",
            ErrorKind::Internal => "internal",
        }
    }
}

pub trait ReportableError: fmt::Display + Send + Sync + 'static {
    fn get_error_kind(&self) -> ErrorKind;
}

/// Errors from the startup/handshake phase of the protocol handler (§4.7, §7).
/// Always mapped to SQLSTATE `08000` and a closed connection.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("unexpected byte in TLS negotiation reply: {0:#x}")]
    UnexpectedTlsReply(u8),
    #[error("short read: expected {expected} bytes, got {got}")]
    ShortRead { expected: usize, got: usize },
    #[error("malformed startup packet: expected at least 7 NUL-separated fields, got {0}")]
    MalformedStartup(usize),
    #[error("GSSAPI authentication is not supported")]
    GssapiUnsupported,
    #[error("unknown upstream authentication request code: {0}")]
    UnknownAuthMethod(i32),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ReportableError for StartupError {
    fn get_error_kind(&self) -> ErrorKind {
        match self {
            StartupError::Io(_) => ErrorKind::ClientDisconnect,
            _ => ErrorKind::User,
        }
    }
}

impl UserFacingError for StartupError {}

/// Errors from the authentication phase (§4.7 `AuthRead`/`Authenticate-Upstream`).
/// Always mapped to SQLSTATE `28000` and a closed connection.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("oidc as auth method is disabled, use username/password")]
    OidcDisabled,
    #[error("client ID not found for database: {0}")]
    ClientIdNotFound(String),
    #[error("failed to refresh access token: {0}")]
    RefreshFailed(String),
    #[error("failed to fetch userinfo: {0}")]
    UserinfoFailed(String),
    #[error("password authentication failed for user '{0}'")]
    AuthFailed(String),
    #[error("username claim '{0}' missing from userinfo or not a string")]
    MissingUsernameClaim(String),
    #[error(transparent)]
    Startup(#[from] StartupError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ReportableError for AuthError {
    fn get_error_kind(&self) -> ErrorKind {
        match self {
            AuthError::RefreshFailed(_) | AuthError::UserinfoFailed(_) => ErrorKind::Upstream,
            AuthError::Io(_) => ErrorKind::ClientDisconnect,
            AuthError::Startup(e) => e.get_error_kind(),
            _ => ErrorKind::User,
        }
    }
}

impl UserFacingError for AuthError {}

/// Errors from the OPA/HTTP policy agent (§4.4, §4.5, §7).
#[derive(Debug, thiserror::Error, Clone)]
pub enum PolicyError {
    #[error("permission denied to access table {0}")]
    PermissionDenied(String),
    #[error("{kind} operation is not allowed")]
    DdlNotAllowed { kind: String },
    #[error("join filters are not supported yet, sorry")]
    JoinFiltersUnsupported,
    #[error("unexpected status code from OPA: {0}")]
    UnexpectedOpaStatus(u16),
    #[error("unexpected status code: {0}")]
    UnexpectedHttpStatus(u16),
    #[error("failed to decode OPA term: {0}")]
    TermDecode(String),
    #[error("failed to compile OPA query: {0}")]
    QueryCompile(String),
    #[error("request to policy agent failed: {0}")]
    Transport(String),
}

impl ReportableError for PolicyError {
    fn get_error_kind(&self) -> ErrorKind {
        match self {
            PolicyError::PermissionDenied(_) | PolicyError::DdlNotAllowed { .. } => {
                ErrorKind::User
            }
            PolicyError::Transport(_)
            | PolicyError::UnexpectedOpaStatus(_)
            | PolicyError::UnexpectedHttpStatus(_) => ErrorKind::Upstream,
            _ => ErrorKind::Internal,
        }
    }
}

impl UserFacingError for PolicyError {}

/// Errors from the SQL rewriter (§4.6, §7).
#[derive(Debug, thiserror::Error, Clone)]
pub enum RewriteError {
    #[error("failed to parse SQL: {0}")]
    Parse(String),
    #[error(transparent)]
    Policy(#[from] PolicyError),
}

impl ReportableError for RewriteError {
    fn get_error_kind(&self) -> ErrorKind {
        match self {
            RewriteError::Parse(_) => ErrorKind::Internal,
            RewriteError::Policy(e) => e.get_error_kind(),
        }
    }
}

impl UserFacingError for RewriteError {
    fn to_string_client(&self) -> String {
        match self {
            RewriteError::Policy(e) => e.to_string_client(),
            RewriteError::Parse(m) => m.clone(),
        }
    }
}
