//! Post-auth bidirectional pump (§4.7 Pump). One task blindly relays
//! upstream→client bytes; the main loop owns client→upstream, where every
//! framed message gets a chance at OIDC re-validation and SQL rewriting
//! before being forwarded.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use super::handshake::PostAuthSession;
use super::stream::ClientStream;
use super::wire::{read_message, write_message};
use crate::error::RewriteError;
use crate::oidc::OidcClient;
use crate::rewriter::Rewriter;

/// Run the full authenticated pump until either side closes.
pub async fn run(
    session: PostAuthSession,
    rewriter: Arc<Rewriter>,
    oidc: Arc<OidcClient>,
    allow_session_escape: bool,
) {
    let PostAuthSession {
        client,
        upstream,
        userinfo,
        mut access_token,
        mut refresh_token,
        database,
        client_config,
    } = session;

    let (mut client_read, client_write) = tokio::io::split(client);
    let (upstream_read, mut upstream_write) = tokio::io::split(upstream);

    let (tx, rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let copy_task = tokio::spawn(forward_raw(upstream_read, client_write, rx));

    loop {
        let msg = match read_message(&mut client_read).await {
            Ok(m) => m,
            Err(_) => break,
        };
        if msg.tag == b'X' {
            break;
        }

        if !oidc.is_valid(&access_token, &client_config.client_id) {
            match oidc.refresh(&database, &refresh_token).await {
                Ok((new_access, new_refresh)) => {
                    access_token = new_access;
                    refresh_token = new_refresh;
                }
                Err(_) => {
                    send_error(&tx, pq_proto::SQLSTATE_INVALID_AUTH, "access token refresh failed");
                    continue;
                }
            }
        }

        if let Some((prefix, sql, suffix)) = extract_query_sql(msg.tag, &msg.payload) {
            if !allow_session_escape && is_session_escape(&sql) {
                send_error(&tx, pq_proto::SQLSTATE_INVALID_AUTH, "session-escape statements are not allowed");
                continue;
            }

            match rewriter.rewrite(&sql, &userinfo).await {
                Ok(rewritten) => {
                    let (out_tag, out_body) = rebuild_query_message(msg.tag, &prefix, &rewritten, &suffix);
                    if write_message(&mut upstream_write, out_tag, &out_body).await.is_err() {
                        break;
                    }
                    continue;
                }
                Err(RewriteError::Policy(policy_err)) => {
                    send_error(&tx, pq_proto::SQLSTATE_INVALID_AUTH, &policy_err.to_string());
                    continue;
                }
                Err(RewriteError::Parse(_)) => {
                    // Not a rewriter-handled error: fall through and forward verbatim.
                }
            }
        }

        if write_message(&mut upstream_write, msg.tag, &msg.payload).await.is_err() {
            break;
        }
    }

    drop(tx);
    copy_task.abort();
}

fn send_error(tx: &mpsc::UnboundedSender<Vec<u8>>, sqlstate: &str, message: &str) {
    let _ = tx.send(pq_proto::error_response(sqlstate, message).to_vec());
    let _ = tx.send(pq_proto::ready_for_query(pq_proto::STATUS_ERROR).to_vec());
}

/// Raw, unframed passthrough for clients who never presented OIDC
/// credentials (§8 scenario 6): once the original startup packet has been
/// relayed, neither side's traffic is interpreted again.
pub async fn raw_passthrough(client: ClientStream, upstream: tokio::net::TcpStream) {
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);

    let c2u = tokio::io::copy(&mut client_read, &mut upstream_write);
    let u2c = tokio::io::copy(&mut upstream_read, &mut client_write);
    let _ = tokio::try_join!(c2u, u2c);
}

async fn forward_raw<R, W>(
    mut upstream_read: R,
    mut client_write: W,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; 8192];
    loop {
        tokio::select! {
            result = upstream_read.read(&mut buf) => {
                match result {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if client_write.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
            maybe_bytes = rx.recv() => {
                match maybe_bytes {
                    Some(bytes) => {
                        if client_write.write_all(&bytes).await.is_err() {
                            break;
                        }
                    }
                    None => {}
                }
            }
        }
    }
}

fn is_session_escape(sql: &str) -> bool {
    let upper = sql.trim().trim_end_matches(';').trim().to_uppercase();
    upper == "RESET ROLE" || upper == "SET SESSION AUTHORIZATION DEFAULT"
}

/// Pull the SQL text (and the bytes around it) out of a simple-query or
/// extended-protocol Parse message, so it can be rewritten and the
/// surrounding framing reassembled unchanged.
fn extract_query_sql(tag: u8, payload: &[u8]) -> Option<(Vec<u8>, String, Vec<u8>)> {
    match tag {
        b'Q' => {
            let sql = payload.strip_suffix(&[0]).unwrap_or(payload);
            Some((Vec::new(), String::from_utf8_lossy(sql).into_owned(), Vec::new()))
        }
        b'P' => {
            let name_end = payload.iter().position(|&b| b == 0)?;
            let prefix = payload[..=name_end].to_vec();
            let rest = &payload[name_end + 1..];
            let sql_end = rest.iter().position(|&b| b == 0)?;
            let sql = String::from_utf8_lossy(&rest[..sql_end]).into_owned();
            let suffix = rest[sql_end + 1..].to_vec();
            Some((prefix, sql, suffix))
        }
        _ => None,
    }
}

fn rebuild_query_message(tag: u8, prefix: &[u8], sql: &str, suffix: &[u8]) -> (u8, Vec<u8>) {
    match tag {
        b'P' => {
            let mut body = prefix.to_vec();
            body.extend_from_slice(sql.as_bytes());
            body.push(0);
            body.extend_from_slice(suffix);
            (b'P', body)
        }
        _ => {
            let mut body = sql.as_bytes().to_vec();
            body.push(0);
            (b'Q', body)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_escape_matches_known_statements() {
        assert!(is_session_escape("RESET ROLE"));
        assert!(is_session_escape("reset role;"));
        assert!(is_session_escape("set session authorization default"));
        assert!(!is_session_escape("select 1"));
    }

    #[test]
    fn extract_query_sql_handles_simple_query() {
        let mut payload = b"select 1".to_vec();
        payload.push(0);
        let (prefix, sql, suffix) = extract_query_sql(b'Q', &payload).unwrap();
        assert!(prefix.is_empty());
        assert!(suffix.is_empty());
        assert_eq!(sql, "select 1");
    }

    #[test]
    fn extract_query_sql_handles_parse_message() {
        let mut payload = Vec::new();
        payload.extend_from_slice(b"stmt1\0");
        payload.extend_from_slice(b"select 1\0");
        payload.extend_from_slice(&[0, 0]);
        let (prefix, sql, suffix) = extract_query_sql(b'P', &payload).unwrap();
        assert_eq!(prefix, b"stmt1\0");
        assert_eq!(sql, "select 1");
        assert_eq!(suffix, vec![0, 0]);
    }

    #[test]
    fn rebuild_query_message_roundtrips_simple_query() {
        let (tag, body) = rebuild_query_message(b'Q', &[], "select 2", &[]);
        assert_eq!(tag, b'Q');
        assert_eq!(body, b"select 2\0");
    }
}
