//! Upstream authentication: the proxy acting as a libpq client against the
//! real Postgres backend (§4.7 `Authenticate-Upstream`). Covers the four
//! auth methods the destination is allowed to request: trust, cleartext,
//! MD5, and SCRAM-SHA-256.

use postgres_protocol::authentication::sasl::{ChannelBinding, ScramSha256};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;

use super::wire::{read_message, write_message};
use crate::error::StartupError;

const AUTH_OK: i32 = 0;
const AUTH_CLEARTEXT: i32 = 3;
const AUTH_MD5: i32 = 5;
const AUTH_GSS: i32 = 7;
const AUTH_GSS_CONTINUE: i32 = 8;
const AUTH_SASL: i32 = 10;
const AUTH_SASL_CONTINUE: i32 = 11;
const AUTH_SASL_FINAL: i32 = 12;

/// Hash a password the way PostgreSQL's `md5` auth method expects:
/// `"md5" + hex(md5(hex(md5(password + username)) + salt))`.
pub fn md5_password_hash(username: &str, password: &str, salt: [u8; 4]) -> String {
    let inner = format!("{:x}", md5::compute(format!("{password}{username}")));
    let mut outer_input = inner.into_bytes();
    outer_input.extend_from_slice(&salt);
    format!("md5{:x}", md5::compute(outer_input))
}

/// Drive the upstream authentication conversation to completion. Expects
/// the caller to have already sent the startup packet. Reads the initial
/// `Authentication*` request and branches on its type code.
pub async fn authenticate<S>(
    stream: &mut S,
    username: &str,
    password: &str,
    scram_timeout: std::time::Duration,
) -> Result<(), StartupError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let msg = read_message(stream).await?;
    if msg.tag != b'R' {
        return Err(StartupError::UnknownAuthMethod(-1));
    }
    let code = i32::from_be_bytes([msg.payload[0], msg.payload[1], msg.payload[2], msg.payload[3]]);

    match code {
        AUTH_OK => Ok(()),
        AUTH_CLEARTEXT => {
            let mut body = password.as_bytes().to_vec();
            body.push(0);
            write_message(stream, b'p', &body).await?;
            expect_auth_ok(stream).await
        }
        AUTH_MD5 => {
            let salt: [u8; 4] = msg.payload[4..8]
                .try_into()
                .map_err(|_| StartupError::ShortRead { expected: 8, got: msg.payload.len() })?;
            let hash = md5_password_hash(username, password, salt);
            let mut body = hash.into_bytes();
            body.push(0);
            write_message(stream, b'p', &body).await?;
            expect_auth_ok(stream).await
        }
        AUTH_GSS | AUTH_GSS_CONTINUE => Err(StartupError::GssapiUnsupported),
        AUTH_SASL => timeout(scram_timeout, scram_exchange(stream, password))
            .await
            .map_err(|_| StartupError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "upstream SCRAM handshake timed out",
            )))?,
        other => Err(StartupError::UnknownAuthMethod(other)),
    }
}

async fn expect_auth_ok<S: AsyncRead + Unpin>(stream: &mut S) -> Result<(), StartupError> {
    let msg = read_message(stream).await?;
    if msg.tag != b'R' || msg.payload.len() < 4 {
        return Err(StartupError::UnknownAuthMethod(-1));
    }
    let code = i32::from_be_bytes([msg.payload[0], msg.payload[1], msg.payload[2], msg.payload[3]]);
    if code == AUTH_OK {
        Ok(())
    } else {
        Err(StartupError::UnknownAuthMethod(code))
    }
}

async fn scram_exchange<S>(stream: &mut S, password: &str) -> Result<(), StartupError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut scram = ScramSha256::new(password.as_bytes(), ChannelBinding::unsupported());

    let mechanism = "SCRAM-SHA-256";
    let mut initial = Vec::new();
    initial.extend_from_slice(mechanism.as_bytes());
    initial.push(0);
    initial.extend_from_slice(&(scram.message().len() as i32).to_be_bytes());
    initial.extend_from_slice(scram.message());
    write_message(stream, b'p', &initial).await?;

    let server_first = read_message(stream).await?;
    let code = expect_sasl_code(&server_first, AUTH_SASL_CONTINUE)?;
    if code != AUTH_SASL_CONTINUE {
        return Err(StartupError::UnknownAuthMethod(code));
    }
    scram
        .update(&server_first.payload[4..])
        .map_err(|_| StartupError::UnknownAuthMethod(-2))?;

    write_message(stream, b'p', scram.message()).await?;

    let server_final = read_message(stream).await?;
    let code = expect_sasl_code(&server_final, AUTH_SASL_FINAL)?;
    if code != AUTH_SASL_FINAL {
        return Err(StartupError::UnknownAuthMethod(code));
    }
    scram
        .finish(&server_final.payload[4..])
        .map_err(|_| StartupError::UnknownAuthMethod(-3))?;

    expect_auth_ok(stream).await
}

fn expect_sasl_code(msg: &super::wire::Message, _expected: i32) -> Result<i32, StartupError> {
    if msg.tag != b'R' || msg.payload.len() < 4 {
        return Err(StartupError::UnknownAuthMethod(-1));
    }
    Ok(i32::from_be_bytes([
        msg.payload[0],
        msg.payload[1],
        msg.payload[2],
        msg.payload[3],
    ]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn md5_hash_matches_postgres_formula() {
        let hash = md5_password_hash("alice", "hunter2", [1, 2, 3, 4]);
        assert!(hash.starts_with("md5"));
        assert_eq!(hash.len(), 3 + 32);

        let inner = format!("{:x}", md5::compute("hunter2alice"));
        let mut outer_input = inner.into_bytes();
        outer_input.extend_from_slice(&[1, 2, 3, 4]);
        let expected = format!("md5{:x}", md5::compute(outer_input));
        assert_eq!(hash, expected);
    }

    #[test]
    fn md5_hash_is_sensitive_to_salt() {
        let a = md5_password_hash("alice", "hunter2", [1, 2, 3, 4]);
        let b = md5_password_hash("alice", "hunter2", [5, 6, 7, 8]);
        assert_ne!(a, b);
    }
}
