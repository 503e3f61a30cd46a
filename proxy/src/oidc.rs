//! OIDC client (§4.3): JWT decode (no signature verification), token
//! refresh, and userinfo lookups.
//!
//! The access token's signature is never verified here — per §4.3 the
//! userinfo call is the actual proof of validity; the decode step only
//! extracts `azp`/`exp` to decide, cheaply and without a network round
//! trip, whether a refresh is worth attempting before falling back to
//! userinfo.

use std::collections::HashMap;
use std::time::Duration;

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;

use crate::error::AuthError;

/// Claims this proxy actually reads out of an access token. Any other
/// claims are ignored.
#[derive(Debug, Deserialize)]
struct Claims {
    azp: Option<String>,
    exp: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
}

/// Per-database OIDC client configuration (§4.2: multiple client ids may
/// share one token/userinfo endpoint pair).
#[derive(Debug, Clone)]
pub struct OidcClientConfig {
    pub client_id: String,
    pub client_secret: String,
}

#[derive(Debug, Clone)]
pub struct OidcSettings {
    pub enabled: bool,
    pub token_url: Option<String>,
    pub userinfo_url: Option<String>,
    pub db_clients: HashMap<String, String>,
    pub global_client_id: Option<String>,
    pub global_client_secret: Option<String>,
    pub fallback_enabled: bool,
}

impl OidcSettings {
    /// Resolve which client id/secret pair applies to a given database,
    /// per §4.2's mapping-with-fallback rule.
    pub fn client_for_database(&self, database: &str) -> Result<OidcClientConfig, AuthError> {
        if let Some(client_id) = self.db_clients.get(database) {
            return Ok(OidcClientConfig {
                client_id: client_id.clone(),
                client_secret: self
                    .global_client_secret
                    .clone()
                    .unwrap_or_default(),
            });
        }
        if self.fallback_enabled {
            if let (Some(client_id), Some(client_secret)) =
                (&self.global_client_id, &self.global_client_secret)
            {
                return Ok(OidcClientConfig {
                    client_id: client_id.clone(),
                    client_secret: client_secret.clone(),
                });
            }
        }
        Err(AuthError::ClientIdNotFound(database.to_string()))
    }
}

pub struct OidcClient {
    http: reqwest::Client,
    settings: OidcSettings,
}

impl OidcClient {
    pub fn new(settings: OidcSettings) -> Self {
        Self {
            http: reqwest::Client::new(),
            settings,
        }
    }

    /// Decode an access token's claims without checking its signature, and
    /// say whether it both belongs to the expected client (`azp`) and has
    /// not yet hit its `exp`.
    pub fn is_valid(&self, access_token: &str, expected_client_id: &str) -> bool {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.insecure_disable_signature_validation();
        validation.validate_exp = true;
        validation.set_audience(&[] as &[&str]);
        validation.required_spec_claims.clear();

        let decoded = match decode::<Claims>(
            access_token,
            &DecodingKey::from_secret(&[]),
            &validation,
        ) {
            Ok(data) => data,
            Err(_) => return false,
        };

        if decoded.claims.exp.is_none() {
            return false;
        }

        match decoded.claims.azp {
            Some(azp) => azp == expected_client_id,
            None => false,
        }
    }

    /// Exchange a refresh token for a new access/refresh token pair.
    pub async fn refresh(
        &self,
        database: &str,
        refresh_token: &str,
    ) -> Result<(String, String), AuthError> {
        if !self.settings.enabled {
            return Err(AuthError::OidcDisabled);
        }
        let client = self.settings.client_for_database(database)?;
        let token_url = self
            .settings
            .token_url
            .as_ref()
            .ok_or_else(|| AuthError::RefreshFailed("no token_url configured".to_string()))?;

        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", client.client_id.as_str()),
            ("client_secret", client.client_secret.as_str()),
        ];

        let response = self
            .http
            .post(token_url)
            .form(&params)
            .send()
            .await
            .map_err(|e| AuthError::RefreshFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(AuthError::RefreshFailed(format!(
                "token endpoint returned {}",
                response.status()
            )));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| AuthError::RefreshFailed(e.to_string()))?;

        let new_refresh = body.refresh_token.unwrap_or_else(|| refresh_token.to_string());
        Ok((body.access_token, new_refresh))
    }

    /// Fetch the userinfo document for an access token; this is the
    /// authoritative proof the token is currently valid.
    pub async fn userinfo(&self, access_token: &str) -> Result<serde_json::Value, AuthError> {
        let userinfo_url = self
            .settings
            .userinfo_url
            .as_ref()
            .ok_or_else(|| AuthError::UserinfoFailed("no userinfo_url configured".to_string()))?;

        let response = self
            .http
            .get(userinfo_url)
            .bearer_auth(access_token)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| AuthError::UserinfoFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(AuthError::UserinfoFailed(format!(
                "userinfo endpoint returned {}",
                response.status()
            )));
        }

        response
            .json()
            .await
            .map_err(|e| AuthError::UserinfoFailed(e.to_string()))
    }

    /// Extract the database role to assume from a userinfo document, per
    /// the configured claim name (§6 `assume_username_claim`).
    pub fn extract_username_claim(
        userinfo: &serde_json::Value,
        claim: &str,
    ) -> Result<String, AuthError> {
        userinfo
            .get(claim)
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| AuthError::MissingUsernameClaim(claim.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn token_with_claims(azp: Option<&str>, exp: Option<usize>) -> String {
        #[derive(serde::Serialize)]
        struct Out {
            #[serde(skip_serializing_if = "Option::is_none")]
            azp: Option<String>,
            #[serde(skip_serializing_if = "Option::is_none")]
            exp: Option<usize>,
        }
        encode(
            &Header::new(Algorithm::HS256),
            &Out { azp: azp.map(str::to_string), exp },
            &EncodingKey::from_secret(b"irrelevant"),
        )
        .unwrap()
    }

    fn settings_with_mapping() -> OidcSettings {
        let mut db_clients = HashMap::new();
        db_clients.insert("mydb".to_string(), "mapped-client".to_string());
        OidcSettings {
            enabled: true,
            token_url: Some("https://issuer.example/token".to_string()),
            userinfo_url: Some("https://issuer.example/userinfo".to_string()),
            db_clients,
            global_client_id: Some("global-client".to_string()),
            global_client_secret: Some("global-secret".to_string()),
            fallback_enabled: true,
        }
    }

    #[test]
    fn client_for_mapped_database_uses_mapping() {
        let settings = settings_with_mapping();
        let client = settings.client_for_database("mydb").unwrap();
        assert_eq!(client.client_id, "mapped-client");
    }

    #[test]
    fn client_for_unmapped_database_falls_back_when_enabled() {
        let settings = settings_with_mapping();
        let client = settings.client_for_database("otherdb").unwrap();
        assert_eq!(client.client_id, "global-client");
    }

    #[test]
    fn client_for_unmapped_database_errors_when_fallback_disabled() {
        let mut settings = settings_with_mapping();
        settings.fallback_enabled = false;
        let err = settings.client_for_database("otherdb").unwrap_err();
        assert!(matches!(err, AuthError::ClientIdNotFound(db) if db == "otherdb"));
    }

    #[test]
    fn extract_username_claim_missing_is_an_error() {
        let userinfo = serde_json::json!({"sub": "abc"});
        let err = OidcClient::extract_username_claim(&userinfo, "preferred_username").unwrap_err();
        assert!(matches!(err, AuthError::MissingUsernameClaim(c) if c == "preferred_username"));
    }

    #[test]
    fn extract_username_claim_present_succeeds() {
        let userinfo = serde_json::json!({"preferred_username": "alice"});
        let claim = OidcClient::extract_username_claim(&userinfo, "preferred_username").unwrap();
        assert_eq!(claim, "alice");
    }

    #[test]
    fn is_valid_accepts_matching_azp_with_future_exp() {
        let client = OidcClient::new(settings_with_mapping());
        let token = token_with_claims(Some("expected-client"), Some(usize::MAX));
        assert!(client.is_valid(&token, "expected-client"));
    }

    #[test]
    fn is_valid_rejects_token_missing_exp_claim() {
        let client = OidcClient::new(settings_with_mapping());
        let token = token_with_claims(Some("expected-client"), None);
        assert!(!client.is_valid(&token, "expected-client"));
    }

    #[test]
    fn is_valid_rejects_expired_token() {
        let client = OidcClient::new(settings_with_mapping());
        let token = token_with_claims(Some("expected-client"), Some(1));
        assert!(!client.is_valid(&token, "expected-client"));
    }

    #[test]
    fn is_valid_rejects_mismatched_azp() {
        let client = OidcClient::new(settings_with_mapping());
        let token = token_with_claims(Some("other-client"), Some(usize::MAX));
        assert!(!client.is_valid(&token, "expected-client"));
    }
}
