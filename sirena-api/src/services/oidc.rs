//! OIDC client for the ProConnect-style identity provider
//!
//! Implements the authorization code flow with client_secret_post: discovery,
//! authorization URL construction, code exchange, and RS256 id_token
//! validation against the provider's JWKS. Keys are cached and refreshed once
//! when an unknown `kid` shows up (provider key rotation).

use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use sirena_common::config::OidcSettings;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;

const DISCOVERY_PATH: &str = "/.well-known/openid-configuration";
const HTTP_TIMEOUT_SECS: u64 = 30;

/// OIDC client errors
#[derive(Debug, Error)]
pub enum OidcError {
    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Provider error {0}: {1}")]
    ProviderError(u16, String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Invalid token: {0}")]
    InvalidToken(String),

    #[error("Unknown signing key: {0}")]
    UnknownKey(String),
}

/// OIDC discovery document (the fields SIRENA uses)
#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryDocument {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub jwks_uri: String,
    #[serde(default)]
    pub end_session_endpoint: Option<String>,
}

/// Token endpoint response
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub id_token: String,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
}

/// One JSON Web Key from the provider's JWKS
#[derive(Debug, Clone, Deserialize)]
struct Jwk {
    #[serde(default)]
    kid: Option<String>,
    kty: String,
    #[serde(default)]
    n: Option<String>,
    #[serde(default)]
    e: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JwksDocument {
    keys: Vec<Jwk>,
}

/// Validated id_token claims
///
/// ProConnect sends the last name as `usual_name`; other providers use the
/// standard `family_name`. Both are kept and the caller picks.
#[derive(Debug, Clone, Deserialize)]
pub struct IdTokenClaims {
    pub sub: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub given_name: Option<String>,
    #[serde(default)]
    pub usual_name: Option<String>,
    #[serde(default)]
    pub family_name: Option<String>,
    #[serde(default)]
    pub nonce: Option<String>,
}

/// Generate a random URL-safe token for state and nonce values
pub fn random_token(len: usize) -> String {
    use rand::distributions::Alphanumeric;
    use rand::Rng;

    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// OIDC client
pub struct OidcClient {
    settings: OidcSettings,
    discovery: DiscoveryDocument,
    http_client: reqwest::Client,
    keys: RwLock<HashMap<String, Jwk>>,
}

impl OidcClient {
    /// Build a client from a known discovery document (no network)
    pub fn new(settings: OidcSettings, discovery: DiscoveryDocument) -> Result<Self, OidcError> {
        let http_client = reqwest::Client::builder()
            .user_agent(concat!("sirena/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()
            .map_err(|e| OidcError::NetworkError(e.to_string()))?;

        Ok(Self {
            settings,
            discovery,
            http_client,
            keys: RwLock::new(HashMap::new()),
        })
    }

    /// Fetch the discovery document and JWKS from the provider
    pub async fn discover(settings: OidcSettings) -> Result<Self, OidcError> {
        let url = format!(
            "{}{}",
            settings.issuer_url.trim_end_matches('/'),
            DISCOVERY_PATH
        );

        tracing::info!(url = %url, "Fetching OIDC discovery document");

        let bootstrap = reqwest::Client::builder()
            .user_agent(concat!("sirena/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()
            .map_err(|e| OidcError::NetworkError(e.to_string()))?;

        let response = bootstrap
            .get(&url)
            .send()
            .await
            .map_err(|e| OidcError::NetworkError(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(OidcError::ProviderError(status.as_u16(), error_text));
        }

        let discovery: DiscoveryDocument = response
            .json()
            .await
            .map_err(|e| OidcError::ParseError(e.to_string()))?;

        let client = Self::new(settings, discovery)?;
        client.refresh_keys().await?;

        tracing::info!(issuer = %client.discovery.issuer, "OIDC provider ready");
        Ok(client)
    }

    pub fn settings(&self) -> &OidcSettings {
        &self.settings
    }

    /// Build the authorization redirect URL for a login attempt
    pub fn authorization_url(&self, state: &str, nonce: &str) -> Result<String, OidcError> {
        let mut url = reqwest::Url::parse(&self.discovery.authorization_endpoint)
            .map_err(|e| OidcError::ParseError(e.to_string()))?;

        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.settings.client_id)
            .append_pair("redirect_uri", &self.settings.redirect_url)
            .append_pair("scope", &self.settings.scopes)
            .append_pair("state", state)
            .append_pair("nonce", nonce);

        Ok(url.into())
    }

    /// Exchange an authorization code for tokens (client_secret_post)
    pub async fn exchange_code(&self, code: &str) -> Result<TokenResponse, OidcError> {
        tracing::debug!("Exchanging authorization code");

        let response = self
            .http_client
            .post(&self.discovery.token_endpoint)
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", &self.settings.redirect_url),
                ("client_id", &self.settings.client_id),
                ("client_secret", &self.settings.client_secret),
            ])
            .send()
            .await
            .map_err(|e| OidcError::NetworkError(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            tracing::warn!(status = %status, "Token exchange failed");
            return Err(OidcError::ProviderError(status.as_u16(), error_text));
        }

        response
            .json()
            .await
            .map_err(|e| OidcError::ParseError(e.to_string()))
    }

    /// Reload the JWKS from the provider
    pub async fn refresh_keys(&self) -> Result<(), OidcError> {
        let response = self
            .http_client
            .get(&self.discovery.jwks_uri)
            .send()
            .await
            .map_err(|e| OidcError::NetworkError(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(OidcError::ProviderError(status.as_u16(), error_text));
        }

        let jwks: JwksDocument = response
            .json()
            .await
            .map_err(|e| OidcError::ParseError(e.to_string()))?;

        let mut keys = self.keys.write().await;
        keys.clear();
        for key in jwks.keys {
            if key.kty != "RSA" {
                continue;
            }
            if let Some(kid) = key.kid.clone() {
                keys.insert(kid, key);
            }
        }

        tracing::debug!(count = keys.len(), "Loaded provider signing keys");
        Ok(())
    }

    async fn decoding_key_for(&self, kid: &str) -> Option<DecodingKey> {
        let keys = self.keys.read().await;
        let jwk = keys.get(kid)?;
        let (n, e) = (jwk.n.as_deref()?, jwk.e.as_deref()?);
        DecodingKey::from_rsa_components(n, e).ok()
    }

    /// Validate an id_token: signature, issuer, audience, expiry, and nonce
    pub async fn validate_id_token(
        &self,
        id_token: &str,
        expected_nonce: &str,
    ) -> Result<IdTokenClaims, OidcError> {
        let header =
            decode_header(id_token).map_err(|e| OidcError::InvalidToken(e.to_string()))?;
        let kid = header
            .kid
            .ok_or_else(|| OidcError::InvalidToken("id_token has no kid".to_string()))?;

        let key = match self.decoding_key_for(&kid).await {
            Some(key) => key,
            None => {
                // Unknown kid: the provider may have rotated keys
                self.refresh_keys().await?;
                self.decoding_key_for(&kid)
                    .await
                    .ok_or_else(|| OidcError::UnknownKey(kid.clone()))?
            }
        };

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_issuer(&[&self.discovery.issuer]);
        validation.set_audience(&[&self.settings.client_id]);

        let data = decode::<IdTokenClaims>(id_token, &key, &validation)
            .map_err(|e| OidcError::InvalidToken(e.to_string()))?;

        if data.claims.nonce.as_deref() != Some(expected_nonce) {
            return Err(OidcError::InvalidToken("nonce mismatch".to_string()));
        }

        Ok(data.claims)
    }

    /// Build the provider logout URL, when the provider supports RP-initiated
    /// logout
    pub fn end_session_url(&self, id_token_hint: Option<&str>) -> Option<String> {
        let endpoint = self.discovery.end_session_endpoint.as_ref()?;
        let mut url = reqwest::Url::parse(endpoint).ok()?;

        {
            let mut pairs = url.query_pairs_mut();
            if let Some(hint) = id_token_hint {
                pairs.append_pair("id_token_hint", hint);
            }
            pairs.append_pair(
                "post_logout_redirect_uri",
                &self.settings.frontend_url,
            );
        }

        Some(url.into())
    }
}
