//! OAuth2 access tokens for Vertex AI
//!
//! JWT Bearer grant flow: sign a claims set with the service account's
//! RSA key, exchange it at the token endpoint, and cache the access token
//! in memory with a five-minute refresh margin. Tokens never touch disk.

use std::path::PathBuf;

use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::LlmError;

const TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";
/// Refresh this many seconds before expiry
const EXPIRY_MARGIN: i64 = 300;

/// Service-account credential subset needed for the JWT flow
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccountCredentials {
    pub client_email: String,
    pub private_key: String,
    #[serde(default)]
    pub token_uri: Option<String>,
}

#[derive(Debug, Serialize)]
struct Claims {
    iss: String,
    scope: String,
    aud: String,
    exp: i64,
    iat: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    exp_unix: i64,
}

impl CachedToken {
    fn valid_at(&self, now: i64) -> bool {
        self.exp_unix - EXPIRY_MARGIN > now
    }
}

#[derive(Default)]
struct TokenState {
    credentials: Option<ServiceAccountCredentials>,
    cached: Option<CachedToken>,
}

/// Access-token provider with in-memory caching. One instance is shared
/// across all Vertex-backed operations of a provider.
pub struct TokenProvider {
    credentials_path: PathBuf,
    http: reqwest::Client,
    state: Mutex<TokenState>,
}

impl TokenProvider {
    pub fn new(credentials_path: PathBuf, http: reqwest::Client) -> Self {
        Self {
            credentials_path,
            http,
            state: Mutex::new(TokenState::default()),
        }
    }

    /// Current bearer token, refreshed when within the expiry margin.
    /// The state lock is held across a refresh so concurrent callers
    /// wait for the single in-flight fetch.
    pub async fn token(&self) -> Result<String, LlmError> {
        let mut state = self.state.lock().await;

        let now = chrono::Utc::now().timestamp();
        if let Some(cached) = &state.cached {
            if cached.valid_at(now) {
                return Ok(cached.token.clone());
            }
        }

        if state.credentials.is_none() {
            let raw = tokio::fs::read_to_string(&self.credentials_path)
                .await
                .map_err(|e| {
                    LlmError::Configuration(format!(
                        "cannot read service account file {}: {}",
                        self.credentials_path.display(),
                        e
                    ))
                })?;
            let creds: ServiceAccountCredentials = serde_json::from_str(&raw)
                .map_err(|e| LlmError::Configuration(format!("invalid service account JSON: {}", e)))?;
            state.credentials = Some(creds);
        }
        let creds = state.credentials.as_ref().unwrap().clone();

        let aud = creds.token_uri.clone().unwrap_or_else(|| TOKEN_URI.to_string());
        let claims = Claims {
            iss: creds.client_email.clone(),
            scope: SCOPE.to_string(),
            aud: aud.clone(),
            iat: now,
            exp: now + 3_600,
        };

        let key = EncodingKey::from_rsa_pem(creds.private_key.as_bytes())
            .map_err(|e| LlmError::Configuration(format!("invalid RSA private key: {}", e)))?;
        let assertion = encode(&Header::new(Algorithm::RS256), &claims, &key)
            .map_err(|e| LlmError::Configuration(format!("failed to sign JWT: {}", e)))?;

        let form = [
            ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
            ("assertion", assertion.as_str()),
        ];
        let response = self
            .http
            .post(&aud)
            .form(&form)
            .send()
            .await
            .map_err(LlmError::Network)?;
        let status = response.status().as_u16();
        if !response.status().is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(LlmError::Auth(format!(
                "token endpoint returned {}: {}",
                status, text
            )));
        }
        let token: TokenResponse = response.json().await.map_err(LlmError::Network)?;

        tracing::debug!("refreshed vertex access token");
        state.cached = Some(CachedToken {
            token: token.access_token.clone(),
            exp_unix: now + token.expires_in,
        });
        Ok(token.access_token)
    }
}
