//! Service-account authentication for the Compute Engine API.
//!
//! A signed JWT assertion is exchanged for a bearer token at the account's
//! token endpoint. Tokens are cached until shortly before they expire.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::provider::ProviderError;

const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const COMPUTE_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_LIFETIME: Duration = Duration::from_secs(3600);
const REFRESH_MARGIN: Duration = Duration::from_secs(60);

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_owned()
}

/// Fields of a service-account key file used by the client.
#[derive(Clone, Deserialize, Eq, PartialEq)]
pub(crate) struct ServiceAccountKey {
    pub(crate) project_id: String,
    pub(crate) client_email: String,
    pub(crate) private_key: String,
    #[serde(default)]
    pub(crate) private_key_id: Option<String>,
    #[serde(default = "default_token_uri")]
    pub(crate) token_uri: String,
}

impl std::fmt::Debug for ServiceAccountKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceAccountKey")
            .field("project_id", &self.project_id)
            .field("client_email", &self.client_email)
            .field("private_key", &"<redacted>")
            .finish_non_exhaustive()
    }
}

impl ServiceAccountKey {
    /// Parses the credential document stored on a driver.
    pub(crate) fn from_credentials(credentials: &serde_json::Value) -> Result<Self, ProviderError> {
        let key = Self::deserialize(credentials)
            .map_err(|err| ProviderError::Auth(format!("invalid service account key: {err}")))?;
        for (field, value) in [
            ("project_id", &key.project_id),
            ("client_email", &key.client_email),
            ("private_key", &key.private_key),
        ] {
            if value.trim().is_empty() {
                return Err(ProviderError::Auth(format!(
                    "service account key is missing {field}"
                )));
            }
        }
        Ok(key)
    }
}

#[derive(Debug, Serialize)]
struct Claims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: u64,
    exp: u64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Clone, Debug)]
struct CachedToken {
    value: String,
    expires_at: SystemTime,
}

/// Issues and caches bearer tokens for one service account.
#[derive(Debug)]
pub(crate) struct TokenSource {
    key: ServiceAccountKey,
    cached: Mutex<Option<CachedToken>>,
}

impl TokenSource {
    pub(crate) fn new(key: ServiceAccountKey) -> Self {
        Self {
            key,
            cached: Mutex::new(None),
        }
    }

    pub(crate) fn project_id(&self) -> &str {
        &self.key.project_id
    }

    /// Builds the RS256-signed assertion exchanged for an access token.
    pub(crate) fn assertion(&self, now: SystemTime) -> Result<String, ProviderError> {
        let issued = now
            .duration_since(UNIX_EPOCH)
            .map_err(|err| ProviderError::Auth(format!("system clock error: {err}")))?;
        let claims = Claims {
            iss: &self.key.client_email,
            scope: COMPUTE_SCOPE,
            aud: &self.key.token_uri,
            iat: issued.as_secs(),
            exp: (issued + ASSERTION_LIFETIME).as_secs(),
        };
        let mut header = Header::new(Algorithm::RS256);
        header.kid.clone_from(&self.key.private_key_id);
        let signing_key = EncodingKey::from_rsa_pem(self.key.private_key.as_bytes())
            .map_err(|err| ProviderError::Auth(format!("invalid private key: {err}")))?;
        jsonwebtoken::encode(&header, &claims, &signing_key)
            .map_err(|err| ProviderError::Auth(format!("failed to sign assertion: {err}")))
    }

    /// Returns a valid bearer token, refreshing it when needed.
    pub(crate) async fn token(&self, http: &reqwest::Client) -> Result<String, ProviderError> {
        let mut cached = self.cached.lock().await;
        let now = SystemTime::now();
        if let Some(token) = cached.as_ref()
            && token.expires_at > now + REFRESH_MARGIN
        {
            return Ok(token.value.clone());
        }

        let assertion = self.assertion(now)?;
        debug!(account = %self.key.client_email, "requesting access token");
        let response = http
            .post(&self.key.token_uri)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            .send()
            .await
            .map_err(|err| ProviderError::Transport(err.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| ProviderError::Transport(err.to_string()))?;
        if !status.is_success() {
            return Err(ProviderError::Auth(format!(
                "token endpoint returned {status}: {body}"
            )));
        }
        let parsed: TokenResponse = serde_json::from_str(&body)
            .map_err(|err| ProviderError::Decode(format!("token response: {err}")))?;
        let lifetime = parsed
            .expires_in
            .map_or(ASSERTION_LIFETIME, Duration::from_secs);
        *cached = Some(CachedToken {
            value: parsed.access_token.clone(),
            expires_at: now + lifetime,
        });
        Ok(parsed.access_token)
    }
}
