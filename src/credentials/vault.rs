//! Key Vault backed [`SecretProvider`]
//!
//! Sequence on first use:
//! 1. read the application identity and vault coordinates from the environment
//! 2. request the secret URL anonymously; the vault answers `401` with a bearer
//!    challenge naming the token authority and resource
//! 3. exchange the application id/secret for a token (client credentials)
//! 4. read the secret with that token

use async_trait::async_trait;
use envconfig::Envconfig;
use reqwest::{header, StatusCode};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{CredentialError, SecretProvider};

const SECRET_API_VERSION: &str = "7.0";

/// Settings the provider needs, read lazily from the environment
#[derive(Debug, Clone, Envconfig)]
pub struct VaultSettings {
    /// Application (client) id registered with the identity provider
    #[envconfig(from = "ApplicationId")]
    pub application_id: String,

    /// Application secret
    #[envconfig(from = "ApplicationSecret")]
    pub application_secret: String,

    /// Base URL of the vault, e.g. `https://my-vault.vault.azure.net`
    #[envconfig(from = "VaultUrl")]
    pub vault_url: String,

    /// Name of the secret holding the stream connection string
    #[envconfig(from = "SecretName")]
    pub secret_name: String,
}

impl VaultSettings {
    /// Load from the process environment
    pub fn from_env() -> Result<Self, CredentialError> {
        Self::init_from_env()
            .map_err(|e| CredentialError::ConfigMissing(e.to_string()))?
            .ensure_present()
    }

    /// Load from an explicit map
    pub fn from_map(values: &HashMap<String, String>) -> Result<Self, CredentialError> {
        Self::init_from_hashmap(values)
            .map_err(|e| CredentialError::ConfigMissing(e.to_string()))?
            .ensure_present()
    }

    /// Treat empty values the same as absent ones
    fn ensure_present(self) -> Result<Self, CredentialError> {
        let fields = [
            ("ApplicationId", &self.application_id),
            ("ApplicationSecret", &self.application_secret),
            ("VaultUrl", &self.vault_url),
            ("SecretName", &self.secret_name),
        ];
        if let Some((name, _)) = fields.iter().find(|(_, value)| value.trim().is_empty()) {
            return Err(CredentialError::ConfigMissing(format!("{} is empty", name)));
        }
        Ok(self)
    }

    /// URL of the configured secret
    pub fn secret_url(&self) -> String {
        format!(
            "{}/secrets/{}?api-version={}",
            self.vault_url.trim_end_matches('/'),
            self.secret_name,
            SECRET_API_VERSION
        )
    }
}

/// Authority and resource announced by the vault's bearer challenge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BearerChallenge {
    pub authority: String,
    pub resource: String,
}

impl BearerChallenge {
    /// Parse a `WWW-Authenticate: Bearer k="v", ...` header value
    pub fn parse(header_value: &str) -> Option<Self> {
        let params = header_value.trim().strip_prefix("Bearer")?;

        let mut values = HashMap::new();
        for part in params.split(',') {
            if let Some((key, value)) = part.split_once('=') {
                values.insert(key.trim().to_ascii_lowercase(), value.trim().trim_matches('"'));
            }
        }

        let authority = values
            .get("authorization")
            .or_else(|| values.get("authorization_uri"))?
            .trim_end_matches('/')
            .to_string();
        let resource = match values.get("resource") {
            Some(resource) => resource.to_string(),
            None => values
                .get("scope")?
                .trim_end_matches("/.default")
                .to_string(),
        };

        if authority.is_empty() || resource.is_empty() {
            return None;
        }
        Some(Self {
            authority,
            resource,
        })
    }

    /// Token endpoint for the client-credentials grant
    pub fn token_url(&self) -> String {
        format!("{}/oauth2/token", self.authority)
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SecretBundle {
    value: Option<String>,
}

/// Settings are either read at first use or fixed up front
#[derive(Debug, Clone)]
enum SettingsSource {
    Environment,
    Fixed(VaultSettings),
}

/// Fetches the stream connection string from Key Vault
#[derive(Debug, Clone)]
pub struct KeyVaultSecretProvider {
    http: reqwest::Client,
    settings: SettingsSource,
}

impl KeyVaultSecretProvider {
    /// Provider that reads its settings from the environment on first use
    pub fn from_env(request_timeout: Duration) -> Result<Self, CredentialError> {
        Ok(Self {
            http: build_http_client(request_timeout)?,
            settings: SettingsSource::Environment,
        })
    }

    /// Provider with explicit settings
    pub fn with_settings(
        settings: VaultSettings,
        request_timeout: Duration,
    ) -> Result<Self, CredentialError> {
        Ok(Self {
            http: build_http_client(request_timeout)?,
            settings: SettingsSource::Fixed(settings),
        })
    }

    fn settings(&self) -> Result<VaultSettings, CredentialError> {
        match &self.settings {
            SettingsSource::Environment => VaultSettings::from_env(),
            SettingsSource::Fixed(settings) => Ok(settings.clone()),
        }
    }

    /// Request the secret anonymously to learn where to authenticate
    async fn discover_challenge(
        &self,
        settings: &VaultSettings,
    ) -> Result<BearerChallenge, CredentialError> {
        let response = self
            .http
            .get(settings.secret_url())
            .send()
            .await
            .map_err(|e| CredentialError::SecretFetch(format!("vault unreachable: {}", e)))?;

        if response.status() != StatusCode::UNAUTHORIZED {
            return Err(CredentialError::SecretFetch(format!(
                "expected an authentication challenge, vault answered {}",
                response.status()
            )));
        }

        let challenge = response
            .headers()
            .get(header::WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .and_then(BearerChallenge::parse)
            .ok_or_else(|| {
                CredentialError::Auth("vault did not send a usable bearer challenge".to_string())
            })?;

        debug!(authority = %challenge.authority, resource = %challenge.resource, "Vault challenge received");
        Ok(challenge)
    }

    /// Exchange the application identity for an access token
    async fn acquire_token(
        &self,
        settings: &VaultSettings,
        challenge: &BearerChallenge,
    ) -> Result<String, CredentialError> {
        let form = [
            ("grant_type", "client_credentials"),
            ("client_id", settings.application_id.as_str()),
            ("client_secret", settings.application_secret.as_str()),
            ("resource", challenge.resource.as_str()),
        ];

        let response = self
            .http
            .post(challenge.token_url())
            .form(&form)
            .send()
            .await
            .map_err(|e| CredentialError::Auth(format!("token endpoint unreachable: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            warn!(status = %status, "Token request rejected");
            return Err(CredentialError::Auth(format!(
                "token request rejected with {}",
                status
            )));
        }

        response
            .json::<TokenResponse>()
            .await
            .map_err(|e| CredentialError::Auth(format!("unreadable token response: {}", e)))?
            .access_token
            .filter(|token| !token.is_empty())
            .ok_or_else(|| CredentialError::Auth("token response had no access_token".to_string()))
    }

    /// Read the secret value with a bearer token
    async fn read_secret(
        &self,
        settings: &VaultSettings,
        token: &str,
    ) -> Result<String, CredentialError> {
        let response = self
            .http
            .get(settings.secret_url())
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| CredentialError::SecretFetch(format!("vault unreachable: {}", e)))?;

        match response.status() {
            status if status.is_success() => {},
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(CredentialError::Auth(format!(
                    "vault refused the token with {}",
                    response.status()
                )));
            },
            StatusCode::NOT_FOUND => {
                return Err(CredentialError::SecretFetch(format!(
                    "secret '{}' does not exist",
                    settings.secret_name
                )));
            },
            status => {
                return Err(CredentialError::SecretFetch(format!(
                    "vault answered {}",
                    status
                )));
            },
        }

        response
            .json::<SecretBundle>()
            .await
            .map_err(|e| CredentialError::SecretFetch(format!("unreadable secret bundle: {}", e)))?
            .value
            .filter(|value| !value.is_empty())
            .ok_or_else(|| {
                CredentialError::SecretFetch(format!("secret '{}' has no value", settings.secret_name))
            })
    }
}

#[async_trait]
impl SecretProvider for KeyVaultSecretProvider {
    async fn fetch_connection_string(&self) -> Result<String, CredentialError> {
        let settings = self.settings()?;
        let challenge = self.discover_challenge(&settings).await?;
        let token = self.acquire_token(&settings, &challenge).await?;
        let secret = self.read_secret(&settings, &token).await?;

        info!(secret_name = %settings.secret_name, "Fetched stream connection string from vault");
        Ok(secret)
    }
}

fn build_http_client(request_timeout: Duration) -> Result<reqwest::Client, CredentialError> {
    reqwest::Client::builder()
        .timeout(request_timeout)
        .build()
        .map_err(|e| CredentialError::SecretFetch(format!("failed to build HTTP client: {}", e)))
}
