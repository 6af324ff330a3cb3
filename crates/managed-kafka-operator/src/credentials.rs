//! Managed Kafka credentials from the environment's secret

use crate::client_cache::AdminClientCache;
use crate::error::{OperatorError, Result};
use crate::oauth::{AdminClientConfig, ClientCredentialsConfig, OAuthClient};
use std::collections::BTreeMap;
use std::sync::Arc;

pub const CLIENT_ID_KEY: &str = "client.id";
pub const CLIENT_SECRET_KEY: &str = "client.secret";
pub const HOSTNAME_KEY: &str = "hostname";
pub const ADMIN_URL_KEY: &str = "admin.url";
pub const TOKEN_URL_KEY: &str = "token.url";

/// Decoded fields of the managed Kafka secret
#[derive(Clone, PartialEq, Eq)]
pub struct ManagedKafkaCredentials {
    pub client_id: String,
    pub client_secret: String,
    /// Bootstrap host of the Kafka cluster
    pub hostname: String,
    /// Base URL of the admin REST API
    pub admin_url: String,
    pub token_url: String,
}

impl ManagedKafkaCredentials {
    /// Parse the decoded secret payload; every field is required
    pub fn from_secret_data(data: &BTreeMap<String, Vec<u8>>) -> Result<Self> {
        let field = |key: &str| -> Result<String> {
            let raw = data
                .get(key)
                .ok_or_else(|| OperatorError::InvalidSecret(format!("missing field '{}'", key)))?;
            let value = std::str::from_utf8(raw).map_err(|_| {
                OperatorError::InvalidSecret(format!("field '{}' is not valid UTF-8", key))
            })?;
            if value.trim().is_empty() {
                return Err(OperatorError::InvalidSecret(format!(
                    "field '{}' is empty",
                    key
                )));
            }
            Ok(value.to_string())
        };

        Ok(Self {
            client_id: field(CLIENT_ID_KEY)?,
            client_secret: field(CLIENT_SECRET_KEY)?,
            hostname: field(HOSTNAME_KEY)?,
            admin_url: field(ADMIN_URL_KEY)?.trim_end_matches('/').to_string(),
            token_url: field(TOKEN_URL_KEY)?,
        })
    }

    pub fn client_credentials(&self) -> ClientCredentialsConfig {
        ClientCredentialsConfig {
            client_id: self.client_id.clone(),
            client_secret: self.client_secret.clone(),
            token_url: self.token_url.clone(),
        }
    }

    /// Cached admin client for this secret's admin URL, built on first use
    pub fn admin_client(
        &self,
        clients: &AdminClientCache,
        config: &AdminClientConfig,
    ) -> Result<Arc<OAuthClient>> {
        clients.get_or_insert_with(&self.admin_url, || {
            OAuthClient::new(self.client_credentials(), config)
        })
    }
}

impl std::fmt::Debug for ManagedKafkaCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedKafkaCredentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("hostname", &self.hostname)
            .field("admin_url", &self.admin_url)
            .field("token_url", &self.token_url)
            .finish()
    }
}

#[cfg(test)]
pub(crate) fn test_secret_data(admin_url: &str, token_url: &str) -> BTreeMap<String, Vec<u8>> {
    [
        (CLIENT_ID_KEY, "svc-account"),
        (CLIENT_SECRET_KEY, "s3cret"),
        (HOSTNAME_KEY, "kafka.example.com"),
        (ADMIN_URL_KEY, admin_url),
        (TOKEN_URL_KEY, token_url),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.as_bytes().to_vec()))
    .collect()
}
