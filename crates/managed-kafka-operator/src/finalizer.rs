//! Remote topic cleanup for deleted environments

use crate::admin::AdminApiClient;
use crate::client_cache::AdminClientCache;
use crate::credentials::ManagedKafkaCredentials;
use crate::crd::KafkaEnvironment;
use crate::error::Result;
use crate::oauth::AdminClientConfig;
use kube::ResourceExt;
use std::collections::BTreeMap;
use tracing::{info, instrument, warn};

/// Delete every remote topic of `env` that starts with its delete prefix.
///
/// Does nothing when the prefix is empty. Topics are listed with the
/// server-side filter `{env}.*` and deleted one at a time; the first
/// failure aborts the pass and leaves the remaining topics in place.
/// Returns the names of the deleted topics.
#[instrument(skip_all, fields(env = %env.name_any()))]
pub async fn finalize_environment_topics(
    env: &KafkaEnvironment,
    secret_data: &BTreeMap<String, Vec<u8>>,
    clients: &AdminClientCache,
    admin_config: &AdminClientConfig,
) -> Result<Vec<String>> {
    let prefix = env.spec.kafka.managed_delete_prefix.as_str();
    if prefix.is_empty() {
        info!("No managed delete prefix, leaving remote topics in place");
        return Ok(Vec::new());
    }

    let credentials = ManagedKafkaCredentials::from_secret_data(secret_data)?;
    let http = credentials.admin_client(clients, admin_config)?;
    let admin = AdminApiClient::new(credentials.admin_url.clone(), http);

    let filter = format!("{}.*", env.name_any());
    let listed = admin.list_topics(&filter).await?;

    let mut deleted = Vec::new();
    for name in listed {
        if !name.starts_with(prefix) {
            continue;
        }
        if let Err(e) = admin.delete_topic(&name).await {
            warn!(topic = %name, error = %e, "Failed to delete topic");
            return Err(e);
        }
        deleted.push(name);
    }

    info!(deleted = deleted.len(), prefix = %prefix, "Removed environment topics");
    Ok(deleted)
}
