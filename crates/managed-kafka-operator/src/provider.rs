//! Managed Kafka provisioning for one environment
//!
//! A [`ManagedKafkaProvider`] is built once per environment pass. Building
//! it resolves the admin client and provisions the Connect secret and
//! cluster; [`ManagedKafkaProvider::provide`] then converges each
//! application's topics and returns the Kafka configuration the
//! application should be given.

use crate::admin::AdminApiClient;
use crate::aggregator::{canonical_topic_name, TopicAggregator};
use crate::client_cache::AdminClientCache;
use crate::connect::configure_brokers;
use crate::conversion::ConversionRegistry;
use crate::credentials::ManagedKafkaCredentials;
use crate::crd::{KafkaApp, KafkaConnect, KafkaEnvironment};
use crate::error::{ErrorContext, Result};
use crate::oauth::AdminClientConfig;
use crate::resource_cache::ResourceCache;
use kube::ResourceExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info, instrument};

/// Port of the managed cluster's SASL_SSL listener
pub const MANAGED_BROKER_PORT: i32 = 443;

/// Kafka settings handed to an application
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KafkaConfig {
    pub brokers: Vec<BrokerConfig>,
    pub topics: Vec<TopicConfig>,
}

/// One bootstrap broker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerConfig {
    pub hostname: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authtype: Option<BrokerAuthType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sasl: Option<KafkaSaslConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerAuthType {
    Mtls,
    Sasl,
}

/// SASL credentials for a broker
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KafkaSaslConfig {
    pub username: String,
    pub password: String,
    pub security_protocol: String,
    pub sasl_mechanism: String,
}

impl std::fmt::Debug for KafkaSaslConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KafkaSaslConfig")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("security_protocol", &self.security_protocol)
            .field("sasl_mechanism", &self.sasl_mechanism)
            .finish()
    }
}

/// Topic as provisioned, alongside the name the application asked for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicConfig {
    pub name: String,
    pub requested_name: String,
}

/// Provisioner bound to one environment and its managed Kafka credentials
#[derive(Debug)]
pub struct ManagedKafkaProvider<'a> {
    env: &'a KafkaEnvironment,
    registry: &'a ConversionRegistry,
    credentials: ManagedKafkaCredentials,
    admin: AdminApiClient,
    connect: KafkaConnect,
}

impl<'a> ManagedKafkaProvider<'a> {
    /// Resolve credentials and the shared admin client, then provision the
    /// Connect secret followed by the Connect cluster.
    #[instrument(skip_all, fields(env = %env.name_any()))]
    pub async fn new<R: ResourceCache>(
        env: &'a KafkaEnvironment,
        secret_data: &BTreeMap<String, Vec<u8>>,
        clients: &AdminClientCache,
        cache: &R,
        registry: &'a ConversionRegistry,
        admin_config: &AdminClientConfig,
    ) -> Result<Self> {
        let credentials = ManagedKafkaCredentials::from_secret_data(secret_data)?;
        let http = credentials.admin_client(clients, admin_config)?;
        let admin = AdminApiClient::new(credentials.admin_url.clone(), http);

        let connect = configure_brokers(env, &credentials, cache).await?;

        Ok(Self {
            env,
            registry,
            credentials,
            admin,
            connect,
        })
    }

    /// The Connect cluster written while building the provider
    pub fn connect_cluster(&self) -> &KafkaConnect {
        &self.connect
    }

    /// Converge `app`'s topics, aggregating over every app in the environment.
    ///
    /// Returns `None` when `app` declares no topics. Stops at the first
    /// topic that fails.
    #[instrument(skip_all, fields(env = %self.env.name_any(), app = %app.name_any()))]
    pub async fn provide(
        &self,
        app: &KafkaApp,
        apps_in_env: &[KafkaApp],
    ) -> Result<Option<KafkaConfig>> {
        if app.spec.kafka_topics.is_empty() {
            debug!("Application declares no topics");
            return Ok(None);
        }

        let env_name = self.env.name_any();
        let aggregator = TopicAggregator::new(self.registry, self.env.cluster_replica_cap());
        let mut topics = Vec::with_capacity(app.spec.kafka_topics.len());

        for request in &app.spec.kafka_topics {
            let name = canonical_topic_name(&env_name, &request.topic_name);

            self.provision_topic(&aggregator, &name, &request.topic_name, apps_in_env)
                .await
                .with_context(|| format!("failed to provision topic {}", name))?;

            topics.push(TopicConfig {
                name,
                requested_name: request.topic_name.clone(),
            });
        }

        info!(topics = topics.len(), "Provisioned application topics");

        Ok(Some(KafkaConfig {
            brokers: vec![self.broker()],
            topics,
        }))
    }

    async fn provision_topic(
        &self,
        aggregator: &TopicAggregator<'_>,
        name: &str,
        requested: &str,
        apps_in_env: &[KafkaApp],
    ) -> Result<()> {
        let settings = aggregator.aggregate_for_apps(requested, apps_in_env)?;
        let state = self.admin.sync_topic(name, &settings).await?;
        debug!(topic = %name, state = ?state, "Synchronized topic");
        Ok(())
    }

    fn broker(&self) -> BrokerConfig {
        BrokerConfig {
            hostname: self.credentials.hostname.clone(),
            port: Some(MANAGED_BROKER_PORT),
            authtype: Some(BrokerAuthType::Sasl),
            sasl: Some(KafkaSaslConfig {
                username: self.credentials.client_id.clone(),
                password: self.credentials.client_secret.clone(),
                security_protocol: "SASL_SSL".to_string(),
                sasl_mechanism: "PLAIN".to_string(),
            }),
        }
    }
}
