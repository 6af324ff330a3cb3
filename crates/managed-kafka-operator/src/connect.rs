//! Kafka Connect cluster provisioning
//!
//! Every environment gets one Strimzi `KafkaConnect` cluster plus a secret
//! holding the OAuth client secret the workers authenticate with. The
//! secret is written first since the cluster spec references it.
//!
//! The cluster goes through [`ConnectClusterBuilder`], whose type parameter
//! tracks the pipeline stage:
//!
//! ```text
//! create ──► verify_env_label ──► build_spec ──► update_cache
//! ```
//!
//! Skipping the label check or writing an unbuilt spec does not compile.

use crate::credentials::{ManagedKafkaCredentials, CLIENT_SECRET_KEY};
use crate::crd::{
    CertSecretSource, GenericSecretSource, KafkaConnect, KafkaConnectAuthentication,
    KafkaConnectSpec, KafkaConnectTls, KafkaEnvironment, PasswordSecretSource,
};
use crate::error::{ErrorContext, OperatorError, Result};
use crate::resource_cache::{ObjectKey, ResourceCache};
use k8s_openapi::api::core::v1::{ResourceRequirements, Secret};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::marker::PhantomData;
use tracing::{debug, info, instrument};

/// Worker image used when the environment does not set one
pub const DEFAULT_CONNECT_IMAGE: &str = "quay.io/cloudservices/xjoin-kafka-connect-strimzi:latest";

/// Kafka version used when the environment does not set one
pub const DEFAULT_CONNECT_VERSION: &str = "3.0.0";

/// Makes Strimzi manage connectors through `KafkaConnector` resources
pub const USE_CONNECTOR_RESOURCES_ANNOTATION: &str = "strimzi.io/use-connector-resources";

/// Label tying shared resources to their environment
pub const ENV_LABEL: &str = "env";

const DEFAULT_REQUESTS: [(&str, &str); 2] = [("cpu", "300m"), ("memory", "500Mi")];
const DEFAULT_LIMITS: [(&str, &str); 2] = [("cpu", "600m"), ("memory", "800Mi")];

fn env_labels(env: &KafkaEnvironment) -> BTreeMap<String, String> {
    BTreeMap::from([(ENV_LABEL.to_string(), env.name_any())])
}

/// Write the secret holding the Connect workers' OAuth client secret
#[instrument(skip_all, fields(env = %env.name_any()))]
pub async fn create_connect_secret<R: ResourceCache>(
    env: &KafkaEnvironment,
    credentials: &ManagedKafkaCredentials,
    cache: &R,
) -> Result<Secret> {
    let key = ObjectKey::new(env.connect_namespace()?, env.connect_secret_name());
    let mut secret: Secret = cache.create(&key, Secret::default()).await?;

    // The previous encoded value must not survive the rewrite
    if let Some(data) = secret.data.as_mut() {
        data.remove(CLIENT_SECRET_KEY);
    }
    secret.string_data = Some(BTreeMap::from([(
        CLIENT_SECRET_KEY.to_string(),
        credentials.client_secret.clone(),
    )]));
    secret.metadata.owner_references = Some(vec![env.owner_reference()?]);
    secret.metadata.name = Some(key.name.clone());
    secret.metadata.namespace = Some(key.namespace.clone());
    secret.metadata.labels = Some(env_labels(env));

    cache.update(&secret).await?;

    debug!(secret = %key, "Wrote Kafka Connect secret");
    Ok(secret)
}

/// Stage: object fetched or freshly created
#[derive(Debug)]
pub struct Created;

/// Stage: no other environment owns the object
#[derive(Debug)]
pub struct Verified;

/// Stage: spec and metadata fully populated
#[derive(Debug)]
pub struct Built;

/// Staged builder for an environment's `KafkaConnect` cluster
#[derive(Debug)]
pub struct ConnectClusterBuilder<'a, S> {
    env: &'a KafkaEnvironment,
    credentials: &'a ManagedKafkaCredentials,
    key: ObjectKey,
    owner: OwnerReference,
    connect: KafkaConnect,
    _stage: PhantomData<S>,
}

impl<'a, S> ConnectClusterBuilder<'a, S> {
    fn advance<T>(self) -> ConnectClusterBuilder<'a, T> {
        ConnectClusterBuilder {
            env: self.env,
            credentials: self.credentials,
            key: self.key,
            owner: self.owner,
            connect: self.connect,
            _stage: PhantomData,
        }
    }
}

impl<'a> ConnectClusterBuilder<'a, Created> {
    /// Fetch the existing cluster or start from an empty one
    pub async fn create<R: ResourceCache>(
        env: &'a KafkaEnvironment,
        credentials: &'a ManagedKafkaCredentials,
        cache: &R,
    ) -> Result<Self> {
        let key = ObjectKey::new(env.connect_namespace()?, env.connect_cluster_name());
        let owner = env.owner_reference()?;
        let empty = KafkaConnect::new(&key.name, KafkaConnectSpec::default());
        let connect = cache.create(&key, empty).await?;

        Ok(Self {
            env,
            credentials,
            key,
            owner,
            connect,
            _stage: PhantomData,
        })
    }

    /// Refuse to take over a cluster labelled for another environment
    pub fn verify_env_label(self) -> Result<ConnectClusterBuilder<'a, Verified>> {
        if let Some(owner) = self.connect.labels().get(ENV_LABEL) {
            if *owner != self.env.name_any() {
                return Err(OperatorError::EnvConflict {
                    cluster: self.key.name.clone(),
                    namespace: self.key.namespace.clone(),
                    env_label: owner.clone(),
                });
            }
        }
        Ok(self.advance())
    }
}

impl<'a> ConnectClusterBuilder<'a, Verified> {
    /// Populate spec and metadata from the environment and credentials.
    ///
    /// The spec is replaced wholesale; existing annotations are kept.
    pub fn build_spec(mut self) -> ConnectClusterBuilder<'a, Built> {
        let env = self.env;
        let connect_config = &env.spec.kafka.connect;

        let (authentication, tls) = if env.spec.kafka.enable_legacy_strimzi {
            self.scram_authentication()
        } else {
            self.oauth_authentication()
        };

        self.connect.spec = KafkaConnectSpec {
            replicas: Some(connect_config.replicas.max(1)),
            version: Some(non_empty_or(&connect_config.version, DEFAULT_CONNECT_VERSION)),
            image: Some(non_empty_or(&connect_config.image, DEFAULT_CONNECT_IMAGE)),
            bootstrap_servers: self.credentials.hostname.clone(),
            config: worker_config(&env.name_any()),
            resources: Some(ResourceRequirements {
                requests: Some(quantities(
                    connect_config.resources.requests.as_ref(),
                    &DEFAULT_REQUESTS,
                )),
                limits: Some(quantities(
                    connect_config.resources.limits.as_ref(),
                    &DEFAULT_LIMITS,
                )),
                ..Default::default()
            }),
            authentication: Some(authentication),
            tls: Some(tls),
        };

        self.annotate();
        self.advance()
    }

    fn oauth_authentication(&self) -> (KafkaConnectAuthentication, KafkaConnectTls) {
        (
            KafkaConnectAuthentication::Oauth {
                client_id: self.credentials.client_id.clone(),
                client_secret: GenericSecretSource {
                    secret_name: self.env.connect_secret_name(),
                    key: CLIENT_SECRET_KEY.to_string(),
                },
                token_endpoint_uri: self.credentials.token_url.clone(),
            },
            KafkaConnectTls::default(),
        )
    }

    fn scram_authentication(&self) -> (KafkaConnectAuthentication, KafkaConnectTls) {
        let username = self.env.connect_user_name();
        (
            KafkaConnectAuthentication::ScramSha512 {
                username: username.clone(),
                password_secret: PasswordSecretSource {
                    secret_name: username,
                    password: "password".to_string(),
                },
            },
            KafkaConnectTls {
                trusted_certificates: vec![CertSecretSource {
                    secret_name: format!("{}-cluster-ca-cert", self.env.kafka_cluster_name()),
                    certificate: "ca.crt".to_string(),
                }],
            },
        )
    }

    fn annotate(&mut self) {
        let meta = &mut self.connect.metadata;

        meta.annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(USE_CONNECTOR_RESOURCES_ANNOTATION.to_string(), "true".to_string());
        meta.owner_references = Some(vec![self.owner.clone()]);
        meta.name = Some(self.key.name.clone());
        meta.namespace = Some(self.key.namespace.clone());
        meta.labels = Some(env_labels(self.env));
    }
}

impl<'a> ConnectClusterBuilder<'a, Built> {
    /// Write the finished cluster back through the resource cache
    pub async fn update_cache<R: ResourceCache>(self, cache: &R) -> Result<KafkaConnect> {
        cache.update(&self.connect).await?;
        info!(
            cluster = %self.key,
            auth = self
                .connect
                .spec
                .authentication
                .as_ref()
                .map(KafkaConnectAuthentication::auth_type)
                .unwrap_or_default(),
            "Provisioned Kafka Connect cluster"
        );
        Ok(self.connect)
    }
}

/// Provision the Connect secret and then the Connect cluster
pub async fn configure_brokers<R: ResourceCache>(
    env: &KafkaEnvironment,
    credentials: &ManagedKafkaCredentials,
    cache: &R,
) -> Result<KafkaConnect> {
    create_connect_secret(env, credentials, cache)
        .await
        .context("failed to create kafka connect cluster secret")?;

    provision_connect_cluster(env, credentials, cache)
        .await
        .context("failed to provision kafka connect cluster")
}

async fn provision_connect_cluster<R: ResourceCache>(
    env: &KafkaEnvironment,
    credentials: &ManagedKafkaCredentials,
    cache: &R,
) -> Result<KafkaConnect> {
    ConnectClusterBuilder::create(env, credentials, cache)
        .await?
        .verify_env_label()?
        .build_spec()
        .update_cache(cache)
        .await
}

/// Connect worker properties for environment `env_name`
fn worker_config(env_name: &str) -> BTreeMap<String, String> {
    [
        ("config.storage.replication.factor", "1".to_string()),
        (
            "config.storage.topic",
            format!("{}-connect-cluster-configs", env_name),
        ),
        ("connector.client.config.override.policy", "All".to_string()),
        ("group.id", "connect-cluster".to_string()),
        ("offset.storage.replication.factor", "1".to_string()),
        (
            "offset.storage.topic",
            format!("{}-connect-cluster-offsets", env_name),
        ),
        ("status.storage.replication.factor", "1".to_string()),
        (
            "status.storage.topic",
            format!("{}-connect-cluster-status", env_name),
        ),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}

fn non_empty_or(value: &str, default: &str) -> String {
    if value.is_empty() {
        default.to_string()
    } else {
        value.to_string()
    }
}

/// Environment overrides when set, otherwise `defaults`
fn quantities(
    overrides: Option<&BTreeMap<String, String>>,
    defaults: &[(&str, &str)],
) -> BTreeMap<String, Quantity> {
    match overrides {
        Some(values) => values
            .iter()
            .map(|(k, v)| (k.clone(), Quantity(v.clone())))
            .collect(),
        None => defaults
            .iter()
            .map(|(k, v)| (k.to_string(), Quantity(v.to_string())))
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::test_secret_data;
    use crate::crd::test_fixtures::environment;
    use crate::resource_cache::memory::MemoryResourceCache;
    use k8s_openapi::ByteString;

    fn credentials() -> ManagedKafkaCredentials {
        ManagedKafkaCredentials::from_secret_data(&test_secret_data(
            "https://admin.example.com",
            "https://sso.example.com/token",
        ))
        .unwrap()
    }

    fn connect_key() -> ObjectKey {
        ObjectKey::new("env-a", "env-a")
    }

    #[tokio::test]
    async fn test_connect_secret_contents() {
        let cache = MemoryResourceCache::new();
        let env = environment("env-a");

        create_connect_secret(&env, &credentials(), &cache)
            .await
            .unwrap();

        let secret: Secret = cache
            .get(&ObjectKey::new("env-a", "env-a-connect"))
            .unwrap();
        assert_eq!(
            secret.string_data.unwrap().get("client.secret").map(String::as_str),
            Some("s3cret")
        );
        assert_eq!(secret.metadata.labels.unwrap().get("env").unwrap(), "env-a");
        let owners = secret.metadata.owner_references.unwrap();
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].name, "env-a");
    }

    #[tokio::test]
    async fn test_connect_secret_is_rewritten_on_every_pass() {
        let cache = MemoryResourceCache::new();
        let mut stale = Secret::default();
        stale.metadata.name = Some("env-a-connect".to_string());
        stale.metadata.namespace = Some("env-a".to_string());
        stale.metadata.labels = Some(BTreeMap::from([(
            "team".to_string(),
            "data".to_string(),
        )]));
        stale.data = Some(BTreeMap::from([
            ("client.secret".to_string(), ByteString(b"old".to_vec())),
            ("extra".to_string(), ByteString(b"kept".to_vec())),
        ]));
        stale.string_data = Some(BTreeMap::from([
            ("client.secret".to_string(), "old".to_string()),
            ("other".to_string(), "value".to_string()),
        ]));
        cache.insert(&stale);

        let env = environment("env-a");
        create_connect_secret(&env, &credentials(), &cache)
            .await
            .unwrap();

        let secret: Secret = cache
            .get(&ObjectKey::new("env-a", "env-a-connect"))
            .unwrap();
        assert_eq!(
            secret.string_data.unwrap(),
            BTreeMap::from([("client.secret".to_string(), "s3cret".to_string())])
        );
        let data = secret.data.unwrap();
        assert!(!data.contains_key("client.secret"));
        assert_eq!(data["extra"], ByteString(b"kept".to_vec()));
        assert_eq!(
            secret.metadata.labels.unwrap(),
            BTreeMap::from([("env".to_string(), "env-a".to_string())])
        );
        let owners = secret.metadata.owner_references.unwrap();
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].kind, "KafkaEnvironment");
        assert_eq!(owners[0].name, "env-a");
    }

    #[tokio::test]
    async fn test_oauth_cluster_spec() {
        let cache = MemoryResourceCache::new();
        let env = environment("env-a");

        let connect = configure_brokers(&env, &credentials(), &cache)
            .await
            .unwrap();

        let spec = &connect.spec;
        assert_eq!(spec.replicas, Some(1));
        assert_eq!(spec.version.as_deref(), Some("3.0.0"));
        assert_eq!(spec.image.as_deref(), Some(DEFAULT_CONNECT_IMAGE));
        assert_eq!(spec.bootstrap_servers, "kafka.example.com");
        assert_eq!(
            spec.authentication,
            Some(KafkaConnectAuthentication::Oauth {
                client_id: "svc-account".to_string(),
                client_secret: GenericSecretSource {
                    secret_name: "env-a-connect".to_string(),
                    key: "client.secret".to_string(),
                },
                token_endpoint_uri: "https://sso.example.com/token".to_string(),
            })
        );
        assert!(spec.tls.as_ref().unwrap().trusted_certificates.is_empty());

        assert_eq!(spec.config["group.id"], "connect-cluster");
        assert_eq!(
            spec.config["config.storage.topic"],
            "env-a-connect-cluster-configs"
        );
        assert_eq!(
            spec.config["offset.storage.topic"],
            "env-a-connect-cluster-offsets"
        );
        assert_eq!(
            spec.config["status.storage.topic"],
            "env-a-connect-cluster-status"
        );
        assert_eq!(spec.config["offset.storage.replication.factor"], "1");
        assert_eq!(spec.config["connector.client.config.override.policy"], "All");

        let resources = spec.resources.as_ref().unwrap();
        let requests = resources.requests.as_ref().unwrap();
        let limits = resources.limits.as_ref().unwrap();
        assert_eq!(requests["cpu"], Quantity("300m".to_string()));
        assert_eq!(requests["memory"], Quantity("500Mi".to_string()));
        assert_eq!(limits["cpu"], Quantity("600m".to_string()));
        assert_eq!(limits["memory"], Quantity("800Mi".to_string()));

        assert_eq!(
            connect.annotations().get(USE_CONNECTOR_RESOURCES_ANNOTATION).map(String::as_str),
            Some("true")
        );
        assert_eq!(connect.labels().get("env").map(String::as_str), Some("env-a"));
    }

    #[tokio::test]
    async fn test_secret_written_before_cluster() {
        let cache = MemoryResourceCache::new();
        let env = environment("env-a");

        configure_brokers(&env, &credentials(), &cache)
            .await
            .unwrap();

        let kinds: Vec<String> = cache.writes().into_iter().map(|(kind, _)| kind).collect();
        assert_eq!(kinds, vec!["Secret", "KafkaConnect"]);
    }

    #[tokio::test]
    async fn test_legacy_cluster_uses_scram_and_cluster_ca() {
        let cache = MemoryResourceCache::new();
        let mut env = environment("env-a");
        env.spec.kafka.enable_legacy_strimzi = true;
        env.spec.kafka.cluster.name = Some("main".to_string());

        let connect = configure_brokers(&env, &credentials(), &cache)
            .await
            .unwrap();

        assert_eq!(
            connect.spec.authentication,
            Some(KafkaConnectAuthentication::ScramSha512 {
                username: "env-a-connect".to_string(),
                password_secret: PasswordSecretSource {
                    secret_name: "env-a-connect".to_string(),
                    password: "password".to_string(),
                },
            })
        );
        assert_eq!(
            connect.spec.tls.unwrap().trusted_certificates,
            vec![CertSecretSource {
                secret_name: "main-cluster-ca-cert".to_string(),
                certificate: "ca.crt".to_string(),
            }]
        );
    }

    #[tokio::test]
    async fn test_environment_overrides() {
        let cache = MemoryResourceCache::new();
        let mut env = environment("env-a");
        env.spec.kafka.connect.replicas = 3;
        env.spec.kafka.connect.version = "3.6.0".to_string();
        env.spec.kafka.connect.image = "registry.example.com/connect:1".to_string();
        env.spec.kafka.connect.resources.limits = Some(BTreeMap::from([(
            "memory".to_string(),
            "2Gi".to_string(),
        )]));

        let connect = configure_brokers(&env, &credentials(), &cache)
            .await
            .unwrap();

        assert_eq!(connect.spec.replicas, Some(3));
        assert_eq!(connect.spec.version.as_deref(), Some("3.6.0"));
        assert_eq!(
            connect.spec.image.as_deref(),
            Some("registry.example.com/connect:1")
        );
        let resources = connect.spec.resources.unwrap();
        assert_eq!(
            resources.limits.unwrap(),
            BTreeMap::from([("memory".to_string(), Quantity("2Gi".to_string()))])
        );
        // Requests still default
        assert_eq!(
            resources.requests.unwrap()["cpu"],
            Quantity("300m".to_string())
        );
    }

    #[tokio::test]
    async fn test_cluster_of_other_environment_is_left_alone() {
        let cache = MemoryResourceCache::new();
        let mut foreign = KafkaConnect::new("env-a", KafkaConnectSpec::default());
        foreign.metadata.namespace = Some("env-a".to_string());
        foreign.metadata.labels = Some(BTreeMap::from([(
            "env".to_string(),
            "env-b".to_string(),
        )]));
        cache.insert(&foreign);

        let env = environment("env-a");
        let err = configure_brokers(&env, &credentials(), &cache)
            .await
            .unwrap_err();

        assert!(matches!(err.root(), OperatorError::EnvConflict { .. }));
        assert_eq!(
            err.to_string(),
            "failed to provision kafka connect cluster: kafka connect cluster named 'env-a' \
             found in ns 'env-a' but tied to env 'env-b'"
        );
        // Only the secret was written
        let kinds: Vec<String> = cache.writes().into_iter().map(|(kind, _)| kind).collect();
        assert_eq!(kinds, vec!["Secret"]);
        let stored: KafkaConnect = cache.get(&connect_key()).unwrap();
        assert_eq!(stored.labels().get("env").map(String::as_str), Some("env-b"));
    }

    #[tokio::test]
    async fn test_foreign_cluster_with_tls_auth_reports_conflict() {
        let cache = MemoryResourceCache::new();
        let foreign: KafkaConnect = serde_json::from_value(serde_json::json!({
            "apiVersion": "kafka.strimzi.io/v1beta2",
            "kind": "KafkaConnect",
            "metadata": {"name": "env-a", "namespace": "env-a", "labels": {"env": "env-b"}},
            "spec": {"authentication": {"type": "scram-sha-256", "username": "someone"}}
        }))
        .unwrap();
        cache.insert(&foreign);

        let env = environment("env-a");
        let err = ConnectClusterBuilder::create(&env, &credentials(), &cache)
            .await
            .unwrap()
            .verify_env_label()
            .unwrap_err();

        assert!(matches!(
            err,
            OperatorError::EnvConflict { ref cluster, ref namespace, ref env_label }
                if cluster == "env-a" && namespace == "env-a" && env_label == "env-b"
        ));
    }

    #[tokio::test]
    async fn test_existing_annotations_are_kept() {
        let cache = MemoryResourceCache::new();
        let mut existing = KafkaConnect::new("env-a", KafkaConnectSpec::default());
        existing.metadata.namespace = Some("env-a".to_string());
        existing.metadata.labels = Some(BTreeMap::from([(
            "env".to_string(),
            "env-a".to_string(),
        )]));
        existing.metadata.annotations = Some(BTreeMap::from([(
            "team".to_string(),
            "data".to_string(),
        )]));
        cache.insert(&existing);

        let env = environment("env-a");
        let connect = ConnectClusterBuilder::create(&env, &credentials(), &cache)
            .await
            .unwrap()
            .verify_env_label()
            .unwrap()
            .build_spec()
            .update_cache(&cache)
            .await
            .unwrap();

        let annotations = connect.annotations();
        assert_eq!(annotations.get("team").map(String::as_str), Some("data"));
        assert_eq!(
            annotations.get(USE_CONNECTOR_RESOURCES_ANNOTATION).map(String::as_str),
            Some("true")
        );
    }

    #[tokio::test]
    async fn test_missing_namespace_fails_secret_step() {
        let cache = MemoryResourceCache::new();
        let mut env = environment("env-a");
        env.spec.target_namespace = None;

        let err = configure_brokers(&env, &credentials(), &cache)
            .await
            .unwrap_err();
        assert!(err
            .to_string()
            .starts_with("failed to create kafka connect cluster secret"));
        assert!(cache.writes().is_empty());
    }
}
