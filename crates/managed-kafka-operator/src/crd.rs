//! Custom Resource Definitions for the managed Kafka operator
//!
//! `KafkaEnvironment` groups applications that share one managed Kafka
//! cluster and one Kafka Connect cluster. `KafkaApp` declares the topics an
//! application needs. `KafkaConnect` is the Strimzi resource the operator
//! writes for the environment; its schema is owned by Strimzi, so only the
//! fields this operator sets are modelled.

use crate::error::{OperatorError, Result};
use k8s_openapi::api::core::v1::ResourceRequirements;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{CustomResource, Resource, ResourceExt};
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::LazyLock;
use validator::{Validate, ValidationError};

/// Regex for validating Kubernetes resource quantities (e.g., "500Mi", "300m")
static QUANTITY_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9]+(\.[0-9]+)?(m|Ki|Mi|Gi|Ti|Pi|Ei|k|M|G|T|P|E)?$").unwrap()
});

/// Regex for validating Kubernetes names (RFC 1123 label)
static NAME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").unwrap());

/// Legal characters of a Kafka topic name
static TOPIC_NAME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9._-]+$").unwrap());

/// Validate a Kubernetes name (RFC 1123 label)
fn validate_k8s_name(value: &str) -> std::result::Result<(), ValidationError> {
    if value.is_empty() {
        return Ok(()); // Empty is allowed for optional fields
    }
    if value.len() > 63 {
        return Err(
            ValidationError::new("name_too_long").with_message("name exceeds 63 characters".into())
        );
    }
    if !NAME_REGEX.is_match(value) {
        return Err(ValidationError::new("invalid_name").with_message(
            format!("'{}' is not a valid Kubernetes name (RFC 1123)", value).into(),
        ));
    }
    Ok(())
}

/// Validate a Kafka topic name as requested by an application
fn validate_topic_name(value: &str) -> std::result::Result<(), ValidationError> {
    // Leave room for the environment prefix within Kafka's 249 char limit
    if value.is_empty() || value.len() > 200 {
        return Err(ValidationError::new("invalid_topic_name_length")
            .with_message("topic name must be 1-200 characters".into()));
    }
    if !TOPIC_NAME_REGEX.is_match(value) {
        return Err(ValidationError::new("invalid_topic_name").with_message(
            format!("'{}' contains characters not allowed in topic names", value).into(),
        ));
    }
    Ok(())
}

/// Validate a map of resource name to quantity
fn validate_quantities(
    quantities: &BTreeMap<String, String>,
) -> std::result::Result<(), ValidationError> {
    for (resource, value) in quantities {
        if !QUANTITY_REGEX.is_match(value) {
            return Err(ValidationError::new("invalid_quantity").with_message(
                format!("'{}' is not a valid quantity for {}", value, resource).into(),
            ));
        }
    }
    Ok(())
}

// ============================================================================
// KafkaEnvironment
// ============================================================================

/// KafkaEnvironment custom resource
///
/// # Example
///
/// ```yaml
/// apiVersion: managedkafka.dev/v1alpha1
/// kind: KafkaEnvironment
/// metadata:
///   name: env-a
/// spec:
///   targetNamespace: env-a
///   kafka:
///     managedSecretRef:
///       name: managed-kafka
///       namespace: kafka-secrets
///     managedDeletePrefix: env-a
///     cluster:
///       replicas: 2
///     connect:
///       replicas: 2
/// ```
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, Validate)]
#[kube(
    group = "managedkafka.dev",
    version = "v1alpha1",
    kind = "KafkaEnvironment",
    plural = "kafkaenvironments",
    shortname = "kenv",
    status = "KafkaEnvironmentStatus",
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Topics", "type":"integer", "jsonPath":".status.managedTopicCount"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct KafkaEnvironmentSpec {
    /// Namespace that holds the environment's shared resources
    #[serde(default)]
    #[validate(custom(function = "validate_k8s_name"))]
    pub target_namespace: Option<String>,

    /// Managed Kafka provider settings
    #[validate(nested)]
    pub kafka: ManagedKafkaConfig,
}

/// Managed Kafka provider settings for an environment
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ManagedKafkaConfig {
    /// Secret holding `client.id`, `client.secret`, `hostname`, `admin.url`, `token.url`
    #[validate(nested)]
    pub managed_secret_ref: SecretReference,

    /// Topics with this prefix are deleted when the environment is removed.
    /// Empty disables topic cleanup.
    #[serde(default)]
    pub managed_delete_prefix: String,

    /// Authenticate Connect with SCRAM against the cluster CA instead of OAuth
    #[serde(default)]
    pub enable_legacy_strimzi: bool,

    /// Kafka cluster settings
    #[serde(default)]
    pub cluster: KafkaClusterConfig,

    /// Kafka Connect cluster settings
    #[serde(default)]
    #[validate(nested)]
    pub connect: KafkaConnectClusterConfig,
}

/// Reference to a secret in a specific namespace
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, Validate, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SecretReference {
    #[validate(length(min = 1, max = 253, message = "secret name must be 1-253 characters"))]
    pub name: String,

    #[validate(custom(function = "validate_k8s_name"))]
    pub namespace: String,
}

/// Kafka cluster settings
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KafkaClusterConfig {
    /// Cluster name used for the CA certificate secret (defaults to the environment name)
    #[serde(default)]
    pub name: Option<String>,

    /// Upper bound for topic replicas. Values below 1 mean single-replica topics.
    #[serde(default)]
    pub replicas: i32,
}

/// Kafka Connect cluster settings
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct KafkaConnectClusterConfig {
    /// Connect cluster name (defaults to the environment name)
    #[serde(default)]
    #[validate(custom(function = "validate_k8s_name"))]
    pub name: Option<String>,

    /// Namespace for the Connect cluster (defaults to the target namespace)
    #[serde(default)]
    #[validate(custom(function = "validate_k8s_name"))]
    pub namespace: Option<String>,

    /// Connect worker replicas; values below 1 mean 1
    #[serde(default)]
    pub replicas: i32,

    /// Kafka version of the Connect workers (empty uses the default)
    #[serde(default)]
    pub version: String,

    /// Connect worker image (empty uses the default)
    #[serde(default)]
    pub image: String,

    /// Resource overrides for the Connect workers
    #[serde(default)]
    #[validate(nested)]
    pub resources: ConnectResources,
}

/// Resource requests and limits for Connect workers
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ConnectResources {
    #[serde(default)]
    #[validate(custom(function = "validate_quantities"))]
    pub requests: Option<BTreeMap<String, String>>,

    #[serde(default)]
    #[validate(custom(function = "validate_quantities"))]
    pub limits: Option<BTreeMap<String, String>>,
}

/// Status of a KafkaEnvironment
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KafkaEnvironmentStatus {
    /// Ready, Error or Terminating
    #[serde(default)]
    pub phase: String,

    #[serde(default)]
    pub message: String,

    #[serde(default)]
    pub observed_generation: i64,

    /// Canonical names of topics provisioned on the last pass
    #[serde(default)]
    pub managed_topics: Vec<String>,

    #[serde(default)]
    pub managed_topic_count: i32,

    /// `namespace/name` of the Connect cluster
    #[serde(default)]
    pub connect_cluster: Option<String>,

    #[serde(default)]
    pub last_sync_time: Option<String>,
}

impl KafkaEnvironment {
    /// Namespace of the Connect cluster and its secret
    pub fn connect_namespace(&self) -> Result<String> {
        self.spec
            .kafka
            .connect
            .namespace
            .clone()
            .filter(|ns| !ns.is_empty())
            .or_else(|| {
                self.spec
                    .target_namespace
                    .clone()
                    .filter(|ns| !ns.is_empty())
            })
            .ok_or_else(|| {
                OperatorError::InvalidConfig(format!(
                    "environment '{}' has neither a connect namespace nor a target namespace",
                    self.name_any()
                ))
            })
    }

    /// Name of the Connect cluster resource
    pub fn connect_cluster_name(&self) -> String {
        match self.spec.kafka.connect.name.as_deref() {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => self.name_any(),
        }
    }

    /// Name of the Connect OAuth client secret
    pub fn connect_secret_name(&self) -> String {
        format!("{}-connect", self.connect_cluster_name())
    }

    /// Name of the Kafka cluster whose CA the legacy mode trusts
    pub fn kafka_cluster_name(&self) -> String {
        match self.spec.kafka.cluster.name.as_deref() {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => self.name_any(),
        }
    }

    /// SCRAM user of the Connect cluster in legacy mode
    pub fn connect_user_name(&self) -> String {
        format!("{}-connect", self.name_any())
    }

    /// Replica cap applied to every topic of the environment
    pub fn cluster_replica_cap(&self) -> i32 {
        self.spec.kafka.cluster.replicas
    }

    /// Controller owner reference pointing at this environment
    pub fn owner_reference(&self) -> Result<OwnerReference> {
        self.controller_owner_ref(&()).ok_or_else(|| {
            OperatorError::InvalidConfig(format!(
                "cannot build owner reference for environment '{}'",
                self.name_any()
            ))
        })
    }
}

// ============================================================================
// KafkaApp
// ============================================================================

/// KafkaApp custom resource: an application's topic declarations
///
/// # Example
///
/// ```yaml
/// apiVersion: managedkafka.dev/v1alpha1
/// kind: KafkaApp
/// metadata:
///   name: orders-service
///   namespace: env-a
/// spec:
///   envName: env-a
///   kafkaTopics:
///     - topicName: orders
///       partitions: 3
///       replicas: 3
///       config:
///         retention.ms: "86400000"
/// ```
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, Validate)]
#[kube(
    group = "managedkafka.dev",
    version = "v1alpha1",
    kind = "KafkaApp",
    plural = "kafkaapps",
    shortname = "kapp",
    namespaced,
    printcolumn = r#"{"name":"Env", "type":"string", "jsonPath":".spec.envName"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct KafkaAppSpec {
    /// Environment this application belongs to
    #[validate(length(min = 1, message = "envName is required"))]
    #[validate(custom(function = "validate_k8s_name"))]
    pub env_name: String,

    /// Topics this application needs
    #[serde(default)]
    #[validate(length(max = 200, message = "maximum 200 topics per application"))]
    #[validate(nested)]
    pub kafka_topics: Vec<KafkaTopicSpec>,
}

/// A single application's request for a topic
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, Validate, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct KafkaTopicSpec {
    /// Topic name without the environment prefix
    #[validate(custom(function = "validate_topic_name"))]
    pub topic_name: String,

    /// Requested partitions (0 means no preference)
    #[serde(default)]
    pub partitions: u32,

    /// Requested replicas (0 means no preference)
    #[serde(default)]
    pub replicas: u32,

    /// Topic config overrides, e.g. `retention.ms`
    #[serde(default)]
    pub config: BTreeMap<String, String>,
}

/// What the aggregator consumes from each application
pub type TopicRequest = KafkaTopicSpec;

// ============================================================================
// Strimzi KafkaConnect
// ============================================================================

/// Subset of the Strimzi `KafkaConnect` spec written by this operator
#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[kube(
    group = "kafka.strimzi.io",
    version = "v1beta2",
    kind = "KafkaConnect",
    plural = "kafkaconnects",
    namespaced,
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct KafkaConnectSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    #[serde(default)]
    pub bootstrap_servers: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authentication: Option<KafkaConnectAuthentication>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<KafkaConnectTls>,
}

/// Authentication of the Connect workers against Kafka
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "type")]
pub enum KafkaConnectAuthentication {
    #[serde(rename = "oauth", rename_all = "camelCase")]
    Oauth {
        client_id: String,
        client_secret: GenericSecretSource,
        token_endpoint_uri: String,
    },
    #[serde(rename = "scram-sha-512", rename_all = "camelCase")]
    ScramSha512 {
        username: String,
        password_secret: PasswordSecretSource,
    },
    /// Any type this operator does not write (`tls`, `plain`, ...). Only
    /// ever read back from an existing cluster and replaced on build.
    #[serde(other)]
    Unsupported,
}

impl KafkaConnectAuthentication {
    /// Strimzi authentication type string
    pub fn auth_type(&self) -> &'static str {
        match self {
            KafkaConnectAuthentication::Oauth { .. } => "oauth",
            KafkaConnectAuthentication::ScramSha512 { .. } => "scram-sha-512",
            KafkaConnectAuthentication::Unsupported => "unsupported",
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GenericSecretSource {
    pub secret_name: String,
    pub key: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PasswordSecretSource {
    pub secret_name: String,
    pub password: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct KafkaConnectTls {
    #[serde(default)]
    pub trusted_certificates: Vec<CertSecretSource>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CertSecretSource {
    pub secret_name: String,
    #[serde(default)]
    pub certificate: String,
}
