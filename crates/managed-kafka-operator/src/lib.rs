//! # Managed Kafka Environment Operator
//!
//! Kubernetes operator that provisions shared Kafka resources for
//! multi-application environments backed by a managed Kafka service.
//!
//! Applications declare the topics they need in `KafkaApp` resources. All
//! applications of one `KafkaEnvironment` share a single managed Kafka
//! cluster, so requests for the same topic name are merged into one remote
//! topic named `{env}-{topic}`. The operator also runs one Strimzi
//! `KafkaConnect` cluster per environment.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use managed_kafka_operator::prelude::*;
//! use kube::Client;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let client = Client::try_default().await?;
//!     let clients = Arc::new(AdminClientCache::new());
//!
//!     run_controller(client, clients, AdminClientConfig::default()).await
//! }
//! ```
//!
//! ## Reconciliation
//!
//! For every environment pass:
//!
//! 1. Read the managed Kafka secret (`client.id`, `client.secret`,
//!    `hostname`, `admin.url`, `token.url`)
//! 2. Get or build the OAuth admin client for `admin.url`, shared across
//!    environments through [`client_cache::AdminClientCache`]
//! 3. Write the Connect secret, then the `KafkaConnect` cluster
//! 4. For each application topic, aggregate the requests of every app in
//!    the environment and create or patch the remote topic
//! 5. Write the application's Kafka config to `{app}-kafka-config`
//!
//! Deleting an environment deletes its remote topics whose names start with
//! `managedDeletePrefix`.
//!
//! ## Modules
//!
//! - [`crd`] - Custom Resource Definition types with validation
//! - [`conversion`] - Merge functions for topic config keys
//! - [`aggregator`] - Topic request aggregation
//! - [`admin`] - Admin REST API client and topic synchronization
//! - [`oauth`] - OAuth client-credentials HTTP client
//! - [`client_cache`] - Shared admin client cache
//! - [`credentials`] - Managed Kafka secret parsing
//! - [`connect`] - Kafka Connect cluster provisioning
//! - [`provider`] - Per-environment provisioning flow
//! - [`finalizer`] - Remote topic cleanup
//! - [`resource_cache`] - Get-or-create access to cluster resources
//! - [`controller`] - KafkaEnvironment reconciliation and controller setup
//! - [`error`] - Error types for operator operations
//!
//! ## Metrics
//!
//! The operator exposes Prometheus metrics:
//!
//! - `managed_kafka_reconciliations_total` - Total reconciliation attempts
//! - `managed_kafka_reconciliation_errors_total` - Reconciliation errors
//! - `managed_kafka_reconciliation_duration_seconds` - Reconciliation latency
//! - `managed_kafka_topics_synced_total` - Topics created or updated

pub mod admin;
pub mod aggregator;
pub mod client_cache;
pub mod connect;
pub mod controller;
pub mod conversion;
pub mod crd;
pub mod credentials;
pub mod error;
pub mod finalizer;
pub mod oauth;
pub mod provider;
pub mod resource_cache;

pub mod prelude {
    //! Re-exports for convenient usage
    pub use crate::admin::{AdminApiClient, RemoteTopicState};
    pub use crate::aggregator::{
        canonical_topic_name, AggregatedTopicSettings, TopicAggregator, TopicConfigEntry,
    };
    pub use crate::client_cache::{AdminClientCache, ClientCache};
    pub use crate::connect::{configure_brokers, create_connect_secret, ConnectClusterBuilder};
    pub use crate::controller::{run_controller, ControllerContext, ControllerMetrics};
    pub use crate::conversion::ConversionRegistry;
    pub use crate::credentials::ManagedKafkaCredentials;
    pub use crate::crd::{
        KafkaApp, KafkaAppSpec, KafkaConnect, KafkaConnectSpec, KafkaEnvironment,
        KafkaEnvironmentSpec, KafkaEnvironmentStatus, KafkaTopicSpec, TopicRequest,
    };
    pub use crate::error::{ErrorContext, OperatorError, Result};
    pub use crate::finalizer::finalize_environment_topics;
    pub use crate::oauth::{AdminClientConfig, OAuthClient};
    pub use crate::provider::{KafkaConfig, ManagedKafkaProvider};
    pub use crate::resource_cache::{KubeResourceCache, ObjectKey, ResourceCache};
}
