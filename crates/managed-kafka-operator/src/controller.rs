//! KafkaEnvironment Controller
//!
//! Watches `KafkaEnvironment` resources and the `KafkaApp` resources that
//! point at them. Each pass provisions the environment's Connect cluster,
//! converges every application's topics and writes each application's
//! Kafka configuration to a secret. Deleting an environment removes its
//! remote topics before the finalizer is released.

use crate::client_cache::AdminClientCache;
use crate::conversion::ConversionRegistry;
use crate::crd::{KafkaApp, KafkaEnvironment, KafkaEnvironmentStatus};
use crate::error::{ErrorContext, OperatorError, Result};
use crate::finalizer::finalize_environment_topics;
use crate::oauth::AdminClientConfig;
use crate::provider::{KafkaConfig, ManagedKafkaProvider};
use crate::resource_cache::{KubeResourceCache, ObjectKey, ResourceCache};
use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::finalizer::{finalizer, Error as FinalizerError, Event as FinalizerEvent};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config;
use kube::{Client, Resource, ResourceExt};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};
use validator::Validate;

/// Finalizer guarding remote topic cleanup
pub const ENV_FINALIZER: &str = "managedkafka.dev/topic-finalizer";

/// Key of the application config inside its secret
pub const APP_CONFIG_KEY: &str = "kafka.json";

/// Default requeue interval for successful reconciliations
const DEFAULT_REQUEUE_SECONDS: u64 = 300; // 5 minutes

/// Requeue interval for error cases (base for exponential backoff)
const ERROR_REQUEUE_SECONDS: u64 = 30;

/// Maximum requeue delay for error backoff
const MAX_ERROR_REQUEUE_SECONDS: u64 = 600;

/// Phase names written to the environment status
pub mod phase {
    pub const READY: &str = "Ready";
    pub const ERROR: &str = "Error";
}

/// Context passed to the controller
pub struct ControllerContext {
    /// Kubernetes client
    pub client: Client,
    /// Admin clients shared by every environment
    pub clients: Arc<AdminClientCache>,
    /// Topic config merge functions
    pub registry: ConversionRegistry,
    /// HTTP settings for admin clients
    pub admin_config: AdminClientConfig,
    /// Metrics recorder (optional)
    pub metrics: Option<ControllerMetrics>,
    /// Per-environment error retry counts for exponential backoff
    pub error_counts: Mutex<HashMap<String, u32>>,
}

impl ControllerContext {
    pub fn new(
        client: Client,
        clients: Arc<AdminClientCache>,
        admin_config: AdminClientConfig,
    ) -> Self {
        Self {
            client,
            clients,
            registry: ConversionRegistry::default(),
            admin_config,
            metrics: Some(ControllerMetrics::new()),
            error_counts: Mutex::new(HashMap::new()),
        }
    }
}

/// Metrics for the controller
#[derive(Clone)]
pub struct ControllerMetrics {
    /// Counter for reconciliation attempts
    pub reconciliations: metrics::Counter,
    /// Counter for reconciliation errors
    pub errors: metrics::Counter,
    /// Histogram for reconciliation duration
    pub duration: metrics::Histogram,
    /// Counter for topics created or updated
    pub topics_synced: metrics::Counter,
}

impl ControllerMetrics {
    /// Create new controller metrics
    pub fn new() -> Self {
        Self {
            reconciliations: metrics::counter!("managed_kafka_reconciliations_total"),
            errors: metrics::counter!("managed_kafka_reconciliation_errors_total"),
            duration: metrics::histogram!("managed_kafka_reconciliation_duration_seconds"),
            topics_synced: metrics::counter!("managed_kafka_topics_synced_total"),
        }
    }
}

impl Default for ControllerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Start the KafkaEnvironment controller
pub async fn run_controller(
    client: Client,
    clients: Arc<AdminClientCache>,
    admin_config: AdminClientConfig,
) -> Result<()> {
    let envs: Api<KafkaEnvironment> = Api::all(client.clone());
    let apps: Api<KafkaApp> = Api::all(client.clone());

    let ctx = Arc::new(ControllerContext::new(client, clients, admin_config));

    info!("Starting KafkaEnvironment controller");

    Controller::new(envs, Config::default())
        .watches(apps, Config::default(), env_ref_for_app)
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, action)) => {
                    debug!(name = obj.name, ?action, "Reconciliation completed");
                }
                Err(e) => {
                    error!(error = %e, "Reconciliation failed");
                }
            }
        })
        .await;

    Ok(())
}

/// Environment to reconcile when `app` changes
fn env_ref_for_app(app: KafkaApp) -> Option<ObjectRef<KafkaEnvironment>> {
    if app.spec.env_name.is_empty() {
        None
    } else {
        Some(ObjectRef::new(&app.spec.env_name))
    }
}

/// Main reconciliation function
#[instrument(skip(env, ctx), fields(name = %env.name_any()))]
async fn reconcile(env: Arc<KafkaEnvironment>, ctx: Arc<ControllerContext>) -> Result<Action> {
    let start = std::time::Instant::now();

    if let Some(ref metrics) = ctx.metrics {
        metrics.reconciliations.increment(1);
    }

    let env_name = env.name_any();
    let envs: Api<KafkaEnvironment> = Api::all(ctx.client.clone());

    let result = finalizer(&envs, ENV_FINALIZER, env, |event| async {
        match event {
            FinalizerEvent::Apply(env) => apply_environment(env, ctx.clone()).await,
            FinalizerEvent::Cleanup(env) => cleanup_environment(env, ctx.clone()).await,
        }
    })
    .await;

    if let Some(ref metrics) = ctx.metrics {
        metrics.duration.record(start.elapsed().as_secs_f64());
    }

    if result.is_ok() {
        reset_backoff(&ctx.error_counts, &env_name);
    }

    result.map_err(|e| {
        if let Some(ref metrics) = ctx.metrics {
            metrics.errors.increment(1);
        }
        unwrap_finalizer_error(e)
    })
}

/// Keep the provisioning error intact so the error policy can classify it
fn unwrap_finalizer_error(error: FinalizerError<OperatorError>) -> OperatorError {
    match error {
        FinalizerError::ApplyFailed(e) | FinalizerError::CleanupFailed(e) => e,
        other => OperatorError::ReconcileFailed(other.to_string()),
    }
}

/// Provision the environment and every application in it
#[instrument(skip(env, ctx))]
async fn apply_environment(
    env: Arc<KafkaEnvironment>,
    ctx: Arc<ControllerContext>,
) -> Result<Action> {
    let name = env.name_any();

    info!(name = %name, "Reconciling KafkaEnvironment");

    // Validate the environment spec before reconciliation
    if let Err(errors) = env.spec.validate() {
        let error_msg = errors.to_string();
        warn!(name = %name, errors = %error_msg, "Environment spec validation failed");
        update_status(&ctx.client, &name, build_error_status(&env, &error_msg)).await?;
        return Err(OperatorError::InvalidConfig(error_msg));
    }

    match provision_environment(&env, &ctx).await {
        Ok(status) => {
            update_status(&ctx.client, &name, status).await?;
            info!(name = %name, "Reconciliation complete");
            Ok(Action::requeue(Duration::from_secs(
                DEFAULT_REQUEUE_SECONDS,
            )))
        }
        Err(e) => {
            warn!(name = %name, error = %e, "Environment provisioning failed");
            update_status(&ctx.client, &name, build_error_status(&env, &e.to_string())).await?;
            Err(e)
        }
    }
}

async fn provision_environment(
    env: &KafkaEnvironment,
    ctx: &ControllerContext,
) -> Result<KafkaEnvironmentStatus> {
    let env_name = env.name_any();
    let secret_data = read_managed_secret(&ctx.client, env).await?;
    let cache = KubeResourceCache::new(ctx.client.clone());

    let provider = ManagedKafkaProvider::new(
        env,
        &secret_data,
        &ctx.clients,
        &cache,
        &ctx.registry,
        &ctx.admin_config,
    )
    .await?;

    let all_apps: Api<KafkaApp> = Api::all(ctx.client.clone());
    let listed = all_apps
        .list(&ListParams::default())
        .await
        .map_err(OperatorError::from)
        .context("failed to list applications")?;
    let apps = apps_in_env(listed.items, &env_name);

    let mut managed_topics = BTreeSet::new();
    for app in apps.iter().filter(|app| is_provisionable(app)) {
        let Some(config) = provider.provide(app, &apps).await? else {
            continue;
        };

        if let Some(ref metrics) = ctx.metrics {
            metrics.topics_synced.increment(config.topics.len() as u64);
        }
        managed_topics.extend(config.topics.iter().map(|t| t.name.clone()));

        let secret = app_config_secret(app, &config)?;
        cache
            .update(&secret)
            .await
            .with_context(|| format!("failed to write kafka config for app {}", app.name_any()))?;
    }

    let connect = ObjectKey::new(
        provider.connect_cluster().namespace().unwrap_or_default(),
        provider.connect_cluster().name_any(),
    );
    Ok(build_ready_status(env, managed_topics, &connect))
}

/// Remove remote topics before the environment goes away
#[instrument(skip(env, ctx))]
async fn cleanup_environment(
    env: Arc<KafkaEnvironment>,
    ctx: Arc<ControllerContext>,
) -> Result<Action> {
    let name = env.name_any();

    info!(name = %name, "Cleaning up KafkaEnvironment");

    // Connect cluster and secrets carry owner references and are
    // garbage-collected by Kubernetes.
    if env.spec.kafka.managed_delete_prefix.is_empty() {
        info!(name = %name, "No managed delete prefix, remote topics will remain");
        reset_backoff(&ctx.error_counts, &name);
        return Ok(Action::await_change());
    }

    let secret_data = read_managed_secret(&ctx.client, &env).await?;
    let deleted =
        finalize_environment_topics(&env, &secret_data, &ctx.clients, &ctx.admin_config).await?;

    info!(name = %name, deleted = deleted.len(), "Cleanup complete");

    // No further pass will run for this environment once the finalizer is gone
    reset_backoff(&ctx.error_counts, &name);

    Ok(Action::await_change())
}

/// Raw payload of the environment's managed Kafka secret
async fn read_managed_secret(
    client: &Client,
    env: &KafkaEnvironment,
) -> Result<BTreeMap<String, Vec<u8>>> {
    let secret_ref = &env.spec.kafka.managed_secret_ref;
    let secrets: Api<Secret> = Api::namespaced(client.clone(), &secret_ref.namespace);

    let secret = secrets
        .get(&secret_ref.name)
        .await
        .map_err(OperatorError::from)
        .with_context(|| {
            format!(
                "failed to read managed kafka secret {}/{}",
                secret_ref.namespace, secret_ref.name
            )
        })?;

    Ok(secret
        .data
        .unwrap_or_default()
        .into_iter()
        .map(|(k, v)| (k, v.0))
        .collect())
}

/// Apps that belong to `env_name`, in a stable order.
///
/// Invalid apps are kept: their valid requests still count towards the
/// settings of topics they share with other apps.
fn apps_in_env(apps: Vec<KafkaApp>, env_name: &str) -> Vec<KafkaApp> {
    let mut apps: Vec<KafkaApp> = apps
        .into_iter()
        .filter(|app| app.spec.env_name == env_name)
        .collect();
    apps.sort_by_key(|app| (app.namespace(), app.name_any()));
    apps
}

/// Whether `app` gets its own topics and config secret this pass
fn is_provisionable(app: &KafkaApp) -> bool {
    match app.spec.validate() {
        Ok(()) => true,
        Err(errors) => {
            warn!(
                app = %app.name_any(),
                namespace = ?app.namespace(),
                errors = %errors,
                "Skipping provisioning of invalid KafkaApp"
            );
            false
        }
    }
}

/// Secret `{app}-kafka-config` carrying the app's Kafka settings
fn app_config_secret(app: &KafkaApp, config: &KafkaConfig) -> Result<Secret> {
    let name = format!("{}-kafka-config", app.name_any());
    let namespace = app.namespace().ok_or_else(|| {
        OperatorError::InvalidConfig(format!("KafkaApp {} has no namespace", app.name_any()))
    })?;
    let owner = app.controller_owner_ref(&()).ok_or_else(|| {
        OperatorError::InvalidConfig(format!(
            "cannot build owner reference for KafkaApp {}",
            app.name_any()
        ))
    })?;

    let mut secret = Secret::default();
    secret.metadata.name = Some(name);
    secret.metadata.namespace = Some(namespace);
    secret.metadata.owner_references = Some(vec![owner]);
    secret.metadata.labels = Some(BTreeMap::from([(
        "app".to_string(),
        app.name_any(),
    )]));
    secret.string_data = Some(BTreeMap::from([(
        APP_CONFIG_KEY.to_string(),
        serde_json::to_string(config)?,
    )]));
    Ok(secret)
}

fn build_ready_status(
    env: &KafkaEnvironment,
    managed_topics: BTreeSet<String>,
    connect: &ObjectKey,
) -> KafkaEnvironmentStatus {
    let managed_topics: Vec<String> = managed_topics.into_iter().collect();
    KafkaEnvironmentStatus {
        phase: phase::READY.to_string(),
        message: format!("{} topics provisioned", managed_topics.len()),
        observed_generation: env.metadata.generation.unwrap_or(0),
        managed_topic_count: managed_topics.len() as i32,
        managed_topics,
        connect_cluster: Some(connect.to_string()),
        last_sync_time: Some(Utc::now().to_rfc3339()),
    }
}

/// Error status that keeps what the last good pass recorded
fn build_error_status(env: &KafkaEnvironment, error_msg: &str) -> KafkaEnvironmentStatus {
    let existing = env.status.clone().unwrap_or_default();
    KafkaEnvironmentStatus {
        phase: phase::ERROR.to_string(),
        message: error_msg.to_string(),
        observed_generation: env.metadata.generation.unwrap_or(0),
        last_sync_time: Some(Utc::now().to_rfc3339()),
        ..existing
    }
}

/// Update the environment status subresource
async fn update_status(client: &Client, name: &str, status: KafkaEnvironmentStatus) -> Result<()> {
    let api: Api<KafkaEnvironment> = Api::all(client.clone());

    debug!(name = %name, phase = %status.phase, "Updating environment status");

    let patch = serde_json::json!({
        "status": status
    });

    let patch_params = PatchParams::default();
    api.patch_status(name, &patch_params, &Patch::Merge(&patch))
        .await
        .map_err(OperatorError::from)?;

    Ok(())
}

/// Error policy for the controller with exponential backoff
fn error_policy(
    env: Arc<KafkaEnvironment>,
    error: &OperatorError,
    ctx: Arc<ControllerContext>,
) -> Action {
    let key = env.name_any();
    let retries = record_failure(&ctx.error_counts, &key);

    let delay = backoff_delay(error, retries);

    warn!(
        error = %error,
        retry = retries,
        delay_secs = delay.as_secs(),
        "Reconciliation error for '{}', will retry",
        key
    );

    Action::requeue(delay)
}

/// Bump and return the consecutive failure count of `key`
fn record_failure(counts: &Mutex<HashMap<String, u32>>, key: &str) -> u32 {
    let mut counts = counts.lock();
    let entry = counts.entry(key.to_string()).or_insert(0);
    *entry = entry.saturating_add(1);
    *entry
}

fn reset_backoff(counts: &Mutex<HashMap<String, u32>>, key: &str) {
    counts.lock().remove(key);
}

/// The error's suggested delay, or 30s → 60s → 120s → 240s → 480s → 600s (capped)
fn backoff_delay(error: &OperatorError, retries: u32) -> Duration {
    error.requeue_delay().unwrap_or_else(|| {
        let base = Duration::from_secs(ERROR_REQUEUE_SECONDS);
        let backoff = base * 2u32.saturating_pow(retries.saturating_sub(1).min(5));
        backoff.min(Duration::from_secs(MAX_ERROR_REQUEUE_SECONDS))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::TopicAggregator;
    use crate::crd::test_fixtures::{app, environment, topic};
    use crate::provider::{BrokerAuthType, BrokerConfig, TopicConfig};

    fn kafka_config() -> KafkaConfig {
        KafkaConfig {
            brokers: vec![BrokerConfig {
                hostname: "kafka.example.com".to_string(),
                port: Some(443),
                authtype: Some(BrokerAuthType::Sasl),
                sasl: None,
            }],
            topics: vec![TopicConfig {
                name: "env-a-orders".to_string(),
                requested_name: "orders".to_string(),
            }],
        }
    }

    #[test]
    fn test_app_maps_to_its_environment() {
        let orders = app("orders-service", "env-a", vec![]);
        let target = env_ref_for_app(orders).unwrap();
        assert_eq!(target.name, "env-a");
        assert!(target.namespace.is_none());

        let mut orphan = app("orphan", "env-a", vec![]);
        orphan.spec.env_name = String::new();
        assert!(env_ref_for_app(orphan).is_none());
    }

    #[test]
    fn test_apps_in_env_filters_and_sorts() {
        let apps = vec![
            app("zeta", "env-a", vec![topic("orders", 1, 1, &[])]),
            app("other", "env-b", vec![topic("orders", 1, 1, &[])]),
            app("alpha", "env-a", vec![topic("orders", 1, 1, &[])]),
        ];

        let names: Vec<String> = apps_in_env(apps, "env-a")
            .iter()
            .map(|a| a.name_any())
            .collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }

    #[test]
    fn test_invalid_app_still_counts_towards_shared_topics() {
        let registry = ConversionRegistry::default();
        let apps = vec![
            app(
                "a",
                "env-a",
                vec![topic("orders", 8, 5, &[]), topic("bad topic", 1, 1, &[])],
            ),
            app("b", "env-a", vec![topic("orders", 1, 1, &[])]),
        ];

        let apps = apps_in_env(apps, "env-a");
        assert_eq!(apps.len(), 2);

        let provisioned: Vec<String> = apps
            .iter()
            .filter(|app| is_provisionable(app))
            .map(|app| app.name_any())
            .collect();
        assert_eq!(provisioned, vec!["b"]);

        let settings = TopicAggregator::new(&registry, 10)
            .aggregate_for_apps("orders", &apps)
            .unwrap();
        assert_eq!(settings.num_partitions, 8);
        assert_eq!(settings.num_replicas, 5);
    }

    #[test]
    fn test_app_config_secret() {
        let orders = app("orders-service", "env-a", vec![]);
        let secret = app_config_secret(&orders, &kafka_config()).unwrap();

        assert_eq!(
            secret.metadata.name.as_deref(),
            Some("orders-service-kafka-config")
        );
        assert_eq!(secret.metadata.namespace.as_deref(), Some("env-a"));
        let owners = secret.metadata.owner_references.unwrap();
        assert_eq!(owners[0].kind, "KafkaApp");
        assert_eq!(owners[0].name, "orders-service");

        let data = secret.string_data.unwrap();
        let parsed: KafkaConfig = serde_json::from_str(&data[APP_CONFIG_KEY]).unwrap();
        assert_eq!(parsed, kafka_config());
    }

    #[test]
    fn test_build_ready_status() {
        let env = environment("env-a");
        let topics = BTreeSet::from(["env-a-orders".to_string(), "env-a-audit".to_string()]);
        let status = build_ready_status(&env, topics, &ObjectKey::new("env-a", "env-a"));

        assert_eq!(status.phase, "Ready");
        assert_eq!(status.managed_topic_count, 2);
        assert_eq!(status.managed_topics, vec!["env-a-audit", "env-a-orders"]);
        assert_eq!(status.connect_cluster.as_deref(), Some("env-a/env-a"));
        assert_eq!(status.observed_generation, 1);
        assert!(status.last_sync_time.is_some());
    }

    #[test]
    fn test_build_error_status_keeps_previous_topics() {
        let mut env = environment("env-a");
        env.status = Some(KafkaEnvironmentStatus {
            phase: "Ready".to_string(),
            managed_topics: vec!["env-a-orders".to_string()],
            managed_topic_count: 1,
            ..Default::default()
        });

        let status = build_error_status(&env, "failed to provision topic env-a-orders: boom");

        assert_eq!(status.phase, "Error");
        assert_eq!(status.message, "failed to provision topic env-a-orders: boom");
        assert_eq!(status.managed_topics, vec!["env-a-orders"]);
        assert_eq!(status.managed_topic_count, 1);
    }

    #[test]
    fn test_backoff_for_permanent_errors() {
        let err = OperatorError::InvalidConfig("bad".to_string());
        assert_eq!(backoff_delay(&err, 1), Duration::from_secs(30));
        assert_eq!(backoff_delay(&err, 2), Duration::from_secs(60));
        assert_eq!(backoff_delay(&err, 5), Duration::from_secs(480));
        assert_eq!(backoff_delay(&err, 10), Duration::from_secs(600));
    }

    #[test]
    fn test_retryable_errors_use_fixed_delay() {
        let err = OperatorError::AdminApi {
            operation: "creating",
            status: 503,
            body: String::new(),
        }
        .context("failed to provision topic env-a-orders");
        assert_eq!(backoff_delay(&err, 6), Duration::from_secs(30));
    }

    #[test]
    fn test_failure_counts_reset_per_environment() {
        let counts = Mutex::new(HashMap::new());
        assert_eq!(record_failure(&counts, "env-a"), 1);
        assert_eq!(record_failure(&counts, "env-a"), 2);
        assert_eq!(record_failure(&counts, "env-b"), 1);

        reset_backoff(&counts, "env-a");
        assert!(!counts.lock().contains_key("env-a"));
        assert_eq!(counts.lock().get("env-b"), Some(&1));
        assert_eq!(record_failure(&counts, "env-a"), 1);
    }

    #[test]
    fn test_finalizer_errors_keep_source() {
        let err = unwrap_finalizer_error(FinalizerError::ApplyFailed(
            OperatorError::InvalidSecret("missing field 'hostname'".to_string()),
        ));
        assert!(matches!(err, OperatorError::InvalidSecret(_)));
    }
}
