//! Topic aggregation
//!
//! Applications in one environment declare topic requirements independently.
//! Requests for the same topic name land on one remote topic, so their
//! settings are merged here into a single [`AggregatedTopicSettings`]. The
//! merge is recomputed from the full application list on every pass.

use crate::conversion::ConversionRegistry;
use crate::crd::{KafkaApp, TopicRequest};
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Partitions or replicas used when every request leaves the count unset
pub const DEFAULT_TOPIC_COUNT: i32 = 3;

/// Settings pushed to the admin API for one topic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedTopicSettings {
    pub num_partitions: i32,
    pub num_replicas: i32,
    pub config: Vec<TopicConfigEntry>,
}

/// One topic config key/value pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicConfigEntry {
    pub key: String,
    pub value: String,
}

/// Name of the remote topic backing `requested` in environment `env_name`
pub fn canonical_topic_name(env_name: &str, requested: &str) -> String {
    format!("{}-{}", env_name, requested)
}

/// Merges topic requests of every application in an environment
#[derive(Debug, Clone, Copy)]
pub struct TopicAggregator<'a> {
    registry: &'a ConversionRegistry,
    replica_cap: i32,
}

impl<'a> TopicAggregator<'a> {
    /// `replica_cap` is the environment's cluster replica count; below 1
    /// every topic is forced to a single replica.
    pub fn new(registry: &'a ConversionRegistry, replica_cap: i32) -> Self {
        Self {
            registry,
            replica_cap,
        }
    }

    /// Aggregate the requests for `topic_name` across `apps`
    pub fn aggregate_for_apps(
        &self,
        topic_name: &str,
        apps: &[KafkaApp],
    ) -> Result<AggregatedTopicSettings> {
        let requests = apps
            .iter()
            .flat_map(|app| app.spec.kafka_topics.iter())
            .filter(|request| request.topic_name == topic_name);

        self.aggregate(requests)
    }

    /// Aggregate an already filtered set of requests for one topic
    pub fn aggregate<'r, I>(&self, requests: I) -> Result<AggregatedTopicSettings>
    where
        I: IntoIterator<Item = &'r TopicRequest>,
    {
        let mut values: BTreeMap<&str, Vec<String>> = BTreeMap::new();
        let mut replicas: Vec<i64> = Vec::new();
        let mut partitions: Vec<i64> = Vec::new();

        for request in requests {
            replicas.push(i64::from(request.replicas));
            partitions.push(i64::from(request.partitions));
            for (key, value) in &request.config {
                values.entry(key.as_str()).or_default().push(value.clone());
            }
        }

        let config = values
            .into_iter()
            .map(|(key, vals)| {
                let value = self.registry.convert(key, &vals)?;
                Ok(TopicConfigEntry {
                    key: key.to_string(),
                    value,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let num_partitions = max_or_default(&partitions);
        let num_replicas = self.clamp_replicas(max_or_default(&replicas));

        debug!(
            requests = partitions.len(),
            num_partitions,
            num_replicas,
            config_keys = config.len(),
            "Aggregated topic settings"
        );

        Ok(AggregatedTopicSettings {
            num_partitions,
            num_replicas,
            config,
        })
    }

    fn clamp_replicas(&self, replicas: i32) -> i32 {
        if self.replica_cap < 1 {
            1
        } else {
            replicas.min(self.replica_cap)
        }
    }
}

/// Largest requested count, or the default when none is positive.
///
/// With no requests at all the count stays 0; see DESIGN.md.
fn max_or_default(counts: &[i64]) -> i32 {
    match counts.iter().max() {
        None => 0,
        Some(&max) if max < 1 => DEFAULT_TOPIC_COUNT,
        Some(&max) => i32::try_from(max).unwrap_or(i32::MAX),
    }
}
