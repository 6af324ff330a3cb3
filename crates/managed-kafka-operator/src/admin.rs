//! Admin REST API client and topic synchronization
//!
//! Remote topics are converged by probing for the topic and then either
//! creating it or patching it with the freshly aggregated settings. Prior
//! remote settings are never read back. Failures are returned to the caller
//! immediately; retrying is the reconcile loop's job.

use crate::aggregator::AggregatedTopicSettings;
use crate::error::{OperatorError, Result};
use crate::oauth::OAuthClient;
use reqwest::{Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

/// Page size used when listing topics
pub const TOPIC_LIST_PAGE_SIZE: u32 = 1000;

/// Outcome of probing the admin API for a topic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteTopicState {
    Absent,
    Present,
}

/// Body of the create call
#[derive(Debug, Serialize)]
struct CreateTopicRequest<'a> {
    name: &'a str,
    settings: &'a AggregatedTopicSettings,
}

#[derive(Debug, Deserialize)]
struct TopicList {
    #[serde(default)]
    items: Vec<TopicListItem>,
}

#[derive(Debug, Deserialize)]
struct TopicListItem {
    name: String,
}

/// Client for one admin endpoint
#[derive(Debug, Clone)]
pub struct AdminApiClient {
    admin_url: String,
    http: Arc<OAuthClient>,
}

impl AdminApiClient {
    pub fn new(admin_url: impl Into<String>, http: Arc<OAuthClient>) -> Self {
        Self {
            admin_url: admin_url.into().trim_end_matches('/').to_string(),
            http,
        }
    }

    fn topics_url(&self) -> String {
        format!("{}/api/v1/topics", self.admin_url)
    }

    fn topic_url(&self, name: &str) -> String {
        format!("{}/api/v1/topics/{}", self.admin_url, name)
    }

    /// Check whether `name` exists remotely
    pub async fn probe_topic(&self, name: &str) -> Result<RemoteTopicState> {
        let response = self
            .http
            .send(self.http.http().get(self.topic_url(name)))
            .await?;
        let (status, _) = drain(response).await?;

        debug!(topic = %name, status = status.as_u16(), "Probed remote topic");

        if status == StatusCode::NOT_FOUND {
            Ok(RemoteTopicState::Absent)
        } else {
            Ok(RemoteTopicState::Present)
        }
    }

    /// Create `name` with `settings`
    pub async fn create_topic(&self, name: &str, settings: &AggregatedTopicSettings) -> Result<()> {
        let body = CreateTopicRequest { name, settings };
        let response = self
            .http
            .send(self.http.http().post(self.topics_url()).json(&body))
            .await?;
        expect_status(response, "creating", &[StatusCode::OK, StatusCode::CREATED]).await?;

        info!(topic = %name, partitions = settings.num_partitions, replicas = settings.num_replicas, "Created topic");
        Ok(())
    }

    /// Overwrite the settings of existing topic `name`
    pub async fn patch_topic(&self, name: &str, settings: &AggregatedTopicSettings) -> Result<()> {
        let response = self
            .http
            .send(self.http.http().patch(self.topic_url(name)).json(settings))
            .await?;
        expect_status(response, "updating", &[StatusCode::OK, StatusCode::CREATED]).await?;

        info!(topic = %name, partitions = settings.num_partitions, replicas = settings.num_replicas, "Updated topic");
        Ok(())
    }

    /// Converge remote topic `name` to `settings`
    pub async fn sync_topic(
        &self,
        name: &str,
        settings: &AggregatedTopicSettings,
    ) -> Result<RemoteTopicState> {
        let state = self.probe_topic(name).await?;
        match state {
            RemoteTopicState::Absent => self.create_topic(name, settings).await?,
            RemoteTopicState::Present => self.patch_topic(name, settings).await?,
        }
        Ok(state)
    }

    /// Names of remote topics matching the server-side `filter`
    pub async fn list_topics(&self, filter: &str) -> Result<Vec<String>> {
        let request = self.http.http().get(self.topics_url()).query(&[
            ("size", TOPIC_LIST_PAGE_SIZE.to_string()),
            ("filter", filter.to_string()),
        ]);
        let response = self.http.send(request).await?;
        let body = expect_status(response, "listing", &[StatusCode::OK]).await?;

        let list: TopicList = serde_json::from_str(&body)?;
        Ok(list.items.into_iter().map(|item| item.name).collect())
    }

    /// Delete remote topic `name`
    pub async fn delete_topic(&self, name: &str) -> Result<()> {
        let response = self
            .http
            .send(self.http.http().delete(self.topic_url(name)))
            .await?;
        expect_status(
            response,
            "deleting",
            &[StatusCode::OK, StatusCode::NO_CONTENT],
        )
        .await?;

        info!(topic = %name, "Deleted topic");
        Ok(())
    }
}

/// Read the whole body so the connection can be reused
async fn drain(response: Response) -> Result<(StatusCode, String)> {
    let status = response.status();
    let body = response.text().await?;
    Ok((status, body))
}

/// Drain the response and fail unless its status is one of `accepted`
async fn expect_status(
    response: Response,
    operation: &'static str,
    accepted: &[StatusCode],
) -> Result<String> {
    let (status, body) = drain(response).await?;
    if accepted.contains(&status) {
        Ok(body)
    } else {
        Err(OperatorError::AdminApi {
            operation,
            status: status.as_u16(),
            body,
        })
    }
}
