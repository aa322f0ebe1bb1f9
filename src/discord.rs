use crate::chat_adapter::{ChatPlatform, DeleteOutcome, RecentHistory};
use crate::error::{AutodeleteError, Result};
use crate::models::TrackedMessage;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;

const USER_AGENT: &str = "AutoDelete (https://github.com/riking/AutoDelete, v1.4)";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);
/// Largest page the messages endpoint returns
const PAGE_SIZE: usize = 100;

#[derive(Debug, Deserialize)]
struct ApiMessage {
    id: String,
    timestamp: DateTime<Utc>,
    #[serde(default)]
    pinned: bool,
}

impl From<ApiMessage> for TrackedMessage {
    fn from(msg: ApiMessage) -> Self {
        TrackedMessage {
            id: msg.id,
            created_at: msg.timestamp,
            pinned: msg.pinned,
        }
    }
}

/// Discord HTTP API client implementing the platform calls
pub struct DiscordRest {
    client: Client,
    api_base: String,
    backlog_limit: usize,
}

impl DiscordRest {
    pub fn new(bot_token: &str, api_base: &str, backlog_limit: usize) -> Result<Self> {
        let mut auth = HeaderValue::from_str(&format!("Bot {}", bot_token)).map_err(|_| {
            AutodeleteError::ConfigError("bot token is not a valid header value".to_string())
        })?;
        auth.set_sensitive(true);
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, auth);

        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(REQUEST_TIMEOUT)
            .default_headers(headers)
            .build()?;

        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            backlog_limit,
        })
    }

    fn messages_url(&self, channel_id: &str) -> String {
        format!("{}/channels/{}/messages", self.api_base, channel_id)
    }

    async fn fetch_page(
        &self,
        channel_id: &str,
        limit: usize,
        before: Option<&str>,
    ) -> Result<Vec<ApiMessage>> {
        let mut request = self
            .client
            .get(self.messages_url(channel_id))
            .query(&[("limit", limit.to_string())]);
        if let Some(before) = before {
            request = request.query(&[("before", before)]);
        }

        let page = request.send().await?.error_for_status()?.json().await?;
        Ok(page)
    }
}

#[async_trait]
impl ChatPlatform for DiscordRest {
    async fn delete_message(&self, channel_id: &str, message_id: &str) -> Result<DeleteOutcome> {
        let url = format!("{}/{}", self.messages_url(channel_id), message_id);
        let response = self.client.delete(&url).send().await?;

        match response.status() {
            status if status.is_success() => Ok(DeleteOutcome::Deleted),
            StatusCode::NOT_FOUND => Ok(DeleteOutcome::NotFound),
            status => Err(AutodeleteError::PlatformError(format!(
                "DELETE message {} in channel {} returned {}",
                message_id, channel_id, status
            ))),
        }
    }

    async fn fetch_pinned_messages(&self, channel_id: &str) -> Result<HashSet<String>> {
        let url = format!("{}/channels/{}/pins", self.api_base, channel_id);
        let pins: Vec<ApiMessage> = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(pins.into_iter().map(|m| m.id).collect())
    }

    async fn fetch_recent_messages(
        &self,
        channel_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<RecentHistory> {
        // Pages come back newest first
        let mut messages: Vec<TrackedMessage> = Vec::new();
        let mut before: Option<String> = None;
        let mut truncated = false;

        loop {
            let limit = PAGE_SIZE.min(self.backlog_limit - messages.len());
            if limit == 0 {
                truncated = true;
                break;
            }

            let page = self.fetch_page(channel_id, limit, before.as_deref()).await?;
            let exhausted = page.len() < limit;
            let mut reached_since = false;

            for msg in page {
                if since.is_some_and(|since| msg.timestamp < since) {
                    reached_since = true;
                    break;
                }
                before = Some(msg.id.clone());
                messages.push(msg.into());
            }

            if exhausted || reached_since {
                break;
            }
        }

        if truncated {
            tracing::debug!(
                channel_id,
                limit = self.backlog_limit,
                "backlog truncated at the configured limit"
            );
        }
        messages.reverse();
        Ok(RecentHistory {
            messages,
            truncated,
        })
    }
}
