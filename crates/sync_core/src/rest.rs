//! REST adapters for the durable-store and media-store contracts. The
//! engine only ever sees the traits; these map them onto a plain HTTP
//! service in front of the database and the media bucket.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use url::Url;

use shared::{
    domain::{ConversationKey, MessageId, PeerId},
    protocol::MessageRecord,
};

use crate::{DurableStore, MediaStore};

#[derive(Clone)]
pub struct RestDurableStore {
    http: Client,
    base_url: Url,
    api_key: Option<String>,
}

impl RestDurableStore {
    pub fn new(base_url: &str) -> Result<Self> {
        let base_url = parse_base_url(base_url)?;
        Ok(Self {
            http: Client::new(),
            base_url,
            api_key: None,
        })
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .with_context(|| format!("invalid endpoint path '{path}'"))
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.header("apikey", key),
            None => request,
        }
    }
}

#[async_trait]
impl DurableStore for RestDurableStore {
    async fn fetch_conversation(
        &self,
        conversation: &ConversationKey,
    ) -> Result<Vec<MessageRecord>> {
        let request = self
            .http
            .get(self.endpoint("messages")?)
            .query(&[
                ("user_a", conversation.local().as_str()),
                ("user_b", conversation.remote().as_str()),
                ("order", "created_at.asc"),
            ]);
        self.authorized(request)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .context("failed to decode conversation fetch response")
    }

    async fn insert_message(&self, record: &MessageRecord) -> Result<MessageRecord> {
        let request = self.http.post(self.endpoint("messages")?).json(record);
        self.authorized(request)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .context("failed to decode insert confirmation")
    }

    async fn update_read_flag(&self, reader: &PeerId, sender: &PeerId) -> Result<()> {
        let request = self
            .http
            .post(self.endpoint("messages/read")?)
            .query(&[("reader", reader.as_str()), ("sender", sender.as_str())]);
        self.authorized(request).send().await?.error_for_status()?;
        Ok(())
    }

    async fn delete_message(&self, id: &MessageId) -> Result<()> {
        let request = self
            .http
            .delete(self.endpoint(&format!("messages/{}", id.as_str()))?);
        self.authorized(request).send().await?.error_for_status()?;
        Ok(())
    }
}

#[derive(Clone)]
pub struct RestMediaStore {
    http: Client,
    base_url: Url,
    api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    url: String,
}

impl RestMediaStore {
    pub fn new(base_url: &str) -> Result<Self> {
        let base_url = parse_base_url(base_url)?;
        Ok(Self {
            http: Client::new(),
            base_url,
            api_key: None,
        })
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }
}

#[async_trait]
impl MediaStore for RestMediaStore {
    async fn upload(&self, bytes: Vec<u8>, filename: &str) -> Result<String> {
        let safe_name = sanitize_filename(filename);
        let url = self
            .base_url
            .join(&format!("media/{safe_name}"))
            .with_context(|| format!("invalid media path for '{safe_name}'"))?;
        let mut request = self.http.post(url).body(bytes);
        if let Some(key) = &self.api_key {
            request = request.header("apikey", key);
        }
        let response: UploadResponse = request
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .context("failed to decode media upload response")?;
        Ok(response.url)
    }
}

fn parse_base_url(raw: &str) -> Result<Url> {
    // a trailing slash keeps Url::join from eating the last path segment
    let normalized = if raw.ends_with('/') {
        raw.to_string()
    } else {
        format!("{raw}/")
    };
    Url::parse(&normalized).with_context(|| format!("invalid base url '{raw}'"))
}

fn sanitize_filename(filename: &str) -> String {
    let safe: String = filename
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if safe.trim_matches('_').is_empty() {
        "upload.bin".to_string()
    } else {
        safe
    }
}

#[cfg(test)]
#[path = "tests/rest_tests.rs"]
mod tests;
