//! HTTP webhook used as the external notification sink.

use reqwest::StatusCode;
use serde::Serialize;
use serenity::async_trait;

use crate::error::PushError;
use crate::notify::{Notification, PushChannel};

/// Body posted for every notification.
#[derive(Debug, Serialize)]
struct Envelope<'a> {
    method: &'a str,
    message: &'a Notification,
}

pub struct WebhookPushChannel {
    client: reqwest::Client,
    url: String,
}

impl WebhookPushChannel {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl PushChannel for WebhookPushChannel {
    /// A reachable endpoint counts as connected, whatever it answers to HEAD,
    /// as long as it is not a server error.
    async fn connect(&self) -> Result<(), PushError> {
        let resp = self.client.head(&self.url).send().await?;
        if resp.status().is_server_error() {
            return Err(PushError::Transport(format!(
                "webhook answered {}",
                resp.status()
            )));
        }
        Ok(())
    }

    async fn invoke(&self, method: &str, message: &Notification) -> Result<(), PushError> {
        let resp = self
            .client
            .post(&self.url)
            .json(&Envelope { method, message })
            .send()
            .await?;
        match resp.status() {
            s if s.is_success() => Ok(()),
            StatusCode::NOT_FOUND | StatusCode::GONE => Err(PushError::NotConnected),
            s => Err(PushError::Transport(format!("webhook answered {s}"))),
        }
    }
}
