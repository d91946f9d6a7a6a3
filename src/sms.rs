use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;

use crate::config::SmsConfig;
use crate::delivery::NotificationChannel;
use crate::models::DeliveryMethod;

/// SMS.ru-style gateway: form POST, JSON reply with a `status` field.
pub struct SmsChannel {
    client: Client,
    api_url: String,
    api_key: String,
    sender: String,
}

#[derive(Debug, Deserialize)]
struct GatewayReply {
    status: Option<String>,
    status_text: Option<String>,
}

impl SmsChannel {
    pub fn new(cfg: Option<&SmsConfig>, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        let (api_url, api_key, sender) = match cfg {
            Some(c) => (c.api_url.clone(), c.api_key.clone(), c.sender.clone()),
            None => Default::default(),
        };
        Ok(Self {
            client,
            api_url,
            api_key,
            sender,
        })
    }
}

/// Maps the gateway's HTTP status and body onto success or an error.
pub fn check_gateway_reply(status: StatusCode, body: &str) -> Result<()> {
    if status != StatusCode::OK {
        return Err(anyhow!("HTTP error: {}", status.as_u16()));
    }
    let reply: GatewayReply =
        serde_json::from_str(body).context("SMS API returned malformed JSON")?;
    if reply.status.as_deref() == Some("OK") {
        Ok(())
    } else {
        Err(anyhow!(
            "SMS API error: {}",
            reply.status_text.as_deref().unwrap_or("unknown error")
        ))
    }
}

#[async_trait]
impl NotificationChannel for SmsChannel {
    fn method(&self) -> DeliveryMethod {
        DeliveryMethod::Sms
    }

    async fn send(&self, address: &str, _subject: &str, body: &str) -> Result<()> {
        if self.api_url.is_empty() || self.api_key.is_empty() {
            return Err(anyhow!("SMS settings are not configured"));
        }

        let form = [
            ("api_id", self.api_key.as_str()),
            ("to", address),
            ("msg", body),
            ("from", self.sender.as_str()),
            ("json", "1"),
        ];
        let res = self.client.post(&self.api_url).form(&form).send().await?;
        let status = res.status();
        let text = res.text().await?;
        check_gateway_reply(status, &text)
    }
}
