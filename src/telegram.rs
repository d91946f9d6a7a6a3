use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use teloxide::{
    prelude::*,
    types::{ParseMode, Recipient as ChatRecipient},
    utils::html::escape,
};

use crate::collector::{SenderUpdate, UpdateSource};
use crate::config::TelegramConfig;
use crate::delivery::NotificationChannel;
use crate::models::DeliveryMethod;

fn build_bot(token: &str, timeout: Duration) -> Result<Bot> {
    let client = teloxide::net::default_reqwest_settings()
        .timeout(timeout)
        .build()
        .context("Failed to build Telegram HTTP client")?;
    Ok(Bot::with_client(token, client))
}

/// Numeric addresses are chat ids, anything else is treated as a public
/// `@username`.
pub fn chat_recipient(address: &str) -> ChatRecipient {
    let trimmed = address.trim();
    match trimmed.parse::<i64>() {
        Ok(id) => ChatRecipient::Id(ChatId(id)),
        Err(_) => ChatRecipient::ChannelUsername(format!("@{}", trimmed.trim_start_matches('@'))),
    }
}

pub fn format_text(subject: &str, body: &str) -> String {
    if subject.trim().is_empty() {
        escape(body)
    } else {
        format!("<b>{}</b>\n\n{}", escape(subject), escape(body))
    }
}

pub struct TelegramChannel {
    bot: Option<Bot>,
}

impl TelegramChannel {
    pub fn new(cfg: Option<&TelegramConfig>, timeout: Duration) -> Result<Self> {
        let bot = match cfg {
            Some(c) if !c.bot_token.is_empty() => Some(build_bot(&c.bot_token, timeout)?),
            _ => None,
        };
        Ok(Self { bot })
    }
}

#[async_trait]
impl NotificationChannel for TelegramChannel {
    fn method(&self) -> DeliveryMethod {
        DeliveryMethod::Telegram
    }

    async fn send(&self, address: &str, subject: &str, body: &str) -> Result<()> {
        let Some(bot) = &self.bot else {
            return Err(anyhow!("telegram bot is not configured"));
        };

        bot.send_message(chat_recipient(address), format_text(subject, body))
            .parse_mode(ParseMode::Html)
            .await
            .map_err(|e| anyhow!("Telegram error: {e}"))?;
        Ok(())
    }
}

/// `getUpdates` polling for the chat id collector.
pub struct BotUpdates {
    bot: Bot,
}

impl BotUpdates {
    pub fn new(cfg: &TelegramConfig, timeout: Duration) -> Result<Self> {
        if cfg.bot_token.is_empty() {
            return Err(anyhow!("telegram bot token is not configured"));
        }
        Ok(Self {
            bot: build_bot(&cfg.bot_token, timeout)?,
        })
    }
}

#[async_trait]
impl UpdateSource for BotUpdates {
    async fn fetch(&self, offset: i64) -> Result<Vec<SenderUpdate>> {
        let offset = i32::try_from(offset).context("Update offset out of range")?;
        let updates = self
            .bot
            .get_updates()
            .offset(offset)
            .timeout(0)
            .await
            .map_err(|e| anyhow!("getUpdates failed: {e}"))?;

        Ok(updates.iter().map(sender_update).collect())
    }
}

/// Who sent `update` and where to reach them. The chat of the update wins;
/// updates without one (inline queries, callbacks on old messages) fall back
/// to the sender's private chat, whose id equals the user id.
pub fn sender_update(update: &Update) -> SenderUpdate {
    let sender = update.from();
    SenderUpdate {
        update_id: i64::from(update.id.0),
        username: sender.and_then(|u| u.username.clone()),
        chat_id: update
            .chat()
            .map(|c| c.id.0)
            .or_else(|| sender.and_then(|u| i64::try_from(u.id.0).ok())),
    }
}
