use std::fmt;
use std::str::FromStr;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMethod {
    Email,
    Sms,
    Telegram,
}

impl DeliveryMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Sms => "sms",
            Self::Telegram => "telegram",
        }
    }
}

impl fmt::Display for DeliveryMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryMethod {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "email" => Ok(Self::Email),
            "sms" => Ok(Self::Sms),
            "telegram" => Ok(Self::Telegram),
            other => Err(anyhow!("unknown delivery method: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    Success,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            other => Err(anyhow!("unknown delivery status: {other}")),
        }
    }
}

/// Result of one fallback run for a single recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryOutcome {
    /// Channel that delivered the message, `None` when every channel failed.
    pub method: Option<DeliveryMethod>,
    pub status: DeliveryStatus,
    pub error: String,
}

impl DeliveryOutcome {
    pub fn delivered(method: DeliveryMethod) -> Self {
        Self {
            method: Some(method),
            status: DeliveryStatus::Success,
            error: String::new(),
        }
    }

    pub fn failed(errors: &[String]) -> Self {
        Self {
            method: None,
            status: DeliveryStatus::Failed,
            error: errors.join("; "),
        }
    }

    pub fn method_name(&self) -> &'static str {
        self.method.map(|m| m.as_str()).unwrap_or("none")
    }

    pub fn is_success(&self) -> bool {
        self.status == DeliveryStatus::Success
    }
}

/// Per-channel addresses of a single recipient.
#[derive(Debug, Clone, Default)]
pub struct Recipient {
    pub email: String,
    pub phone: String,
    pub telegram: String,
    pub telegram_chat_id: Option<i64>,
}

impl Recipient {
    /// Address to use for `method`, or `None` when the field is blank.
    pub fn address_for(&self, method: DeliveryMethod) -> Option<String> {
        let raw = match method {
            DeliveryMethod::Email => self.email.trim(),
            DeliveryMethod::Sms => self.phone.trim(),
            DeliveryMethod::Telegram => {
                if let Some(chat_id) = self.telegram_chat_id {
                    return Some(chat_id.to_string());
                }
                self.telegram.trim()
            }
        };
        if raw.is_empty() { None } else { Some(raw.to_string()) }
    }
}

#[derive(Debug, Clone)]
pub struct UserGroup {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NotificationUser {
    pub id: i64,
    pub external_id: i64,
    pub email: String,
    pub phone: String,
    pub telegram: String,
    pub telegram_chat_id: Option<i64>,
    pub group_id: i64,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl NotificationUser {
    pub fn recipient(&self) -> Recipient {
        Recipient {
            email: self.email.clone(),
            phone: self.phone.clone(),
            telegram: self.telegram.clone(),
            telegram_chat_id: self.telegram_chat_id,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NotificationMessage {
    pub id: i64,
    pub title: String,
    pub content: String,
    pub send_to_all: bool,
    pub target_groups: Vec<i64>,
    /// Channel names in priority order, kept as written so unknown names
    /// surface as delivery errors rather than vanish.
    pub delivery_methods: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub is_sent: bool,
}

#[derive(Debug, Clone)]
pub struct NotificationLog {
    pub id: i64,
    pub message_id: i64,
    pub user_id: i64,
    pub delivery_method: String,
    pub status: String,
    pub error_message: String,
    pub sent_at: DateTime<Utc>,
}

/// Shape of a user in import/export files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: i64,
    pub email: String,
    pub phone: String,
    pub telegram: String,
    pub group: String,
}
