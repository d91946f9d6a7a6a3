use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use lettre::{
    AsyncSmtpTransport, AsyncTransport, Tokio1Executor,
    message::{Mailbox, Message, header::ContentType},
    transport::smtp::authentication::Credentials,
};

use crate::config::EmailConfig;
use crate::delivery::NotificationChannel;
use crate::models::DeliveryMethod;

const DEFAULT_SUBJECT: &str = "Notification";

struct Mailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

pub struct EmailChannel {
    /// `Err` carries the setup problem; every send reports it.
    mailer: std::result::Result<Mailer, String>,
}

impl EmailChannel {
    pub fn new(cfg: Option<&EmailConfig>, timeout: Duration) -> Self {
        Self {
            mailer: build_mailer(cfg, timeout),
        }
    }
}

fn build_mailer(cfg: Option<&EmailConfig>, timeout: Duration) -> std::result::Result<Mailer, String> {
    let not_configured = || "email settings are not configured".to_string();
    let cfg = cfg.ok_or_else(not_configured)?;
    if cfg.username.is_empty() || cfg.password.is_empty() {
        return Err(not_configured());
    }

    let from = cfg
        .from_address()
        .parse::<Mailbox>()
        .map_err(|e| format!("invalid sender address {}: {e}", cfg.from_address()))?;

    let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&cfg.host)
        .map_err(|e| format!("invalid SMTP host {}: {e}", cfg.host))?
        .port(cfg.port)
        .credentials(Credentials::new(cfg.username.clone(), cfg.password.clone()))
        .timeout(Some(timeout))
        .build();

    Ok(Mailer { transport, from })
}

pub fn build_message(from: &Mailbox, to: &str, subject: &str, body: &str) -> Result<Message> {
    let subject = if subject.trim().is_empty() {
        DEFAULT_SUBJECT
    } else {
        subject
    };
    let message = Message::builder()
        .from(from.clone())
        .to(to.parse::<Mailbox>().context("Invalid recipient email")?)
        .subject(subject)
        .header(ContentType::TEXT_PLAIN)
        .body(body.to_owned())?;
    Ok(message)
}

#[async_trait]
impl NotificationChannel for EmailChannel {
    fn method(&self) -> DeliveryMethod {
        DeliveryMethod::Email
    }

    async fn send(&self, address: &str, subject: &str, body: &str) -> Result<()> {
        let mailer = self.mailer.as_ref().map_err(|e| anyhow!("{e}"))?;

        let email = build_message(&mailer.from, address, subject, body)?;
        mailer
            .transport
            .send(email)
            .await
            .context("SMTP send failed")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sender() -> Mailbox {
        "alerts@example.com".parse().unwrap()
    }

    #[test]
    fn blank_subject_gets_default() {
        let msg = build_message(&sender(), "bob@example.com", "  ", "hi").unwrap();
        let raw = String::from_utf8(msg.formatted()).unwrap();
        assert!(raw.contains("Subject: Notification"), "{raw}");
        assert!(raw.contains("To: bob@example.com"), "{raw}");
    }

    #[test]
    fn bad_recipient_is_rejected() {
        let err = build_message(&sender(), "not an address", "s", "b").unwrap_err();
        assert!(err.to_string().contains("Invalid recipient email"));
    }

    #[tokio::test]
    async fn missing_credentials_fail_every_send() {
        let cfg = EmailConfig {
            host: "smtp.example.com".into(),
            port: 587,
            username: String::new(),
            password: String::new(),
            from: None,
        };
        let channel = EmailChannel::new(Some(&cfg), Duration::from_secs(1));
        let err = channel.send("bob@example.com", "s", "b").await.unwrap_err();
        assert_eq!(err.to_string(), "email settings are not configured");
    }

    #[tokio::test]
    async fn non_address_username_fails_only_at_send() {
        let cfg = EmailConfig {
            host: "smtp.sendgrid.net".into(),
            port: 587,
            username: "apikey".into(),
            password: "secret".into(),
            from: None,
        };
        let channel = EmailChannel::new(Some(&cfg), Duration::from_secs(1));
        let err = channel.send("bob@example.com", "s", "b").await.unwrap_err();
        assert!(
            err.to_string().starts_with("invalid sender address apikey"),
            "{err}"
        );
    }
}
