use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use log::{debug, info, warn};

use crate::models::{DeliveryMethod, DeliveryOutcome, Recipient};

/// A single notification transport.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    fn method(&self) -> DeliveryMethod;

    /// Sends one message to `address`. Blocking-style: one attempt, no
    /// retries.
    async fn send(&self, address: &str, subject: &str, body: &str) -> Result<()>;
}

/// Tries channels in priority order and stops at the first that delivers.
pub struct DeliveryEngine {
    channels: HashMap<DeliveryMethod, Box<dyn NotificationChannel>>,
    timeout: Duration,
}

impl DeliveryEngine {
    pub fn new(timeout: Duration) -> Self {
        Self {
            channels: HashMap::new(),
            timeout,
        }
    }

    pub fn register(&mut self, channel: Box<dyn NotificationChannel>) {
        self.channels.insert(channel.method(), channel);
    }

    pub fn with_channel(mut self, channel: Box<dyn NotificationChannel>) -> Self {
        self.register(channel);
        self
    }

    pub async fn deliver<S: AsRef<str>>(
        &self,
        recipient: &Recipient,
        subject: &str,
        body: &str,
        methods: &[S],
    ) -> DeliveryOutcome {
        let mut errors: Vec<String> = Vec::new();

        for name in methods {
            let name = name.as_ref();
            let method = match name.parse::<DeliveryMethod>() {
                Ok(m) => m,
                Err(e) => {
                    errors.push(e.to_string());
                    continue;
                }
            };

            let Some(channel) = self.channels.get(&method) else {
                errors.push(format!("{method}: channel is not registered"));
                continue;
            };

            let Some(address) = recipient.address_for(method) else {
                errors.push(format!("{method}: recipient has no {method} address"));
                continue;
            };

            debug!("Trying {method} for {address}");
            match self.attempt(channel.as_ref(), &address, subject, body).await {
                Ok(()) => {
                    info!("Delivered via {method} to {address}");
                    return DeliveryOutcome::delivered(method);
                }
                Err(e) => {
                    warn!("{method} delivery to {address} failed: {e:#}");
                    errors.push(format!("{method}: {e:#}"));
                }
            }
        }

        DeliveryOutcome::failed(&errors)
    }

    async fn attempt(
        &self,
        channel: &dyn NotificationChannel,
        address: &str,
        subject: &str,
        body: &str,
    ) -> Result<()> {
        match tokio::time::timeout(self.timeout, channel.send(address, subject, body)).await {
            Ok(res) => res,
            Err(_) => Err(anyhow!("timed out after {}s", self.timeout.as_secs())),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Records every call and answers with a fixed result.
    pub(crate) struct FakeChannel {
        pub method: DeliveryMethod,
        pub fail_with: Option<&'static str>,
        pub delay: Option<Duration>,
        pub calls: Arc<Mutex<Vec<String>>>,
    }

    impl FakeChannel {
        pub fn ok(method: DeliveryMethod, calls: &Arc<Mutex<Vec<String>>>) -> Box<Self> {
            Box::new(Self {
                method,
                fail_with: None,
                delay: None,
                calls: calls.clone(),
            })
        }

        pub fn failing(
            method: DeliveryMethod,
            err: &'static str,
            calls: &Arc<Mutex<Vec<String>>>,
        ) -> Box<Self> {
            Box::new(Self {
                method,
                fail_with: Some(err),
                delay: None,
                calls: calls.clone(),
            })
        }
    }

    #[async_trait]
    impl NotificationChannel for FakeChannel {
        fn method(&self) -> DeliveryMethod {
            self.method
        }

        async fn send(&self, address: &str, _subject: &str, _body: &str) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("{}:{}", self.method, address));
            if let Some(d) = self.delay {
                tokio::time::sleep(d).await;
            }
            match self.fail_with {
                Some(e) => Err(anyhow!(e)),
                None => Ok(()),
            }
        }
    }

    fn alice() -> Recipient {
        Recipient {
            email: "alice@example.com".into(),
            phone: "+15550100".into(),
            telegram: "@alice".into(),
            telegram_chat_id: None,
        }
    }

    #[tokio::test]
    async fn first_success_short_circuits() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let engine = DeliveryEngine::new(Duration::from_secs(1))
            .with_channel(FakeChannel::ok(DeliveryMethod::Email, &calls))
            .with_channel(FakeChannel::ok(DeliveryMethod::Sms, &calls));

        let outcome = engine.deliver(&alice(), "s", "b", &["email", "sms"]).await;

        assert_eq!(outcome, DeliveryOutcome::delivered(DeliveryMethod::Email));
        assert_eq!(*calls.lock().unwrap(), vec!["email:alice@example.com"]);
    }

    #[tokio::test]
    async fn falls_back_in_priority_order() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let engine = DeliveryEngine::new(Duration::from_secs(1))
            .with_channel(FakeChannel::failing(DeliveryMethod::Telegram, "bot blocked", &calls))
            .with_channel(FakeChannel::failing(DeliveryMethod::Email, "smtp down", &calls))
            .with_channel(FakeChannel::ok(DeliveryMethod::Sms, &calls));

        let outcome = engine
            .deliver(&alice(), "s", "b", &["telegram", "email", "sms"])
            .await;

        assert_eq!(outcome.method, Some(DeliveryMethod::Sms));
        assert!(outcome.is_success());
        assert_eq!(outcome.error, "");
        assert_eq!(
            *calls.lock().unwrap(),
            vec!["telegram:@alice", "email:alice@example.com", "sms:+15550100"]
        );
    }

    #[tokio::test]
    async fn exhausted_channels_report_every_error() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let engine = DeliveryEngine::new(Duration::from_secs(1))
            .with_channel(FakeChannel::failing(DeliveryMethod::Email, "smtp down", &calls))
            .with_channel(FakeChannel::ok(DeliveryMethod::Sms, &calls));
        let recipient = Recipient {
            phone: String::new(),
            ..alice()
        };

        let outcome = engine
            .deliver(&recipient, "s", "b", &["fax", "email", "sms", "telegram"])
            .await;

        assert_eq!(outcome.method_name(), "none");
        assert_eq!(outcome.status.as_str(), "failed");
        assert_eq!(
            outcome.error,
            "unknown delivery method: fax; email: smtp down; \
             sms: recipient has no sms address; telegram: channel is not registered"
        );
        assert_eq!(calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn empty_method_list_fails_without_errors() {
        let engine = DeliveryEngine::new(Duration::from_secs(1));
        let outcome = engine.deliver::<&str>(&alice(), "s", "b", &[]).await;
        assert!(!outcome.is_success());
        assert_eq!(outcome.error, "");
    }

    #[tokio::test(start_paused = true)]
    async fn slow_channel_times_out_and_falls_back() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let slow = Box::new(FakeChannel {
            method: DeliveryMethod::Email,
            fail_with: None,
            delay: Some(Duration::from_secs(60)),
            calls: calls.clone(),
        });
        let engine = DeliveryEngine::new(Duration::from_secs(5))
            .with_channel(slow)
            .with_channel(FakeChannel::ok(DeliveryMethod::Sms, &calls));

        let outcome = engine.deliver(&alice(), "s", "b", &["email", "sms"]).await;

        assert_eq!(outcome.method, Some(DeliveryMethod::Sms));
        let failed_only = engine.deliver(&alice(), "s", "b", &["email"]).await;
        assert_eq!(failed_only.error, "email: timed out after 5s");
    }
}
