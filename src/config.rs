use std::{
    fs::{self, File},
    io::Write,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use serde_yaml::Deserializer;

const APP_PREFIX: &str = "notifyhub";
const CONFIG_FILE: &str = "config.yaml";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub db_path: PathBuf,
    #[serde(default = "default_delivery_log_dir")]
    pub delivery_log_dir: PathBuf,
    #[serde(default = "default_api_timeout_secs")]
    pub api_timeout_secs: u64,
    pub email: Option<EmailConfig>,
    pub sms: Option<SmsConfig>,
    pub telegram: Option<TelegramConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmailConfig {
    #[serde(default = "default_smtp_host")]
    pub host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Falls back to `username` when omitted.
    pub from: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SmsConfig {
    #[serde(default)]
    pub api_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_sms_sender")]
    pub sender: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub bot_token: String,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_error_backoff_secs")]
    pub error_backoff_secs: u64,
}

fn default_delivery_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_api_timeout_secs() -> u64 {
    30
}

fn default_smtp_host() -> String {
    "smtp.gmail.com".to_string()
}

fn default_smtp_port() -> u16 {
    587
}

fn default_sms_sender() -> String {
    "NotifySystem".to_string()
}

fn default_poll_interval_secs() -> u64 {
    2
}

fn default_error_backoff_secs() -> u64 {
    10
}

impl EmailConfig {
    pub fn from_address(&self) -> &str {
        self.from.as_deref().unwrap_or(&self.username)
    }
}

pub struct EnsureOutcome {
    pub path: PathBuf,
    pub created: bool,
}

const CONFIG_TEMPLATE: &str = r#"# notifyhub config (YAML)
# db_path is required; every channel section is optional.

db_path: "/path/to/notifyhub.sqlite3"

# Where per-broadcast JSON delivery reports are written
delivery_log_dir: "logs"

# Upper bound for a single channel attempt, in seconds
api_timeout_secs: 30

email:
  host: "smtp.gmail.com"
  port: 587
  username: "your-email@gmail.com"
  password: "your-app-password"
  # from: "alerts@example.com"

sms:
  api_url: "https://sms.ru/sms/send"
  api_key: "<your SMS api key>"
  sender: "NotifySystem"

telegram:
  bot_token: "<your bot token>"
  poll_interval_secs: 2
  error_backoff_secs: 10
"#;

impl Config {
    pub fn ensure_user_config() -> Result<EnsureOutcome> {
        let xdg_dirs = xdg::BaseDirectories::with_prefix(APP_PREFIX);

        if let Some(path) = xdg_dirs.find_config_file(CONFIG_FILE) {
            return Ok(EnsureOutcome {
                path,
                created: false,
            });
        }

        let config_path = xdg_dirs
            .place_config_file(CONFIG_FILE)
            .context("Cannot create configuration directory")?;
        let mut config_file = File::create(&config_path)?;
        config_file.write_all(CONFIG_TEMPLATE.as_bytes())?;

        Ok(EnsureOutcome {
            path: config_path,
            created: true,
        })
    }

    pub fn get_user_config() -> Result<Config> {
        let xdg_dirs = xdg::BaseDirectories::with_prefix(APP_PREFIX).find_config_file(CONFIG_FILE);

        match &xdg_dirs {
            Some(existing_config) => Config::load(existing_config),
            None => Err(anyhow!(
                "Could not read configuration file in config::get_user_config"
            )),
        }
    }

    pub fn load(path: &Path) -> Result<Config> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Config::parse(&raw).map_err(|e| anyhow!("Invalid YAML in {}: {:#}", path.display(), e))
    }

    pub fn parse(raw: &str) -> Result<Config> {
        let deserialized = Deserializer::from_str(raw);
        serde_path_to_error::deserialize(deserialized)
            .map_err(|e| anyhow!("at `{}`: {}", e.path(), e.inner()))
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_fills_defaults() {
        let cfg = Config::parse("db_path: /tmp/x.sqlite3\n").unwrap();
        assert_eq!(cfg.delivery_log_dir, PathBuf::from("logs"));
        assert_eq!(cfg.api_timeout(), Duration::from_secs(30));
        assert!(cfg.email.is_none());
        assert!(cfg.sms.is_none());
        assert!(cfg.telegram.is_none());
    }

    #[test]
    fn template_parses() {
        let cfg = Config::parse(CONFIG_TEMPLATE).unwrap();
        let email = cfg.email.unwrap();
        assert_eq!(email.port, 587);
        assert_eq!(email.from_address(), "your-email@gmail.com");
        assert_eq!(cfg.sms.unwrap().sender, "NotifySystem");
        let tg = cfg.telegram.unwrap();
        assert_eq!(tg.poll_interval_secs, 2);
        assert_eq!(tg.error_backoff_secs, 10);
    }

    #[test]
    fn type_errors_name_the_offending_key() {
        let err = Config::parse("db_path: /tmp/x\nemail:\n  port: many\n").unwrap_err();
        assert!(err.to_string().contains("email.port"), "{err}");
    }
}
