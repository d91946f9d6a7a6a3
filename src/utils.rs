use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use serde::Serialize;

use crate::models::{DeliveryOutcome, NotificationUser};

/// One line of a broadcast's JSON delivery report.
#[derive(Debug, Clone, Serialize)]
pub struct ReportEntry {
    pub user_id: i64,
    pub email: String,
    pub delivery_method: String,
    pub status: String,
    pub error_message: String,
    pub timestamp: DateTime<Utc>,
}

impl ReportEntry {
    pub fn new(user: &NotificationUser, outcome: &DeliveryOutcome) -> Self {
        Self {
            user_id: user.external_id,
            email: user.email.clone(),
            delivery_method: outcome.method_name().to_string(),
            status: outcome.status.as_str().to_string(),
            error_message: outcome.error.clone(),
            timestamp: Utc::now(),
        }
    }
}

pub fn report_file_name(now: DateTime<Local>) -> String {
    format!("notification_log_{}.json", now.format("%Y%m%d_%H%M%S"))
}

/// Writes `entries` as pretty JSON into `dir`, creating it if needed.
pub fn write_delivery_report(dir: &Path, entries: &[ReportEntry]) -> Result<PathBuf> {
    fs::create_dir_all(dir)
        .with_context(|| format!("Could not create report dir {}", dir.display()))?;
    let path = dir.join(report_file_name(Local::now()));
    let json = serde_json::to_string_pretty(entries)?;
    fs::write(&path, json).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(path)
}

pub fn parse_id_list(raw: &str) -> Vec<i64> {
    raw.split(',')
        .filter_map(|part| part.trim().parse::<i64>().ok())
        .collect()
}

/// Blank means "no email"; anything else must parse as an address.
pub fn check_email(raw: &str) -> Result<()> {
    let raw = raw.trim();
    if !raw.is_empty() {
        raw.parse::<lettre::Address>()
            .with_context(|| format!("Invalid email address: {raw}"))?;
    }
    Ok(())
}

pub fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars.saturating_sub(1)).collect();
    out.push('…');
    out
}
