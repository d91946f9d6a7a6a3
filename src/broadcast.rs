use std::path::{Path, PathBuf};

use anyhow::Result;
use log::{error, info};

use crate::db::Db;
use crate::delivery::DeliveryEngine;
use crate::utils::{ReportEntry, write_delivery_report};

#[derive(Debug)]
pub struct BroadcastSummary {
    pub success_count: usize,
    pub total: usize,
    /// Deliveries whose log row could not be stored.
    pub log_failures: usize,
    /// `None` when the report file could not be written.
    pub report_path: Option<PathBuf>,
}

/// Delivers message `message_id` to each of its target users in turn,
/// logging every outcome, then marks the message sent.
pub async fn broadcast_message(
    db: &Db,
    engine: &DeliveryEngine,
    message_id: i64,
    report_dir: &Path,
) -> Result<BroadcastSummary> {
    let message = db.get_message(message_id)?;
    let targets = db.target_users(&message)?;
    info!(
        "Broadcasting message {} \"{}\" to {} user(s) via {:?}",
        message.id,
        message.title,
        targets.len(),
        message.delivery_methods
    );

    let mut report = Vec::with_capacity(targets.len());
    let mut success_count = 0;
    let mut log_failures = 0;

    for user in &targets {
        let outcome = engine
            .deliver(
                &user.recipient(),
                &message.title,
                &message.content,
                message.delivery_methods.as_slice(),
            )
            .await;

        // The message already went out; a lost log row must not stop the rest.
        if let Err(e) = db.insert_log(message.id, user.id, &outcome) {
            error!(
                "Could not log delivery of message {} to user {}: {e:#}",
                message.id, user.external_id
            );
            log_failures += 1;
        }
        report.push(ReportEntry::new(user, &outcome));
        if outcome.is_success() {
            success_count += 1;
        }
    }

    let report_path = match write_delivery_report(report_dir, &report) {
        Ok(path) => {
            info!("Delivery report written to {}", path.display());
            Some(path)
        }
        Err(e) => {
            error!("Could not write delivery report: {e:#}");
            None
        }
    };

    db.mark_message_sent(message.id)?;
    info!(
        "Message {} delivered to {}/{} user(s)",
        message.id,
        success_count,
        targets.len()
    );

    Ok(BroadcastSummary {
        success_count,
        total: targets.len(),
        log_failures,
        report_path,
    })
}
