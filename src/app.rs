use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use log::{debug, error, info, warn};

use crate::broadcast::broadcast_message;
use crate::collector::{ChatIdCollector, CollectorHandle};
use crate::config::{Config, EnsureOutcome, TelegramConfig};
use crate::db::{Db, LogFilter, UserPatch};
use crate::delivery::DeliveryEngine;
use crate::email::EmailChannel;
use crate::import::{export_users, import_users_from_file};
use crate::logger::init_logger;
use crate::models::DeliveryMethod;
use crate::sms::SmsChannel;
use crate::telegram::{BotUpdates, TelegramChannel};
use crate::utils::{check_email, parse_id_list, truncate};
use crate::{BulkAction, Cli, Command, GroupAction, UserAction};

pub async fn run(cli: Cli) -> Result<()> {
    init_logger(cli.verbose)?;
    debug!("Logger initialized");

    let cfg = match &cli.config {
        Some(path) => Config::load(path)?,
        None => {
            let outcome: EnsureOutcome = Config::ensure_user_config()?;
            if outcome.created {
                println!(
                    "Config file created at {}. Please edit it and restart the app.",
                    outcome.path.display()
                );
                return Ok(());
            }
            Config::get_user_config()?
        }
    };
    debug!("Config loaded");

    let db = Db::open(&cfg)?;
    debug!("Database opened");

    match cli.command {
        Command::Import { file } => {
            let report = import_users_from_file(&db, &file)?;
            println!(
                "Imported {} users ({} new).",
                report.imported, report.created
            );
            if !report.errors.is_empty() {
                println!("{} errors:", report.errors.len());
                for e in report.errors.iter().take(5) {
                    println!("  - {e}");
                }
            }
        }

        Command::Export { file } => {
            let n = export_users(&db, &file)?;
            println!("Exported {n} users to {}", file.display());
        }

        Command::Groups => {
            for (group, active) in db.list_groups()? {
                println!(
                    "{:>4}  {:<24} {:>5} active  since {}  {}",
                    group.id,
                    group.name,
                    active,
                    group.created_at.format("%Y-%m-%d"),
                    group.description
                );
            }
        }

        Command::Group { action } => match action {
            GroupAction::Add { name, description } => {
                let id = db.create_group(&name, &description)?;
                info!("Created group {name} ({id})");
                println!("Created group {name}.");
            }
            GroupAction::Edit {
                name,
                rename,
                description,
            } => {
                let id = require_group(&db, &name)?;
                db.update_group(id, rename.as_deref(), description.as_deref())?;
                println!("Group {} updated.", rename.as_deref().unwrap_or(&name));
            }
            GroupAction::Rm { name } => {
                let id = require_group(&db, &name)?;
                let users = db.delete_group(id)?;
                info!("Deleted group {name} with {users} user(s)");
                println!("Deleted group {name} and its {users} user(s).");
            }
        },

        Command::Users { group, search } => {
            let group_id = match group {
                Some(name) => Some(require_group(&db, &name)?),
                None => None,
            };
            let group_names: HashMap<i64, String> = db
                .list_groups()?
                .into_iter()
                .map(|(g, _)| (g.id, g.name))
                .collect();
            for user in db.search_users(group_id, search.as_deref())? {
                println!(
                    "{:>4}  ext={:<6} {:<12} {:<28} {:<14} {:<18} chat={} updated {} {}",
                    user.id,
                    user.external_id,
                    group_names.get(&user.group_id).map(String::as_str).unwrap_or("?"),
                    user.email,
                    user.phone,
                    user.telegram,
                    user.telegram_chat_id.map(|c| c.to_string()).unwrap_or_else(|| "-".into()),
                    user.updated_at.format("%Y-%m-%d"),
                    if user.is_active { "" } else { "(inactive)" }
                );
            }
        }

        Command::User { action } => match action {
            UserAction::Add {
                external_id,
                group,
                email,
                phone,
                telegram,
            } => {
                check_email(&email)?;
                let group_id = require_group(&db, &group)?;
                let id = db.create_user(external_id, &email, &phone, &telegram, group_id)?;
                let user = db
                    .get_user(id)?
                    .with_context(|| format!("User {id} vanished after insert"))?;
                info!("Created user {id} (ext={external_id})");
                println!(
                    "Created user {id} (ext={}) at {}.",
                    user.external_id,
                    user.created_at.format("%Y-%m-%d %H:%M")
                );
            }
            UserAction::Edit {
                id,
                group,
                email,
                phone,
                telegram,
                active,
            } => {
                if let Some(email) = &email {
                    check_email(email)?;
                }
                let group_id = match group {
                    Some(name) => Some(require_group(&db, &name)?),
                    None => None,
                };
                let patch = UserPatch {
                    email,
                    phone,
                    telegram,
                    group_id,
                    is_active: active,
                };
                db.update_user(id, &patch)?;
                println!("User {id} updated.");
            }
            UserAction::Rm { id } => {
                db.delete_user(id)?;
                info!("Deleted user {id}");
                println!("Deleted user {id}.");
            }
        },

        Command::Bulk { action, ids, group } => {
            let ids = parse_id_list(&ids);
            if ids.is_empty() {
                bail!("No valid user ids given");
            }
            let n = match action {
                BulkAction::Activate => db.set_users_active(&ids, true)?,
                BulkAction::Deactivate => db.set_users_active(&ids, false)?,
                BulkAction::Delete => db.delete_users(&ids)?,
                BulkAction::ChangeGroup => {
                    let name = group.context("change-group needs --group")?;
                    let group_id = require_group(&db, &name)?;
                    db.change_users_group(&ids, group_id)?
                }
            };
            info!("Bulk {action:?} touched {n} user(s)");
            println!("{action:?}: {n} user(s) updated");
        }

        Command::Compose {
            title,
            content,
            methods,
            groups,
            all,
        } => {
            if !all && groups.is_empty() {
                bail!("Pick at least one --group or use --all");
            }
            for name in &methods {
                match name.parse::<DeliveryMethod>() {
                    Ok(method) => warn_if_unconfigured(&cfg, method),
                    Err(e) => warn!("{e}; it will fail for every recipient"),
                }
            }
            let group_ids = groups
                .iter()
                .map(|name| require_group(&db, name))
                .collect::<Result<Vec<_>>>()?;

            let id = db.create_message(&title, &content, all, &group_ids, &methods)?;
            info!("Created message {id}");
            println!("Created message {id}. Send it with `notifyhub send {id}`.");
        }

        Command::Preview { id } => {
            let message = db.get_message(id)?;
            let targets = db.target_users(&message)?;
            println!("#{} {}", message.id, message.title);
            println!("{}", truncate(&message.content, 200));
            println!("Channels: {}", message.delivery_methods.join(" -> "));
            println!("Recipients: {}", targets.len());
            for user in targets {
                println!("  ext={} {}", user.external_id, user.email);
            }
        }

        Command::Send { id, collect } => {
            let engine = build_engine(&cfg)?;
            let collector = if collect {
                Some(start_collector(&cfg)?)
            } else {
                None
            };

            let result = broadcast_message(&db, &engine, id, &cfg.delivery_log_dir).await;

            if let Some(handle) = collector {
                handle.shutdown().await?;
            }

            let summary = result?;
            let report = summary
                .report_path
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "not written".into());
            println!(
                "Message sent! Delivered: {}/{}. Report: {report}",
                summary.success_count, summary.total
            );
            if summary.log_failures > 0 {
                println!(
                    "Warning: {} delivery log row(s) could not be stored, see the report.",
                    summary.log_failures
                );
            }
        }

        Command::Messages => {
            for m in db.list_messages()? {
                let target = if m.send_to_all {
                    "all".to_string()
                } else {
                    format!("{} group(s)", m.target_groups.len())
                };
                let state = match m.sent_at {
                    Some(at) if m.is_sent => format!("sent {}", at.format("%Y-%m-%d %H:%M")),
                    _ if m.is_sent => "sent".to_string(),
                    _ => "draft".to_string(),
                };
                println!(
                    "{:>4}  {}  {:<32} {:<10} [{}] {state}",
                    m.id,
                    m.created_at.format("%Y-%m-%d %H:%M"),
                    truncate(&m.title, 32),
                    target,
                    m.delivery_methods.join(","),
                );
            }
        }

        Command::Logs { id, status, method } => {
            if let Some(id) = id {
                let message = db.get_message(id)?;
                println!("#{} {}", message.id, message.title);
            }
            let logs = db.query_logs(&LogFilter {
                message_id: id,
                status,
                method,
            })?;
            let ok = logs.iter().filter(|l| l.status == "success").count();
            println!("{ok}/{} delivered", logs.len());
            for log in logs {
                let user = db.get_user(log.user_id)?;
                let who = user
                    .map(|u| format!("ext={}", u.external_id))
                    .unwrap_or_else(|| format!("user {}", log.user_id));
                println!(
                    "  {:>5} msg={:<4} {} {:<12} {:<9} {:<8} {}",
                    log.id,
                    log.message_id,
                    log.sent_at.format("%Y-%m-%d %H:%M:%S"),
                    who,
                    log.delivery_method,
                    log.status,
                    log.error_message
                );
            }
        }

        Command::Collect { once } => {
            let tg = telegram_config(&cfg)?;
            if once {
                let source = BotUpdates::new(tg, cfg.api_timeout())?;
                let mut collector = ChatIdCollector::new(
                    source,
                    db,
                    Duration::from_secs(tg.poll_interval_secs),
                    Duration::from_secs(tg.error_backoff_secs),
                );
                let n = collector.poll_once().await?;
                println!(
                    "Chat id collection finished, {n} user(s) updated. Next update offset: {}",
                    collector.offset()
                );
            } else {
                let handle = start_collector(&cfg)?;
                println!("Collecting chat ids, press Ctrl+C to stop.");
                tokio::signal::ctrl_c().await?;
                println!("Stopping…");
                handle.shutdown().await?;
            }
        }
    }

    Ok(())
}

fn require_group(db: &Db, name: &str) -> Result<i64> {
    db.find_group(name)?
        .ok_or_else(|| anyhow!("Group {name} does not exist"))
}

fn warn_if_unconfigured(cfg: &Config, method: DeliveryMethod) {
    let configured = match method {
        DeliveryMethod::Email => cfg
            .email
            .as_ref()
            .is_some_and(|e| !e.username.is_empty() && !e.password.is_empty()),
        DeliveryMethod::Sms => cfg
            .sms
            .as_ref()
            .is_some_and(|s| !s.api_url.is_empty() && !s.api_key.is_empty()),
        DeliveryMethod::Telegram => cfg
            .telegram
            .as_ref()
            .is_some_and(|t| !t.bot_token.is_empty()),
    };
    if !configured {
        warn!("{method} is not configured; it will fail for every recipient");
    }
}

fn telegram_config(cfg: &Config) -> Result<&TelegramConfig> {
    cfg.telegram
        .as_ref()
        .context("The telegram section is missing from the config")
}

pub fn build_engine(cfg: &Config) -> Result<DeliveryEngine> {
    let timeout = cfg.api_timeout();
    let engine = DeliveryEngine::new(timeout)
        .with_channel(Box::new(EmailChannel::new(cfg.email.as_ref(), timeout)))
        .with_channel(Box::new(SmsChannel::new(cfg.sms.as_ref(), timeout)?))
        .with_channel(Box::new(TelegramChannel::new(cfg.telegram.as_ref(), timeout)?));
    Ok(engine)
}

fn start_collector(cfg: &Config) -> Result<CollectorHandle> {
    let tg = telegram_config(cfg)?;
    let source = BotUpdates::new(tg, cfg.api_timeout())?;
    // Own connection: the loop runs on another task.
    let store = Db::open(cfg)?;
    let collector = ChatIdCollector::new(
        source,
        store,
        Duration::from_secs(tg.poll_interval_secs),
        Duration::from_secs(tg.error_backoff_secs),
    );
    collector.start().inspect_err(|e| error!("Could not start collector: {e:#}"))
}
