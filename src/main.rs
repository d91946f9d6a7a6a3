mod app;
mod broadcast;
mod collector;
mod config;
mod db;
mod delivery;
mod email;
mod import;
mod logger;
mod models;
mod sms;
mod telegram;
mod utils;

use std::path::PathBuf;

use models::DeliveryStatus;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(name = "notifyhub")]
#[command(about = "Broadcast messages to grouped users over email, SMS and Telegram")]
pub struct Cli {
    /// Use this config file instead of the XDG one
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Echo info-level logs to the console
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Import users from a JSON array of {id, email, phone, telegram, group}
    Import { file: PathBuf },

    /// Export all users in the import format
    Export { file: PathBuf },

    /// List groups with their active user counts
    Groups,

    /// Create, rename or delete a group
    Group {
        #[command(subcommand)]
        action: GroupAction,
    },

    /// List users, optionally only one group or those matching a search
    Users {
        #[arg(long)]
        group: Option<String>,

        /// Case-insensitive match on email, phone or Telegram handle
        #[arg(long)]
        search: Option<String>,
    },

    /// Create, edit or delete a single user
    User {
        #[command(subcommand)]
        action: UserAction,
    },

    /// Apply an action to several users at once
    Bulk {
        #[arg(value_enum)]
        action: BulkAction,

        /// Comma-separated user ids
        #[arg(long)]
        ids: String,

        /// Target group for change-group
        #[arg(long)]
        group: Option<String>,
    },

    /// Create a message; channels are tried in the order given
    Compose {
        #[arg(long)]
        title: String,

        #[arg(long)]
        content: String,

        /// e.g. telegram,email,sms
        #[arg(long, value_delimiter = ',', required = true)]
        methods: Vec<String>,

        /// Target group name (repeatable)
        #[arg(long = "group")]
        groups: Vec<String>,

        /// Send to every active user
        #[arg(long, conflicts_with = "groups")]
        all: bool,
    },

    /// Show who a message would reach
    Preview { id: i64 },

    /// Deliver a message to all its recipients
    Send {
        id: i64,

        /// Reconcile Telegram chat ids in the background while sending
        #[arg(long)]
        collect: bool,
    },

    /// List messages, newest first
    Messages,

    /// Show delivery results, of one message or of all of them
    Logs {
        id: Option<i64>,

        /// success or failed
        #[arg(long)]
        status: Option<DeliveryStatus>,

        /// Channel that delivered, or "none"
        #[arg(long)]
        method: Option<String>,
    },

    /// Poll the bot for new chats and store their chat ids
    Collect {
        /// Process a single batch and exit
        #[arg(long)]
        once: bool,
    },
}

#[derive(Subcommand)]
pub enum GroupAction {
    Add {
        name: String,

        #[arg(long, default_value = "")]
        description: String,
    },

    Edit {
        name: String,

        /// New name
        #[arg(long)]
        rename: Option<String>,

        #[arg(long)]
        description: Option<String>,
    },

    /// Delete a group and every user in it
    Rm { name: String },
}

#[derive(Subcommand)]
pub enum UserAction {
    Add {
        /// External id, as used in import files
        external_id: i64,

        #[arg(long)]
        group: String,

        #[arg(long, default_value = "")]
        email: String,

        #[arg(long, default_value = "")]
        phone: String,

        #[arg(long, default_value = "")]
        telegram: String,
    },

    Edit {
        id: i64,

        #[arg(long)]
        group: Option<String>,

        #[arg(long)]
        email: Option<String>,

        #[arg(long)]
        phone: Option<String>,

        #[arg(long)]
        telegram: Option<String>,

        #[arg(long)]
        active: Option<bool>,
    },

    Rm { id: i64 },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum BulkAction {
    Activate,
    Deactivate,
    Delete,
    ChangeGroup,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    app::run(cli).await
}
