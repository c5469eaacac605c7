//! chat-sync - presence, typing and message sync client
//!
//! Keeps a local view of contacts and conversations consistent with the
//! chat server across REST snapshots and a real-time event channel.

mod api;
mod auth;
mod channel;
mod config;
mod models;
mod notify;
mod store;
mod sync;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "chat-sync")]
#[command(about = "Presence, typing and message sync client for the chat service", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Sign in to the chat server
    Login {
        /// Account email
        #[arg(short, long)]
        email: String,

        /// Account password
        #[arg(short, long, env = "CHAT_SYNC_PASSWORD")]
        password: String,

        /// Sign in again even if a valid session exists
        #[arg(short, long)]
        force: bool,
    },

    /// Log out and clear the stored session
    Logout,

    /// Show current authentication status
    Status,

    /// List contacts with presence and unread counts
    Contacts,

    /// Add a contact by user id
    AddContact {
        contact_id: String,
    },

    /// Remove a contact
    RemoveContact {
        contact_id: String,
    },

    /// Read a conversation (marks it read)
    Read {
        /// Contact id (from `contacts` output)
        contact_id: String,

        /// Maximum number of messages to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Send a message
    Send {
        /// Contact id (from `contacts` output)
        #[arg(short, long)]
        to: String,

        /// Message content
        message: String,
    },

    /// Delete one of your messages
    Delete {
        message_id: String,
    },

    /// Stay connected and print presence, typing and message updates
    Watch {
        /// Open this conversation (incoming messages are marked read)
        #[arg(short, long)]
        focus: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    match cli.command {
        Commands::Login {
            email,
            password,
            force,
        } => {
            tracing::info!("Signing in as {}...", email);
            auth::login(&email, &password, force).await?;
        }
        Commands::Logout => {
            auth::logout().await?;
        }
        Commands::Status => {
            auth::status().await?;
        }
        Commands::Contacts => {
            api::list_contacts().await?;
        }
        Commands::AddContact { contact_id } => {
            api::add_contact(&contact_id).await?;
        }
        Commands::RemoveContact { contact_id } => {
            api::remove_contact(&contact_id).await?;
        }
        Commands::Read { contact_id, limit } => {
            api::read_messages(&contact_id, limit).await?;
        }
        Commands::Send { to, message } => {
            tracing::info!("Sending message...");
            api::send_message(&to, &message).await?;
        }
        Commands::Delete { message_id } => {
            api::delete_message(&message_id).await?;
        }
        Commands::Watch { focus } => {
            sync::watch::run(focus).await?;
        }
    }

    Ok(())
}
