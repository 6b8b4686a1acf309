//! dutymail operator CLI
//!
//! Small command-line surface over the engine for poking the shared
//! departmental mailbox from a shell: search, voicemail listing, duty
//! counters, flag/move fixes, and keep-alive sweeps. The dashboard itself
//! consumes the library crate directly.

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use dutymail::config::EngineConfig;
use dutymail::engine::MailEngine;
use dutymail::imap::ImapConnector;
use dutymail::keepalive::KeepAliveSweeper;
use dutymail::models::SearchRange;
use dutymail::pool::ConnectionPool;

#[derive(Parser)]
#[command(name = "dutymail", about = "Daily-duties mailbox engine CLI")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Search one mailbox, or the whole roster when --mailbox is omitted
    Search {
        /// Mailbox to search; omit to fan out across the configured roster
        #[arg(long)]
        mailbox: Option<String>,
        /// Free-text filter; omit to list everything
        #[arg(long)]
        query: Option<String>,
        /// First result index (0-based)
        #[arg(long, default_value_t = 0)]
        start: usize,
        /// Number of results per page
        #[arg(long, default_value_t = 25)]
        count: usize,
    },
    /// List voicemail messages, newest first
    Voicemails,
    /// Print the dashboard duty counters
    Counts,
    /// Mark a message read
    MarkRead { mailbox: String, uid: u32 },
    /// Mark a message unread
    MarkUnread { mailbox: String, uid: u32 },
    /// Mark a message replied-to
    MarkReplied { mailbox: String, uid: u32 },
    /// Permanently delete one voicemail message
    DeleteVoicemail { uid: u32 },
    /// Move a message to another mailbox
    Move {
        mailbox: String,
        uid: u32,
        destination: String,
    },
    /// Probe idle pooled connections once
    Sweep,
    /// Run the keep-alive sweeper and print duty counters until Ctrl-C
    Watch {
        /// Seconds between counter refreshes
        #[arg(long, default_value_t = 120)]
        interval: u64,
    },
}

/// Render an optional counter the way the dashboard does: "?" on failure
fn count_or_placeholder(count: Option<u32>) -> String {
    count.map_or_else(|| "?".to_owned(), |n| n.to_string())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Arc::new(EngineConfig::load_from_env()?);
    let connector = Arc::new(ImapConnector::new(Arc::clone(&config)));
    let pool = Arc::new(ConnectionPool::new(
        connector,
        config.max_connections,
        config.exhaustion_policy,
    ));
    let engine = MailEngine::new(Arc::clone(&config), Arc::clone(&pool));

    match cli.command {
        Command::Search {
            mailbox,
            query,
            start,
            count,
        } => {
            let count = count.max(1);
            let range = SearchRange {
                start,
                end: start + count - 1,
            };
            let (messages, total) = engine
                .get_messages(mailbox.as_deref(), query.as_deref(), range)
                .await?;
            let output = serde_json::json!({ "total": total, "messages": messages });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        Command::Voicemails => {
            let voicemails = engine.get_all_voicemail_messages().await?;
            println!("{}", serde_json::to_string_pretty(&voicemails)?);
        }
        Command::Counts => {
            let counts = engine.duty_counts().await;
            println!("email unread: {}", count_or_placeholder(counts.email_unread));
            println!("voicemail:    {}", count_or_placeholder(counts.voicemail_total));
        }
        Command::MarkRead { mailbox, uid } => {
            engine.mark_read(&mailbox, uid).await?;
            println!("marked {mailbox}/{uid} read");
        }
        Command::MarkUnread { mailbox, uid } => {
            engine.mark_unread(&mailbox, uid).await?;
            println!("marked {mailbox}/{uid} unread");
        }
        Command::MarkReplied { mailbox, uid } => {
            engine.mark_replied(&mailbox, uid).await?;
            println!("marked {mailbox}/{uid} replied");
        }
        Command::DeleteVoicemail { uid } => {
            engine.delete_voicemail_message(uid).await?;
            println!("deleted voicemail {uid}");
        }
        Command::Move {
            mailbox,
            uid,
            destination,
        } => {
            engine.move_message(&mailbox, uid, &destination).await?;
            println!("moved {mailbox}/{uid} to {destination}");
        }
        Command::Sweep => {
            pool.sweep_idle().await;
            println!("swept {} pooled connection(s)", pool.size());
        }
        Command::Watch { interval } => {
            let sweeper = KeepAliveSweeper::spawn(
                Arc::clone(&pool),
                Duration::from_secs(config.keepalive_secs),
            );
            loop {
                let counts = engine.duty_counts().await;
                println!(
                    "email unread: {}  voicemail: {}",
                    count_or_placeholder(counts.email_unread),
                    count_or_placeholder(counts.voicemail_total)
                );
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(interval.max(1))) => {}
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
            sweeper.shutdown().await;
            pool.shutdown().await;
        }
    }

    Ok(())
}
