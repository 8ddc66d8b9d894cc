//! Guestbook terminal front-end.

use std::sync::Arc;

use clap::{ArgGroup, Parser, Subcommand};
use entities::{timestamp_label, Attendance, Wish, WishStatus};
use guestbook::{
    init_tracing, Backend, Guestbook, GuestbookConfig, RealtimeStatus, RejectReason,
    SubmitOutcome,
};
use wish_store::FileStorage;

const OFFLINE_BANNER: &str = "Mode Offline: Pesan disimpan di perangkat Anda.";
const EMPTY_LIST: &str = "Belum ada ucapan. Jadilah yang pertama!";

#[derive(Debug, Parser)]
#[command(name = "guestbook", version, about = "Wedding guestbook")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print all wishes, newest first
    List,
    /// Leave a wish
    #[command(group(ArgGroup::new("rsvp").args(["attending", "not_attending"])))]
    Sign {
        /// Your name
        name: String,
        /// Your message
        message: String,
        /// You will attend
        #[arg(long)]
        attending: bool,
        /// You will not attend
        #[arg(long)]
        not_attending: bool,
    },
    /// Print wishes as they arrive until interrupted
    Watch,
}

impl Command {
    fn attendance(attending: bool, not_attending: bool) -> Option<Attendance> {
        match (attending, not_attending) {
            (true, _) => Some(Attendance::Attending),
            (_, true) => Some(Attendance::NotAttending),
            _ => None,
        }
    }
}

fn render_wish(wish: &Wish) -> String {
    let mut line = format!("{} ({})", wish.name, timestamp_label(wish.timestamp.as_ref()));
    if let Some(attendance) = wish.attendance {
        line.push_str(&format!(" [{}]", attendance.label()));
    }
    match wish.status {
        WishStatus::Pending => line.push_str(" ..."),
        WishStatus::LocalOnly => line.push_str(" *"),
        WishStatus::Confirmed => {}
    }
    format!("{line}\n  {}", wish.message)
}

async fn print_entries(guestbook: &Guestbook) {
    let state = guestbook.snapshot().await;
    if state.using_fallback {
        println!("{OFFLINE_BANNER}\n");
    }
    if state.entries.is_empty() {
        println!("{EMPTY_LIST}");
        return;
    }
    for wish in &state.entries {
        println!("{}\n", render_wish(wish));
    }
}

async fn sign(
    guestbook: &Guestbook,
    name: String,
    message: String,
    attendance: Option<Attendance>,
) -> anyhow::Result<()> {
    guestbook.set_name(name).await;
    guestbook.set_message(message).await;
    guestbook.set_attendance(attendance).await;

    match guestbook.submit_draft().await {
        SubmitOutcome::Confirmed(wish) => {
            println!("Terima kasih! Ucapan terkirim.\n\n{}", render_wish(&wish));
        }
        SubmitOutcome::Sent => println!("Terima kasih! Ucapan terkirim."),
        SubmitOutcome::StoredLocally(wish) => {
            println!("{OFFLINE_BANNER}\n\n{}", render_wish(&wish));
        }
        SubmitOutcome::Rejected(RejectReason::EmptyName) => anyhow::bail!("name is required"),
        SubmitOutcome::Rejected(RejectReason::EmptyMessage) => {
            anyhow::bail!("message is required")
        }
        SubmitOutcome::Rejected(RejectReason::AlreadySubmitting) => {
            anyhow::bail!("a submission is already in progress")
        }
    }
    Ok(())
}

async fn watch(guestbook: &Guestbook) -> anyhow::Result<()> {
    print_entries(guestbook).await;
    if !guestbook.has_realtime().await {
        tracing::warn!("Realtime updates unavailable, nothing to watch");
        return Ok(());
    }

    let mut seen: Vec<String> = guestbook.entries().await.into_iter().map(|w| w.id).collect();
    let mut changes = guestbook.changes();

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                tracing::info!("Received shutdown signal");
                return Ok(());
            }
            changed = changes.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                let state = guestbook.snapshot().await;
                for wish in state.entries.iter().rev() {
                    if !seen.contains(&wish.id) {
                        seen.push(wish.id.clone());
                        println!("{}\n", render_wish(wish));
                    }
                }
                if state.realtime == RealtimeStatus::Detached {
                    anyhow::bail!("realtime updates stopped");
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration (also reads .env if present)
    let config = GuestbookConfig::load()?;

    // Initialize tracing
    init_tracing(&config.log_level);

    let backend = Backend::from_config(&config);
    tracing::debug!(
        configured = backend.is_configured(),
        data_dir = %config.data_dir.display(),
        "Starting guestbook"
    );

    let storage = Arc::new(FileStorage::new(config.data_dir.clone()));
    let guestbook = Guestbook::new(backend, storage);
    guestbook.initialize().await;

    let result = match cli.command.unwrap_or(Command::List) {
        Command::List => {
            print_entries(&guestbook).await;
            Ok(())
        }
        Command::Sign {
            name,
            message,
            attending,
            not_attending,
        } => {
            let attendance = Command::attendance(attending, not_attending);
            sign(&guestbook, name, message, attendance).await
        }
        Command::Watch => watch(&guestbook).await,
    };

    guestbook.shutdown().await;
    result
}
