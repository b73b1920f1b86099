use std::sync::Arc;

use calsync::config::Config;
use calsync::links::LinkStore;
use calsync::local::MemoryLocalStore;
use calsync::merge::MergedEventSet;
use calsync::sync::{SyncEngine, SyncReport};
use calsync::{db, export, rain_check};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "calsync", about = "Group calendar sync and reconciliation")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one sync and print the merged view
    Sync {
        /// Group to sync
        #[arg(short, long)]
        group: String,
        /// User whose device calendar is synced
        #[arg(short, long)]
        user: String,
        /// Print the merged set as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run one sync and print upcoming events as iCalendar
    Export {
        #[arg(short, long)]
        group: String,
        #[arg(short, long)]
        user: String,
        /// Maximum number of events
        #[arg(short, long, default_value_t = 10)]
        limit: usize,
    },

    /// Add a user to a group
    AddMember {
        #[arg(short, long)]
        group: String,
        #[arg(short, long)]
        user: String,
    },

    /// Remove a user from a group
    RemoveMember {
        #[arg(short, long)]
        group: String,
        #[arg(short, long)]
        user: String,
    },

    /// Rain-check an event, or ask its creator to
    RainCheck {
        /// Event ID
        #[arg(short, long)]
        event: String,
        /// Acting user
        #[arg(short, long)]
        user: String,
        /// Why the event should be called off
        #[arg(short, long)]
        reason: Option<String>,
    },

    /// Approve a pending rain-check request (creator only)
    ApproveRainCheck {
        #[arg(short, long)]
        event: String,
        #[arg(short, long)]
        user: String,
    },

    /// Deny a pending rain-check request (creator only)
    DenyRainCheck {
        #[arg(short, long)]
        event: String,
        #[arg(short, long)]
        user: String,
    },

    /// List remote-to-local links of this device
    ShowLinks,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command {
        Commands::Sync { group, user, json } => cmd_sync(&config, &group, &user, json).await,
        Commands::Export { group, user, limit } => cmd_export(&config, &group, &user, limit).await,
        Commands::AddMember { group, user } => cmd_add_member(&config, &group, &user).await,
        Commands::RemoveMember { group, user } => {
            let pool = db::init_pool(&config.database_url).await?;
            db::groups::remove_member(&pool, &group, &user).await?;
            println!("User '{user}' removed from group '{group}'.");
            Ok(())
        }
        Commands::RainCheck {
            event,
            user,
            reason,
        } => cmd_rain_check(&config, &event, &user, reason.as_deref()).await,
        Commands::ApproveRainCheck { event, user } => {
            let pool = db::init_pool(&config.database_url).await?;
            let event = rain_check::approve(&pool, &event, &user).await?;
            println!("Event '{}' rain-checked.", event.title);
            Ok(())
        }
        Commands::DenyRainCheck { event, user } => {
            let pool = db::init_pool(&config.database_url).await?;
            let event = rain_check::deny(&pool, &event, &user).await?;
            println!("Rain check for '{}' denied; the event stays on.", event.title);
            Ok(())
        }
        Commands::ShowLinks => cmd_show_links(&config).await,
    }
}

/// Build an engine over the configured database, device calendar and link store.
async fn engine(config: &Config) -> anyhow::Result<SyncEngine> {
    let pool = db::init_pool(&config.database_url).await?;
    tracing::info!(database_url = %config.database_url, "Database initialized");

    let local = MemoryLocalStore::open(&config.local_store_path).await?;
    let links = LinkStore::open(&config.link_store_dir).await?;

    Ok(SyncEngine::new(pool, Arc::new(local), Arc::new(links))
        .with_window(config.window_days, config.timezone))
}

async fn cmd_sync(config: &Config, group: &str, user: &str, json: bool) -> anyhow::Result<()> {
    let engine = engine(config).await?;
    let output = engine.sync(group, user).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&output.merged)?);
    } else {
        print_events(&output.merged);
    }
    print_report(&output.report);
    Ok(())
}

async fn cmd_export(config: &Config, group: &str, user: &str, limit: usize) -> anyhow::Result<()> {
    let engine = engine(config).await?;
    let output = engine.sync(group, user).await?;
    print!(
        "{}",
        export::widget_calendar(&output.merged, chrono::Utc::now(), limit)
    );
    Ok(())
}

async fn cmd_add_member(config: &Config, group: &str, user: &str) -> anyhow::Result<()> {
    let pool = db::init_pool(&config.database_url).await?;
    db::groups::add_member(&pool, group, user).await?;
    println!("User '{user}' added to group '{group}'.");
    Ok(())
}

async fn cmd_rain_check(
    config: &Config,
    event_id: &str,
    user: &str,
    reason: Option<&str>,
) -> anyhow::Result<()> {
    let pool = db::init_pool(&config.database_url).await?;
    let event = rain_check::request(&pool, event_id, user, reason).await?;
    match rain_check::state(&event) {
        rain_check::RainCheckState::RainChecked => {
            println!("Event '{}' rain-checked.", event.title)
        }
        _ => println!("Rain check requested; waiting for the creator of '{}'.", event.title),
    }
    Ok(())
}

async fn cmd_show_links(config: &Config) -> anyhow::Result<()> {
    let links = LinkStore::open(&config.link_store_dir).await?;
    let maps = links.snapshot();

    if maps.event_links.is_empty() {
        println!("No links found.");
        return Ok(());
    }

    println!("{:<38} {:<38} Synced", "Event ID", "Local ID");
    println!("{}", "-".repeat(100));
    for (event_id, local_id) in &maps.event_links {
        let synced = maps
            .event_synced_at
            .get(event_id)
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "-".to_string());
        println!("{event_id:<38} {local_id:<38} {synced}");
    }
    Ok(())
}

fn print_events(set: &MergedEventSet) {
    if set.is_empty() {
        println!("No events between {} and {}.", set.window().from, set.window().to);
        return;
    }

    println!("{:<22} {:<22} {:<6} Title", "Start", "End", "Shared");
    println!("{}", "-".repeat(80));
    for display in set.events() {
        let event = &display.event;
        let tz = set.window().tz;
        println!(
            "{:<22} {:<22} {:<6} {}",
            event.start.with_timezone(&tz).format("%Y-%m-%d %H:%M"),
            event.end.with_timezone(&tz).format("%Y-%m-%d %H:%M"),
            display.shared_count,
            event.title
        );
    }
}

fn print_report(report: &SyncReport) {
    let failures: Vec<_> = report.failures().collect();
    println!();
    println!(
        "{} items processed, {} uploaded, {} failed.",
        report.items.len(),
        report.uploaded,
        failures.len()
    );
    for failure in failures {
        println!("  [{}] {}: {:?}", failure.phase, failure.item_id, failure.outcome);
    }
}
