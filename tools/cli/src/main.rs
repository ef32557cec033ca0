//! Listshare CLI - inspect a sharing database and run a demo session.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use listshare_common::UserId;
use listshare_remote::MemoryProvider;
use listshare_sync::{
    ActionQueue, AnnotationContent, ContentSharing, MemoryCollections, RemoteIdStore,
    SharingConfig, SharingDatabase, StaticAuth,
};

#[derive(Parser)]
#[command(name = "listshare")]
#[command(about = "Listshare - sharing queue inspection and demo")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Sharing configuration file (JSON).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Sharing database path.
    #[arg(short, long, global = true, default_value = "listshare.db")]
    db: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show queue depth and mapping counts.
    Status,

    /// Print pending sharing actions as JSON.
    Queue,

    /// Print remote id mappings.
    Mappings,

    /// Run a share/unshare session against an in-memory remote store.
    Demo {
        /// Keep the demo's sharing state in --db instead of memory.
        #[arg(long)]
        persist: bool,
    },
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DatabaseStatus {
    queued_actions: u64,
    shared_lists: u64,
    shared_annotations: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_string()));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Status => cmd_status(&cli.db),
        Commands::Queue => cmd_queue(&cli.db),
        Commands::Mappings => cmd_mappings(&cli.db),
        Commands::Demo { persist } => {
            let db = if persist {
                Some(cli.db.as_path())
            } else {
                None
            };
            cmd_demo(db, config).await
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<SharingConfig> {
    let config = match path {
        Some(path) => SharingConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => SharingConfig::default(),
    };
    config.validate().context("Invalid sharing configuration")?;
    Ok(config)
}

fn open_database(path: &Path) -> Result<SharingDatabase> {
    if !path.exists() {
        anyhow::bail!("No sharing database at {}", path.display());
    }
    SharingDatabase::open(path)
        .with_context(|| format!("Failed to open sharing database {}", path.display()))
}

fn database_status(db: &SharingDatabase) -> Result<DatabaseStatus> {
    let queued_actions = ActionQueue::new(db.clone())
        .len()
        .context("Failed to read action queue")?;
    let (shared_lists, shared_annotations) = RemoteIdStore::new(db.clone())
        .counts()
        .context("Failed to read remote id mappings")?;

    Ok(DatabaseStatus {
        queued_actions,
        shared_lists,
        shared_annotations,
    })
}

/// Show queue depth and mapping counts.
fn cmd_status(path: &Path) -> Result<()> {
    let db = open_database(path)?;
    let status = database_status(&db)?;

    println!("Sharing database: {}", path.display());
    println!("  Queued actions: {}", status.queued_actions);
    println!("  Shared lists: {}", status.shared_lists);
    println!("  Shared annotations: {}", status.shared_annotations);

    Ok(())
}

/// Print pending actions, oldest first.
fn cmd_queue(path: &Path) -> Result<()> {
    let db = open_database(path)?;
    let actions = ActionQueue::new(db)
        .all()
        .context("Failed to read action queue")?;

    if actions.is_empty() {
        println!("(queue empty)");
        return Ok(());
    }

    for queued in actions {
        let json = serde_json::json!({
            "id": queued.id,
            "queuedAt": queued.queued_at.to_rfc3339(),
            "action": queued.action,
        });
        println!("{}", serde_json::to_string(&json)?);
    }

    Ok(())
}

/// Print remote id mappings.
fn cmd_mappings(path: &Path) -> Result<()> {
    let db = open_database(path)?;
    let mappings = RemoteIdStore::new(db)
        .list_mappings()
        .context("Failed to read remote id mappings")?;

    if mappings.is_empty() {
        println!("(no mappings)");
        return Ok(());
    }

    println!("{:<12} {:<40} REMOTE ID", "KIND", "LOCAL ID");
    println!("{}", "-".repeat(64));
    for mapping in mappings {
        let kind = serde_json::to_value(mapping.kind)?;
        println!(
            "{:<12} {:<40} {}",
            kind.as_str().unwrap_or_default(),
            mapping.local_id,
            mapping.remote_id
        );
    }

    Ok(())
}

/// Share two pages and an annotation, edit and unshare, then print the remote tables.
async fn cmd_demo(db_path: Option<&Path>, config: SharingConfig) -> Result<()> {
    let db = match db_path {
        Some(path) => SharingDatabase::open(path)
            .with_context(|| format!("Failed to open sharing database {}", path.display()))?,
        None => SharingDatabase::in_memory().context("Failed to create sharing database")?,
    };

    let provider = Arc::new(MemoryProvider::new());
    let store = MemoryCollections::new();
    let user = UserId::new("demo-user").context("Invalid demo user")?;
    let sharing = ContentSharing::new(
        provider.clone(),
        Arc::new(store.clone()),
        Arc::new(StaticAuth::signed_in(user)),
        db,
        config,
    )
    .context("Failed to start sharing session")?;

    sharing.setup().await;
    let feed = sharing.spawn_change_detector();
    store.set_change_feed(feed.clone());
    info!("Demo session {}", sharing.session());

    store.add_page("https://www.eggs.com/foo", "Eggs.com title")?;
    store.add_page("https://www.spam.com/foo", "Spam.com title")?;
    let list = store.create_list("My shared list")?;
    store.insert_page_to_list(list, "https://www.eggs.com/foo")?;
    store.insert_page_to_list(list, "https://www.spam.com/foo")?;

    let remote_list_id = sharing
        .share_list(list)
        .await
        .context("Failed to share list")?;
    println!("Shared list {} as {}", list, remote_list_id);
    sharing
        .share_list_entries(list)
        .await
        .context("Failed to share list entries")?;

    let highlight = store.create_annotation(
        "https://www.eggs.com/foo",
        AnnotationContent::highlight("Eggs are great"),
    )?;
    let note = store.create_annotation(
        "https://www.spam.com/foo",
        AnnotationContent::note("Spam is not"),
    )?;
    sharing
        .share_annotation(&highlight)
        .await
        .context("Failed to share annotation")?;
    sharing
        .share_annotation(&note)
        .await
        .context("Failed to share annotation")?;

    store.rename_list(list, "My renamed list")?;
    store.edit_annotation_comment(&highlight, "Still great")?;
    store.remove_page_from_list(list, "https://www.spam.com/foo")?;
    feed.flush().await.context("Change detector stopped")?;

    sharing
        .unshare_annotation(&note)
        .await
        .context("Failed to unshare annotation")?;
    sharing.wait_for_sync().await.context("Sharing did not settle")?;

    let status = sharing.status()?;
    sharing.shutdown().await;

    println!("{}", serde_json::to_string_pretty(&provider.snapshot())?);
    println!("{}", serde_json::to_string_pretty(&status)?);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use listshare_sync::SharingAction;

    #[test]
    fn test_cli_parses_global_options() {
        let cli = Cli::try_parse_from(["listshare", "status", "--db", "sharing.db"]).unwrap();
        assert_eq!(cli.db, PathBuf::from("sharing.db"));
        assert!(matches!(cli.command, Commands::Status));

        let cli = Cli::try_parse_from(["listshare", "-v", "demo", "--persist"]).unwrap();
        assert!(cli.verbose);
        assert!(matches!(cli.command, Commands::Demo { persist: true }));
    }

    #[test]
    fn test_load_config_rejects_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"chunk_size": 0}"#).unwrap();

        assert!(load_config(Some(&path)).is_err());
        assert_eq!(load_config(None).unwrap().chunk_size, 100);
    }

    #[test]
    fn test_database_status() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sharing.db");
        assert!(open_database(&path).is_err());

        let db = SharingDatabase::open(&path).unwrap();
        ActionQueue::new(db.clone())
            .enqueue(&SharingAction::UnshareAnnotations {
                remote_annotation_ids: vec![],
            })
            .unwrap();

        let status = database_status(&open_database(&path).unwrap()).unwrap();
        assert_eq!(status.queued_actions, 1);
        assert_eq!(status.shared_lists, 0);
    }

    #[tokio::test]
    async fn test_demo_runs_in_memory() {
        cmd_demo(None, SharingConfig::default()).await.unwrap();
    }
}
