//! FieldSync CLI - inspect and repair a device's offline store.
//!
//! Reads the same SQLite database the engine writes, so queued uploads,
//! visits and mirrored activities can be checked from a shell.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use fieldsync_common::{format_duration, format_file_size, AgentId, ImageFile};
use fieldsync_storage::{LocalStore, PunchRecord, TripRecord};
use fieldsync_sync::activity::is_previous_day;
use fieldsync_sync::{calculate_distance, compress_blocking, ActivityRecord, EngineConfig};

#[derive(Parser)]
#[command(name = "fieldsync")]
#[command(about = "FieldSync - offline store diagnostics")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show an agent's mirrored activities and queue sizes.
    Status {
        /// Path to the device database.
        #[arg(short, long)]
        db: PathBuf,

        /// Agent identifier.
        #[arg(short, long)]
        agent: String,
    },

    /// List pending image uploads.
    Pending {
        /// Path to the device database.
        #[arg(short, long)]
        db: PathBuf,
    },

    /// Delete a pending image upload.
    Discard {
        /// Path to the device database.
        #[arg(short, long)]
        db: PathBuf,

        /// Local id of the pending upload.
        #[arg(short, long)]
        id: i64,
    },

    /// Run the compression pipeline on an image file.
    Compress {
        /// Source image.
        input: PathBuf,

        /// Destination for the JPEG output.
        output: PathBuf,

        /// Maximum output width in pixels.
        #[arg(long)]
        max_width: Option<u32>,

        /// JPEG quality between 0 and 1.
        #[arg(long)]
        quality: Option<f32>,

        /// Engine configuration supplying the defaults.
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Great-circle distance in km between two coordinates.
    Distance {
        #[arg(allow_negative_numbers = true)]
        lat1: f64,
        #[arg(allow_negative_numbers = true)]
        lon1: f64,
        #[arg(allow_negative_numbers = true)]
        lat2: f64,
        #[arg(allow_negative_numbers = true)]
        lon2: f64,
    },

    /// Write the default engine configuration as JSON.
    InitConfig {
        /// Output file.
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging; RUST_LOG overrides the flag.
    let level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Status { db, agent } => cmd_status(&db, &agent).await,

        Commands::Pending { db } => cmd_pending(&db).await,

        Commands::Discard { db, id } => cmd_discard(&db, id).await,

        Commands::Compress {
            input,
            output,
            max_width,
            quality,
            config,
        } => cmd_compress(&input, &output, max_width, quality, config.as_deref()),

        Commands::Distance {
            lat1,
            lon1,
            lat2,
            lon2,
        } => {
            println!("{:.2} km", calculate_distance(lat1, lon1, lat2, lon2));
            Ok(())
        }

        Commands::InitConfig { path } => {
            EngineConfig::default()
                .save(&path)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("Wrote default configuration to {}", path.display());
            Ok(())
        }
    }
}

fn open_store(db: &Path) -> Result<LocalStore> {
    debug!("Opening store at {}", db.display());
    LocalStore::open(db).with_context(|| format!("Failed to open store {}", db.display()))
}

/// Print one mirrored activity.
fn print_activity<R: ActivityRecord>(label: &str, record: Option<R>) {
    let Some(record) = record else {
        println!("  {}: none", label);
        return;
    };

    let now = chrono::Utc::now();
    let elapsed = (now - record.started_at()).num_milliseconds();
    println!(
        "  {}: {} since {} ({})",
        label,
        record.status().as_str(),
        record.started_at().to_rfc3339(),
        format_duration(elapsed)
    );
    if let Some(id) = record.remote_id() {
        println!("    Ledger id: {}", id);
    }
    if record.pending_sync() {
        println!("    Not yet synced to the ledger");
    }
    if record.is_active() && is_previous_day(record.started_at(), now) {
        println!("    WARNING: started on a previous day, please end it");
    }
}

/// Show an agent's mirrored activities and queue sizes.
async fn cmd_status(db: &Path, agent: &str) -> Result<()> {
    let agent_id = AgentId::new(agent).context("Invalid agent id")?;
    let store = open_store(db)?;

    println!("Agent {}", agent_id);
    print_activity("Trip", store.load_active::<TripRecord>(&agent_id).await);
    print_activity("Punch", store.load_active::<PunchRecord>(&agent_id).await);

    let trips: Vec<TripRecord> = store
        .pending_completions(&agent_id)
        .await
        .context("Failed to read queued trip completions")?;
    let punches: Vec<PunchRecord> = store
        .pending_completions(&agent_id)
        .await
        .context("Failed to read queued punch completions")?;
    if !trips.is_empty() || !punches.is_empty() {
        println!(
            "  Ended offline, not yet synced: {} trip(s), {} punch(es)",
            trips.len(),
            punches.len()
        );
    }

    let uploads = store
        .pending_uploads()
        .await
        .context("Failed to read pending uploads")?;
    let mine = store
        .pending_uploads_for(&agent_id)
        .await
        .context("Failed to read pending uploads")?
        .len();
    let visits = store
        .pending_visits(&agent_id)
        .await
        .context("Failed to read pending visits")?;

    println!("  Pending uploads: {} ({} on device)", mine, uploads.len());
    println!("  Pending visits: {}", visits.len());
    Ok(())
}

/// List pending image uploads.
async fn cmd_pending(db: &Path) -> Result<()> {
    let store = open_store(db)?;
    let uploads = store
        .pending_uploads()
        .await
        .context("Failed to read pending uploads")?;

    if uploads.is_empty() {
        println!("No pending uploads");
        return Ok(());
    }

    for upload in &uploads {
        println!(
            "#{:<5} {:<30} {:>10}  agent={}  retries={}  queued={}",
            upload.id,
            upload.file_name,
            format_file_size(upload.file_size),
            upload.agent_id,
            upload.retry_count,
            upload.created_at.format("%Y-%m-%d %H:%M:%S")
        );
        if let Some(err) = &upload.last_error {
            println!("       last error: {}", err);
        }
    }
    println!("{} pending upload(s)", uploads.len());
    Ok(())
}

/// Delete a pending image upload.
async fn cmd_discard(db: &Path, id: i64) -> Result<()> {
    let store = open_store(db)?;
    let record = store
        .pending_upload(id)
        .await
        .context("Failed to read pending upload")?
        .with_context(|| format!("No pending upload with id {}", id))?;

    store
        .delete_pending_upload(id)
        .await
        .context("Failed to delete pending upload")?;
    info!("Discarded pending upload #{}", id);
    println!("Discarded #{} ({})", id, record.file_name);
    Ok(())
}

/// Run the compression pipeline on an image file.
fn cmd_compress(
    input: &Path,
    output: &Path,
    max_width: Option<u32>,
    quality: Option<f32>,
    config: Option<&Path>,
) -> Result<()> {
    let settings = match config {
        Some(path) => {
            EngineConfig::load(path)
                .with_context(|| format!("Failed to load {}", path.display()))?
                .compression
        }
        None => EngineConfig::default().compression,
    };

    let data = std::fs::read(input).with_context(|| format!("Failed to read {}", input.display()))?;
    let name = input
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "image".to_string());
    let file = ImageFile::new(name, mime_for(input), data);

    let compressed = compress_blocking(
        &file,
        max_width.unwrap_or(settings.max_width_px),
        quality.unwrap_or(settings.quality),
    )
    .context("Compression failed")?;

    std::fs::write(output, &compressed.data)
        .with_context(|| format!("Failed to write {}", output.display()))?;
    println!(
        "{} -> {} ({} -> {})",
        input.display(),
        output.display(),
        format_file_size(file.size()),
        format_file_size(compressed.size())
    );
    Ok(())
}

fn mime_for(path: &Path) -> &'static str {
    match path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .as_deref()
    {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_negative_coordinates() {
        let cli = Cli::try_parse_from(["fieldsync", "distance", "-33.86", "151.2", "-37.81", "144.96"])
            .unwrap();
        assert!(matches!(cli.command, Commands::Distance { lat1, .. } if lat1 == -33.86));
    }

    #[test]
    fn test_mime_for() {
        assert_eq!(mime_for(Path::new("a.PNG")), "image/png");
        assert_eq!(mime_for(Path::new("b.jpeg")), "image/jpeg");
        assert_eq!(mime_for(Path::new("c")), "application/octet-stream");
    }
}
