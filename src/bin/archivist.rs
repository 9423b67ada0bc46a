//! # Archivist CLI - Backup lifecycle from the command line
//!
//! A thin host around the archivist library.
//!
//! ## Features
//! - Write a backup configuration file
//! - Create, list, inspect, verify and delete backups
//! - Restore a backup into any directory
//! - Apply retention on demand
//! - Run backups on a recurring schedule until interrupted
//!
//! ## Usage
//! ```bash
//! # Describe what to back up
//! archivist init --source ./project --location ./backups -o backup.json
//!
//! # Create a backup
//! archivist -c backup.json backup --progress
//!
//! # List backups
//! archivist -c backup.json list
//!
//! # Restore one
//! archivist -c backup.json restore backup_20240101_120000 ./restored
//!
//! # Back up every six hours
//! archivist -c backup.json schedule --every 6h
//! ```

use anyhow::{bail, Context};
use archivist::{
    BackupConfiguration, BackupManager, BackupOptions, BackupRecord, BackupStatus,
    CompressionType, ProgressInfo, RestoreOptions, Retention, Scheduler,
};
use clap::{Parser, Subcommand};
use colored::*;
use humantime::format_duration;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Archivist CLI - Compressed, verified, expiring backups
#[derive(Parser)]
#[command(name = "archivist")]
#[command(version)]
#[command(about = "Create, verify, restore and expire compressed backups")]
#[command(long_about = None)]
struct Cli {
    /// Backup configuration file (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Backup location (defaults to the configuration's)
    #[arg(short, long, global = true)]
    location: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a configuration file
    Init {
        /// Source path to back up (repeatable)
        #[arg(short, long = "source", required = true)]
        sources: Vec<PathBuf>,

        /// Artifact format: none, zip, tar, tar.gz, tar.bz2
        #[arg(long, default_value = "tar.gz")]
        compression: CompressionType,

        /// Days to keep completed backups, or "indefinite"
        #[arg(long, default_value = "30", value_parser = parse_retention)]
        retention: Retention,

        /// Skip files larger than this many bytes
        #[arg(long)]
        max_file_size: Option<u64>,

        /// Extra exclude patterns
        #[arg(short, long)]
        exclude: Vec<String>,

        /// Include dotfiles
        #[arg(long)]
        hidden: bool,

        /// Output file
        #[arg(short, long, default_value = "backup.json")]
        output: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Create a backup
    Backup {
        /// Backup id (defaults to a timestamp)
        #[arg(long)]
        id: Option<String>,

        /// Show progress
        #[arg(long)]
        progress: bool,
    },

    /// List backups
    #[command(alias = "ls")]
    List {
        /// Show detailed info
        #[arg(short, long)]
        detailed: bool,

        /// Limit results (newest first)
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },

    /// Show one backup's record
    Status {
        /// Backup ID
        backup: String,

        /// Print the raw JSON record
        #[arg(long)]
        json: bool,
    },

    /// Restore a backup
    #[command(alias = "rs")]
    Restore {
        /// Backup ID
        backup: String,

        /// Target directory
        target: PathBuf,

        /// Replace existing files
        #[arg(long)]
        overwrite: bool,

        /// Report without writing
        #[arg(long)]
        dry_run: bool,
    },

    /// Verify integrity
    Verify {
        /// Backup to verify
        backup: Option<String>,

        /// Verify all completed backups
        #[arg(long)]
        all: bool,
    },

    /// Delete expired backups of the configuration
    Sweep {
        /// Only show what would be deleted
        #[arg(long)]
        dry_run: bool,
    },

    /// Delete one backup
    Delete {
        /// Backup ID
        backup: String,
    },

    /// Show registry statistics
    Stats,

    /// Run backups on a cadence until interrupted
    Schedule {
        /// hourly, daily, weekly or a duration such as "15m"
        #[arg(long, default_value = "daily")]
        every: String,
    },
}

fn main() {
    let cli = Cli::parse();

    // Set up logging
    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    // Disable colors if needed
    if std::env::var("NO_COLOR").is_ok() {
        colored::control::set_override(false);
    }

    // Run command
    if let Err(e) = run(cli) {
        eprintln!("{}: {:#}", "Error".red().bold(), e);
        std::process::exit(1);
    }
}

/// Main command runner
fn run(cli: Cli) -> anyhow::Result<()> {
    let ctx = Globals {
        config_path: cli.config,
        location: cli.location,
    };

    match cli.command {
        Commands::Init {
            sources,
            compression,
            retention,
            max_file_size,
            exclude,
            hidden,
            output,
            force,
        } => cmd_init(
            &ctx,
            InitArgs {
                sources,
                compression,
                retention,
                max_file_size,
                exclude,
                hidden,
                output,
                force,
            },
        ),
        Commands::Backup { id, progress } => cmd_backup(&ctx, id, progress),
        Commands::List { detailed, limit } => cmd_list(&ctx, detailed, limit),
        Commands::Status { backup, json } => cmd_status(&ctx, &backup, json),
        Commands::Restore {
            backup,
            target,
            overwrite,
            dry_run,
        } => cmd_restore(&ctx, &backup, target, overwrite, dry_run),
        Commands::Verify { backup, all } => cmd_verify(&ctx, backup, all),
        Commands::Sweep { dry_run } => cmd_sweep(&ctx, dry_run),
        Commands::Delete { backup } => cmd_delete(&ctx, &backup),
        Commands::Stats => cmd_stats(&ctx),
        Commands::Schedule { every } => cmd_schedule(&ctx, &every),
    }
}

/// Global options shared by every command
struct Globals {
    config_path: Option<PathBuf>,
    location: Option<PathBuf>,
}

impl Globals {
    fn config(&self) -> anyhow::Result<BackupConfiguration> {
        let Some(path) = &self.config_path else {
            bail!("this command needs a configuration file (--config)");
        };
        let mut config = BackupConfiguration::from_json_file(path)
            .with_context(|| format!("cannot load configuration {}", path.display()))?;
        if let Some(location) = &self.location {
            config.backup_location = location.clone();
        }
        Ok(config)
    }

    fn manager(&self) -> anyhow::Result<BackupManager> {
        let location = match (&self.location, &self.config_path) {
            (Some(location), _) => location.clone(),
            (None, Some(_)) => self.config()?.backup_location,
            (None, None) => bail!("pass --location or --config to select a backup location"),
        };
        BackupManager::open(&location)
            .with_context(|| format!("cannot open backup location {}", location.display()))
    }
}

struct InitArgs {
    sources: Vec<PathBuf>,
    compression: CompressionType,
    retention: Retention,
    max_file_size: Option<u64>,
    exclude: Vec<String>,
    hidden: bool,
    output: PathBuf,
    force: bool,
}

/// Write a configuration file
fn cmd_init(ctx: &Globals, args: InitArgs) -> anyhow::Result<()> {
    if args.output.exists() && !args.force {
        bail!(
            "{} already exists. Use --force to overwrite it.",
            args.output.display()
        );
    }
    let Some(location) = &ctx.location else {
        bail!("init needs a backup location (--location)");
    };

    let mut builder = BackupConfiguration::builder()
        .source_paths(args.sources)
        .backup_location(location)
        .compression(args.compression)
        .retention(args.retention)
        .include_hidden(args.hidden);
    if let Some(size) = args.max_file_size {
        builder = builder.max_file_size(size);
    }
    for pattern in args.exclude {
        builder = builder.exclude_pattern(pattern);
    }
    let config = builder.build()?;
    config.save_json(&args.output)?;

    println!("{} Wrote {}", "✓".green().bold(), args.output.display().to_string().cyan());
    println!("  Sources: {}", config.source_paths.len().to_string().cyan());
    println!("  Location: {}", config.backup_location.display().to_string().cyan());
    println!("  Format: {}", config.compression_type.to_string().cyan());
    println!("  Retention: {}", config.retention_days.to_string().cyan());
    println!("\nNext steps:");
    println!(
        "  - Create your first backup: {}",
        format!("archivist -c {} backup", args.output.display()).yellow()
    );
    Ok(())
}

/// Create a backup
fn cmd_backup(ctx: &Globals, id: Option<String>, show_progress: bool) -> anyhow::Result<()> {
    let config = ctx.config()?;
    let manager = BackupManager::for_config(&config)?;

    println!("{}", "Creating backup...".blue().bold());

    let progress = if show_progress {
        let pb = ProgressBar::new_spinner();
        pb.set_style(ProgressStyle::default_spinner().template("{spinner:.green} {msg}")?);
        pb.enable_steady_tick(Duration::from_millis(100));
        pb.set_message("Collecting files...");
        Some(pb)
    } else {
        None
    };

    let options = BackupOptions {
        backup_id: id,
        progress_callback: progress.clone().map(|pb| {
            Arc::new(move |info: ProgressInfo| {
                let pct = info.percentage().unwrap_or(0.0);
                pb.set_message(format!(
                    "{} {:.0}% {}",
                    info.operation,
                    pct,
                    info.current_item.unwrap_or_default()
                ));
            }) as archivist::ProgressCallback
        }),
        ..Default::default()
    };

    let result = manager.create_backup_with_options(&config, options);
    if let Some(pb) = progress {
        pb.finish_and_clear();
    }
    let record = result?;

    println!(
        "{} Created backup {}",
        "✓".green().bold(),
        record.backup_id.yellow().bold()
    );
    println!("  Files: {}", record.total_files.to_string().cyan());
    println!(
        "  Size: {} -> {}",
        archivist::utils::format_bytes(record.total_size_bytes).cyan(),
        archivist::utils::format_bytes(record.artifact_size_bytes).cyan()
    );
    println!(
        "  Time: {}",
        format_duration(Duration::from_millis((record.duration_seconds * 1000.0) as u64))
            .to_string()
            .cyan()
    );
    if !record.skipped_files.is_empty() {
        println!("\n{}", format!("Skipped {} files:", record.skipped_files.len()).yellow().bold());
        for skipped in record.skipped_files.iter().take(20) {
            println!("  - {} ({})", skipped.path.display(), skipped.reason.to_string().yellow());
        }
    }
    Ok(())
}

/// List backups
fn cmd_list(ctx: &Globals, detailed: bool, limit: Option<usize>) -> anyhow::Result<()> {
    let manager = ctx.manager()?;
    let mut backups = manager.list_backups()?;

    if backups.is_empty() {
        println!("{}", "No backups found.".yellow());
        return Ok(());
    }

    println!("{}", "Backups:".blue().bold());
    println!();

    backups.reverse();
    let display_count = limit.unwrap_or(backups.len()).min(backups.len());
    for record in backups.iter().take(display_count) {
        print!("{} ", status_marker(record.status));
        print!("{} ", record.backup_id.yellow().bold());
        print!(
            "{} ",
            record.timestamp.format("%Y-%m-%d %H:%M:%S").to_string().dimmed()
        );
        print!("{} ", record.status.to_string().cyan());
        println!(
            "{}",
            archivist::utils::format_bytes(record.artifact_size_bytes).dimmed()
        );

        if detailed {
            println!(
                "    Files: {} | Source size: {} | Format: {} | Skipped: {}",
                record.total_files.to_string().dimmed(),
                archivist::utils::format_bytes(record.total_size_bytes).dimmed(),
                record.compression_type.to_string().dimmed(),
                record.skipped_files.len().to_string().dimmed()
            );
            if let Some(message) = &record.error_message {
                println!("    Error: {}", message.red());
            }
            println!();
        }
    }

    if display_count < backups.len() {
        println!(
            "\n{}",
            format!("Showing {} of {} backups", display_count, backups.len()).dimmed()
        );
    }
    Ok(())
}

/// Show one backup's record
fn cmd_status(ctx: &Globals, backup_id: &str, json: bool) -> anyhow::Result<()> {
    let manager = ctx.manager()?;
    let record = manager.get_backup_status(backup_id)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&record)?);
        return Ok(());
    }

    print_record(&record);
    Ok(())
}

/// Restore a backup
fn cmd_restore(
    ctx: &Globals,
    backup_id: &str,
    target: PathBuf,
    overwrite: bool,
    dry_run: bool,
) -> anyhow::Result<()> {
    let manager = ctx.manager()?;

    println!(
        "{} {} into {}",
        if dry_run { "Planning restore of" } else { "Restoring" }.blue().bold(),
        backup_id.yellow(),
        target.display().to_string().cyan()
    );

    let options = RestoreOptions {
        overwrite_existing: overwrite,
        dry_run,
        ..Default::default()
    };
    let result = manager.restore_backup_with_options(backup_id, &target, &options)?;

    println!(
        "{} {}",
        "✓".green().bold(),
        if dry_run { "Dry run complete" } else { "Restoration complete" }
    );
    println!("  Files restored: {}", result.restored_files.len().to_string().cyan());
    println!("  Files skipped: {}", result.skipped_files.len().to_string().yellow());
    println!(
        "  Bytes written: {}",
        archivist::utils::format_bytes(result.bytes_restored).cyan()
    );
    println!(
        "  Time: {}",
        format_duration(Duration::from_millis(result.duration_ms)).to_string().cyan()
    );

    if !result.skipped_files.is_empty() && !overwrite {
        println!("\n{}", "Existing files were kept; use --overwrite to replace them.".dimmed());
    }
    if let Some(error) = &result.error {
        println!("\n{} {}", "Warning:".yellow().bold(), error.yellow());
    }
    Ok(())
}

/// Verify one or all backups
fn cmd_verify(ctx: &Globals, backup_id: Option<String>, all: bool) -> anyhow::Result<()> {
    let manager = ctx.manager()?;

    let ids: Vec<String> = match (backup_id, all) {
        (Some(id), false) => vec![id],
        (None, true) => manager
            .list_backups()?
            .into_iter()
            .filter(|r| r.status == BackupStatus::Completed)
            .map(|r| r.backup_id)
            .collect(),
        _ => bail!("pass either a backup id or --all"),
    };

    let mut failures = 0;
    for id in &ids {
        let result = manager.verify_backup(id)?;
        if result.ok {
            println!("{} {} {}", "✓".green().bold(), id.yellow(), result.summary().dimmed());
        } else {
            failures += 1;
            println!("{} {} {}", "✗".red().bold(), id.yellow(), result.summary().red());
        }
    }

    if failures > 0 {
        bail!("{} of {} backups failed verification", failures, ids.len());
    }
    println!("\n{} {} backups verified", "✓".green().bold(), ids.len());
    Ok(())
}

/// Apply retention for the configuration
fn cmd_sweep(ctx: &Globals, dry_run: bool) -> anyhow::Result<()> {
    let config = ctx.config()?;
    let manager = BackupManager::for_config(&config)?;

    if dry_run {
        let expired = manager.preview_retention(&config)?;
        println!(
            "{} {} backups would be deleted ({})",
            "Dry run:".blue().bold(),
            expired.len().to_string().yellow(),
            config.retention_days
        );
        for record in &expired {
            println!(
                "  - {} {}",
                record.backup_id.yellow(),
                record.timestamp.format("%Y-%m-%d %H:%M").to_string().dimmed()
            );
        }
        return Ok(());
    }

    let report = manager.sweep_retention(&config)?;
    println!("{} Retention sweep complete", "✓".green().bold());
    println!("  Deleted: {}", report.deleted.len().to_string().cyan());
    println!("  Orphans removed: {}", report.orphans_removed.len().to_string().cyan());
    println!("  In use, kept: {}", report.skipped_in_use.len().to_string().yellow());
    println!(
        "  Reclaimed: {}",
        archivist::utils::format_bytes(report.bytes_reclaimed).cyan()
    );

    if !report.failures.is_empty() {
        println!("\n{}", "Failures:".red().bold());
        for failure in &report.failures {
            println!("  - {}: {}", failure.backup_id.yellow(), failure.error.red());
        }
    }
    Ok(())
}

/// Delete one backup
fn cmd_delete(ctx: &Globals, backup_id: &str) -> anyhow::Result<()> {
    let manager = ctx.manager()?;
    let record = manager.delete_backup(backup_id)?;
    println!(
        "{} Deleted {} ({})",
        "✓".green().bold(),
        record.backup_id.yellow(),
        record.status
    );
    Ok(())
}

/// Show registry statistics
fn cmd_stats(ctx: &Globals) -> anyhow::Result<()> {
    let manager = ctx.manager()?;
    let stats = manager.stats();

    println!("{}", "Backup location:".blue().bold());
    println!("  Path: {}", manager.location().display().to_string().cyan());
    println!("  Backups: {}", stats.total_backups.to_string().cyan());
    println!(
        "  Completed: {} | Failed: {} | Corrupted: {} | Running: {}",
        stats.completed.to_string().green(),
        stats.failed.to_string().red(),
        stats.corrupted.to_string().red(),
        (stats.pending + stats.in_progress).to_string().yellow()
    );
    println!(
        "  Stored: {} of {} source data",
        archivist::utils::format_bytes(stats.total_artifact_bytes).cyan(),
        archivist::utils::format_bytes(stats.total_source_bytes).cyan()
    );
    if let (Some(oldest), Some(newest)) = (stats.oldest, stats.newest) {
        println!(
            "  Range: {} .. {}",
            oldest.format("%Y-%m-%d %H:%M").to_string().dimmed(),
            newest.format("%Y-%m-%d %H:%M").to_string().dimmed()
        );
    }
    Ok(())
}

/// Run backups on a cadence until Ctrl-C
fn cmd_schedule(ctx: &Globals, every: &str) -> anyhow::Result<()> {
    let config = ctx.config()?;
    let manager = Arc::new(BackupManager::for_config(&config)?);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("cannot start the async runtime")?;

    runtime.block_on(async move {
        let scheduler = Scheduler::new(manager);
        let handle = scheduler.schedule_automatic_backup(config, every)?;

        println!(
            "{} Backing up {} (press Ctrl-C to stop)",
            "✓".green().bold(),
            handle.cadence().to_string().cyan()
        );

        tokio::signal::ctrl_c()
            .await
            .context("cannot listen for Ctrl-C")?;

        println!("\n{}", "Stopping scheduler...".blue().bold());
        let stats = handle.stats();
        scheduler.shutdown();
        handle.stopped().await;

        println!(
            "  Fires: {} | Completed: {} | Skipped: {} | Failed: {}",
            stats.fires.to_string().cyan(),
            stats.completed.to_string().green(),
            stats.skipped.to_string().yellow(),
            stats.failed.to_string().red()
        );
        Ok::<(), anyhow::Error>(())
    })
}

fn print_record(record: &BackupRecord) {
    println!("{} {}", "Backup".blue().bold(), record.backup_id.yellow().bold());
    println!("  Status: {} {}", status_marker(record.status), record.status.to_string().cyan());
    println!(
        "  Created: {}",
        record.timestamp.format("%Y-%m-%d %H:%M:%S UTC").to_string().cyan()
    );
    println!("  Format: {}", record.compression_type.to_string().cyan());
    println!("  Files: {}", record.total_files.to_string().cyan());
    println!(
        "  Size: {} -> {}",
        archivist::utils::format_bytes(record.total_size_bytes).cyan(),
        archivist::utils::format_bytes(record.artifact_size_bytes).cyan()
    );
    if !record.checksum.is_empty() {
        println!("  Checksum: {}", record.checksum.dimmed());
    }
    println!("  Sources:");
    for path in &record.source_paths {
        println!("    - {}", path.display());
    }
    if !record.skipped_files.is_empty() {
        println!("  Skipped: {}", record.skipped_files.len().to_string().yellow());
    }
    if let Some(message) = &record.error_message {
        println!("  Error: {}", message.red());
    }
}

fn status_marker(status: BackupStatus) -> ColoredString {
    match status {
        BackupStatus::Completed => "✓".green().bold(),
        BackupStatus::Pending | BackupStatus::InProgress => "…".yellow().bold(),
        BackupStatus::Failed | BackupStatus::Corrupted => "✗".red().bold(),
    }
}

fn parse_retention(value: &str) -> Result<Retention, String> {
    if value.eq_ignore_ascii_case("indefinite") {
        return Ok(Retention::Indefinite);
    }
    match value.parse::<u32>() {
        Ok(0) => Err("retention must be at least 1 day".to_string()),
        Ok(days) => Ok(Retention::Days(days)),
        Err(_) => Err(format!(
            "invalid retention '{}': expected a number of days or \"indefinite\"",
            value
        )),
    }
}
