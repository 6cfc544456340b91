use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use facemark_core::record;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod context;
mod engine;
mod observations;

use config::Config;
use context::AppContext;

#[derive(Parser)]
#[command(name = "facemark", about = "Facemark classroom attendance by face recognition")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll (or re-enroll) a student from sample embeddings
    Enroll {
        /// Student name, unique within the gallery
        #[arg(short, long)]
        name: String,
        #[arg(short, long)]
        roll_no: String,
        #[arg(short, long)]
        section: String,
        /// JSON file with an array of sample embeddings
        #[arg(long)]
        samples: PathBuf,
        /// Embedding model that produced the samples (e.g., "facenet")
        #[arg(long)]
        model: Option<String>,
    },
    /// List enrolled students
    List {
        #[arg(short, long)]
        section: Option<String>,
    },
    /// Show one enrolled student
    Show { name: String },
    /// Remove an enrolled student
    Remove { name: String },
    /// Mark attendance from a file of per-frame embeddings
    Attend {
        /// JSON Lines file of observed faces, one frame per line
        #[arg(short, long)]
        observations: PathBuf,
        /// Only match students of this section
        #[arg(short, long)]
        section: Option<String>,
        /// Print the roster without writing a record
        #[arg(long)]
        no_record: bool,
    },
    /// List attendance records, or print one
    History { record: Option<PathBuf> },
    /// Show configuration and gallery summary
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::load().context("loading configuration")?;
    let ctx = AppContext::init(config)?;

    let result = run(&ctx, cli.command).await;
    ctx.shutdown();
    result
}

async fn run(ctx: &AppContext, command: Commands) -> Result<()> {
    let gallery = ctx.gallery();

    match command {
        Commands::Enroll {
            name,
            roll_no,
            section,
            samples,
            model,
        } => {
            let samples = observations::load_samples(&samples, model.as_deref())
                .with_context(|| format!("reading samples from {}", samples.display()))?;
            let entry = gallery.enroll(&name, &samples, &roll_no, &section)?;
            println!(
                "Enrolled {} (roll {}, section {}) from {} samples",
                entry.identity,
                entry.roll_no,
                entry.section,
                samples.len()
            );
        }
        Commands::List { section } => {
            let entries = gallery.lookup_all(section.as_deref());
            if entries.is_empty() {
                println!("No students enrolled");
            }
            for entry in entries {
                println!(
                    "{}",
                    serde_json::json!({
                        "name": entry.identity,
                        "roll_no": entry.roll_no,
                        "section": entry.section,
                        "dim": entry.reference_embedding.dim(),
                    })
                );
            }
        }
        Commands::Show { name } => {
            let entry = gallery.get(&name)?;
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "name": entry.identity,
                    "roll_no": entry.roll_no,
                    "section": entry.section,
                    "embedding": entry.reference_embedding,
                }))?
            );
        }
        Commands::Remove { name } => {
            if gallery.delete(&name)? {
                println!("Removed {name}");
            } else {
                println!("{name} is not enrolled; nothing to remove");
            }
        }
        Commands::Attend {
            observations,
            section,
            no_record,
        } => attend(ctx, &observations, section.as_deref(), no_record).await?,
        Commands::History { record } => history(ctx, record)?,
        Commands::Status => {
            let records = record::list_records(&ctx.config.records_dir)?;
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "version": env!("CARGO_PKG_VERSION"),
                    "gallery_path": ctx.config.gallery_path,
                    "records_dir": ctx.config.records_dir,
                    "similarity_threshold": ctx.config.similarity_threshold,
                    "students": gallery.len(),
                    "sections": gallery.sections(),
                    "records": records.len(),
                }))?
            );
        }
    }

    Ok(())
}

async fn attend(ctx: &AppContext, path: &Path, section: Option<&str>, no_record: bool) -> Result<()> {
    let snapshot = ctx.gallery().snapshot(section);
    if snapshot.is_empty() {
        tracing::warn!(section = section.unwrap_or("ALL"), "no enrolled students to match against");
    }

    let frames = observations::open(path).with_context(|| format!("opening observations {}", path.display()))?;
    let engine = engine::spawn_engine(ctx.config.similarity_threshold)?;
    let cancel = Arc::new(AtomicBool::new(false));

    let scan = engine.scan(snapshot, Box::new(frames), Arc::clone(&cancel));
    tokio::pin!(scan);
    let report = tokio::select! {
        report = &mut scan => report?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupt received; stopping scan");
            cancel.store(true, Ordering::Relaxed);
            scan.await?
        }
    };

    let roster = &report.roster;
    let stats = &report.stats;
    println!(
        "Scanned {} frames, {} faces ({} recognized, {} unknown, {} failed){}",
        stats.frames,
        stats.faces,
        stats.recognized,
        stats.unknown,
        stats.failed_faces,
        if roster.cancelled { " [cancelled]" } else { "" }
    );

    if roster.is_empty() {
        println!("No students were marked present");
        return Ok(());
    }
    for entry in &roster.entries {
        println!(
            "  {:<24} {:<10} {:<6} {}",
            entry.identity,
            entry.roll_no,
            entry.section,
            entry.first_marked_at.format("%H:%M:%S")
        );
    }

    if !no_record {
        let path = record::write_record(&ctx.config.records_dir, roster)?;
        println!("Attendance saved to {}", path.display());
    }
    Ok(())
}

fn history(ctx: &AppContext, selected: Option<PathBuf>) -> Result<()> {
    let dir = &ctx.config.records_dir;

    let Some(selected) = selected else {
        let records = record::list_records(dir)?;
        if records.is_empty() {
            println!("No attendance records in {}", dir.display());
        }
        for summary in records {
            println!("{:<48} {:>4} present", summary.name, summary.rows);
        }
        return Ok(());
    };

    let path = if selected.exists() {
        selected
    } else {
        let mut in_dir = dir.join(&selected);
        if in_dir.extension().is_none() {
            in_dir.set_extension("csv");
        }
        in_dir
    };
    let rows = record::read_record(&path).with_context(|| format!("reading record {}", path.display()))?;
    for row in rows {
        println!("  {:<24} {:<10} {:<6} {}", row.name, row.roll_no, row.section, row.timestamp);
    }
    Ok(())
}
