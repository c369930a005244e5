use anyhow::{Context, Result};
use captioner_core::{CacheEntry, GeometryCaptioner, ScrfdExtractor};
use captioner_engine::{Config, Orchestrator};
use captioner_store::TableStore;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing_subscriber::EnvFilter;

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp", "gif", "tiff"];

#[derive(Parser)]
#[command(name = "captioner", about = "Extract landmarks and captions from images")]
struct Cli {
    /// TOML config file (CAPTIONER_* environment variables override it)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Process image files and append results to the tables
    Process {
        /// Image files to process
        paths: Vec<PathBuf>,
        /// Also process every image in this directory
        #[arg(short, long)]
        dir: Option<PathBuf>,
        /// Print results as JSON lines
        #[arg(long)]
        json: bool,
    },
    /// Repair the tables after an unclean shutdown
    Recover,
    /// Show table totals
    Status,
    /// List processed images
    List {
        /// Only entries without landmarks
        #[arg(long, conflicts_with = "with_landmarks")]
        captions_only: bool,
        /// Only entries with landmarks
        #[arg(long)]
        with_landmarks: bool,
        /// Print entries as JSON lines
        #[arg(long)]
        json: bool,
    },
    /// Print the fingerprint of a file
    Fingerprint { path: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref()).context("failed to load configuration")?;

    match cli.command {
        Commands::Process { paths, dir, json } => {
            let mut inputs = paths;
            if let Some(dir) = dir {
                inputs.extend(scan_images(&dir)?);
            }
            if inputs.is_empty() {
                anyhow::bail!("no images given (pass paths or --dir)");
            }
            process(&config, inputs, json).await?;
        }
        Commands::Recover => {
            let (_, report) =
                TableStore::open(&config.store_config()).context("failed to open tables")?;
            if report.is_clean() {
                println!("tables consistent");
            } else {
                println!("torn tails:         {}", report.torn_tails);
                println!("malformed rows:     {}", report.malformed_rows);
                println!("duplicate rows:     {}", report.duplicate_rows);
                println!("orphaned landmarks: {}", report.orphaned_landmarks.len());
                println!("orphaned captions:  {}", report.orphaned_captions.len());
            }
        }
        Commands::Status => {
            let store =
                TableStore::inspect(&config.store_config()).context("failed to open tables")?;
            let stats = store.stats()?;
            println!("data dir:       {}", config.data_dir.display());
            println!("images:         {}", stats.caption_rows);
            println!("with landmarks: {}", stats.landmark_rows);
            println!("captions only:  {}", stats.captions_only);
        }
        Commands::List {
            captions_only,
            with_landmarks,
            json,
        } => {
            let store =
                TableStore::inspect(&config.store_config()).context("failed to open tables")?;
            let entries = store
                .load()?
                .into_iter()
                .filter(|e| !captions_only || !e.has_landmarks())
                .filter(|e| !with_landmarks || e.has_landmarks());
            for entry in entries {
                print_entry(&entry, None, json)?;
            }
        }
        Commands::Fingerprint { path } => {
            let bytes = tokio::fs::read(&path)
                .await
                .with_context(|| format!("failed to read {}", path.display()))?;
            let fp = captioner_core::fingerprint(&bytes)?;
            println!("{fp}  {}", path.display());
        }
    }

    Ok(())
}

async fn process(config: &Config, inputs: Vec<PathBuf>, json: bool) -> Result<()> {
    let model_path = config.scrfd_model_path();
    let extractor = ScrfdExtractor::load(&model_path)
        .with_context(|| format!("failed to load landmark model {}", model_path.display()))?;

    let orchestrator = Orchestrator::open(config, Arc::new(extractor), Arc::new(GeometryCaptioner))
        .context("failed to start pipeline")?;

    let mut set = JoinSet::new();
    for path in inputs {
        let orchestrator = orchestrator.clone();
        set.spawn(async move {
            let result = match tokio::fs::read(&path).await {
                Ok(bytes) => orchestrator.process(bytes).await.map_err(anyhow::Error::from),
                Err(e) => Err(anyhow::Error::from(e)),
            };
            (path, result)
        });
    }

    let mut failed = 0usize;
    while let Some(joined) = set.join_next().await {
        let (path, result) = joined?;
        match result {
            Ok(entry) => print_entry(&entry, Some(&path), json)?,
            Err(e) => {
                failed += 1;
                eprintln!("{}: {e:#}", path.display());
            }
        }
    }

    orchestrator.shutdown().await?;
    let stats = orchestrator.stats();
    tracing::info!(
        computed = stats.computed,
        cache_hits = stats.cache_hits,
        failed,
        "processing finished"
    );
    if failed > 0 {
        anyhow::bail!("{failed} image(s) failed");
    }
    Ok(())
}

fn print_entry(entry: &CacheEntry, path: Option<&Path>, json: bool) -> Result<()> {
    if json {
        let mut value = serde_json::to_value(entry)?;
        if let (Some(path), Some(map)) = (path, value.as_object_mut()) {
            map.insert("path".into(), path.display().to_string().into());
        }
        println!("{value}");
        return Ok(());
    }

    let landmarks = entry
        .landmarks
        .as_ref()
        .map_or_else(|| "-".to_string(), |l| format!("{} pts", l.points.len()));
    match path {
        Some(path) => println!(
            "{}  {:<8}  {}  {}",
            entry.fingerprint.short(),
            landmarks,
            entry.caption.text,
            path.display()
        ),
        None => println!(
            "{}  {:<8}  {}",
            entry.fingerprint.short(),
            landmarks,
            entry.caption.text
        ),
    }
    Ok(())
}

/// Image files directly inside `dir`, sorted by name.
fn scan_images(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("failed to read {}", dir.display()))? {
        let path = entry?.path();
        if path.is_file() && has_image_extension(&path) {
            found.push(path);
        }
    }
    found.sort();
    Ok(found)
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| IMAGE_EXTENSIONS.iter().any(|known| ext.eq_ignore_ascii_case(known)))
}
