// brainstore - entity store maintenance CLI
//
// Thin wrapper over the library for operational tasks: schema
// migration, data export, and store statistics. The long-running
// worker pool belongs to the embedding application, not this binary.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use brainstore::config::BrainConfig;
use brainstore::db::BrainDb;
use brainstore::types::ListOptions;

/// Entity storage and embedding pipeline for a personal-knowledge brain.
#[derive(Parser)]
#[command(name = "brainstore")]
#[command(version)]
#[command(about = "Entity store maintenance", long_about = None)]
struct Cli {
    /// Config file path (default: ~/.brainstore/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply pending schema migrations
    Migrate,
    /// Export entities of a type as JSON
    Export {
        /// Entity type to export
        #[arg(long)]
        entity_type: String,

        /// Output file (stdout when omitted)
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Print queue and entity statistics
    Stats,
}

fn main() -> ExitCode {
    env_logger::init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> brainstore::Result<()> {
    let config = match &cli.config {
        Some(path) => BrainConfig::load_from(path)?,
        None => BrainConfig::load()?,
    };

    match cli.command {
        Commands::Migrate => migrate(&config),
        Commands::Export { entity_type, out } => export(&config, &entity_type, out),
        Commands::Stats => stats(&config),
    }
}

fn migrate(config: &BrainConfig) -> brainstore::Result<()> {
    let data_dir = config.data_dir()?;
    std::fs::create_dir_all(&data_dir)?;
    let conn = rusqlite::Connection::open(data_dir.join("brainstore.db"))?;

    let applied = brainstore::migrations::run_migrations(&conn)?;
    if applied == 0 {
        println!("database is up to date");
    } else {
        println!("applied {applied} migration(s)");
    }
    Ok(())
}

fn export(
    config: &BrainConfig,
    entity_type: &str,
    out: Option<PathBuf>,
) -> brainstore::Result<()> {
    let db = BrainDb::open(&config.data_dir()?)?;
    let rows = db.list_entity_rows(entity_type, &ListOptions::default())?;

    let mut entities = Vec::with_capacity(rows.len());
    for row in rows {
        entities.push(row.into_entity()?);
    }
    let json = serde_json::to_string_pretty(&entities)
        .map_err(|e| brainstore::BrainError::Serialization(e.to_string()))?;

    match out {
        Some(path) => {
            std::fs::write(&path, json)?;
            println!("exported {} entities to {}", entities.len(), path.display());
        }
        None => println!("{json}"),
    }
    Ok(())
}

fn stats(config: &BrainConfig) -> brainstore::Result<()> {
    let db = BrainDb::open(&config.data_dir()?)?;

    let queue = db.queue_stats()?;
    println!("jobs:");
    println!("  pending:    {}", queue.pending);
    println!("  processing: {}", queue.processing);
    println!("  completed:  {}", queue.completed);
    println!("  failed:     {}", queue.failed);

    println!("entities:");
    for (entity_type, count) in db.count_entities_by_type()? {
        println!("  {entity_type}: {count}");
    }
    println!("embeddings: {}", db.count_embeddings()?);
    Ok(())
}
