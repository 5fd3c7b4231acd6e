use clap::{Parser, Subcommand};
use std::path::PathBuf;

use loam_config::{ConfigLoader, LoamConfig};
use loam_memory::{LessonFilter, LessonStore};

mod run;

/// Loam — cross-session learning layer for tool-using LLM agents
#[derive(Parser, Debug)]
#[command(name = "loam", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to loam.toml config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level override (e.g. debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Enable verbose output (debug logging)
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Suppress all log output (errors only)
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one session: drives the agent loop and writes lessons.jsonl,
    /// events/, and metrics/ under the data directory
    Run(run::RunArgs),
    /// Inspect the lesson store
    Lessons {
        /// Show one lesson as JSON instead of the listing
        id: Option<String>,
        /// Filter the listing by status (candidate, promoted, suppressed, archived)
        #[arg(short, long)]
        status: Option<String>,
    },
    /// Rewrite the lesson log to one record per lesson
    Compact,
    /// Show the effective configuration
    Config {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show version and build info
    Version,
}

impl Cli {
    pub async fn run(self) -> loam_core::Result<()> {
        let config = ConfigLoader::load(self.config.as_deref())?.get();
        self.init_tracing(&config);

        match self.command {
            Commands::Run(ref args) => run::execute(args.clone(), config).await,
            Commands::Lessons { ref id, ref status } => {
                cmd_lessons(&config, id.as_deref(), status.as_deref())
            }
            Commands::Compact => cmd_compact(&config),
            Commands::Config { json } => cmd_config(&config, json),
            Commands::Version => {
                println!("loam {}", env!("CARGO_PKG_VERSION"));
                Ok(())
            }
        }
    }

    fn init_tracing(&self, config: &LoamConfig) {
        let level = if self.quiet {
            "error".to_string()
        } else if self.verbose {
            "debug".to_string()
        } else {
            self.log_level
                .clone()
                .unwrap_or_else(|| config.logging.level.clone())
        };
        let filter = tracing_subscriber::EnvFilter::try_from_env("LOAM_LOG")
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
        let builder = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr);
        if config.logging.format == "json" {
            let _ = builder.json().try_init();
        } else {
            let _ = builder.try_init();
        }
    }
}

fn open_store(config: &LoamConfig) -> LessonStore {
    let path = config.storage.data_dir.join("lessons.jsonl");
    match LessonStore::open(&path) {
        Ok(store) => store,
        Err(e) => {
            tracing::warn!(error = %e, "cannot open lesson store, using in-memory");
            LessonStore::in_memory()
        }
    }
}

fn cmd_lessons(
    config: &LoamConfig,
    id: Option<&str>,
    status: Option<&str>,
) -> loam_core::Result<()> {
    let store = open_store(config);

    if let Some(id) = id {
        match store.get(id) {
            Some(lesson) => println!("{}", serde_json::to_string_pretty(lesson)?),
            None => println!("lesson not found: {id}"),
        }
        return Ok(());
    }

    let filter = LessonFilter {
        status: match status {
            Some("candidate") => Some(loam_memory::LessonStatus::Candidate),
            Some("promoted") => Some(loam_memory::LessonStatus::Promoted),
            Some("suppressed") => Some(loam_memory::LessonStatus::Suppressed),
            Some("archived") => Some(loam_memory::LessonStatus::Archived),
            Some(other) => {
                return Err(loam_core::LoamError::Config(format!(
                    "unknown status filter: {other}"
                )));
            }
            None => None,
        },
        domain_key: None,
    };

    let mut lessons: Vec<_> = store.iter(&filter).collect();
    lessons.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
    println!(
        "{:<18} {:<10} {:<6} {:<5} {:<20} rule",
        "id", "status", "rel", "uses", "domain"
    );
    for lesson in lessons {
        let rule: String = lesson.rule_text.chars().take(60).collect();
        println!(
            "{:<18} {:<10} {:<6.2} {:<5} {:<20} {}",
            lesson.id,
            format!("{:?}", lesson.status).to_lowercase(),
            lesson.reliability,
            lesson.retrieval_count,
            lesson.domain_key,
            rule
        );
    }
    Ok(())
}

fn cmd_compact(config: &LoamConfig) -> loam_core::Result<()> {
    let mut store = open_store(config);
    let count = store.len();
    store.compact()?;
    println!("compacted lesson store: {count} lessons");
    Ok(())
}

fn cmd_config(config: &LoamConfig, json: bool) -> loam_core::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(config)?);
    } else {
        let rendered = toml::to_string_pretty(config)
            .map_err(|e| loam_core::LoamError::Config(e.to_string()))?;
        println!("{rendered}");
    }
    Ok(())
}
