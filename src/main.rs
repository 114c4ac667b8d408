//! # scanshelf CLI (`shelf`)
//!
//! The `shelf` binary ingests scanned documents, re-drives their pipeline,
//! and manages classification rules.
//!
//! ## Usage
//!
//! ```bash
//! shelf --config ./config/shelf.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `shelf init` | Create storage directories, the database and its schema |
//! | `shelf ingest <paths…>` | Ingest files |
//! | `shelf scan` | Ingest every matching file in the inbox |
//! | `shelf reprocess <id>` | Run a document's pending steps |
//! | `shelf requeue <id> --step <step>` | Queue a step and run it |
//! | `shelf requeue-metadata` | Queue a step on documents carrying a metadata pair |
//! | `shelf show <id>` | Print a document with its pending steps and jobs |
//! | `shelf rules load/list/apply` | Manage a user's rule set |

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use scanshelf::config::{self, Config};
use scanshelf::extract::CommandExtractor;
use scanshelf::models::{ProcessStep, RuleAction};
use scanshelf::pool::Pool;
use scanshelf::processor::ProcessorContext;
use scanshelf::store::sqlite::SqliteStore;
use scanshelf::store::{DocumentStore, ProcessLedger, RuleStore, Stores};
use scanshelf::{db, inbox, migrate, rules, show};

/// scanshelf: dedup, OCR and classify scanned documents.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/shelf.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "shelf",
    about = "scanshelf: ingest, OCR and classify scanned documents",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/shelf.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create storage directories, the database and its schema.
    ///
    /// Idempotent; running it again is safe.
    Init,

    /// Ingest one or more files.
    ///
    /// Content already stored is skipped.
    Ingest {
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Owner of the new documents. Defaults to `processing.default_user`.
        #[arg(long)]
        user: Option<i64>,
    },

    /// Ingest every file in the configured inbox.
    Scan {
        #[arg(long)]
        user: Option<i64>,
    },

    /// Run the pending steps of a document.
    Reprocess { id: i64 },

    /// Queue one step for a document, then run its pending steps.
    Requeue {
        id: i64,

        /// Step name: hash, thumbnail, content or rules.
        #[arg(long)]
        step: ProcessStep,
    },

    /// Queue a step on every document carrying a metadata key (and value),
    /// then run them.
    RequeueMetadata {
        #[arg(long)]
        user: i64,

        #[arg(long)]
        key: i64,

        #[arg(long)]
        value: Option<i64>,

        #[arg(long, default_value = "rules")]
        step: ProcessStep,
    },

    /// Show a document, its pending steps and its jobs.
    Show {
        id: i64,

        /// Print JSON instead of text.
        #[arg(long)]
        json: bool,
    },

    /// Manage classification rules.
    Rules {
        #[command(subcommand)]
        action: RulesAction,
    },
}

#[derive(Subcommand)]
enum RulesAction {
    /// Replace a user's rules with the contents of a TOML file.
    Load {
        file: PathBuf,

        #[arg(long)]
        user: i64,
    },

    /// List a user's rules in evaluation order.
    List {
        #[arg(long)]
        user: i64,
    },

    /// Re-run the rules step on all of a user's documents.
    Apply {
        #[arg(long)]
        user: i64,
    },
}

fn init_tracing(config: Option<&Config>) {
    let default_level = config
        .map(|c| c.logging.level.as_str())
        .unwrap_or("info");
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn open_stores(cfg: &Config) -> Result<Stores> {
    let pool = db::connect(cfg).await?;
    migrate::migrate_pool(&pool).await?;
    Ok(Stores::from_backend(Arc::new(SqliteStore::new(pool))))
}

fn start_pool(cfg: &Config, stores: Stores) -> Result<Pool> {
    cfg.storage.ensure_dirs()?;
    let extractor = Arc::new(CommandExtractor::new(&cfg.extraction));
    let ctx = ProcessorContext::new(cfg, stores, extractor);
    Ok(Pool::start(ctx, &cfg.processing))
}

/// Submit every document id for reprocessing and wait for the pool to drain.
async fn reprocess_all(cfg: &Config, stores: Stores, ids: &[i64]) -> Result<()> {
    let pool = start_pool(cfg, stores)?;
    for id in ids {
        if let Err(e) = pool.submit_document(*id).await {
            warn!(document = *id, "not submitted: {:#}", e);
        }
    }
    pool.shutdown().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let cfg = match config::load_config(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            init_tracing(None);
            return Err(e);
        }
    };
    init_tracing(Some(&cfg));

    match cli.command {
        Commands::Init => {
            cfg.storage.ensure_dirs()?;
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Ingest { paths, user } => {
            let user = user.unwrap_or(cfg.processing.default_user);
            let stores = open_stores(&cfg).await?;
            let pool = start_pool(&cfg, stores)?;
            for path in paths {
                if !path.is_file() {
                    warn!(path = %path.display(), "not a file, skipping");
                    continue;
                }
                pool.submit_file(path, user).await?;
            }
            pool.shutdown().await;
        }
        Commands::Scan { user } => {
            let user = user.unwrap_or(cfg.processing.default_user);
            let files = inbox::scan_inbox(&cfg)?;
            info!(files = files.len(), "inbox scanned");
            let stores = open_stores(&cfg).await?;
            let pool = start_pool(&cfg, stores)?;
            for path in files {
                pool.submit_file(path, user).await?;
            }
            pool.shutdown().await;
        }
        Commands::Reprocess { id } => {
            let stores = open_stores(&cfg).await?;
            reprocess_all(&cfg, stores, &[id]).await?;
        }
        Commands::Requeue { id, step } => {
            let stores = open_stores(&cfg).await?;
            if stores.documents.get(id).await?.is_none() {
                bail!("document not found: {}", id);
            }
            stores.ledger.add_steps(id, &[step]).await?;
            reprocess_all(&cfg, stores, &[id]).await?;
        }
        Commands::RequeueMetadata {
            user,
            key,
            value,
            step,
        } => {
            let stores = open_stores(&cfg).await?;
            let ids = stores
                .ledger
                .queue_documents_by_metadata(user, key, value, step)
                .await?;
            println!("Queued {} on {} documents.", step, ids.len());
            reprocess_all(&cfg, stores, &ids).await?;
        }
        Commands::Show { id, json } => {
            let stores = open_stores(&cfg).await?;
            show::run_show(&stores, id, json).await?;
        }
        Commands::Rules { action } => {
            let stores = open_stores(&cfg).await?;
            match action {
                RulesAction::Load { file, user } => {
                    let drafts = rules::load_rules_file(&file)?;
                    let created = stores.rules.replace_rules(user, &drafts).await?;
                    println!("Loaded {} rules for user {}.", created.len(), user);
                }
                RulesAction::List { user } => {
                    for rule in stores.rules.rules_for_user(user).await? {
                        println!(
                            "{:>4}  {:<5}  {:<15}  {}{}",
                            rule.id,
                            rule.kind.as_str(),
                            rule.action.tag(),
                            rule.filter,
                            action_detail(&rule.action)
                        );
                    }
                }
                RulesAction::Apply { user } => {
                    let ids = stores
                        .ledger
                        .queue_user_documents(user, ProcessStep::ApplyRules)
                        .await?;
                    println!("Queued rules on {} documents.", ids.len());
                    reprocess_all(&cfg, stores, &ids).await?;
                }
            }
        }
    }

    Ok(())
}

fn action_detail(action: &RuleAction) -> String {
    match action {
        RuleAction::AddMetadata { key_id, value_id } => format!("  ({}={})", key_id, value_id),
        RuleAction::SetDate { format } => format!("  ({})", format),
        RuleAction::AddTag { tag_id } => format!("  (tag {})", tag_id),
        RuleAction::Rename | RuleAction::SetDescription => String::new(),
    }
}
