//! # medctx CLI
//!
//! ## Usage
//!
//! ```bash
//! medctx --config ./config/medctx.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `medctx init` | Create the SQLite database and run schema migrations |
//! | `medctx ingest` | Process new or changed dataset files (`--force`, `--dry-run`) |
//! | `medctx status` | Show spreadsheet state and pending files |
//! | `medctx stats` | Record counts and breakdowns |
//! | `medctx patients` | List the patient roster |
//! | `medctx search "<q>"` | Find patients by name, id or record text |
//! | `medctx context "<q>"` | Print the context assembled for a question |
//! | `medctx ask "<q>"` | Answer one question |
//! | `medctx chat` | Interactive session that keeps the active patient |
//! | `medctx summary <patient>` | Generated patient summary |
//! | `medctx trends [q]` | Database-wide analysis |
//! | `medctx suggest` | Suggested questions |
//! | `medctx history <session>` | Chat history of a session |
//!
//! Logging goes to stderr and is controlled with `RUST_LOG`
//! (default `warn`).

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use tokio::io::AsyncBufReadExt;
use tracing_subscriber::EnvFilter;

use medctx::chat::{ChatAssistant, ChatResponse, ResponseStatus};
use medctx::config::{self, Config};
use medctx::context::ConversationState;
use medctx::ingest::Pipeline;
use medctx::models::format_ts_date;
use medctx::store::Store;
use medctx::{search, stats};

/// medctx: clinical record ingestion and patient-context assembly.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/medctx.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "medctx",
    about = "Clinical record ingestion and patient-context assembly for LLM question answering",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/medctx.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Ingest new or changed dataset files.
    ///
    /// Reads the primary spreadsheet, analyses associated images and
    /// extracts supplementary documents. Unchanged files are skipped.
    Ingest {
        /// Clear every stored record and checkpoint first, then ingest everything.
        #[arg(long)]
        force: bool,

        /// List pending files without writing anything.
        #[arg(long)]
        dry_run: bool,
    },

    /// Show spreadsheet state and the files the next ingestion would process.
    Status,

    /// Show record counts with per-type and per-category breakdowns.
    Stats,

    /// List all patients with document and image counts.
    Patients,

    /// Find patients whose name, id, documents or image text match.
    Search {
        query: String,
    },

    /// Print the context that would be sent to the generator for a question.
    Context {
        query: String,

        /// Treat this patient (name or id) as already selected.
        #[arg(long)]
        patient: Option<String>,
    },

    /// Answer a single question.
    Ask {
        query: String,

        /// Record the exchange under this chat session id.
        #[arg(long)]
        session: Option<String>,

        /// Start with this patient (name or id) selected.
        #[arg(long)]
        patient: Option<String>,

        /// Print prompt and context diagnostics.
        #[arg(long)]
        debug: bool,
    },

    /// Interactive chat that keeps the active patient across questions.
    ///
    /// `/patient <name or id>` selects a patient, `/clear` clears it,
    /// `/quit` exits.
    Chat {
        /// Session id; a new one is generated when omitted.
        #[arg(long)]
        session: Option<String>,
    },

    /// Generate a summary for one patient.
    Summary {
        /// Patient name or id.
        patient: String,
    },

    /// Analyze trends across the whole database.
    Trends {
        /// Optional focus for the analysis.
        query: Option<String>,
    },

    /// Suggested questions, optionally for one patient.
    Suggest {
        #[arg(long)]
        patient: Option<String>,
    },

    /// Print the chat history of a session.
    History {
        session: String,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .compact()
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    let store = Store::open(&cfg).await?;

    let result = run(cli.command, &cfg, &store).await;
    store.close().await;
    result
}

async fn run(command: Commands, cfg: &Config, store: &Store) -> Result<()> {
    match command {
        Commands::Init => {
            println!("Database initialized successfully.");
        }
        Commands::Ingest { force, dry_run } => {
            if force && dry_run {
                bail!("--force and --dry-run cannot be combined");
            }
            let pipeline = Pipeline::from_config(store.clone(), cfg.clone())?;
            let summary = if force {
                pipeline.force_reprocess().await?
            } else {
                pipeline.run_ingestion(dry_run).await?
            };
            stats::print_summary(&summary);
        }
        Commands::Status => {
            let pipeline = Pipeline::from_config(store.clone(), cfg.clone())?;
            stats::run_status(&pipeline).await?;
        }
        Commands::Stats => {
            stats::run_stats(cfg, store).await?;
        }
        Commands::Patients => {
            search::run_patients(store).await?;
        }
        Commands::Search { query } => {
            search::run_search(store, &query).await?;
        }
        Commands::Context { query, patient } => {
            search::run_context(cfg, store, &query, patient.as_deref()).await?;
        }
        Commands::Ask {
            query,
            session,
            patient,
            debug,
        } => {
            let assistant = ChatAssistant::from_config(store.clone(), cfg.clone())?;
            let state = match patient {
                Some(name_or_id) => match assistant.select_patient(&name_or_id).await? {
                    Some((_, state)) => state,
                    None => bail!("Patient not found: {}", name_or_id),
                },
                None => ConversationState::default(),
            };
            let response = assistant
                .answer(&query, state, session.as_deref(), debug)
                .await;
            print_response(&response);
            if response.status == ResponseStatus::Error {
                bail!("query failed");
            }
        }
        Commands::Chat { session } => {
            let assistant = ChatAssistant::from_config(store.clone(), cfg.clone())?;
            let session = session.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            run_chat(&assistant, &session).await?;
        }
        Commands::Summary { patient } => {
            let assistant = ChatAssistant::from_config(store.clone(), cfg.clone())?;
            match assistant.patient_summary(&patient).await? {
                Some(report) => {
                    println!(
                        "{} (ID: {})",
                        report.patient.display_name,
                        report.patient.external_id.as_deref().unwrap_or("N/A")
                    );
                    println!();
                    println!("{}", report.summary);
                }
                None => bail!("Patient not found: {}", patient),
            }
        }
        Commands::Trends { query } => {
            let assistant = ChatAssistant::from_config(store.clone(), cfg.clone())?;
            let report = assistant.analyze_trends(query.as_deref()).await?;
            println!("{}", report.analysis);
        }
        Commands::Suggest { patient } => {
            let assistant = ChatAssistant::from_config(store.clone(), cfg.clone())?;
            for q in assistant.suggested_questions(patient.as_deref()).await? {
                println!("- {}", q);
            }
        }
        Commands::History { session } => {
            let history = store.chat_history(&session).await?;
            if history.is_empty() {
                println!("No messages.");
            }
            for m in &history {
                let patient = m
                    .patient_context
                    .as_deref()
                    .map(|p| format!(" [{}]", p))
                    .unwrap_or_default();
                println!("[{}]{} Q: {}", format_ts_date(m.created_at), patient, m.message);
                println!("A: {}", m.response);
                println!();
            }
        }
    }
    Ok(())
}

fn print_response(response: &ChatResponse) {
    if let Some(debug) = &response.debug {
        match serde_json::to_string_pretty(debug) {
            Ok(json) => eprintln!("{}", json),
            Err(e) => eprintln!("debug info unavailable: {}", e),
        }
    }
    println!("{}", response.response);
    if let Some(patient) = &response.patient_context {
        println!();
        println!("[patient: {}]", patient);
    }
    if !response.sources.is_empty() {
        println!("[sources: {}]", response.sources.join(", "));
    }
}

async fn run_chat(assistant: &ChatAssistant, session: &str) -> Result<()> {
    println!("medctx chat (session {})", session);
    println!("Commands: /patient <name or id>, /clear, /quit");

    let mut state = ConversationState::default();
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if line == "/quit" || line == "/exit" {
            break;
        }
        if line == "/clear" {
            state = ConversationState::cleared();
            println!("Patient context cleared.");
            continue;
        }
        if let Some(name_or_id) = line.strip_prefix("/patient") {
            match assistant.select_patient(name_or_id.trim()).await? {
                Some((patient, selected)) => {
                    state = selected;
                    println!("Active patient: {}", patient.display_name);
                }
                None => println!("Patient not found: {}", name_or_id.trim()),
            }
            continue;
        }

        let response = assistant.answer(line, state, Some(session), false).await;
        state = response.state;
        print_response(&response);
        println!();
    }
    Ok(())
}
