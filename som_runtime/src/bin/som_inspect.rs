//! som-inspect: offline inspection of a session's durable event log.
//!
//! Opens a session, replays its log and reports on the result. Nothing
//! is ever submitted.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use som_engine::clock::SystemClock;
use som_engine::constraints::InMemoryDocumentRegistry;
use som_engine::event_log::EventFilter;
use som_engine::graph::GraphIndex;
use som_engine::ids::EventId;

use som_runtime::config::RuntimeConfig;
use som_runtime::error::Result;
use som_runtime::drift;
use som_runtime::session::{Session, SnapshotCheck};

#[derive(Parser)]
#[command(name = "som-inspect")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Runtime configuration file (TOML)
    #[arg(short, long, env = "SOM_CONFIG")]
    config: Option<PathBuf>,

    /// Overrides `data_dir` from the configuration
    #[arg(short, long, env = "SOM_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Session to open
    #[arg(short, long, default_value = "default")]
    session: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay the log and print the projection hash and counts
    Replay,

    /// Double-replay, check the latest snapshot and diff against live state
    Verify,

    /// List logged events, optionally for one subject
    Events {
        #[arg(long)]
        subject: Option<String>,

        #[arg(long)]
        limit: Option<usize>,
    },

    /// Walk the causal ancestry of an event
    Trace {
        event_id: u64,

        #[arg(long)]
        depth: Option<usize>,

        /// Follow consequences instead of causes
        #[arg(long)]
        forward: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => match RuntimeConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("failed to load {}: {}", path.display(), e);
                return ExitCode::FAILURE;
            }
        },
        None => RuntimeConfig::default(),
    };
    if let Some(dir) = cli.data_dir.clone() {
        config.data_dir = dir;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log_filter)),
        )
        .init();

    match run(&cli, &config) {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "som-inspect failed");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli, config: &RuntimeConfig) -> Result<ExitCode> {
    let registry = Arc::new(InMemoryDocumentRegistry::with_defaults(&config.engine));
    let mut session = Session::open(config, &cli.session, registry, Arc::new(SystemClock))?;

    match &cli.command {
        Commands::Replay => {
            let (state, hash) = session.replay_full()?;
            let index = GraphIndex::build(&state, session.engine().clock().now());
            println!("session:        {}", session.session_id());
            println!("events:         {}", session.current_sequence());
            println!("holons:         {}", state.holons.len());
            println!("relationships:  {}", state.relationships.len());
            println!("rejections:     {}", state.rejections.len());
            println!("index density:  {:.4}", index.density());
            println!("hash:           {}", hash);
        }
        Commands::Verify => {
            let engine = session.engine();
            let hash = drift::verify_determinism(engine.validator(), engine.log().events())?;
            println!("determinism:    ok ({})", hash);

            match session.check_latest_snapshot()? {
                SnapshotCheck::NoSnapshot => println!("snapshot:       none"),
                SnapshotCheck::Matches { sequence } => {
                    println!("snapshot:       ok at {}", sequence)
                }
                SnapshotCheck::Drifted {
                    sequence,
                    snapshot_hash,
                    replay_hash,
                } => {
                    println!(
                        "snapshot:       DRIFT at {} (snapshot {}, replay {})",
                        sequence, snapshot_hash, replay_hash
                    );
                    return Ok(ExitCode::FAILURE);
                }
            }

            let report = session.verify()?;
            if !report.is_empty() {
                println!("drift:          {}", serde_json::to_string_pretty(&report)?);
                return Ok(ExitCode::FAILURE);
            }
            println!("drift:          none");
        }
        Commands::Events { subject, limit } => {
            let mut filter = match subject {
                Some(subject) => EventFilter::for_subject(subject.clone()),
                None => EventFilter::default(),
            };
            filter.limit = *limit;
            for event in session.engine().query_events(&filter)? {
                println!(
                    "{:>6}  {}  {:<28} actor={} subjects={}",
                    event.id.value(),
                    event.occurred_at.to_rfc3339(),
                    event.type_name(),
                    event.actor,
                    event.subjects.join(",")
                );
            }
        }
        Commands::Trace {
            event_id,
            depth,
            forward,
        } => {
            let id = EventId(*event_id);
            let trace = if *forward {
                session.engine().trace_consequences(id, *depth)?
            } else {
                session.engine().trace_causal_chain(id, *depth)?
            };
            for node in &trace.nodes {
                println!(
                    "{}{} {} ({:?})",
                    "  ".repeat(node.depth),
                    node.event_id,
                    node.event_type,
                    node.link
                );
            }
            if trace.truncated {
                println!("... truncated at depth limit");
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}
