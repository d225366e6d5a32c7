//! Binary entry point for the cityload importer.
#![forbid(unsafe_code)]

mod ui;

use std::error::Error;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use cityload::adapter::SqliteAdapter;
use cityload::importer::collect_inputs;
use cityload::{DuplicateMode, Importer, ImporterConfig, Outcome, ProgressEvent, RunOutcome};
use serde::Serialize;
use tracing_subscriber::EnvFilter;
use ui::{Theme, Ui};

const EXIT_FAILED: i32 = 1;
const EXIT_INTERRUPTED: i32 = 130;

#[derive(Parser, Debug)]
#[command(
    name = "cityload",
    version,
    about = "Import city-model feature graphs into SQLite",
    disable_help_subcommand = true
)]
struct Cli {
    #[arg(long, global = true, value_name = "FILE", help = "Configuration file (TOML)")]
    config: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format for summaries"
    )]
    format: OutputFormat,

    #[arg(long, global = true, value_enum, default_value_t = ThemeArg::Auto)]
    theme: ThemeArg,

    #[arg(long, short, global = true, help = "Only print results")]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Import feature files
    Import(ImportCmd),
    /// Report top-level features that already exist in the database
    CheckDuplicates(CheckCmd),
    /// Inspect or toggle the managed secondary indexes
    Index {
        #[command(subcommand)]
        action: IndexAction,
    },
}

#[derive(Args, Debug)]
struct ImportCmd {
    #[arg(required = true, value_name = "FILES")]
    files: Vec<PathBuf>,

    #[arg(long, value_name = "PATH", env = "CITYLOAD_DB", help = "Target database")]
    db: PathBuf,

    #[arg(long, help = "Upper bound of conversion workers")]
    workers: Option<usize>,

    #[arg(long, help = "Top-level features per conversion commit")]
    commit_after: Option<usize>,

    #[arg(long, help = "Drop secondary indexes while importing")]
    deactivate_indexes: bool,

    #[arg(long, value_enum, help = "What to do with features that already exist")]
    duplicates: Option<DuplicatesArg>,
}

#[derive(Args, Debug)]
struct CheckCmd {
    #[arg(required = true, value_name = "FILES")]
    files: Vec<PathBuf>,

    #[arg(long, value_name = "PATH", env = "CITYLOAD_DB")]
    db: PathBuf,
}

#[derive(Subcommand, Debug)]
enum IndexAction {
    /// Show which indexes exist
    Status {
        #[arg(long, value_name = "PATH", env = "CITYLOAD_DB")]
        db: PathBuf,
    },
    /// Create missing indexes
    Activate {
        #[arg(long, value_name = "PATH", env = "CITYLOAD_DB")]
        db: PathBuf,
    },
    /// Drop the indexes
    Deactivate {
        #[arg(long, value_name = "PATH", env = "CITYLOAD_DB")]
        db: PathBuf,
    },
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum ThemeArg {
    Auto,
    Plain,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum DuplicatesArg {
    Ignore,
    Skip,
    Delete,
}

impl From<DuplicatesArg> for DuplicateMode {
    fn from(arg: DuplicatesArg) -> Self {
        match arg {
            DuplicatesArg::Ignore => DuplicateMode::Ignore,
            DuplicatesArg::Skip => DuplicateMode::Skip,
            DuplicatesArg::Delete => DuplicateMode::Delete,
        }
    }
}

#[tokio::main]
async fn main() {
    install_tracing_subscriber();
    match run().await {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(EXIT_FAILED);
        }
    }
}

fn install_tracing_subscriber() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("cityload=info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

async fn run() -> Result<i32, Box<dyn Error>> {
    let cli = Cli::parse();
    let theme = match cli.theme {
        ThemeArg::Auto => Theme::Auto,
        ThemeArg::Plain => Theme::Plain,
    };
    let ui = Ui::new(theme, cli.quiet || matches!(cli.format, OutputFormat::Json));
    let mut config = ImporterConfig::load(cli.config.as_deref())?;

    match cli.command {
        Command::Import(cmd) => {
            config.database = cmd.db;
            if let Some(workers) = cmd.workers {
                config.workers.max = workers;
                config.workers.min = config.workers.min.min(workers);
            }
            if let Some(commit_after) = cmd.commit_after {
                config.commit_after = commit_after;
            }
            if cmd.deactivate_indexes {
                config.indexes.deactivate_during_import = true;
            }
            if let Some(mode) = cmd.duplicates {
                config.duplicates.mode = mode.into();
            }
            let files = collect_inputs(&cmd.files)?;
            let outcome = import(config, files, &ui).await?;
            report(&cli.format, &ui, &outcome)?;
            Ok(match outcome.state {
                RunOutcome::Done => 0,
                RunOutcome::Aborted => EXIT_INTERRUPTED,
                RunOutcome::Failed => EXIT_FAILED,
            })
        }
        Command::CheckDuplicates(cmd) => {
            config.database = cmd.db;
            let mut importer = Importer::new(config)?;
            let log = importer.check_duplicates(&cmd.files)?;
            let records = log.records()?;
            match cli.format {
                OutputFormat::Json => print_json(&records)?,
                OutputFormat::Text => ui.duplicates(&records),
            }
            Ok(0)
        }
        Command::Index { action } => {
            let (db, change) = match action {
                IndexAction::Status { db } => (db, None),
                IndexAction::Activate { db } => (db, Some(true)),
                IndexAction::Deactivate { db } => (db, Some(false)),
            };
            config.database = db;
            let adapter = SqliteAdapter::open(&config)?;
            match change {
                Some(true) => {
                    let changed = adapter.activate_indexes()?;
                    ui.success(&format!("{changed} indexes created"));
                }
                Some(false) => {
                    let changed = adapter.deactivate_indexes()?;
                    ui.success(&format!("{changed} indexes dropped"));
                }
                None => {
                    let status = adapter.index_status()?;
                    match cli.format {
                        OutputFormat::Json => print_json(&status)?,
                        OutputFormat::Text => ui.indexes(&status),
                    }
                }
            }
            Ok(0)
        }
    }
}

async fn import(config: ImporterConfig, files: Vec<PathBuf>, ui: &Ui) -> Result<Outcome, Box<dyn Error>> {
    let importer = Importer::new(config)?;
    let interrupt = importer.interrupt_handle();
    let progress = importer.progress();

    let bar = ui.files_bar(files.len() as u64);
    let bar_thread = std::thread::spawn(move || {
        for event in progress {
            match event {
                ProgressEvent::FileStarted { path, .. } => bar.set_message(path.display().to_string()),
                ProgressEvent::Resolving(category) => bar.set_message(format!("resolving {category}")),
                ProgressEvent::FileFinished { .. } => bar.inc(1),
            }
        }
        bar.finish_and_clear();
    });

    let mut task = tokio::task::spawn_blocking(move || importer.run(&files));
    let outcome = tokio::select! {
        joined = &mut task => joined?,
        signal = tokio::signal::ctrl_c() => {
            match signal {
                Ok(()) => {
                    tracing::info!("import.interrupt.requested");
                    interrupt.interrupt();
                }
                Err(err) => tracing::error!(?err, "failed to listen for interrupt signal"),
            }
            task.await?
        }
    };
    if bar_thread.join().is_err() {
        tracing::warn!("progress display thread panicked");
    }
    Ok(outcome)
}

fn report(format: &OutputFormat, ui: &Ui, outcome: &Outcome) -> Result<(), Box<dyn Error>> {
    if let OutputFormat::Json = format {
        #[derive(Serialize)]
        struct Report<'a> {
            state: RunOutcome,
            error: Option<String>,
            counters: &'a cityload::CounterSnapshot,
            duplicates: &'a Option<cityload::duplicate::DuplicateReport>,
        }
        return print_json(&Report {
            state: outcome.state,
            error: outcome.error.as_ref().map(ToString::to_string),
            counters: &outcome.counters,
            duplicates: &outcome.duplicates,
        });
    }

    ui.outcome(outcome);
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<(), Box<dyn Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
