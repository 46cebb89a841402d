//! launcherctl: game launcher front end and elevated worker.
//!
//! ## Subcommands
//!
//! - `status`: Version state, eligibility and running game as JSON
//! - `start`: Start the game (optionally wait for it to exit)
//! - `request`: Ask for a download, pre-download or repair in an elevated worker
//! - `activations`: Drain redirected activation requests
//! - `download` / `repair`: Worker entry points (spawned elevated by `request`)

mod commands;
mod error;
mod logging;
mod worker;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use launcher_core::{GameIdentity, LauncherConfig, Operation, VoiceLanguage, WorkerArgs, WorkerVerb};

use crate::commands::RequestKind;
use crate::error::Result;

#[derive(Parser)]
#[command(name = "launcherctl")]
#[command(about = "Game lifecycle launcher")]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to ~/.launcher/config.json)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print installation state, eligibility and the tracked game process
    Status {
        #[arg(long)]
        biz: GameIdentity,
    },

    /// Start the game
    Start {
        #[arg(long)]
        biz: GameIdentity,

        /// Start even if an instance is already running
        #[arg(long)]
        ignore_running: bool,

        /// Block until the game exits
        #[arg(long)]
        wait: bool,
    },

    /// Request an elevated operation
    Request {
        #[command(subcommand)]
        kind: RequestCommand,
    },

    /// Print and clear activation requests redirected to this machine's worker
    Activations {
        #[arg(long)]
        biz: GameIdentity,

        #[arg(long, value_enum, default_value_t = GateKind::Download)]
        operation: GateKind,
    },

    /// Worker: download or update game files (run elevated)
    Download(WorkerCommand),

    /// Worker: verify and repair game files (run elevated)
    Repair(WorkerCommand),
}

#[derive(Subcommand)]
enum RequestCommand {
    Download {
        #[arg(long)]
        biz: GameIdentity,

        /// Voice-language bit set (1 zh, 2 en, 4 ja, 8 ko)
        #[arg(long)]
        lang: Option<u32>,

        /// Verify and repair instead of downloading
        #[arg(long)]
        repair_mode: bool,
    },
    PreDownload {
        #[arg(long)]
        biz: GameIdentity,

        #[arg(long)]
        lang: Option<u32>,
    },
    Repair {
        #[arg(long)]
        biz: GameIdentity,

        #[arg(long)]
        lang: Option<u32>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum GateKind {
    Download,
    Repair,
}

#[derive(clap::Args)]
struct WorkerCommand {
    #[arg(long)]
    biz: GameIdentity,

    /// Install directory
    #[arg(long)]
    loc: PathBuf,

    /// Voice-language bit set
    #[arg(long)]
    lang: u32,
}

impl WorkerCommand {
    fn into_args(self, verb: WorkerVerb) -> WorkerArgs {
        WorkerArgs {
            verb,
            identity: self.biz,
            install_path: self.loc,
            language: VoiceLanguage::from_bits(self.lang),
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<Arc<LauncherConfig>> {
    let config = match path {
        Some(path) => LauncherConfig::load_from(path)?,
        None => LauncherConfig::load()?,
    };
    Ok(Arc::new(config))
}

fn run(cli: Cli) -> Result<()> {
    let config = load_config(cli.config.as_ref())?;
    match cli.command {
        Commands::Status { biz } => commands::status(&config, &biz),
        Commands::Start {
            biz,
            ignore_running,
            wait,
        } => commands::start(&config, &biz, ignore_running, wait),
        Commands::Request { kind } => {
            let (biz, kind, lang) = match kind {
                RequestCommand::Download {
                    biz,
                    lang,
                    repair_mode,
                } => (biz, RequestKind::Download { repair_mode }, lang),
                RequestCommand::PreDownload { biz, lang } => (biz, RequestKind::PreDownload, lang),
                RequestCommand::Repair { biz, lang } => (biz, RequestKind::Repair, lang),
            };
            commands::request(&config, &biz, kind, lang)
        }
        Commands::Activations { biz, operation } => {
            let operation = match operation {
                GateKind::Download => Operation::Download,
                GateKind::Repair => Operation::Repair,
            };
            commands::activations(&biz, operation)
        }
        Commands::Download(command) => worker::run(&config, &command.into_args(WorkerVerb::Download)),
        Commands::Repair(command) => worker::run(&config, &command.into_args(WorkerVerb::Repair)),
    }
}

fn main() {
    let _logging_guard = logging::init();
    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        tracing::error!(error = %e, "launcherctl failed");
        eprintln!("{e}");
        std::process::exit(1);
    }
}
