use clap::{Parser, Subcommand};
use latch::commands::hook::HookEvent;
use latch::output::Format;

#[derive(Parser)]
#[command(
    name = "latch",
    version,
    about = "Lease-based file locks for agents sharing one repository"
)]
struct Cli {
    /// Output format
    #[arg(long, global = true, value_enum, default_value = "json")]
    format: Format,
    /// Shorthand for --format pretty
    #[arg(long, global = true, hide = true)]
    pretty: bool,
    /// Session key naming this instance's identity (defaults to
    /// $LATCH_SESSION_ID, $CLAUDE_SESSION_ID, then the parent pid)
    #[arg(long, global = true)]
    session_id: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize .latch/ in the current directory
    Init,
    /// Show this session's instance identity
    Whoami {
        /// Record what this instance is working on
        #[arg(long)]
        task: Option<String>,
    },
    /// Report who holds a file (exit 10 if another instance does)
    Check {
        /// File path, absolute or relative to the current directory
        path: String,
    },
    /// Take or renew the lease on a file (exit 10 locked, 11 reclaimed)
    Acquire {
        path: String,
        /// What the lock is for
        #[arg(long)]
        intent: Option<String>,
    },
    /// Release a lock held by this instance
    Release {
        #[arg(required_unless_present = "all")]
        path: Option<String>,
        /// Release every lock held by this instance
        #[arg(long, conflicts_with = "path")]
        all: bool,
    },
    /// Compare a locked file against its recorded fingerprint (exit 12 if changed)
    Conflict { path: String },
    /// List active locks
    Locks,
    /// List registered instances
    Instances,
    /// Remove expired locks and stale instances
    Prune,
    /// Host hook entry point: reads event JSON on stdin
    Hook {
        #[arg(value_enum)]
        event: HookEvent,
    },
}

fn run(cli: Cli, format: Format) -> latch::error::Result<i32> {
    let session_id = cli.session_id.as_deref();

    // Hooks must never fail the host's tool call.
    if let Commands::Hook { event } = &cli.command {
        let cwd = std::env::current_dir().unwrap_or_else(|_| std::path::PathBuf::from("."));
        return latch::commands::hook::run(*event, session_id, &cwd);
    }

    let cwd = std::env::current_dir()?;
    if let Commands::Init = &cli.command {
        latch::commands::init::run(&cwd)?;
        return Ok(0);
    }

    let root = latch::store::repo::find_coordination_root(&cwd)?;
    let repo = latch::store::repo::Repo::open(&root)?;

    match cli.command {
        Commands::Init | Commands::Hook { .. } => unreachable!(),
        Commands::Whoami { task } => {
            latch::commands::whoami::run(&repo, session_id, task.as_deref(), &cwd, format)?;
            Ok(0)
        }
        Commands::Check { path } => {
            latch::commands::lock::check(&repo, session_id, &path, &cwd, format)
        }
        Commands::Acquire { path, intent } => latch::commands::lock::acquire(
            &repo,
            session_id,
            &path,
            intent.as_deref(),
            &cwd,
            format,
        ),
        Commands::Release { path, all } => {
            latch::commands::lock::release(&repo, session_id, path.as_deref(), all, &cwd, format)
        }
        Commands::Conflict { path } => latch::commands::lock::conflict(&repo, &path, &cwd, format),
        Commands::Locks => {
            latch::commands::list::locks(&repo, format)?;
            Ok(0)
        }
        Commands::Instances => {
            latch::commands::list::instances(&repo, format)?;
            Ok(0)
        }
        Commands::Prune => {
            latch::commands::prune::run(&repo, format)?;
            Ok(0)
        }
    }
}

fn main() {
    latch::logging::init();
    let cli = Cli::parse();
    let format = if cli.pretty {
        Format::Pretty
    } else {
        cli.format
    };
    match run(cli, format) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            match format {
                Format::Json => {
                    eprintln!(
                        "{}",
                        serde_json::json!({
                            "error": e.code(),
                            "message": e.to_string()
                        })
                    );
                }
                _ => eprintln!("error: {e}"),
            }
            std::process::exit(1);
        }
    }
}
