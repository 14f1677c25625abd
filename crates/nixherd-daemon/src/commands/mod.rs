//! One-shot command surface.
//!
//! Each connection may carry a command vector (what the user typed after
//! `ssh nixherd`). The vector is parsed with clap and executed against the
//! shared supervisor, registry, and materializer; output and an exit code
//! travel back over the wire. `pks logs` switches the connection into
//! streaming mode instead of returning output.

mod ctx;
mod pks;

use std::sync::Arc;
use std::time::Duration;

use clap::error::ErrorKind;
use clap::{Parser, Subcommand};
use nixherd_core::builder::Builder;
use nixherd_core::bus::LogBus;
use nixherd_core::materializer::Materializer;
use nixherd_core::registry::RepoRegistry;
use nixherd_core::supervisor::Supervisor;

/// Budget for lazily materializing the active repository on behalf of a
/// command that needs supervisor state.
pub const HYDRATE_BUDGET: Duration = Duration::from_secs(300);

/// Shared state every command executes against.
pub struct CommandContext {
    /// Repository registry.
    pub registry: Arc<RepoRegistry>,

    /// The global supervisor.
    pub supervisor: Supervisor,

    /// Materializer feeding the supervisor.
    pub materializer: Materializer<Box<dyn Builder>>,

    /// Broadcast bus, used by attach sessions.
    pub bus: Arc<LogBus>,
}

/// Captured output of a one-shot command.
#[derive(Debug, Default)]
pub struct ExecResult {
    /// 0 on success, 1 on any handled error.
    pub exit_code: i32,

    /// Stdout text.
    pub stdout: String,

    /// Stderr text.
    pub stderr: String,
}

impl ExecResult {
    fn success(stdout: String) -> Self {
        Self {
            exit_code: 0,
            stdout,
            stderr: String::new(),
        }
    }

    fn failure(stdout: String, message: impl std::fmt::Display) -> Self {
        Self {
            exit_code: 1,
            stdout,
            stderr: format!("Error: {message}\n"),
        }
    }
}

/// What the connection handler should do after dispatch.
#[derive(Debug)]
pub enum Outcome {
    /// Write the result and close.
    Done(ExecResult),

    /// Stream the child's live stdout to the peer.
    Tail {
        /// Package to follow.
        key: String,
    },
}

#[derive(Parser, Debug)]
#[command(name = "nixherd")]
#[command(about = "A nix package runner and manager", long_about = None)]
#[command(disable_version_flag = true)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Manage repository contexts
    Ctx {
        #[command(subcommand)]
        action: Option<CtxAction>,
    },

    /// List and control packages from the active repository
    Pks {
        #[command(subcommand)]
        action: Option<PksAction>,
    },
}

#[derive(Subcommand, Debug)]
enum CtxAction {
    /// Register a repository URL and make it active
    Add {
        /// Flake reference, e.g. github:owner/repo
        url: String,
    },

    /// Rebuild every package from the active repository
    Update,
}

#[derive(Subcommand, Debug)]
enum PksAction {
    /// Start a package
    Start {
        /// Package key
        key: String,
    },

    /// Stop a running package
    Stop {
        /// Package key
        key: String,
    },

    /// Show package status
    Status {
        /// Package key; omit for an overview of all packages
        key: Option<String>,
    },

    /// Stream live logs from a running package
    Logs {
        /// Package key
        key: String,
    },
}

/// Parse and execute one command vector.
pub async fn dispatch(ctx: &CommandContext, argv: &[String]) -> Outcome {
    let full = std::iter::once("nixherd".to_string()).chain(argv.iter().cloned());
    let cli = match Cli::try_parse_from(full) {
        Ok(cli) => cli,
        Err(err) => {
            let rendered = err.render().to_string();
            let result = match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExecResult::success(rendered),
                _ => ExecResult {
                    exit_code: 1,
                    stdout: String::new(),
                    stderr: rendered,
                },
            };
            return Outcome::Done(result);
        }
    };

    tracing::info!(?argv, "executing command");
    match cli.command {
        Command::Ctx { action } => Outcome::Done(ctx::run(ctx, action).await),
        Command::Pks { action } => pks::run(ctx, action).await,
    }
}

/// Materialize the active repository if the supervisor map is empty.
///
/// Progress text is appended to `out`; the caller surfaces errors as its own
/// failure.
async fn ensure_materialized(ctx: &CommandContext, out: &mut String) -> Result<(), String> {
    if ctx.supervisor.has_items() {
        return Ok(());
    }

    let active = ctx
        .registry
        .get_active()
        .map_err(|err| err.to_string())?
        .ok_or_else(|| {
            "no repository set. Use 'nixherd ctx add' to set a repository".to_string()
        })?;

    out.push_str("→ Loading package state...\n");
    ctx.materializer
        .materialize_with_timeout(&active.url, HYDRATE_BUDGET)
        .await
        .map_err(|err| err.to_string())?;
    Ok(())
}
