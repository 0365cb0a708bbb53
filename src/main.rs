//! coterm CLI entry point.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use coterm::assistant::AssistantCatalog;
use coterm::server::run_server;
use coterm::session::SessionRegistry;

#[derive(Parser)]
#[command(name = "coterm")]
#[command(about = "Multi-client terminal sharing server for AI coding assistants")]
#[command(version)]
struct Cli {
    /// Listen address (`:9898` binds all interfaces)
    #[arg(long, default_value = ":9898")]
    addr: String,

    /// Custom assistant command line; exposes a "Custom" entry when set
    #[arg(long, default_value = "")]
    shell: String,

    /// Restart command line paired with --shell (defaults to --shell)
    #[arg(long, default_value = "")]
    shell_restart: String,

    /// Idle seconds before a session with zero clients is reaped
    #[arg(long, default_value = "3600")]
    session_ttl: u64,

    /// Working directory for spawned children and uploads
    #[arg(long)]
    working_directory: Option<PathBuf>,

    /// Directory uploaded files are written to, under the working directory
    #[arg(long, default_value = "uploads")]
    uploads_dir: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let custom = if cli.shell.is_empty() {
        None
    } else {
        let restart = if cli.shell_restart.is_empty() {
            cli.shell.clone()
        } else {
            cli.shell_restart.clone()
        };
        Some((cli.shell.clone(), restart))
    };

    let catalog = AssistantCatalog::detect(custom);
    if catalog.is_empty() {
        anyhow::bail!(
            "no assistants available: install one of claude, codex, gemini, aider \
             or pass a custom command with --shell"
        );
    }
    info!(assistants = ?catalog.names(), "available assistants");

    let uploads_dir = match &cli.working_directory {
        Some(dir) => dir.join(&cli.uploads_dir),
        None => cli.uploads_dir.clone(),
    };

    let registry = SessionRegistry::new(
        catalog,
        Duration::from_secs(cli.session_ttl),
        cli.working_directory,
        uploads_dir,
    );

    run_server(&cli.addr, registry).await
}
