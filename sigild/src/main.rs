mod agent;
mod approval;
mod bootstrap;

use std::path::PathBuf;

use anyhow::{Context as _, Result, bail};
use sigil_core::config::Config;
use sigil_core::paths;
use tracing_subscriber::EnvFilter;

use crate::agent::AgentManager;

#[tokio::main]
async fn main() -> Result<()> {
    let args = match DaemonArgs::parse(std::env::args().skip(1)) {
        Ok(ParsedArgs::Run(args)) => args,
        Ok(ParsedArgs::Help) => {
            print_help();
            return Ok(());
        }
        Err(e) => {
            eprintln!("error: {e:#}");
            eprintln!("run 'sigild --help' for usage");
            std::process::exit(2);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let config_path = args.config.unwrap_or_else(paths::default_config_path);
    let mut config = Config::load(&config_path)
        .with_context(|| format!("loading config {}", config_path.display()))?;
    tracing::info!("loaded config from {}", config_path.display());
    if let Some(socket) = args.socket {
        config.agent.socket_path = Some(socket);
    }

    // Before any key file is read.
    bootstrap::secure_bootstrap(config.agent.lock_memory);

    let mut manager = AgentManager::start(&config).await?;
    manager.preload(&config.key).await;

    // ssh-agent compatible output for `eval $(sigild)` style use.
    println!(
        "SSH_AUTH_SOCK={}; export SSH_AUTH_SOCK;",
        manager.endpoint().display()
    );
    tracing::info!(endpoint = %manager.endpoint().display(), "sigild ready");

    let signal = shutdown_signal().await;
    tracing::info!(signal, "shutting down");
    manager.stop().await;
    Ok(())
}

fn print_help() {
    println!(
        "\
sigild - SSH agent with key expiry and per-session approval

USAGE:
    sigild [--config <path>] [--socket <path>]

OPTIONS:
    -c, --config <path>     Config file (default: $XDG_CONFIG_HOME/sigil/config.toml)
    -s, --socket <path>     Listen here instead of [agent].socket_path
    -h, --help              Show this help

On start the daemon prints an SSH_AUTH_SOCK assignment, so
    eval \"$(sigild &)\"
points the current shell at it.  RUST_LOG controls log verbosity."
    );
}

#[derive(Debug, Default, PartialEq, Eq)]
struct DaemonArgs {
    config: Option<PathBuf>,
    socket: Option<PathBuf>,
}

#[derive(Debug, PartialEq, Eq)]
enum ParsedArgs {
    Run(DaemonArgs),
    Help,
}

impl DaemonArgs {
    fn parse(args: impl IntoIterator<Item = String>) -> Result<ParsedArgs> {
        let mut parsed = DaemonArgs::default();
        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            let (flag, inline) = match arg.split_once('=') {
                Some((flag, value)) if flag.starts_with("--") => (flag.to_string(), Some(value.to_string())),
                _ => (arg, None),
            };
            let slot = match flag.as_str() {
                "-h" | "--help" => return Ok(ParsedArgs::Help),
                "-c" | "--config" => &mut parsed.config,
                "-s" | "--socket" => &mut parsed.socket,
                other => bail!("unexpected argument '{other}'"),
            };
            let value = match inline {
                Some(value) => value,
                None => args
                    .next()
                    .with_context(|| format!("{flag} requires a path argument"))?,
            };
            if slot.replace(PathBuf::from(value)).is_some() {
                bail!("{flag} given more than once");
            }
        }
        Ok(ParsedArgs::Run(parsed))
    }
}

/// Resolve with the name of the first termination signal received.
async fn shutdown_signal() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
            (Ok(mut int), Ok(mut term)) => tokio::select! {
                _ = int.recv() => "SIGINT",
                _ = term.recv() => "SIGTERM",
            },
            (Err(e), _) | (_, Err(e)) => {
                tracing::warn!("cannot install signal handlers ({e}); waiting for ctrl-c only");
                let _ = tokio::signal::ctrl_c().await;
                "SIGINT"
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        "ctrl-c"
    }
}
