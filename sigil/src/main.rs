use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, Result, bail};
use serde::Serialize;
use zeroize::Zeroizing;

use sigil_agent::pem::parse_key_file;
use sigil_agent::{
    AgentClient, AgentKey, ClientError, Constraints, DirKeySource, Identity, KeySource as _,
    KeyMaterial, fingerprint, wire,
};
use sigil_core::config::Config;
use sigil_core::paths;

#[cfg(unix)]
type Stream = tokio::net::UnixStream;
#[cfg(windows)]
type Stream = tokio::net::windows::named_pipe::NamedPipeClient;

#[tokio::main]
async fn main() -> Result<()> {
    // Reset SIGPIPE to default so piping output to `head` etc. exits cleanly
    // instead of panicking with "broken pipe".
    #[cfg(unix)]
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let (global, args) = match GlobalArgs::parse(args) {
        Ok(parsed) => parsed,
        Err(e) => {
            eprintln!("error: {e:#}");
            std::process::exit(1);
        }
    };
    let cmd = args.first().map(String::as_str).unwrap_or("help");
    let rest = args.get(1..).unwrap_or_default();

    match cmd {
        "list" | "ls" => cmd_list(&global, rest).await,
        "add" => cmd_add(&global, rest).await,
        "add-file" => cmd_add_file(&global, rest).await,
        "remove" | "rm" => cmd_remove(&global, rest).await,
        "remove-all" => cmd_remove_all(&global).await,
        "socket" => {
            println!("{}", global.socket()?.display());
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_help();
            Ok(())
        }
        other => {
            eprintln!("unknown command: {other}");
            print_help();
            std::process::exit(1);
        }
    }
}

fn print_help() {
    println!(
        "\
sigil - manage keys held by the sigil SSH agent

USAGE:
    sigil [--socket <path>] [--config <path>] <command> [args...]

COMMANDS:
    list [--format=table|json]          List loaded identities (alias: ls)
    add <id> [--confirm] [--lifetime <secs>]
                                        Load key <id> from the key source directory
    add-file <path> [--confirm] [--lifetime <secs>]
                                        Load a private key file
    remove <id|path>                    Unload a key, named by source id or key file (alias: rm)
    remove-all                          Unload every key
    socket                              Print the agent endpoint
    help                                Show this help

FLAGS:
    --confirm                           Require interactive approval before the key signs
    --lifetime <secs>                   Unload the key automatically after <secs> seconds
    --socket <path>                     Agent endpoint (default: $SSH_AUTH_SOCK, then the
                                        configured/default sigil socket)
    -c, --config <path>                 Config file (default: $XDG_CONFIG_HOME/sigil/config.toml)

EXAMPLES:
    sigil add work --confirm
    sigil add-file ~/.ssh/id_ed25519 --lifetime 3600
    sigil list --format=json
    sigil remove work"
    );
}

/// Flags accepted before or after the command.
#[derive(Debug, Default, PartialEq, Eq)]
struct GlobalArgs {
    socket: Option<PathBuf>,
    config: Option<PathBuf>,
}

impl GlobalArgs {
    /// Split the global flags out of `args`, returning the remainder.
    fn parse(args: Vec<String>) -> Result<(Self, Vec<String>)> {
        let mut global = GlobalArgs::default();
        let mut rest = Vec::with_capacity(args.len());
        let mut iter = args.into_iter();
        while let Some(arg) = iter.next() {
            if arg == "--socket" || arg == "-s" {
                let value = iter.next().context("--socket requires a path argument")?;
                global.socket = Some(PathBuf::from(value));
            } else if let Some(value) = arg.strip_prefix("--socket=") {
                global.socket = Some(PathBuf::from(value));
            } else if arg == "--config" || arg == "-c" {
                let value = iter.next().context("--config requires a path argument")?;
                global.config = Some(PathBuf::from(value));
            } else if let Some(value) = arg.strip_prefix("--config=") {
                global.config = Some(PathBuf::from(value));
            } else {
                rest.push(arg);
            }
        }
        Ok((global, rest))
    }

    fn config(&self) -> Result<Config> {
        let path = self
            .config
            .clone()
            .unwrap_or_else(paths::default_config_path);
        Config::load(&path).with_context(|| format!("loading config {}", path.display()))
    }

    fn socket(&self) -> Result<PathBuf> {
        if let Some(socket) = &self.socket {
            return Ok(socket.clone());
        }
        if let Some(sock) = std::env::var_os("SSH_AUTH_SOCK").filter(|s| !s.is_empty()) {
            return Ok(PathBuf::from(sock));
        }
        Ok(self.config()?.agent.socket_path())
    }

    async fn connect(&self) -> Result<AgentClient<Stream>> {
        let socket = self.socket()?;
        AgentClient::connect(&socket)
            .await
            .with_context(|| "is sigild running? start it or pass --socket")
    }
}

/// Options shared by `add` and `add-file`.
#[derive(Debug, Default, PartialEq, Eq)]
struct AddArgs {
    target: String,
    constraints: Constraints,
}

impl AddArgs {
    fn parse(args: &[String]) -> Result<Self> {
        let mut target = None;
        let mut constraints = Constraints::default();
        let mut iter = args.iter();
        while let Some(arg) = iter.next() {
            let lifetime = if arg == "--lifetime" || arg == "-t" {
                Some(iter.next().context("--lifetime requires a number of seconds")?.as_str())
            } else {
                arg.strip_prefix("--lifetime=")
            };
            if let Some(secs) = lifetime {
                let secs: u32 = secs
                    .parse()
                    .with_context(|| format!("invalid --lifetime '{secs}'"))?;
                if secs == 0 {
                    bail!("--lifetime must be at least 1 second");
                }
                constraints.lifetime = Some(Duration::from_secs(u64::from(secs)));
            } else if arg == "--confirm" || arg == "-C" {
                constraints.confirm = true;
            } else if arg.starts_with('-') {
                bail!("unknown flag: {arg}");
            } else if target.replace(arg.clone()).is_some() {
                bail!("expected exactly one key argument");
            }
        }
        let target = target.context("missing key argument")?;
        Ok(Self {
            target,
            constraints,
        })
    }
}

#[derive(Debug, Serialize)]
struct IdentityRow {
    key_type: String,
    fingerprint: String,
    comment: String,
}

impl IdentityRow {
    fn from_identity(identity: &Identity) -> Self {
        let key_type = wire::read_string(&identity.blob, 0)
            .and_then(|(name, _)| std::str::from_utf8(name).ok())
            .unwrap_or("unknown")
            .to_string();
        Self {
            key_type,
            fingerprint: fingerprint(&identity.blob),
            comment: identity.comment.clone(),
        }
    }
}

async fn cmd_list(global: &GlobalArgs, args: &[String]) -> Result<()> {
    let mut json = false;
    for arg in args {
        match arg.as_str() {
            "--format=json" => json = true,
            "--format=table" => json = false,
            other => bail!("invalid argument: {other}"),
        }
    }

    let mut client = global.connect().await?;
    let rows: Vec<IdentityRow> = client
        .list_identities()
        .await?
        .iter()
        .map(IdentityRow::from_identity)
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
    } else if rows.is_empty() {
        println!("The agent has no identities.");
    } else {
        print_table(&rows);
    }
    Ok(())
}

fn print_table(rows: &[IdentityRow]) {
    const H_TYPE: &str = "TYPE";
    const H_FP: &str = "FINGERPRINT";

    let w_type = rows
        .iter()
        .map(|r| r.key_type.len())
        .max()
        .unwrap_or(0)
        .max(H_TYPE.len());
    let w_fp = rows
        .iter()
        .map(|r| r.fingerprint.len())
        .max()
        .unwrap_or(0)
        .max(H_FP.len());

    println!("{H_TYPE:<w_type$}  {H_FP:<w_fp$}  COMMENT");
    for row in rows {
        println!(
            "{:<w_type$}  {:<w_fp$}  {}",
            row.key_type, row.fingerprint, row.comment
        );
    }
}

async fn cmd_add(global: &GlobalArgs, args: &[String]) -> Result<()> {
    let add = AddArgs::parse(args)?;
    let config = global.config()?;
    let source = DirKeySource::new(config.source.dir());
    let sourced = source
        .fetch(&add.target)
        .await
        .with_context(|| format!("key source {}", source.dir().display()))?;
    add_key(global, &sourced.material, &sourced.comment, add.constraints).await
}

async fn cmd_add_file(global: &GlobalArgs, args: &[String]) -> Result<()> {
    let add = AddArgs::parse(args)?;
    let path = paths::expand_home(Path::new(&add.target));
    let (material, comment) = read_key_file(&path)?;
    add_key(global, &material, &comment, add.constraints).await
}

async fn add_key(
    global: &GlobalArgs,
    material: &KeyMaterial,
    comment: &str,
    constraints: Constraints,
) -> Result<()> {
    let key = AgentKey::from_material(material)?;
    let fp = fingerprint(&key.public_blob());
    let mut client = global.connect().await?;
    match client.add(&key, comment, constraints).await {
        Ok(()) => {
            println!("Identity added: {comment} ({fp})");
            if let Some(lifetime) = constraints.lifetime {
                println!("Lifetime set to {} seconds", lifetime.as_secs());
            }
            if constraints.confirm {
                println!("The user must confirm each use of the key");
            }
            Ok(())
        }
        Err(ClientError::Refused) => bail!("agent refused identity {comment} ({fp})"),
        Err(e) => Err(e.into()),
    }
}

async fn cmd_remove(global: &GlobalArgs, args: &[String]) -> Result<()> {
    let [target] = args else {
        bail!("usage: sigil remove <id|path>");
    };

    let path = paths::expand_home(Path::new(target));
    let (material, comment) = if path.is_file() {
        read_key_file(&path)?
    } else {
        let source = DirKeySource::new(global.config()?.source.dir());
        let sourced = source
            .fetch(target)
            .await
            .with_context(|| format!("'{target}' is neither a key file nor a source key"))?;
        (sourced.material, sourced.comment)
    };

    let blob = AgentKey::from_material(&material)?.public_blob();
    let mut client = global.connect().await?;
    match client.remove(&blob).await {
        Ok(()) => {
            println!("Identity removed: {comment} ({})", fingerprint(&blob));
            Ok(())
        }
        Err(ClientError::Refused) => bail!("agent does not hold {comment} ({})", fingerprint(&blob)),
        Err(e) => Err(e.into()),
    }
}

async fn cmd_remove_all(global: &GlobalArgs) -> Result<()> {
    let mut client = global.connect().await?;
    client.remove_all().await?;
    println!("All identities removed.");
    Ok(())
}

/// Parse a key file; the comment falls back to the file name.
fn read_key_file(path: &Path) -> Result<(KeyMaterial, String)> {
    let text = std::fs::read_to_string(path)
        .map(Zeroizing::new)
        .with_context(|| format!("reading {}", path.display()))?;
    let file = parse_key_file(&text).with_context(|| format!("parsing {}", path.display()))?;
    let comment = if file.comment.is_empty() {
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string())
    } else {
        file.comment
    };
    Ok((file.material, comment))
}
