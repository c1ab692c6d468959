mod wrap;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};
use sidecar_core::events::EventLog;
use sidecar_core::manifest::Manifest;
use sidecar_core::session::SessionIdentity;
use sidecar_supervisor::daemon::{self, Endpoint, IpcClient, IpcClientError};
use sidecar_supervisor::pane::{PaneHost, TerminalWindowHost, TmuxPaneHost};
use sidecar_supervisor::watch::{ConfigWatcher, EnvFileWatcher};
use sidecar_supervisor::{InteractionBroker, Supervisor, SupervisorConfig, ToolDispatcher};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "sidecar",
    version,
    about = "Declarative dev-workspace process supervisor and interaction broker"
)]
struct Cli {
    /// Workspace manifest
    #[arg(long, global = true, default_value = "sidecar.yaml")]
    config: PathBuf,
    #[arg(long, global = true, default_value_t = false)]
    debug: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the workspace: become its daemon, or attach if one is running
    Up,
    /// Stop every process and shut the workspace daemon down
    Down,
    /// List processes and their status
    Ps {
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Show one process's full state
    Status { name: String },
    /// Print captured log lines
    Logs {
        name: String,
        /// stdout, stderr, or combined
        #[arg(long, default_value = "combined")]
        stream: String,
        #[arg(long)]
        tail: Option<usize>,
    },
    /// Print the local URL of a process
    Url { name: String },
    /// Start one process
    Start {
        name: String,
        #[arg(long, default_value_t = false)]
        force: bool,
        /// Extra KEY=VALUE env entries
        #[arg(long = "env")]
        env: Vec<String>,
        /// Extra arguments appended to the command
        #[arg(long)]
        args: Option<String>,
    },
    /// Stop one process
    Stop { name: String },
    /// Restart one process
    Restart { name: String },
    /// Re-read the manifest and apply the diff
    Reload,
    /// Floating interaction panes
    Interact {
        #[command(subcommand)]
        action: InteractCommands,
    },
    #[command(hide = true)]
    Wrap(wrap::WrapArgs),
}

#[derive(Subcommand)]
enum InteractCommands {
    /// Launch an interaction pane; prints its id immediately
    Create(CreateArgs),
    /// Block until an interaction's result event arrives
    Wait {
        id: String,
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Kill an interaction pane and record a cancel result
    Cancel { id: String },
}

#[derive(Args)]
struct CreateArgs {
    /// Inline question schema (JSON)
    #[arg(long)]
    schema: Option<String>,
    /// UI definition file
    #[arg(long)]
    file: Option<PathBuf>,
    /// Raw shell command to host in the pane
    #[arg(long)]
    command: Option<String>,
    #[arg(long)]
    title: Option<String>,
    #[arg(long)]
    timeout_ms: Option<u64>,
    /// Extra arguments for the UI runner (JSON)
    #[arg(long)]
    args: Option<String>,
    /// Block until the result arrives instead of returning the id
    #[arg(long, default_value_t = false)]
    wait: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    match cli.command {
        Commands::Wrap(args) => {
            std::process::exit(wrap::run(args).await);
        }
        command => {
            init_logging(cli.debug);
            match try_run(cli.config, command).await {
                Ok(()) => {}
                Err(err) => {
                    eprintln!("sidecar: {err:#}");
                    std::process::exit(1);
                }
            }
        }
    }
}

fn init_logging(debug: bool) {
    let level = if debug {
        "debug".to_string()
    } else {
        std::env::var("SIDECAR_LOG_LEVEL").unwrap_or_else(|_| "info".to_string())
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn try_run(config: PathBuf, command: Commands) -> Result<()> {
    let manifest_path = config
        .canonicalize()
        .or_else(|_| std::env::current_dir().map(|cwd| cwd.join(&config)))
        .context("resolving manifest path")?;
    let config_dir = manifest_path
        .parent()
        .map(PathBuf::from)
        .ok_or_else(|| anyhow!("manifest has no parent directory"))?;

    match command {
        Commands::Wrap(_) => unreachable!("handled before logging init"),
        Commands::Up => up(manifest_path, config_dir).await,
        Commands::Down => {
            let value = proxy_call(&manifest_path, &config_dir, "shutdown", Value::Null).await?;
            print_value(&value, false);
            Ok(())
        }
        Commands::Ps { json } => {
            let value =
                proxy_call(&manifest_path, &config_dir, "list_processes", Value::Null).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&value)?);
            } else {
                print_process_table(&value);
            }
            Ok(())
        }
        Commands::Status { name } => {
            let value =
                proxy_call(&manifest_path, &config_dir, "get_status", json!({ "name": name }))
                    .await?;
            println!("{}", serde_json::to_string_pretty(&value)?);
            Ok(())
        }
        Commands::Logs { name, stream, tail } => {
            let value = proxy_call(
                &manifest_path,
                &config_dir,
                "get_logs",
                json!({ "name": name, "stream": stream, "tail": tail }),
            )
            .await?;
            if let Some(lines) = value.as_array() {
                for line in lines {
                    if let Some(line) = line.as_str() {
                        println!("{line}");
                    }
                }
            }
            Ok(())
        }
        Commands::Url { name } => {
            let value =
                proxy_call(&manifest_path, &config_dir, "get_url", json!({ "name": name })).await?;
            match value.as_str() {
                Some(url) => println!("{url}"),
                None => bail!("no url known for this process yet"),
            }
            Ok(())
        }
        Commands::Start {
            name,
            force,
            env,
            args,
        } => {
            let env = parse_env_pairs(&env)?;
            let value = proxy_call(
                &manifest_path,
                &config_dir,
                "start_process",
                json!({ "name": name, "force": force, "env": env, "args": args }),
            )
            .await?;
            print_state_line(&value);
            Ok(())
        }
        Commands::Stop { name } => {
            let value =
                proxy_call(&manifest_path, &config_dir, "stop_process", json!({ "name": name }))
                    .await?;
            print_state_line(&value);
            Ok(())
        }
        Commands::Restart { name } => {
            let value = proxy_call(
                &manifest_path,
                &config_dir,
                "restart_process",
                json!({ "name": name }),
            )
            .await?;
            print_state_line(&value);
            Ok(())
        }
        Commands::Reload => {
            let value = proxy_call(&manifest_path, &config_dir, "reload", Value::Null).await?;
            println!("{}", serde_json::to_string_pretty(&value)?);
            Ok(())
        }
        Commands::Interact { action } => interact(&manifest_path, &config_dir, action).await,
    }
}

async fn interact(
    manifest_path: &PathBuf,
    config_dir: &PathBuf,
    action: InteractCommands,
) -> Result<()> {
    match action {
        InteractCommands::Create(args) => {
            let schema: Option<Value> = args
                .schema
                .as_deref()
                .map(serde_json::from_str)
                .transpose()
                .context("parsing --schema")?;
            let runner_args: Option<Value> = args
                .args
                .as_deref()
                .map(serde_json::from_str)
                .transpose()
                .context("parsing --args")?;
            let params = json!({
                "schema": schema,
                "file": args.file,
                "command": args.command,
                "title": args.title,
                "timeout_ms": args.timeout_ms,
                "args": runner_args,
            });
            let value =
                proxy_call(manifest_path, config_dir, "create_interaction", params).await?;
            let id = value
                .get("id")
                .and_then(Value::as_str)
                .ok_or_else(|| anyhow!("daemon returned no interaction id"))?
                .to_string();
            if args.wait {
                let result = proxy_call(
                    manifest_path,
                    config_dir,
                    "wait_interaction",
                    json!({ "id": id, "timeout_ms": args.timeout_ms }),
                )
                .await?;
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("{id}");
            }
            Ok(())
        }
        InteractCommands::Wait { id, timeout_ms } => {
            let value = proxy_call(
                manifest_path,
                config_dir,
                "wait_interaction",
                json!({ "id": id, "timeout_ms": timeout_ms }),
            )
            .await?;
            println!("{}", serde_json::to_string_pretty(&value)?);
            Ok(())
        }
        InteractCommands::Cancel { id } => {
            let value =
                proxy_call(manifest_path, config_dir, "cancel_interaction", json!({ "id": id }))
                    .await?;
            print_value(&value, false);
            Ok(())
        }
    }
}

/// One tool call against the workspace daemon. Every command except `up`
/// requires a live daemon.
async fn proxy_call(
    manifest_path: &PathBuf,
    config_dir: &PathBuf,
    method: &str,
    params: Value,
) -> Result<Value> {
    let manifest = Manifest::load(manifest_path).context("loading manifest")?;
    let identity = SessionIdentity::derive(config_dir, manifest.reuse_key())?;
    let mut client = IpcClient::connect(&identity)
        .await
        .map_err(|err| match err {
            IpcClientError::NoDaemon(path) => {
                anyhow!("no supervisor is running for this workspace (socket: {path}); run `sidecar up` first")
            }
            other => anyhow!(other),
        })?;
    client.call(method, params).await.map_err(|err| anyhow!(err))
}

/// Become the workspace daemon, or attach to a running one.
async fn up(manifest_path: PathBuf, config_dir: PathBuf) -> Result<()> {
    let manifest = Manifest::load(&manifest_path).context("loading manifest")?;
    // Validate before binding anything.
    manifest
        .resolve(&config_dir)
        .context("validating manifest")?;
    let identity = SessionIdentity::derive(&config_dir, manifest.reuse_key())?;

    if !manifest.reuse_enabled() {
        return run_daemon(manifest, manifest_path, config_dir, identity, None).await;
    }

    match daemon::connect_or_bind(&identity).await {
        Ok(Endpoint::Proxy(mut client)) => {
            info!(event = "attach_existing", session = %identity.session_name());
            let value = client
                .call("list_processes", Value::Null)
                .await
                .map_err(|err| anyhow!(err))?;
            println!("supervisor already running for this workspace");
            print_process_table(&value);
            Ok(())
        }
        Ok(Endpoint::Daemon(listener)) => {
            run_daemon(manifest, manifest_path, config_dir, identity, Some(listener)).await
        }
        Err(err) => Err(anyhow!(err)),
    }
}

async fn run_daemon(
    manifest: Manifest,
    manifest_path: PathBuf,
    config_dir: PathBuf,
    identity: SessionIdentity,
    listener: Option<daemon::Listener>,
) -> Result<()> {
    let runtime_dir = identity.runtime_dir();
    std::fs::create_dir_all(&runtime_dir).context("creating runtime directory")?;
    let event_log = EventLog::new(identity.events_file());

    let tmux_host = match std::env::var("SIDECAR_PANE_HOST").as_deref() {
        Ok("window") => None,
        _ => Some(Arc::new(TmuxPaneHost::new(identity.session_name()))),
    };
    let pane: Arc<dyn PaneHost> = match &tmux_host {
        Some(tmux) => tmux.clone(),
        None => Arc::new(TerminalWindowHost::new()),
    };

    let (supervisor, events_rx) = Supervisor::new(
        SupervisorConfig {
            config_dir: config_dir.clone(),
            settings: manifest.settings,
            runtime_dir,
            wrap_program: std::env::current_exe().context("locating sidecar binary")?,
        },
        Arc::clone(&pane),
        event_log.clone(),
    );
    supervisor
        .load(&manifest)
        .context("loading manifest into supervisor")?;
    supervisor.spawn_background(events_rx);

    let broker = InteractionBroker::new(Arc::clone(&pane), event_log, config_dir.clone());
    broker.spawn_result_watcher(supervisor.shutdown_rx());
    let dispatcher = ToolDispatcher::new(
        Arc::clone(&supervisor),
        Arc::clone(&broker),
        manifest_path.clone(),
    );

    spawn_watchers(&supervisor, manifest_path.clone());

    #[cfg(unix)]
    if let Some(listener) = listener {
        let serve_dispatcher = Arc::clone(&dispatcher);
        let serve_shutdown = supervisor.shutdown_rx();
        tokio::spawn(daemon::serve(listener, serve_dispatcher, serve_shutdown));
    }
    #[cfg(not(unix))]
    let _ = listener;

    info!(event = "daemon_start", session = %identity.session_name());
    if let Err(err) = supervisor.start_all().await {
        warn!(event = "start_all_partial", error = %err);
        eprintln!("sidecar: some processes failed to start: {err}");
    }

    wait_for_shutdown(&supervisor).await;
    info!(event = "daemon_stopping");
    supervisor.shutdown().await;
    if let Some(tmux) = tmux_host {
        let _ = tmux.kill_session().await;
    }
    let _ = std::fs::remove_file(identity.socket_path());
    let _ = dispatcher;
    Ok(())
}

/// Manifest hot-reload and env-file restarts, driven by debounced watchers.
fn spawn_watchers(supervisor: &Arc<Supervisor>, manifest_path: PathBuf) {
    let config_watcher = match ConfigWatcher::spawn(manifest_path, supervisor.shutdown_rx()) {
        Ok(watcher) => watcher,
        Err(err) => {
            warn!(event = "config_watcher_error", error = %err);
            return;
        }
    };
    let env_watcher = match EnvFileWatcher::spawn(supervisor.shutdown_rx()) {
        Ok(watcher) => watcher,
        Err(err) => {
            warn!(event = "env_watcher_error", error = %err);
            return;
        }
    };
    env_watcher.update(supervisor.env_file_map());

    enum Wakeup {
        Shutdown,
        Manifest(Option<Manifest>),
        EnvFiles(Option<std::collections::HashSet<String>>),
    }

    let supervisor = Arc::clone(supervisor);
    tokio::spawn(async move {
        let mut config_watcher = config_watcher;
        let mut env_watcher = env_watcher;
        let mut shutdown = supervisor.shutdown_rx();
        loop {
            let wakeup = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        Wakeup::Shutdown
                    } else {
                        continue;
                    }
                }
                manifest = config_watcher.manifests.recv() => Wakeup::Manifest(manifest),
                names = env_watcher.changed.recv() => Wakeup::EnvFiles(names),
            };
            match wakeup {
                Wakeup::Shutdown => break,
                Wakeup::Manifest(None) | Wakeup::EnvFiles(None) => break,
                Wakeup::Manifest(Some(manifest)) => match supervisor.reload(&manifest).await {
                    Ok(diff) => {
                        if !diff.is_empty() {
                            env_watcher.update(supervisor.env_file_map());
                        }
                    }
                    Err(err) => warn!(event = "reload_error", error = %err),
                },
                Wakeup::EnvFiles(Some(names)) => {
                    supervisor.on_env_files_changed(names).await;
                }
            }
        }
    });
}

async fn wait_for_shutdown(supervisor: &Arc<Supervisor>) {
    let mut shutdown = supervisor.shutdown_rx();
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("installing SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
            _ = shutdown.changed() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = shutdown.changed() => {}
        }
    }
}

fn parse_env_pairs(pairs: &[String]) -> Result<serde_json::Map<String, Value>> {
    let mut map = serde_json::Map::new();
    for pair in pairs {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| anyhow!("--env expects KEY=VALUE, got '{pair}'"))?;
        if key.is_empty() {
            bail!("--env expects KEY=VALUE, got '{pair}'");
        }
        map.insert(key.to_string(), Value::String(value.to_string()));
    }
    Ok(map)
}

fn print_value(value: &Value, pretty: bool) {
    if pretty {
        println!("{}", serde_json::to_string_pretty(value).unwrap_or_default());
    } else {
        println!("{value}");
    }
}

fn print_state_line(value: &Value) {
    let name = value.get("name").and_then(Value::as_str).unwrap_or("?");
    let status = value.get("status").and_then(Value::as_str).unwrap_or("?");
    let extra = value
        .get("error")
        .and_then(Value::as_str)
        .map(|error| format!(" ({error})"))
        .unwrap_or_default();
    println!("{name}: {status}{extra}");
}

fn print_process_table(value: &Value) {
    let Some(states) = value.as_array() else {
        println!("{value}");
        return;
    };
    println!(
        "{:<16} {:<10} {:>7} {:>6} {:<28} {:>8}",
        "NAME", "STATUS", "PID", "PORT", "URL", "RESTARTS"
    );
    for state in states {
        let field = |key: &str| -> String {
            match state.get(key) {
                Some(Value::String(text)) => text.clone(),
                Some(Value::Number(number)) => number.to_string(),
                _ => "-".to_string(),
            }
        };
        println!(
            "{:<16} {:<10} {:>7} {:>6} {:<28} {:>8}",
            field("name"),
            field("status"),
            field("pid"),
            field("port"),
            field("url"),
            field("restartCount"),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_pairs_parse_and_reject_garbage() {
        let parsed = parse_env_pairs(&["A=1".to_string(), "B=x=y".to_string()]).unwrap();
        assert_eq!(parsed["A"], "1");
        assert_eq!(parsed["B"], "x=y");
        assert!(parse_env_pairs(&["NOPE".to_string()]).is_err());
        assert!(parse_env_pairs(&["=v".to_string()]).is_err());
    }

    #[test]
    fn state_line_includes_errors() {
        // Exercised via print; just make sure the accessors tolerate
        // missing fields.
        print_state_line(&json!({"name": "api", "status": "crashed", "error": "boom"}));
        print_state_line(&json!({}));
    }
}
