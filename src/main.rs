use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc::UnboundedReceiver;

use hytale_manager::commands;
use hytale_manager::models::{ServerEvent, ServerProfile};
use hytale_manager::settings::ManagerSettings;
use hytale_manager::{logging, AppState};

const NOTIFICATION_DRAIN: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(author, version, about = "Manage local Hytale dedicated servers", long_about = None)]
struct Cli {
    /// Manager root directory (profiles, logs, backups, tools)
    #[arg(long, env = "HYTALE_MANAGER_ROOT_DIR", global = true)]
    root: Option<PathBuf>,

    /// Print events and results as JSON lines
    #[arg(long, global = true)]
    json: bool,

    /// Mirror the manager's own log to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List stored server profiles
    List,
    /// Add a server profile
    Add {
        #[arg(long)]
        name: String,
        /// Server directory
        #[arg(long)]
        path: String,
        #[arg(long, default_value = "HytaleServer.jar")]
        jar: String,
        #[arg(long, default_value = "", allow_hyphen_values = true)]
        java_args: String,
        #[arg(long)]
        java_path: Option<String>,
    },
    /// Remove a server profile
    Remove {
        id: String,
        /// Also delete the server directory
        #[arg(long)]
        delete_files: bool,
    },
    /// Start servers and attach to their consoles until they all stop.
    ///
    /// Lines typed on stdin go to the first server; prefix with `@<id> ` to
    /// target another one. Ctrl-C stops everything.
    Run {
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Snapshot a server directory into the backups folder
    Backup { id: String },
    /// List backups of a server, newest first
    Backups { id: String },
    /// Log a server profile in with a device code
    Login { id: String },
    /// Forget stored credentials of a server profile
    Logout { id: String },
    /// Refresh session tokens from the stored refresh token
    Refresh { id: String },
    /// Download server files with the downloader CLI
    Install { id: String },
    #[command(subcommand)]
    Tools(ToolCommand),
    /// Allow inbound UDP on the game port
    Firewall { port: Option<u16> },
    /// Print a file from the server directory
    ReadFile { id: String, filename: String },
    /// Replace a file in the server directory with the contents of `from`
    SaveFile {
        id: String,
        filename: String,
        #[arg(long)]
        from: PathBuf,
    },
}

#[derive(Subcommand, Debug)]
enum ToolCommand {
    /// Show downloader and Java availability
    Status,
    /// Download the downloader CLI
    DownloadCli,
    /// Download a Java runtime into the manager directory
    DownloadJava {
        #[arg(long)]
        url: Option<String>,
    },
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ToolStatus {
    downloader_installed: bool,
    java: hytale_manager::services::JavaStatus,
}

fn print_value<T: Serialize + std::fmt::Debug>(value: &T, json: bool) {
    if json {
        match serde_json::to_string(value) {
            Ok(line) => println!("{line}"),
            Err(err) => eprintln!("failed to encode output: {err}"),
        }
    } else {
        match serde_json::to_string_pretty(value) {
            Ok(text) => println!("{text}"),
            Err(_) => println!("{value:?}"),
        }
    }
}

fn print_event(event: &ServerEvent, json: bool) {
    if json {
        print_value(event, true);
        return;
    }
    match event {
        ServerEvent::ServerLog(payload) => println!("[{}] {}", payload.profile_id, payload.log),
        ServerEvent::ServerStateChange(payload) => println!(
            "[{}] -- {} --",
            payload.profile_id,
            if payload.is_running { "running" } else { "stopped" }
        ),
        ServerEvent::AuthNeeded(payload) => {
            let prompt = &payload.prompt;
            match (&prompt.url, &prompt.code) {
                (Some(url), Some(code)) => {
                    println!("[{}] Login required: open {url} and enter {code}", payload.profile_id)
                }
                _ => println!("[{}] Login required: {}", payload.profile_id, prompt.raw_line),
            }
        }
    }
}

fn spawn_printer(mut rx: UnboundedReceiver<ServerEvent>, json: bool) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            print_event(&event, json);
        }
    })
}

/// Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    result = tokio::signal::ctrl_c() => {
                        if let Err(err) = result {
                            tracing::warn!("ctrl-c handler failed: {}", err);
                        }
                    }
                    _ = terminate.recv() => tracing::info!("received SIGTERM"),
                }
                return;
            }
            Err(err) => tracing::warn!("SIGTERM handler unavailable: {}", err),
        }
    }
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!("ctrl-c handler failed: {}", err);
    }
}

async fn run_servers(state: &AppState, ids: Vec<String>, json: bool) -> Result<(), String> {
    let mut events = state.events.subscribe();
    for id in &ids {
        let outcome = commands::server::start_server(id.clone(), state).await?;
        tracing::info!("start {} -> {:?}", id, outcome);
    }
    let default_target = ids[0].clone();

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        if state.controller.running().is_empty() {
            while let Ok(event) = events.try_recv() {
                print_event(&event, json);
            }
            return Ok(());
        }
        tokio::select! {
            Some(event) = events.recv() => print_event(&event, json),
            line = stdin.next_line(), if stdin_open => match line {
                Ok(Some(line)) => {
                    let (target, text) = match line.strip_prefix('@').and_then(|rest| rest.split_once(' ')) {
                        Some((id, text)) => (id.to_string(), text.to_string()),
                        None => (default_target.clone(), line),
                    };
                    commands::server::send_command(target, text, state).await?;
                }
                _ => stdin_open = false,
            },
            _ = &mut shutdown => {
                let report = state.controller.shutdown_all(state.settings.shutdown_grace()).await;
                while let Ok(event) = events.try_recv() {
                    print_event(&event, json);
                }
                if !report.forced.is_empty() {
                    eprintln!("force-stopped: {}", report.forced.join(", "));
                }
                return Ok(());
            }
        }
    }
}

async fn execute(state: &AppState, command: Command, json: bool) -> Result<(), String> {
    match command {
        Command::List => print_value(&commands::server::get_servers(state).await?, json),
        Command::Add {
            name,
            path,
            jar,
            java_args,
            java_path,
        } => {
            let profile = ServerProfile {
                name,
                path,
                jar_file: jar,
                java_args,
                java_path,
                ..Default::default()
            };
            print_value(&commands::server::add_server(profile, state).await?, json);
        }
        Command::Remove { id, delete_files } => {
            if !commands::server::delete_server(id.clone(), delete_files, state).await? {
                return Err(format!("server config not found for ID {id}"));
            }
        }
        Command::Run { ids } => run_servers(state, ids, json).await?,
        Command::Backup { id } => print_value(&commands::server::backup_server(id, state).await?, json),
        Command::Backups { id } => print_value(&commands::server::list_backups(id, state)?, json),
        Command::Login { id } => {
            let printer = spawn_printer(state.events.subscribe(), json);
            let result = commands::auth::login_with_device_flow(id, state).await;
            printer.abort();
            let profile = result?;
            println!("Logged in; auto-refresh enabled for {}.", profile.id);
        }
        Command::Logout { id } => commands::auth::logout(id, state).await?,
        Command::Refresh { id } => {
            let profile = commands::auth::refresh_session(id, state).await?;
            println!("Session tokens refreshed for {}.", profile.id);
        }
        Command::Install { id } => {
            let printer = spawn_printer(state.events.subscribe(), json);
            let result = commands::tools::install_via_cli(id, state).await;
            printer.abort();
            print_value(&result?, json);
        }
        Command::Tools(ToolCommand::Status) => print_value(
            &ToolStatus {
                downloader_installed: commands::tools::check_cli_tool(state)?,
                java: commands::tools::check_java_installed(state).await?,
            },
            json,
        ),
        Command::Tools(ToolCommand::DownloadCli) => {
            print_value(&commands::tools::download_cli_tool(state).await?, json)
        }
        Command::Tools(ToolCommand::DownloadJava { url }) => {
            print_value(&commands::tools::download_java(url, state).await?, json)
        }
        Command::Firewall { port } => print_value(&commands::tools::setup_firewall(port, state).await?, json),
        Command::ReadFile { id, filename } => {
            print!("{}", commands::files::read_server_file(id, filename, state).await?)
        }
        Command::SaveFile { id, filename, from } => {
            let content = tokio::fs::read_to_string(&from)
                .await
                .map_err(|err| format!("failed to read {}: {err}", from.display()))?;
            commands::files::save_server_file(id, filename, content, state).await?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let settings = match ManagerSettings::load(cli.root.clone()) {
        Ok(settings) => settings,
        Err(err) => {
            eprintln!("failed to load settings: {err}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(err) = logging::init(&settings.log_dir, cli.verbose) {
        eprintln!("logging disabled: {err}");
    }
    tracing::info!("manager root: {}", settings.root_dir.display());

    let state = AppState::initialize(settings);
    let notifications = state.spawn_notifications();

    let result = execute(&state, cli.command, cli.json).await;
    state.events.close();
    if tokio::time::timeout(NOTIFICATION_DRAIN, notifications).await.is_err() {
        tracing::warn!("exiting with webhook notifications still pending");
    }

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("{}", err);
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}
