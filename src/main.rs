//! sshdock CLI - saved SSH connections, remote files and local port forwards
//!
//! Usage:
//!   sshdock connections add --host <host> --user <user> ...
//!   sshdock ls <connection> [path]
//!   sshdock sync <connection> <remote path>
//!   sshdock exec <connection> <command> --record
//!   sshdock forward run <connection>

use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::info;

use sshdock::config::{export_openssh_config, parse_openssh_config, Algorithms, SshConfig};
use sshdock::logging::{self, LogFilter, LogLevel, LogSubsystem};
use sshdock::sftp::transfer::{self, TransferDirection, TransferJob, TransferProgress};
use sshdock::sftp::tree::{self, FailurePolicy, SyncOptions};
use sshdock::sftp::RemoteFs;
use sshdock::storage::FileMode;
use sshdock::tunnel::{ForwardDescriptor, TunnelEvent};
use sshdock::{AppError, AppResult, AppState};

#[derive(Parser)]
#[command(name = "sshdock")]
#[command(about = "SSH connection manager, remote file browser and port forwarder", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config directory (default: the platform config dir)
    #[arg(long, global = true, env = "SSHDOCK_CONFIG_DIR")]
    config_dir: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage saved connections
    #[command(subcommand)]
    Connections(ConnectionCommands),

    /// Connect and run the liveness probe
    Check {
        /// Connection id (user@host:port) or name
        connection: String,
    },

    /// List a remote directory
    Ls {
        connection: String,
        /// Remote path (default: home directory)
        path: Option<String>,
    },

    /// Mirror a remote directory tree into local storage
    Sync {
        connection: String,
        remote_path: String,

        /// Keep walking when a directory cannot be listed
        #[arg(long)]
        best_effort: bool,
    },

    /// Download one file
    Get {
        connection: String,
        remote_path: String,
        /// Local destination (default: file name in the current directory)
        local_path: Option<PathBuf>,
    },

    /// Upload one file
    Put {
        connection: String,
        local_path: PathBuf,
        remote_path: String,
    },

    /// Create a remote directory
    Mkdir { connection: String, path: String },

    /// Create an empty remote file
    Touch { connection: String, path: String },

    /// Delete a remote file, or a directory with -r
    Rm {
        connection: String,
        path: String,

        /// Delete a directory and everything under it
        #[arg(short, long)]
        recursive: bool,
    },

    /// Rename or move a remote file or directory
    Mv {
        connection: String,
        from: String,
        to: String,
    },

    /// Run a command on the remote host and print its output
    Exec {
        connection: String,
        command: String,

        /// Also append the output to <storage>/logs/<connection>.log
        #[arg(long)]
        record: bool,
    },

    /// Download a file for editing and upload it again when the editor exits
    Open {
        connection: String,
        remote_path: String,

        /// Editor to run (default: $VISUAL, then $EDITOR)
        #[arg(long)]
        editor: Option<String>,
    },

    /// Manage local port forwards
    #[command(subcommand)]
    Forward(ForwardCommands),

    /// Show the activity log
    Logs {
        #[arg(short = 'n', long, default_value = "50")]
        lines: usize,

        #[arg(long, value_enum)]
        level: Option<LogLevel>,

        #[arg(long, value_enum)]
        subsystem: Option<LogSubsystem>,

        /// Only lines containing this text
        #[arg(long)]
        search: Option<String>,
    },
}

#[derive(Subcommand)]
enum ConnectionCommands {
    /// List saved connections
    List,

    /// Save a connection after verifying it can connect
    Add {
        #[arg(long)]
        name: Option<String>,

        #[arg(long)]
        host: String,

        #[arg(short, long, default_value = "22")]
        port: u16,

        #[arg(short, long)]
        user: String,

        #[arg(long, env = "SSHDOCK_PASSWORD")]
        password: Option<String>,

        /// Private key file
        #[arg(short = 'i', long)]
        identity: Option<PathBuf>,

        #[arg(long)]
        passphrase: Option<String>,

        /// Preferred ciphers, in order
        #[arg(long = "cipher")]
        ciphers: Vec<String>,

        /// Save without connecting first
        #[arg(long)]
        no_verify: bool,
    },

    /// Delete a saved connection
    Remove { connection: String },

    /// Import hosts from an OpenSSH client config
    Import {
        /// Config file (default: ~/.ssh/config)
        path: Option<PathBuf>,
    },

    /// Print saved connections as an OpenSSH client config
    Export {
        /// Write to a file instead of stdout
        path: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum ForwardCommands {
    /// List forwards declared for a connection
    List { connection: String },

    /// Declare a forward (and keep it running with --run)
    Add {
        connection: String,

        #[arg(long, default_value = "")]
        name: String,

        #[arg(long, default_value = "127.0.0.1")]
        local_host: String,

        #[arg(long)]
        local_port: u16,

        #[arg(long, default_value = "127.0.0.1")]
        remote_host: String,

        #[arg(long)]
        remote_port: u16,

        /// Keep forwarding until Ctrl+C
        #[arg(long)]
        run: bool,
    },

    /// Run one declared forward until Ctrl+C
    Start { connection: String, id: String },

    /// Delete a declared forward
    Remove { connection: String, id: String },

    /// Run every declared forward of a connection until Ctrl+C
    Run { connection: String },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "sshdock=debug,warn"
    } else {
        "sshdock=info,warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let state = sshdock::init(cli.config_dir)?;

    let result = match cli.command {
        Commands::Connections(cmd) => run_connections(&state, cmd).await,
        Commands::Check { connection } => run_check(&state, &connection).await,
        Commands::Ls { connection, path } => run_ls(&state, &connection, path).await,
        Commands::Sync {
            connection,
            remote_path,
            best_effort,
        } => run_sync(&state, &connection, &remote_path, best_effort).await,
        Commands::Get {
            connection,
            remote_path,
            local_path,
        } => run_get(&state, &connection, &remote_path, local_path).await,
        Commands::Put {
            connection,
            local_path,
            remote_path,
        } => run_put(&state, &connection, local_path, &remote_path).await,
        Commands::Open {
            connection,
            remote_path,
            editor,
        } => run_open(&state, &connection, &remote_path, editor).await,
        Commands::Mkdir { connection, path } => {
            run_remote_op(&state, &connection, move |fs| {
                fs.mkdir(&path)?;
                Ok(format!("Created {}", path))
            })
            .await
        }
        Commands::Touch { connection, path } => {
            run_remote_op(&state, &connection, move |fs| {
                fs.new_file(&path)?;
                Ok(format!("Created {}", path))
            })
            .await
        }
        Commands::Rm {
            connection,
            path,
            recursive,
        } => {
            run_remote_op(&state, &connection, move |fs| {
                if !fs.stat(&path)?.is_dir {
                    fs.delete_file(&path)?;
                } else if recursive {
                    fs.delete_dir_recursive(&path)?;
                } else {
                    return Err(AppError::Protocol(format!("{} is a directory (use -r)", path)));
                }
                Ok(format!("Deleted {}", path))
            })
            .await
        }
        Commands::Mv {
            connection,
            from,
            to,
        } => {
            run_remote_op(&state, &connection, move |fs| {
                fs.rename(&from, &to)?;
                Ok(format!("Moved {} to {}", from, to))
            })
            .await
        }
        Commands::Exec {
            connection,
            command,
            record,
        } => run_exec(&state, &connection, &command, record).await,
        Commands::Forward(cmd) => run_forward(&state, cmd).await,
        Commands::Logs {
            lines,
            level,
            subsystem,
            search,
        } => {
            let filter = LogFilter {
                level,
                subsystem,
                search,
                ..Default::default()
            };
            run_logs(lines, filter)
        }
    };

    state.shutdown();
    result
}

fn find_connection(state: &AppState, connection: &str) -> anyhow::Result<SshConfig> {
    Ok(state.connections.read().find(connection)?)
}

async fn run_connections(state: &AppState, cmd: ConnectionCommands) -> anyhow::Result<()> {
    match cmd {
        ConnectionCommands::List => {
            let connections = state.connections.read().list();
            if connections.is_empty() {
                println!("No saved connections");
            }
            for c in connections {
                println!(
                    "{:<32} {:<16} {}",
                    c.connection_id(),
                    c.name.as_deref().unwrap_or("-"),
                    if c.private_key_path.is_some() { "key" } else { "password" }
                );
            }
        }
        ConnectionCommands::Add {
            name,
            host,
            port,
            user,
            password,
            identity,
            passphrase,
            ciphers,
            no_verify,
        } => {
            let mut config = SshConfig::new(host, user);
            config.name = name;
            config.port = port;
            config.password = password;
            config.private_key_path = identity;
            config.passphrase = passphrase;
            if !ciphers.is_empty() {
                config.algorithms = Some(Algorithms { cipher: ciphers });
            }
            config.validate()?;

            if !no_verify {
                state
                    .pool
                    .acquire(&config, false)
                    .await
                    .with_context(|| format!("Could not connect to {}", config.connection_id()))?;
            }
            let id = state.connections.write().upsert(config)?;
            logging::log(LogLevel::Info, LogSubsystem::Config, format!("Saved connection {}", id));
            println!("Saved {}", id);
        }
        ConnectionCommands::Remove { connection } => {
            let config = find_connection(state, &connection)?;
            state.connections.write().delete(&config.connection_id())?;
            println!("Removed {}", config.connection_id());
        }
        ConnectionCommands::Import { path } => {
            let path = match path {
                Some(path) => path,
                None => dirs::home_dir()
                    .context("Could not find home directory")?
                    .join(".ssh")
                    .join("config"),
            };
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let imported = parse_openssh_config(&content);
            let count = state.connections.write().merge(imported)?;
            logging::log(
                LogLevel::Info,
                LogSubsystem::Config,
                format!("Imported {} connections from {}", count, path.display()),
            );
            println!("Imported {} connections", count);
        }
        ConnectionCommands::Export { path } => {
            let content = export_openssh_config(&state.connections.read().list());
            match path {
                Some(path) => {
                    std::fs::write(&path, content)?;
                    println!("Exported to {}", path.display());
                }
                None => print!("{}", content),
            }
        }
    }
    Ok(())
}

async fn run_check(state: &AppState, connection: &str) -> anyhow::Result<()> {
    let config = find_connection(state, connection)?;
    let session = state.pool.acquire(&config, false).await?;
    println!("{} is reachable (session {})", config.connection_id(), session.id());
    Ok(())
}

async fn remote_fs(state: &AppState, config: &SshConfig) -> anyhow::Result<RemoteFs> {
    let session = state.pool.acquire(config, true).await?;
    Ok(RemoteFs::new(session.file_channel().await?))
}

async fn run_ls(state: &AppState, connection: &str, path: Option<String>) -> anyhow::Result<()> {
    let config = find_connection(state, connection)?;
    let fs = remote_fs(state, &config).await?;
    let entries = fs
        .run(move |fs| {
            let path = match path {
                Some(path) => path,
                None => fs.home_dir()?,
            };
            fs.list_dir(&path)
        })
        .await?;

    for entry in entries {
        let modified = entry
            .modified
            .and_then(|t| chrono::DateTime::from_timestamp(t, 0))
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_default();
        let suffix = if entry.is_dir { "/" } else { "" };
        println!(
            "{} {:>10} {:<16} {}{}",
            entry.permissions, entry.size, modified, entry.name, suffix
        );
    }
    Ok(())
}

/// Run one blocking file operation and print what it did.
async fn run_remote_op<F>(state: &AppState, connection: &str, op: F) -> anyhow::Result<()>
where
    F: FnOnce(&RemoteFs) -> AppResult<String> + Send + 'static,
{
    let config = find_connection(state, connection)?;
    let fs = remote_fs(state, &config).await?;
    let message = fs.run(op).await?;
    println!("{}", message);
    Ok(())
}

async fn run_exec(
    state: &AppState,
    connection: &str,
    command: &str,
    record: bool,
) -> anyhow::Result<()> {
    let config = find_connection(state, connection)?;
    let session = state.pool.acquire(&config, false).await?;
    let output = session.transport().exec(command).await?;
    print!("{}", output);

    if record {
        let entry = format!(
            "[{}] $ {}\n{}",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
            command,
            output
        );
        let name = format!("{}.log", config.identifier());
        let path = state
            .store
            .record_file("logs", &name, entry.as_bytes(), FileMode::Append)?;
        info!("Recorded output to {}", path.display());
    }
    Ok(())
}

async fn run_sync(
    state: &AppState,
    connection: &str,
    remote_path: &str,
    best_effort: bool,
) -> anyhow::Result<()> {
    let config = find_connection(state, connection)?;
    let mut options = SyncOptions::default();
    if best_effort {
        options.snapshot_policy = FailurePolicy::BestEffort;
    }

    let (root, report) =
        tree::sync_local(&state.pool, &state.store, &config, remote_path, options).await?;

    println!(
        "Synced {} files ({} bytes) to {}",
        report.files_copied,
        report.bytes_copied,
        root.display()
    );
    for failure in &report.failures {
        println!("  failed: {} ({})", failure.path, failure.error);
    }
    Ok(())
}

fn print_progress(progress: TransferProgress) {
    eprint!(
        "\r{:>5.1}%  {:>12} bytes left  {:>10.0} B/s",
        progress.percent, progress.remaining, progress.speed
    );
    if progress.is_complete() {
        eprintln!();
    }
}

/// Cancel `job` on Ctrl+C.
fn cancel_on_ctrl_c(job: &TransferJob) -> tokio::task::JoinHandle<()> {
    let handle = job.handle();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("Cancelling transfer {}", handle.id());
            handle.cancel();
        }
    })
}

async fn run_get(
    state: &AppState,
    connection: &str,
    remote_path: &str,
    local_path: Option<PathBuf>,
) -> anyhow::Result<()> {
    let config = find_connection(state, connection)?;
    let local = match local_path {
        Some(path) => path,
        None => {
            let name = std::path::Path::new(remote_path)
                .file_name()
                .context("Remote path has no file name")?;
            PathBuf::from(name)
        }
    };
    let settings = state.settings.read().transfer.clone();
    let fs = remote_fs(state, &config).await?;

    let job = TransferJob::new(TransferDirection::Download);
    let ctrl_c = cancel_on_ctrl_c(&job);
    let result = transfer::download(&fs, job, remote_path, &local, &settings, print_progress).await;
    ctrl_c.abort();

    let bytes = result?;
    println!("Downloaded {} bytes to {}", bytes, local.display());
    Ok(())
}

async fn run_put(
    state: &AppState,
    connection: &str,
    local_path: PathBuf,
    remote_path: &str,
) -> anyhow::Result<()> {
    let config = find_connection(state, connection)?;
    if !local_path.is_file() {
        bail!("{} is not a file", local_path.display());
    }
    let settings = state.settings.read().transfer.clone();
    let fs = remote_fs(state, &config).await?;

    let job = TransferJob::new(TransferDirection::Upload);
    let ctrl_c = cancel_on_ctrl_c(&job);
    let result = transfer::upload(&fs, job, &local_path, remote_path, &settings, print_progress).await;
    ctrl_c.abort();

    let bytes = result?;
    println!("Uploaded {} bytes to {}", bytes, remote_path);
    Ok(())
}

async fn run_open(
    state: &AppState,
    connection: &str,
    remote_path: &str,
    editor: Option<String>,
) -> anyhow::Result<()> {
    let config = find_connection(state, connection)?;
    let settings = state.settings.read().transfer.clone();

    let local = transfer::open_remote(
        &state.pool,
        &state.store,
        &state.opened,
        &config,
        remote_path,
        None,
        &settings,
    )
    .await?;

    let editor = editor
        .or_else(|| std::env::var("VISUAL").ok())
        .or_else(|| std::env::var("EDITOR").ok());
    let Some(editor) = editor else {
        println!("{}", local.display());
        return Ok(());
    };

    let before = std::fs::metadata(&local)?.modified()?;
    let status = tokio::process::Command::new(&editor)
        .arg(&local)
        .status()
        .await
        .with_context(|| format!("Failed to run {}", editor))?;
    if !status.success() {
        bail!("{} exited with {}", editor, status);
    }

    if std::fs::metadata(&local)?.modified()? == before {
        println!("No changes to {}", remote_path);
        return Ok(());
    }
    let bytes = transfer::save_back(&state.pool, &state.opened, &local, &settings).await?;
    println!("Saved {} bytes back to {}", bytes, remote_path);
    Ok(())
}

async fn run_forward(state: &AppState, cmd: ForwardCommands) -> anyhow::Result<()> {
    match cmd {
        ForwardCommands::List { connection } => {
            let config = find_connection(state, &connection)?;
            let forwards = state.tunnels.list(&config);
            if forwards.is_empty() {
                println!("No forwards for {}", config.connection_id());
            }
            for f in forwards {
                println!(
                    "{:<48} {:<12} {} -> {}",
                    f.id,
                    f.name,
                    f.local_bind(),
                    f.remote_target()
                );
            }
        }
        ForwardCommands::Add {
            connection,
            name,
            local_host,
            local_port,
            remote_host,
            remote_port,
            run,
        } => {
            let config = find_connection(state, &connection)?;
            let descriptor = ForwardDescriptor::for_config(
                &config,
                name,
                local_host,
                local_port,
                remote_host,
                remote_port,
            );
            let forward = state.tunnels.create(&config, descriptor, true).await?;
            println!("Added {}", forward.id);
            if run {
                serve_forwards(state).await;
            } else {
                state.tunnels.stop(&forward.id)?;
            }
        }
        ForwardCommands::Start { connection, id } => {
            let config = find_connection(state, &connection)?;
            state.tunnels.start(&config, &id).await?;
            serve_forwards(state).await;
        }
        ForwardCommands::Remove { connection, id } => {
            let config = find_connection(state, &connection)?;
            let removed = state.tunnels.remove(&config, &id)?;
            println!("Removed {}", removed.id);
        }
        ForwardCommands::Run { connection } => {
            let config = find_connection(state, &connection)?;
            let results = state.tunnels.start_all(&config).await;
            if results.is_empty() {
                bail!("No forwards declared for {}", config.connection_id());
            }
            for (id, result) in &results {
                if let Err(e) = result {
                    eprintln!("{}: {}", id, e);
                }
            }
            if results.iter().all(|(_, r)| r.is_err()) {
                bail!("No forward could be started");
            }
            serve_forwards(state).await;
        }
    }
    Ok(())
}

/// Print tunnel events until Ctrl+C or until no forward is left running.
async fn serve_forwards(state: &AppState) {
    let mut events = state.tunnels.subscribe();
    for id in state.tunnels.active_ids() {
        if let Some(addr) = state.tunnels.local_addr(&id) {
            println!("Forwarding {} on {}", id, addr);
        }
    }
    println!("Press Ctrl+C to stop");

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(TunnelEvent::ConnectionOpened { id, peer }) => info!("[{}] connection from {}", id, peer),
                Ok(TunnelEvent::ConnectionClosed { id, peer }) => info!("[{}] {} closed", id, peer),
                Ok(TunnelEvent::Failed { id, error, .. }) => {
                    eprintln!("Forward {} failed: {}", id, error);
                    if state.tunnels.active_ids().is_empty() {
                        break;
                    }
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Dropped {} tunnel events", n);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
            _ = signal::ctrl_c() => {
                info!("Shutting down...");
                break;
            }
        }
    }
}

fn run_logs(lines: usize, filter: LogFilter) -> anyhow::Result<()> {
    let manager = logging::get_log_manager().context("Activity log is not initialized")?;
    for line in manager.get_recent_logs(lines, Some(&filter)) {
        let when = chrono::DateTime::from_timestamp_millis(line.timestamp)
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_default();
        println!(
            "{} {:<5} [{}] {}{}",
            when,
            line.level,
            line.subsystem,
            line.endpoint.map(|e| format!("{} ", e)).unwrap_or_default(),
            line.message
        );
    }
    Ok(())
}
