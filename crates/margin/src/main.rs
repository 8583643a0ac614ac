use std::env;
use std::fs;
use std::io::{self, Write as _};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{anyhow, Context as _};
use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use directories::BaseDirs;
use fs2::FileExt as _;
use margin::agent::agent_from_config;
use margin::feishu::FeishuClient;
use margin::poller::Poller;
use margin::reply::ReplyGenerator;
use margin::resolver::resolve_documents;
use margin::service::DocumentService;
use margin::state_store::StateStore;
use margin::{config_store, now_ms, providers};
use margin_core::config::{ConfigFile, HostOverrides, PollSettings};
use margin_core::paths::{compute_paths, MarginPaths, PathInputs};
use tokio::sync::watch;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "margin",
    version,
    about = "Margin: answers document comments with a language-model agent"
)]
struct Cli {
    #[arg(long, global = true, value_name = "DIR", env = "MARGIN_DIR")]
    margin_dir: Option<PathBuf>,

    #[arg(long, global = true, value_name = "PATH", env = "MARGIN_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, global = true, env = "MARGIN_LOG", value_name = "LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Poll on a fixed interval until interrupted.
    Run {
        #[command(flatten)]
        host: HostArgs,
    },
    /// Run a single poll cycle and print its report.
    Poll {
        #[command(flatten)]
        host: HostArgs,
    },
    /// Print the documents the next cycle would poll.
    Docs {
        #[command(flatten)]
        host: HostArgs,
    },
    State {
        #[command(subcommand)]
        command: StateCommand,
    },
    /// Print the user id replies are posted under.
    Whoami,
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    Version,
    Completion {
        #[command(subcommand)]
        command: CompletionCommand,
    },
}

/// Values the host supplies on top of the config file.
#[derive(Args, Debug, Default)]
struct HostArgs {
    /// Overrides `enabled` from the config file.
    #[arg(long, env = "MARGIN_ENABLED", value_name = "BOOL")]
    enabled: Option<bool>,

    #[arg(long, env = "MARGIN_POLL_INTERVAL_MINUTES", value_name = "N")]
    interval_minutes: Option<u64>,

    #[arg(long, env = "MARGIN_INDEX_DOCUMENT", value_name = "TOKEN")]
    index_document: Option<String>,

    #[arg(
        long = "watched-file",
        env = "MARGIN_WATCHED_FILES",
        value_name = "TOKEN",
        value_delimiter = ','
    )]
    watched_files: Vec<String>,
}

impl HostArgs {
    fn overrides(&self) -> HostOverrides {
        HostOverrides {
            enabled: self.enabled,
            poll_interval_minutes: self.interval_minutes,
            index_document: self.index_document.clone(),
            watched_files: (!self.watched_files.is_empty()).then(|| self.watched_files.clone()),
        }
    }
}

#[derive(Subcommand, Debug)]
enum StateCommand {
    Show,
    Path,
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    Show,
    Path,
    Get {
        key: String,
    },
    Set {
        key: String,
        value: String,
    },
}

#[derive(Subcommand, Debug)]
enum CompletionCommand {
    Bash,
    Fish,
    Powershell,
    Zsh,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let paths = resolve_paths(cli.margin_dir.as_ref(), cli.config.as_ref())?;

    // Commands that must work without a readable config file.
    match &cli.command {
        Command::Version => return version(),
        Command::Completion { command } => return completion(command),
        Command::State {
            command: StateCommand::Path,
        } => {
            println!("{}", paths.state_file.display());
            return Ok(());
        }
        Command::Config {
            command: ConfigCommand::Path,
        } => {
            println!("{}", paths.config_file.display());
            return Ok(());
        }
        _ => {}
    }

    let config = config_store::load(&paths.config_file).await;
    let config_level = config.as_ref().ok().and_then(|c| c.log_level.clone());
    init_logging(&paths, cli.log_level.as_deref(), config_level.as_deref())?;
    let config = config?;

    tracing::debug!(version = env!("CARGO_PKG_VERSION"), "margin starting");

    dispatch(cli.command, &paths, config).await
}

fn resolve_paths(
    margin_dir_override: Option<&PathBuf>,
    config_file_override: Option<&PathBuf>,
) -> anyhow::Result<MarginPaths> {
    let base_dirs = BaseDirs::new().ok_or_else(|| anyhow!("could not determine home directory"))?;
    let home_dir = base_dirs.home_dir().to_path_buf();

    let xdg_config_home = match env::var_os("XDG_CONFIG_HOME") {
        Some(v) => Some(PathBuf::from(v)),
        None => Some(base_dirs.config_dir().to_path_buf()),
    };

    let margin_dir_override = margin_dir_override
        .cloned()
        .or_else(|| env::var_os("MARGIN_DIR").map(PathBuf::from));

    Ok(compute_paths(PathInputs {
        home_dir,
        xdg_config_home,
        margin_dir_override,
        config_file_override: config_file_override.cloned(),
    }))
}

fn init_logging(
    paths: &MarginPaths,
    log_level: Option<&str>,
    config_level: Option<&str>,
) -> anyhow::Result<()> {
    let dir_ok = fs::create_dir_all(&paths.margin_dir).is_ok();

    let level = log_level
        .map(str::to_owned)
        .or_else(|| env::var("MARGIN_LOG").ok())
        .or_else(|| env::var("RUST_LOG").ok())
        .or_else(|| config_level.map(str::to_owned))
        .unwrap_or_else(|| "info".to_owned());

    let filter = EnvFilter::try_new(level).context("parse log level")?;

    let file_layer = if dir_ok {
        tracing_appender::rolling::RollingFileAppender::builder()
            .rotation(tracing_appender::rolling::Rotation::NEVER)
            .filename_prefix("margin")
            .filename_suffix("log")
            .build(&paths.margin_dir)
            .ok()
            .map(|file_appender| {
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(file_appender)
            })
    } else {
        None
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_ansi(true)
        .with_writer(io::stderr);

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(stderr_layer)
        .init();

    Ok(())
}

async fn dispatch(command: Command, paths: &MarginPaths, config: ConfigFile) -> anyhow::Result<()> {
    match command {
        Command::Run { host } => run_daemon(paths, &config, &host).await,
        Command::Poll { host } => poll_once(paths, &config, &host).await,
        Command::Docs { host } => docs(&config, &host).await,
        Command::State { command } => dispatch_state(command, paths).await,
        Command::Whoami => whoami(&config).await,
        Command::Config { command } => dispatch_config(command, paths, config).await,
        Command::Version => version(),
        Command::Completion { command } => completion(&command),
    }
}

fn feishu_client(config: &ConfigFile, settings: &PollSettings) -> anyhow::Result<Arc<FeishuClient>> {
    let opts = providers::feishu_options(config, &settings.file_type)?;
    Ok(Arc::new(FeishuClient::new(opts)?))
}

fn build_poller(
    paths: &MarginPaths,
    config: &ConfigFile,
    host: &HostArgs,
) -> anyhow::Result<Poller> {
    let settings = config.poll_settings(&host.overrides());
    let service = feishu_client(config, &settings)?;
    let agent = agent_from_config(config).context("configure agent")?;

    Ok(Poller::new(
        service,
        ReplyGenerator::new(agent),
        StateStore::new(paths.state_file.clone()),
        settings,
    ))
}

/// Holds `margin.lock` for the life of the returned file.
fn acquire_process_lock(paths: &MarginPaths) -> anyhow::Result<fs::File> {
    fs::create_dir_all(&paths.margin_dir)
        .with_context(|| format!("create {}", paths.margin_dir.display()))?;

    let lock_file = fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(&paths.lock_path)
        .with_context(|| format!("open lock file: {}", paths.lock_path.display()))?;
    lock_file.try_lock_exclusive().with_context(|| {
        format!(
            "another margin process is using {}",
            paths.margin_dir.display()
        )
    })?;

    Ok(lock_file)
}

async fn run_daemon(paths: &MarginPaths, config: &ConfigFile, host: &HostArgs) -> anyhow::Result<()> {
    let lock_file = acquire_process_lock(paths)?;
    let poller = build_poller(paths, config, host)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("shutdown requested");
        let _ = shutdown_tx.send(true);
    });

    poller.run(shutdown_rx).await;

    let _ = lock_file.unlock();
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate()).ok();
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = async {
                match sigterm.as_mut() {
                    Some(s) => { s.recv().await; }
                    None => std::future::pending::<()>().await,
                }
            } => {},
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

async fn poll_once(paths: &MarginPaths, config: &ConfigFile, host: &HostArgs) -> anyhow::Result<()> {
    let lock_file = acquire_process_lock(paths)?;
    let poller = build_poller(paths, config, host)?;

    let result = poller.run_cycle(now_ms()).await;
    let _ = lock_file.unlock();

    let report = result?;
    let out = serde_json::to_string_pretty(&report).context("serialize cycle report")?;
    println!("{out}");
    Ok(())
}

async fn docs(config: &ConfigFile, host: &HostArgs) -> anyhow::Result<()> {
    let settings = config.poll_settings(&host.overrides());
    let service = feishu_client(config, &settings)?;
    service
        .authenticate()
        .await
        .context("authenticate with document service")?;

    let documents = resolve_documents(service.as_ref(), &settings).await;
    if documents.is_empty() {
        println!("No documents to poll");
        return Ok(());
    }
    for doc in documents {
        println!("{doc}");
    }
    Ok(())
}

async fn whoami(config: &ConfigFile) -> anyhow::Result<()> {
    let settings = config.poll_settings(&HostOverrides::default());
    let service = feishu_client(config, &settings)?;
    let id = service.bot_identity().await?;
    println!("{id}");
    Ok(())
}

async fn dispatch_state(command: StateCommand, paths: &MarginPaths) -> anyhow::Result<()> {
    match command {
        StateCommand::Path => {
            println!("{}", paths.state_file.display());
            Ok(())
        }
        StateCommand::Show => {
            let state = StateStore::new(paths.state_file.clone()).load().await;
            if state.last_poll_time == 0 {
                println!("last poll: never");
            } else {
                println!("last poll: {}", format_poll_time(state.last_poll_time));
            }

            let docs = state.documents().collect::<Vec<_>>();
            if docs.is_empty() {
                println!("No processed comments");
                return Ok(());
            }
            for doc in docs {
                println!("{}\t{}", doc, state.processed_count(doc));
            }
            Ok(())
        }
    }
}

fn format_poll_time(ms: u64) -> String {
    let nanos = i128::from(ms) * 1_000_000;
    time::OffsetDateTime::from_unix_timestamp_nanos(nanos)
        .ok()
        .and_then(|dt| {
            dt.format(&time::format_description::well_known::Rfc3339)
                .ok()
        })
        .unwrap_or_else(|| ms.to_string())
}

async fn dispatch_config(
    command: ConfigCommand,
    paths: &MarginPaths,
    config: ConfigFile,
) -> anyhow::Result<()> {
    match command {
        ConfigCommand::Path => {
            println!("{}", paths.config_file.display());
            Ok(())
        }
        ConfigCommand::Show => {
            let out = toml::to_string_pretty(&redacted(config)).context("serialize config")?;
            print!("{out}");
            Ok(())
        }
        ConfigCommand::Get { key } => {
            let value = config.get_key_value(&key)?;
            match value {
                toml::Value::String(s) => println!("{s}"),
                toml::Value::Array(items) => {
                    let items = items
                        .iter()
                        .filter_map(|v| v.as_str())
                        .collect::<Vec<_>>();
                    println!("{}", items.join(","));
                }
                other => println!("{other}"),
            }
            Ok(())
        }
        ConfigCommand::Set { key, value } => {
            let next = config.set_key(&key, &value)?;
            config_store::save(&paths.config_file, &next).await?;
            Ok(())
        }
    }
}

fn redacted(mut config: ConfigFile) -> ConfigFile {
    const MASK: &str = "********";
    if let Some(feishu) = config.feishu.as_mut() {
        if feishu.app_secret.is_some() {
            feishu.app_secret = Some(MASK.to_owned());
        }
    }
    if let Some(agent) = config.agent.as_mut() {
        if agent.api_key.is_some() {
            agent.api_key = Some(MASK.to_owned());
        }
    }
    config
}

fn version() -> anyhow::Result<()> {
    println!("margin {}", env!("CARGO_PKG_VERSION"));
    Ok(())
}

fn completion(command: &CompletionCommand) -> anyhow::Result<()> {
    let shell = match command {
        CompletionCommand::Bash => Shell::Bash,
        CompletionCommand::Fish => Shell::Fish,
        CompletionCommand::Powershell => Shell::PowerShell,
        CompletionCommand::Zsh => Shell::Zsh,
    };

    let mut cmd = Cli::command();
    let mut buf = Vec::new();
    generate(shell, &mut cmd, "margin", &mut buf);
    match io::stdout().write_all(&buf) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::BrokenPipe => Ok(()),
        Err(err) => Err(err).context("write completion script to stdout"),
    }
}
