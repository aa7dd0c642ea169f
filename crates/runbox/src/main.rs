use std::fs;
use std::io::{self, IsTerminal, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use config::{Config, Environment, File, FileFormat};
use log::{LevelFilter, debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;

use runbox::api::{self, AppState};
use runbox::container::{ContainerRuntime, RuntimeType};
use runbox::session::{SessionService, SessionServiceConfig};

const APP_NAME: &str = "runbox";

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn async_main(ctx: RuntimeContext, cmd: ServeCommand) -> Result<()> {
    handle_serve(&ctx, cmd).await
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    let ctx = RuntimeContext::new(cli.common.clone())?;
    ctx.init_logging()?;
    debug!("config file: {}", ctx.paths.config_file.display());

    match cli.command {
        Command::Serve(cmd) => async_main(ctx, cmd),
        Command::Config { command } => handle_config(&ctx, command),
        Command::Completions { shell } => handle_completions(shell),
    }
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Runbox - ephemeral sandboxed Python execution server.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Reduce output to only errors
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Enable debug logging (equivalent to -vv)
    #[arg(long, global = true)]
    debug: bool,
    /// Enable trace logging (overrides other levels)
    #[arg(long, global = true)]
    trace: bool,
    /// Output machine readable JSON logs
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the execution server
    Serve(ServeCommand),
    /// Inspect or initialize the configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: Shell,
    },
}

#[derive(Debug, Clone, Args)]
struct ServeCommand {
    /// Override the listen host
    #[arg(long)]
    host: Option<String>,
    /// Override the listen port
    #[arg(short, long)]
    port: Option<u16>,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Print the effective configuration
    Show,
    /// Write the default configuration file
    Init,
    /// Print the configuration file path
    Path,
}

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct ServerConfig {
    /// Listen host.
    host: String,
    /// Listen port.
    port: u16,
    /// CORS origins. Empty allows any origin.
    allowed_origins: Vec<String>,
    /// Maximum upload size in megabytes.
    max_upload_size_mb: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            allowed_origins: Vec::new(),
            max_upload_size_mb: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct ContainerSection {
    /// Runtime to use. Auto-detected when unset.
    runtime: Option<RuntimeType>,
    /// Explicit binary path, overriding the runtime default.
    binary: Option<String>,
    /// Image used for every sandbox container.
    image: String,
    /// Memory limit per sandbox (e.g. "128m").
    memory_limit: Option<String>,
    /// CPU quota in microseconds per period.
    cpu_quota: Option<i64>,
    /// CPU period in microseconds.
    cpu_period: Option<i64>,
    /// Pull the sandbox image at startup if it is missing locally.
    pull_on_start: bool,
}

impl Default for ContainerSection {
    fn default() -> Self {
        Self {
            runtime: None,
            binary: None,
            image: "python:3.11-slim".to_string(),
            memory_limit: Some("128m".to_string()),
            cpu_quota: Some(50_000),
            cpu_period: Some(100_000),
            pull_on_start: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct SessionsSection {
    /// Host directory for artifact staging (shell-expanded).
    work_dir: String,
    /// Maximum accepted artifact size in bytes.
    max_artifact_bytes: usize,
    /// Sessions older than this are reclaimed by the reaper.
    max_session_age_seconds: i64,
    /// Reaper sweep interval in seconds.
    reap_interval_seconds: u64,
    /// Seconds to wait for a container to stop before killing it.
    stop_timeout_seconds: u32,
}

impl Default for SessionsSection {
    fn default() -> Self {
        Self {
            work_dir: "/tmp/runbox".to_string(),
            max_artifact_bytes: 1024 * 1024,
            max_session_age_seconds: 300,
            reap_interval_seconds: 30,
            stop_timeout_seconds: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct LoggingConfig {
    level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
struct AppConfig {
    server: ServerConfig,
    container: ContainerSection,
    sessions: SessionsSection,
    logging: LoggingConfig,
}

#[derive(Debug, Clone)]
struct AppPaths {
    config_file: PathBuf,
}

impl AppPaths {
    fn discover(override_path: Option<PathBuf>) -> Result<Self> {
        let config_file = match override_path {
            Some(path) => expand_path(path)?,
            None => dirs::config_dir()
                .map(|dir| dir.join(APP_NAME).join("config.toml"))
                .unwrap_or_else(|| PathBuf::from(format!("{APP_NAME}.toml"))),
        };

        Ok(Self { config_file })
    }
}

#[derive(Debug, Clone)]
struct RuntimeContext {
    common: CommonOpts,
    paths: AppPaths,
    config: AppConfig,
}

impl RuntimeContext {
    fn new(common: CommonOpts) -> Result<Self> {
        let paths = AppPaths::discover(common.config.clone())?;
        let config = load_config(&paths)?;
        Ok(Self {
            common,
            paths,
            config,
        })
    }

    fn init_logging(&self) -> Result<()> {
        use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

        if self.common.quiet {
            log::set_max_level(LevelFilter::Off);
            return Ok(());
        }

        let level = match self.effective_log_level() {
            LevelFilter::Off => "off",
            LevelFilter::Error => "error",
            LevelFilter::Warn => "warn",
            LevelFilter::Info => "info",
            LevelFilter::Debug => "debug",
            LevelFilter::Trace => "trace",
        };

        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("runbox={level},tower_http={level}")));

        // Use JSON output if --json flag is set, otherwise pretty format
        if self.common.json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()
                .ok();
        } else {
            let disable_color =
                std::env::var_os("NO_COLOR").is_some() || !io::stderr().is_terminal();

            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().with_ansi(!disable_color))
                .try_init()
                .ok();
        }

        // Also init env_logger for compatibility with log crate users
        let mut builder =
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
        builder.filter_level(self.effective_log_level());
        builder.try_init().ok();

        Ok(())
    }

    fn effective_log_level(&self) -> LevelFilter {
        if self.common.trace {
            LevelFilter::Trace
        } else if self.common.debug {
            LevelFilter::Debug
        } else {
            match self.common.verbose {
                0 => self
                    .config
                    .logging
                    .level
                    .parse()
                    .unwrap_or(LevelFilter::Info),
                1 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            }
        }
    }
}

fn load_config(paths: &AppPaths) -> Result<AppConfig> {
    let built = Config::builder()
        .add_source(
            File::from(paths.config_file.as_path())
                .format(FileFormat::Toml)
                .required(false),
        )
        .add_source(Environment::with_prefix("RUNBOX").separator("__"))
        .build()
        .context("building configuration")?;

    let config: AppConfig = built.try_deserialize().context("parsing configuration")?;
    Ok(config)
}

fn write_default_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {parent:?}"))?;
    }

    let config = AppConfig::default();
    let toml = toml::to_string_pretty(&config).context("serializing default config to TOML")?;
    let mut body = String::new();
    body.push_str("# Configuration for ");
    body.push_str(APP_NAME);
    body.push('\n');
    body.push_str("# File: ");
    body.push_str(&path.display().to_string());
    body.push('\n');
    body.push('\n');
    body.push_str(&toml);
    fs::write(path, body).with_context(|| format!("writing config file to {}", path.display()))
}

fn expand_path(path: PathBuf) -> Result<PathBuf> {
    if let Some(text) = path.to_str() {
        expand_str_path(text)
    } else {
        Ok(path)
    }
}

fn expand_str_path(text: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(text)
        .with_context(|| format!("expanding path '{text}'"))?
        .into_owned();
    Ok(PathBuf::from(expanded))
}

// ============================================================================
// Commands
// ============================================================================

async fn handle_serve(ctx: &RuntimeContext, cmd: ServeCommand) -> Result<()> {
    info!("Starting runbox execution server...");

    // Container runtime: explicit config wins, otherwise auto-detect
    let runtime = match (ctx.config.container.runtime, &ctx.config.container.binary) {
        (Some(rt), Some(binary)) => ContainerRuntime::with_binary(rt, binary.clone()),
        (Some(rt), None) => ContainerRuntime::with_type(rt),
        (None, _) => ContainerRuntime::new(),
    };

    match runtime.health_check().await {
        Ok(_) => info!("Container runtime ({}) is available", runtime.runtime_type()),
        Err(e) => warn!(
            "Container runtime health check failed: {:?}. Container operations may fail.",
            e
        ),
    }

    let work_dir = expand_str_path(&ctx.config.sessions.work_dir)?;
    fs::create_dir_all(&work_dir)
        .with_context(|| format!("creating work directory {}", work_dir.display()))?;

    let service_config = SessionServiceConfig {
        image: ctx.config.container.image.clone(),
        work_dir,
        max_artifact_bytes: ctx.config.sessions.max_artifact_bytes,
        memory_limit: ctx.config.container.memory_limit.clone(),
        cpu_quota: ctx.config.container.cpu_quota,
        cpu_period: ctx.config.container.cpu_period,
        stop_timeout_seconds: ctx.config.sessions.stop_timeout_seconds,
        max_session_age_seconds: ctx.config.sessions.max_session_age_seconds,
        reap_interval_seconds: ctx.config.sessions.reap_interval_seconds,
    };
    let service = Arc::new(SessionService::new(Arc::new(runtime), service_config));

    // Warm start: make sure the sandbox image is local before the first upload
    if ctx.config.container.pull_on_start
        && let Err(e) = service.ensure_image().await
    {
        warn!("Failed to warm up sandbox image: {e}. First submission may be slow or fail.");
    }

    let reaper = Arc::clone(&service).start_reaper_task();

    let state = AppState::new(Arc::clone(&service));
    let router = api::create_router(
        state,
        ctx.config.server.max_upload_size_mb,
        &ctx.config.server.allowed_origins,
    );

    let host = cmd.host.unwrap_or_else(|| ctx.config.server.host.clone());
    let port = cmd.port.unwrap_or(ctx.config.server.port);
    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .with_context(|| format!("invalid listen address {host}:{port}"))?;

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    info!("Listening on http://{addr}");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    // Mirror the shutdown path of the sandbox substrate: stop the reaper,
    // then tear down every live session before exiting.
    reaper.abort();
    service.shutdown_cleanup().await;
    info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}

fn handle_config(ctx: &RuntimeContext, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            let toml = toml::to_string_pretty(&ctx.config)
                .context("serializing effective config to TOML")?;
            print!("{toml}");
            Ok(())
        }
        ConfigCommand::Init => {
            if ctx.paths.config_file.exists() {
                println!(
                    "Config file already exists at {}",
                    ctx.paths.config_file.display()
                );
                return Ok(());
            }
            write_default_config(&ctx.paths.config_file)?;
            println!("Wrote {}", ctx.paths.config_file.display());
            Ok(())
        }
        ConfigCommand::Path => {
            println!("{}", ctx.paths.config_file.display());
            Ok(())
        }
    }
}

fn handle_completions(shell: Shell) -> Result<()> {
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    clap_complete::generate(shell, &mut cmd, name, &mut io::stdout());
    Ok(())
}
