use std::env;
use std::fs;
use std::io::{self, IsTerminal, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use config::{Config, Environment, File, FileFormat};
use log::{LevelFilter, debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;

use parlor::api;
use parlor::app::build_state;
use parlor::auth::{AuthConfig, JwtVerifier};
use parlor::db::Database;
use parlor::store::{NewUser, UserRepository};
use parlor::ws::RelayConfig;

const APP_NAME: &str = "parlor";

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    let ctx = RuntimeContext::new(cli.common.clone())?;
    ctx.init_logging();
    debug!(
        "config file: {}, data dir: {}",
        ctx.paths.config_file.display(),
        ctx.paths.data_dir.display()
    );

    match cli.command {
        Command::Serve(cmd) => run_async(handle_serve(&ctx, cmd)),
        Command::Init(cmd) => handle_init(&ctx, cmd),
        Command::Config { command } => handle_config(&ctx, command),
        Command::User { command } => run_async(handle_user(&ctx, command)),
        Command::Token(cmd) => run_async(handle_token(&ctx, cmd)),
        Command::Completions { shell } => handle_completions(shell),
    }
}

fn run_async<F>(future: F) -> Result<()>
where
    F: std::future::Future<Output = Result<()>>,
{
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("starting tokio runtime")?
        .block_on(future)
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Parlor - real-time presence and broadcast relay.",
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
    /// Only log errors
    #[arg(short, long, global = true)]
    quiet: bool,
    /// Increase logging verbosity (-v debug, -vv trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Log as JSON lines; print command output as JSON
    #[arg(long, global = true, conflicts_with = "yaml")]
    json: bool,
    /// Print command output as YAML
    #[arg(long, global = true)]
    yaml: bool,
    /// Disable ANSI colors in log output
    #[arg(long = "no-color", global = true)]
    no_color: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the relay server
    Serve(ServeCommand),
    /// Write a default config file
    Init(InitCommand),
    /// Inspect and manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Manage users in the local directory
    User {
        #[command(subcommand)]
        command: UserCommand,
    },
    /// Issue a signed credential for a user
    Token(TokenCommand),
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Debug, Clone, Args)]
struct ServeCommand {
    /// Host address to bind to (overrides server.host)
    #[arg(long)]
    host: Option<String>,
    /// Port to listen on (overrides server.port)
    #[arg(short, long)]
    port: Option<u16>,
}

#[derive(Debug, Clone, Args)]
struct InitCommand {
    /// Overwrite an existing config file
    #[arg(long)]
    force: bool,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Output the effective configuration
    Show,
    /// Print the resolved config file path
    Path,
    /// Regenerate the default configuration file
    Reset,
}

#[derive(Debug, Subcommand)]
enum UserCommand {
    /// Add a user
    Add {
        /// Display name, unique
        username: String,
        /// Email address, unique
        email: String,
    },
}

#[derive(Debug, Clone, Args)]
struct TokenCommand {
    /// Username to issue the credential for
    username: String,
}

#[derive(Debug, Clone)]
struct RuntimeContext {
    common: CommonOpts,
    paths: AppPaths,
    config: AppConfig,
}

impl RuntimeContext {
    fn new(common: CommonOpts) -> Result<Self> {
        let mut paths = AppPaths::discover(common.config.clone())?;
        let config = load_or_init_config(&paths.config_file)?;
        if let Some(ref data_dir) = config.paths.data_dir {
            paths.data_dir = expand_path(data_dir)?;
        }

        fs::create_dir_all(&paths.data_dir)
            .with_context(|| format!("creating data directory {}", paths.data_dir.display()))?;

        Ok(Self {
            common,
            paths,
            config,
        })
    }

    fn init_logging(&self) {
        use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

        let level = self.log_level();
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            let level = level.as_str().to_ascii_lowercase();
            EnvFilter::new(format!("parlor={level},tower_http={level}"))
        });

        if self.common.json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()
                .ok();
        } else {
            let ansi = !self.common.no_color
                && env::var_os("NO_COLOR").is_none()
                && io::stderr().is_terminal();
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().with_ansi(ansi))
                .try_init()
                .ok();
        }

        // The relay modules log through the `log` facade.
        env_logger::Builder::from_env(env_logger::Env::default())
            .filter_level(level)
            .try_init()
            .ok();
    }

    fn log_level(&self) -> LevelFilter {
        if self.common.quiet {
            return LevelFilter::Error;
        }
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

    async fn open_database(&self) -> Result<Database> {
        let path = self.paths.data_dir.join("parlor.db");
        Database::new(&path)
            .await
            .with_context(|| format!("opening database {}", path.display()))
    }

    fn users(db: &Database) -> UserRepository {
        UserRepository::new(db.pool().clone())
    }
}

#[derive(Debug, Clone)]
struct AppPaths {
    config_file: PathBuf,
    data_dir: PathBuf,
}

impl AppPaths {
    fn discover(override_path: Option<PathBuf>) -> Result<Self> {
        let config_file = match override_path {
            Some(path) => {
                let expanded = expand_path(&path.to_string_lossy())?;
                if expanded.is_dir() {
                    expanded.join("config.toml")
                } else {
                    expanded
                }
            }
            None => xdg_dir("XDG_CONFIG_HOME", dirs::config_dir(), &[".config"])?.join("config.toml"),
        };

        Ok(Self {
            config_file,
            data_dir: xdg_dir("XDG_DATA_HOME", dirs::data_dir(), &[".local", "share"])?,
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct AppConfig {
    profile: String,
    logging: LoggingConfig,
    server: ServerConfig,
    paths: PathsConfig,
    auth: AuthConfig,
    relay: RelayConfig,
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

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct ServerConfig {
    host: String,
    port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
        }
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
struct PathsConfig {
    /// Directory holding `parlor.db`.
    data_dir: Option<String>,
}

fn handle_init(ctx: &RuntimeContext, cmd: InitCommand) -> Result<()> {
    // The config is written on first run; init only needs to act when forced.
    if !cmd.force {
        println!(
            "config already exists at {} (use --force to overwrite)",
            ctx.paths.config_file.display()
        );
        return Ok(());
    }
    write_default_config(&ctx.paths.config_file)
}

fn handle_config(ctx: &RuntimeContext, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            let rendered = if ctx.common.json {
                serde_json::to_string_pretty(&ctx.config).context("serializing config to JSON")?
            } else if ctx.common.yaml {
                serde_yaml::to_string(&ctx.config).context("serializing config to YAML")?
            } else {
                toml::to_string_pretty(&ctx.config).context("serializing config to TOML")?
            };
            println!("{rendered}");
            Ok(())
        }
        ConfigCommand::Path => {
            println!("{}", ctx.paths.config_file.display());
            Ok(())
        }
        ConfigCommand::Reset => write_default_config(&ctx.paths.config_file),
    }
}

fn handle_completions(shell: Shell) -> Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, APP_NAME, &mut io::stdout());
    Ok(())
}

async fn handle_user(ctx: &RuntimeContext, command: UserCommand) -> Result<()> {
    match command {
        UserCommand::Add { username, email } => {
            let db = ctx.open_database().await?;
            let user = RuntimeContext::users(&db)
                .create(NewUser { username, email })
                .await
                .context("creating user")?;

            if ctx.common.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&user).context("serializing user")?
                );
            } else {
                println!("{} {}", user.id, user.username);
            }
            Ok(())
        }
    }
}

async fn handle_token(ctx: &RuntimeContext, cmd: TokenCommand) -> Result<()> {
    let db = ctx.open_database().await?;
    let users = RuntimeContext::users(&db);
    let user = users
        .get_by_username(&cmd.username)
        .await
        .context("looking up user")?
        .ok_or_else(|| anyhow!("no user named {}", cmd.username))?;

    let verifier = JwtVerifier::new(&ctx.config.auth, Arc::new(users))
        .context("building credential verifier")?;
    let token = verifier
        .issue(&user.id, Some(&user.email))
        .map_err(|e| anyhow!("issuing token: {e}"))?;

    println!("{token}");
    Ok(())
}

async fn handle_serve(ctx: &RuntimeContext, cmd: ServeCommand) -> Result<()> {
    let host = cmd.host.unwrap_or_else(|| ctx.config.server.host.clone());
    let port = cmd.port.unwrap_or(ctx.config.server.port);

    info!("Starting {} ({})", APP_NAME, ctx.config.profile);
    if ctx.config.auth.dev_mode {
        warn!("Dev mode enabled: `dev:<user_id>` credentials are accepted");
    }

    let db = ctx.open_database().await?;
    let state = build_state(&db, ctx.config.auth.clone(), ctx.config.relay.clone()).await?;
    let relay = state.relay.clone();
    let app = api::create_router(state);

    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .with_context(|| format!("parsing listen address {host}:{port}"))?;
    let listener = TcpListener::bind(addr)
        .await
        .context("binding to address")?;
    info!("Listening on {}", addr);

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running server");

    relay.shutdown().await;
    info!("Server stopped");
    served
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                log::error!("failed to install signal handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}

fn load_or_init_config(config_file: &Path) -> Result<AppConfig> {
    if !config_file.exists() {
        write_default_config(config_file)?;
    }

    let config = Config::builder()
        .set_default("profile", "default")?
        .add_source(
            File::from(config_file)
                .format(FileFormat::Toml)
                .required(false),
        )
        .add_source(
            Environment::with_prefix(&APP_NAME.to_ascii_uppercase())
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("auth.allowed_origins")
                .try_parsing(true),
        )
        .build()?
        .try_deserialize()?;

    Ok(config)
}

fn write_default_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {}", parent.display()))?;
    }

    let mut config = AppConfig {
        profile: "default".to_string(),
        ..AppConfig::default()
    };
    config.auth.jwt_secret = Some(AuthConfig::generate_jwt_secret());

    let body = format!(
        "# Configuration for {APP_NAME}\n# File: {}\n\n{}",
        path.display(),
        toml::to_string_pretty(&config).context("serializing default config to TOML")?
    );
    fs::write(path, body).with_context(|| format!("writing config file to {}", path.display()))?;
    info!("Wrote default config to {}", path.display());
    Ok(())
}

fn expand_path(text: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(text).context("expanding path")?;
    Ok(PathBuf::from(expanded.as_ref()))
}

/// `$VAR/parlor` when set, else the platform directory, else `~/<fallback>/parlor`.
fn xdg_dir(var: &str, platform: Option<PathBuf>, fallback: &[&str]) -> Result<PathBuf> {
    let base = env::var_os(var)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .or(platform)
        .or_else(|| {
            dirs::home_dir().map(|home| fallback.iter().fold(home, |dir, part| dir.join(part)))
        })
        .ok_or_else(|| anyhow!("unable to determine {var} directory"))?;
    Ok(base.join(APP_NAME))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_default_config_is_valid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let config = load_or_init_config(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.profile, "default");
        assert_eq!(config.relay.connection_buffer, 64);
        assert_eq!(config.server.port, 5000);
        assert!(config.auth.validate().is_ok());
    }

    #[test]
    fn test_config_file_layering() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "[server]\nport = 6001\n\n[relay]\nmax_message_len = 500\n\n[auth]\ndev_mode = true\n",
        )
        .unwrap();

        let config = load_or_init_config(&path).unwrap();

        assert_eq!(config.server.port, 6001);
        assert_eq!(config.relay.max_message_len, 500);
        assert_eq!(config.relay.ping_interval_secs, 30);
        assert!(config.auth.dev_mode);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_xdg_dir_prefers_platform_then_home() {
        let dir = xdg_dir(
            "PARLOR_TEST_UNSET_XDG_VAR",
            Some(PathBuf::from("/opt/data")),
            &[".local", "share"],
        )
        .unwrap();
        assert_eq!(dir, PathBuf::from("/opt/data/parlor"));
    }
}
