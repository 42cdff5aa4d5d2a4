//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use sourcehub_core::{
    DispatchReport, FileConfigStore, InstanceConfigStore, MemoryConfigStore, Operation,
    ReloadReport, SourceManager,
};
use sourcehub_providers::ProviderRegistry;
use sourcehub_shared::{AppConfig, Params, config_file_path, init_config, load_config_from};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// SourceHub: aggregate content from pluggable source providers.
#[derive(Parser)]
#[command(
    name = "sourcehub",
    version,
    about = "Run source provider instances and aggregate their search and schedule results.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Config file (defaults to ~/.sourcehub/sourcehub.toml).
    #[arg(long, global = true, env = "SOURCEHUB_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// List the provider spec catalog.
    Specs,

    /// Load instances and show their status.
    Instances,

    /// Search every search-capable instance.
    Search {
        /// Keyword passed to each instance.
        keyword: String,

        #[command(flatten)]
        call: CallArgs,
    },

    /// Run `schedule` on every schedule-capable instance.
    Schedule {
        #[command(flatten)]
        call: CallArgs,
    },

    /// Run the `activate` handshake on one instance.
    Activate {
        /// Instance id.
        id: String,

        /// Parameter as key=value; value is parsed as JSON when possible.
        #[arg(short, long = "param", value_parser = parse_param)]
        params: Vec<(String, Value)>,
    },

    /// Load and activate instances, then keep them running until Ctrl-C.
    Run,

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Arguments shared by `search` and `schedule`.
#[derive(clap::Args, Debug)]
pub(crate) struct CallArgs {
    /// Ask instances to answer asynchronously.
    #[arg(long)]
    pub no_sync: bool,

    /// Parameter as key=value; value is parsed as JSON when possible.
    #[arg(short, long = "param", value_parser = parse_param)]
    pub params: Vec<(String, Value)>,

    /// Activate every instance before dispatching.
    #[arg(long)]
    pub activate: bool,

    /// Print the full dispatch report instead of just the items.
    #[arg(long)]
    pub report: bool,
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

/// Parse `key=value`. The value is JSON if it parses, otherwise a plain string.
fn parse_param(raw: &str) -> std::result::Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got `{raw}`"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty parameter name in `{raw}`"));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

fn to_params(pairs: Vec<(String, Value)>) -> Params {
    pairs.into_iter().collect()
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "sourcehub=info",
        1 => "sourcehub=debug",
        _ => "sourcehub=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .with_target(false)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config;
    match cli.command {
        Command::Specs => cmd_specs(),
        Command::Instances => cmd_instances(config_path.as_deref()).await,
        Command::Search { keyword, call } => {
            cmd_dispatch(config_path.as_deref(), Operation::Search, Some(keyword), call).await
        }
        Command::Schedule { call } => {
            cmd_dispatch(config_path.as_deref(), Operation::Schedule, None, call).await
        }
        Command::Activate { id, params } => {
            cmd_activate(config_path.as_deref(), &id, to_params(params)).await
        }
        Command::Run => cmd_run(config_path.as_deref()).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(),
            ConfigAction::Show => cmd_config_show(config_path.as_deref()),
        },
    }
}

// ---------------------------------------------------------------------------
// Manager setup
// ---------------------------------------------------------------------------

/// A loaded manager plus the task draining provider output into tracing.
struct Session {
    manager: SourceManager,
    sink: JoinHandle<()>,
}

impl Session {
    /// Load config, build the manager, and run the first reload.
    async fn open(config_path: Option<&Path>) -> Result<Self> {
        let (config, store) = resolve_config(config_path)?;
        let (manager, sink) = SourceManager::from_config(&config, store);

        let report = manager.reload().await?;
        log_reload(&report);
        Ok(Self { manager, sink })
    }

    /// Retire every instance and let the log sink flush.
    async fn close(self) {
        self.manager.shutdown().await;
        drop(self.manager);
        if tokio::time::timeout(Duration::from_secs(1), self.sink)
            .await
            .is_err()
        {
            warn!("provider log sink did not finish");
        }
    }
}

/// The config to run with and the store instances are reloaded from.
fn resolve_config(config_path: Option<&Path>) -> Result<(AppConfig, Arc<dyn InstanceConfigStore>)> {
    let path = match config_path {
        Some(path) => path.to_path_buf(),
        None => config_file_path()?,
    };

    if !path.exists() {
        if config_path.is_some() {
            return Err(eyre!("config file not found: {}", path.display()));
        }
        info!(path = %path.display(), "config file not found, running with no instances");
        return Ok((AppConfig::default(), Arc::new(MemoryConfigStore::default())));
    }

    let config = load_config_from(&path)?;
    Ok((config, Arc::new(FileConfigStore::new(path))))
}

fn log_reload(report: &ReloadReport) {
    for (id, message) in &report.errors {
        eprintln!("  ! {id}: {message}");
    }
    info!(
        loaded = report.loaded.len(),
        disabled = report.disabled.len(),
        errors = report.errors.len(),
        "instances loaded"
    );
}

fn spinner(message: &str) -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    spinner.set_message(message.to_string());
    spinner.enable_steady_tick(Duration::from_millis(80));
    spinner
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

fn cmd_specs() -> Result<()> {
    print_json(&ProviderRegistry::new().specs())
}

async fn cmd_instances(config_path: Option<&Path>) -> Result<()> {
    let session = Session::open(config_path).await?;
    let statuses = session.manager.instances();
    session.close().await;
    print_json(&statuses)
}

async fn cmd_dispatch(
    config_path: Option<&Path>,
    operation: Operation,
    keyword: Option<String>,
    call: CallArgs,
) -> Result<()> {
    let session = Session::open(config_path).await?;
    let mut params = to_params(call.params);

    if call.activate {
        activate_all(&session.manager, &params).await;
    }

    let progress = spinner(&format!("Running {operation} on instances..."));
    if let Some(keyword) = keyword {
        params.insert("keyword".into(), Value::String(keyword));
    }
    let report: DispatchReport = session
        .manager
        .dispatch(operation, !call.no_sync, params)
        .await;
    progress.finish_and_clear();
    session.close().await;

    for (id, message) in &report.failures {
        eprintln!("  ! {id}: {message}");
    }
    info!(
        operation = %operation,
        attempted = report.attempted,
        succeeded = report.succeeded,
        items = report.items.len(),
        "dispatch finished"
    );

    if call.report {
        print_json(&report)
    } else {
        print_json(&report.items)
    }
}

async fn cmd_activate(config_path: Option<&Path>, id: &str, params: Params) -> Result<()> {
    let session = Session::open(config_path).await?;
    let outcome = session.manager.activate(id, &params).await;
    session.close().await;

    match outcome? {
        Some(value) => print_json(&value),
        None => Err(eyre!("no live instance with id '{id}'")),
    }
}

async fn cmd_run(config_path: Option<&Path>) -> Result<()> {
    let session = Session::open(config_path).await?;
    activate_all(&session.manager, &Params::new()).await;

    info!(
        instances = session.manager.snapshot().len(),
        "running, press Ctrl-C to stop"
    );
    let signal = tokio::signal::ctrl_c().await;
    session.close().await;
    signal.map_err(|e| eyre!("failed to listen for Ctrl-C: {e}"))
}

async fn activate_all(manager: &SourceManager, params: &Params) {
    for (id, outcome) in manager.activate_all(params).await {
        match outcome {
            Ok(_) => info!(instance = %id, "instance activated"),
            Err(e) => eprintln!("  ! {id}: {e}"),
        }
    }
}

fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show(config_path: Option<&Path>) -> Result<()> {
    let (config, _) = resolve_config(config_path)?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn param_values_parse_as_json_when_possible() {
        assert_eq!(parse_param("limit=5").unwrap(), ("limit".into(), json!(5)));
        assert_eq!(parse_param("flag=true").unwrap(), ("flag".into(), json!(true)));
        assert_eq!(
            parse_param("season=2024 Fall").unwrap(),
            ("season".into(), json!("2024 Fall"))
        );
        assert_eq!(parse_param("q=a=b").unwrap(), ("q".into(), json!("a=b")));
    }

    #[test]
    fn malformed_params_are_rejected() {
        assert!(parse_param("novalue").is_err());
        assert!(parse_param("=x").is_err());
    }

    #[test]
    fn search_arguments_parse() {
        let cli = Cli::try_parse_from([
            "sourcehub", "search", "frieren", "--no-sync", "-p", "page=2", "--config",
            "/tmp/sourcehub.toml",
        ])
        .unwrap();
        assert_eq!(cli.config.as_deref(), Some(Path::new("/tmp/sourcehub.toml")));
        match cli.command {
            Command::Search { keyword, call } => {
                assert_eq!(keyword, "frieren");
                assert!(call.no_sync);
                assert!(!call.activate);
                assert_eq!(to_params(call.params)["page"], json!(2));
            }
            _ => panic!("expected search"),
        }
    }

    #[test]
    fn explicit_missing_config_is_an_error() {
        let Err(err) = resolve_config(Some(Path::new("/nonexistent/sourcehub.toml"))) else {
            panic!("expected missing config to fail");
        };
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn fixture_config_resolves_to_file_store() {
        let path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join("../../fixtures/config/sourcehub.fixture.toml");
        let (config, store) = resolve_config(Some(&path)).unwrap();
        assert_eq!(config.dispatch.call_timeout_secs, 10);
        assert_eq!(store.instance_confs().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn fixture_schedule_merges_static_items() {
        let path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join("../../fixtures/config/sourcehub.fixture.toml");
        let (config, store) = resolve_config(Some(&path)).unwrap();
        let records: Vec<Value> = store
            .instance_confs()
            .unwrap()
            .into_iter()
            .filter(|r| r["provider_type"] == "static_source_provider")
            .collect();
        let (manager, _sink) =
            SourceManager::from_config(&config, Arc::new(MemoryConfigStore::new(records)));
        manager.reload().await.unwrap();

        let items = manager.schedule(true, Params::new()).await;
        assert_eq!(items.len(), 2);
        manager.shutdown().await;
    }
}
