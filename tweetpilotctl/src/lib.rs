use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use rusqlite::{Connection, OpenFlags};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tweetpilot_core::config::{GENERATOR_KEY_ENV, IDENTITY_ENV, SECRET_ENV};
use tweetpilot_core::{
    load_agent_config, Agent, AgentConfig, AgentJournal, ChromiumLauncher, Credentials,
    JobRunEntry, OpenAiGenerator, Supervisor,
};

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] tweetpilot_core::ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("journal error: {0}")]
    Journal(#[from] tweetpilot_core::JournalError),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("agent stopped: {0}")]
    Supervisor(#[from] tweetpilot_core::SupervisorError),
    #[error("required resource missing: {0}")]
    MissingResource(String),
    #[error("{0} check(s) failed")]
    CheckFailed(usize),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Autonomous posting and messaging agent", long_about = None)]
pub struct Cli {
    /// Path to the agent configuration
    #[arg(long, default_value = "configs/agent.toml")]
    pub config: PathBuf,
    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
    /// Output format for reports
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the agent under its supervisor
    Run(RunArgs),
    /// Validate configuration, credentials and journal files
    Check,
    /// Show recent job runs from the journal
    History(HistoryArgs),
    /// Print shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// Show the browser window
    #[arg(long, default_value_t = false)]
    pub headful: bool,
    /// Give up after this many restarts (unbounded when omitted)
    #[arg(long)]
    pub max_restarts: Option<u32>,
}

#[derive(Args, Debug)]
pub struct HistoryArgs {
    /// Number of runs to show
    #[arg(long, default_value_t = 20)]
    pub limit: usize,
}

pub fn run(cli: Cli) -> Result<()> {
    if let Commands::Completions { shell } = &cli.command {
        let mut command = Cli::command();
        clap_complete::generate(*shell, &mut command, "tweetpilotctl", &mut std::io::stdout());
        return Ok(());
    }

    if let Err(err) = dotenvy::dotenv() {
        if !err.not_found() {
            eprintln!("warning: failed to read .env: {err}");
        }
    }
    init_tracing(cli.log_format);
    let context = AppContext::new(&cli)?;

    match &cli.command {
        Commands::Run(args) => context.run_agent(args)?,
        Commands::Check => {
            let report = context.check(|name| std::env::var(name).ok());
            render(&report, cli.format)?;
            let failed = report
                .iter()
                .filter(|entry| matches!(entry.status, CheckStatus::Error))
                .count();
            if failed > 0 {
                return Err(AppError::CheckFailed(failed));
            }
        }
        Commands::History(args) => {
            let history = context.history(args)?;
            render(&history, cli.format)?;
        }
        Commands::Completions { .. } => {}
    }

    Ok(())
}

/// Installs the global subscriber. Logs go to stderr so reports on stdout stay parseable.
pub fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr);
    let result = match format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    if let Err(err) = result {
        eprintln!("warning: tracing already initialised: {err}");
    }
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

#[derive(Debug)]
struct AppContext {
    config: AgentConfig,
    config_path: PathBuf,
    journal_db: Option<PathBuf>,
    failure_log: Option<PathBuf>,
    diagnostics_dir: Option<PathBuf>,
}

impl AppContext {
    fn new(cli: &Cli) -> Result<Self> {
        let config_path = cli.config.clone();
        let config = load_agent_config(&config_path)?;
        let base_dir = std::env::current_dir()?;
        let resolve =
            |path: &Option<String>| path.as_ref().map(|p| config.resolve_path(&base_dir, p));

        Ok(Self {
            journal_db: resolve(&config.observability.journal_db),
            failure_log: resolve(&config.observability.failure_log),
            diagnostics_dir: resolve(&config.observability.diagnostics_dir),
            config_path,
            config,
        })
    }

    fn run_agent(&self, args: &RunArgs) -> Result<()> {
        let credentials = Credentials::from_env()?;
        let mut config = self.config.clone();
        if args.headful {
            config.browser.headless = false;
        }
        if args.max_restarts.is_some() {
            config.resilience.max_restarts = args.max_restarts;
        }
        config.observability.diagnostics_dir = self
            .diagnostics_dir
            .as_ref()
            .map(|dir| dir.to_string_lossy().into_owned());

        let generator = Arc::new(OpenAiGenerator::from_config(
            &config.generator,
            credentials.generator_api_key.clone(),
        ));
        let mut agent = Agent::new(&config, credentials, generator);
        if let Some(journal) = self.open_journal()? {
            agent = agent.with_journal(Arc::new(journal));
        }
        let launcher = ChromiumLauncher::new(config.browser.clone());
        let mut supervisor = Supervisor::new(launcher, agent, &config.resilience);

        info!(
            target: "tweetpilotctl",
            config = %self.config_path.display(),
            headless = config.browser.headless,
            max_restarts = ?config.resilience.max_restarts,
            "starting agent"
        );
        // Surfaces are not Send; everything runs on one thread.
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        runtime.block_on(async {
            tokio::select! {
                result = supervisor.run() => result.map_err(AppError::from),
                signal = tokio::signal::ctrl_c() => {
                    signal?;
                    warn!(target: "tweetpilotctl", "interrupt received, stopping agent");
                    Ok(())
                }
            }
        })
    }

    fn open_journal(&self) -> Result<Option<AgentJournal>> {
        match &self.journal_db {
            Some(db) => Ok(Some(AgentJournal::new(db, self.failure_log.as_deref())?)),
            None => Ok(None),
        }
    }

    fn check<F>(&self, lookup: F) -> Vec<HealthEntry>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut results = vec![HealthEntry::ok(
            "config",
            format!("{}", self.config_path.display()),
        )];
        for name in [IDENTITY_ENV, SECRET_ENV, GENERATOR_KEY_ENV] {
            results.push(match lookup(name) {
                Some(value) if !value.trim().is_empty() => HealthEntry::ok(name, "set"),
                _ => HealthEntry::error(name, "not set"),
            });
        }
        results.push(self.check_path(
            "browser executable",
            Path::new(&self.config.browser.executable_path),
        ));
        if let Some(db) = &self.journal_db {
            results.push(self.check_database("journal", db));
        }
        if let Some(log) = &self.failure_log {
            results.push(self.check_parent("failure log", log));
        }
        if let Some(dir) = &self.diagnostics_dir {
            results.push(self.check_parent("diagnostics", &dir.join("screenshot.png")));
        }
        results.push(HealthEntry::ok(
            "schedule",
            format!(
                "post every {}s, messages every {}s, {} conversations per cycle",
                self.config.schedule.post_interval_secs,
                self.config.schedule.message_interval_secs,
                self.config.conversations.max_per_cycle
            ),
        ));
        results
    }

    fn history(&self, args: &HistoryArgs) -> Result<History> {
        let db = self.journal_db.as_ref().ok_or_else(|| {
            AppError::MissingResource("observability.journal_db is not configured".into())
        })?;
        if !db.exists() {
            return Err(AppError::MissingResource(format!(
                "journal database missing: {}",
                db.display()
            )));
        }
        let journal = AgentJournal::new(db, None)?;
        Ok(History {
            rows: journal.recent_runs(args.limit)?,
        })
    }

    fn check_path(&self, name: &str, path: &Path) -> HealthEntry {
        if path.exists() {
            HealthEntry::ok(name, format!("{}", path.display()))
        } else {
            HealthEntry::warn(name, format!("{} missing", path.display()))
        }
    }

    fn check_parent(&self, name: &str, path: &Path) -> HealthEntry {
        match path.parent().map(fs::metadata) {
            Some(Ok(meta)) if meta.is_dir() => HealthEntry::ok(name, format!("{}", path.display())),
            Some(Ok(_)) => HealthEntry::error(
                name,
                format!("{} is not inside a directory", path.display()),
            ),
            _ => HealthEntry::warn(
                name,
                format!("{} will be created on first run", path.display()),
            ),
        }
    }

    fn check_database(&self, name: &str, path: &Path) -> HealthEntry {
        if !path.exists() {
            return HealthEntry::warn(
                name,
                format!("{} will be created on first run", path.display()),
            );
        }
        match Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY) {
            Ok(conn) => {
                let pragma: rusqlite::Result<String> =
                    conn.query_row("PRAGMA integrity_check;", [], |row| row.get(0));
                match pragma {
                    Ok(result) if result.to_lowercase() == "ok" => {
                        HealthEntry::ok(name, "integrity ok")
                    }
                    Ok(result) => HealthEntry::warn(name, format!("integrity_check: {result}")),
                    Err(err) => HealthEntry::warn(name, format!("error: {err}")),
                }
            }
            Err(err) => HealthEntry::error(name, format!("failed to open: {err}")),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct History {
    pub rows: Vec<JobRunEntry>,
}

impl DisplayFallback for History {
    fn display(&self) -> String {
        if self.rows.is_empty() {
            return "No job runs recorded".to_string();
        }
        let mut lines = Vec::new();
        for entry in &self.rows {
            lines.push(format!(
                "{ts} | {job:<14} | {outcome:<7} | {duration}ms | {detail}",
                ts = entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
                job = entry.job,
                outcome = entry.outcome,
                duration = entry.duration_ms,
                detail = entry.detail,
            ));
        }
        lines.join("\n")
    }
}

impl DisplayFallback for Vec<HealthEntry> {
    fn display(&self) -> String {
        let mut lines = Vec::new();
        for entry in self {
            lines.push(format!(
                "[{status}] {name}: {detail}",
                status = entry.status,
                name = entry.name,
                detail = entry.detail
            ));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct HealthEntry {
    pub name: String,
    pub status: CheckStatus,
    pub detail: String,
}

#[derive(Debug, Serialize)]
pub enum CheckStatus {
    #[serde(rename = "ok")]
    Ok,
    #[serde(rename = "warn")]
    Warn,
    #[serde(rename = "error")]
    Error,
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CheckStatus::Ok => "OK",
            CheckStatus::Warn => "WARN",
            CheckStatus::Error => "ERROR",
        };
        write!(f, "{}", label)
    }
}

impl HealthEntry {
    fn ok(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Ok,
            detail: detail.into(),
        }
    }

    fn warn(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Warn,
            detail: detail.into(),
        }
    }

    fn error(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Error,
            detail: detail.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn prepare_test_context() -> (TempDir, AppContext) {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        let config_src = fs::read_to_string("../configs/agent.toml").unwrap();
        let config_src = config_src
            .replace("data/journal.sqlite", &root.join("data/journal.sqlite").display().to_string())
            .replace("logs/failures.jsonl", &root.join("logs/failures.jsonl").display().to_string())
            .replace("logs/diagnostics", &root.join("logs/diagnostics").display().to_string());
        let config_path = root.join("agent.toml");
        fs::write(&config_path, config_src).unwrap();

        let cli = Cli {
            config: config_path,
            log_format: LogFormat::Text,
            format: OutputFormat::Json,
            command: Commands::Check,
        };
        let context = AppContext::new(&cli).unwrap();
        (temp, context)
    }

    #[test]
    fn cli_parses_run_flags() {
        let cli = Cli::try_parse_from([
            "tweetpilotctl",
            "--log-format",
            "json",
            "run",
            "--headful",
            "--max-restarts",
            "3",
        ])
        .unwrap();
        assert!(matches!(cli.log_format, LogFormat::Json));
        match cli.command {
            Commands::Run(args) => {
                assert!(args.headful);
                assert_eq!(args.max_restarts, Some(3));
            }
            other => panic!("unexpected command {other:?}"),
        }
        assert_eq!(cli.config, PathBuf::from("configs/agent.toml"));
    }

    #[test]
    fn check_reports_missing_credentials() {
        let (_temp, context) = prepare_test_context();
        let env: HashMap<&str, &str> = [(IDENTITY_ENV, "pilot"), (GENERATOR_KEY_ENV, "sk-test")]
            .into_iter()
            .collect();
        let report = context.check(|name| env.get(name).map(|v| v.to_string()));

        let secret = report.iter().find(|entry| entry.name == SECRET_ENV).unwrap();
        assert!(matches!(secret.status, CheckStatus::Error));
        let identity = report.iter().find(|entry| entry.name == IDENTITY_ENV).unwrap();
        assert!(matches!(identity.status, CheckStatus::Ok));
        assert!(!report.display().contains("sk-test"));
    }

    #[test]
    fn history_lists_recent_runs() {
        let (_temp, context) = prepare_test_context();
        let journal = context.open_journal().unwrap().unwrap();
        journal
            .record_run(&JobRunEntry::new("check_messages", "success", 850, "{}"))
            .unwrap();
        journal
            .record_run(&JobRunEntry::new("post", "failed", 1200, "timeout"))
            .unwrap();

        let history = context.history(&HistoryArgs { limit: 5 }).unwrap();
        assert_eq!(history.rows.len(), 2);
        assert!(history.display().contains("check_messages"));

        let limited = context.history(&HistoryArgs { limit: 1 }).unwrap();
        assert_eq!(limited.rows.len(), 1);
    }

    #[test]
    fn history_without_journal_is_an_error() {
        let (_temp, context) = prepare_test_context();
        let err = context.history(&HistoryArgs { limit: 5 }).unwrap_err();
        assert!(matches!(err, AppError::MissingResource(_)));
    }
}
