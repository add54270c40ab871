use std::{path::PathBuf, sync::OnceLock};

use clap::Parser;
use logger::{LogConfig, LogLevel};
use serde::Deserialize;

/// Build and run a task document's DAG of container-image steps against
/// the local engine.
#[derive(Parser, Debug)]
#[command(name = "imagegraph", version)]
pub struct CliArgs {
  /// Path to the task document (YAML).
  pub task_file: PathBuf,

  /// Optional config file layered under environment and CLI overrides.
  #[arg(long)]
  pub config_path: Option<PathBuf>,

  /// Registry host prefixed onto unqualified image tags.
  #[arg(long)]
  pub registry: Option<String>,

  #[arg(long)]
  pub log_level: Option<LogLevelArg>,

  /// Maximum number of steps running a container-engine command at once.
  /// Unset means unbounded.
  #[arg(long)]
  pub max_concurrency: Option<usize>,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
pub enum LogLevelArg {
  Error,
  Warn,
  Info,
  Debug,
  Trace,
}

impl From<LogLevelArg> for LogLevel {
  fn from(level: LogLevelArg) -> Self {
    match level {
      LogLevelArg::Error => LogLevel::Error,
      LogLevelArg::Warn => LogLevel::Warn,
      LogLevelArg::Info => LogLevel::Info,
      LogLevelArg::Debug => LogLevel::Debug,
      LogLevelArg::Trace => LogLevel::Trace,
    }
  }
}

/// Environment overrides, all optional: anything unset falls through to
/// the file config, then to the built-in default.
#[derive(Debug, Deserialize)]
pub struct Env {
  pub imagegraph_registry: Option<String>,
  pub imagegraph_registry_username: Option<String>,
  pub imagegraph_registry_password: Option<String>,
  pub imagegraph_max_concurrency: Option<usize>,
  pub imagegraph_logging_level: Option<LogLevel>,
  pub imagegraph_logging_stdio: Option<logger::StdioLogMode>,
  pub imagegraph_logging_otlp_endpoint: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct FileConfig {
  #[serde(default)]
  pub registry: Option<String>,
  #[serde(default)]
  pub max_concurrency: Option<usize>,
  #[serde(default)]
  pub logging: LogConfig,
}

#[derive(Debug)]
pub struct Config {
  pub registry: String,
  pub registry_username: Option<String>,
  pub registry_password: Option<String>,
  pub max_concurrency: Option<usize>,
  pub logging: LogConfig,
}

pub fn cli_args() -> &'static CliArgs {
  static ARGS: OnceLock<CliArgs> = OnceLock::new();
  ARGS.get_or_init(CliArgs::parse)
}

pub fn config() -> &'static Config {
  static CONFIG: OnceLock<Config> = OnceLock::new();
  CONFIG.get_or_init(|| {
    let env: Env = envy::from_env()
      .expect("failed to parse imagegraph environment variables");
    let args = cli_args();

    let file = args
      .config_path
      .as_deref()
      .map(|path| {
        let text = std::fs::read_to_string(path)
          .unwrap_or_else(|e| panic!("failed to read {}: {e}", path.display()));
        serde_yaml_ng::from_str::<FileConfig>(&text)
          .unwrap_or_else(|e| panic!("failed to parse {}: {e}", path.display()))
      })
      .unwrap_or_default();

    Config {
      registry: args
        .registry
        .clone()
        .or(env.imagegraph_registry)
        .or(file.registry)
        .unwrap_or_default(),
      registry_username: env.imagegraph_registry_username,
      registry_password: env.imagegraph_registry_password,
      max_concurrency: args
        .max_concurrency
        .or(env.imagegraph_max_concurrency)
        .or(file.max_concurrency),
      logging: LogConfig {
        level: args
          .log_level
          .map(LogLevel::from)
          .or(env.imagegraph_logging_level)
          .unwrap_or(file.logging.level),
        stdio: env.imagegraph_logging_stdio.unwrap_or(file.logging.stdio),
        otlp_endpoint: env
          .imagegraph_logging_otlp_endpoint
          .unwrap_or(file.logging.otlp_endpoint),
        ..file.logging
      },
    }
  })
}
