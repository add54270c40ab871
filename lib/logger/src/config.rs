use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StdioLogMode {
  Standard,
  Json,
  None,
}

impl Default for StdioLogMode {
  fn default() -> Self {
    StdioLogMode::Standard
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
  Error,
  Warn,
  Info,
  Debug,
  Trace,
}

impl Default for LogLevel {
  fn default() -> Self {
    LogLevel::Info
  }
}

impl From<LogLevel> for tracing::Level {
  fn from(level: LogLevel) -> Self {
    match level {
      LogLevel::Error => tracing::Level::ERROR,
      LogLevel::Warn => tracing::Level::WARN,
      LogLevel::Info => tracing::Level::INFO,
      LogLevel::Debug => tracing::Level::DEBUG,
      LogLevel::Trace => tracing::Level::TRACE,
    }
  }
}

/// Logging configuration shared by the CLI's `--log-level` flag,
/// environment overrides, and the task document's optional
/// `logging` block.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct LogConfig {
  #[serde(default)]
  pub level: LogLevel,
  #[serde(default)]
  pub stdio: StdioLogMode,
  /// Pretty (multi-line) formatting for the `Standard` stdio mode.
  #[serde(default)]
  pub pretty: bool,
  #[serde(default)]
  pub location: bool,
  #[serde(default = "default_ansi")]
  pub ansi: bool,
  /// If non-empty, also export spans to this OTLP endpoint.
  #[serde(default)]
  pub otlp_endpoint: String,
  #[serde(default = "default_service_name")]
  pub opentelemetry_service_name: String,
  #[serde(default = "default_scope_name")]
  pub opentelemetry_scope_name: String,
}

fn default_ansi() -> bool {
  true
}

fn default_service_name() -> String {
  "imagegraph".to_string()
}

fn default_scope_name() -> String {
  "imagegraph".to_string()
}
