use thiserror::Error;

/// Errors raised while turning a task document into a validated [crate::task::Task].
/// Always fatal: the loader returns before any step runs.
#[derive(Error, Debug)]
pub enum LoadError {
  #[error(
    "alias directive must be exactly one character, got {0:?}"
  )]
  InvalidAliasDirective(String),

  #[error("alias source {path} could not be read: {source}")]
  AliasSourceUnreadable {
    path: String,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to parse task document: {0}")]
  MalformedDocument(#[source] serde_yaml_ng::Error),

  #[error("step {step} depends on unknown step {depends_on}")]
  UnknownDependency { step: String, depends_on: String },

  #[error("duplicate step id {0}")]
  DuplicateStepID(String),

  #[error("cyclic dependency: {0}")]
  CyclicDependency(String),

  #[error(
    "step {0} specifies more than one of build/push/cmd"
  )]
  AmbiguousStepKind(String),

  #[error(
    "step {0} specifies none of build/push/cmd"
  )]
  EmptyStepKind(String),

  #[error("step id must be non-empty")]
  EmptyStepID,

  #[error("step id {0:?} is not a valid identifier: {1}")]
  InvalidStepId(String, String),

  #[error("volume {volume} references unknown secret {secret}")]
  UnknownSecret { volume: String, secret: String },
}

/// Errors raised during [crate::executor] execution of an already-loaded task.
/// Wrapped with the failing step's id and posted to the error channel,
/// where the first one wins and aborts the completion barrier.
#[derive(Error, Debug, Clone)]
pub enum RuntimeError {
  #[error("subprocess failed: {0}")]
  Subprocess(#[from] command::ProcessError),

  #[error("step timed out after {0:?}")]
  Timeout(std::time::Duration),

  #[error("run was cancelled")]
  Cancelled,

  #[error("dependency scrape failed: {0}")]
  ScrapeFailed(String),

  #[error("digest lookup failed: {0}")]
  DigestFailed(String),

  #[error("failed to create network {0}")]
  NetworkCreate(String),

  #[error("registry login failed for {0}")]
  LoginFailed(String),

  #[error("volume setup failed for {0}")]
  VolumeSetup(String),

  #[error("builder daemon initialization failed: {0}")]
  BuilderInitFailed(String),

  #[error("image pull failed: {0}")]
  PullFailed(String),
}

/// A [RuntimeError] tagged with the step that produced it.
#[derive(Error, Debug, Clone)]
#[error("step {step_id}: {source}")]
pub struct StepError {
  pub step_id: String,
  #[source]
  pub source: RuntimeError,
}
