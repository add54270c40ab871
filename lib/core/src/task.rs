use std::{
  collections::HashMap,
  sync::Mutex,
  time::{Duration, SystemTime},
};

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

/// Sentinel `when` entry meaning "depends only on the root, run as soon as
/// the task starts". Distinguishes "no dependencies yet" (an empty `when`,
/// which means the same thing) from an author's explicit intent.
pub const IMMEDIATE_EXECUTION_TOKEN: &str = "immediate";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
  pub variable: String,
  pub value: String,
}

/// One of the three mutually exclusive things a step can do. Selected by
/// which field was present on the raw document (see `document::RawStep`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepKind {
  /// Raw `docker build` argument string, e.g. `-t myimage:v1 -f Dockerfile .`.
  /// Every `-t`/`--tag` argument gets the target registry prefixed onto it
  /// at load time.
  Build { build: String },
  /// Image references to push, already registry-prefixed.
  Push { push: Vec<String> },
  /// `<image> [args...]`: the image to run followed by its command line.
  Cmd { cmd: String },
}

impl StepKind {
  pub fn label(&self) -> &'static str {
    match self {
      StepKind::Build { .. } => "build",
      StepKind::Push { .. } => "push",
      StepKind::Cmd { .. } => "cmd",
    }
  }
}

/// A single `{Image, Runtime, Buildtime[]}` entry in a step's dependency
/// report, before (bare references) and after (digests attached) the
/// digest pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageRef {
  /// `registry/repo:tag` as it appeared in the step.
  pub reference: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub digest: Option<String>,
}

impl ImageRef {
  pub fn new(reference: impl Into<String>) -> Self {
    Self { reference: reference.into(), digest: None }
  }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageDependencyEntry {
  pub image: ImageRef,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub runtime: Option<ImageRef>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub buildtime: Vec<ImageRef>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StepStatus {
  Skipped,
  InProgress,
  Successful,
  Failed,
}

/// Policy knobs that don't change what a step does, only how the executor
/// retries, bounds, or tolerates it.
#[derive(Debug, Clone)]
pub struct StepPolicy {
  pub timeout: Duration,
  pub retries: u32,
  pub retry_delay: Duration,
  pub retry_on_errors: Vec<String>,
  pub repeat: u32,
  pub start_delay: Duration,
  pub ignore_errors: bool,
  pub exited_with: Vec<i32>,
  pub exited_without: Vec<i32>,
}

/// Everything needed to invoke the container engine for a step, independent
/// of its `StepKind`. Unused fields for a given kind (e.g. `ports` on a
/// `Build` step) are simply ignored by the executor.
#[derive(Debug, Clone, Default)]
pub struct ExecutionInputs {
  pub working_directory: Option<String>,
  pub entrypoint: Option<String>,
  pub environment: Vec<EnvVar>,
  pub secret_environment: Vec<EnvVar>,
  pub ports: Vec<String>,
  pub published_ports: Vec<String>,
  pub user: Option<String>,
  pub isolation: Option<String>,
  pub network: Option<String>,
  pub privileged: bool,
  pub keep: bool,
  pub detach: bool,
  pub pull: bool,
}

#[derive(Debug, Clone)]
pub struct Step {
  pub id: String,
  pub kind: StepKind,
  pub exec: ExecutionInputs,
  /// Step ids this step waits on, or `[IMMEDIATE_EXECUTION_TOKEN]`/empty
  /// for "root only". Resolved into DAG edges by the loader.
  pub when: Vec<String>,
  pub policy: StepPolicy,
}

impl Step {
  pub fn depends_on_root_only(&self) -> bool {
    self.when.is_empty()
      || self.when == [IMMEDIATE_EXECUTION_TOKEN.to_string()]
  }
}

#[derive(Debug, Clone)]
pub struct Network {
  pub name: String,
  pub driver: Option<String>,
  pub ipv6: bool,
  pub subnet: Option<String>,
  /// The network already exists on the engine; don't try to create it.
  pub skip_creation: bool,
}

/// The only volume source this crate knows how to materialize itself: a
/// map of filename to base64-encoded content. Anything else is handled by
/// a [crate::collaborators::SecretVolumeMaterializer].
#[derive(Debug, Clone)]
pub struct SecretVolumeContent {
  pub files: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct Volume {
  pub name: String,
  pub secret: SecretVolumeContent,
}

#[derive(Debug, Clone)]
pub struct Credentials {
  pub username: String,
  pub password: String,
}

/// Mutable, per-step execution state. Owned exclusively by the worker
/// running that step (see `executor`); no two workers ever touch the same
/// `StepRuntime` concurrently, so a plain `Mutex` here is just bookkeeping,
/// not contention.
pub struct StepRuntime {
  inner: Mutex<StepRuntimeInner>,
  completion_tx: Mutex<Option<oneshot::Sender<()>>>,
}

struct StepRuntimeInner {
  status: StepStatus,
  start_time: Option<SystemTime>,
  end_time: Option<SystemTime>,
  image_dependencies: Vec<ImageDependencyEntry>,
}

impl StepRuntime {
  pub fn new() -> (Self, oneshot::Receiver<()>) {
    let (tx, rx) = oneshot::channel();
    (
      Self {
        inner: Mutex::new(StepRuntimeInner {
          status: StepStatus::Skipped,
          start_time: None,
          end_time: None,
          image_dependencies: Vec::new(),
        }),
        completion_tx: Mutex::new(Some(tx)),
      },
      rx,
    )
  }

  pub fn status(&self) -> StepStatus {
    self.inner.lock().unwrap().status
  }

  pub fn mark_started(&self) {
    let mut inner = self.inner.lock().unwrap();
    inner.status = StepStatus::InProgress;
    inner.start_time = Some(SystemTime::now());
  }

  pub fn mark_finished(
    &self,
    status: StepStatus,
    image_dependencies: Vec<ImageDependencyEntry>,
  ) {
    let mut inner = self.inner.lock().unwrap();
    inner.status = status;
    inner.end_time = Some(SystemTime::now());
    inner.image_dependencies = image_dependencies;
  }

  pub fn image_dependencies(&self) -> Vec<ImageDependencyEntry> {
    self.inner.lock().unwrap().image_dependencies.clone()
  }

  pub fn start_time(&self) -> Option<SystemTime> {
    self.inner.lock().unwrap().start_time
  }

  pub fn end_time(&self) -> Option<SystemTime> {
    self.inner.lock().unwrap().end_time
  }

  /// Delivers the completion signal exactly once. A second call is a no-op:
  /// the sender was already consumed, which would otherwise mean two
  /// workers raced to finish the same step.
  pub fn signal_complete(&self) {
    if let Some(tx) = self.completion_tx.lock().unwrap().take() {
      let _ = tx.send(());
    }
  }
}

/// A fully loaded, validated task: the step list, its DAG, and shared
/// resources (networks, volumes, credentials). Immutable after
/// `loader::load` returns except for per-step [StepRuntime] cells.
pub struct Task {
  pub steps: Vec<Step>,
  pub step_index: HashMap<String, usize>,
  pub networks: Vec<Network>,
  pub volumes: Vec<Volume>,
  pub credentials: HashMap<String, Credentials>,
  pub default_step_timeout: Duration,
  pub default_working_directory: Option<String>,
  pub dag: crate::dag::Dag,
  pub runtime: Vec<StepRuntime>,
  /// One completion receiver per step, in the same order as `steps`. Each
  /// is taken exactly once by the executor's dispatch loop when it starts
  /// waiting on that step; a `Mutex` only because `Task` is shared behind
  /// an `Arc` across workers, not because of real contention.
  pub completion_rx: Vec<Mutex<Option<oneshot::Receiver<()>>>>,
}

impl Task {
  pub fn step(&self, id: &str) -> Option<&Step> {
    self.step_index.get(id).map(|&i| &self.steps[i])
  }

  pub fn runtime_for(&self, id: &str) -> Option<&StepRuntime> {
    self.step_index.get(id).map(|&i| &self.runtime[i])
  }

  /// Takes the completion receiver for `id`. Returns `None` if called
  /// twice for the same step, which would indicate two workers racing to
  /// wait on the same dependency.
  pub fn take_completion_rx(
    &self,
    id: &str,
  ) -> Option<oneshot::Receiver<()>> {
    let i = *self.step_index.get(id)?;
    self.completion_rx[i].lock().unwrap().take()
  }
}
