//! Concurrent DAG executor: fork-per-ready-node scheduling over
//! [crate::dag::Dag]'s atomic degree counters.
//!
//! A node is dispatched (spawned as its own async task) the instant the
//! last of its parents finishes — whichever parent's [Dag::remove_edge]
//! call brings the degree to zero is the one that spawns it. Entry is the
//! same operation seeded from the synthetic root. Once a node finishes it
//! fires its one-shot completion signal (always, win or lose) and, if it
//! succeeded or failed under `IgnoreErrors`, dispatches its own children
//! the same way.
//!
//! The run as a whole finishes when either every step has signalled
//! completion, or the first unignored step failure arrives on the error
//! channel — whichever comes first. On failure the executor cancels the
//! root token and stops the process manager; it deliberately does not wait
//! for steps left dangling behind a failed ancestor, favoring fail-fast
//! over draining every remaining completion signal.

use std::{path::Path, sync::Arc, time::Duration};

use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

use command::ProcessManager;

use crate::{
  collaborators::Collaborators,
  dag::ROOT,
  docker::BuilderInit,
  error::{RuntimeError, StepError},
  task::{ImageDependencyEntry, ImageRef, Step, StepKind, StepStatus, Task},
};

pub struct ExecutorConfig {
  /// Upper bound on steps running their container-engine command at once.
  /// `None` means unbounded (limited only by the DAG's own shape).
  pub max_concurrency: Option<usize>,
  pub registry_login: Option<RegistryLogin>,
  /// Retry budget for the registry login and the builder-daemon one-shot
  /// init; the document format has no per-run policy knob for either, so
  /// both share this one.
  pub setup_retries: u32,
  pub setup_retry_delay: Duration,
}

pub struct RegistryLogin {
  pub domain: String,
  pub username: String,
  pub password: String,
}

impl Default for ExecutorConfig {
  fn default() -> Self {
    Self {
      max_concurrency: None,
      registry_login: None,
      setup_retries: 3,
      setup_retry_delay: Duration::from_secs(2),
    }
  }
}

#[derive(Clone)]
struct Shared {
  task: Arc<Task>,
  collaborators: Arc<Collaborators>,
  process_manager: Arc<ProcessManager>,
  semaphore: Option<Arc<Semaphore>>,
  error_tx: mpsc::Sender<StepError>,
  run_token: CancellationToken,
  builder_init: Arc<BuilderInit>,
  setup_retries: u32,
  setup_retry_delay: Duration,
}

/// Runs every step in `task` to completion (or first failure). Returns the
/// first [StepError] encountered, if any; the caller decides whether that
/// means process exit code 1.
pub async fn run_task(
  task: Arc<Task>,
  collaborators: Arc<Collaborators>,
  process_manager: Arc<ProcessManager>,
  config: ExecutorConfig,
) -> Result<(), StepError> {
  if let Some(login) = &config.registry_login {
    crate::docker::registry_login_with_retries(
      &process_manager,
      &login.domain,
      &login.username,
      &login.password,
      config.setup_retries,
      config.setup_retry_delay,
    )
    .await
    .map_err(|e| StepError {
      step_id: ROOT.to_string(),
      source: RuntimeError::LoginFailed(e.to_string()),
    })?;
  }

  for network in &task.networks {
    crate::docker::ensure_network(&process_manager, network).await.map_err(
      |e| StepError {
        step_id: ROOT.to_string(),
        source: RuntimeError::NetworkCreate(e.to_string()),
      },
    )?;
  }

  for volume in &task.volumes {
    if volume.secret.files.is_empty() {
      continue;
    }
    collaborators
      .secret_volumes
      .materialize(&volume.name, &volume.secret.files)
      .await
      .map_err(|e| StepError {
        step_id: ROOT.to_string(),
        source: RuntimeError::VolumeSetup(e.to_string()),
      })?;
  }

  let completion_futures: Vec<_> = task
    .steps
    .iter()
    .map(|s| {
      task
        .take_completion_rx(&s.id)
        .expect("each step's completion receiver is taken exactly once, at run start")
    })
    .collect();
  let barrier = futures_util::future::join_all(completion_futures);

  let (error_tx, mut error_rx) = mpsc::channel::<StepError>(1);
  let shared = Shared {
    task: task.clone(),
    collaborators,
    process_manager: process_manager.clone(),
    semaphore: config.max_concurrency.map(|n| Arc::new(Semaphore::new(n))),
    error_tx,
    run_token: CancellationToken::new(),
    builder_init: Arc::new(BuilderInit::new()),
    setup_retries: config.setup_retries,
    setup_retry_delay: config.setup_retry_delay,
  };

  for child in task.dag.children(ROOT).to_vec() {
    dispatch_if_ready(&shared, ROOT, &child);
  }

  let result = tokio::select! {
    biased;
    Some(err) = error_rx.recv() => Err(err),
    _ = barrier => Ok(()),
  };

  clean_task(&task, &process_manager).await;

  result
}

/// Best-effort teardown run once the task finishes, win or lose: stops
/// anything still tracked by the process manager and removes every
/// network this run was responsible for creating. Errors are logged, not
/// propagated — by the time this runs the task's own outcome is already
/// decided.
async fn clean_task(task: &Task, process_manager: &ProcessManager) {
  process_manager.stop();
  for network in &task.networks {
    if network.skip_creation {
      continue;
    }
    if let Err(e) = crate::docker::remove_network(&network.name).await {
      tracing::warn!(network = network.name, error = %e, "failed to clean up network");
    }
  }
}

/// Marks `parent -> child` satisfied; if that was the last outstanding
/// parent, spawns `child`'s worker.
fn dispatch_if_ready(shared: &Shared, parent: &str, child: &str) {
  if shared.task.dag.remove_edge(parent, child) > 0 {
    return;
  }
  let shared = shared.clone();
  let child = child.to_string();
  tokio::spawn(async move {
    run_node(&shared, &child).await;
  });
}

async fn run_node(shared: &Shared, step_id: &str) {
  let runtime =
    shared.task.runtime_for(step_id).expect("dispatched step ids always exist in the task");

  let outcome = if shared.run_token.is_cancelled() {
    Err(RuntimeError::Cancelled)
  } else {
    run_step(shared, step_id).await
  };

  let step = shared.task.step(step_id).expect("same");
  let (terminal_status, deps, proceed_to_children) = match outcome {
    Ok(deps) => (StepStatus::Successful, deps, true),
    Err(e) if step.policy.ignore_errors => {
      tracing::warn!(step = step_id, error = %e, "step failed, ignoring per policy");
      (StepStatus::Successful, Vec::new(), true)
    }
    Err(e) => {
      let _ = shared
        .error_tx
        .send(StepError { step_id: step_id.to_string(), source: e })
        .await;
      shared.process_manager.stop();
      shared.run_token.cancel();
      (StepStatus::Failed, Vec::new(), false)
    }
  };

  runtime.mark_finished(terminal_status, deps);
  runtime.signal_complete();

  if proceed_to_children {
    for child in shared.task.dag.children(step_id).to_vec() {
      dispatch_if_ready(shared, step_id, &child);
    }
  }
}

async fn run_step(shared: &Shared, step_id: &str) -> Result<Vec<ImageDependencyEntry>, RuntimeError> {
  let step = shared.task.step(step_id).expect("dispatched step ids always exist in the task");
  let runtime = shared.task.runtime_for(step_id).expect("same");

  if !step.policy.start_delay.is_zero() {
    tokio::select! {
      biased;
      _ = shared.run_token.cancelled() => return Err(RuntimeError::Cancelled),
      _ = tokio::time::sleep(step.policy.start_delay) => {}
    }
  }

  let _permit = match &shared.semaphore {
    Some(sem) => {
      Some(sem.acquire().await.expect("semaphore is never closed while steps are running"))
    }
    None => None,
  };

  runtime.mark_started();

  if matches!(step.kind, StepKind::Build { .. }) {
    shared
      .builder_init
      .ensure(&shared.process_manager, shared.setup_retries, shared.setup_retry_delay)
      .await
      .map_err(|e| RuntimeError::BuilderInitFailed(e.to_string()))?;
  }

  if let StepKind::Cmd { cmd } = &step.kind {
    if step.exec.pull {
      if let Some(image_ref) = cmd.split_whitespace().next() {
        let ctx = shared.run_token.child_token();
        crate::docker::pull_with_retries(
          &shared.process_manager,
          &ctx,
          image_ref,
          step.policy.retries,
          step.policy.retry_delay,
        )
        .await
        .map_err(|e| RuntimeError::PullFailed(e.to_string()))?;
      }
    }
  }

  run_step_body(step, &shared.collaborators, &shared.process_manager, &shared.run_token).await
}

async fn run_step_body(
  step: &Step,
  collaborators: &Arc<Collaborators>,
  process_manager: &Arc<ProcessManager>,
  run_token: &CancellationToken,
) -> Result<Vec<ImageDependencyEntry>, RuntimeError> {
  let args = collaborators
    .engine_args
    .build_args(&step.exec, &step.kind)
    .map_err(|e| RuntimeError::ScrapeFailed(e.to_string()))?;
  let command = format!(
    "docker {}",
    shlex::try_join(args.iter().map(String::as_str)).unwrap_or_else(|_| args.join(" "))
  );

  let ctx = run_token.child_token();
  let timeout = step.policy.timeout;

  let run = process_manager.run_repeat_with_retries(
    &ctx,
    &command,
    true,
    step.exec.working_directory.as_deref().map(Path::new),
    step.policy.retries,
    &step.policy.retry_on_errors,
    step.policy.retry_delay,
    step.policy.repeat,
  );

  let output = tokio::select! {
    biased;
    _ = run_token.cancelled() => return Err(RuntimeError::Cancelled),
    result = tokio::time::timeout(timeout, run) => {
      match result {
        Ok(Ok(output)) => output,
        Ok(Err(e)) if e.is_cancelled() => return Err(RuntimeError::Cancelled),
        Ok(Err(e)) => return Err(RuntimeError::Subprocess(e)),
        Err(_) => {
          ctx.cancel();
          return Err(RuntimeError::Timeout(timeout));
        }
      }
    }
  };
  let _ = &output;

  collect_image_dependencies(step, collaborators).await
}

/// Resolves the image reference(s) a step produced or referenced, scrapes
/// build-time base images for `Build` steps, and attaches digests. A
/// step's own built/pushed image is always looked up locally; base images
/// (scraped `buildtime` deps, a `Cmd` step's `runtime` image) fall back to
/// the remote digester when the local store doesn't have them.
async fn collect_image_dependencies(
  step: &Step,
  collaborators: &Arc<Collaborators>,
) -> Result<Vec<ImageDependencyEntry>, RuntimeError> {
  match &step.kind {
    StepKind::Build { build } => {
      let tags = extract_tags(build);
      let mut entries = Vec::with_capacity(tags.len().max(1));
      for tag in tags {
        let image = populate_local(collaborators, &tag).await?;
        let dockerfile =
          extract_dockerfile(build).unwrap_or_else(|| "Dockerfile".to_string());
        let scraped = collaborators
          .dependency_scraper
          .scrape(Path::new(&dockerfile))
          .await
          .map_err(|e| RuntimeError::ScrapeFailed(e.to_string()))?;
        let mut buildtime = Vec::with_capacity(scraped.len());
        for base in scraped {
          buildtime.push(populate_with_fallback(collaborators, &base.reference).await?);
        }
        entries.push(ImageDependencyEntry { image, runtime: None, buildtime });
      }
      Ok(entries)
    }
    StepKind::Push { push } => {
      let mut entries = Vec::with_capacity(push.len());
      for reference in push {
        let image = populate_local(collaborators, reference).await?;
        entries.push(ImageDependencyEntry { image, runtime: None, buildtime: Vec::new() });
      }
      Ok(entries)
    }
    StepKind::Cmd { cmd } => {
      let Some(image_ref) = cmd.split_whitespace().next() else {
        return Ok(Vec::new());
      };
      let runtime = populate_with_fallback(collaborators, image_ref).await?;
      Ok(vec![ImageDependencyEntry {
        image: runtime.clone(),
        runtime: Some(runtime),
        buildtime: Vec::new(),
      }])
    }
  }
}

/// Resolves a digest via the local store first (the common case for an
/// image already pulled or built), falling back to the remote registry
/// for references the local engine has never seen. Used for base images
/// (scraped `buildtime` dependencies, a `Cmd` step's `runtime` image)
/// where, unlike the step's own built/pushed `image`, there's no
/// guarantee the reference exists in the local store at all.
async fn populate_with_fallback(
  collaborators: &Arc<Collaborators>,
  reference: &str,
) -> Result<ImageRef, RuntimeError> {
  match collaborators.local_digester.populate(&ImageRef::new(reference)).await {
    Ok(populated) => Ok(populated),
    Err(_) => collaborators
      .remote_digester
      .populate(&ImageRef::new(reference))
      .await
      .map_err(|e| RuntimeError::DigestFailed(e.to_string())),
  }
}

async fn populate_local(
  collaborators: &Arc<Collaborators>,
  reference: &str,
) -> Result<ImageRef, RuntimeError> {
  collaborators
    .local_digester
    .populate(&ImageRef::new(reference))
    .await
    .map_err(|e| RuntimeError::DigestFailed(e.to_string()))
}

fn extract_tags(build: &str) -> Vec<String> {
  let Some(tokens) = shlex::split(build) else {
    return Vec::new();
  };
  let mut tags = Vec::new();
  let mut i = 0;
  while i < tokens.len() {
    if tokens[i] == "-t" || tokens[i] == "--tag" {
      if let Some(v) = tokens.get(i + 1) {
        tags.push(v.clone());
      }
      i += 2;
      continue;
    }
    if let Some(v) = tokens[i].strip_prefix("--tag=") {
      tags.push(v.to_string());
    }
    i += 1;
  }
  tags
}

fn extract_dockerfile(build: &str) -> Option<String> {
  let tokens = shlex::split(build)?;
  let mut i = 0;
  while i < tokens.len() {
    if tokens[i] == "-f" || tokens[i] == "--file" {
      return tokens.get(i + 1).cloned();
    }
    if let Some(v) = tokens[i].strip_prefix("--file=") {
      return Some(v.to_string());
    }
    i += 1;
  }
  None
}

#[cfg(test)]
mod test {
  use std::{collections::HashMap, os::unix::fs::PermissionsExt, path::PathBuf};

  use super::*;
  use crate::{
    collaborators::{
      BoxFuture, Collaborators, DependencyScraper, LocalDigester, PopulateDigest,
      RemoteDigester, SecretVolumeMaterializer,
    },
    docker::DefaultEngineArgsBuilder,
    task::ImageRef,
  };

  #[test]
  fn extracts_multiple_tags() {
    let tags = extract_tags("-t a:1 --tag=b:2 -f Dockerfile .");
    assert_eq!(tags, vec!["a:1".to_string(), "b:2".to_string()]);
  }

  #[test]
  fn extracts_dockerfile_path() {
    assert_eq!(
      extract_dockerfile("-t a:1 -f docker/Dockerfile.prod ."),
      Some("docker/Dockerfile.prod".to_string())
    );
    assert_eq!(extract_dockerfile("-t a:1 ."), None);
  }

  struct FakeDigester;
  impl PopulateDigest for FakeDigester {
    fn populate<'a>(
      &'a self,
      image: &'a ImageRef,
    ) -> BoxFuture<'a, anyhow::Result<ImageRef>> {
      Box::pin(async move { Ok(ImageRef::new(image.reference.clone())) })
    }
  }
  impl LocalDigester for FakeDigester {}
  impl RemoteDigester for FakeDigester {}

  struct FakeScraper;
  impl DependencyScraper for FakeScraper {
    fn scrape<'a>(
      &'a self,
      _dockerfile_path: &'a Path,
    ) -> BoxFuture<'a, anyhow::Result<Vec<ImageRef>>> {
      Box::pin(async move { Ok(Vec::new()) })
    }
  }

  struct FakeSecretVolumes;
  impl SecretVolumeMaterializer for FakeSecretVolumes {
    fn materialize<'a>(
      &'a self,
      _volume_name: &'a str,
      _files: &'a HashMap<String, String>,
    ) -> BoxFuture<'a, anyhow::Result<PathBuf>> {
      Box::pin(async move { Ok(PathBuf::new()) })
    }
  }

  fn fake_collaborators() -> Arc<Collaborators> {
    Arc::new(Collaborators {
      dependency_scraper: Arc::new(FakeScraper),
      local_digester: Arc::new(FakeDigester),
      remote_digester: Arc::new(FakeDigester),
      secret_volumes: Arc::new(FakeSecretVolumes),
      engine_args: Arc::new(DefaultEngineArgsBuilder),
    })
  }

  /// Serializes every test that mutates the process-wide `PATH` to install
  /// a fake `docker` binary; these tests can't run concurrently with each
  /// other without racing on that mutation.
  static ENV_GUARD: std::sync::Mutex<()> = std::sync::Mutex::new(());

  /// Drops a `docker` shell script ahead of the real one on `PATH` that
  /// appends its invocation to `log_path` and exits nonzero only when
  /// `FAIL` appears among its arguments. Lets the scheduling tests below
  /// exercise a real `run_task` without a container engine present.
  fn install_fake_docker(log_path: &Path) -> (tempfile::TempDir, String) {
    let dir = tempfile::tempdir().unwrap();
    let script_path = dir.path().join("docker");
    std::fs::write(
      &script_path,
      format!(
        "#!/bin/sh\necho \"$*\" >> {}\ncase \"$*\" in\n  *FAIL*) exit 1 ;;\n  *) exit 0 ;;\nesac\n",
        log_path.display()
      ),
    )
    .unwrap();
    let mut perms = std::fs::metadata(&script_path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&script_path, perms).unwrap();

    let original_path = std::env::var("PATH").unwrap_or_default();
    std::env::set_var("PATH", format!("{}:{original_path}", dir.path().display()));
    (dir, original_path)
  }

  fn log_lines(log_path: &Path) -> Vec<String> {
    std::fs::read_to_string(log_path)
      .unwrap_or_default()
      .lines()
      .map(str::to_string)
      .collect()
  }

  #[tokio::test]
  async fn runs_linear_chain_in_dependency_order() {
    let _guard = ENV_GUARD.lock().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("invocations.log");
    let (_fake_docker, original_path) = install_fake_docker(&log);

    let doc = r#"
steps:
  - id: a
    cmd: "step-a"
  - id: b
    cmd: "step-b"
    when: [a]
  - id: c
    cmd: "step-c"
    when: [b]
"#;
    let task = Arc::new(crate::loader::load(doc, "").unwrap());
    let result = run_task(
      task.clone(),
      fake_collaborators(),
      Arc::new(ProcessManager::new()),
      ExecutorConfig::default(),
    )
    .await;
    std::env::set_var("PATH", original_path);

    assert!(result.is_ok());
    let lines = log_lines(&log);
    let pos = |marker: &str| lines.iter().position(|l| l.contains(marker)).unwrap();
    assert!(pos("step-a") < pos("step-b"));
    assert!(pos("step-b") < pos("step-c"));
  }

  #[tokio::test]
  async fn diamond_runs_join_after_both_branches() {
    let _guard = ENV_GUARD.lock().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("invocations.log");
    let (_fake_docker, original_path) = install_fake_docker(&log);

    let doc = r#"
steps:
  - id: a
    cmd: "step-a"
  - id: b
    cmd: "step-b"
    when: [a]
  - id: c
    cmd: "step-c"
    when: [a]
  - id: d
    cmd: "step-d"
    when: [b, c]
"#;
    let task = Arc::new(crate::loader::load(doc, "").unwrap());
    let result = run_task(
      task.clone(),
      fake_collaborators(),
      Arc::new(ProcessManager::new()),
      ExecutorConfig::default(),
    )
    .await;
    std::env::set_var("PATH", original_path);

    assert!(result.is_ok());
    let lines = log_lines(&log);
    let pos = |marker: &str| lines.iter().position(|l| l.contains(marker)).unwrap();
    assert!(pos("step-a") < pos("step-b"));
    assert!(pos("step-a") < pos("step-c"));
    assert!(pos("step-d") > pos("step-b"));
    assert!(pos("step-d") > pos("step-c"));
  }

  #[tokio::test]
  async fn ignored_failure_still_runs_its_children() {
    let _guard = ENV_GUARD.lock().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("invocations.log");
    let (_fake_docker, original_path) = install_fake_docker(&log);

    let doc = r#"
steps:
  - id: a
    cmd: "step-a FAIL"
    ignoreErrors: true
  - id: b
    cmd: "step-b"
    when: [a]
"#;
    let task = Arc::new(crate::loader::load(doc, "").unwrap());
    let result = run_task(
      task.clone(),
      fake_collaborators(),
      Arc::new(ProcessManager::new()),
      ExecutorConfig::default(),
    )
    .await;
    std::env::set_var("PATH", original_path);

    assert!(result.is_ok());
    assert_eq!(task.runtime_for("a").unwrap().status(), StepStatus::Successful);
    assert_eq!(task.runtime_for("b").unwrap().status(), StepStatus::Successful);
    let lines = log_lines(&log);
    assert!(lines.iter().any(|l| l.contains("step-b")));
  }
}
