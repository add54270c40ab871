//! Default, bollard-backed collaborator implementations: a thin `Docker`
//! handle plus shell-outs for anything bollard doesn't expose directly
//! (registry auth, buildx).

use std::{collections::HashMap, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, anyhow};
use bollard::Docker;
use command::{ProcessManager, run_shell_command};
use tokio_util::sync::CancellationToken;

use crate::{
  collaborators::{
    BoxFuture, DependencyScraper, EngineArgsBuilder, LocalDigester,
    PopulateDigest, RemoteDigester, SecretVolumeMaterializer,
  },
  task::{ExecutionInputs, ImageRef, Network, StepKind},
};

pub struct DockerClient {
  docker: Docker,
}

impl DockerClient {
  pub fn connect() -> anyhow::Result<Self> {
    let docker = Docker::connect_with_defaults()
      .context("failed to connect to local docker engine")?;
    Ok(Self { docker })
  }
}

impl PopulateDigest for DockerClient {
  fn populate<'a>(
    &'a self,
    image: &'a ImageRef,
  ) -> BoxFuture<'a, anyhow::Result<ImageRef>> {
    Box::pin(async move {
      let inspect = self
        .docker
        .inspect_image(&image.reference)
        .await
        .with_context(|| {
          format!("failed to inspect local image {}", image.reference)
        })?;

      let digest = inspect
        .repo_digests
        .unwrap_or_default()
        .into_iter()
        .find_map(|rd| rd.split_once('@').map(|(_, digest)| digest.to_string()));

      Ok(ImageRef { reference: image.reference.clone(), digest })
    })
  }
}

impl LocalDigester for DockerClient {}

/// Queries a registry's manifest API for an image's digest without
/// pulling it, via `docker buildx imagetools inspect`. Kept as a
/// shell-out rather than a raw registry HTTP client because auth
/// (credential helpers, short-lived tokens) is already solved by the
/// engine's own login state.
pub struct BuildxRemoteDigester;

impl PopulateDigest for BuildxRemoteDigester {
  fn populate<'a>(
    &'a self,
    image: &'a ImageRef,
  ) -> BoxFuture<'a, anyhow::Result<ImageRef>> {
    Box::pin(async move {
      let output = run_shell_command(
        &format!(
          "docker buildx imagetools inspect {} --format '{{{{json .Manifest.Digest}}}}'",
          image.reference
        ),
        None,
      )
      .await;

      if !output.success() {
        return Err(anyhow!(
          "buildx imagetools inspect failed for {}: {}",
          image.reference,
          output.stderr
        ));
      }

      let digest = output.stdout.trim().trim_matches('"').to_string();
      if digest.is_empty() {
        return Err(anyhow!(
          "buildx imagetools inspect returned no digest for {}",
          image.reference
        ));
      }

      Ok(ImageRef { reference: image.reference.clone(), digest: Some(digest) })
    })
  }
}

impl RemoteDigester for BuildxRemoteDigester {}

/// Registry login via `docker login --password-stdin`. Not a collaborator
/// trait: this isn't pluggable, it's how the executor authenticates before
/// build/push steps regardless of deployment. Runs through the same
/// [ProcessManager] retry loop every step uses, so a flaky registry doesn't
/// fail the whole run on the first blip.
pub async fn registry_login_with_retries(
  process_manager: &ProcessManager,
  domain: &str,
  username: &str,
  password: &str,
  retries: u32,
  retry_delay: Duration,
) -> anyhow::Result<()> {
  if domain.is_empty() || username.is_empty() {
    return Ok(());
  }

  let command = format!(
    "echo {password} | docker login {domain} --username '{username}' --password-stdin"
  );
  process_manager
    .run_with_retries(
      &CancellationToken::new(),
      &command,
      true,
      None,
      retries,
      &[],
      retry_delay,
    )
    .await
    .map(|_| ())
    .map_err(|e| anyhow!("registry login to {domain} failed: {e}"))
}

/// Creates `network.name` unless it already exists on the engine
/// (`skip_creation`) or was created by an earlier run of this task.
pub async fn ensure_network(
  process_manager: &ProcessManager,
  network: &Network,
) -> anyhow::Result<()> {
  if network.skip_creation {
    return Ok(());
  }

  let mut command = format!("docker network create {}", network.name);
  if let Some(driver) = &network.driver {
    command.push_str(&format!(" --driver {driver}"));
  }
  if network.ipv6 {
    command.push_str(" --ipv6");
  }
  if let Some(subnet) = &network.subnet {
    command.push_str(&format!(" --subnet {subnet}"));
  }

  match process_manager.run(&CancellationToken::new(), &command, true, None).await {
    Ok(_) => Ok(()),
    Err(e) if e.to_string().contains("already exists") => Ok(()),
    Err(e) => Err(anyhow!("failed to create network {}: {e}", network.name)),
  }
}

/// Removes a previously created network, ignoring "not found"; called only
/// from the best-effort cleanup pass, never from the critical path.
pub async fn remove_network(name: &str) -> anyhow::Result<()> {
  let output =
    run_shell_command(&format!("docker network rm {name}"), None).await;
  if output.success() || output.stderr.contains("not found") {
    return Ok(());
  }
  Err(anyhow!("failed to remove network {name}: {}", output.tail(4 * 1024)))
}

/// Pulls `reference` with its own bounded retry loop. Used ahead of `Cmd`
/// steps whose execution inputs ask for an explicit pull rather than
/// relying on the engine's implicit pull-on-run.
pub async fn pull_with_retries(
  process_manager: &ProcessManager,
  ctx: &CancellationToken,
  reference: &str,
  retries: u32,
  retry_delay: Duration,
) -> anyhow::Result<()> {
  process_manager
    .run_with_retries(
      ctx,
      &format!("docker pull {reference}"),
      true,
      None,
      retries,
      &[],
      retry_delay,
    )
    .await
    .map(|_| ())
    .map_err(|e| anyhow!("failed to pull {reference}: {e}"))
}

/// One-shot builder-daemon initialization (`docker buildx create --use`),
/// run at most once per process regardless of how many `Build` steps ask
/// for it. A second caller while the first is still running waits for the
/// same attempt rather than racing its own `buildx create`.
#[derive(Default)]
pub struct BuilderInit(tokio::sync::OnceCell<()>);

impl BuilderInit {
  pub fn new() -> Self {
    Self::default()
  }

  pub async fn ensure(
    &self,
    process_manager: &ProcessManager,
    retries: u32,
    retry_delay: Duration,
  ) -> anyhow::Result<()> {
    self
      .0
      .get_or_try_init(|| async {
        process_manager
          .run_with_retries(
            &CancellationToken::new(),
            "docker buildx inspect --bootstrap || docker buildx create --use",
            true,
            None,
            retries,
            &[],
            retry_delay,
          )
          .await
          .map(|_| ())
          .map_err(|e| anyhow!("builder daemon initialization failed: {e}"))
      })
      .await
      .map(|_| ())
  }
}

/// Writes decoded secret volume content under `base_dir/<volume_name>/`
/// and returns that directory as the bind-mount source.
pub struct FilesystemSecretVolumes {
  pub base_dir: PathBuf,
}

impl SecretVolumeMaterializer for FilesystemSecretVolumes {
  fn materialize<'a>(
    &'a self,
    volume_name: &'a str,
    files: &'a HashMap<String, String>,
  ) -> BoxFuture<'a, anyhow::Result<PathBuf>> {
    Box::pin(async move {
      use base64::Engine as _;

      let dir = self.base_dir.join(volume_name);
      tokio::fs::create_dir_all(&dir).await.with_context(|| {
        format!("failed to create secret volume dir {}", dir.display())
      })?;

      for (filename, encoded) in files {
        let decoded = base64::engine::general_purpose::STANDARD
          .decode(encoded)
          .with_context(|| {
            format!(
              "secret volume {volume_name} file {filename} is not valid base64"
            )
          })?;
        let path = dir.join(filename);
        tokio::fs::write(&path, decoded).await.with_context(|| {
          format!("failed to write secret volume file {}", path.display())
        })?;
      }

      Ok(dir)
    })
  }
}

/// Straightforward `docker run`/`docker build` argument construction.
/// Deliberately not the last word on flag precision (buildx vs classic
/// builder, rootless variants, etc. are deployment choices); callers with
/// stricter needs swap in their own [EngineArgsBuilder].
pub struct DefaultEngineArgsBuilder;

impl EngineArgsBuilder for DefaultEngineArgsBuilder {
  fn build_args(
    &self,
    exec: &ExecutionInputs,
    kind: &StepKind,
  ) -> anyhow::Result<Vec<String>> {
    match kind {
      StepKind::Build { build } => {
        let mut args = vec!["build".to_string()];
        args.extend(
          shlex::split(build)
            .ok_or_else(|| anyhow!("invalid build arguments: {build}"))?,
        );
        Ok(args)
      }
      StepKind::Push { push } => {
        let mut args = Vec::with_capacity(push.len());
        for tag in push {
          args.push("push".to_string());
          args.push(tag.clone());
        }
        Ok(args)
      }
      StepKind::Cmd { cmd } => {
        let mut args = vec!["run".to_string(), "--rm".to_string()];
        if exec.detach {
          args.push("-d".to_string());
        }
        if exec.privileged {
          args.push("--privileged".to_string());
        }
        if let Some(user) = &exec.user {
          args.push("-u".to_string());
          args.push(user.clone());
        }
        if let Some(network) = &exec.network {
          args.push("--network".to_string());
          args.push(network.clone());
        }
        if let Some(isolation) = &exec.isolation {
          args.push("--isolation".to_string());
          args.push(isolation.clone());
        }
        if let Some(entrypoint) = &exec.entrypoint {
          args.push("--entrypoint".to_string());
          args.push(entrypoint.clone());
        }
        for var in exec.environment.iter().chain(&exec.secret_environment) {
          args.push("-e".to_string());
          args.push(format!("{}={}", var.variable, var.value));
        }
        for port in &exec.ports {
          args.push("--expose".to_string());
          args.push(port.clone());
        }
        for publish in &exec.published_ports {
          args.push("-p".to_string());
          args.push(publish.clone());
        }
        args.extend(
          shlex::split(cmd)
            .ok_or_else(|| anyhow!("invalid cmd arguments: {cmd}"))?,
        );
        Ok(args)
      }
    }
  }
}

/// No-op dependency scraper: reports no additional base images. The real
/// implementation (parsing `FROM` lines, following multi-stage `--from`
/// references, resolving build args used in the image name) lives outside
/// this crate; this default exists so a task can run end-to-end without
/// it and simply get an empty `buildtime` list.
pub struct NoopDependencyScraper;

impl DependencyScraper for NoopDependencyScraper {
  fn scrape<'a>(
    &'a self,
    _dockerfile_path: &'a std::path::Path,
  ) -> BoxFuture<'a, anyhow::Result<Vec<ImageRef>>> {
    Box::pin(async move { Ok(Vec::new()) })
  }
}

pub fn default_collaborators(
  secret_volume_dir: PathBuf,
) -> anyhow::Result<crate::collaborators::Collaborators> {
  let docker = Arc::new(DockerClient::connect()?);
  Ok(crate::collaborators::Collaborators {
    dependency_scraper: Arc::new(NoopDependencyScraper),
    local_digester: docker,
    remote_digester: Arc::new(BuildxRemoteDigester),
    secret_volumes: Arc::new(FilesystemSecretVolumes {
      base_dir: secret_volume_dir,
    }),
    engine_args: Arc::new(DefaultEngineArgsBuilder),
  })
}
