//! Interfaces for the pieces of the system this crate deliberately does
//! not implement: dependency scraping, digest retrieval, secret volume
//! materialization, and engine CLI argument construction. Each is a seam
//! a caller plugs a real implementation into; `docker` provides the
//! default bollard-backed ones this crate ships with.
//!
//! Methods return boxed futures (rather than `async fn in trait`) so the
//! traits stay object-safe: the executor holds these behind `Arc<dyn _>`
//! and the same `Task` run can mix, say, a real `LocalDigester` with a
//! test double `RemoteDigester`.

use std::{future::Future, path::Path, pin::Pin};

use crate::task::{ImageDependencyEntry, ImageRef};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Finds the base images a build step's Dockerfile depends on. The
/// executor calls this once per successfully built `Build` step and
/// attaches the result as that step's `buildtime` entries.
pub trait DependencyScraper: Send + Sync {
  fn scrape<'a>(
    &'a self,
    dockerfile_path: &'a Path,
  ) -> BoxFuture<'a, anyhow::Result<Vec<ImageRef>>>;
}

/// Shared by local and remote digest lookups: given a bare `ImageRef`
/// (reference only, no digest), return one with `digest` populated.
pub trait PopulateDigest: Send + Sync {
  fn populate<'a>(
    &'a self,
    image: &'a ImageRef,
  ) -> BoxFuture<'a, anyhow::Result<ImageRef>>;
}

/// Looks digests up in the local engine's image store (images this run
/// just built or pulled).
pub trait LocalDigester: PopulateDigest {}

/// Looks digests up against a remote registry's manifest API (images
/// referenced only by name, never pulled).
pub trait RemoteDigester: PopulateDigest {}

/// Writes a step's secret volume content (filename -> decoded bytes) to
/// wherever the container engine expects mount sources to live, and
/// returns the host path to bind-mount.
pub trait SecretVolumeMaterializer: Send + Sync {
  fn materialize<'a>(
    &'a self,
    volume_name: &'a str,
    files: &'a std::collections::HashMap<String, String>,
  ) -> BoxFuture<'a, anyhow::Result<std::path::PathBuf>>;
}

/// Turns a step's execution inputs into the exact CLI arguments for the
/// container engine invocation. Kept as a seam because the real flag
/// grammar (buildx vs classic builder, docker vs podman, etc.) is a
/// deployment-time decision, not a task-document concern.
pub trait EngineArgsBuilder: Send + Sync {
  fn build_args<'a>(
    &'a self,
    exec: &'a crate::task::ExecutionInputs,
    kind: &'a crate::task::StepKind,
  ) -> anyhow::Result<Vec<String>>;
}

/// Bundles every collaborator the executor needs for one run. Built once
/// by the caller (CLI entrypoint) and shared across the whole task.
pub struct Collaborators {
  pub dependency_scraper: std::sync::Arc<dyn DependencyScraper>,
  pub local_digester: std::sync::Arc<dyn LocalDigester>,
  pub remote_digester: std::sync::Arc<dyn RemoteDigester>,
  pub secret_volumes: std::sync::Arc<dyn SecretVolumeMaterializer>,
  pub engine_args: std::sync::Arc<dyn EngineArgsBuilder>,
}

impl ImageDependencyEntry {
  pub fn bare(reference: impl Into<String>) -> Self {
    Self { image: ImageRef::new(reference), runtime: None, buildtime: Vec::new() }
  }
}
