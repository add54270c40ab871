//! Turns a raw task document (YAML text, possibly alias-templated) into a
//! validated [crate::task::Task] with its DAG already built and checked
//! for cycles. Nothing here touches the container engine; that's the
//! executor's job.

use std::{collections::HashMap, time::Duration};

use validations::{StringValidator, StringValidatorMatches};

use crate::{
  alias,
  dag::{Dag, ROOT},
  document::{self, RawAlias, RawStep, RawTask},
  error::LoadError,
  task::{
    Credentials, EnvVar, ExecutionInputs, Network, SecretVolumeContent,
    Step, StepKind, StepPolicy, StepRuntime, Task, Volume,
  },
};

const DEFAULT_STEP_TIMEOUT_SECS: u64 = 600;
const DEFAULT_RETRY_DELAY_SECS: u64 = 0;
const DEFAULT_START_DELAY_SECS: u64 = 0;

/// Loads a task document, running the alias pass first if the document
/// defines any aliases (or an explicit directive) and then registry-
/// prefixing build tags and push targets with `registry`.
///
/// `registry` may be empty, in which case image references are left
/// exactly as written.
pub fn load(source: &str, registry: &str) -> Result<Task, LoadError> {
  let expanded = expand_aliases(source)?;
  let raw: RawTask = serde_yaml_ng::from_str(&expanded)
    .map_err(LoadError::MalformedDocument)?;
  build_task(raw, registry)
}

/// Runs the alias pass using only the document's own `alias` block. A
/// second, cheap parse is needed because the directive and alias table
/// live inside the document being expanded.
fn expand_aliases(source: &str) -> Result<String, LoadError> {
  #[derive(serde::Deserialize, Default)]
  struct AliasHeader {
    #[serde(default)]
    alias: Option<RawAlias>,
  }

  let header: AliasHeader =
    serde_yaml_ng::from_str(source).unwrap_or_default();

  let Some(raw_alias) = header.alias else {
    return Ok(source.to_string());
  };

  let directive_str = raw_alias.directive.unwrap_or_else(|| "$".to_string());
  let directive = validations::validate_directive(&directive_str)
    .map_err(|e| LoadError::InvalidAliasDirective(e.to_string()))?;

  let values = resolve_alias_values(&raw_alias)?;

  for name in values.keys() {
    StringValidator::default()
      .min_length(1)
      .matches(StringValidatorMatches::AliasName)
      .validate(name)
      .map_err(|e| {
        LoadError::MalformedDocument({
          use serde::de::Error as _;
          serde_yaml_ng::Error::custom(format!(
            "alias name {name:?}: {e}"
          ))
        })
      })?;
  }

  Ok(alias::expand(source, directive, &values))
}

/// Composes `alias.src` (external alias documents, each a flat
/// `name -> value` YAML map, merged in list order so a later source
/// overrides an earlier one) with the document's own inline `alias.values`,
/// which wins over anything loaded from `src`.
fn resolve_alias_values(
  raw_alias: &RawAlias,
) -> Result<HashMap<String, String>, LoadError> {
  let mut merged = HashMap::new();

  for path in &raw_alias.src {
    let text = std::fs::read_to_string(path).map_err(|source| {
      LoadError::AliasSourceUnreadable { path: path.clone(), source }
    })?;
    let values: HashMap<String, String> =
      serde_yaml_ng::from_str(&text).map_err(LoadError::MalformedDocument)?;
    merged.extend(values);
  }

  merged.extend(raw_alias.values.clone());
  Ok(merged)
}

fn build_task(raw: RawTask, registry: &str) -> Result<Task, LoadError> {
  if raw.steps.is_empty() {
    return Err(LoadError::EmptyStepKind("<task>".to_string()));
  }

  let default_step_timeout = Duration::from_secs(
    raw.step_timeout.unwrap_or(DEFAULT_STEP_TIMEOUT_SECS),
  );

  let default_env = raw
    .env
    .iter()
    .map(|e| document::parse_env_entry(e))
    .collect::<Result<Vec<EnvVar>, LoadError>>()?;

  let mut steps = Vec::with_capacity(raw.steps.len());
  let mut step_index = HashMap::with_capacity(raw.steps.len());

  for (i, raw_step) in raw.steps.into_iter().enumerate() {
    let step =
      build_step(raw_step, registry, default_step_timeout, &default_env)?;
    if step_index.insert(step.id.clone(), i).is_some() {
      return Err(LoadError::DuplicateStepID(step.id));
    }
    steps.push(step);
  }

  let mut dag = Dag::new();
  dag.add_node(ROOT);
  for step in &steps {
    dag.add_node(step.id.clone());
  }
  for step in &steps {
    if step.depends_on_root_only() {
      dag.add_edge(ROOT, &step.id);
      continue;
    }
    for dependency in &step.when {
      if !step_index.contains_key(dependency) {
        return Err(LoadError::UnknownDependency {
          step: step.id.clone(),
          depends_on: dependency.clone(),
        });
      }
      dag.add_edge(dependency, &step.id);
    }
  }
  dag.check_acyclic()?;

  let networks = raw
    .networks
    .into_iter()
    .map(|n| Network {
      name: n.name,
      driver: n.driver,
      ipv6: n.ipv6,
      subnet: n.subnet,
      skip_creation: n.skip_creation,
    })
    .collect();

  let mut volumes = Vec::with_capacity(raw.volumes.len());
  for v in raw.volumes {
    let files = match &v.secret {
      Some(secret_name) => raw
        .secrets
        .get(secret_name)
        .cloned()
        .ok_or_else(|| LoadError::UnknownSecret {
          volume: v.name.clone(),
          secret: secret_name.clone(),
        })?,
      None => HashMap::new(),
    };
    volumes.push(Volume { name: v.name, secret: SecretVolumeContent { files } });
  }

  let credentials = raw
    .credentials
    .into_iter()
    .map(|(host, c)| {
      (host, Credentials { username: c.username, password: c.password })
    })
    .collect();

  let mut runtime = Vec::with_capacity(steps.len());
  let mut completion_rx = Vec::with_capacity(steps.len());
  for _ in &steps {
    let (rt, rx) = StepRuntime::new();
    runtime.push(rt);
    completion_rx.push(std::sync::Mutex::new(Some(rx)));
  }

  Ok(Task {
    steps,
    step_index,
    networks,
    volumes,
    credentials,
    default_step_timeout,
    default_working_directory: raw.working_directory,
    dag,
    runtime,
    completion_rx,
  })
}

fn build_step(
  raw: RawStep,
  registry: &str,
  default_step_timeout: Duration,
  default_env: &[EnvVar],
) -> Result<Step, LoadError> {
  StringValidator::default()
    .min_length(1)
    .matches(StringValidatorMatches::StepId)
    .validate(&raw.id)
    .map_err(|e| {
      if raw.id.is_empty() {
        LoadError::EmptyStepID
      } else {
        LoadError::InvalidStepId(raw.id.clone(), e.to_string())
      }
    })?;

  let kind = match (raw.build, raw.push, raw.cmd) {
    (Some(build), None, None) => StepKind::Build {
      build: prefix_build_tags(&build, registry)?,
    },
    (None, Some(push), None) => StepKind::Push {
      push: push
        .into_iter()
        .map(|p| prefix_registry(&p, registry))
        .collect(),
    },
    (None, None, Some(cmd)) => StepKind::Cmd { cmd },
    (None, None, None) => {
      return Err(LoadError::EmptyStepKind(raw.id));
    }
    _ => return Err(LoadError::AmbiguousStepKind(raw.id)),
  };

  let step_env = raw
    .env
    .iter()
    .map(|e| document::parse_env_entry(e))
    .collect::<Result<Vec<EnvVar>, LoadError>>()?;
  let environment = merge_env(default_env, &step_env);
  let secret_environment = raw
    .secret_env
    .iter()
    .map(|e| document::parse_env_entry(e))
    .collect::<Result<Vec<EnvVar>, LoadError>>()?;

  let exec = ExecutionInputs {
    working_directory: raw.working_directory,
    entrypoint: raw.entrypoint,
    environment,
    secret_environment,
    ports: raw.ports,
    published_ports: raw.publish_ports,
    user: raw.user,
    isolation: raw.isolation,
    network: raw.network,
    privileged: raw.privileged,
    keep: raw.keep,
    detach: raw.detach,
    pull: raw.pull,
  };

  let policy = StepPolicy {
    timeout: raw
      .timeout
      .map(Duration::from_secs)
      .unwrap_or(default_step_timeout),
    retries: raw.retries,
    retry_delay: Duration::from_secs(
      raw.retry_delay.unwrap_or(DEFAULT_RETRY_DELAY_SECS),
    ),
    retry_on_errors: raw.retry_on_errors,
    repeat: raw.repeat,
    start_delay: Duration::from_secs(
      raw.start_delay.unwrap_or(DEFAULT_START_DELAY_SECS),
    ),
    ignore_errors: raw.ignore_errors,
    exited_with: raw.exited_with,
    exited_without: raw.exited_without,
  };

  Ok(Step { id: raw.id, kind, exec, when: raw.when, policy })
}

/// Task-level defaults with step-specific entries layered on top; a step
/// entry with the same variable name replaces the task-level one rather
/// than producing a duplicate.
fn merge_env(defaults: &[EnvVar], overrides: &[EnvVar]) -> Vec<EnvVar> {
  let mut merged: Vec<EnvVar> = defaults.to_vec();
  for o in overrides {
    match merged.iter_mut().find(|e| e.variable == o.variable) {
      Some(existing) => existing.value = o.value.clone(),
      None => merged.push(o.clone()),
    }
  }
  merged
}

/// No-op iff `image` already starts with `<registry>/` or `library/` —
/// the exact, literal rule (not a heuristic guess at "looks like a host")
/// so prefixing stays idempotent under repeated application.
fn looks_registry_qualified(image: &str, registry: &str) -> bool {
  (!registry.is_empty() && image.starts_with(&format!("{registry}/")))
    || image.starts_with("library/")
}

fn prefix_registry(image: &str, registry: &str) -> String {
  if registry.is_empty() || looks_registry_qualified(image, registry) {
    image.to_string()
  } else {
    format!("{registry}/{image}")
  }
}

/// Rewrites every `-t`/`--tag` argument of a `docker build` argument
/// string to carry the target registry prefix, leaving everything else
/// untouched.
fn prefix_build_tags(
  build: &str,
  registry: &str,
) -> Result<String, LoadError> {
  if registry.is_empty() {
    return Ok(build.to_string());
  }

  let tokens = shlex::split(build).ok_or_else(|| {
    LoadError::MalformedDocument({
      use serde::de::Error as _;
      serde_yaml_ng::Error::custom(format!(
        "build arguments {build:?} are not valid shell syntax"
      ))
    })
  })?;

  let mut out = Vec::with_capacity(tokens.len());
  let mut i = 0;
  while i < tokens.len() {
    let tok = &tokens[i];
    if tok == "-t" || tok == "--tag" {
      out.push(tok.clone());
      i += 1;
      if let Some(value) = tokens.get(i) {
        out.push(prefix_registry(value, registry));
        i += 1;
      }
      continue;
    }
    if let Some(value) = tok.strip_prefix("--tag=") {
      out.push(format!("--tag={}", prefix_registry(value, registry)));
      i += 1;
      continue;
    }
    out.push(tok.clone());
    i += 1;
  }

  shlex::try_join(out.iter().map(String::as_str)).map_err(|e| {
    LoadError::MalformedDocument({
      use serde::de::Error as _;
      serde_yaml_ng::Error::custom(format!(
        "failed to reassemble build arguments: {e}"
      ))
    })
  })
}

#[cfg(test)]
mod test {
  use super::*;

  fn doc(steps_yaml: &str) -> String {
    format!("steps:\n{steps_yaml}")
  }

  #[test]
  fn loads_minimal_single_step_task() {
    let task = load(
      &doc("  - id: only\n    cmd: alpine echo hi\n"),
      "",
    )
    .unwrap();
    assert_eq!(task.steps.len(), 1);
    assert_eq!(task.dag.children(ROOT), ["only"]);
  }

  #[test]
  fn rejects_duplicate_ids() {
    let err = load(
      &doc(
        "  - id: a\n    cmd: alpine true\n  - id: a\n    cmd: alpine true\n",
      ),
      "",
    )
    .unwrap_err();
    assert!(matches!(err, LoadError::DuplicateStepID(_)));
  }

  #[test]
  fn rejects_unknown_dependency() {
    let err = load(
      &doc("  - id: a\n    cmd: alpine true\n    when: [ghost]\n"),
      "",
    )
    .unwrap_err();
    assert!(matches!(err, LoadError::UnknownDependency { .. }));
  }

  #[test]
  fn rejects_ambiguous_step_kind() {
    let err = load(
      &doc("  - id: a\n    cmd: alpine true\n    push: [x]\n"),
      "",
    )
    .unwrap_err();
    assert!(matches!(err, LoadError::AmbiguousStepKind(_)));
  }

  #[test]
  fn accepts_dotted_step_id() {
    let task = load(
      &doc("  - id: build.api\n    cmd: alpine echo hi\n"),
      "",
    )
    .unwrap();
    assert_eq!(task.steps.len(), 1);
    assert_eq!(task.dag.children(ROOT), ["build.api"]);
  }

  #[test]
  fn rejects_malformed_step_id_without_disguising_it_as_a_dependency_error() {
    let err = load(
      &doc("  - id: \"has space\"\n    cmd: alpine true\n"),
      "",
    )
    .unwrap_err();
    assert!(matches!(err, LoadError::InvalidStepId(id, _) if id == "has space"));
  }

  #[test]
  fn rejects_cycle() {
    let err = load(
      &doc(
        "  - id: a\n    cmd: alpine true\n    when: [b]\n  - id: b\n    cmd: alpine true\n    when: [a]\n",
      ),
      "",
    )
    .unwrap_err();
    assert!(matches!(err, LoadError::CyclicDependency(_)));
  }

  #[test]
  fn prefixes_build_tags_with_registry() {
    let task = load(
      &doc("  - id: a\n    build: -t app:v1 -f Dockerfile .\n"),
      "myregistry.io",
    )
    .unwrap();
    match &task.steps[0].kind {
      StepKind::Build { build } => {
        assert_eq!(build, "-t myregistry.io/app:v1 -f Dockerfile .");
      }
      _ => panic!("expected build step"),
    }
  }

  #[test]
  fn leaves_already_prefixed_tag_alone() {
    let task = load(
      &doc("  - id: a\n    build: -t myregistry.io/app:v1 .\n"),
      "myregistry.io",
    )
    .unwrap();
    match &task.steps[0].kind {
      StepKind::Build { build } => {
        assert_eq!(build, "-t myregistry.io/app:v1 .");
      }
      _ => panic!("expected build step"),
    }
  }

  #[test]
  fn leaves_library_prefixed_tag_alone() {
    let task = load(
      &doc("  - id: a\n    build: -t library/app:v1 .\n"),
      "myregistry.io",
    )
    .unwrap();
    match &task.steps[0].kind {
      StepKind::Build { build } => {
        assert_eq!(build, "-t library/app:v1 .");
      }
      _ => panic!("expected build step"),
    }
  }

  #[test]
  fn prefixing_is_idempotent() {
    let once = prefix_registry("app:v1", "myregistry.io");
    let twice = prefix_registry(&once, "myregistry.io");
    assert_eq!(once, twice);
  }

  #[test]
  fn alias_directive_is_expanded_before_parsing() {
    let source = doc(
      "  - id: a\n    build: -t $Registry/app:v1 .\n",
    );
    let with_header =
      format!("alias:\n  values:\n    Registry: myreg.io\n{source}");
    let task = load(&with_header, "").unwrap();
    match &task.steps[0].kind {
      StepKind::Build { build } => {
        assert!(build.contains("myreg.io/app:v1"));
      }
      _ => panic!("expected build step"),
    }
  }

  #[test]
  fn undefined_alias_in_document_is_left_unchanged() {
    let with_header = format!(
      "alias:\n  values: {{}}\n{}",
      doc("  - id: a\n    cmd: alpine true\n")
    );
    let task = load(&with_header, "").unwrap();
    assert_eq!(task.steps.len(), 1);
  }

  #[test]
  fn step_env_overrides_task_level_default() {
    let source = format!(
      "env:\n  - FOO=task\n{}",
      doc("  - id: a\n    cmd: alpine true\n    env:\n      - FOO=step\n      - BAR=only\n")
    );
    let task = load(&source, "").unwrap();
    let env = &task.steps[0].exec.environment;
    assert_eq!(env.iter().find(|e| e.variable == "FOO").unwrap().value, "step");
    assert_eq!(env.iter().find(|e| e.variable == "BAR").unwrap().value, "only");
  }

  #[test]
  fn volume_resolves_named_secret() {
    let source = format!(
      "secrets:\n  bundle:\n    a.txt: aGVsbG8=\nvolumes:\n  - name: v\n    secret: bundle\n{}",
      doc("  - id: a\n    cmd: alpine true\n")
    );
    let task = load(&source, "").unwrap();
    assert_eq!(task.volumes[0].secret.files.get("a.txt").unwrap(), "aGVsbG8=");
  }

  #[test]
  fn volume_rejects_unknown_secret() {
    let source = format!(
      "volumes:\n  - name: v\n    secret: ghost\n{}",
      doc("  - id: a\n    cmd: alpine true\n")
    );
    let err = load(&source, "").unwrap_err();
    assert!(matches!(err, LoadError::UnknownSecret { .. }));
  }
}
