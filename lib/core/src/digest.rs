//! Assembles the final image dependency report once every step has run.
//! Per-step digest attachment happens inline in the executor (each step
//! resolves its own image's digest as soon as it knows the image exists);
//! this module's job is purely to walk the finished `Task` and produce the
//! one JSON document the caller gets back.

use std::collections::HashMap;

use serde::Serialize;

use crate::task::{ImageDependencyEntry, StepStatus, Task};

#[derive(Debug, Serialize)]
pub struct DependencyReport {
  pub steps: HashMap<String, StepReport>,
}

#[derive(Debug, Serialize)]
pub struct StepReport {
  pub status: StepStatus,
  pub dependencies: Vec<ImageDependencyEntry>,
}

/// Walks every step of `task` and collects its recorded image
/// dependencies. Steps that never ran (`Skipped`, because an ancestor
/// failed) contribute an empty dependency list rather than being omitted,
/// so the report always accounts for every step the document declared.
pub fn collect(task: &Task) -> DependencyReport {
  let mut steps = HashMap::with_capacity(task.steps.len());
  for step in &task.steps {
    let runtime = task
      .runtime_for(&step.id)
      .expect("every step has a runtime cell");
    steps.insert(
      step.id.clone(),
      StepReport {
        status: runtime.status(),
        dependencies: runtime.image_dependencies(),
      },
    );
  }
  DependencyReport { steps }
}

pub fn to_json(report: &DependencyReport) -> serde_json::Result<String> {
  serde_json::to_string_pretty(report)
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::{dag::Dag, task::StepRuntime};

  fn empty_task_with_one_step() -> Task {
    let mut dag = Dag::new();
    dag.add_node(crate::dag::ROOT);
    dag.add_node("a");
    dag.add_edge(crate::dag::ROOT, "a");

    let (runtime, rx) = StepRuntime::new();
    let mut step_index = HashMap::new();
    step_index.insert("a".to_string(), 0);

    Task {
      steps: vec![crate::task::Step {
        id: "a".to_string(),
        kind: crate::task::StepKind::Cmd { cmd: "alpine true".to_string() },
        exec: Default::default(),
        when: Vec::new(),
        policy: crate::task::StepPolicy {
          timeout: std::time::Duration::from_secs(1),
          retries: 0,
          retry_delay: std::time::Duration::ZERO,
          retry_on_errors: Vec::new(),
          repeat: 0,
          start_delay: std::time::Duration::ZERO,
          ignore_errors: false,
          exited_with: Vec::new(),
          exited_without: Vec::new(),
        },
      }],
      step_index,
      networks: Vec::new(),
      volumes: Vec::new(),
      credentials: HashMap::new(),
      default_step_timeout: std::time::Duration::from_secs(600),
      default_working_directory: None,
      dag,
      runtime: vec![runtime],
      completion_rx: vec![std::sync::Mutex::new(Some(rx))],
    }
  }

  #[test]
  fn skipped_step_reports_empty_dependencies() {
    let task = empty_task_with_one_step();
    let report = collect(&task);
    let step = &report.steps["a"];
    assert_eq!(step.status, StepStatus::Skipped);
    assert!(step.dependencies.is_empty());
  }

  #[test]
  fn report_serializes_to_json() {
    let task = empty_task_with_one_step();
    let report = collect(&task);
    let json = to_json(&report).unwrap();
    assert!(json.contains("\"a\""));
  }
}
