use std::{
  collections::{HashMap, HashSet},
  sync::atomic::{AtomicUsize, Ordering},
};

use crate::error::LoadError;

/// The implicit node every step with an empty or immediate `when` depends
/// on. Not a step itself; exists only as an edge source.
pub const ROOT: &str = "";

/// Dependency graph over step ids.
///
/// `children`/`parents` are the static adjacency built once at load time —
/// used for cycle detection and for the executor to enumerate who to
/// notify when a node finishes. `degree` is the one thing that actually
/// mutates during a run: an atomic per-node counter seeded from in-degree
/// and decremented by [Dag::remove_edge] as each parent completes. A node
/// is ready the instant its own decrement brings the counter to zero,
/// which is also why `remove_edge` both removes the edge and reports the
/// new degree in one atomic step: a literal two-step "decrement, then
/// separately read" would race two parents finishing at once.
#[derive(Debug, Default)]
pub struct Dag {
  nodes: HashSet<String>,
  children: HashMap<String, Vec<String>>,
  parents: HashMap<String, Vec<String>>,
  degree: HashMap<String, AtomicUsize>,
}

impl Dag {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn add_node(&mut self, id: impl Into<String>) {
    let id = id.into();
    self.children.entry(id.clone()).or_default();
    self.parents.entry(id.clone()).or_default();
    self.degree.entry(id.clone()).or_insert_with(|| AtomicUsize::new(0));
    self.nodes.insert(id);
  }

  pub fn add_edge(&mut self, parent: &str, child: &str) {
    self.children.entry(parent.to_string()).or_default().push(child.to_string());
    self.parents.entry(child.to_string()).or_default().push(parent.to_string());
    self.degree.entry(child.to_string()).or_insert_with(|| AtomicUsize::new(0))
      .fetch_add(1, Ordering::SeqCst);
  }

  pub fn children(&self, id: &str) -> &[String] {
    self.children.get(id).map(Vec::as_slice).unwrap_or(&[])
  }

  pub fn parents(&self, id: &str) -> &[String] {
    self.parents.get(id).map(Vec::as_slice).unwrap_or(&[])
  }

  /// Current count of not-yet-satisfied parents.
  pub fn degree(&self, id: &str) -> usize {
    self.degree.get(id).map(|d| d.load(Ordering::SeqCst)).unwrap_or(0)
  }

  /// Marks the `parent -> child` dependency satisfied and returns the
  /// child's remaining degree after the decrement. A caller sees `0`
  /// exactly once per node: whichever parent's decrement is the last one
  /// through wins the race and is the one responsible for starting
  /// `child`.
  ///
  /// Calling this twice for the same `(parent, child)` pair is a caller
  /// bug (double-counts the decrement); the DAG does not guard against
  /// it, matching how a single in-degree edge is only ever meant to
  /// complete once.
  pub fn remove_edge(&self, parent: &str, child: &str) -> usize {
    let _ = parent;
    let counter = self
      .degree
      .get(child)
      .expect("remove_edge called on a node absent from the DAG");
    counter.fetch_sub(1, Ordering::SeqCst) - 1
  }

  pub fn nodes(&self) -> impl Iterator<Item = &str> {
    self.nodes.iter().map(String::as_str)
  }

  /// Depth-first cycle check over the step subgraph (root is excluded: it
  /// has no parents by construction and can't participate in a cycle).
  /// Returns the first cycle found as a `a -> b -> ... -> a` string.
  pub fn check_acyclic(&self) -> Result<(), LoadError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Color {
      White,
      Gray,
      Black,
    }

    let mut color: HashMap<&str, Color> =
      self.nodes.iter().map(|n| (n.as_str(), Color::White)).collect();
    let mut path: Vec<&str> = Vec::new();

    fn visit<'a>(
      dag: &'a Dag,
      node: &'a str,
      color: &mut HashMap<&'a str, Color>,
      path: &mut Vec<&'a str>,
    ) -> Result<(), LoadError> {
      match color.get(node) {
        Some(Color::Black) => return Ok(()),
        Some(Color::Gray) => {
          let mut cycle =
            path.iter().skip_while(|&&n| n != node).map(|s| s.to_string()).collect::<Vec<_>>();
          cycle.push(node.to_string());
          return Err(LoadError::CyclicDependency(cycle.join(" -> ")));
        }
        _ => {}
      }
      color.insert(node, Color::Gray);
      path.push(node);
      for child in dag.children(node) {
        if child != ROOT {
          visit(dag, child, color, path)?;
        }
      }
      path.pop();
      color.insert(node, Color::Black);
      Ok(())
    }

    for node in self.nodes.iter().map(String::as_str) {
      visit(self, node, &mut color, &mut path)?;
    }
    Ok(())
  }
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn degree_counts_distinct_parents() {
    let mut dag = Dag::new();
    dag.add_node("a");
    dag.add_node("b");
    dag.add_node("c");
    dag.add_edge("a", "c");
    dag.add_edge("b", "c");
    assert_eq!(dag.degree("c"), 2);
    assert_eq!(dag.degree("a"), 0);
  }

  #[test]
  fn remove_edge_decrements_and_reports_remaining() {
    let mut dag = Dag::new();
    dag.add_node("a");
    dag.add_node("b");
    dag.add_node("c");
    dag.add_edge("a", "c");
    dag.add_edge("b", "c");
    assert_eq!(dag.remove_edge("a", "c"), 1);
    assert_eq!(dag.remove_edge("b", "c"), 0);
  }

  #[test]
  fn acyclic_graph_passes() {
    let mut dag = Dag::new();
    dag.add_node("a");
    dag.add_node("b");
    dag.add_edge("a", "b");
    assert!(dag.check_acyclic().is_ok());
  }

  #[test]
  fn self_cycle_detected() {
    let mut dag = Dag::new();
    dag.add_node("a");
    dag.add_edge("a", "a");
    assert!(matches!(
      dag.check_acyclic(),
      Err(LoadError::CyclicDependency(_))
    ));
  }

  #[test]
  fn longer_cycle_detected() {
    let mut dag = Dag::new();
    dag.add_node("a");
    dag.add_node("b");
    dag.add_node("c");
    dag.add_edge("a", "b");
    dag.add_edge("b", "c");
    dag.add_edge("c", "a");
    assert!(matches!(
      dag.check_acyclic(),
      Err(LoadError::CyclicDependency(_))
    ));
  }
}
