use std::{
  path::Path,
  sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
  },
  time::Duration,
};

use cache::CloneCache;
use tokio_util::sync::CancellationToken;

use crate::{CommandOutput, run_shell_command, run_standard_command};

/// Only the trailing window of combined stdout+stderr is kept around
/// to test retry-on-error patterns against, so a chatty subprocess
/// can't grow the matched buffer without bound.
const RETRY_TAIL_BYTES: usize = 64 * 1024;

type Handle = u64;

#[derive(thiserror::Error, Debug, Clone)]
pub enum ProcessError {
  #[error("subprocess exited with code {code:?}\n{tail}")]
  Subprocess { code: Option<i32>, tail: String },
  #[error("cancelled before subprocess completed")]
  Cancelled,
}

impl ProcessError {
  pub fn is_cancelled(&self) -> bool {
    matches!(self, ProcessError::Cancelled)
  }
}

/// A bounded registry of live subprocesses.
///
/// Tracks every in-flight subprocess in a handle table guarded by the
/// underlying [CloneCache]'s lock, supports cancelling all of them at
/// once via [ProcessManager::stop], and layers uniform retry / repeat
/// loops with output-pattern retry predicates on top of one-shot runs.
#[derive(Default)]
pub struct ProcessManager {
  handles: CloneCache<Handle, Arc<CancellationToken>>,
  next_handle: AtomicU64,
  /// Cancelling this token cancels every handle registered at the time
  /// of cancellation, and every handle registered after it (child
  /// tokens inherit an already-cancelled parent immediately).
  stopped: CancellationToken,
}

impl ProcessManager {
  pub fn new() -> Self {
    Self::default()
  }

  /// Cancels all registered subprocesses. Idempotent.
  pub fn stop(&self) {
    self.stopped.cancel();
  }

  async fn register(
    &self,
    ctx: &CancellationToken,
  ) -> (Handle, Arc<CancellationToken>) {
    let handle = self.next_handle.fetch_add(1, Ordering::SeqCst);
    // Cancelled if the caller's context is cancelled, or Stop() is called.
    let token = Arc::new(self.stopped.child_token());
    let linked = token.clone();
    let ctx = ctx.clone();
    tokio::spawn(async move {
      ctx.cancelled().await;
      linked.cancel();
    });
    self.handles.insert(handle, token.clone()).await;
    (handle, token)
  }

  async fn unregister(&self, handle: Handle) {
    self.handles.remove(&handle).await;
  }

  /// Blocking one-shot execution. The subprocess is registered in the
  /// process table (keyed by a monotonically increasing handle) while
  /// alive, and removed on exit.
  pub async fn run(
    &self,
    ctx: &CancellationToken,
    command: &str,
    shell: bool,
    path: Option<&Path>,
  ) -> Result<CommandOutput, ProcessError> {
    if ctx.is_cancelled() || self.stopped.is_cancelled() {
      return Err(ProcessError::Cancelled);
    }

    let (handle, token) = self.register(ctx).await;
    let output = tokio::select! {
      biased;
      _ = token.cancelled() => {
        self.unregister(handle).await;
        return Err(ProcessError::Cancelled);
      }
      output = run(command, shell, path) => output,
    };
    self.unregister(handle).await;

    if output.success() {
      Ok(output)
    } else {
      Err(ProcessError::Subprocess {
        code: output.status.code(),
        tail: output.tail(RETRY_TAIL_BYTES),
      })
    }
  }

  /// Retries up to `retries` additional times. A failed invocation is
  /// retried only if `retry_patterns` is empty, or the combined
  /// stdout+stderr output contains at least one of the patterns as a
  /// substring. Sleeps `retry_delay` seconds between attempts,
  /// interruptible by `ctx`.
  pub async fn run_with_retries(
    &self,
    ctx: &CancellationToken,
    command: &str,
    shell: bool,
    path: Option<&Path>,
    retries: u32,
    retry_patterns: &[String],
    retry_delay: Duration,
  ) -> Result<CommandOutput, ProcessError> {
    let mut attempt = 0;
    loop {
      match self.run(ctx, command, shell, path).await {
        Ok(output) => return Ok(output),
        Err(ProcessError::Cancelled) => {
          return Err(ProcessError::Cancelled);
        }
        Err(
          e @ ProcessError::Subprocess { ref tail, .. },
        ) => {
          let retryable = attempt < retries
            && (retry_patterns.is_empty()
              || retry_patterns
                .iter()
                .any(|pattern| tail.contains(pattern.as_str())));
          if !retryable {
            return Err(e);
          }
          attempt += 1;
          tokio::select! {
            biased;
            _ = ctx.cancelled() => return Err(ProcessError::Cancelled),
            _ = self.stopped.cancelled() => return Err(ProcessError::Cancelled),
            _ = tokio::time::sleep(retry_delay) => {}
          }
        }
      }
    }
  }

  /// Runs [ProcessManager::run_with_retries], then on success runs it
  /// `repeat` additional times. Repeat iterations are independent
  /// retry-capable invocations; any failure in the repeat series is
  /// fatal (it is not itself retried beyond its own retry policy,
  /// which callers typically pass as zero for repeat iterations).
  #[allow(clippy::too_many_arguments)]
  pub async fn run_repeat_with_retries(
    &self,
    ctx: &CancellationToken,
    command: &str,
    shell: bool,
    path: Option<&Path>,
    retries: u32,
    retry_patterns: &[String],
    retry_delay: Duration,
    repeat: u32,
  ) -> Result<CommandOutput, ProcessError> {
    let first = self
      .run_with_retries(
        ctx,
        command,
        shell,
        path,
        retries,
        retry_patterns,
        retry_delay,
      )
      .await?;

    let mut last = first;
    for _ in 0..repeat {
      last = self
        .run_with_retries(
          ctx,
          command,
          shell,
          path,
          retries,
          retry_patterns,
          retry_delay,
        )
        .await?;
    }
    Ok(last)
  }
}

async fn run(
  command: &str,
  shell: bool,
  path: Option<&Path>,
) -> CommandOutput {
  if shell {
    run_shell_command(command, path).await
  } else {
    run_standard_command(command, path).await
  }
}

#[cfg(test)]
mod test {
  use super::*;

  #[tokio::test]
  async fn run_succeeds_on_zero_exit() {
    let manager = ProcessManager::new();
    let ctx = CancellationToken::new();
    let out = manager.run(&ctx, "true", false, None).await.unwrap();
    assert!(out.success());
  }

  #[tokio::test]
  async fn run_fails_on_nonzero_exit() {
    let manager = ProcessManager::new();
    let ctx = CancellationToken::new();
    let err = manager.run(&ctx, "false", false, None).await.unwrap_err();
    assert!(matches!(err, ProcessError::Subprocess { .. }));
  }

  #[tokio::test]
  async fn retries_on_matching_pattern_then_succeeds() {
    let manager = ProcessManager::new();
    let ctx = CancellationToken::new();
    let dir = tempfile::tempdir().unwrap();
    let counter = dir.path().join("count");
    std::fs::write(&counter, "0").unwrap();
    let script = format!(
      "n=$(cat {0}); n=$((n+1)); echo $n > {0}; if [ $n -lt 3 ]; then echo transient failure 1>&2; exit 1; fi",
      counter.display()
    );
    let out = manager
      .run_with_retries(
        &ctx,
        &script,
        true,
        None,
        3,
        &["transient".to_string()],
        Duration::from_millis(1),
      )
      .await
      .unwrap();
    assert!(out.success());
    assert_eq!(std::fs::read_to_string(&counter).unwrap(), "3");
  }

  #[tokio::test]
  async fn does_not_retry_when_pattern_absent() {
    let manager = ProcessManager::new();
    let ctx = CancellationToken::new();
    let err = manager
      .run_with_retries(
        &ctx,
        "echo unrelated 1>&2; exit 1",
        true,
        None,
        5,
        &["transient".to_string()],
        Duration::from_millis(1),
      )
      .await
      .unwrap_err();
    assert!(matches!(err, ProcessError::Subprocess { .. }));
  }

  #[tokio::test]
  async fn empty_pattern_list_retries_on_any_failure() {
    let manager = ProcessManager::new();
    let ctx = CancellationToken::new();
    let dir = tempfile::tempdir().unwrap();
    let counter = dir.path().join("count");
    std::fs::write(&counter, "0").unwrap();
    let script = format!(
      "n=$(cat {0}); n=$((n+1)); echo $n > {0}; if [ $n -lt 2 ]; then exit 1; fi",
      counter.display()
    );
    let out = manager
      .run_with_retries(
        &ctx,
        &script,
        true,
        None,
        2,
        &[],
        Duration::from_millis(1),
      )
      .await
      .unwrap();
    assert!(out.success());
  }

  #[tokio::test]
  async fn stop_cancels_in_flight_run() {
    let manager = Arc::new(ProcessManager::new());
    let ctx = CancellationToken::new();
    let m = manager.clone();
    let handle =
      tokio::spawn(async move { m.run(&ctx, "sleep 30", false, None).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    manager.stop();
    let result = tokio::time::timeout(Duration::from_secs(2), handle)
      .await
      .unwrap()
      .unwrap();
    assert!(matches!(result, Err(ProcessError::Cancelled)));
  }
}
