use std::{
  io,
  os::unix::process::ExitStatusExt,
  process::{ExitStatus, Output},
};

#[derive(Debug, Clone)]
pub struct CommandOutput {
  pub status: ExitStatus,
  pub stdout: String,
  pub stderr: String,
}

impl CommandOutput {
  pub fn from(output: io::Result<Output>) -> Self {
    match output {
      Ok(output) => Self {
        status: output.status,
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
      },
      Err(e) => CommandOutput::from_err(e),
    }
  }

  pub fn from_err(e: io::Error) -> Self {
    Self {
      status: ExitStatus::from_raw(1),
      stdout: String::new(),
      stderr: format!("{e:#}"),
    }
  }

  pub fn success(&self) -> bool {
    self.status.success()
  }

  /// Combined stdout+stderr, truncated to the last `max_bytes`.
  /// Used to match retry-on-error patterns without growing
  /// the matched buffer unboundedly for chatty subprocesses.
  pub fn tail(&self, max_bytes: usize) -> String {
    let mut combined = String::with_capacity(
      self.stdout.len() + self.stderr.len() + 1,
    );
    combined.push_str(&self.stdout);
    combined.push('\n');
    combined.push_str(&self.stderr);
    if combined.len() <= max_bytes {
      combined
    } else {
      let start = combined.len() - max_bytes;
      // Don't split a UTF-8 char boundary.
      let start = (start..combined.len())
        .find(|&i| combined.is_char_boundary(i))
        .unwrap_or(combined.len());
      combined[start..].to_string()
    }
  }
}
