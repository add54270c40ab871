use std::{process::ExitCode, sync::Arc};

use anyhow::Context;
use imagegraph_core::{
  collaborators::Collaborators,
  digest, docker,
  executor::{ExecutorConfig, RegistryLogin},
};
use tracing::Instrument;

use crate::config::{cli_args, config};

#[macro_use]
extern crate tracing;

mod config;

async fn app() -> anyhow::Result<ExitCode> {
  let args = cli_args();
  let config = config();
  logger::init(&config.logging)?;

  let startup_span = info_span!("ImageGraphStartup");

  async {
    info!("imagegraph version: v{}", env!("CARGO_PKG_VERSION"));
    info!(registry = %config.registry, "loading task document");
  }
  .instrument(startup_span)
  .await;

  let source = std::fs::read_to_string(&args.task_file).with_context(|| {
    format!("failed to read task file {}", args.task_file.display())
  })?;

  let task = imagegraph_core::load(&source, &config.registry)
    .context("failed to load task document")?;
  let task = Arc::new(task);

  let process_manager = Arc::new(command::ProcessManager::new());
  let collaborators: Arc<Collaborators> = Arc::new(
    docker::default_collaborators(std::env::temp_dir().join("imagegraph-secrets"))
      .context("failed to initialize container engine collaborators")?,
  );

  let registry_login = match (&config.registry_username, &config.registry_password) {
    (Some(username), Some(password)) if !config.registry.is_empty() => {
      Some(RegistryLogin {
        domain: config.registry.clone(),
        username: username.clone(),
        password: password.clone(),
      })
    }
    _ => None,
  };

  let executor_config = ExecutorConfig {
    max_concurrency: config.max_concurrency,
    registry_login,
    ..Default::default()
  };

  let result =
    imagegraph_core::run_task(task.clone(), collaborators, process_manager, executor_config)
      .await;

  let report = digest::collect(&task);
  println!("{}", digest::to_json(&report)?);

  match result {
    Ok(()) => Ok(ExitCode::SUCCESS),
    Err(e) => {
      error!(step = e.step_id, error = %e.source, "task failed");
      Ok(ExitCode::FAILURE)
    }
  }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
  dotenvy::dotenv().ok();

  let mut term_signal =
    tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

  let app = tokio::spawn(app());

  tokio::select! {
    res = app => res?,
    _ = term_signal.recv() => {
      info!("received SIGTERM, exiting");
      Ok(ExitCode::FAILURE)
    },
  }
}
