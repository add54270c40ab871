pub mod alias;
pub mod collaborators;
pub mod dag;
pub mod digest;
pub mod docker;
pub mod document;
pub mod error;
pub mod executor;
pub mod loader;
pub mod task;

pub use error::{LoadError, RuntimeError, StepError};
pub use executor::{run_task, ExecutorConfig, RegistryLogin};
pub use loader::load;
pub use task::Task;
