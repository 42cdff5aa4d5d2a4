//! Instance lifecycle, subprocess supervision, and capability dispatch for SourceHub.
//!
//! The [`SourceManager`] is the entry point: it reloads instances from an
//! [`InstanceConfigStore`], keeps them in an atomically swapped
//! [`InstanceTable`], and fans `search`/`schedule` out to every capable
//! instance. Subprocess-backed instances are owned by the [`Supervisor`].

pub mod instance;
pub mod loader;
pub mod manager;
pub mod store;
pub mod supervisor;

pub use instance::{Instance, InstanceStatus, InstanceTable};
pub use loader::{InstanceLoader, ReloadReport};
pub use manager::{DispatchReport, Operation, SourceManager};
pub use store::{FileConfigStore, InstanceConfigStore, MemoryConfigStore};
pub use supervisor::{LogRecord, LogStream, ProcessHandle, ProcessState, Supervisor, run_log_sink};
