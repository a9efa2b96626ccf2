//! Worker subsystem: identities, the task ledger, and supervised execution.

pub mod auth;
pub mod executor;
pub mod model;
pub mod registry;
pub mod runtime;
pub mod task_store;

pub use auth::{AuthFlow, AuthProvider, AuthState};
pub use executor::{ExecOutcome, ExecRequest, ExecStatus, Executor};
pub use model::{Backend, Task, TaskSource, TaskStatus, Worker, WorkerStatus};
pub use registry::WorkerRegistry;
pub use runtime::{DispatchRequest, WorkerRuntime};
pub use task_store::{TaskPatch, WorkerTaskStore};
