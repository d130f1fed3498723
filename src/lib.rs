pub mod actions;
pub mod compiler;
pub mod config;
pub mod dsl;
pub mod error;
pub mod nodes;
pub mod runtime;

pub use actions::{Delegate, DelegateExecution, DelegateRegistry, ServiceDelegate, SignallableDelegate};
pub use config::EngineConfig;
pub use dsl::builder::ProcessBuilder;
pub use error::{BpmnError, EngineError, Result};
pub use runtime::engine::{Engine, EngineBuilder, SignalDelivery};
pub use runtime::jobs::{JobOutcome, JobScheduler};
pub use runtime::model::{Execution, Job, JobState, Task, TaskStatus, Variables};
