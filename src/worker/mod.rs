//! Worker side of the queue, plus the server's view of worker health.
//!
//! - [`aliveness`]: heartbeat bookkeeping on the server
//! - [`heartbeat`]: the worker's report-alive loop
//! - [`executor`]: runs a bucket's tests on this machine
//! - [`agent`]: register, dequeue, execute, report until the queue is empty

pub mod agent;
pub mod aliveness;
pub mod executor;
pub mod heartbeat;

pub use agent::{AgentSummary, StopReason, WorkerAgent};
pub use aliveness::{WorkerAliveness, WorkerAlivenessTracker, WorkerStatus};
pub use executor::{ProcessTestExecutor, TestExecutor};
