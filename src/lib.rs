pub mod config;
pub mod deploy;
pub mod error;
pub mod node;
pub mod retry;
pub mod runner;
pub mod scheduler;
pub mod server;
pub mod shutdown;
pub mod utilization;
pub mod worker;
