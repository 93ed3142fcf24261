pub mod config;
pub mod coordinator;
pub mod error;
pub mod gate;
pub mod routes;
pub mod sandbox;
pub mod web_server;
pub mod workspace;

pub use coordinator::{Coordinator, ExecutionRequest};
pub use error::ExecError;
pub use sandbox::{ExecutionOutcome, ExitStatus, LimitExceeded, Stage};
