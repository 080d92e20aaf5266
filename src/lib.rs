//! Execution agent: polls an orchestration backend for commands and carries
//! them out in a real browser against the target web application.

pub mod brain;
pub mod config;
pub mod dispatcher;
pub mod dom;
pub mod driver;
pub mod engine;
pub mod error;
pub mod hands;
pub mod session;
pub mod state;
pub mod tree;
pub mod types;

pub use brain::{Backend, HttpBackend};
pub use config::AgentConfig;
pub use dispatcher::{CycleOutcome, Dispatcher};
pub use hands::ChromeDriver;
