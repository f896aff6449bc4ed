//! redgreen - continuous test runner
//!
//! Watches a project tree and keeps its test suite green:
//! - Polls the tree for modified files and maps them to test files
//! - Runs only the affected tests, then only the failing methods
//! - Collects per-method failures from the child over a loopback result server
//! - Re-runs the whole suite once the failures are fixed

pub mod command;
pub mod config;
pub mod error;
pub mod file_index;
pub mod hooks;
pub mod ledger;
pub mod mapping;
pub mod run_loop;
pub mod runner;
pub mod server;
pub mod session;

pub use config::Config;
pub use error::AutotestError;
pub use hooks::{Hook, HookEvent, HookHandler, HookRegistry};
pub use ledger::{FailureLedger, LedgerSnapshot};
pub use run_loop::{RunLoop, RunState};
pub use runner::{CommandRunner, RunOutcome, ShellRunner};
pub use server::{ReporterClient, ResultServer, ResultSink};
pub use session::SessionDir;
