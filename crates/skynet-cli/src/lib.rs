//! Pool of long-lived `claude` CLI subprocesses, one per conversation
//! (§4.11). A [`CliSessionManager`] owns a set of [`CliSession`]s; each
//! session streams NDJSON events off its subprocess's stdout and surfaces
//! them as [`session::CliEvent`]s.

pub mod error;
pub mod manager;
pub mod parser;
pub mod registry;
pub mod session;

pub use error::CliError;
pub use manager::{CliSessionManager, SessionStats};
pub use parser::{parse_event, CompletionStatus, ParsedCliEvent};
pub use session::{CliEvent, CliSession};
