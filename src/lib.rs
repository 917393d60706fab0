//! Supervised stay-open sessions for batch-mode metadata extraction tools
//!
//! The tool (typically `exiftool`) is started with `-stay_open True -@ -`,
//! fed one request per `-execute` on its stdin, and its merged output is split
//! into responses on the `{ready}` marker. A [`supervisor::SupervisedSession`]
//! starts the tool on demand and reclaims it after a quiet period.

pub mod config;
pub mod encoding;
pub mod error;
pub mod process;
pub mod report;
pub mod supervisor;
pub mod util;

/// Re-export of commonly used types for convenience
pub mod prelude {
    pub use crate::config::{ConfigBuilder, OutputFormat, ToolConfig};
    pub use crate::error::{Result, SessionError};
    pub use crate::process::{CommandLauncher, Launcher, ProcessSession, SessionOptions, ToolCommand};
    pub use crate::supervisor::SupervisedSession;
    pub use tokio_util::sync::CancellationToken;
}

/// Library version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
