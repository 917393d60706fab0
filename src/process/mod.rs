//! Stay-open process management
//!
//! This module launches the tool in batch mode, frames its merged output into
//! discrete responses and serializes requests so only one is in flight at a
//! time.

mod command;
mod framer;
mod session;

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};

pub use command::{BATCH_MODE_ARGS, SpawnedTool, ToolCommand};
pub use framer::{FrameError, READY_TOKEN, ReadyTokenCodec};
pub use session::{EXECUTE_COMMAND, ProcessSession, STOP_COMMAND, TOOL_ERROR_PREFIX};

use crate::config::{OutputFormat, ToolConfig};
use crate::error::Result;

/// Readable side of the tool's merged stdout/stderr
pub type OutputReader = Box<dyn AsyncRead + Send + Unpin>;

/// Writable side of the tool's stdin
pub type InputWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Something that can bring up a fresh [`ProcessSession`]
#[async_trait::async_trait]
pub trait Launcher: Send + Sync + 'static {
    /// Start a new session
    async fn launch(&self) -> Result<ProcessSession>;
}

/// Per-session behaviour
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Response format requested from the tool
    pub format: OutputFormat,

    /// Maximum time to wait for the process to exit on shutdown
    pub shutdown_timeout: Duration,

    /// Maximum time a single query may wait for its response
    pub query_timeout: Option<Duration>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            format: OutputFormat::Json,
            shutdown_timeout: Duration::from_secs(1),
            query_timeout: None,
        }
    }
}

impl From<&ToolConfig> for SessionOptions {
    fn from(config: &ToolConfig) -> Self {
        Self {
            format: config.format,
            shutdown_timeout: config.shutdown_timeout(),
            query_timeout: config.query_timeout(),
        }
    }
}

/// Launches the real tool as a child process
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    command: ToolCommand,
    options: SessionOptions,
}

impl CommandLauncher {
    pub fn new(command: ToolCommand, options: SessionOptions) -> Self {
        Self { command, options }
    }

    pub fn from_config(config: &ToolConfig) -> Self {
        Self::new(ToolCommand::from_config(config), SessionOptions::from(config))
    }
}

#[async_trait::async_trait]
impl Launcher for CommandLauncher {
    async fn launch(&self) -> Result<ProcessSession> {
        ProcessSession::start(&self.command, self.options.clone())
    }
}

/// In-memory stand-in for the tool, shared by the session and supervisor tests
#[cfg(test)]
pub(crate) mod fake {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

    use super::*;

    /// Bookkeeping every fake process writes into
    #[derive(Debug, Default)]
    pub struct FakeStats {
        pub launched: AtomicUsize,
        pub terminated: AtomicUsize,
        pub requests: std::sync::Mutex<Vec<Vec<String>>>,
    }

    impl FakeStats {
        pub fn live(&self) -> usize {
            self.launched.load(Ordering::SeqCst) - self.terminated.load(Ordering::SeqCst)
        }
    }

    /// How the fake answers one request
    pub type Responder = Arc<dyn Fn(&[String]) -> String + Send + Sync>;

    pub fn echo_responder() -> Responder {
        Arc::new(|args: &[String]| {
            let path = args.last().cloned().unwrap_or_default();
            if path.starts_with("missing") {
                format!("Error: File not found - {}\n", path)
            } else {
                format!("[{{\"SourceFile\": \"{}\"}}]\n", path)
            }
        })
    }

    /// Start a fake tool speaking the stay-open protocol over in-memory pipes
    pub fn spawn_fake(
        stats: Arc<FakeStats>,
        responder: Responder,
        delay: Duration,
    ) -> (InputWriter, OutputReader) {
        let (session_in, tool_in) = tokio::io::duplex(4096);
        let (tool_out, session_out) = tokio::io::duplex(4096);

        stats.launched.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(run_fake(tool_in, tool_out, stats, responder, delay));

        (Box::new(session_in), Box::new(session_out))
    }

    async fn run_fake(
        input: DuplexStream,
        mut output: DuplexStream,
        stats: Arc<FakeStats>,
        responder: Responder,
        delay: Duration,
    ) {
        let mut lines = BufReader::new(input).lines();
        let mut pending = Vec::new();

        while let Ok(Some(line)) = lines.next_line().await {
            match line.as_str() {
                "-execute" => {
                    let args = std::mem::take(&mut pending);
                    stats.requests.lock().unwrap().push(args.clone());
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    let body = responder(args.as_slice());
                    if output.write_all(body.as_bytes()).await.is_err()
                        || output.write_all(b"{ready}\n").await.is_err()
                    {
                        break;
                    }
                }
                "-stay_open" => {
                    if let Ok(Some(flag)) = lines.next_line().await {
                        if flag == "False" {
                            break;
                        }
                    }
                }
                _ => pending.push(line),
            }
        }

        stats.terminated.fetch_add(1, Ordering::SeqCst);
    }

    /// Launcher handing out fake processes
    pub struct FakeLauncher {
        pub stats: Arc<FakeStats>,
        pub responder: Responder,
        pub delay: Duration,
        pub options: SessionOptions,
    }

    impl FakeLauncher {
        pub fn new(options: SessionOptions) -> Self {
            Self {
                stats: Arc::new(FakeStats::default()),
                responder: echo_responder(),
                delay: Duration::ZERO,
                options,
            }
        }
    }

    #[async_trait::async_trait]
    impl Launcher for FakeLauncher {
        async fn launch(&self) -> Result<ProcessSession> {
            let (stdin, output) =
                spawn_fake(self.stats.clone(), self.responder.clone(), self.delay);
            Ok(ProcessSession::from_parts(
                stdin,
                output,
                None,
                self.options.clone(),
            ))
        }
    }
}
