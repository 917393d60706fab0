use std::io;
use std::time::Duration;

use bytes::BytesMut;
use futures::StreamExt;
use log::{debug, trace, warn};
use tokio::io::AsyncWriteExt;
use tokio::process::Child;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_util::codec::FramedRead;

use crate::config::OutputFormat;
use crate::encoding;
use crate::error::{Result, SessionError};
use crate::process::{
    FrameError, InputWriter, OutputReader, ReadyTokenCodec, SessionOptions, ToolCommand,
};
use crate::report;

/// Line that makes the tool run the arguments gathered so far
pub const EXECUTE_COMMAND: &str = "-execute";

/// Leaves batch mode; the tool exits after reading it
pub const STOP_COMMAND: &[u8] = b"-stay_open\nFalse\n";

/// Prefix of a response reporting a failure for the requested file
pub const TOOL_ERROR_PREFIX: &str = "Error: ";

/// One resident tool process and the pipes attached to it
///
/// All access goes through a single lock, so concurrent callers are answered
/// one at a time in the order they acquire it.
pub struct ProcessSession {
    pipes: Mutex<Option<Pipes>>,
    options: SessionOptions,
    pid: Option<u32>,
}

struct Pipes {
    stdin: InputWriter,
    frames: FramedRead<OutputReader, ReadyTokenCodec>,
    child: Option<Child>,
    stage: Stage,
}

/// Progress of the current request; a dropped query leaves it behind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Idle,
    /// Request partly written; the tool's input can no longer be trusted
    Writing,
    /// Request written, its response not yet read
    Awaiting,
}

impl ProcessSession {
    /// Launch the tool described by `command`
    pub fn start(command: &ToolCommand, options: SessionOptions) -> Result<Self> {
        let spawned = command.spawn()?;
        Ok(Self::from_parts(
            Box::new(spawned.stdin),
            spawned.output,
            Some(spawned.child),
            options,
        ))
    }

    /// Build a session over existing streams
    ///
    /// `child`, when present, is waited on (and killed if need be) during
    /// shutdown.
    pub fn from_parts(
        stdin: InputWriter,
        output: OutputReader,
        child: Option<Child>,
        options: SessionOptions,
    ) -> Self {
        let pid = child.as_ref().and_then(Child::id);
        Self {
            pipes: Mutex::new(Some(Pipes {
                stdin,
                frames: FramedRead::new(output, ReadyTokenCodec::new()),
                child,
                stage: Stage::Idle,
            })),
            options,
            pid,
        }
    }

    /// OS process id, when backed by a real process
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Whether the session still owns its pipes
    pub async fn is_open(&self) -> bool {
        self.pipes.lock().await.is_some()
    }

    /// Ask the tool about one file and return its normalized response
    pub async fn query(&self, path: &str) -> Result<String> {
        let mut guard = self.pipes.lock().await;
        let request = request_lines(self.options.format, path);

        if guard.as_ref().is_some_and(|pipes| pipes.stage == Stage::Writing) {
            warn!("Previous query was dropped mid-request, stopping the tool");
            if let Some(pipes) = guard.take() {
                if let Err(e) = pipes.kill().await {
                    debug!("Error killing tool: {}", e);
                }
            }
            return Err(SessionError::Io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "previous request was abandoned half written",
            )));
        }

        let frame = match self.options.query_timeout {
            None => {
                let pipes = guard.as_mut().ok_or_else(closed)?;
                pipes.exchange(&request).await?
            }
            Some(limit) => {
                let pipes = guard.as_mut().ok_or_else(closed)?;
                let outcome = timeout(limit, pipes.exchange(&request)).await;
                match outcome {
                    Ok(result) => result?,
                    Err(_) => {
                        warn!("No response for {} within {:?}, killing the tool", path, limit);
                        if let Some(pipes) = guard.take() {
                            if let Err(e) = pipes.kill().await {
                                debug!("Error killing wedged tool: {}", e);
                            }
                        }
                        return Err(SessionError::Timeout(limit));
                    }
                }
            }
        };

        interpret(&frame, self.options.format)
    }

    /// Leave batch mode and release the process
    ///
    /// Every step is attempted even when an earlier one fails; the first
    /// error is returned. Shutting down twice is a no-op.
    pub async fn shutdown(&self) -> Result<()> {
        let mut guard = self.pipes.lock().await;
        match guard.take() {
            Some(pipes) => pipes
                .shutdown(self.options.shutdown_timeout)
                .await
                .map_err(SessionError::Io),
            None => Ok(()),
        }
    }
}

impl Pipes {
    async fn exchange(&mut self, request: &[u8]) -> Result<BytesMut> {
        if self.stage == Stage::Awaiting {
            let stale = self.next_frame().await?;
            debug!("Discarded {} byte response of an abandoned query", stale.len());
            self.stage = Stage::Idle;
        }

        trace!("Sending request: {:?}", String::from_utf8_lossy(request));
        self.stage = Stage::Writing;
        self.stdin.write_all(request).await?;
        self.stdin.flush().await?;
        self.stage = Stage::Awaiting;

        let frame = self.next_frame().await?;
        self.stage = Stage::Idle;
        Ok(frame)
    }

    async fn next_frame(&mut self) -> Result<BytesMut> {
        match self.frames.next().await {
            Some(Ok(frame)) => Ok(frame),
            Some(Err(FrameError::Read(e))) => Err(SessionError::Read(e)),
            Some(Err(e)) => Err(SessionError::Framing(e.to_string())),
            None => Err(SessionError::Framing(
                "stream ended before a response was framed".to_string(),
            )),
        }
    }

    async fn shutdown(self, wait: Duration) -> io::Result<()> {
        let Pipes {
            mut stdin,
            frames,
            child,
            ..
        } = self;
        let mut first_error = None;

        keep_first(&mut first_error, stdin.write_all(STOP_COMMAND).await);
        keep_first(&mut first_error, stdin.flush().await);

        drop(frames);

        keep_first(&mut first_error, stdin.shutdown().await);
        drop(stdin);

        if let Some(mut child) = child {
            let waited = timeout(wait, child.wait()).await;
            match waited {
                Ok(Ok(status)) => debug!("Tool exited with {}", status),
                Ok(Err(e)) => keep_first(&mut first_error, Err(e)),
                Err(_) => {
                    warn!("Tool did not exit within {:?}, killing it", wait);
                    keep_first(&mut first_error, child.kill().await);
                }
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    async fn kill(self) -> io::Result<()> {
        let Pipes {
            stdin,
            frames,
            child,
            ..
        } = self;
        drop(frames);
        drop(stdin);
        match child {
            Some(mut child) => child.kill().await,
            None => Ok(()),
        }
    }
}

fn keep_first(slot: &mut Option<io::Error>, result: io::Result<()>) {
    if let Err(e) = result {
        debug!("Shutdown step failed: {}", e);
        slot.get_or_insert(e);
    }
}

fn closed() -> SessionError {
    SessionError::Io(io::Error::new(
        io::ErrorKind::BrokenPipe,
        "process session already shut down",
    ))
}

/// Argument lines for one request, ending with the execute command
fn request_lines(format: OutputFormat, path: &str) -> Vec<u8> {
    let mut request = Vec::with_capacity(path.len() + 16);
    if format == OutputFormat::Json {
        request.extend_from_slice(b"-j\n");
    }
    request.extend_from_slice(path.as_bytes());
    request.push(b'\n');
    request.extend_from_slice(EXECUTE_COMMAND.as_bytes());
    request.push(b'\n');
    request
}

/// Turn a raw frame into the caller-facing response
fn interpret(frame: &[u8], format: OutputFormat) -> Result<String> {
    let data = encoding::normalize(frame)?;
    let text = String::from_utf8_lossy(&data);
    let text = text.trim();

    if let Some(message) = text.strip_prefix(TOOL_ERROR_PREFIX) {
        return Err(SessionError::Tool(message.trim().to_string()));
    }

    Ok(match format {
        OutputFormat::Json => text.to_string(),
        OutputFormat::Plain => report::reshape(text),
    })
}
