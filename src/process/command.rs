use std::collections::HashMap;
use std::io;
use std::process::Stdio;

use log::debug;
use tokio::process::{Child, ChildStdin, Command as TokioCommand};

use crate::config::ToolConfig;
use crate::error::{Result, SessionError};
use crate::process::OutputReader;

/// Flags that keep the tool resident and reading arguments from stdin
pub const BATCH_MODE_ARGS: [&str; 4] = ["-stay_open", "True", "-@", "-"];

/// Description of how to launch the tool
#[derive(Debug, Clone)]
pub struct ToolCommand {
    /// Program to execute
    program: String,

    /// Arguments to pass to the program
    args: Vec<String>,

    /// Environment variables
    env_vars: HashMap<String, String>,
}

/// A freshly spawned tool with its input pipe and merged output stream
pub struct SpawnedTool {
    pub child: Child,
    pub stdin: ChildStdin,
    pub output: OutputReader,
}

impl ToolCommand {
    /// Create a new command
    pub fn new<S: Into<String>>(program: S) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env_vars: HashMap::new(),
        }
    }

    /// The batch-mode invocation described by `config`
    pub fn from_config(config: &ToolConfig) -> Self {
        Self::new(config.binary.clone())
            .args(BATCH_MODE_ARGS)
            .args(config.extra_args.iter().cloned())
    }

    /// Add an argument
    pub fn arg<S: Into<String>>(mut self, arg: S) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Add multiple arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for arg in args {
            self.args.push(arg.into());
        }
        self
    }

    /// Add an environment variable
    pub fn env<K, V>(mut self, key: K, val: V) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.env_vars.insert(key.into(), val.into());
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    /// Spawn the tool with stdout and stderr sharing one pipe
    ///
    /// Both streams write into the same OS pipe, so error lines stay in
    /// order relative to the ready token that follows them.
    pub fn spawn(&self) -> Result<SpawnedTool> {
        debug!("Spawning command: {} {:?}", self.program, self.args);

        let (reader, writer) = io::pipe().map_err(SessionError::Launch)?;
        let stderr_writer = writer.try_clone().map_err(SessionError::Launch)?;

        let mut child = {
            let mut cmd = TokioCommand::new(&self.program);
            cmd.args(&self.args)
                .stdin(Stdio::piped())
                .stdout(writer)
                .stderr(stderr_writer)
                .kill_on_drop(true);

            for (key, val) in &self.env_vars {
                cmd.env(key, val);
            }

            // Dropping `cmd` closes our copies of the write end
            cmd.spawn().map_err(SessionError::Launch)?
        };

        let stdin = child.stdin.take().ok_or_else(|| {
            SessionError::Launch(io::Error::other("failed to get stdin handle"))
        })?;
        let output = async_reader(reader).map_err(SessionError::Launch)?;

        debug!("Spawned {} with pid {:?}", self.program, child.id());

        Ok(SpawnedTool {
            child,
            stdin,
            output,
        })
    }
}

#[cfg(unix)]
fn async_reader(reader: io::PipeReader) -> io::Result<OutputReader> {
    use std::os::fd::OwnedFd;
    use tokio::net::unix::pipe;

    let file = std::fs::File::from(OwnedFd::from(reader));
    Ok(Box::new(pipe::Receiver::from_file(file)?))
}

#[cfg(windows)]
fn async_reader(reader: io::PipeReader) -> io::Result<OutputReader> {
    use std::os::windows::io::OwnedHandle;

    let file = std::fs::File::from(OwnedHandle::from(reader));
    Ok(Box::new(tokio::fs::File::from_std(file)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[test]
    fn test_from_config_puts_batch_flags_first() {
        let config = ToolConfig {
            binary: "/usr/bin/exiftool".to_string(),
            extra_args: vec!["-charset".to_string(), "filename=utf8".to_string()],
            ..Default::default()
        };

        let command = ToolCommand::from_config(&config);
        assert_eq!(command.program(), "/usr/bin/exiftool");
        assert_eq!(
            command.get_args(),
            ["-stay_open", "True", "-@", "-", "-charset", "filename=utf8"]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_merges_stdout_and_stderr() {
        let command = ToolCommand::new("sh")
            .arg("-c")
            .arg("echo out; echo err >&2; echo \"$GREETING\"")
            .env("GREETING", "hello");

        let mut spawned = command.spawn().unwrap();
        drop(spawned.stdin);

        let mut merged = String::new();
        spawned.output.read_to_string(&mut merged).await.unwrap();
        assert_eq!(merged, "out\nerr\nhello\n");

        let status = spawned.child.wait().await.unwrap();
        assert!(status.success());
    }

    #[tokio::test]
    async fn test_spawn_missing_binary() {
        let result = ToolCommand::new("nonexistent_command_12345").spawn();
        assert!(matches!(result, Err(SessionError::Launch(_))));
    }
}
