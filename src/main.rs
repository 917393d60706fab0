use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, info};
use tokio::io::{AsyncBufReadExt, BufReader};

use stayopen::config::{ConfigBuilder, LogLevel, OutputFormat, ToolConfig};
use stayopen::prelude::{CancellationToken, SessionError, SupervisedSession};
use stayopen::util::logging;

/// Extract metadata through a resident, idle-reclaimed tool process
#[derive(Parser, Debug)]
#[command(name = "stayopen", version, about)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Tool binary to run
    #[arg(long)]
    binary: Option<String>,

    /// Request the plain report and reshape it into JSON
    #[arg(long)]
    plain: bool,

    /// Stop the tool after this many idle milliseconds
    #[arg(long)]
    idle_timeout_ms: Option<u64>,

    /// Give up on a single file after this many milliseconds
    #[arg(long)]
    query_timeout_ms: Option<u64>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long)]
    log_level: Option<String>,

    /// Files to inspect; read one per line from stdin when omitted
    files: Vec<String>,
}

impl Args {
    fn load_config(&self) -> Result<ToolConfig> {
        let mut builder = ConfigBuilder::<ToolConfig>::new();
        if let Some(path) = &self.config {
            builder = builder.add_file(path);
        }
        let mut config = builder.add_env("STAYOPEN").build()?;

        if let Some(binary) = &self.binary {
            config.binary = binary.clone();
        }
        if self.plain {
            config.format = OutputFormat::Plain;
        }
        if let Some(ms) = self.idle_timeout_ms {
            config.idle_timeout_ms = ms;
        }
        if self.query_timeout_ms.is_some() {
            config.query_timeout_ms = self.query_timeout_ms;
        }
        if let Some(level) = &self.log_level {
            config.log_level = parse_level(level)?;
        }

        config.validate()?;
        Ok(config)
    }
}

fn parse_level(level: &str) -> Result<LogLevel> {
    Ok(match level.to_ascii_lowercase().as_str() {
        "error" => LogLevel::Error,
        "warn" => LogLevel::Warn,
        "info" => LogLevel::Info,
        "debug" => LogLevel::Debug,
        "trace" => LogLevel::Trace,
        other => anyhow::bail!("unknown log level: {}", other),
    })
}

/// Query one file, printing the response; only session failures are fatal
async fn inspect(session: &SupervisedSession, path: &str) -> Result<bool> {
    let outcome = session.query(path).await;
    report(
        &mut std::io::stdout().lock(),
        &mut std::io::stderr().lock(),
        path,
        outcome,
    )
}

/// Responses go to `out`, tool rejections to `err` once each
fn report(
    out: &mut impl Write,
    err: &mut impl Write,
    path: &str,
    outcome: stayopen::prelude::Result<String>,
) -> Result<bool> {
    match outcome {
        Ok(response) => {
            writeln!(out, "{}", response)?;
            Ok(true)
        }
        Err(SessionError::Tool(message)) => {
            writeln!(err, "{}: {}", path, message)?;
            Ok(false)
        }
        Err(e) => Err(e).with_context(|| format!("failed to inspect {}", path)),
    }
}

/// Inspect every requested file, returning how many the tool rejected
async fn run(session: &SupervisedSession, files: &[String]) -> Result<usize> {
    let mut failures = 0;

    if files.is_empty() {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Some(line) = lines.next_line().await? {
            let path = line.trim();
            if path.is_empty() {
                continue;
            }
            if !inspect(session, path).await? {
                failures += 1;
            }
        }
    } else {
        for path in files {
            if !inspect(session, path).await? {
                failures += 1;
            }
        }
    }

    Ok(failures)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = args.load_config()?;
    logging::init(&config.log_level);
    debug!("Using configuration: {:?}", config);

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupted, stopping");
                cancel.cancel();
            }
        }
    });

    let session = SupervisedSession::from_config(&config, &cancel)?;
    let outcome = run(&session, &args.files).await;
    session.shutdown().await?;
    let failures = outcome?;

    if failures > 0 {
        info!("{} file(s) reported errors", failures);
        std::process::exit(1);
    }
    Ok(())
}
