//! pkgterm - shell sessions for package-manager front ends
//!
//! Headless host for the terminal core. `pkgterm exec <cmd>...` runs each
//! command through the shared session and prints one JSON result per command.
//! Plain `pkgterm` bridges stdin lines to the shell and streams its output.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use settings::Config;
use std::io::Write as _;
use std::sync::Arc;
use std::time::Instant;
use terminal::{ExecResult, NativePtySpawner, SessionId, Terminal, TerminalOptions, TerminalSink};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Application startup time for performance monitoring
static STARTUP_TIME: Lazy<Instant> = Lazy::new(Instant::now);

/// Prefix that sends an interactive line through the exec queue.
const EXEC_PREFIX: &str = "!exec ";

/// Check if debug mode is enabled via environment variable.
fn is_debug_mode() -> bool {
    std::env::var("PKGTERM_DEBUG").is_ok()
}

/// Initialize the logging system. Logs go to stderr; stdout carries results.
fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let default_filter = if is_debug_mode() {
        "pkgterm=trace,terminal=trace,info"
    } else {
        "pkgterm=info,terminal=info,warn"
    };

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_line_number(true),
        )
        .with(filter)
        .init();

    if is_debug_mode() {
        info!(
            "pkgterm v{} starting up (DEBUG MODE ENABLED)",
            env!("CARGO_PKG_VERSION")
        );
        info!("Set RUST_LOG for custom log levels, e.g. RUST_LOG=terminal=trace");
    } else {
        debug!("pkgterm v{} starting up", env!("CARGO_PKG_VERSION"));
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Mode {
    /// Run each command through the queue and print its result.
    Exec(Vec<String>),
    /// Bridge stdin to the session.
    Interactive,
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<Mode> {
    match args.next().as_deref() {
        None => Ok(Mode::Interactive),
        Some("exec") => {
            let commands: Vec<String> = args.collect();
            if commands.is_empty() {
                bail!("usage: pkgterm exec <command>...");
            }
            Ok(Mode::Exec(commands))
        }
        Some(other) => bail!("unknown argument {other:?}; usage: pkgterm [exec <command>...]"),
    }
}

/// Sink that copies display output to stdout.
struct StdoutSink;

#[async_trait]
impl TerminalSink for StdoutSink {
    async fn on_data(&self, _session_id: SessionId, chunk: Vec<u8>) {
        let mut stdout = tokio::io::stdout();
        if let Err(e) = stdout.write_all(&chunk).await {
            warn!("Failed to write output: {}", e);
            return;
        }
        let _ = stdout.flush().await;
    }

    async fn on_exit(&self, session_id: SessionId, code: Option<i32>) {
        debug!("Session {} ended with {:?}", session_id, code);
    }
}

/// Sink for exec mode, where only the JSON results belong on stdout.
struct DiscardSink;

#[async_trait]
impl TerminalSink for DiscardSink {
    async fn on_data(&self, _session_id: SessionId, _chunk: Vec<u8>) {}

    async fn on_exit(&self, session_id: SessionId, code: Option<i32>) {
        debug!("Session {} ended with {:?}", session_id, code);
    }
}

fn print_result(result: &ExecResult) -> Result<()> {
    let line = serde_json::to_string(result).context("Failed to encode exec result")?;
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{line}").context("Failed to write exec result")?;
    Ok(())
}

/// Run all commands concurrently; results print in argument order.
async fn run_exec(terminal: Terminal, commands: Vec<String>) -> Result<bool> {
    let mut tasks = JoinSet::new();
    for (index, command) in commands.iter().cloned().enumerate() {
        let terminal = terminal.clone();
        tasks.spawn(async move { (index, terminal.exec(command).await) });
    }

    let mut results: Vec<Option<ExecResult>> = vec![None; commands.len()];
    while let Some(joined) = tasks.join_next().await {
        let (index, result) = joined.context("Exec task failed")?;
        results[index] = Some(result);
    }

    let mut all_ok = true;
    for result in results.into_iter().flatten() {
        all_ok &= result.success;
        print_result(&result)?;
    }
    terminal.shutdown().await;
    Ok(all_ok)
}

/// Shell a config asks for, if it names one.
fn configured_shell(config: &Config) -> String {
    config
        .shell
        .clone()
        .unwrap_or_else(|| config.default_shell.clone())
}

/// Re-open the session when the configured shell changes on disk.
fn watch_shell(terminal: &Terminal) -> Option<settings::ConfigWatcher> {
    let runtime = tokio::runtime::Handle::current();
    let terminal = terminal.clone();
    settings::watch_config(move |config| {
        let shell = configured_shell(config);
        let terminal = terminal.clone();
        runtime.spawn(async move {
            if let Err(e) = terminal.open(Some(shell.as_str())).await {
                error!("Failed to switch shell to {}: {}", shell, e);
            }
        });
    })
}

async fn run_interactive(terminal: Terminal) -> Result<()> {
    let _watcher = watch_shell(&terminal);
    terminal
        .open(None)
        .await
        .context("Failed to start shell session")?;
    info!("Session ready in {:?}", STARTUP_TIME.elapsed());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut pending = JoinSet::new();
    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        if let Some(command) = line.strip_prefix(EXEC_PREFIX) {
            let terminal = terminal.clone();
            let command = command.to_string();
            pending.spawn(async move {
                let result = terminal.exec(command).await;
                if let Err(e) = print_result(&result) {
                    warn!("{:#}", e);
                }
            });
            continue;
        }
        if let Err(e) = terminal.input(format!("{line}\r")).await {
            warn!("Input not delivered: {}", e);
        }
    }

    debug!("stdin closed, waiting for {} exec requests", pending.len());
    while pending.join_next().await.is_some() {}
    terminal.shutdown().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = *STARTUP_TIME;

    init_logging();

    let mode = parse_args(std::env::args().skip(1))?;
    if settings::ensure_config_file().is_none() {
        warn!("Could not create config file, using defaults");
    }
    let config = settings::load_config();
    let options = TerminalOptions::from_config(config);

    match mode {
        Mode::Exec(commands) => {
            let terminal =
                Terminal::spawn(options, Arc::new(NativePtySpawner), Arc::new(DiscardSink));
            if !run_exec(terminal, commands).await? {
                std::process::exit(1);
            }
        }
        Mode::Interactive => {
            let terminal =
                Terminal::spawn(options, Arc::new(NativePtySpawner), Arc::new(StdoutSink));
            run_interactive(terminal).await?;
        }
    }
    Ok(())
}
