//! Stdin input
//!
//! Reads one event per line from the process's standard input. Only one
//! reader can own stdin, so this type is registered as not reloadable.
//!
//! The process stdin is read on a dedicated OS thread rather than tokio's
//! blocking pool. A read blocked on an open but idle stdin cannot be
//! cancelled, and the runtime waits for its blocking pool on shutdown.

use super::{Input, InputContext, PluginArgs};
use crate::pipeline::event::Event;
use anyhow::{Context, Result};
use std::io::{self, BufRead};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;
use tracing::debug;

const LINE_BUFFER: usize = 64;

enum LineSource {
    Process,
    Reader(Box<dyn AsyncBufRead + Send + Unpin>),
}

pub struct StdinInput {
    source: Option<LineSource>,
}

impl StdinInput {
    pub fn new() -> Self {
        Self {
            source: Some(LineSource::Process),
        }
    }

    /// Read lines from another source instead of the process stdin
    pub fn with_reader(reader: Box<dyn AsyncBufRead + Send + Unpin>) -> Self {
        Self {
            source: Some(LineSource::Reader(reader)),
        }
    }
}

impl Default for StdinInput {
    fn default() -> Self {
        Self::new()
    }
}

/// Feed lines of the process stdin into a channel from a detached thread
///
/// The thread exits at EOF, on a read error, or at the first line after the
/// receiver is gone.
fn spawn_stdin_thread() -> io::Result<mpsc::Receiver<io::Result<String>>> {
    let (tx, rx) = mpsc::channel(LINE_BUFFER);
    std::thread::Builder::new()
        .name("sluice-stdin".to_string())
        .spawn(move || {
            for line in io::stdin().lock().lines() {
                let failed = line.is_err();
                if tx.blocking_send(line).is_err() || failed {
                    break;
                }
            }
        })?;
    Ok(rx)
}

fn spawn_reader_task(
    reader: Box<dyn AsyncBufRead + Send + Unpin>,
) -> mpsc::Receiver<io::Result<String>> {
    let (tx, rx) = mpsc::channel(LINE_BUFFER);
    tokio::spawn(async move {
        let mut lines = reader.lines();
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => Ok(line),
                Ok(None) => break,
                Err(e) => Err(e),
            };
            let failed = line.is_err();
            if tx.send(line).await.is_err() || failed {
                break;
            }
        }
    });
    rx
}

#[async_trait::async_trait]
impl Input for StdinInput {
    async fn run(&mut self, mut ctx: InputContext) -> Result<()> {
        let mut lines = match self.source.take() {
            Some(LineSource::Process) => {
                spawn_stdin_thread().context("Failed to start stdin reader thread")?
            }
            Some(LineSource::Reader(reader)) => spawn_reader_task(reader),
            None => anyhow::bail!("stdin input can only run once"),
        };

        loop {
            let line = tokio::select! {
                _ = ctx.stopped() => break,
                line = lines.recv() => line,
            };

            let Some(line) = line else {
                debug!(pipeline = ctx.pipeline_id(), "stdin closed");
                break;
            };
            let line = line.context("Failed to read from stdin")?;

            let line = line.trim_end_matches('\r');
            if !ctx.push(Event::new(line)).await {
                break;
            }
        }

        Ok(())
    }
}

pub fn create_stdin_input(args: &PluginArgs) -> Result<Box<dyn Input>> {
    if let Some(name) = args.keys().next() {
        anyhow::bail!("stdin input takes no arguments, got '{}'", name);
    }
    Ok(Box::new(StdinInput::new()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;
    use tokio::sync::watch;

    #[tokio::test]
    async fn test_reads_lines_until_eof() {
        let data: &[u8] = b"first\r\nsecond\n";
        let mut input = StdinInput::with_reader(Box::new(BufReader::new(data)));
        let (tx, mut rx) = mpsc::channel(4);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        input
            .run(InputContext::new("main", tx, shutdown_rx))
            .await
            .unwrap();

        assert_eq!(rx.recv().await.unwrap().message, "first");
        assert_eq!(rx.recv().await.unwrap().message, "second");
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_stops_while_waiting_for_input() {
        let (_client, server) = tokio::io::duplex(64);
        let mut input = StdinInput::with_reader(Box::new(BufReader::new(server)));
        let (tx, _rx) = mpsc::channel(4);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            input.run(InputContext::new("main", tx, shutdown_rx)).await
        });
        shutdown_tx.send_replace(true);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_runs_only_once() {
        let data: &[u8] = b"";
        let mut input = StdinInput::with_reader(Box::new(BufReader::new(data)));
        let (tx, _rx) = mpsc::channel(4);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        input
            .run(InputContext::new("main", tx.clone(), shutdown_rx.clone()))
            .await
            .unwrap();
        assert!(input
            .run(InputContext::new("main", tx, shutdown_rx))
            .await
            .is_err());
    }

    #[test]
    fn test_rejects_arguments() {
        let mut args = PluginArgs::new();
        args.insert("codec".to_string(), serde_json::json!("line"));
        assert!(create_stdin_input(&args).is_err());
    }
}
