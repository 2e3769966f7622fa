//! Built-in outputs

use super::{parse_args, Output, PluginArgs};
use crate::pipeline::event::Event;
use anyhow::{Context, Result};
use serde::Deserialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Encoding used by the stdout output
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    /// `<timestamp> <message>`
    #[default]
    Line,
    /// One JSON document per line
    Json,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct StdoutConfig {
    #[serde(default)]
    codec: Codec,
}

/// Stdout output with line or JSON formatting
pub struct StdoutOutput {
    codec: Codec,
    writer: Box<dyn AsyncWrite + Send + Unpin>,
}

impl StdoutOutput {
    pub fn new(codec: Codec) -> Self {
        Self::with_writer(codec, Box::new(tokio::io::stdout()))
    }

    /// Create an output writing to an arbitrary async writer
    pub fn with_writer(codec: Codec, writer: Box<dyn AsyncWrite + Send + Unpin>) -> Self {
        Self { codec, writer }
    }

    fn format_event(&self, event: &Event) -> Result<String> {
        match self.codec {
            Codec::Line => Ok(format!(
                "{} {}",
                event.timestamp.format("%Y-%m-%dT%H:%M:%S%.3fZ"),
                event.message
            )),
            Codec::Json => event
                .to_json()
                .context("Failed to serialize event to JSON"),
        }
    }
}

#[async_trait::async_trait]
impl Output for StdoutOutput {
    async fn write(&mut self, event: &Event) -> Result<()> {
        let mut line = self.format_event(event)?;
        line.push('\n');
        self.writer
            .write_all(line.as_bytes())
            .await
            .context("Failed to write to stdout")
    }

    async fn flush(&mut self) -> Result<()> {
        self.writer
            .flush()
            .await
            .context("Failed to flush stdout")
    }

    async fn close(&mut self) -> Result<()> {
        self.flush().await
    }
}

/// Null output - discard every event
pub struct NullOutput;

#[async_trait::async_trait]
impl Output for NullOutput {
    async fn write(&mut self, _event: &Event) -> Result<()> {
        Ok(())
    }
}

pub fn create_stdout_output(args: &PluginArgs) -> Result<Box<dyn Output>> {
    let config: StdoutConfig = parse_args(args)?;
    Ok(Box::new(StdoutOutput::new(config.codec)))
}

pub fn create_null_output(_args: &PluginArgs) -> Result<Box<dyn Output>> {
    Ok(Box::new(NullOutput))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_format() {
        let output = StdoutOutput::new(Codec::Line);
        let formatted = output.format_event(&Event::new("test message")).unwrap();
        assert!(formatted.ends_with(" test message"));
        assert!(formatted.contains('T'));
    }

    #[test]
    fn test_json_format() {
        let output = StdoutOutput::new(Codec::Json);
        let event = Event::new("test message").with_field("env", "prod");
        let formatted = output.format_event(&event).unwrap();

        let json: serde_json::Value = serde_json::from_str(&formatted).unwrap();
        assert_eq!(json["message"], "test message");
        assert_eq!(json["fields"]["env"], "prod");
        assert!(json["@timestamp"].is_string());
    }

    #[tokio::test]
    async fn test_writes_one_line_per_event() {
        let (client, mut server) = tokio::io::duplex(1024);
        let mut output = StdoutOutput::with_writer(Codec::Json, Box::new(client));

        output.write(&Event::new("one")).await.unwrap();
        output.write(&Event::new("two")).await.unwrap();
        output.close().await.unwrap();
        drop(output);

        let mut written = String::new();
        tokio::io::AsyncReadExt::read_to_string(&mut server, &mut written)
            .await
            .unwrap();
        let lines: Vec<&str> = written.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[1].contains("\"two\""));
    }

    #[test]
    fn test_create_outputs() {
        let mut args = PluginArgs::new();
        args.insert("codec".to_string(), serde_json::json!("json"));
        assert!(create_stdout_output(&args).is_ok());

        args.insert("codec".to_string(), serde_json::json!("msgpack"));
        assert!(create_stdout_output(&args).is_err());

        assert!(create_null_output(&PluginArgs::new()).is_ok());
    }
}
