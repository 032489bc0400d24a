// Path: crates/cli/src/util.rs
//! Shared CLI plumbing: the control-channel client and output rendering.

use anyhow::{Context, Result};
use clap::ValueEnum;
use herd_transport::tcp::TcpRequestClient;
use herd_transport::RequestClient;
use herd_types::config::MasterConfig;
use herd_types::envelope::Envelope;
use herd_types::wire::{ControlReply, ControlRequest};
use serde_json::Value;
use std::time::Duration;

/// Output renderings for `publish` and `run`.
#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum OutputFormat {
    /// Pretty-printed JSON.
    Json,
    /// YAML.
    Yaml,
    /// Plain text.
    Text,
}

/// Renders one value in the selected format.
pub fn render(value: &Value, format: OutputFormat) -> String {
    match format {
        OutputFormat::Json => {
            serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
        }
        OutputFormat::Yaml => serde_yaml::to_string(value).unwrap_or_else(|_| value.to_string()),
        OutputFormat::Text => render_text(value, 0),
    }
}

fn render_text(value: &Value, indent: usize) -> String {
    let pad = " ".repeat(indent);
    match value {
        Value::Object(map) => {
            let mut out = String::new();
            for (key, value) in map {
                match value {
                    Value::Object(_) | Value::Array(_) => {
                        out.push_str(&format!("{}{}:\n{}", pad, key, render_text(value, indent + 4)));
                    }
                    other => out.push_str(&format!("{}{}: {}\n", pad, key, scalar(other))),
                }
            }
            out
        }
        Value::Array(items) => {
            let mut out = String::new();
            for item in items {
                out.push_str(&format!("{}- {}\n", pad, scalar(item)));
            }
            out
        }
        other => format!("{}{}\n", pad, scalar(other)),
    }
}

fn scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Sends one request to the local master's control channel.
pub async fn control_request(config: &MasterConfig, req: &ControlRequest) -> Result<ControlReply> {
    let client = TcpRequestClient::new(
        format!("127.0.0.1:{}", config.control_port),
        None,
        config.max_frame_size,
        Duration::from_secs(config.request_timeout_secs),
    );
    let reply = client
        .request(Envelope::clear(req)?)
        .await
        .context("control channel unreachable; is the master daemon running?")?;
    Ok(reply.open_clear()?)
}

/// Parses a CLI argument: JSON when it parses, bare string otherwise.
pub fn parse_arg(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// The requesting user for the audit trail.
pub fn current_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_arg() {
        assert_eq!(parse_arg("hello"), json!("hello"));
        assert_eq!(parse_arg("42"), json!(42));
        assert_eq!(parse_arg("{\"a\": 1}"), json!({"a": 1}));
        assert_eq!(parse_arg("true"), json!(true));
    }

    #[test]
    fn test_text_rendering() {
        let value = json!({"m1": {"retcode": 0, "return": "pong"}});
        let out = render(&value, OutputFormat::Text);
        assert!(out.contains("m1:"));
        assert!(out.contains("return: pong"));
    }
}
