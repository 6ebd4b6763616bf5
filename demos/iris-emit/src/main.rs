//! `iris-emit` is an illustrative external collaborator: it is not part of the container core,
//! but it defines the wire expectation other tooling relies on by building an
//! [`iris_events::Event`] and writing it onto a running container's connection exactly as
//! `iris_events::CoordinatorEvents::emit` relays one between nodes.
use std::process::ExitCode;

use clap::Parser;
use iris_events::Event;
use iris_message::Message;
use iris_message::MessageCodec;
use iris_message::MessageKind;
use serde_json::Value;
use slog::Drain;
use tokio::net::TcpStream;
use tokio_util::codec::FramedWrite;

/// Publish an event onto a running Iris container's connection.
///
/// Exits non-zero if `body` is not valid JSON or the connection/send fails.
#[derive(Debug, Parser)]
#[command(name = "iris-emit", version)]
struct Args {
    /// Event type, e.g. `cluster.up`.
    event_type: String,

    /// JSON event body. Defaults to `null` when omitted.
    body: Option<String>,

    /// Container endpoint to connect to, e.g. `tcp://127.0.0.1:35536`.
    ///
    /// Falls back to the `IRIS_NODE` environment variable (the same hint the container itself
    /// reads to discover its own bind address) when omitted.
    #[arg(long)]
    endpoint: Option<String>,

    /// Pin the emitted trace id instead of generating a fresh one.
    #[arg(long = "trace-id")]
    trace_id: Option<String>,
}

fn init_logger() -> slog::Logger {
    let drain = slog_json::Json::new(std::io::stderr())
        .add_default_keys()
        .build()
        .fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    iris_trace::decorate(slog::Logger::root(drain, slog::o!("tool" => "iris-emit")))
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let logger = init_logger();

    let endpoint = match args.endpoint.clone().or_else(|| std::env::var("IRIS_NODE").ok()) {
        Some(endpoint) => endpoint,
        None => {
            slog::error!(logger, "no --endpoint given and IRIS_NODE is unset");
            return ExitCode::FAILURE;
        }
    };

    let body: Value = match args.body.as_deref() {
        Some(raw) => match serde_json::from_str(raw) {
            Ok(value) => value,
            Err(error) => {
                slog::error!(logger, "invalid JSON event body"; "error" => error.to_string());
                return ExitCode::FAILURE;
            }
        },
        None => Value::Null,
    };

    let outcome = iris_trace::context(args.trace_id.clone(), async {
        emit(&endpoint, &args.event_type, body).await
    })
    .await;

    match outcome {
        Ok(()) => {
            slog::info!(logger, "event emitted"; "event_type" => &args.event_type, "endpoint" => &endpoint);
            ExitCode::SUCCESS
        }
        Err(error) => {
            slog::error!(logger, "failed to emit event"; "error" => error.to_string());
            ExitCode::FAILURE
        }
    }
}

async fn emit(endpoint: &str, event_type: &str, body: Value) -> anyhow::Result<()> {
    use futures::SinkExt;

    let event = Event::new(event_type, endpoint, body);
    let message = Message {
        id: uuid::Uuid::new_v4().to_string(),
        kind: MessageKind::Ack,
        subject: iris_events::event_subject(event_type),
        source: endpoint.to_string(),
        headers: iris_trace::headers(),
        body: serde_json::to_value(&event)?,
    };

    let address = endpoint
        .strip_prefix("tcp://")
        .ok_or_else(|| anyhow::anyhow!("endpoint must be a tcp:// address: {endpoint}"))?;
    let stream = TcpStream::connect(address).await?;
    let mut writer = FramedWrite::new(stream, MessageCodec::default());
    writer.send(message).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_parse_with_defaults() {
        let args = Args::parse_from([
            "iris-emit",
            "cluster.up",
            "--endpoint",
            "tcp://127.0.0.1:35536",
        ]);
        assert_eq!(args.event_type, "cluster.up");
        assert!(args.body.is_none());
        assert!(args.trace_id.is_none());
    }

    #[test]
    fn args_parse_with_body_and_trace_id() {
        let args = Args::parse_from([
            "iris-emit",
            "cluster.up",
            r#"{"id":1}"#,
            "--endpoint",
            "tcp://127.0.0.1:35536",
            "--trace-id",
            "abc123",
        ]);
        assert_eq!(args.body.as_deref(), Some(r#"{"id":1}"#));
        assert_eq!(args.trace_id.as_deref(), Some("abc123"));
    }
}
