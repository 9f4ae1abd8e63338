//! Publish a `Lead.New` event to the configured NATS stream
//!
//! # Usage
//! ```bash
//! BUS_TYPE=nats cargo run -p lead-worker --bin send_test_event -- \
//!   --name "Ada Lovelace" --email ada@example.com \
//!   [--phone +4420...] [--source website] [--workspace test-workspace]
//! ```
//!
//! Transport failures are retried with exponential backoff; validation and
//! size errors are not.

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use event_bus::retry::{retry_with_backoff_if, RetryConfig};
use event_bus::{ensure_streams, EventPublisher, JetStreamTopic, PublishError};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use lead_worker::config::Config;
use lead_worker::models::{LeadCreatedPayload, LEAD_NEW};

#[derive(Parser, Debug)]
#[command(name = "send_test_event", about = "Publish a Lead.New test event to NATS")]
struct Args {
    /// Lead name
    #[arg(long)]
    name: String,

    /// Lead email address
    #[arg(long)]
    email: String,

    #[arg(long)]
    phone: Option<String>,

    /// Where the lead came from (e.g. website)
    #[arg(long)]
    source: Option<String>,

    /// Workspace the event belongs to
    #[arg(long, default_value = "test-workspace")]
    workspace: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();

    let config = Config::from_env().context("Failed to load configuration from environment")?;

    let client = async_nats::connect(&config.nats_url)
        .await
        .with_context(|| format!("Failed to connect to NATS at {}", config.nats_url))?;

    let setup = config.stream_setup();
    ensure_streams(client.clone(), &setup).await?;

    let publisher = EventPublisher::new(Arc::new(JetStreamTopic::new(client, setup)), "dev-tools");

    let lead = LeadCreatedPayload {
        id: Uuid::new_v4().to_string(),
        name: args.name,
        email: args.email,
        phone: args.phone,
        status: "new".to_string(),
        source: args.source,
        created_at: Some(Utc::now()),
        workspace_id: None,
    };
    let payload = serde_json::to_value(&lead).context("Failed to serialize lead")?;

    // Every attempt resends this envelope so a retried publish keeps its event_id
    let envelope = publisher.build_envelope(LEAD_NEW, payload, &args.workspace);
    let event_id = envelope.event_id;

    retry_with_backoff_if(
        || publisher.publish_envelope(&envelope),
        &RetryConfig::default(),
        "send_test_event",
        PublishError::is_retryable,
    )
    .await
    .context("Failed to publish test event")?;

    tracing::info!(
        event_id = %event_id,
        lead_id = %lead.id,
        workspace_id = %args.workspace,
        "Published Lead.New test event"
    );
    println!("{event_id}");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_default_workspace() {
        let args =
            Args::try_parse_from(["send_test_event", "--name", "Ada", "--email", "ada@x.com"])
                .unwrap();

        assert_eq!(args.name, "Ada");
        assert_eq!(args.email, "ada@x.com");
        assert_eq!(args.workspace, "test-workspace");
        assert!(args.phone.is_none());
    }

    #[test]
    fn test_args_require_email() {
        assert!(Args::try_parse_from(["send_test_event", "--name", "Ada"]).is_err());
    }

    #[test]
    fn test_args_help_is_available() {
        let err = Args::try_parse_from(["send_test_event", "--help"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayHelp);
    }
}
