use event_bus::{ConsumerSetup, StreamSetup};
use event_consumer::ConsumerConfig;
use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: String, value: String },
}

/// Which transport the worker runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusType {
    InMemory,
    Nats,
}

/// Worker configuration parsed from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub bus_type: BusType,
    pub nats_url: String,
    pub events_stream: String,
    pub events_subject_prefix: String,
    pub dlq_stream: String,
    pub dlq_subject_prefix: String,
    pub consumer_name: String,
    pub poll_wait: Duration,
    pub empty_poll_backoff: Duration,
    pub queue_error_backoff: Duration,
    pub visibility_timeout: Duration,
    pub max_deliveries: u32,
    /// Without a database the worker keeps its ledger and audit log in memory
    pub database_url: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key lookup; `from_env` passes the process environment
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let bus_type = match text("BUS_TYPE", "inmemory").to_lowercase().as_str() {
            "inmemory" => BusType::InMemory,
            "nats" => BusType::Nats,
            other => return Err(invalid("BUS_TYPE", other)),
        };

        let max_deliveries: u32 = parse(&lookup, "MAX_DELIVERIES", 5)?;
        if max_deliveries == 0 {
            return Err(invalid("MAX_DELIVERIES", "0"));
        }

        Ok(Config {
            bus_type,
            nats_url: text("NATS_URL", "nats://localhost:4222"),
            events_stream: text("EVENTS_STREAM", "CRM_EVENTS"),
            events_subject_prefix: text("EVENTS_SUBJECT_PREFIX", "crm.events"),
            dlq_stream: text("DLQ_STREAM", "CRM_DLQ"),
            dlq_subject_prefix: text("DLQ_SUBJECT_PREFIX", "crm.dlq"),
            consumer_name: text("CONSUMER_NAME", "lead-worker"),
            poll_wait: Duration::from_secs(parse(&lookup, "POLL_WAIT_SECS", 20)?),
            empty_poll_backoff: Duration::from_millis(parse(&lookup, "EMPTY_POLL_BACKOFF_MS", 1000)?),
            queue_error_backoff: Duration::from_millis(parse(
                &lookup,
                "QUEUE_ERROR_BACKOFF_MS",
                5000,
            )?),
            visibility_timeout: Duration::from_secs(parse(&lookup, "VISIBILITY_TIMEOUT_SECS", 30)?),
            max_deliveries,
            database_url: lookup("DATABASE_URL").filter(|url| !url.is_empty()),
        })
    }

    pub fn stream_setup(&self) -> StreamSetup {
        StreamSetup {
            stream_name: self.events_stream.clone(),
            subject_prefix: self.events_subject_prefix.clone(),
            dead_letter_stream: self.dlq_stream.clone(),
            dead_letter_prefix: self.dlq_subject_prefix.clone(),
            ..StreamSetup::default()
        }
    }

    pub fn consumer_setup(&self, event_types: Vec<String>) -> ConsumerSetup {
        ConsumerSetup {
            consumer_name: self.consumer_name.clone(),
            event_types,
            visibility_timeout: self.visibility_timeout,
            max_deliveries: self.max_deliveries,
        }
    }

    pub fn consumer_config(&self) -> ConsumerConfig {
        ConsumerConfig {
            wait: self.poll_wait,
            empty_poll_backoff: self.empty_poll_backoff,
            queue_error_backoff: self.queue_error_backoff,
            max_deliveries: self.max_deliveries,
            ..ConsumerConfig::default()
        }
    }
}

fn invalid(key: &str, value: &str) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        value: value.to_string(),
    }
}

fn parse<T, F>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| invalid(key, &raw)),
    }
}
