use prometheus::{IntCounterVec, Opts, Registry};

/// Consumer loop counters
#[derive(Clone)]
pub struct ConsumerMetrics {
    /// result: messages|empty|error
    pub polls_total: IntCounterVec,
    /// outcome: deleted|skipped|left_for_redelivery|delete_failed
    pub messages_total: IntCounterVec,
}

impl ConsumerMetrics {
    /// Create the counters and register them into `registry`
    pub fn new(registry: &Registry) -> prometheus::Result<Self> {
        let polls_total = IntCounterVec::new(
            Opts::new("event_consumer_polls_total", "Queue polls by result"),
            &["result"],
        )?;

        let messages_total = IntCounterVec::new(
            Opts::new(
                "event_consumer_messages_total",
                "Processed queue messages by event type and outcome",
            ),
            &["event_type", "outcome"],
        )?;

        registry.register(Box::new(polls_total.clone()))?;
        registry.register(Box::new(messages_total.clone()))?;

        Ok(Self {
            polls_total,
            messages_total,
        })
    }

    pub fn record_poll(&self, result: &str) {
        self.polls_total.with_label_values(&[result]).inc();
    }

    pub fn record_message(&self, event_type: &str, outcome: &str) {
        self.messages_total
            .with_label_values(&[event_type, outcome])
            .inc();
    }
}
