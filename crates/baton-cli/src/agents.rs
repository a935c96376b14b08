//! Simulated onboarding agents for `baton run`.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use baton_core::app::{Agent, AgentError};
use baton_core::domain::StageStart;
use serde_json::{Value, json};

/// Sleeps like a real agent would work, then adds its result to the payload.
pub struct SimulatedAgent {
    topic: String,
    delay: Duration,
    /// Failures still to report before succeeding.
    failures_left: AtomicU32,
}

impl SimulatedAgent {
    pub fn new(topic: impl Into<String>, delay: Duration) -> Self {
        Self {
            topic: topic.into(),
            delay,
            failures_left: AtomicU32::new(0),
        }
    }

    /// Fail the first `n` stage-starts.
    pub fn failing(mut self, n: u32) -> Self {
        self.failures_left = AtomicU32::new(n);
        self
    }

    fn take_failure(&self) -> bool {
        self.failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }

    fn result(&self, start: &StageStart) -> Value {
        match self.topic.as_str() {
            "conversation" => json!({ "intent": "open_account", "channel": "chat" }),
            "kyc" => json!({ "verified": true, "subject": start.subject_id.as_str() }),
            "advisor" => json!({ "recommendation": "starter_plan" }),
            "audit" => json!({ "approved": true }),
            _ => json!({ "ok": true }),
        }
    }
}

#[async_trait]
impl Agent for SimulatedAgent {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn handle(&self, start: &StageStart) -> Result<Value, AgentError> {
        tracing::info!(
            task_id = %start.task_id,
            stage = %start.stage,
            attempt = start.attempt,
            subject = %start.subject_id,
            "processing"
        );
        tokio::time::sleep(self.delay).await;

        if self.take_failure() {
            return Err(AgentError::new(format!(
                "{} rejected attempt {}",
                self.topic, start.attempt
            )));
        }

        let mut payload = match &start.payload {
            Value::Object(map) => Value::Object(map.clone()),
            _ => json!({}),
        };
        payload[self.topic.as_str()] = self.result(start);
        Ok(payload)
    }
}
