//! Anonymous usage events.
//!
//! Reporting never blocks or fails the caller: events are handed to a
//! spawned task and any error is logged at debug level and dropped.

use std::{sync::Arc, time::Duration};

use serde::Serialize;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageEvent {
    pub category: String,
    pub action: String,
    pub label: String,
}

impl UsageEvent {
    pub fn new(category: &str, action: &str, label: &str) -> Self {
        Self {
            category: category.to_string(),
            action: action.to_string(),
            label: label.to_string(),
        }
    }
}

impl std::fmt::Display for UsageEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.category, self.action, self.label)
    }
}

pub trait UsageReporter: Send + Sync {
    /// Fire and forget.
    fn report(&self, event: UsageEvent);
}

/// Logs events instead of sending them anywhere.
#[derive(Debug, Default)]
pub struct TracingUsageReporter;

impl UsageReporter for TracingUsageReporter {
    fn report(&self, event: UsageEvent) {
        debug!(event = %event, "usage event");
    }
}

/// Posts events as JSON to an HTTP endpoint.
pub struct HttpUsageReporter {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpUsageReporter {
    pub fn new(endpoint: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

impl UsageReporter for HttpUsageReporter {
    fn report(&self, event: UsageEvent) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!(event = %event, "no runtime, dropping usage event");
            return;
        };
        let request = self.client.post(&self.endpoint).json(&event);
        handle.spawn(async move {
            match request.send().await.and_then(|r| r.error_for_status()) {
                Ok(_) => debug!(event = %event, "usage event sent"),
                Err(e) => debug!(event = %event, error = %e, "failed to send usage event"),
            }
        });
    }
}

/// Pick the reporter for a configured endpoint.
pub fn reporter_for(endpoint: Option<&str>) -> Arc<dyn UsageReporter> {
    match endpoint.map(HttpUsageReporter::new) {
        Some(Ok(reporter)) => Arc::new(reporter),
        Some(Err(e)) => {
            debug!(error = %e, "usage reporter unavailable, logging events only");
            Arc::new(TracingUsageReporter)
        }
        None => Arc::new(TracingUsageReporter),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_display() {
        let event = UsageEvent::new("imageRepo", "resolve", "MirrorRegistry");
        assert_eq!(event.to_string(), "imageRepo/resolve/MirrorRegistry");
    }

    #[test]
    fn test_http_reporter_without_runtime_does_not_panic() {
        let reporter = HttpUsageReporter::new("http://127.0.0.1:9/usage").unwrap();
        reporter.report(UsageEvent::new("a", "b", "c"));
    }

    #[tokio::test]
    async fn test_http_reporter_swallows_errors() {
        let reporter = HttpUsageReporter::new("http://127.0.0.1:9/usage").unwrap();
        reporter.report(UsageEvent::new("a", "b", "c"));
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
