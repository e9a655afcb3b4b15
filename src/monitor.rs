//! Dropped-event accounting and its periodic self-report

use crate::clock::ClockSource;
use crate::config::PipelineConfig;
use crate::dispatch::encode_event;
use crate::errors::Result;
use crate::event::{ConsentCategory, IncomingEvent, current_timestamp_ms};
use crate::headers::HeaderBuilder;
use crate::ids::IdGenerator;
use crate::transport::CollectorClient;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Name of the synthetic event carrying the counter snapshot
pub const MONITORING_EVENT_NAME: &str = "telemetry_monitoring";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DropReason {
    ConsentFiltered,
    ValidationFailed,
    StoringFailed,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::ConsentFiltered => "consentFilteredEvents",
            DropReason::ValidationFailed => "validationFailedEvents",
            DropReason::StoringFailed => "storingFailedEvents",
        }
    }
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event name to drop count, per reason
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DropCounters {
    #[serde(rename = "consentFilteredEvents")]
    pub consent_filtered: BTreeMap<String, u64>,
    #[serde(rename = "validationFailedEvents")]
    pub validation_failed: BTreeMap<String, u64>,
    #[serde(rename = "storingFailedEvents")]
    pub storing_failed: BTreeMap<String, u64>,
}

impl DropCounters {
    pub fn is_empty(&self) -> bool {
        self.consent_filtered.is_empty()
            && self.validation_failed.is_empty()
            && self.storing_failed.is_empty()
    }

    pub fn for_reason(&self, reason: DropReason) -> &BTreeMap<String, u64> {
        match reason {
            DropReason::ConsentFiltered => &self.consent_filtered,
            DropReason::ValidationFailed => &self.validation_failed,
            DropReason::StoringFailed => &self.storing_failed,
        }
    }

    fn for_reason_mut(&mut self, reason: DropReason) -> &mut BTreeMap<String, u64> {
        match reason {
            DropReason::ConsentFiltered => &mut self.consent_filtered,
            DropReason::ValidationFailed => &mut self.validation_failed,
            DropReason::StoringFailed => &mut self.storing_failed,
        }
    }

    pub fn count(&self, event_name: &str, reason: DropReason) -> u64 {
        self.for_reason(reason).get(event_name).copied().unwrap_or(0)
    }
}

#[derive(Debug, Default)]
pub struct DroppedEventMonitor {
    counters: RwLock<DropCounters>,
}

impl DroppedEventMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register_dropped_event(&self, event_name: &str, reason: DropReason) {
        let mut counters = self.counters.write().await;
        *counters
            .for_reason_mut(reason)
            .entry(event_name.to_string())
            .or_insert(0) += 1;
        debug!("Dropped {} ({})", event_name, reason);
    }

    pub async fn count(&self, event_name: &str, reason: DropReason) -> u64 {
        self.counters.read().await.count(event_name, reason)
    }

    pub async fn snapshot(&self) -> DropCounters {
        self.counters.read().await.clone()
    }

    pub async fn is_empty(&self) -> bool {
        self.counters.read().await.is_empty()
    }

    /// Swap the counters out for empty ones, unless there is nothing to take.
    async fn take_nonempty(&self) -> Option<DropCounters> {
        let mut counters = self.counters.write().await;
        if counters.is_empty() {
            return None;
        }
        Some(std::mem::take(&mut *counters))
    }
}

/// Sends the counter snapshot to the public collector endpoint.
///
/// Best effort: the snapshot is cleared whether or not the send works.
pub struct MonitoringReporter {
    monitor: Arc<DroppedEventMonitor>,
    client: CollectorClient,
    headers: HeaderBuilder,
    clock: Arc<dyn ClockSource>,
    ids: Arc<IdGenerator>,
}

impl MonitoringReporter {
    pub fn new(
        monitor: Arc<DroppedEventMonitor>,
        client: CollectorClient,
        headers: HeaderBuilder,
        clock: Arc<dyn ClockSource>,
        ids: Arc<IdGenerator>,
    ) -> Self {
        Self {
            monitor,
            client,
            headers,
            clock,
            ids,
        }
    }

    /// Returns whether a report was attempted.
    pub async fn send_monitoring_info(&self, config: &PipelineConfig) -> Result<bool> {
        let Some(snapshot) = self.monitor.take_nonempty().await else {
            debug!("No dropped events to report");
            return Ok(false);
        };

        let event = IncomingEvent::new(
            MONITORING_EVENT_NAME,
            ConsentCategory::Necessary,
            serde_json::to_value(&snapshot)?,
        );
        let ts = self.clock.now().unwrap_or_else(|_| current_timestamp_ms());
        let id = self.ids.next_id();
        let wire = encode_event(&self.headers, config, None, &event, id, ts)?;

        match self
            .client
            .send_batch(&config.public_endpoint, std::slice::from_ref(&wire), None)
            .await
        {
            Ok(response) if response.ok() => info!("Reported dropped-event counters"),
            Ok(response) => warn!(
                "Collector refused monitoring report with {}, counters discarded",
                response.status
            ),
            Err(e) => warn!("Failed to send monitoring report, counters discarded: {}", e),
        }

        Ok(true)
    }
}
