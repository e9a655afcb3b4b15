//! Batch submission and failure recovery
//!
//! One call drains the queue page by page (at most ten events per request)
//! until it is empty, a page makes no progress, or the collector fails.
//! The outage flag follows the outcome of the latest request only.

use crate::config::PipelineConfig;
use crate::credentials::CredentialsProvider;
use crate::errors::{PipelineError, Result};
use crate::event::WireEvent;
use crate::monitor::{DropReason, DroppedEventMonitor};
use crate::outage::OutageTracker;
use crate::queue::EventQueue;
use crate::response::{parse_batch_result, parse_error_response};
use crate::transport::{CollectorClient, CollectorResponse};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, instrument, warn};

/// What one `submit` call achieved
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubmitReport {
    /// Requests that got an answer
    pub pages: usize,
    pub sent: usize,
    pub delivered: usize,
    /// Sender-fault entries removed without delivery
    pub rejected: usize,
    /// Server-fault entries left queued for the next tick
    pub retained: usize,
    /// Duplicate entries dropped by id remediation
    pub deduplicated: usize,
}

struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct Submitter {
    queue: Arc<EventQueue>,
    monitor: Arc<DroppedEventMonitor>,
    outage: Arc<OutageTracker>,
    client: CollectorClient,
    in_flight: AtomicBool,
}

impl Submitter {
    pub fn new(
        queue: Arc<EventQueue>,
        monitor: Arc<DroppedEventMonitor>,
        outage: Arc<OutageTracker>,
        client: CollectorClient,
    ) -> Self {
        Self {
            queue,
            monitor,
            outage,
            client,
            in_flight: AtomicBool::new(false),
        }
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Drain the queue towards the collector.
    ///
    /// A call made while another is running returns an empty report at once.
    #[instrument(skip_all)]
    pub async fn submit(
        &self,
        config: &PipelineConfig,
        credentials: Option<&dyn CredentialsProvider>,
    ) -> Result<SubmitReport> {
        if self.in_flight.swap(true, Ordering::AcqRel) {
            debug!("Submission already in flight, skipping");
            return Ok(SubmitReport::default());
        }
        let _in_flight = InFlight(&self.in_flight);

        let mut report = SubmitReport::default();

        loop {
            let batch = self.queue.get_batch().await;
            if batch.is_empty() {
                break;
            }

            let provider = credentials.ok_or(PipelineError::MissingCredentialsProvider)?;
            let creds = provider.get_credentials().await?;

            let (endpoint, token) = match creds.token.as_deref() {
                Some(token) => (config.authenticated_endpoint.as_str(), Some(token)),
                None => (config.public_endpoint.as_str(), None),
            };

            let response = match self.client.send_batch(endpoint, &batch, token).await {
                Ok(response) => response,
                Err(e) => {
                    self.outage.set_outage(true);
                    return Err(e);
                }
            };

            report.pages += 1;
            report.sent += batch.len();

            if !response.ok() {
                self.outage.set_outage(true);
                report.deduplicated += self.recover_from_rejection(&response).await?;
                break;
            }

            self.outage.set_outage(false);

            let removed = self.apply_batch_result(&batch, &response, &mut report).await?;
            if removed == 0 || self.queue.is_empty().await {
                break;
            }
        }

        if report.pages > 0 {
            info!(
                "Submitted {} events in {} requests: {} delivered, {} rejected, {} retained",
                report.sent, report.pages, report.delivered, report.rejected, report.retained
            );
        }

        Ok(report)
    }

    /// Remove delivered and sender-faulted entries. Returns how many left the queue.
    async fn apply_batch_result(
        &self,
        batch: &[WireEvent],
        response: &CollectorResponse,
        report: &mut SubmitReport,
    ) -> Result<usize> {
        let result = match parse_batch_result(&response.body) {
            Ok(result) => result,
            Err(e) => {
                warn!("Unreadable collector reply, keeping batch queued: {}", e);
                return Ok(0);
            }
        };

        let names: HashMap<&str, &str> = batch
            .iter()
            .map(|e| (e.id.as_str(), e.name.as_str()))
            .collect();
        let mut to_remove = Vec::new();

        for id in result.successful {
            if names.contains_key(id.as_str()) {
                report.delivered += 1;
                to_remove.push(id);
            }
        }

        for entry in result.failed {
            let Some(name) = names.get(entry.id.as_str()) else {
                continue;
            };

            if entry.sender_fault {
                warn!("Collector rejected event {} ({}): {}", entry.id, name, entry.code);
                self.monitor
                    .register_dropped_event(name, DropReason::ValidationFailed)
                    .await;
                report.rejected += 1;
                to_remove.push(entry.id);
            } else {
                debug!("Server fault for event {} ({}), will retry", entry.id, entry.code);
                report.retained += 1;
            }
        }

        self.queue.remove_by_ids(&to_remove).await
    }

    /// Inspect a failed request; repair the queue when the failure is a
    /// duplicate-id batch. Returns how many duplicates were dropped.
    async fn recover_from_rejection(&self, response: &CollectorResponse) -> Result<usize> {
        let error = match parse_error_response(&response.body) {
            Ok(error) => error,
            Err(_) => {
                warn!("Collector failed with {}, batch will be retried", response.status);
                return Ok(0);
            }
        };

        if !error.is_duplicate_ids() {
            warn!(
                "Collector failed with {} ({} {}), batch will be retried",
                response.status, error.error_type, error.code
            );
            return Ok(0);
        }

        let dropped = self.queue.deduplicate().await?;
        info!("Batch had repeated ids, dropped {} duplicate events", dropped);
        Ok(dropped)
    }
}
