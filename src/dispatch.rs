//! Dispatch facade: consent filter, envelope, validation, enqueue
//!
//! Nothing on this path touches the network; submission happens on the
//! scheduler's batch tick.

use crate::clock::ClockSource;
use crate::config::{PipelineConfig, SharedConfig};
use crate::credentials::{Credentials, CredentialsProvider};
use crate::errors::{PipelineError, Result};
use crate::event::{IncomingEvent, PayloadRecord, WireEvent};
use crate::headers::HeaderBuilder;
use crate::ids::IdGenerator;
use crate::monitor::{DropReason, DroppedEventMonitor};
use crate::queue::{AppendOutcome, EventQueue};
use crate::validator;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Accepted and queued under this id
    Queued(String),
    ConsentFiltered,
    /// Too large or not well-formed text
    Invalid,
    QueueFull,
    DuplicateId,
}

/// Build the queued form of an event.
pub(crate) fn encode_event(
    headers: &HeaderBuilder,
    config: &PipelineConfig,
    credentials: Option<&Credentials>,
    event: &IncomingEvent,
    id: String,
    ts: i64,
) -> Result<WireEvent> {
    let payload = serde_json::to_string(&PayloadRecord::from_event(event, ts, &id))?;
    let headers = headers.build(config, credentials, event);
    Ok(WireEvent::new(id, event.name.clone(), headers, payload))
}

fn check_strict(event: &IncomingEvent) -> Result<()> {
    if event.name.trim().is_empty() {
        return Err(PipelineError::InvalidEvent("event name is empty".to_string()));
    }
    if event.payload.is_null() {
        return Err(PipelineError::InvalidEvent(format!(
            "event {} has no payload",
            event.name
        )));
    }
    Ok(())
}

pub struct Dispatcher {
    config: SharedConfig,
    ids: Arc<IdGenerator>,
    clock: Arc<dyn ClockSource>,
    headers: HeaderBuilder,
    queue: Arc<EventQueue>,
    monitor: Arc<DroppedEventMonitor>,
}

impl Dispatcher {
    pub fn new(
        config: SharedConfig,
        ids: Arc<IdGenerator>,
        clock: Arc<dyn ClockSource>,
        headers: HeaderBuilder,
        queue: Arc<EventQueue>,
        monitor: Arc<DroppedEventMonitor>,
    ) -> Self {
        Self {
            config,
            ids,
            clock,
            headers,
            queue,
            monitor,
        }
    }

    /// Accept one event into the pipeline.
    ///
    /// Drops are reported through the outcome, not as errors. Errors are
    /// reserved for strict-mode violations and an unusable clock.
    pub async fn dispatch(
        &self,
        credentials: Option<&dyn CredentialsProvider>,
        event: IncomingEvent,
    ) -> Result<DispatchOutcome> {
        let config = self.config.read().await.clone();

        if config.strict_mode {
            check_strict(&event)?;
        }

        if config.blocked_consent_categories.is_blocked(event.consent_category) {
            self.monitor
                .register_dropped_event(&event.name, DropReason::ConsentFiltered)
                .await;
            return Ok(DispatchOutcome::ConsentFiltered);
        }

        let credentials = match credentials {
            Some(provider) => match provider.get_credentials().await {
                Ok(credentials) => Some(credentials),
                Err(e) => {
                    warn!("Credentials unavailable, sending {} without them: {}", event.name, e);
                    None
                }
            },
            None => None,
        };

        let ts = self.clock.now()?;
        let id = self.ids.next_id();
        let wire = encode_event(&self.headers, &config, credentials.as_ref(), &event, id, ts)?;

        if let Err(rejection) = validator::check(&wire) {
            debug!("Dropping invalid event {}: {:?}", wire.name, rejection);
            if config.strict_mode {
                self.monitor
                    .register_dropped_event(&wire.name, DropReason::ValidationFailed)
                    .await;
            }
            return Ok(DispatchOutcome::Invalid);
        }

        let name = wire.name.clone();
        let id = wire.id.clone();

        match self.queue.append(wire).await {
            AppendOutcome::Queued => Ok(DispatchOutcome::Queued(id)),
            AppendOutcome::Full => {
                self.monitor
                    .register_dropped_event(&name, DropReason::StoringFailed)
                    .await;
                Ok(DispatchOutcome::QueueFull)
            }
            AppendOutcome::Duplicate => {
                self.monitor
                    .register_dropped_event(&name, DropReason::StoringFailed)
                    .await;
                Ok(DispatchOutcome::DuplicateId)
            }
        }
    }
}
