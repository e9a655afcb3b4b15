//! Public entry point wiring the pipeline together

use crate::bus::{BusMessage, NotificationBus};
use crate::clock::{ClockSource, SyncedClock};
use crate::config::{PipelineConfig, SharedConfig};
use crate::credentials::CredentialsProvider;
use crate::dispatch::{DispatchOutcome, Dispatcher};
use crate::errors::{PipelineError, Result};
use crate::event::{ConsentCategory, IncomingEvent};
use crate::headers::HeaderBuilder;
use crate::ids::IdGenerator;
use crate::monitor::{DropCounters, DropReason, DroppedEventMonitor, MonitoringReporter};
use crate::outage::OutageTracker;
use crate::queue::{EventQueue, PersistPolicy};
use crate::scheduler::{ScheduledJobs, Scheduler};
use crate::store::KeyValueStore;
use crate::submit::{SubmitReport, Submitter};
use crate::transport::CollectorClient;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, broadcast};
use tracing::{info, instrument, warn};

type ProviderSlot = Arc<RwLock<Option<Arc<dyn CredentialsProvider>>>>;

/// What the timers run. Reads the live configuration on every tick.
struct PipelineJobs {
    config: SharedConfig,
    credentials: ProviderSlot,
    submitter: Submitter,
    reporter: MonitoringReporter,
}

impl PipelineJobs {
    async fn submit(&self) -> Result<SubmitReport> {
        let config = self.config.read().await.clone();
        let provider = self.credentials.read().await.clone();
        self.submitter.submit(&config, provider.as_deref()).await
    }

    async fn report(&self) -> Result<bool> {
        let config = self.config.read().await.clone();
        self.reporter.send_monitoring_info(&config).await
    }
}

#[async_trait]
impl ScheduledJobs for PipelineJobs {
    #[instrument(skip(self))]
    async fn run_batch(&self) -> Result<()> {
        self.submit().await.map(|_| ())
    }

    #[instrument(skip(self))]
    async fn run_monitoring(&self) -> Result<()> {
        self.report().await.map(|_| ())
    }
}

/// Consent-aware event delivery client.
///
/// `send` only queues; delivery happens on the batch timer or on `flush`.
pub struct TelemetryClient {
    config: SharedConfig,
    bus: NotificationBus,
    outage: Arc<OutageTracker>,
    queue: Arc<EventQueue>,
    monitor: Arc<DroppedEventMonitor>,
    dispatcher: Dispatcher,
    jobs: Arc<PipelineJobs>,
    scheduler: Scheduler,
}

impl TelemetryClient {
    /// Start the pipeline with a clock synchronized against
    /// `config.time_authority_url`. An unreachable authority is logged and
    /// the local clock is used instead.
    pub async fn initialize(config: PipelineConfig, store: Arc<dyn KeyValueStore>) -> Result<Self> {
        config.validate().map_err(PipelineError::Config)?;

        let clock = SyncedClock::new(config.time_authority_url.clone(), config.http_timeout)?;
        if let Err(e) = clock.synchronize().await {
            warn!("Clock synchronization failed, using local time: {}", e);
            clock.assume_local();
        }

        Self::build(config, store, Arc::new(clock)).await
    }

    /// Start the pipeline with a caller-supplied clock. Synchronization
    /// failures are returned.
    pub async fn initialize_with_clock(
        config: PipelineConfig,
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn ClockSource>,
    ) -> Result<Self> {
        config.validate().map_err(PipelineError::Config)?;
        clock.synchronize().await?;
        Self::build(config, store, clock).await
    }

    async fn build(
        config: PipelineConfig,
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn ClockSource>,
    ) -> Result<Self> {
        let policy = PersistPolicy {
            retries: config.persist_retries,
            backoff_ms: config.persist_retry_backoff_ms,
        };
        let queue = Arc::new(EventQueue::spawn(store, config.max_queue_len, policy));
        let monitor = Arc::new(DroppedEventMonitor::new());

        let recovered = queue.initialize().await?;
        for name in &recovered.discarded {
            monitor
                .register_dropped_event(name, DropReason::StoringFailed)
                .await;
        }

        let transport = CollectorClient::new(config.http_timeout)?;
        let bus = NotificationBus::new();
        let outage = Arc::new(OutageTracker::new(bus.clone()));
        let ids = Arc::new(IdGenerator::new());
        let headers = HeaderBuilder::default();

        let batch_interval = config.batch_interval;
        let monitoring_interval = config.monitoring_interval;
        let config = config.into_shared();

        let dispatcher = Dispatcher::new(
            config.clone(),
            ids.clone(),
            clock.clone(),
            headers.clone(),
            queue.clone(),
            monitor.clone(),
        );

        let jobs = Arc::new(PipelineJobs {
            config: config.clone(),
            credentials: Arc::new(RwLock::new(None)),
            submitter: Submitter::new(
                queue.clone(),
                monitor.clone(),
                outage.clone(),
                transport.clone(),
            ),
            reporter: MonitoringReporter::new(monitor.clone(), transport, headers, clock, ids),
        });

        let scheduler = Scheduler::new();
        let timer_jobs: Arc<dyn ScheduledJobs> = jobs.clone();
        scheduler.init(timer_jobs, batch_interval, monitoring_interval)?;

        info!("Telemetry client ready with {} queued events", queue.len().await);

        Ok(Self {
            config,
            bus,
            outage,
            queue,
            monitor,
            dispatcher,
            jobs,
            scheduler,
        })
    }

    /// Queue one event. Consent and validation drops are reported in the
    /// outcome, never as errors.
    pub async fn send(&self, event: IncomingEvent) -> Result<DispatchOutcome> {
        let provider = self.jobs.credentials.read().await.clone();
        self.dispatcher.dispatch(provider.as_deref(), event).await
    }

    pub async fn set_consent_blocked(&self, category: ConsentCategory, blocked: bool) {
        self.config
            .write()
            .await
            .blocked_consent_categories
            .set_blocked(category, blocked);
        info!("Consent for {} {}", category, if blocked { "blocked" } else { "allowed" });
    }

    pub async fn set_credentials_provider(&self, provider: Arc<dyn CredentialsProvider>) {
        *self.jobs.credentials.write().await = Some(provider);
        self.bus.publish(BusMessage::CredentialsChanged);
    }

    /// Announce that the credentials behind the current provider changed.
    pub fn notify_credentials_changed(&self) {
        self.bus.publish(BusMessage::CredentialsChanged);
    }

    /// Submit now instead of waiting for the batch timer.
    pub async fn flush(&self) -> Result<SubmitReport> {
        self.jobs.submit().await
    }

    /// Send the dropped-event report now. Returns whether there was one.
    pub async fn send_monitoring_info(&self) -> Result<bool> {
        self.jobs.report().await
    }

    /// Change both timer periods; the timers restart.
    pub async fn set_intervals(&self, batch: Duration, monitoring: Duration) -> Result<()> {
        let timer_jobs: Arc<dyn ScheduledJobs> = self.jobs.clone();
        self.scheduler.init(timer_jobs, batch, monitoring)?;

        let mut config = self.config.write().await;
        config.batch_interval = batch;
        config.monitoring_interval = monitoring;
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusMessage> {
        self.bus.subscribe()
    }

    pub fn bus(&self) -> &NotificationBus {
        &self.bus
    }

    pub fn is_outage(&self) -> bool {
        self.outage.is_outage()
    }

    pub async fn queued_events(&self) -> usize {
        self.queue.len().await
    }

    pub async fn dropped_events(&self) -> DropCounters {
        self.monitor.snapshot().await
    }

    pub async fn config(&self) -> PipelineConfig {
        self.config.read().await.clone()
    }

    /// Stop the timers, try one last submission and make sure whatever is
    /// left is on disk.
    pub async fn shutdown(&self) -> Result<()> {
        self.scheduler.stop();

        if self.jobs.credentials.read().await.is_some() && !self.queue.is_empty().await {
            match self.flush().await {
                Ok(report) => info!("Final flush delivered {} events", report.delivered),
                Err(e) => warn!("Final flush failed, events stay queued: {}", e),
            }
        }

        self.queue.checkpoint().await?;
        info!("Telemetry client stopped with {} queued events", self.queue.len().await);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::credentials::{Credentials, StaticCredentials};
    use crate::event::{HeaderMap, WireEvent};
    use crate::queue::STORE_KEY;
    use crate::store::{FileStore, MemoryStore};
    use serde_json::json;
    use tempfile::TempDir;
    use tokio_test::assert_ok;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config_for(server: &MockServer) -> PipelineConfig {
        PipelineConfig {
            public_endpoint: format!("{}/public", server.uri()),
            authenticated_endpoint: format!("{}/private", server.uri()),
            strict_mode: false,
            ..PipelineConfig::default()
        }
    }

    async fn start(config: PipelineConfig, store: Arc<dyn KeyValueStore>) -> TelemetryClient {
        TelemetryClient::initialize_with_clock(config, store, Arc::new(FixedClock::new(1_700_000_000_000)))
            .await
            .unwrap()
    }

    fn provider() -> Arc<dyn CredentialsProvider> {
        Arc::new(StaticCredentials::new(Credentials::anonymous("client-1")))
    }

    fn success_for(id: &str) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_string(format!(
            "<SendMessageBatchResponse><SendMessageBatchResult>\
             <SendMessageBatchResultEntry><Id>{}</Id></SendMessageBatchResultEntry>\
             </SendMessageBatchResult></SendMessageBatchResponse>",
            id
        ))
    }

    fn queued_id(outcome: DispatchOutcome) -> String {
        match outcome {
            DispatchOutcome::Queued(id) => id,
            other => panic!("expected a queued event, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let config = PipelineConfig {
            app_id: String::new(),
            ..PipelineConfig::default()
        };
        let result = TelemetryClient::initialize(config, Arc::new(MemoryStore::new())).await;
        assert!(matches!(result, Err(PipelineError::Config(_))));
    }

    #[tokio::test]
    async fn test_initialize_falls_back_to_local_clock() {
        let server = MockServer::start().await;
        let config = PipelineConfig {
            time_authority_url: Some("http://127.0.0.1:1/time".to_string()),
            http_timeout: Duration::from_millis(200),
            ..config_for(&server)
        };

        let client = TelemetryClient::initialize(config, Arc::new(MemoryStore::new()))
            .await
            .unwrap();
        let outcome = client
            .send(IncomingEvent::new("boot", ConsentCategory::Necessary, json!({})))
            .await
            .unwrap();
        assert!(matches!(outcome, DispatchOutcome::Queued(_)));
    }

    #[tokio::test]
    async fn test_send_then_flush_delivers() {
        let server = MockServer::start().await;
        let client = start(config_for(&server), Arc::new(MemoryStore::new())).await;
        client.set_credentials_provider(provider()).await;

        let id = queued_id(
            client
                .send(IncomingEvent::new("level_up", ConsentCategory::Performance, json!({"level": 2})))
                .await
                .unwrap(),
        );
        assert_eq!(client.queued_events().await, 1);

        Mock::given(method("POST"))
            .and(path("/public"))
            .and(body_string_contains("level_up"))
            .respond_with(success_for(&id))
            .expect(1)
            .mount(&server)
            .await;

        let report = client.flush().await.unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(client.queued_events().await, 0);
        assert!(!client.is_outage());
    }

    #[tokio::test]
    async fn test_batch_timer_delivers_without_flush() {
        let server = MockServer::start().await;
        let config = PipelineConfig {
            batch_interval: Duration::from_millis(50),
            ..config_for(&server)
        };
        let client = start(config, Arc::new(MemoryStore::new())).await;
        client.set_credentials_provider(provider()).await;

        let id = queued_id(
            client
                .send(IncomingEvent::new("tap", ConsentCategory::Necessary, json!({})))
                .await
                .unwrap(),
        );
        Mock::given(method("POST"))
            .respond_with(success_for(&id))
            .mount(&server)
            .await;

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(client.queued_events().await, 0);
        client.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_consent_toggle_applies_immediately() {
        let server = MockServer::start().await;
        let client = start(config_for(&server), Arc::new(MemoryStore::new())).await;
        let ad = || IncomingEvent::new("ad_click", ConsentCategory::Targeting, json!({}));

        client.set_consent_blocked(ConsentCategory::Targeting, true).await;
        assert_eq!(client.send(ad()).await.unwrap(), DispatchOutcome::ConsentFiltered);
        assert_eq!(
            client.dropped_events().await.count("ad_click", DropReason::ConsentFiltered),
            1
        );
        assert_eq!(client.queued_events().await, 0);

        client.set_consent_blocked(ConsentCategory::Targeting, false).await;
        assert!(matches!(client.send(ad()).await.unwrap(), DispatchOutcome::Queued(_)));
        assert!(!client.config().await.blocked_consent_categories.targeting);
    }

    #[tokio::test]
    async fn test_flush_without_provider_is_a_config_error() {
        let server = MockServer::start().await;
        let client = start(config_for(&server), Arc::new(MemoryStore::new())).await;
        client
            .send(IncomingEvent::new("tap", ConsentCategory::Necessary, json!({})))
            .await
            .unwrap();

        let result = client.flush().await;
        assert!(matches!(result, Err(PipelineError::MissingCredentialsProvider)));
        assert_eq!(client.queued_events().await, 1);
    }

    #[tokio::test]
    async fn test_credentials_change_is_broadcast() {
        let server = MockServer::start().await;
        let client = start(config_for(&server), Arc::new(MemoryStore::new())).await;
        let mut rx = client.subscribe();

        client.set_credentials_provider(provider()).await;
        assert_eq!(rx.recv().await.unwrap(), BusMessage::CredentialsChanged);
    }

    #[tokio::test]
    async fn test_outage_is_announced_to_subscribers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = start(config_for(&server), Arc::new(MemoryStore::new())).await;
        client.set_credentials_provider(provider()).await;
        let mut rx = client.subscribe();

        client
            .send(IncomingEvent::new("tap", ConsentCategory::Necessary, json!({})))
            .await
            .unwrap();
        assert_ok!(client.flush().await);

        assert!(client.is_outage());
        assert_eq!(rx.recv().await.unwrap().name(), "outageStarted");
        assert_eq!(client.queued_events().await, 1);
    }

    #[tokio::test]
    async fn test_events_survive_restart() {
        let server = MockServer::start().await;
        let dir = TempDir::new().unwrap();

        {
            let client = start(config_for(&server), Arc::new(FileStore::new(dir.path()))).await;
            for name in ["a", "b"] {
                client
                    .send(IncomingEvent::new(name, ConsentCategory::Necessary, json!({})))
                    .await
                    .unwrap();
            }
            client.shutdown().await.unwrap();
        }

        let client = start(config_for(&server), Arc::new(FileStore::new(dir.path()))).await;
        assert_eq!(client.queued_events().await, 2);
    }

    #[tokio::test]
    async fn test_set_intervals_updates_live_config() {
        let server = MockServer::start().await;
        let client = start(config_for(&server), Arc::new(MemoryStore::new())).await;

        client
            .set_intervals(Duration::from_secs(5), Duration::from_secs(7))
            .await
            .unwrap();

        let config = client.config().await;
        assert_eq!(config.batch_interval, Duration::from_secs(5));
        assert_eq!(config.monitoring_interval, Duration::from_secs(7));

        assert!(client.set_intervals(Duration::ZERO, Duration::from_secs(1)).await.is_err());
        assert_eq!(client.config().await.batch_interval, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_unreadable_store_does_not_block_startup() {
        let server = MockServer::start().await;
        let store = Arc::new(MemoryStore::new());
        store
            .set(STORE_KEY, r#"[{"id":"a","name":"tap""#)
            .await
            .unwrap();

        for _ in 0..2 {
            let client = assert_ok!(
                TelemetryClient::initialize_with_clock(
                    config_for(&server),
                    store.clone(),
                    Arc::new(FixedClock::new(1_700_000_000_000)),
                )
                .await
            );
            assert_eq!(client.queued_events().await, 0);
            client.shutdown().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_invalid_stored_events_are_counted_as_dropped() {
        let server = MockServer::start().await;
        let store = Arc::new(MemoryStore::new());
        let stored = vec![
            WireEvent::new(
                "good".to_string(),
                "tap".to_string(),
                HeaderMap::new(),
                "{}".to_string(),
            ),
            WireEvent::new(
                "bad".to_string(),
                "profile_update".to_string(),
                HeaderMap::new(),
                r#"{"nick":"\udead"}"#.to_string(),
            ),
        ];
        store
            .set(STORE_KEY, &serde_json::to_string(&stored).unwrap())
            .await
            .unwrap();

        let client = start(config_for(&server), store).await;

        assert_eq!(client.queued_events().await, 1);
        assert_eq!(
            client
                .dropped_events()
                .await
                .count("profile_update", DropReason::StoringFailed),
            1
        );
    }
}
