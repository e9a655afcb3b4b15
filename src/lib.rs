//! Consent-aware Telemetry Event Pipeline
//!
//! Accepts analytics events, filters them by user consent, keeps them in a
//! durable queue and delivers them in batches to a collector endpoint,
//! recovering from partial failures and collector outages.

pub mod bus;
pub mod client;
pub mod clock;
pub mod config;
pub mod consent;
pub mod credentials;
pub mod dispatch;
pub mod errors;
pub mod event;
pub mod headers;
pub mod ids;
pub mod monitor;
pub mod outage;
pub mod queue;
pub mod response;
pub mod scheduler;
pub mod store;
pub mod submit;
pub mod transport;
pub mod validator;

pub use bus::{BusMessage, NotificationBus};
pub use client::TelemetryClient;
pub use clock::{ClockSource, FixedClock, SyncedClock};
pub use config::PipelineConfig;
pub use consent::ConsentConfig;
pub use credentials::{Credentials, CredentialsProvider, StaticCredentials};
pub use dispatch::DispatchOutcome;
pub use errors::{PipelineError, Result};
pub use event::{ConsentCategory, HeaderValue, IncomingEvent, WireEvent};
pub use monitor::{DropCounters, DropReason};
pub use store::{FileStore, KeyValueStore, MemoryStore};
pub use submit::SubmitReport;
