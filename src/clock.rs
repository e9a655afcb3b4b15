//! Clock sources used to timestamp events

use crate::errors::{PipelineError, Result};
use crate::event::current_timestamp_ms;
use async_trait::async_trait;
use chrono::DateTime;
use reqwest::Client;
use reqwest::header::DATE;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;
use tracing::{debug, info};

/// Source of event timestamps, in milliseconds since the Unix epoch
#[async_trait]
pub trait ClockSource: Send + Sync {
    /// Align this clock with its authority. Must run before `now`.
    async fn synchronize(&self) -> Result<()>;

    fn now(&self) -> Result<i64>;
}

/// Wall clock corrected by the offset reported by a remote time authority.
///
/// The authority is asked with a `HEAD` request; its `Date` header is compared
/// against the midpoint of the local request round trip.
#[derive(Debug)]
pub struct SyncedClock {
    client: Client,
    authority_url: Option<String>,
    offset_ms: AtomicI64,
    synchronized: AtomicBool,
}

impl SyncedClock {
    pub fn new(authority_url: Option<String>, http_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(http_timeout)
            .build()
            .map_err(PipelineError::Http)?;

        Ok(Self {
            client,
            authority_url,
            offset_ms: AtomicI64::new(0),
            synchronized: AtomicBool::new(false),
        })
    }

    pub fn offset_ms(&self) -> i64 {
        self.offset_ms.load(Ordering::Acquire)
    }

    /// Accept the local clock as-is. Used when synchronization is impossible.
    pub fn assume_local(&self) {
        self.offset_ms.store(0, Ordering::Release);
        self.synchronized.store(true, Ordering::Release);
    }

    async fn fetch_authority_time(&self, url: &str) -> Result<(i64, i64)> {
        let sent_at = current_timestamp_ms();
        let response = self.client.head(url).send().await?;
        let received_at = current_timestamp_ms();

        let date = response
            .headers()
            .get(DATE)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| PipelineError::Clock(format!("no Date header from {}", url)))?;

        let authority = DateTime::parse_from_rfc2822(date)
            .map_err(|e| PipelineError::Clock(format!("bad Date header {:?}: {}", date, e)))?;

        let midpoint = sent_at + (received_at - sent_at) / 2;
        Ok((authority.timestamp_millis(), midpoint))
    }
}

#[async_trait]
impl ClockSource for SyncedClock {
    async fn synchronize(&self) -> Result<()> {
        let Some(url) = self.authority_url.as_deref() else {
            debug!("No time authority configured, using local clock");
            self.assume_local();
            return Ok(());
        };

        let (authority_ms, local_ms) = self.fetch_authority_time(url).await?;
        let offset = authority_ms - local_ms;

        self.offset_ms.store(offset, Ordering::Release);
        self.synchronized.store(true, Ordering::Release);
        info!("Clock synchronized against {}, offset {}ms", url, offset);

        Ok(())
    }

    fn now(&self) -> Result<i64> {
        if !self.synchronized.load(Ordering::Acquire) {
            return Err(PipelineError::Clock("clock used before synchronize()".to_string()));
        }
        Ok(current_timestamp_ms() + self.offset_ms())
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct FixedClock {
    now_ms: AtomicI64,
}

impl FixedClock {
    pub fn new(now_ms: i64) -> Self {
        Self {
            now_ms: AtomicI64::new(now_ms),
        }
    }

    pub fn set(&self, now_ms: i64) {
        self.now_ms.store(now_ms, Ordering::Release);
    }

    pub fn advance(&self, by: Duration) {
        self.now_ms.fetch_add(by.as_millis() as i64, Ordering::AcqRel);
    }
}

#[async_trait]
impl ClockSource for FixedClock {
    async fn synchronize(&self) -> Result<()> {
        Ok(())
    }

    fn now(&self) -> Result<i64> {
        Ok(self.now_ms.load(Ordering::Acquire))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_now_requires_synchronize() {
        let clock = SyncedClock::new(None, Duration::from_secs(1)).unwrap();
        assert_err!(clock.now());

        assert_ok!(clock.synchronize().await);
        let now = clock.now().unwrap();
        assert!((now - current_timestamp_ms()).abs() < 1_000);
    }

    #[tokio::test]
    async fn test_synchronize_applies_authority_offset() {
        let server = MockServer::start().await;
        let ahead = chrono::Utc::now() + chrono::Duration::hours(1);

        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(200).insert_header("Date", ahead.to_rfc2822().as_str()))
            .mount(&server)
            .await;

        let clock = SyncedClock::new(Some(server.uri()), Duration::from_secs(5)).unwrap();
        clock.synchronize().await.unwrap();

        let offset = clock.offset_ms();
        assert!((offset - 3_600_000).abs() < 5_000, "offset was {}", offset);
    }

    #[tokio::test]
    async fn test_synchronize_fails_when_authority_unreachable() {
        let clock = SyncedClock::new(Some("http://127.0.0.1:1".to_string()), Duration::from_millis(200)).unwrap();
        assert_err!(clock.synchronize().await);
        assert_err!(clock.now());
    }

    #[tokio::test]
    async fn test_fixed_clock() {
        let clock = FixedClock::new(1_000);
        clock.advance(Duration::from_secs(2));
        assert_eq!(clock.now().unwrap(), 3_000);

        clock.set(42);
        assert_eq!(clock.now().unwrap(), 42);
    }
}
