//! HTTP transport to the event collector
//!
//! Batches travel as a message-queue style `SendMessageBatch` form post: every
//! event occupies an indexed block of `Entry.<n>.*` fields.

use crate::errors::{PipelineError, Result};
use crate::event::WireEvent;
use reqwest::header::AUTHORIZATION;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::debug;

pub const ACTION_HEADER: &str = "Action";
pub const SEND_MESSAGE_BATCH: &str = "SendMessageBatch";

/// Raw collector reply; interpretation is up to the caller
#[derive(Debug, Clone)]
pub struct CollectorResponse {
    pub status: StatusCode,
    pub body: String,
}

impl CollectorResponse {
    pub fn ok(&self) -> bool {
        self.status.is_success()
    }
}

#[derive(Debug, Clone)]
pub struct CollectorClient {
    client: Client,
}

impl CollectorClient {
    pub fn new(http_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(http_timeout)
            .user_agent(format!("telemetry_pipeline/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(PipelineError::Http)?;

        Ok(Self { client })
    }

    /// Post one batch. Only failures to get any response at all are errors.
    pub async fn send_batch(
        &self,
        endpoint: &str,
        events: &[WireEvent],
        token: Option<&str>,
    ) -> Result<CollectorResponse> {
        let fields = encode_batch(events)?;

        debug!(
            "Sending {} events to {} ({})",
            events.len(),
            endpoint,
            if token.is_some() { "authenticated" } else { "public" }
        );

        let mut request = self
            .client
            .post(endpoint)
            .header(ACTION_HEADER, SEND_MESSAGE_BATCH)
            .form(&fields);

        if let Some(token) = token {
            request = request.header(AUTHORIZATION, format!("Bearer {}", token));
        }

        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        debug!("Collector answered {} ({} bytes)", status, body.len());
        Ok(CollectorResponse { status, body })
    }
}

/// Flatten a batch into ordered form fields, entries numbered from 1.
pub fn encode_batch(events: &[WireEvent]) -> Result<Vec<(String, String)>> {
    let mut fields = Vec::with_capacity(events.len() * 8);

    for (index, event) in events.iter().enumerate() {
        let prefix = format!("Entry.{}", index + 1);
        let headers = serde_json::to_string(&event.headers)?;

        fields.push((format!("{}.Id", prefix), event.id.clone()));
        fields.push((format!("{}.MessageBody", prefix), event.payload.clone()));
        push_string_attribute(&mut fields, &prefix, 1, "Name", event.name.clone());
        push_string_attribute(&mut fields, &prefix, 2, "Headers", headers);
    }

    Ok(fields)
}

fn push_string_attribute(
    fields: &mut Vec<(String, String)>,
    prefix: &str,
    position: usize,
    name: &str,
    value: String,
) {
    let attr = format!("{}.MessageAttribute.{}", prefix, position);
    fields.push((format!("{}.Name", attr), name.to_string()));
    fields.push((format!("{}.Value.StringValue", attr), value));
    fields.push((format!("{}.Value.DataType", attr), "String".to_string()));
}
