//! Metadata envelope attached to every event

use crate::config::PipelineConfig;
use crate::credentials::Credentials;
use crate::event::{ConsentCategory, HeaderMap, HeaderValue, IncomingEvent};

pub const AUTHORIZATION_HEADER: &str = "authorization";

/// Device facts captured once at startup
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub os: String,
    pub arch: String,
}

impl Default for DeviceInfo {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct HeaderBuilder {
    device: DeviceInfo,
}

impl HeaderBuilder {
    pub fn new(device: DeviceInfo) -> Self {
        Self { device }
    }

    /// Assemble app, device, consent and auth headers for one event.
    ///
    /// Caller headers are merged last, except that a caller can never set
    /// `authorization` itself.
    pub fn build(
        &self,
        config: &PipelineConfig,
        credentials: Option<&Credentials>,
        event: &IncomingEvent,
    ) -> HeaderMap {
        let mut headers = self.base(config, credentials);

        if event.requires_auth {
            if let Some(token) = credentials.and_then(|c| c.token.as_deref()) {
                headers.insert(
                    AUTHORIZATION_HEADER.to_string(),
                    HeaderValue::Text(format!("Bearer {}", token)),
                );
            }
        }

        if let Some(extra) = &event.headers {
            for (key, value) in extra {
                if key.eq_ignore_ascii_case(AUTHORIZATION_HEADER) {
                    continue;
                }
                headers.insert(key.clone(), value.clone());
            }
        }

        headers
    }

    /// Headers without any per-event or auth information
    pub fn base(&self, config: &PipelineConfig, credentials: Option<&Credentials>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("app-id".to_string(), config.app_id.as_str().into());
        headers.insert("app-version".to_string(), config.app_version.as_str().into());
        headers.insert("environment".to_string(), config.environment.as_str().into());
        headers.insert("sdk-version".to_string(), env!("CARGO_PKG_VERSION").into());
        headers.insert("device-os".to_string(), self.device.os.as_str().into());
        headers.insert("device-arch".to_string(), self.device.arch.as_str().into());

        let consent = &config.blocked_consent_categories;
        headers.insert(
            "consent-performance".to_string(),
            allowed_flag(!consent.is_blocked(ConsentCategory::Performance)),
        );
        headers.insert(
            "consent-targeting".to_string(),
            allowed_flag(!consent.is_blocked(ConsentCategory::Targeting)),
        );

        if let Some(client_id) = credentials.and_then(|c| c.client_id.as_deref()) {
            headers.insert("client-id".to_string(), client_id.into());
        }

        headers
    }
}

fn allowed_flag(allowed: bool) -> HeaderValue {
    HeaderValue::from(if allowed { 1i64 } else { 0i64 })
}
