//! Credentials supplied by the host application's auth layer

use crate::errors::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Credentials {
    /// Bearer token; absent for anonymous players
    pub token: Option<String>,
    pub client_id: Option<String>,
    pub extra: BTreeMap<String, String>,
}

impl Credentials {
    pub fn anonymous(client_id: impl Into<String>) -> Self {
        Self {
            token: None,
            client_id: Some(client_id.into()),
            extra: BTreeMap::new(),
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
}

/// Supplies the credentials used to authenticate submissions.
///
/// Token acquisition is the implementor's business; the pipeline only asks.
#[async_trait]
pub trait CredentialsProvider: Send + Sync {
    async fn get_credentials(&self) -> Result<Credentials>;
}

/// Provider holding a replaceable set of credentials
#[derive(Debug, Default)]
pub struct StaticCredentials {
    credentials: RwLock<Credentials>,
}

impl StaticCredentials {
    pub fn new(credentials: Credentials) -> Self {
        Self {
            credentials: RwLock::new(credentials),
        }
    }

    pub async fn replace(&self, credentials: Credentials) {
        *self.credentials.write().await = credentials;
    }
}

#[async_trait]
impl CredentialsProvider for StaticCredentials {
    async fn get_credentials(&self) -> Result<Credentials> {
        Ok(self.credentials.read().await.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_credentials_replace() {
        let provider = StaticCredentials::new(Credentials::anonymous("client-1"));
        assert_eq!(provider.get_credentials().await.unwrap().token, None);

        provider
            .replace(Credentials::anonymous("client-1").with_token("tok"))
            .await;

        let creds = provider.get_credentials().await.unwrap();
        assert_eq!(creds.token.as_deref(), Some("tok"));
        assert_eq!(creds.client_id.as_deref(), Some("client-1"));
    }
}
